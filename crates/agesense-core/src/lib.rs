//! agesense-core — Age and gender prediction engine.
//!
//! Turns a camera frame into an ImageNet-normalized NCHW tensor, runs it
//! through an ONNX age/gender model via ONNX Runtime, and decodes the
//! outputs into an integer age and a gender label.

pub mod inference;
pub mod postprocess;
pub mod preprocess;
pub mod tensor;
pub mod types;

pub use inference::{
    infer, InferenceError, InferenceOutput, ModelSession, OrtSessionFactory, OutputTensors,
    SessionFactory,
};
pub use postprocess::{decode, PostprocessError};
pub use preprocess::{preprocess, PreprocessError, PreprocessOptions};
pub use tensor::{InputTensor, INPUT_SHAPE, INPUT_SIZE};
pub use types::{Gender, Prediction};
