//! Age/gender model invocation via ONNX Runtime.
//!
//! The engine itself is opaque: [`ModelSession`] is the seam between the
//! pipeline and whatever executes the graph. [`OrtSessionFactory`] builds
//! sessions backed by `ort`; tests substitute in-memory fakes.

use crate::tensor::InputTensor;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::TensorRef;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Position of the age output when no output name mentions "age".
const AGE_FALLBACK_INDEX: usize = 0;
/// Position of the gender output when no output name mentions "gender".
const GENDER_FALLBACK_INDEX: usize = 1;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("failed to create inference session: {0}")]
    SessionCreation(String),
    #[error("inference session is not loaded")]
    NoSession,
    #[error("model declares no inputs")]
    NoInputs,
    #[error("output tensor '{0}' not found in results")]
    MissingOutputTensor(String),
    #[error("invalid input shape: expected {expected:?}, got {actual:?}")]
    InvalidInputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Named float outputs of one inference run.
pub type OutputTensors = HashMap<String, Vec<f32>>;

/// A prepared model ready to run.
pub trait ModelSession: Send {
    /// Declared input names, in model order.
    fn input_names(&self) -> &[String];

    /// Declared output names, in model order.
    fn output_names(&self) -> &[String];

    /// Run the model with `input` bound to `input_name`.
    fn run(&mut self, input_name: &str, input: &InputTensor) -> Result<OutputTensors, InferenceError>;
}

/// Builds a [`ModelSession`] from serialized model bytes.
pub trait SessionFactory: Send + Sync {
    fn create(&self, model: &[u8]) -> Result<Box<dyn ModelSession>, InferenceError>;
}

/// Raw age/gender outputs plus the measured run latency.
#[derive(Debug, Clone)]
pub struct InferenceOutput {
    pub age: Vec<f32>,
    pub gender: Vec<f32>,
    /// Wall-clock time spent inside the engine's run call only.
    pub latency: Duration,
}

/// Creates CPU sessions with full graph optimization.
#[derive(Debug, Clone)]
pub struct OrtSessionFactory {
    pub intra_threads: usize,
}

impl Default for OrtSessionFactory {
    fn default() -> Self {
        Self { intra_threads: 2 }
    }
}

impl SessionFactory for OrtSessionFactory {
    fn create(&self, model: &[u8]) -> Result<Box<dyn ModelSession>, InferenceError> {
        let session = OrtSession::from_memory(model, self.intra_threads)?;
        Ok(Box::new(session))
    }
}

/// `ort`-backed model session.
pub struct OrtSession {
    session: Session,
    inputs: Vec<String>,
    outputs: Vec<String>,
}

impl OrtSession {
    /// Build a session from an in-memory ONNX model.
    pub fn from_memory(model: &[u8], intra_threads: usize) -> Result<Self, InferenceError> {
        if model.is_empty() {
            return Err(InferenceError::SessionCreation("model buffer is empty".into()));
        }

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(intra_threads)?
            .commit_from_memory(model)
            .map_err(|e| InferenceError::SessionCreation(e.to_string()))?;

        let inputs: Vec<String> = session.inputs().iter().map(|i| i.name().to_string()).collect();
        let outputs: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            bytes = model.len(),
            inputs = ?inputs,
            outputs = ?outputs,
            "created age/gender session"
        );

        Ok(Self {
            session,
            inputs,
            outputs,
        })
    }
}

impl ModelSession for OrtSession {
    fn input_names(&self) -> &[String] {
        &self.inputs
    }

    fn output_names(&self) -> &[String] {
        &self.outputs
    }

    fn run(&mut self, input_name: &str, input: &InputTensor) -> Result<OutputTensors, InferenceError> {
        let outputs = self
            .session
            .run(ort::inputs![input_name => TensorRef::from_array_view(input.view())?])?;

        let mut tensors = OutputTensors::new();
        for name in &self.outputs {
            let Some(value) = outputs.get(name.as_str()) else {
                continue;
            };
            match value.try_extract_tensor::<f32>() {
                Ok((_, data)) => {
                    tensors.insert(name.clone(), data.to_vec());
                }
                Err(e) => {
                    tracing::debug!(output = %name, error = %e, "skipping non-f32 output");
                }
            }
        }

        Ok(tensors)
    }
}

/// Pick the age and gender output names.
///
/// Prefers the first output whose name contains "age" / "gender"
/// (case-insensitive) and otherwise falls back to outputs #0 / #1.
/// A role with neither a matching name nor a fallback position resolves
/// to `None`.
pub fn resolve_output_names(names: &[String]) -> (Option<&str>, Option<&str>) {
    (
        find_output(names, "age", AGE_FALLBACK_INDEX),
        find_output(names, "gender", GENDER_FALLBACK_INDEX),
    )
}

fn find_output<'a>(names: &'a [String], needle: &str, fallback: usize) -> Option<&'a str> {
    names
        .iter()
        .find(|n| n.to_lowercase().contains(needle))
        .or_else(|| names.get(fallback))
        .map(String::as_str)
}

/// Run one inference and extract the age and gender tensors.
///
/// Binds `input` to the session's first declared input and times exactly
/// the engine run call.
pub fn infer<S: ModelSession + ?Sized>(
    session: Option<&mut S>,
    input: &InputTensor,
) -> Result<InferenceOutput, InferenceError> {
    let session = session.ok_or(InferenceError::NoSession)?;

    let input_name = session
        .input_names()
        .first()
        .cloned()
        .ok_or(InferenceError::NoInputs)?;

    let start = Instant::now();
    let mut results = session.run(&input_name, input)?;
    let latency = start.elapsed();

    let (age_name, gender_name) = resolve_output_names(session.output_names());
    let age_name = age_name.unwrap_or("age").to_string();
    let gender_name = gender_name.unwrap_or("gender").to_string();

    tracing::debug!(
        input = %input_name,
        age_output = %age_name,
        gender_output = %gender_name,
        latency_ms = latency.as_millis() as u64,
        "inference complete"
    );

    let age = results
        .remove(&age_name)
        .ok_or_else(|| InferenceError::MissingOutputTensor(age_name.clone()))?;
    // Both roles may resolve to one output name.
    let gender = match results.remove(&gender_name) {
        Some(g) => g,
        None if gender_name == age_name => age.clone(),
        None => return Err(InferenceError::MissingOutputTensor(gender_name)),
    };

    Ok(InferenceOutput {
        age,
        gender,
        latency,
    })
}
