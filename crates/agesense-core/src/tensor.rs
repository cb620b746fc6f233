//! Fixed-shape model input tensor.

use crate::inference::InferenceError;
use ndarray::{Array4, ArrayView4, ArrayViewMut4};

/// Side length of the square model input.
pub const INPUT_SIZE: usize = 224;

/// NCHW shape the age/gender model expects: batch 1, RGB planes, 224×224.
pub const INPUT_SHAPE: [usize; 4] = [1, 3, INPUT_SIZE, INPUT_SIZE];

/// A `[1, 3, 224, 224]` float tensor in channel-planar order.
///
/// The shape is checked once at construction, so anything holding an
/// `InputTensor` can hand it to the engine without re-validating.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor {
    data: Array4<f32>,
}

impl InputTensor {
    /// Wrap an existing array, rejecting any shape other than [`INPUT_SHAPE`].
    pub fn new(data: Array4<f32>) -> Result<Self, InferenceError> {
        if data.shape() != INPUT_SHAPE {
            return Err(InferenceError::InvalidInputShape {
                expected: INPUT_SHAPE.to_vec(),
                actual: data.shape().to_vec(),
            });
        }
        Ok(Self {
            data: data.as_standard_layout().into_owned(),
        })
    }

    /// Build from a flat channel-planar buffer of exactly 3×224×224 values.
    pub fn from_vec(values: Vec<f32>) -> Result<Self, InferenceError> {
        let len = values.len();
        let data = Array4::from_shape_vec(INPUT_SHAPE, values).map_err(|_| {
            InferenceError::InvalidInputShape {
                expected: INPUT_SHAPE.to_vec(),
                actual: vec![len],
            }
        })?;
        Ok(Self { data })
    }

    /// All-zero tensor of the model shape.
    pub(crate) fn zeros() -> Self {
        Self {
            data: Array4::zeros(INPUT_SHAPE),
        }
    }

    pub(crate) fn view_mut(&mut self) -> ArrayViewMut4<'_, f32> {
        self.data.view_mut()
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.data.view()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Flat values in channel-planar, row-major order.
    pub fn as_slice(&self) -> &[f32] {
        // Always stored in standard layout.
        self.data.as_slice().unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_accepts_model_shape() {
        let t = InputTensor::new(Array4::zeros((1, 3, INPUT_SIZE, INPUT_SIZE))).unwrap();
        assert_eq!(t.shape(), &INPUT_SHAPE);
        assert_eq!(t.len(), 150_528);
    }

    #[test]
    fn test_new_rejects_wrong_shape() {
        let err = InputTensor::new(Array4::zeros((1, 3, 112, 112))).unwrap_err();
        match err {
            InferenceError::InvalidInputShape { expected, actual } => {
                assert_eq!(expected, INPUT_SHAPE.to_vec());
                assert_eq!(actual, vec![1, 3, 112, 112]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_from_vec_length_checked() {
        assert!(InputTensor::from_vec(vec![0.0; 150_528]).is_ok());
        assert!(matches!(
            InputTensor::from_vec(vec![0.0; 10]),
            Err(InferenceError::InvalidInputShape { .. })
        ));
    }

    #[test]
    fn test_as_slice_is_planar() {
        let mut values = vec![0.0f32; 150_528];
        values[INPUT_SIZE * INPUT_SIZE] = 1.0; // first green sample
        let t = InputTensor::from_vec(values).unwrap();
        assert_eq!(t.view()[[0, 1, 0, 0]], 1.0);
        assert_eq!(t.as_slice()[INPUT_SIZE * INPUT_SIZE], 1.0);
    }
}
