//! Decoding of raw age/gender model outputs.

use crate::inference::InferenceOutput;
use crate::types::{Gender, Prediction};
use thiserror::Error;

/// Gender probabilities strictly above this decode as [`Gender::Female`].
const FEMALE_THRESHOLD: f32 = 0.5;

#[derive(Error, Debug)]
pub enum PostprocessError {
    #[error("{0} tensor is empty")]
    EmptyTensor(&'static str),
}

/// Decode the first scalar of each output into a [`Prediction`].
pub fn decode(output: &InferenceOutput) -> Result<Prediction, PostprocessError> {
    let raw_age = *output.age.first().ok_or(PostprocessError::EmptyTensor("age"))?;
    let gender_prob = *output
        .gender
        .first()
        .ok_or(PostprocessError::EmptyTensor("gender"))?;

    Ok(Prediction {
        age: decode_age(raw_age),
        gender: decode_gender(gender_prob),
    })
}

/// Round to the nearest whole year; negative estimates clamp to zero.
pub fn decode_age(raw: f32) -> u32 {
    if raw.is_nan() || raw <= 0.0 {
        return 0;
    }
    // Positive here, so round-half-away equals half-up; `as` saturates.
    raw.round() as u32
}

/// Probability above 0.5 is female; 0.5 itself is male.
pub fn decode_gender(prob: f32) -> Gender {
    if prob > FEMALE_THRESHOLD {
        Gender::Female
    } else {
        Gender::Male
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn output(age: Vec<f32>, gender: Vec<f32>) -> InferenceOutput {
        InferenceOutput {
            age,
            gender,
            latency: Duration::ZERO,
        }
    }

    #[test]
    fn test_gender_tie_breaks_male() {
        assert_eq!(decode_gender(0.5), Gender::Male);
        assert_eq!(decode_gender(0.50001), Gender::Female);
        assert_eq!(decode_gender(0.0), Gender::Male);
        assert_eq!(decode_gender(1.0), Gender::Female);
    }

    #[test]
    fn test_age_rounding_and_clamp() {
        assert_eq!(decode_age(-3.2), 0);
        assert_eq!(decode_age(41.6), 42);
        assert_eq!(decode_age(41.4), 41);
        assert_eq!(decode_age(0.5), 1);
        assert_eq!(decode_age(f32::NAN), 0);
        // Largest f32 below 0.5; adding 0.5 first would round it up.
        assert_eq!(decode_age(0.499_999_97), 0);
        assert_eq!(decode_age(2.5), 3);
    }

    #[test]
    fn test_age_has_no_upper_bound() {
        assert_eq!(decode_age(150.2), 150);
    }

    #[test]
    fn test_decode_uses_first_scalar() {
        let p = decode(&output(vec![29.7, 99.0], vec![0.8, 0.1])).unwrap();
        assert_eq!(p, Prediction { age: 30, gender: Gender::Female });
    }

    #[test]
    fn test_decode_empty_tensor() {
        assert!(matches!(
            decode(&output(vec![], vec![0.3])),
            Err(PostprocessError::EmptyTensor("age"))
        ));
        assert!(matches!(
            decode(&output(vec![10.0], vec![])),
            Err(PostprocessError::EmptyTensor("gender"))
        ));
    }
}
