//! User-visible application status.

use agesense_core::Prediction;
use serde::Serialize;
use std::fmt;
use std::time::Duration;

/// Status category, drives how the message is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Idle,
    Loading,
    Processing,
    Active,
    Success,
    Error,
}

/// A load-time or latency readout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timing {
    Unset,
    /// In progress, with a placeholder label.
    Pending(&'static str),
    Measured(Duration),
    Error,
    NotAvailable,
}

impl fmt::Display for Timing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timing::Unset => f.write_str("-"),
            Timing::Pending(label) => f.write_str(label),
            Timing::Measured(d) => f.write_str(&format_duration(*d)),
            Timing::Error => f.write_str("Error"),
            Timing::NotAvailable => f.write_str("N/A"),
        }
    }
}

impl Serialize for Timing {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppStatus {
    pub kind: StatusKind,
    pub message: String,
    pub load_time: Timing,
    pub latency: Timing,
    /// Last displayed prediction; cleared at the start of every cycle.
    pub prediction: Option<Prediction>,
}

impl Default for AppStatus {
    fn default() -> Self {
        Self {
            kind: StatusKind::Idle,
            message: "Initializing...".to_string(),
            load_time: Timing::Unset,
            latency: Timing::Unset,
            prediction: None,
        }
    }
}

/// `< 1 s` as whole milliseconds, otherwise seconds with two decimals.
///
/// Rounds half-up on integer microseconds so ties never go to even.
pub fn format_duration(d: Duration) -> String {
    let micros = d.as_micros();
    if micros < 1_000_000 {
        format!("{} ms", (micros + 500) / 1_000)
    } else {
        let hundredths = (micros + 5_000) / 10_000;
        format!("{}.{:02} s", hundredths / 100, hundredths % 100)
    }
}
