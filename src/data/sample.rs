//! Sample data structures.
//!
//! A sample is one value parsed from one notification payload; a report pairs
//! it with the extrema as they stood right after it was recorded.

use chrono::{DateTime, Utc};
use std::fmt;

use super::extrema::Extrema;
use crate::error::ParseError;

/// A single parsed measurement.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Sample {
    /// The decoded payload text.
    pub raw: String,

    /// The parsed value (`0.0` when the payload was malformed).
    pub value: f64,

    /// Time the payload was processed.
    pub received_at: DateTime<Utc>,

    /// Set when the value was substituted because the payload was malformed.
    pub fault: Option<ParseError>,
}

impl Sample {
    /// Create a sample from a successfully parsed value.
    pub fn new(raw: impl Into<String>, value: f64) -> Self {
        Self {
            raw: raw.into(),
            value,
            received_at: Utc::now(),
            fault: None,
        }
    }

    /// Create a zero-valued sample standing in for a malformed payload.
    pub fn zeroed(raw: impl Into<String>, fault: ParseError) -> Self {
        Self {
            raw: raw.into(),
            value: 0.0,
            received_at: Utc::now(),
            fault: Some(fault),
        }
    }

    /// Check if the value was parsed rather than substituted.
    pub fn is_valid(&self) -> bool {
        self.fault.is_none()
    }
}

/// Report emitted for every recorded sample.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SampleReport {
    /// The sample that was just recorded.
    pub sample: Sample,

    /// Extrema including this sample.
    pub extrema: Extrema,
}

impl fmt::Display for SampleReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Received Data String: {}", self.sample.raw)?;
        match self.sample.fault {
            Some(fault) => writeln!(f, "Converted Float Value: {:.2} ({})", self.sample.value, fault)?,
            None => writeln!(f, "Converted Float Value: {:.2}", self.sample.value)?,
        }
        write!(
            f,
            "Current Value: {:.2} | Max Value: {:.2} | Min Value: {:.2}",
            self.sample.value, self.extrema.maximum, self.extrema.minimum
        )
    }
}
