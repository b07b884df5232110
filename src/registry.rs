//! Calibration label bookkeeping.
//!
//! Curated calibrations are certified against labeled validity ranges kept
//! in an external registry. The registry itself is a collaborator behind the
//! [`CalibrationRegistry`] trait; this module only defines the label record
//! and the conventional "unbounded" label covering all time.

use chrono::NaiveDateTime;
use thiserror::Error;
use tracing::info;

/// Label naming the validity range that spans all time.
pub const UNBOUNDED_LABEL: &str = "unbounded";

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("registry backend error: {0}")]
    Backend(String),
    #[error(
        "calibration label {label} already exists for {instrument} with a different range"
    )]
    Conflict { instrument: String, label: String },
}

/// One labeled validity range for an instrument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationLabel {
    pub instrument: String,
    pub label: String,
    pub begin: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl CalibrationLabel {
    /// The label spanning all representable time.
    pub fn unbounded(instrument: impl Into<String>) -> Self {
        Self {
            instrument: instrument.into(),
            label: UNBOUNDED_LABEL.to_string(),
            begin: NaiveDateTime::MIN,
            end: NaiveDateTime::MAX,
        }
    }
}

/// Seam to whatever stores calibration labels.
pub trait CalibrationRegistry {
    fn find(&self, instrument: &str, label: &str)
        -> Result<Option<CalibrationLabel>, RegistryError>;

    fn insert(&mut self, label: CalibrationLabel) -> Result<(), RegistryError>;
}

/// Ensure the unbounded calibration label exists for an instrument.
///
/// Idempotent: an existing entry is returned untouched as long as it has the
/// expected all-time range; a mismatched existing entry is a conflict.
pub fn add_unbounded_calibration_label<R: CalibrationRegistry>(
    registry: &mut R,
    instrument: &str,
) -> Result<CalibrationLabel, RegistryError> {
    let expected = CalibrationLabel::unbounded(instrument);
    if let Some(existing) = registry.find(instrument, UNBOUNDED_LABEL)? {
        if existing != expected {
            return Err(RegistryError::Conflict {
                instrument: instrument.to_string(),
                label: UNBOUNDED_LABEL.to_string(),
            });
        }
        return Ok(existing);
    }
    registry.insert(expected.clone())?;
    info!("registered unbounded calibration label for {instrument}");
    Ok(expected)
}
