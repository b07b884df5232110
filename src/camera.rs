//! Camera description consumed by the curated calibration loader.
//!
//! A camera description is a flat list of sensor descriptors (name plus
//! numeric identifier). The loader matches archive subdirectories against
//! the lower-cased sensor names, so the lookup table built here is keyed by
//! lower case regardless of how the descriptors were spelled.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// A single sensor in the focal plane.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    /// Canonical sensor name (e.g. "CCD01"). Archive directories use the
    /// lower-cased form.
    pub name: String,

    /// Numeric detector identifier.
    pub id: u32,
}

/// Description of a camera: a human-readable name and its sensors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CameraDescription {
    pub name: String,
    pub sensors: Vec<SensorDescriptor>,
}

impl CameraDescription {
    pub fn new(name: impl Into<String>, sensors: Vec<SensorDescriptor>) -> Self {
        Self {
            name: name.into(),
            sensors,
        }
    }

    /// Build the lower-cased-name to descriptor lookup table.
    pub fn name_map(&self) -> BTreeMap<String, &SensorDescriptor> {
        self.sensors
            .iter()
            .map(|s| (s.name.to_lowercase(), s))
            .collect()
    }

    /// Iterate over canonical sensor names, used for diagnostics.
    pub fn sensor_names(&self) -> impl Iterator<Item = &str> {
        self.sensors.iter().map(|s| s.name.as_str())
    }

    /// Load a camera description from a JSON file.
    pub fn load_from_file(path: &Path) -> Result<Self, std::io::Error> {
        let json = std::fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Save the camera description to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), std::io::Error> {
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(path, json)
    }
}
