//! Data-access layer for a curated calibration archive.
//!
//! Two cooperating subsystems live here: the curated calibration loader,
//! which walks a per-sensor directory tree and builds a validated
//! [`curated::CalibrationSet`], and the component-addressable FITS exposure
//! formatter, which reads whole exposures or single named components and
//! writes exposures with schema-validated compression recipes.

pub mod calibs;
pub mod camera;
pub mod curated;
pub mod ecsv;
pub mod fits;
pub mod formatter;
pub mod recipes;
pub mod registry;

pub use calibs::{CalibHeader, CalibrationCategory, CuratedCalibration};
pub use camera::{CameraDescription, SensorDescriptor};
pub use curated::{load_archive, load_sensor_files, ArchiveError, CalibrationSet};
pub use fits::{CardValue, FitsPlaneCodec, HeaderMetadata, PlaneStack};
pub use formatter::{Component, ExposureCodec, ExposureFormatter, FileDescriptor, FormatError};
pub use recipes::{resolve_recipe, validate_recipes, DatasetIdentity, Recipe, RecipeSet};
pub use registry::{add_unbounded_calibration_label, CalibrationLabel, CalibrationRegistry};
