//! Curated calibration categories and their decoders.
//!
//! The archive recognizes a fixed, closed set of six calibration categories.
//! Each category pairs a directory name with one decode function, so the
//! category-to-decoder association is a plain `match` instead of an
//! open-ended lookup. Artifacts are serialized as YAML documents or as ECSV
//! tables; every decoded object carries the identity header
//! (`INSTRUME`/`DETECTOR`/`OBSTYPE`) that the loader cross-checks against
//! the file's location.

use crate::ecsv::{EcsvError, EcsvTable};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// File extensions the archive recognizes for calibration artifacts.
pub const RECOGNIZED_EXTENSIONS: [&str; 2] = ["ecsv", "yaml"];

/// Errors raised while resolving a category or decoding an artifact.
#[derive(Error, Debug)]
pub enum CalibError {
    #[error("unknown calibration data type '{found}'; only understand {recognized}")]
    UnknownCategory { found: String, recognized: String },
    #[error("{category} calibrations cannot be read from {path}: unsupported extension")]
    UnsupportedExtension {
        category: &'static str,
        path: PathBuf,
    },
    #[error("calibration header in {path} is missing or malformed: {source}")]
    BadHeader {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("calibration I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("calibration YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("calibration table error: {0}")]
    Ecsv(#[from] EcsvError),
}

/// The six recognized curated calibration categories.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum CalibrationCategory {
    /// Quantum-efficiency curve.
    QeCurve,
    /// Defect (bad region) map.
    Defects,
    /// Linearity correction.
    Linearizer,
    /// Inter-amplifier crosstalk calibration.
    Crosstalk,
    /// Brighter-fatter kernel.
    BrighterFatter,
    /// Photodiode ramp calibration.
    Photodiode,
}

impl CalibrationCategory {
    pub const ALL: [CalibrationCategory; 6] = [
        CalibrationCategory::QeCurve,
        CalibrationCategory::Defects,
        CalibrationCategory::Linearizer,
        CalibrationCategory::Crosstalk,
        CalibrationCategory::BrighterFatter,
        CalibrationCategory::Photodiode,
    ];

    /// Directory name under the archive root, also the expected `OBSTYPE`.
    pub fn dir_name(&self) -> &'static str {
        match self {
            CalibrationCategory::QeCurve => "qe_curve",
            CalibrationCategory::Defects => "defects",
            CalibrationCategory::Linearizer => "linearizer",
            CalibrationCategory::Crosstalk => "crosstalk",
            CalibrationCategory::BrighterFatter => "bfk",
            CalibrationCategory::Photodiode => "photodiode",
        }
    }

    /// Resolve a directory name to a category.
    pub fn from_dir_name(name: &str) -> Result<Self, CalibError> {
        Self::ALL
            .iter()
            .copied()
            .find(|c| c.dir_name() == name)
            .ok_or_else(|| CalibError::UnknownCategory {
                found: name.to_string(),
                recognized: Self::ALL
                    .iter()
                    .map(|c| c.dir_name())
                    .collect::<Vec<_>>()
                    .join(","),
            })
    }

    /// Decode an artifact of this category from disk.
    ///
    /// One decode function per variant; the set is closed on purpose.
    pub fn decode(&self, path: &Path) -> Result<CuratedCalibration, CalibError> {
        match self {
            CalibrationCategory::QeCurve => decode_qe_curve(path),
            CalibrationCategory::Defects => decode_defects(path),
            CalibrationCategory::Linearizer => decode_linearizer(path),
            CalibrationCategory::Crosstalk => decode_crosstalk(path),
            CalibrationCategory::BrighterFatter => decode_brighter_fatter(path),
            CalibrationCategory::Photodiode => decode_photodiode(path),
        }
    }
}

impl std::fmt::Display for CalibrationCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Identity header embedded in every calibration artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibHeader {
    #[serde(rename = "INSTRUME")]
    pub instrument: String,
    #[serde(rename = "DETECTOR")]
    pub detector: i64,
    #[serde(rename = "OBSTYPE")]
    pub obstype: String,
}

/// A rectangular bad region on the sensor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DefectRegion {
    pub x0: i64,
    pub y0: i64,
    pub width: i64,
    pub height: i64,
}

/// Defect map: a list of bad regions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefectList {
    pub metadata: CalibHeader,
    pub defects: Vec<DefectRegion>,
}

/// Quantum-efficiency curve sampled over wavelength.
#[derive(Debug, Clone, PartialEq)]
pub struct QeCurve {
    pub metadata: CalibHeader,
    pub wavelength: Vec<f64>,
    pub efficiency: Vec<f64>,
}

/// Linearity correction coefficients, per amplifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Linearizer {
    pub metadata: CalibHeader,
    pub linearity_type: String,
    pub coefficients: BTreeMap<String, Vec<f64>>,
}

/// Crosstalk coefficient matrix between amplifiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrosstalkCalib {
    pub metadata: CalibHeader,
    pub coefficients: Vec<Vec<f64>>,
}

/// Brighter-fatter correction kernel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrighterFatterKernel {
    pub metadata: CalibHeader,
    pub kernel: Vec<Vec<f64>>,
}

/// Photodiode current ramp.
#[derive(Debug, Clone, PartialEq)]
pub struct PhotodiodeCalib {
    pub metadata: CalibHeader,
    pub time: Vec<f64>,
    pub current: Vec<f64>,
}

/// A decoded calibration artifact, tagged by category.
#[derive(Debug, Clone, PartialEq)]
pub enum CuratedCalibration {
    QeCurve(QeCurve),
    Defects(DefectList),
    Linearizer(Linearizer),
    Crosstalk(CrosstalkCalib),
    BrighterFatter(BrighterFatterKernel),
    Photodiode(PhotodiodeCalib),
}

impl CuratedCalibration {
    /// The identity header embedded in the artifact.
    pub fn header(&self) -> &CalibHeader {
        match self {
            CuratedCalibration::QeCurve(c) => &c.metadata,
            CuratedCalibration::Defects(c) => &c.metadata,
            CuratedCalibration::Linearizer(c) => &c.metadata,
            CuratedCalibration::Crosstalk(c) => &c.metadata,
            CuratedCalibration::BrighterFatter(c) => &c.metadata,
            CuratedCalibration::Photodiode(c) => &c.metadata,
        }
    }
}

fn extension_of(path: &Path) -> &str {
    path.extension().and_then(|e| e.to_str()).unwrap_or("")
}

fn from_yaml_file<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, CalibError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

fn header_from_ecsv_meta(table: &EcsvTable, path: &Path) -> Result<CalibHeader, CalibError> {
    serde_yaml::from_value(table.meta.clone()).map_err(|source| CalibError::BadHeader {
        path: path.to_path_buf(),
        source,
    })
}

fn decode_qe_curve(path: &Path) -> Result<CuratedCalibration, CalibError> {
    if extension_of(path) != "ecsv" {
        return Err(CalibError::UnsupportedExtension {
            category: "qe_curve",
            path: path.to_path_buf(),
        });
    }
    let table = EcsvTable::read_from_path(path)?;
    Ok(CuratedCalibration::QeCurve(QeCurve {
        metadata: header_from_ecsv_meta(&table, path)?,
        wavelength: table.column_f64("wavelength")?,
        efficiency: table.column_f64("efficiency")?,
    }))
}

fn decode_defects(path: &Path) -> Result<CuratedCalibration, CalibError> {
    // Defect maps exist both as YAML documents and as ECSV region tables.
    match extension_of(path) {
        "yaml" => Ok(CuratedCalibration::Defects(from_yaml_file(path)?)),
        "ecsv" => {
            let table = EcsvTable::read_from_path(path)?;
            let metadata = header_from_ecsv_meta(&table, path)?;
            let x0 = table.column_i64("x0")?;
            let y0 = table.column_i64("y0")?;
            let width = table.column_i64("width")?;
            let height = table.column_i64("height")?;
            let defects = x0
                .into_iter()
                .zip(y0)
                .zip(width.into_iter().zip(height))
                .map(|((x0, y0), (width, height))| DefectRegion {
                    x0,
                    y0,
                    width,
                    height,
                })
                .collect();
            Ok(CuratedCalibration::Defects(DefectList { metadata, defects }))
        }
        _ => Err(CalibError::UnsupportedExtension {
            category: "defects",
            path: path.to_path_buf(),
        }),
    }
}

fn decode_linearizer(path: &Path) -> Result<CuratedCalibration, CalibError> {
    if extension_of(path) != "yaml" {
        return Err(CalibError::UnsupportedExtension {
            category: "linearizer",
            path: path.to_path_buf(),
        });
    }
    Ok(CuratedCalibration::Linearizer(from_yaml_file(path)?))
}

fn decode_crosstalk(path: &Path) -> Result<CuratedCalibration, CalibError> {
    if extension_of(path) != "yaml" {
        return Err(CalibError::UnsupportedExtension {
            category: "crosstalk",
            path: path.to_path_buf(),
        });
    }
    Ok(CuratedCalibration::Crosstalk(from_yaml_file(path)?))
}

fn decode_brighter_fatter(path: &Path) -> Result<CuratedCalibration, CalibError> {
    if extension_of(path) != "yaml" {
        return Err(CalibError::UnsupportedExtension {
            category: "bfk",
            path: path.to_path_buf(),
        });
    }
    Ok(CuratedCalibration::BrighterFatter(from_yaml_file(path)?))
}

fn decode_photodiode(path: &Path) -> Result<CuratedCalibration, CalibError> {
    if extension_of(path) != "ecsv" {
        return Err(CalibError::UnsupportedExtension {
            category: "photodiode",
            path: path.to_path_buf(),
        });
    }
    let table = EcsvTable::read_from_path(path)?;
    Ok(CuratedCalibration::Photodiode(PhotodiodeCalib {
        metadata: header_from_ecsv_meta(&table, path)?,
        time: table.column_f64("time")?,
        current: table.column_f64("current")?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_dir_name_roundtrip() {
        for category in CalibrationCategory::ALL {
            assert_eq!(
                CalibrationCategory::from_dir_name(category.dir_name()).unwrap(),
                category
            );
        }
    }

    #[test]
    fn test_unknown_category_lists_recognized_names() {
        let err = CalibrationCategory::from_dir_name("flatfield").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("flatfield"));
        for category in CalibrationCategory::ALL {
            assert!(msg.contains(category.dir_name()), "missing {category}");
        }
    }

    #[test]
    fn test_decode_defects_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "metadata:\n  INSTRUME: testcam\n  DETECTOR: 3\n  OBSTYPE: defects\n\
             defects:\n- {{x0: 10, y0: 20, width: 2, height: 5}}\n"
        )
        .unwrap();

        let calib = CalibrationCategory::Defects.decode(file.path()).unwrap();
        let CuratedCalibration::Defects(defects) = &calib else {
            panic!("expected defects variant");
        };
        assert_eq!(defects.defects.len(), 1);
        assert_eq!(defects.defects[0].width, 2);
        assert_eq!(calib.header().detector, 3);
        assert_eq!(calib.header().obstype, "defects");
    }

    #[test]
    fn test_decode_defects_ecsv() {
        let mut file = tempfile::Builder::new().suffix(".ecsv").tempfile().unwrap();
        write!(
            file,
            "# %ECSV 1.0\n# meta:\n#   INSTRUME: testcam\n#   DETECTOR: 7\n\
             #   OBSTYPE: defects\nx0,y0,width,height\n1,2,3,4\n5,6,7,8\n"
        )
        .unwrap();

        let calib = CalibrationCategory::Defects.decode(file.path()).unwrap();
        let CuratedCalibration::Defects(defects) = &calib else {
            panic!("expected defects variant");
        };
        assert_eq!(defects.defects.len(), 2);
        assert_eq!(
            defects.defects[1],
            DefectRegion {
                x0: 5,
                y0: 6,
                width: 7,
                height: 8
            }
        );
    }

    #[test]
    fn test_decode_qe_curve_ecsv() {
        let mut file = tempfile::Builder::new().suffix(".ecsv").tempfile().unwrap();
        write!(
            file,
            "# %ECSV 1.0\n# meta:\n#   INSTRUME: testcam\n#   DETECTOR: 0\n\
             #   OBSTYPE: qe_curve\nwavelength,efficiency\n400.0,0.5\n500.0,0.9\n"
        )
        .unwrap();

        let calib = CalibrationCategory::QeCurve.decode(file.path()).unwrap();
        let CuratedCalibration::QeCurve(curve) = calib else {
            panic!("expected qe_curve variant");
        };
        assert_eq!(curve.wavelength, vec![400.0, 500.0]);
        assert_eq!(curve.efficiency, vec![0.5, 0.9]);
    }

    #[test]
    fn test_decode_linearizer_yaml() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        write!(
            file,
            "metadata:\n  INSTRUME: testcam\n  DETECTOR: 1\n  OBSTYPE: linearizer\n\
             linearity_type: Polynomial\ncoefficients:\n  C00: [0.0, 1.0, 2.0e-6]\n"
        )
        .unwrap();

        let calib = CalibrationCategory::Linearizer.decode(file.path()).unwrap();
        let CuratedCalibration::Linearizer(lin) = calib else {
            panic!("expected linearizer variant");
        };
        assert_eq!(lin.linearity_type, "Polynomial");
        assert_eq!(lin.coefficients["C00"].len(), 3);
    }

    #[test]
    fn test_decode_rejects_wrong_extension() {
        let file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        let err = CalibrationCategory::QeCurve.decode(file.path()).unwrap_err();
        assert!(matches!(err, CalibError::UnsupportedExtension { .. }));
    }
}
