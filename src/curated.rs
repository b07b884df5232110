//! Curated calibration archive loader.
//!
//! An archive lives at `<instrument>/<category>/<sensor>/<timestamp>.<ext>`:
//! the root passed to the loader is the `<category>` directory, its trailing
//! path segment names the calibration category and the segment above it
//! names the instrument. Each immediate subdirectory is a lower-cased sensor
//! name and each file inside it is one validity record whose stem parses as
//! the validity-start timestamp.
//!
//! Loading either returns a complete, internally consistent
//! [`CalibrationSet`] or fails: header metadata must match the identity
//! implied by the file's location, every subdirectory must resolve to a
//! known sensor, and all sensors must agree on a single category.

use crate::calibs::{
    CalibError, CalibrationCategory, CuratedCalibration, RECOGNIZED_EXTENSIONS,
};
use crate::camera::CameraDescription;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// At most this many sensor names are listed in an unknown-sensor error.
const MAX_LISTED_SENSORS: usize = 10;

/// Mapping from validity-start timestamp to decoded artifact, for one sensor.
pub type ValidityRecords = BTreeMap<NaiveDateTime, CuratedCalibration>;

/// Errors raised while loading a calibration archive.
#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error(transparent)]
    Calib(#[from] CalibError),
    #[error("archive I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot parse validity timestamp from file stem '{stem}' ({path})")]
    InvalidStem { stem: String, path: PathBuf },
    #[error(
        "path and file metadata do not agree for {path}: \
         path metadata: {instrument} {detector} {category}; \
         file metadata: {found_instrument} {found_detector} {found_obstype}"
    )]
    MetadataMismatch {
        path: PathBuf,
        instrument: String,
        detector: i64,
        category: CalibrationCategory,
        found_instrument: String,
        found_detector: i64,
        found_obstype: String,
    },
    #[error("detector {sensor} not known to supplied camera {camera} ({framing}: {known})")]
    UnknownSensor {
        sensor: String,
        camera: String,
        framing: &'static str,
        known: String,
    },
    #[error("no data found on path {root}")]
    NoData { root: PathBuf },
    #[error("no data to ingest")]
    NothingToIngest,
    #[error("error mixing calibration categories: {{{categories}}}")]
    MixedCategories { categories: String },
}

/// The result of a successful archive load: one category, all sensors.
#[derive(Debug, Clone)]
pub struct CalibrationSet {
    /// Lower-cased sensor name to its per-validity-time records.
    pub by_sensor: BTreeMap<String, ValidityRecords>,
    pub category: CalibrationCategory,
}

/// Parse a file stem as a validity-start timestamp.
///
/// Accepted formats, tried in order: RFC 3339 (offset is dropped after
/// conversion to UTC), `%Y-%m-%dT%H:%M:%S` with optional fractional seconds,
/// `%Y-%m-%d %H:%M:%S`, `%Y-%m-%dT%H:%M`, `%Y%m%dT%H%M%S`, and the bare
/// dates `%Y-%m-%d` / `%Y%m%d` (taken as midnight). Anything else fails.
pub fn parse_validity_stem(stem: &str, path: &Path) -> Result<NaiveDateTime, ArchiveError> {
    const DATETIME_FORMATS: [&str; 4] = [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M",
        "%Y%m%dT%H%M%S",
    ];
    const DATE_FORMATS: [&str; 2] = ["%Y-%m-%d", "%Y%m%d"];

    if let Ok(dt) = DateTime::parse_from_rfc3339(stem) {
        return Ok(dt.naive_utc());
    }
    for format in DATETIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(stem, format) {
            return Ok(dt);
        }
    }
    for format in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(stem, format) {
            return Ok(date.and_time(NaiveTime::MIN));
        }
    }
    Err(ArchiveError::InvalidStem {
        stem: stem.to_string(),
        path: path.to_path_buf(),
    })
}

/// Check that an artifact's embedded header matches its location.
///
/// The triple (instrument, detector id, category) derived from the file's
/// path must equal the header triple, with string fields compared lower
/// cased. A mismatch names both triples and the file.
pub fn check_metadata(
    calib: &CuratedCalibration,
    instrument: &str,
    sensor_id: u32,
    path: &Path,
    category: CalibrationCategory,
) -> Result<(), ArchiveError> {
    let header = calib.header();
    let found = (
        header.instrument.to_lowercase(),
        header.detector,
        header.obstype.to_lowercase(),
    );
    let expected = (
        instrument.to_lowercase(),
        i64::from(sensor_id),
        category.dir_name().to_string(),
    );
    if found != expected {
        return Err(ArchiveError::MetadataMismatch {
            path: path.to_path_buf(),
            instrument: instrument.to_string(),
            detector: i64::from(sensor_id),
            category,
            found_instrument: header.instrument.clone(),
            found_detector: header.detector,
            found_obstype: header.obstype.clone(),
        });
    }
    Ok(())
}

fn category_from_root(root: &Path) -> Result<CalibrationCategory, CalibError> {
    let name = root.file_name().and_then(|n| n.to_str()).unwrap_or("");
    CalibrationCategory::from_dir_name(name)
}

fn instrument_from_root(root: &Path) -> String {
    root.parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("")
        .to_string()
}

/// Load all calibration files for one sensor.
///
/// Enumerates the recognized-extension files directly under
/// `root/<sensor_name>`, decodes each through the category's decoder and
/// cross-checks its header against the path-derived identity. Independent
/// sensors touch disjoint subdirectories, so callers may run these loads in
/// parallel and aggregate afterwards.
pub fn load_sensor_files(
    root: &Path,
    sensor_name: &str,
    sensor_id: u32,
) -> Result<(ValidityRecords, CalibrationCategory), ArchiveError> {
    let category = category_from_root(root)?;
    let instrument = instrument_from_root(root);
    let dir = root.join(sensor_name);

    let mut records = ValidityRecords::new();
    for entry in std::fs::read_dir(&dir)? {
        let path = entry?.path();
        let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");
        if !RECOGNIZED_EXTENSIONS.contains(&extension) {
            continue;
        }
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .ok_or_else(|| ArchiveError::InvalidStem {
                stem: String::new(),
                path: path.clone(),
            })?;
        let valid_start = parse_validity_stem(stem, &path)?;
        let calib = category.decode(&path)?;
        check_metadata(&calib, &instrument, sensor_id, &path, category)?;
        records.insert(valid_start, calib);
    }

    if records.is_empty() {
        warn!("no {category} files found for sensor {sensor_name} under {}", dir.display());
    } else {
        info!(
            "loaded {} {category} files for sensor {sensor_name}",
            records.len()
        );
    }
    Ok((records, category))
}

fn unknown_sensor_error(sensor: &str, camera: &CameraDescription) -> ArchiveError {
    let names: Vec<&str> = camera.sensor_names().collect();
    let (framing, sample) = if names.len() > MAX_LISTED_SENSORS {
        ("examples", &names[..MAX_LISTED_SENSORS])
    } else {
        ("knows", &names[..])
    };
    ArchiveError::UnknownSensor {
        sensor: sensor.to_string(),
        camera: camera.name.clone(),
        framing,
        known: sample.join(","),
    }
}

/// Combine per-sensor results into a [`CalibrationSet`].
///
/// This is the synchronization barrier after the per-sensor loads: all
/// sensors must agree on a single category and at least one sensor must
/// have produced at least one record.
pub fn aggregate(
    per_sensor: Vec<(String, ValidityRecords, CalibrationCategory)>,
) -> Result<CalibrationSet, ArchiveError> {
    let categories: BTreeSet<CalibrationCategory> =
        per_sensor.iter().map(|(_, _, c)| *c).collect();
    if categories.len() > 1 {
        return Err(ArchiveError::MixedCategories {
            categories: categories
                .iter()
                .map(|c| c.dir_name())
                .collect::<Vec<_>>()
                .join(", "),
        });
    }
    let category = categories
        .into_iter()
        .next()
        .ok_or(ArchiveError::NothingToIngest)?;

    if per_sensor.iter().all(|(_, records, _)| records.is_empty()) {
        return Err(ArchiveError::NothingToIngest);
    }

    let by_sensor = per_sensor
        .into_iter()
        .map(|(sensor, records, _)| (sensor, records))
        .collect();
    Ok(CalibrationSet {
        by_sensor,
        category,
    })
}

/// Load a complete calibration archive.
///
/// Every immediate subdirectory of `root` must resolve to a sensor of the
/// supplied camera; the loads are then aggregated with [`aggregate`].
pub fn load_archive(
    root: &Path,
    camera: &CameraDescription,
) -> Result<CalibrationSet, ArchiveError> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                dirs.push(name.to_string());
            }
        }
    }
    dirs.sort();

    if dirs.is_empty() {
        return Err(ArchiveError::NoData {
            root: root.to_path_buf(),
        });
    }

    let name_map = camera.name_map();
    let mut per_sensor = Vec::new();
    for sensor in dirs {
        let Some(descriptor) = name_map.get(sensor.as_str()) else {
            return Err(unknown_sensor_error(&sensor, camera));
        };
        let (records, category) = load_sensor_files(root, &sensor, descriptor.id)?;
        per_sensor.push((sensor, records, category));
    }

    let set = aggregate(per_sensor)?;
    info!(
        "loaded {} archive with {} sensors from {}",
        set.category,
        set.by_sensor.len(),
        root.display()
    );
    Ok(set)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::SensorDescriptor;
    use chrono::NaiveDate;
    use std::fs;
    use tempfile::TempDir;

    fn test_camera() -> CameraDescription {
        CameraDescription::new(
            "TestCam",
            vec![
                SensorDescriptor {
                    name: "CCD01".to_string(),
                    id: 3,
                },
                SensorDescriptor {
                    name: "CCD02".to_string(),
                    id: 4,
                },
            ],
        )
    }

    fn defects_yaml(instrument: &str, detector: i64) -> String {
        format!(
            "metadata:\n  INSTRUME: {instrument}\n  DETECTOR: {detector}\n  OBSTYPE: defects\n\
             defects:\n- {{x0: 1, y0: 2, width: 3, height: 4}}\n"
        )
    }

    /// Build `<instrument>/defects/<sensor>/<stem>.yaml` fixtures under a tempdir.
    fn write_archive(files: &[(&str, &str, String)]) -> (TempDir, PathBuf) {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("testcam").join("defects");
        for (sensor, stem, content) in files {
            let dir = root.join(sensor);
            fs::create_dir_all(&dir).unwrap();
            fs::write(dir.join(format!("{stem}.yaml")), content).unwrap();
        }
        (tmp, root)
    }

    #[test]
    fn test_parse_validity_stem_formats() {
        let path = Path::new("x.yaml");
        let expected = NaiveDate::from_ymd_opt(2021, 5, 1)
            .unwrap()
            .and_hms_opt(12, 30, 0)
            .unwrap();

        for stem in [
            "2021-05-01T12:30:00",
            "2021-05-01 12:30:00",
            "2021-05-01T12:30",
            "20210501T123000",
            "2021-05-01T12:30:00+00:00",
        ] {
            assert_eq!(parse_validity_stem(stem, path).unwrap(), expected, "{stem}");
        }

        let midnight = NaiveDate::from_ymd_opt(2021, 5, 1)
            .unwrap()
            .and_time(NaiveTime::MIN);
        assert_eq!(parse_validity_stem("2021-05-01", path).unwrap(), midnight);
        assert_eq!(parse_validity_stem("20210501", path).unwrap(), midnight);
    }

    #[test]
    fn test_unparseable_stem_fails_loudly() {
        let err = parse_validity_stem("latest", Path::new("latest.yaml")).unwrap_err();
        assert!(err.to_string().contains("latest"));
    }

    #[test]
    fn test_load_archive_roundtrip() {
        let (_tmp, root) = write_archive(&[
            ("ccd01", "2021-05-01T00:00:00", defects_yaml("testcam", 3)),
            ("ccd01", "2022-01-01", defects_yaml("testcam", 3)),
            ("ccd02", "2021-05-01T00:00:00", defects_yaml("testcam", 4)),
        ]);

        let set = load_archive(&root, &test_camera()).unwrap();
        assert_eq!(set.category, CalibrationCategory::Defects);
        assert_eq!(set.by_sensor.len(), 2);
        assert_eq!(set.by_sensor["ccd01"].len(), 2);

        // Every leaf's header triple matches its path-derived triple.
        for (sensor, records) in &set.by_sensor {
            let id = test_camera().name_map()[sensor.as_str()].id;
            for calib in records.values() {
                assert_eq!(calib.header().instrument, "testcam");
                assert_eq!(calib.header().detector, i64::from(id));
                assert_eq!(calib.header().obstype, "defects");
            }
        }
    }

    #[test]
    fn test_metadata_mismatch_names_both_triples() {
        // Header claims detector 7; the camera resolves ccd01 to 3.
        let (_tmp, root) = write_archive(&[(
            "ccd01",
            "2021-05-01T00:00:00",
            defects_yaml("testcam", 7),
        )]);

        let err = load_archive(&root, &test_camera()).unwrap_err();
        let msg = err.to_string();
        assert!(matches!(err, ArchiveError::MetadataMismatch { .. }));
        assert!(msg.contains("testcam 3 defects"), "{msg}");
        assert!(msg.contains("testcam 7 defects"), "{msg}");
        assert!(msg.contains("2021-05-01T00:00:00.yaml"), "{msg}");
    }

    #[test]
    fn test_header_case_is_normalized() {
        let (_tmp, root) = write_archive(&[(
            "ccd01",
            "2021-05-01",
            defects_yaml("TESTCAM", 3).replace("OBSTYPE: defects", "OBSTYPE: DEFECTS"),
        )]);

        load_archive(&root, &test_camera()).unwrap();
    }

    #[test]
    fn test_unknown_sensor_lists_known_names() {
        let (_tmp, root) = write_archive(&[(
            "amp99",
            "2021-05-01T00:00:00",
            defects_yaml("testcam", 3),
        )]);

        let err = load_archive(&root, &test_camera()).unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("amp99"), "{msg}");
        assert!(msg.contains("TestCam"), "{msg}");
        assert!(msg.contains("knows"), "{msg}");
        assert!(msg.contains("CCD01,CCD02"), "{msg}");
    }

    #[test]
    fn test_unknown_sensor_truncates_large_cameras() {
        let sensors = (0..25)
            .map(|i| SensorDescriptor {
                name: format!("CCD{i:02}"),
                id: i,
            })
            .collect();
        let camera = CameraDescription::new("BigCam", sensors);

        let (_tmp, root) = write_archive(&[(
            "amp99",
            "2021-05-01",
            defects_yaml("testcam", 0),
        )]);

        let msg = load_archive(&root, &camera).unwrap_err().to_string();
        assert!(msg.contains("examples"), "{msg}");
        assert!(msg.contains("CCD09"), "{msg}");
        assert!(!msg.contains("CCD10"), "{msg}");
    }

    #[test]
    fn test_empty_root_is_no_data() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("testcam").join("defects");
        fs::create_dir_all(&root).unwrap();

        let err = load_archive(&root, &test_camera()).unwrap_err();
        assert!(matches!(err, ArchiveError::NoData { .. }));
        assert!(err.to_string().contains("no data found"));
    }

    #[test]
    fn test_all_empty_sensors_is_nothing_to_ingest() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("testcam").join("defects");
        fs::create_dir_all(root.join("ccd01")).unwrap();
        fs::create_dir_all(root.join("ccd02")).unwrap();

        let err = load_archive(&root, &test_camera()).unwrap_err();
        assert!(matches!(err, ArchiveError::NothingToIngest));
    }

    #[test]
    fn test_unknown_category_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().join("testcam").join("flatfield");
        let dir = root.join("ccd01");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("2021-05-01.yaml"), defects_yaml("testcam", 3)).unwrap();

        let err = load_archive(&root, &test_camera()).unwrap_err();
        assert!(err.to_string().contains("flatfield"));
        assert!(err.to_string().contains("defects"));
    }

    #[test]
    fn test_aggregate_rejects_mixed_categories() {
        let err = aggregate(vec![
            (
                "ccd01".to_string(),
                ValidityRecords::new(),
                CalibrationCategory::Defects,
            ),
            (
                "ccd02".to_string(),
                ValidityRecords::new(),
                CalibrationCategory::Linearizer,
            ),
        ])
        .unwrap_err();

        let msg = err.to_string();
        assert!(matches!(err, ArchiveError::MixedCategories { .. }));
        assert!(msg.contains("{defects, linearizer}"), "{msg}");
    }

    #[test]
    fn test_unrecognized_extensions_are_skipped() {
        let (_tmp, root) = write_archive(&[(
            "ccd01",
            "2021-05-01",
            defects_yaml("testcam", 3),
        )]);
        fs::write(root.join("ccd01").join("README.txt"), "notes").unwrap();

        let set = load_archive(&root, &test_camera()).unwrap();
        assert_eq!(set.by_sensor["ccd01"].len(), 1);
    }
}
