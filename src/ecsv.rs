//! Minimal ECSV (Enhanced Character Separated Values) reader.
//!
//! ECSV files carry a YAML header in `#`-prefixed comment lines, starting
//! with a `%ECSV <version>` signature, followed by a plain CSV body. The
//! calibration archive stores its tabular artifacts in this format with the
//! identity metadata under the header's `meta` mapping.
//!
//! Only the subset needed by the calibration decoders is implemented:
//! the `meta` mapping, an optional `delimiter` (single character, comma by
//! default), and string/integer/float column extraction.

use std::path::{Path, PathBuf};
use thiserror::Error;

/// Errors raised while reading an ECSV file.
#[derive(Error, Debug)]
pub enum EcsvError {
    #[error("missing %ECSV signature in {path}")]
    MissingSignature { path: PathBuf },
    #[error("ECSV I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("ECSV header error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("ECSV body error: {0}")]
    Csv(#[from] csv::Error),
    #[error("ECSV table has no column named '{name}'")]
    MissingColumn { name: String },
    #[error("cannot parse '{value}' in ECSV column '{column}'")]
    BadValue { column: String, value: String },
}

/// A parsed ECSV table: header metadata plus the CSV body as strings.
#[derive(Debug, Clone)]
pub struct EcsvTable {
    /// The `meta` mapping from the YAML header (`Null` when absent).
    pub meta: serde_yaml::Value,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl EcsvTable {
    /// Read and parse an ECSV file.
    pub fn read_from_path(path: &Path) -> Result<Self, EcsvError> {
        let content = std::fs::read_to_string(path)?;

        let mut header_lines = Vec::new();
        let mut body_lines = Vec::new();
        for line in content.lines() {
            if let Some(comment) = line.strip_prefix('#') {
                header_lines.push(comment.strip_prefix(' ').unwrap_or(comment));
            } else if !line.trim().is_empty() {
                body_lines.push(line);
            }
        }

        match header_lines.first() {
            Some(first) if first.starts_with("%ECSV") => {}
            _ => {
                return Err(EcsvError::MissingSignature {
                    path: path.to_path_buf(),
                })
            }
        }

        let yaml_doc = header_lines[1..].join("\n");
        let header: serde_yaml::Value = if yaml_doc.trim().is_empty() {
            serde_yaml::Value::Null
        } else {
            serde_yaml::from_str(&yaml_doc)?
        };
        let meta = header.get("meta").cloned().unwrap_or(serde_yaml::Value::Null);
        let delimiter = header
            .get("delimiter")
            .and_then(|v| v.as_str())
            .and_then(|s| s.bytes().next())
            .unwrap_or(b',');

        let body = body_lines.join("\n");
        let mut columns = Vec::new();
        let mut rows = Vec::new();
        if !body.is_empty() {
            let mut reader = csv::ReaderBuilder::new()
                .delimiter(delimiter)
                .from_reader(body.as_bytes());
            columns = reader
                .headers()?
                .iter()
                .map(|h| h.trim().to_string())
                .collect();
            for record in reader.records() {
                let record = record?;
                rows.push(record.iter().map(|f| f.trim().to_string()).collect());
            }
        }

        Ok(Self {
            meta,
            columns,
            rows,
        })
    }

    /// Number of data rows in the table.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    fn column_index(&self, name: &str) -> Result<usize, EcsvError> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| EcsvError::MissingColumn {
                name: name.to_string(),
            })
    }

    /// Extract a column as strings.
    pub fn column_str(&self, name: &str) -> Result<Vec<String>, EcsvError> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|row| row[idx].clone()).collect())
    }

    /// Extract a column parsed as `f64`.
    pub fn column_f64(&self, name: &str) -> Result<Vec<f64>, EcsvError> {
        let idx = self.column_index(name)?;
        self.rows
            .iter()
            .map(|row| {
                row[idx].parse::<f64>().map_err(|_| EcsvError::BadValue {
                    column: name.to_string(),
                    value: row[idx].clone(),
                })
            })
            .collect()
    }

    /// Extract a column parsed as `i64`.
    pub fn column_i64(&self, name: &str) -> Result<Vec<i64>, EcsvError> {
        let idx = self.column_index(name)?;
        self.rows
            .iter()
            .map(|row| {
                row[idx].parse::<i64>().map_err(|_| EcsvError::BadValue {
                    column: name.to_string(),
                    value: row[idx].clone(),
                })
            })
            .collect()
    }
}
