//! CSV result files.
//!
//! Layout of a result file:
//!
//! ```text
//! #Procedure: gate_sweep
//! #Parameters:
//! #	max_voltage_mv: 2000
//! #	min_voltage_mv: -2000
//! #Data:
//! Voltage (V),Current (A),Resistance (ohm)
//! -2,-0.000002,1000000
//! 0,0.0000000000001,nan
//! ```
//!
//! Cells not measured in a row are left empty; NaN is written as `nan`.
//! Values use plain decimal notation, never exponents.
//!
//! A run never overwrites an earlier file. When two runs start within the same
//! second the later one gets a numeric suffix, e.g. `GC_20240101_120000_1.csv`.

use crate::data::{ResultRow, ResultSink, RunHeader};
use crate::error::DaqError;
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// A writer for CSV result files.
#[cfg(feature = "storage_csv")]
pub struct CsvResultWriter {
    directory: PathBuf,
    prefix: String,
    path: Option<PathBuf>,
    columns: Vec<String>,
    writer: Option<csv::Writer<File>>,
}

#[cfg(feature = "storage_csv")]
impl CsvResultWriter {
    /// Files go to `directory` as `<prefix>_<YYYYmmdd_HHMMSS>.csv`.
    pub fn new(directory: impl AsRef<Path>, prefix: &str) -> Self {
        Self {
            directory: directory.as_ref().to_path_buf(),
            prefix: prefix.to_string(),
            path: None,
            columns: Vec::new(),
            writer: None,
        }
    }

    /// Path of the file being written, once the run has begun.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn create_file(&self) -> Result<(PathBuf, File), DaqError> {
        let stem = format!(
            "{}_{}",
            self.prefix,
            chrono::Local::now().format("%Y%m%d_%H%M%S")
        );
        for attempt in 0..MAX_NAME_ATTEMPTS {
            let name = if attempt == 0 {
                format!("{}.csv", stem)
            } else {
                format!("{}_{}.csv", stem, attempt)
            };
            let path = self.directory.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((path, file)),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => {
                    return Err(DaqError::Storage(format!(
                        "Failed to create CSV file '{}': {}",
                        path.display(),
                        e
                    )))
                }
            }
        }
        Err(DaqError::Storage(format!(
            "No free file name for '{}' in '{}'",
            stem,
            self.directory.display()
        )))
    }
}

#[cfg(feature = "storage_csv")]
const MAX_NAME_ATTEMPTS: usize = 1000;

#[cfg(feature = "storage_csv")]
fn format_cell(value: f64) -> String {
    if value.is_nan() {
        "nan".to_string()
    } else {
        value.to_string()
    }
}

#[cfg(feature = "storage_csv")]
#[async_trait]
impl ResultSink for CsvResultWriter {
    async fn begin(&mut self, header: &RunHeader) -> Result<(), DaqError> {
        if !self.directory.exists() {
            std::fs::create_dir_all(&self.directory)
                .map_err(|e| DaqError::Storage(format!("Failed to create output directory: {}", e)))?;
        }
        let (path, mut file) = self.create_file()?;

        let mut preamble = format!("#Procedure: {}\n#Parameters:\n", header.procedure);
        for (name, value) in &header.parameters {
            preamble.push_str(&format!("#\t{}: {}\n", name, value));
        }
        preamble.push_str("#Data:\n");
        file.write_all(preamble.as_bytes())?;

        let mut writer = csv::Writer::from_writer(file);
        writer.write_record(&header.columns)?;
        writer.flush()?;

        tracing::info!("Writing results to '{}'", path.display());
        self.columns = header.columns.clone();
        self.writer = Some(writer);
        self.path = Some(path);
        Ok(())
    }

    async fn emit(&mut self, row: &ResultRow) -> Result<(), DaqError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| DaqError::Storage("CSV writer used before begin()".into()))?;
        let record: Vec<String> = self
            .columns
            .iter()
            .map(|c| row.get(c).map(format_cell).unwrap_or_default())
            .collect();
        writer.write_record(&record)?;
        // Rows must survive an abort mid-run.
        writer.flush()?;
        Ok(())
    }

    async fn finish(&mut self) -> Result<(), DaqError> {
        if let Some(mut writer) = self.writer.take() {
            writer.flush()?;
        }
        if let Some(path) = &self.path {
            tracing::info!("CSV file '{}' closed.", path.display());
        }
        Ok(())
    }
}

/// Placeholder when CSV support is not compiled in.
#[cfg(not(feature = "storage_csv"))]
pub struct CsvResultWriter;

#[cfg(not(feature = "storage_csv"))]
impl CsvResultWriter {
    /// Always fails on `begin`.
    pub fn new(_directory: impl AsRef<Path>, _prefix: &str) -> Self {
        Self
    }

    /// Never set.
    pub fn path(&self) -> Option<&Path> {
        None
    }
}

#[cfg(not(feature = "storage_csv"))]
#[async_trait]
impl ResultSink for CsvResultWriter {
    async fn begin(&mut self, _header: &RunHeader) -> Result<(), DaqError> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
    async fn emit(&mut self, _row: &ResultRow) -> Result<(), DaqError> {
        Err(DaqError::FeatureNotEnabled("storage_csv".to_string()))
    }
    async fn finish(&mut self) -> Result<(), DaqError> {
        Ok(())
    }
}
