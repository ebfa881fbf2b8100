//! Saving recorded test data.
//!
//! A finished run is handed over as a [`TestRecord`] to whatever
//! [`RecordSink`] the session was given. [`CsvExporter`] writes a CSV table
//! of the samples next to a JSON file with the test parameters.

use std::{
    fs,
    path::{Path, PathBuf},
};

use chrono::NaiveDateTime;
use log::info;
use serde::Serialize;
use thiserror::Error;

use crate::telemetry::TelemetrySample;

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("Export I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Nothing to export for '{0}'")]
    NoSamples(String),
}

/// Everything needed to save one finished test.
#[derive(Debug, Clone, PartialEq)]
pub struct TestRecord {
    pub specimen_name: String,
    pub gauge_length_mm: f64,
    pub area_mm2: f64,
    pub samples: Vec<TelemetrySample>,
    pub sequence_description: String,
}

pub trait RecordSink {
    fn store(&mut self, record: &TestRecord) -> Result<(), ExportError>;
}

/// Keeps records in memory.
impl RecordSink for Vec<TestRecord> {
    fn store(&mut self, record: &TestRecord) -> Result<(), ExportError> {
        self.push(record.clone());
        Ok(())
    }
}

/// File stem of an automatic save, `AUTOSAVE_<name>_<YYYYmmdd_HHMMSS>`.
pub fn autosave_stem(specimen_name: &str, at: &NaiveDateTime) -> String {
    let name: String = specimen_name
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | ':') { '_' } else { c })
        .collect();
    format!("AUTOSAVE_{}_{}", name, at.format("%Y%m%d_%H%M%S"))
}

#[derive(Serialize)]
struct Row {
    #[serde(rename = "Time (s)")]
    time_s: f64,
    #[serde(rename = "Block")]
    block: u32,
    #[serde(rename = "Cycle")]
    cycle: u32,
    #[serde(rename = "Displacement (mm)")]
    displacement_mm: f64,
    #[serde(rename = "Load (N)")]
    load_n: f64,
    #[serde(rename = "Strain (%)")]
    strain_pct: f64,
    #[serde(rename = "Stress (MPa)")]
    stress_mpa: f64,
    #[serde(rename = "Absolute Displacement (mm)")]
    absolute_disp_mm: f64,
    #[serde(rename = "Absolute Load (N)")]
    absolute_load_n: f64,
    #[serde(rename = "Resistance (Ohm)")]
    resistance_ohm: f64,
}

impl Row {
    fn new(sample: &TelemetrySample, record: &TestRecord) -> Self {
        Self {
            time_s: sample.time_s,
            // Shown 1-based like the sequence listing.
            block: sample.block_index + 1,
            cycle: sample.cycle_count,
            displacement_mm: sample.relative_disp_mm,
            load_n: sample.relative_load_n,
            strain_pct: sample.relative_disp_mm / record.gauge_length_mm * 100.0,
            stress_mpa: sample.relative_load_n / record.area_mm2,
            absolute_disp_mm: sample.absolute_disp_mm,
            absolute_load_n: sample.absolute_load_n,
            resistance_ohm: sample.resistance_ohm,
        }
    }
}

#[derive(Serialize)]
struct Parameters<'a> {
    specimen_name: &'a str,
    gauge_length_mm: f64,
    area_mm2: f64,
    sample_count: usize,
    sequence: Vec<&'a str>,
}

/// Writes `<stem>.csv` and `<stem>.json` into a directory.
#[derive(Debug, Clone)]
pub struct CsvExporter {
    dir: PathBuf,
    last_written: Option<PathBuf>,
}

impl CsvExporter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            last_written: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// CSV path of the most recent export.
    pub fn last_written(&self) -> Option<&Path> {
        self.last_written.as_deref()
    }

    /// Write both files under `stem`, returning the CSV path.
    pub fn export(&mut self, record: &TestRecord, stem: &str) -> Result<PathBuf, ExportError> {
        if record.samples.is_empty() {
            return Err(ExportError::NoSamples(record.specimen_name.clone()));
        }
        fs::create_dir_all(&self.dir)?;

        let csv_path = self.dir.join(format!("{}.csv", stem));
        let mut writer = csv::Writer::from_path(&csv_path)?;
        for sample in &record.samples {
            writer.serialize(Row::new(sample, record))?;
        }
        writer.flush()?;

        let parameters = Parameters {
            specimen_name: &record.specimen_name,
            gauge_length_mm: record.gauge_length_mm,
            area_mm2: record.area_mm2,
            sample_count: record.samples.len(),
            sequence: record.sequence_description.lines().collect(),
        };
        let json_path = self.dir.join(format!("{}.json", stem));
        fs::write(&json_path, serde_json::to_string_pretty(&parameters)?)?;

        info!("Saved {} samples to {}", record.samples.len(), csv_path.display());
        self.last_written = Some(csv_path.clone());
        Ok(csv_path)
    }
}

impl RecordSink for CsvExporter {
    fn store(&mut self, record: &TestRecord) -> Result<(), ExportError> {
        let stem = autosave_stem(&record.specimen_name, &chrono::Local::now().naive_local());
        self.export(record, &stem).map(|_| ())
    }
}
