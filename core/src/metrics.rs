//! Metrics sink: record named scalars at a step.
//!
//! A run is opened with its metadata, receives any number of records, and is
//! finished on normal completion. An interrupted run is never finished, which
//! leaves its stream visibly truncated.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Serialize, Deserialize};

use crate::error::MetricsError;

/// Scalars logged at one step. Names keep a stable (sorted) order.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub step: usize,
    pub values: BTreeMap<String, f64>,
}

impl MetricsRecord {
    pub fn new(step: usize) -> Self {
        MetricsRecord { step, values: BTreeMap::new() }
    }

    pub fn with(mut self, name: &str, value: impl Into<f64>) -> Self {
        self.values.insert(name.to_string(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }
}

/// Run metadata written when a run opens.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunInfo {
    pub name: String,
    pub ts_start: u64,
    pub config: serde_json::Value,
}

pub trait MetricsSink {
    fn start_run(&mut self, info: &RunInfo) -> Result<(), MetricsError>;
    fn log(&mut self, record: &MetricsRecord) -> Result<(), MetricsError>;
    fn finish(&mut self) -> Result<(), MetricsError>;
}

// ── JSON lines ─────────────────────────────────────────────────────────

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line<'a> {
    Run(&'a RunInfo),
    Metrics(&'a MetricsRecord),
    Finished,
}

/// Writes `<runs_dir>/<name>.<ts>.jsonl`, one JSON object per line.
pub struct JsonlSink {
    runs_dir: PathBuf,
    current: Option<(PathBuf, BufWriter<File>)>,
}

impl JsonlSink {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        JsonlSink { runs_dir: runs_dir.into(), current: None }
    }

    pub fn run_path(runs_dir: &Path, name: &str, ts_start: u64) -> PathBuf {
        runs_dir.join(format!("{name}.{ts_start}.jsonl"))
    }

    /// Path of the open run's file, if any.
    pub fn current_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|(p, _)| p.as_path())
    }

    fn write_line(&mut self, line: &Line<'_>) -> Result<(), MetricsError> {
        let (_, out) = self.current.as_mut().ok_or(MetricsError::NoOpenRun)?;
        serde_json::to_writer(&mut *out, line)?;
        out.write_all(b"\n")?;
        out.flush()?;
        Ok(())
    }
}

impl MetricsSink for JsonlSink {
    fn start_run(&mut self, info: &RunInfo) -> Result<(), MetricsError> {
        fs::create_dir_all(&self.runs_dir)?;
        let path = Self::run_path(&self.runs_dir, &info.name, info.ts_start);
        let file = File::create(&path)?;
        log::info!("logging metrics to {}", path.display());
        self.current = Some((path, BufWriter::new(file)));
        self.write_line(&Line::Run(info))
    }

    fn log(&mut self, record: &MetricsRecord) -> Result<(), MetricsError> {
        self.write_line(&Line::Metrics(record))
    }

    fn finish(&mut self) -> Result<(), MetricsError> {
        self.write_line(&Line::Finished)?;
        self.current = None;
        Ok(())
    }
}

// ── In-memory ──────────────────────────────────────────────────────────

/// Keeps everything in memory. Used by tests and analysis code.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub runs: Vec<RunInfo>,
    pub records: Vec<MetricsRecord>,
    pub finished: usize,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps at which at least one record was logged.
    pub fn steps(&self) -> Vec<usize> {
        self.records.iter().map(|r| r.step).collect()
    }
}

impl MetricsSink for MemorySink {
    fn start_run(&mut self, info: &RunInfo) -> Result<(), MetricsError> {
        self.runs.push(info.clone());
        Ok(())
    }

    fn log(&mut self, record: &MetricsRecord) -> Result<(), MetricsError> {
        self.records.push(record.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MetricsError> {
        self.finished += 1;
        Ok(())
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn start_run(&mut self, _info: &RunInfo) -> Result<(), MetricsError> {
        Ok(())
    }

    fn log(&mut self, _record: &MetricsRecord) -> Result<(), MetricsError> {
        Ok(())
    }

    fn finish(&mut self) -> Result<(), MetricsError> {
        Ok(())
    }
}
