//! Metric reporting.
//!
//! Sinks are fire-and-forget: a sink that fails to record a point logs a
//! warning and training carries on.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Named scalar values reported at one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metrics(BTreeMap<String, f64>);

impl Metrics {
    /// Empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, builder style
    pub fn with(mut self, name: impl Into<String>, value: f64) -> Self {
        self.insert(name, value);
        self
    }

    /// Add or replace a value
    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        self.0.insert(name.into(), value);
    }

    /// Look up a value
    pub fn get(&self, name: &str) -> Option<f64> {
        self.0.get(name).copied()
    }

    /// Iterate in name order
    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    /// Number of values
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no values are set
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Destination for training metrics.
pub trait MetricsSink {
    /// Record `metrics` at global `step`. Must not fail the caller.
    fn log(&mut self, metrics: &Metrics, step: usize);
}

impl<S: MetricsSink + ?Sized> MetricsSink for Box<S> {
    fn log(&mut self, metrics: &Metrics, step: usize) {
        (**self).log(metrics, step);
    }
}

/// Emits every point as a `tracing` debug event.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log(&mut self, metrics: &Metrics, step: usize) {
        let rendered: Vec<String> = metrics
            .iter()
            .map(|(k, v)| format!("{k}={v:.6}"))
            .collect();
        tracing::debug!(step, "{}", rendered.join(" "));
    }
}

#[derive(Serialize, Deserialize)]
struct JsonlRecord {
    step: usize,
    #[serde(flatten)]
    values: Metrics,
}

/// Appends one JSON object per point to a `.jsonl` file.
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    file: Option<File>,
}

impl JsonlSink {
    /// Sink writing to `path`; the file is opened lazily in append mode.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }

    /// Target file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn write(&mut self, metrics: &Metrics, step: usize) -> std::io::Result<()> {
        if self.file.is_none() {
            self.file = Some(OpenOptions::new().create(true).append(true).open(&self.path)?);
        }
        let record = JsonlRecord {
            step,
            values: metrics.clone(),
        };
        let line = serde_json::to_string(&record)?;
        if let Some(file) = self.file.as_mut() {
            writeln!(file, "{line}")?;
        }
        Ok(())
    }

    /// Read back every `(step, metrics)` pair in `path`, skipping bad lines.
    pub fn read(path: &Path) -> std::io::Result<Vec<(usize, Metrics)>> {
        let reader = BufReader::new(File::open(path)?);
        Ok(reader
            .lines()
            .map_while(Result::ok)
            .filter_map(|line| serde_json::from_str::<JsonlRecord>(&line).ok())
            .map(|r| (r.step, r.values))
            .collect())
    }
}

impl MetricsSink for JsonlSink {
    fn log(&mut self, metrics: &Metrics, step: usize) {
        if let Err(e) = self.write(metrics, step) {
            tracing::warn!("failed to append metrics to {}: {e}", self.path.display());
            self.file = None;
        }
    }
}

/// Keeps every point in memory.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    /// Recorded `(step, metrics)` pairs in arrival order
    pub records: Vec<(usize, Metrics)>,
}

impl MetricsSink for RecordingSink {
    fn log(&mut self, metrics: &Metrics, step: usize) {
        self.records.push((step, metrics.clone()));
    }
}

/// Forwards every point to each inner sink.
#[derive(Default)]
pub struct MultiSink {
    sinks: Vec<Box<dyn MetricsSink>>,
}

impl MultiSink {
    /// No sinks
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a sink, builder style
    pub fn with(mut self, sink: impl MetricsSink + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }
}

impl MetricsSink for MultiSink {
    fn log(&mut self, metrics: &Metrics, step: usize) {
        for sink in &mut self.sinks {
            sink.log(metrics, step);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_metrics_builder() {
        let m = Metrics::new().with("loss", 1.5).with("kl_loss", 0.25);
        assert_eq!(m.len(), 2);
        assert_eq!(m.get("loss"), Some(1.5));
        assert_eq!(m.get("missing"), None);
        let names: Vec<&str> = m.iter().map(|(k, _)| k).collect();
        assert_eq!(names, vec!["kl_loss", "loss"]);
    }

    #[test]
    fn test_jsonl_sink_appends_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let mut sink = JsonlSink::new(&path);

        sink.log(&Metrics::new().with("loss", 2.0), 0);
        sink.log(&Metrics::new().with("loss", 1.0).with("epoch", 0.0), 1);

        let records = JsonlSink::read(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].0, 1);
        assert_eq!(records[1].1.get("loss"), Some(1.0));

        let first_line = std::fs::read_to_string(&path).unwrap();
        assert!(first_line.starts_with(r#"{"step":0,"loss":2.0}"#));
    }

    #[test]
    fn test_jsonl_sink_failure_does_not_panic() {
        let mut sink = JsonlSink::new("/nonexistent-dir/metrics.jsonl");
        sink.log(&Metrics::new().with("loss", 1.0), 0);
        sink.log(&Metrics::new().with("loss", 1.0), 1);
    }

    #[test]
    fn test_multi_sink_fans_out() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.jsonl");
        let mut sink = MultiSink::new()
            .with(TracingSink)
            .with(JsonlSink::new(&path));
        sink.log(&Metrics::new().with("val_avg_loss", 0.5), 3);

        let records = JsonlSink::read(&path).unwrap();
        assert_eq!(records, vec![(3, Metrics::new().with("val_avg_loss", 0.5))]);
    }
}
