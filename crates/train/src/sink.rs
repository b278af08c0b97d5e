//! Time-series sinks for per-step training scalars.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use anyhow::Context;

/// Receives `(name, value, step)` triples.
pub trait MetricsSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> anyhow::Result<()>;

    fn flush(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// CSV file with a `name,step,value` header.
pub struct CsvSink {
    out: BufWriter<File>,
}

impl CsvSink {
    pub fn create(path: &Path) -> anyhow::Result<Self> {
        let file =
            File::create(path).with_context(|| format!("create metrics file {}", path.display()))?;
        let mut out = BufWriter::new(file);
        writeln!(out, "name,step,value")?;
        Ok(Self { out })
    }
}

impl MetricsSink for CsvSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> anyhow::Result<()> {
        writeln!(self.out, "{name},{step},{value}")?;
        Ok(())
    }

    fn flush(&mut self) -> anyhow::Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Emits every scalar as a `debug` event.
#[derive(Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> anyhow::Result<()> {
        tracing::debug!(target: "rotbin::metrics", metric = name, value, step, "scalar");
        Ok(())
    }
}

/// Keeps every scalar in memory.
#[derive(Default, Debug)]
pub struct MemorySink {
    pub records: Vec<(String, f64, usize)>,
}

impl MemorySink {
    /// `(step, value)` pairs recorded under `name`, in arrival order.
    pub fn series(&self, name: &str) -> Vec<(usize, f64)> {
        self.records
            .iter()
            .filter(|(n, _, _)| n == name)
            .map(|&(_, v, s)| (s, v))
            .collect()
    }
}

impl MetricsSink for MemorySink {
    fn add_scalar(&mut self, name: &str, value: f64, step: usize) -> anyhow::Result<()> {
        self.records.push((name.to_string(), value, step));
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
