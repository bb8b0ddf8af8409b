use anyhow::{Context, Result};
use chrono::Local;
use csv::Writer;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

/// Timestamped events and named counters for one stage.
#[derive(Debug)]
pub struct PerfMon {
    caller: String,
    origin: Instant,
    /// (seconds since creation, action)
    timelog: Vec<(f64, String)>,
    counters: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PerfSummary {
    /// Seconds between the first and last event
    pub total_duration: f64,
    pub average_op_time: f64,
    pub total_ops: u64,
}

impl PerfMon {
    pub fn new(caller: &str) -> Self {
        Self {
            caller: caller.to_string(),
            origin: Instant::now(),
            timelog: Vec::new(),
            counters: BTreeMap::new(),
        }
    }

    pub fn event(&mut self, action: &str) {
        self.timelog
            .push((self.origin.elapsed().as_secs_f64(), action.to_string()));
    }

    pub fn count(&mut self, event: &str) {
        self.add(event, 1);
    }

    pub fn add(&mut self, event: &str, n: u64) {
        *self.counters.entry(event.to_string()).or_insert(0) += n;
    }

    pub fn counter(&self, event: &str) -> u64 {
        self.counters.get(event).copied().unwrap_or(0)
    }

    pub fn summarise(&self) -> PerfSummary {
        let total_duration = match (self.timelog.first(), self.timelog.last()) {
            (Some((first, _)), Some((last, _))) => last - first,
            _ => 0.0,
        };
        let average_op_time = if self.timelog.is_empty() {
            0.0
        } else {
            total_duration / self.timelog.len() as f64
        };
        PerfSummary {
            total_duration,
            average_op_time,
            total_ops: self.counters.values().sum(),
        }
    }

    /// Writes `<stamp>_{timelog,counts,summary}_<caller>.csv` into `dir`.
    pub fn write_logs(&self, dir: &Path) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create perf directory: {:?}", dir))?;
        let stamp = Local::now().format("%Y%m%d_%H%M%S").to_string();
        let path = |kind: &str| dir.join(format!("{}_{}_{}.csv", stamp, kind, self.caller));

        let timelog = path("timelog");
        let mut writer = open(&timelog)?;
        writer.write_record(["timestamp", "action"])?;
        for (ts, action) in &self.timelog {
            writer.write_record([format!("{:.6}", ts).as_str(), action.as_str()])?;
        }
        writer.flush()?;

        let counts = path("counts");
        let mut writer = open(&counts)?;
        writer.write_record(["event", "n"])?;
        for (event, n) in &self.counters {
            writer.write_record([event.as_str(), itoa::Buffer::new().format(*n)])?;
        }
        writer.flush()?;

        let summary = self.summarise();
        let summary_path = path("summary");
        let mut writer = open(&summary_path)?;
        writer.write_record(["measure", "value"])?;
        let rows = [
            ("total duration", format!("{:.4}", summary.total_duration)),
            ("average op time", format!("{:.4}", summary.average_op_time)),
            ("total ops", summary.total_ops.to_string()),
        ];
        for (measure, value) in &rows {
            writer.write_record([*measure, value.as_str()])?;
        }
        writer.flush()?;

        Ok(vec![timelog, counts, summary_path])
    }
}

fn open(path: &Path) -> Result<Writer<fs::File>> {
    Writer::from_path(path).with_context(|| format!("Failed to create perf log: {:?}", path))
}
