//! JSON summary of a collection run.

use serde::Serialize;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use crate::ingest::ProbeStats;

#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub name: String,
    pub good_pdus: u64,
    #[serde(flatten)]
    pub stats: ProbeStats,
}

impl ProbeReport {
    pub fn new(name: impl Into<String>, stats: ProbeStats) -> Self {
        ProbeReport {
            name: name.into(),
            good_pdus: stats.good_pdus(),
            stats,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CollectReport {
    /// Seconds since the epoch when collection started.
    pub started: u64,
    pub elapsed_secs: f64,
    pub records_written: u64,
    pub probes: Vec<ProbeReport>,
}

impl CollectReport {
    /// Counters summed over every probe.
    pub fn total(&self) -> ProbeStats {
        let mut total = ProbeStats::default();
        for p in &self.probes {
            total.accumulate(&p.stats);
        }
        total
    }
}

pub fn write_json(path: &Path, report: &CollectReport) -> Result<(), Box<dyn std::error::Error>> {
    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)?;
    Ok(())
}
