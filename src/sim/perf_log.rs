use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use serde_json::Value;

use crate::sim::top::CadCache;
use crate::timeq::Cycle;

// utilization_<policy>, plus the tuning parameters for the adaptive policy
pub fn report_name(top: &CadCache) -> String {
    let policy = top.frontend().policy();
    match policy.as_our() {
        Some(our) => format!("utilization_{}_{}", policy.name(), our.file_suffix()),
        None => format!("utilization_{}", policy.name()),
    }
}

fn create(dir: &Path, name: &str) -> Result<BufWriter<File>> {
    let path = dir.join(name);
    let file = File::create(&path).with_context(|| format!("cannot create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

// Writes the text report, summary.json and the adaptive policy's traces into `dir`.
pub fn write_report(dir: &Path, top: &CadCache) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;

    let name = report_name(top);
    let mut out = create(dir, &name)?;
    top.write_stats(&mut out)?;
    out.flush()?;

    let summary = serde_json::to_string_pretty(&top.summary())?;
    fs::write(dir.join("summary.json"), summary)?;

    if let Some(our) = top.frontend().policy().as_our() {
        let suffix = our.file_suffix();
        let mut out = create(dir, &format!("threshold_trace_{suffix}"))?;
        for (cycle, promotion_t, padding_t) in our.tuner().trace() {
            writeln!(out, "{cycle} {promotion_t} {padding_t}")?;
        }
        out.flush()?;

        let mut out = create(dir, &format!("capacity_trace_{suffix}"))?;
        for (cycle, ratio) in &our.stats().capacity_trace {
            writeln!(out, "{cycle} {ratio}")?;
        }
        out.flush()?;
    }
    info!("stats written to {}/{}", dir.display(), name);
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct StatsRecord {
    pub cycle: Cycle,
    pub summary: Value,
}

// Periodic snapshots, one json object per line.
pub struct StatsLog {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl StatsLog {
    pub fn create(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir).with_context(|| format!("cannot create {}", dir.display()))?;
        let path = dir.join("stats.jsonl");
        let writer = create(dir, "stats.jsonl")?;
        Ok(Self { path, writer })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn write(&mut self, top: &CadCache) -> Result<()> {
        let record = StatsRecord {
            cycle: top.clk(),
            summary: top.summary(),
        };
        serde_json::to_writer(&mut self.writer, &record)?;
        writeln!(self.writer)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
