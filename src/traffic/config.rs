use std::path::PathBuf;

use anyhow::{ensure, Result};
use serde::Deserialize;

use crate::sim::config::Config;

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrafficKind {
    #[default]
    Random,
    Stream,
    Trace,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    pub kind: TrafficKind,
    // text trace, one "0xADDR READ|WRITE cycle" per line
    pub trace: Option<PathBuf>,
    pub seed: u64,
    pub write_ratio: f64,
    pub footprint_bytes: u64,
    pub stride: u64,
    // generated requests; traces are replayed to their end
    pub requests: u64,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            kind: TrafficKind::Random,
            trace: None,
            seed: 0,
            write_ratio: 0.3,
            footprint_bytes: 1 << 30,
            stride: 64,
            requests: 1_000_000,
        }
    }
}

impl TrafficConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(
            (0.0..=1.0).contains(&self.write_ratio),
            "write_ratio must be within [0, 1], got {}",
            self.write_ratio
        );
        ensure!(self.stride > 0, "stride must be positive");
        ensure!(
            self.footprint_bytes >= 3 * self.stride,
            "footprint_bytes must hold at least three strides"
        );
        if self.kind == TrafficKind::Trace {
            ensure!(self.trace.is_some(), "trace traffic needs a trace file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toml::Table;

    #[test]
    fn trace_kind_needs_a_file() {
        let table: Table = toml::from_str("[traffic]\nkind = \"trace\"\n").unwrap();
        let cfg = TrafficConfig::from_section(table.get("traffic"));
        assert_eq!(cfg.kind, TrafficKind::Trace);
        assert!(cfg.validate().is_err());

        let table: Table =
            toml::from_str("[traffic]\nkind = \"trace\"\ntrace = \"run.trace\"\n").unwrap();
        let cfg = TrafficConfig::from_section(table.get("traffic"));
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn write_ratio_is_a_fraction() {
        let cfg = TrafficConfig {
            write_ratio: 1.5,
            ..TrafficConfig::default()
        };
        assert!(cfg.validate().is_err());
        assert!(TrafficConfig::default().validate().is_ok());
    }
}
