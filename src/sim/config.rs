use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{bail, ensure, Result};
use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::*;

use crate::timeq::Cycle;

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> Self {
        match section {
            Some(value) => value.clone().try_into().expect("cannot deserialize config"),
            None => {
                warn!("config section not found");
                Self::default()
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum CachePolicyKind {
    Dummy,
    #[default]
    DirectMapped,
    Kona,
    Our,
}

impl CachePolicyKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Dummy => "dummy",
            Self::DirectMapped => "direct_mapped",
            Self::Kona => "kona",
            Self::Our => "our",
        }
    }
}

impl FromStr for CachePolicyKind {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "dummy" => Ok(Self::Dummy),
            "direct_mapped" | "direct" => Ok(Self::DirectMapped),
            "kona" => Ok(Self::Kona),
            "our" => Ok(Self::Our),
            _ => Err(format!(
                "unsupported cache policy '{}', expected one of: dummy, direct_mapped, kona, our",
                value
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CacheConfig {
    // bytes per cache line (per page-region line for the adaptive policy)
    pub granularity: u64,
    // cache capacity relative to the working set
    pub ratio: f64,
    // working set of the simulated workload, used only to size the cache
    pub working_set_bytes: u64,
    pub rtt_ns: f64,
    pub tck_ns: f64,
    // link bytes per cycle
    pub bw: u32,
    pub cache_policy: CachePolicyKind,
    pub hpt_ratio: u64,
    // adaptation window in cycles
    pub mwl: u64,
    pub front_queue_capacity: usize,
    pub mshr_capacity: usize,
    pub response_latency: Cycle,
    pub link_queue_capacity: usize,
    pub seed: u64,
}

impl Config for CacheConfig {}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            granularity: 4096,
            ratio: 0.25,
            working_set_bytes: 1 << 30,
            rtt_ns: 1000.0,
            tck_ns: 0.833,
            bw: 16,
            cache_policy: CachePolicyKind::DirectMapped,
            hpt_ratio: 2,
            mwl: 100_000,
            front_queue_capacity: 64,
            mshr_capacity: 64,
            response_latency: 3,
            link_queue_capacity: 256,
            seed: 0,
        }
    }
}

impl CacheConfig {
    // Number of cache lines: the largest power of two not above working_set * ratio / granularity.
    pub fn cache_lines(&self) -> usize {
        let lines = (self.working_set_bytes as f64 * self.ratio / self.granularity as f64).floor();
        if lines < 2.0 {
            return 1;
        }
        1usize << (lines.log2().floor() as u32)
    }

    pub fn cache_bytes(&self) -> u64 {
        self.cache_lines() as u64 * self.granularity
    }

    // Round trip to the pool in cache clocks.
    pub fn remote_latency(&self) -> Cycle {
        (self.rtt_ns / self.tck_ns) as Cycle
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.granularity.is_power_of_two() && (256..=4096).contains(&self.granularity),
            "granularity must be a power of two in [256, 4096], got {}",
            self.granularity
        );
        ensure!(self.ratio > 0.0, "ratio must be positive");
        ensure!(self.working_set_bytes > 0, "working_set_bytes must be positive");
        ensure!(self.tck_ns > 0.0 && self.rtt_ns >= 0.0, "invalid rtt/tck");
        ensure!(self.bw > 0, "bw must be positive");
        ensure!(self.mwl > 0, "mwl must be positive");
        ensure!(self.hpt_ratio > 0, "hpt_ratio must be positive");
        ensure!(self.front_queue_capacity > 0, "front_queue_capacity must be positive");
        ensure!(self.mshr_capacity > 0, "mshr_capacity must be positive");
        ensure!(self.link_queue_capacity > 0, "link_queue_capacity must be positive");
        match self.cache_policy {
            CachePolicyKind::Kona if self.cache_lines() < 4 => {
                bail!("kona needs at least one 4-way bucket, got {} lines", self.cache_lines())
            }
            CachePolicyKind::Our if self.granularity != 4096 => {
                bail!("the adaptive policy manages 4096B pages, got granularity {}", self.granularity)
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy)]
#[serde(default)]
pub struct DramConfig {
    pub latency: Cycle,
    pub bytes_per_cycle: u32,
    pub banks: usize,
    pub queue_capacity: usize,
}

impl Config for DramConfig {}

impl Default for DramConfig {
    fn default() -> Self {
        Self {
            latency: 40,
            bytes_per_cycle: 32,
            banks: 16,
            queue_capacity: 32,
        }
    }
}

impl DramConfig {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.bytes_per_cycle > 0, "dram bytes_per_cycle must be positive");
        ensure!(self.banks > 0, "dram needs at least one bank");
        ensure!(self.queue_capacity > 0, "dram queue_capacity must be positive");
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    pub cycles: u64,
    pub output_dir: PathBuf,
    // requests replayed through the warm-up path before timing starts
    pub warmup: u64,
    // cycles between stats.jsonl snapshots, 0 disables them
    pub stats_interval: u64,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            cycles: 100_000,
            output_dir: PathBuf::from("."),
            warmup: 0,
            stats_interval: 0,
        }
    }
}
