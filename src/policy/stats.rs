use std::collections::BTreeMap;
use std::io::{self, Write};

use serde::Serialize;

// Sparse count histogram keyed by sample value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Histogram {
    buckets: BTreeMap<u64, u64>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    // Histogram with explicit zero buckets for 0..=max, so every bucket shows up in reports.
    pub fn with_range(max: u64) -> Self {
        Self {
            buckets: (0..=max).map(|key| (key, 0)).collect(),
        }
    }

    pub fn sample(&mut self, key: u64) {
        let count = self.buckets.entry(key).or_insert(0);
        *count = count.saturating_add(1);
    }

    pub fn count(&self, key: u64) -> u64 {
        self.buckets.get(&key).copied().unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.buckets.values().sum()
    }

    pub fn average(&self) -> f64 {
        let total = self.total();
        if total == 0 {
            return 0.0;
        }
        let weighted: f64 = self
            .buckets
            .iter()
            .map(|(key, count)| *key as f64 * *count as f64)
            .sum();
        weighted / total as f64
    }

    // Sum of counts whose key lies in `lo..=hi`.
    pub fn range_sum(&self, lo: u64, hi: u64) -> u64 {
        self.buckets.range(lo..=hi).map(|(_, count)| *count).sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, u64)> + '_ {
        self.buckets.iter().map(|(key, count)| (*key, *count))
    }

    pub fn clear(&mut self) {
        self.buckets.clear();
    }

    // Zero every bucket but keep the keys.
    pub fn zero(&mut self) {
        self.buckets.values_mut().for_each(|count| *count = 0);
    }

    pub fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
        for (key, count) in self.iter() {
            writeln!(out, "{key} {count}")?;
        }
        Ok(())
    }
}

// Counters kept by the shared front end for every policy.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FrontEndStats {
    pub accepted: u64,
    pub rejected: u64,
    pub hits: u64,
    pub misses: u64,
    pub wb_hits: u64,
    pub other_buffer_hits: u64,
    pub mshr_full_stalls: u64,
    pub remote_fetches: u64,
    pub remote_fetch_flits: u64,
    pub remote_writebacks: u64,
    pub remote_writeback_flits: u64,
    pub refills: u64,
    pub line_utility: Histogram,
    pub eviction_utility: Histogram,
    pub mshr_waiting: Histogram,
}

impl FrontEndStats {
    pub fn new(granularity: u64, mshr_capacity: usize) -> Self {
        Self {
            line_utility: Histogram::with_range(granularity.max(256) / 256),
            eviction_utility: Histogram::with_range(granularity.max(256) / 256),
            mshr_waiting: Histogram::with_range(mshr_capacity as u64),
            ..Self::default()
        }
    }

    pub fn record_hit(&mut self, utilized: u64) {
        self.hits = self.hits.saturating_add(1);
        self.line_utility.sample(utilized);
    }

    pub fn record_miss(&mut self) {
        self.misses = self.misses.saturating_add(1);
    }

    pub fn reset(&mut self) {
        let mut line_utility = std::mem::take(&mut self.line_utility);
        let mut eviction_utility = std::mem::take(&mut self.eviction_utility);
        let mut mshr_waiting = std::mem::take(&mut self.mshr_waiting);
        line_utility.zero();
        eviction_utility.zero();
        mshr_waiting.zero();
        *self = Self {
            line_utility,
            eviction_utility,
            mshr_waiting,
            ..Self::default()
        };
    }

    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.wb_hits + self.other_buffer_hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        (self.hits + self.wb_hits + self.other_buffer_hits) as f64 / total as f64
    }
}
