use std::collections::{HashMap, VecDeque};
use std::iter::Peekable;

use anyhow::Result;
use log::{debug, info};
use serde::Serialize;

use crate::policy::stats::Histogram;
use crate::sim::config::SimConfig;
use crate::sim::perf_log::StatsLog;
use crate::sim::top::CadCache;
use crate::timeq::Cycle;
use crate::traffic::patterns::{Access, TrafficSource};

#[derive(Debug, Clone, Serialize)]
pub struct DriverReport {
    pub cycles: Cycle,
    pub warmed: u64,
    pub issued_reads: u64,
    pub issued_writes: u64,
    pub completed_reads: u64,
    pub rejected: u64,
    pub read_latency: Histogram,
}

impl DriverReport {
    pub fn average_read_latency(&self) -> f64 {
        self.read_latency.average()
    }
}

// Feeds a traffic source into the hierarchy, one admission attempt per cycle.
pub struct TrafficDriver {
    source: Peekable<TrafficSource>,
    // issue cycles of reads still waiting, per address
    inflight: HashMap<u64, VecDeque<Cycle>>,
    report: DriverReport,
}

impl TrafficDriver {
    pub fn new(source: TrafficSource) -> Self {
        Self {
            source: source.peekable(),
            inflight: HashMap::new(),
            report: DriverReport {
                cycles: 0,
                warmed: 0,
                issued_reads: 0,
                issued_writes: 0,
                completed_reads: 0,
                rejected: 0,
                read_latency: Histogram::new(),
            },
        }
    }

    pub fn report(&self) -> &DriverReport {
        &self.report
    }

    // Replays the first `count` accesses untimed, then clears every counter.
    pub fn warm_up(&mut self, top: &mut CadCache, count: u64) {
        for access in self.source.by_ref().take(count as usize) {
            top.warm_up(access.addr, access.op.is_store());
            self.report.warmed += 1;
        }
        top.reset_stats();
        info!("warmed up with {} accesses", self.report.warmed);
    }

    fn try_issue(&mut self, top: &mut CadCache) {
        let now = top.clk();
        let Some(access) = self.source.peek().copied() else {
            return;
        };
        if access.cycle.is_some_and(|at| at > now) {
            return;
        }
        if !top.add_transaction(access.addr, access.op.is_store()) {
            self.report.rejected += 1;
            return;
        }
        self.source.next();
        self.record_issue(access, now);
    }

    fn record_issue(&mut self, access: Access, now: Cycle) {
        if access.op.is_store() {
            self.report.issued_writes += 1;
        } else {
            self.report.issued_reads += 1;
            self.inflight.entry(access.addr).or_default().push_back(now);
        }
    }

    fn collect(&mut self, top: &mut CadCache) {
        let now = top.clk();
        while let Some(resp) = top.pop_response() {
            if resp.is_write {
                continue;
            }
            let issued = self
                .inflight
                .get_mut(&resp.addr)
                .and_then(|waiting| waiting.pop_front())
                .unwrap_or_else(|| panic!("response for {:#x} that was never requested", resp.addr));
            if self.inflight.get(&resp.addr).is_some_and(|w| w.is_empty()) {
                self.inflight.remove(&resp.addr);
            }
            self.report.read_latency.sample(now - issued);
            self.report.completed_reads += 1;
        }
    }

    pub fn step(&mut self, top: &mut CadCache) {
        self.try_issue(top);
        top.clock_tick();
        self.collect(top);
    }

    pub fn finished(&mut self, top: &CadCache) -> bool {
        self.source.peek().is_none() && self.inflight.is_empty() && top.is_idle()
    }

    // Runs for `sim.cycles` cycles or until the source is exhausted and drained.
    pub fn run(
        &mut self,
        top: &mut CadCache,
        sim: &SimConfig,
        mut log: Option<&mut StatsLog>,
    ) -> Result<DriverReport> {
        if sim.warmup > 0 {
            self.warm_up(top, sim.warmup);
        }
        let start = top.clk();
        while top.clk() - start < sim.cycles {
            self.step(top);
            if sim.stats_interval > 0 && (top.clk() - start) % sim.stats_interval == 0 {
                if let Some(log) = log.as_deref_mut() {
                    log.write(top)?;
                }
            }
            if self.finished(top) {
                debug!("traffic drained at {}", top.clk());
                break;
            }
        }
        self.report.cycles = top.clk() - start;
        info!(
            "{} cycles, {} reads ({} done), {} writes, avg read latency {:.2}",
            self.report.cycles,
            self.report.issued_reads,
            self.report.completed_reads,
            self.report.issued_writes,
            self.report.average_read_latency()
        );
        Ok(self.report.clone())
    }
}
