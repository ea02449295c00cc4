use std::collections::VecDeque;

use log::trace;
use serde::Serialize;

use crate::base::behavior::ModuleBehaviors;
use crate::mem::request::FLIT_BYTES;
use crate::sim::config::DramConfig;
use crate::timeq::{Cycle, ServerConfig, ServiceRequest, TimedServer};

// Completion of one 64B access, delivered to whoever owns the DRAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DramCompletion {
    pub addr: u64,
    pub is_write: bool,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DramStats {
    reads: u64,
    writes: u64,
    rejects: u64,
    completed: u64,
    total_latency: u64,
    max_latency: u64,
}

impl DramStats {
    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn rejects(&self) -> u64 {
        self.rejects
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn average_latency(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.total_latency as f64 / self.completed as f64
    }

    fn record_issue(&mut self, is_write: bool) {
        if is_write {
            self.writes = self.writes.saturating_add(1);
        } else {
            self.reads = self.reads.saturating_add(1);
        }
    }

    fn record_reject(&mut self) {
        self.rejects = self.rejects.saturating_add(1);
    }

    fn record_completion(&mut self, latency: Cycle) {
        self.completed = self.completed.saturating_add(1);
        self.total_latency = self.total_latency.saturating_add(latency);
        self.max_latency = self.max_latency.max(latency);
    }
}

// The contract the cache and the pool expect from a DRAM timing model.  Completions are queued
// by address and drained by the owner after every clock.
pub trait DramSystem {
    fn will_accept_transaction(&self, addr: u64, is_write: bool) -> bool;
    fn add_transaction(&mut self, addr: u64, is_write: bool) -> bool;
    fn clock_tick(&mut self);
    fn pop_completion(&mut self) -> Option<DramCompletion>;
    fn clk(&self) -> Cycle;
    fn stats(&self) -> DramStats;
    fn reset_stats(&mut self);
}

// Address-interleaved banks, each a fixed-latency timed server.
#[derive(Debug)]
pub struct SimpleDram {
    clk: Cycle,
    banks: Vec<TimedServer<DramCompletion>>,
    completions: VecDeque<DramCompletion>,
    stats: DramStats,
}

impl SimpleDram {
    pub fn new(config: &DramConfig) -> Self {
        let server = ServerConfig {
            base_latency: config.latency,
            bytes_per_cycle: config.bytes_per_cycle,
            queue_capacity: config.queue_capacity,
        };
        Self {
            clk: 0,
            banks: (0..config.banks.max(1))
                .map(|_| TimedServer::new(server))
                .collect(),
            completions: VecDeque::new(),
            stats: DramStats::default(),
        }
    }

    fn bank_of(&self, addr: u64) -> usize {
        ((addr / FLIT_BYTES) % self.banks.len() as u64) as usize
    }

    pub fn outstanding(&self) -> usize {
        self.banks.iter().map(|bank| bank.len()).sum()
    }
}

impl DramSystem for SimpleDram {
    fn will_accept_transaction(&self, addr: u64, _is_write: bool) -> bool {
        !self.banks[self.bank_of(addr)].is_full()
    }

    fn add_transaction(&mut self, addr: u64, is_write: bool) -> bool {
        let bank = self.bank_of(addr);
        let request = ServiceRequest::new(DramCompletion { addr, is_write }, FLIT_BYTES as u32);
        match self.banks[bank].try_enqueue(self.clk, request) {
            Ok(ticket) => {
                trace!(
                    "dram {} {:#x} bank {} ready at {}",
                    if is_write { "W" } else { "R" },
                    addr,
                    bank,
                    ticket.ready_at()
                );
                self.stats.record_issue(is_write);
                true
            }
            Err(_) => {
                self.stats.record_reject();
                false
            }
        }
    }

    fn clock_tick(&mut self) {
        self.clk += 1;
        let now = self.clk;
        for bank in self.banks.iter_mut() {
            bank.service_ready(now, |result| {
                self.stats
                    .record_completion(now - result.ticket.issued_at());
                self.completions.push_back(result.payload);
            });
        }
    }

    fn pop_completion(&mut self) -> Option<DramCompletion> {
        self.completions.pop_front()
    }

    fn clk(&self) -> Cycle {
        self.clk
    }

    fn stats(&self) -> DramStats {
        self.stats
    }

    fn reset_stats(&mut self) {
        self.stats = DramStats::default();
    }
}

impl ModuleBehaviors for SimpleDram {
    fn tick_one(&mut self) {
        self.clock_tick();
    }

    fn reset(&mut self) {
        self.reset_stats();
    }
}
