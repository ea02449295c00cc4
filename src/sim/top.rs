use std::collections::VecDeque;
use std::io::{self, Write};
use std::path::Path;

use anyhow::Result;
use log::{debug, info};
use serde_json::{json, Value};

use crate::base::behavior::ModuleBehaviors;
use crate::mem::dram::{DramSystem, SimpleDram};
use crate::mem::ethernet::Ethernet;
use crate::mem::pool::MemoryPool;
use crate::mem::request::RemoteRequest;
use crate::policy::CacheFrontEnd;
use crate::sim::config::{CacheConfig, DramConfig};
use crate::sim::perf_log;
use crate::timeq::Cycle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Response {
    pub addr: u64,
    pub is_write: bool,
}

// The whole hierarchy: cache front end with its local DRAM, both link directions and the pool.
pub struct CadCache {
    frontend: CacheFrontEnd,
    egress: Ethernet<RemoteRequest>,
    ingress: Ethernet<RemoteRequest>,
    pool: MemoryPool,
    // completed reads the ingress link could not take yet
    returning: VecDeque<RemoteRequest>,
    write_acks: VecDeque<(u64, Cycle)>,
    responses: VecDeque<Response>,
}

impl CadCache {
    pub fn new(cache: &CacheConfig, local: &DramConfig, remote: &DramConfig) -> Self {
        let latency = cache.remote_latency();
        let egress_latency = latency / 2;
        let frontend = CacheFrontEnd::new(cache, Box::new(SimpleDram::new(local)));
        info!(
            "{}: {} lines of {}B, remote latency {} cycles, link {}B/cycle",
            frontend.policy().name(),
            cache.cache_lines(),
            cache.granularity,
            latency,
            cache.bw
        );
        Self {
            frontend,
            egress: Ethernet::new("egress", egress_latency, cache.bw, cache.link_queue_capacity),
            ingress: Ethernet::new(
                "ingress",
                latency - egress_latency,
                cache.bw,
                cache.link_queue_capacity,
            ),
            pool: MemoryPool::new(SimpleDram::new(remote)),
            returning: VecDeque::new(),
            write_acks: VecDeque::new(),
            responses: VecDeque::new(),
        }
    }

    pub fn frontend(&self) -> &CacheFrontEnd {
        &self.frontend
    }

    pub fn pool(&self) -> &MemoryPool {
        &self.pool
    }

    pub fn clk(&self) -> Cycle {
        self.frontend.clk()
    }

    pub fn will_accept_transaction(&self) -> bool {
        self.frontend.will_accept_transaction()
    }

    pub fn add_transaction(&mut self, hex_addr: u64, is_write: bool) -> bool {
        if !self.frontend.add_transaction(hex_addr, is_write) {
            return false;
        }
        if is_write {
            self.write_acks.push_back((hex_addr, self.clk() + 1));
        }
        true
    }

    // Untimed install, used before measurement starts.
    pub fn warm_up(&mut self, hex_addr: u64, is_write: bool) {
        self.frontend.warm_up(hex_addr, is_write);
    }

    pub fn clock_tick(&mut self) {
        self.frontend.drained();
        let now = self.clk();

        while let Some(req) = self.frontend.pop_remote() {
            if let Err(req) = self.egress.try_send(now, req, req.egress_bytes()) {
                self.frontend.unpop_remote(req);
                break;
            }
        }

        while let Some(req) = self.egress.pop_ready(now) {
            self.pool.add_transaction(req);
        }

        self.pool.clock_tick();
        while let Some(req) = self.pool.pop_completion() {
            self.returning.push_back(req);
        }
        while let Some(req) = self.returning.pop_front() {
            if let Err(req) = self.ingress.try_send(now, req, req.ingress_bytes()) {
                self.returning.push_front(req);
                break;
            }
        }

        while let Some(req) = self.ingress.pop_ready(now) {
            debug!("refill {:#x} x{} at {}", req.hex_addr, req.sz, now);
            self.frontend.refill(req);
        }

        self.frontend.clock_tick();

        while let Some(addr) = self.frontend.pop_response() {
            self.responses.push_back(Response {
                addr,
                is_write: false,
            });
        }
        let now = self.clk();
        while self.write_acks.front().is_some_and(|(_, at)| *at <= now) {
            if let Some((addr, _)) = self.write_acks.pop_front() {
                self.responses.push_back(Response {
                    addr,
                    is_write: true,
                });
            }
        }
    }

    pub fn pop_response(&mut self) -> Option<Response> {
        self.responses.pop_front()
    }

    // Nothing queued or in flight anywhere in the hierarchy.
    pub fn is_idle(&self) -> bool {
        self.frontend.is_idle()
            && self.egress.in_flight() == 0
            && self.ingress.in_flight() == 0
            && self.pool.outstanding() == 0
            && self.returning.is_empty()
            && self.write_acks.is_empty()
            && self.responses.is_empty()
    }

    pub fn reset_stats(&mut self) {
        self.frontend.reset_stats();
        self.egress.reset_stats();
        self.ingress.reset_stats();
        self.pool.reset_stats();
    }

    pub fn write_stats(&self, out: &mut dyn Write) -> io::Result<()> {
        self.frontend.write_stats(out)?;
        for (name, link) in [("egress", &self.egress), ("ingress", &self.ingress)] {
            let s = link.stats();
            writeln!(
                out,
                "# {name}: {} sent, {} bytes, {} stalls",
                s.sent(),
                s.bytes(),
                s.stalls()
            )?;
        }
        let pool = self.pool.stats();
        writeln!(
            out,
            "# pool: {} reads, {} writes, {} flits",
            pool.reads(),
            pool.writes(),
            pool.flits()
        )
    }

    pub fn summary(&self) -> Value {
        json!({
            "cycles": self.clk(),
            "cache": self.frontend.summary(),
            "egress": self.egress.stats(),
            "ingress": self.ingress.stats(),
            "pool": self.pool.stats(),
            "pool_media": self.pool.media().stats(),
        })
    }

    pub fn print_stats(&self, dir: &Path) -> Result<()> {
        perf_log::write_report(dir, self)
    }
}

impl ModuleBehaviors for CadCache {
    fn tick_one(&mut self) {
        self.clock_tick();
    }

    fn reset(&mut self) {
        self.reset_stats();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::config::CachePolicyKind;

    fn top(kind: CachePolicyKind) -> CadCache {
        let cache = CacheConfig {
            granularity: 4096,
            working_set_bytes: 16 * 4096,
            ratio: 1.0,
            rtt_ns: 100.0,
            tck_ns: 1.0,
            cache_policy: kind,
            ..CacheConfig::default()
        };
        CadCache::new(&cache, &DramConfig::default(), &DramConfig::default())
    }

    fn wait_for(top: &mut CadCache, addr: u64, is_write: bool) -> Cycle {
        let start = top.clk();
        for _ in 0..10_000 {
            top.clock_tick();
            while let Some(resp) = top.pop_response() {
                if resp == (Response { addr, is_write }) {
                    return top.clk() - start;
                }
            }
        }
        panic!("no response for {addr:#x}");
    }

    #[test]
    fn write_is_acknowledged_next_cycle() {
        let mut top = top(CachePolicyKind::DirectMapped);
        assert!(top.add_transaction(0x40, true));
        assert_eq!(wait_for(&mut top, 0x40, true), 1);
    }

    #[test]
    fn miss_pays_round_trip_then_hits_locally() {
        let mut top = top(CachePolicyKind::DirectMapped);
        assert!(top.add_transaction(0x1000, false));
        let miss = wait_for(&mut top, 0x1000, false);
        assert!(miss >= 100, "miss took {miss}");

        top.tick(2_000);
        assert!(top.add_transaction(0x1040, false));
        let hit = wait_for(&mut top, 0x1040, false);
        assert!(hit < miss);
        assert_eq!(top.frontend().stats().hits, 1);
    }

    #[test]
    fn every_policy_drains_to_idle() {
        for kind in [
            CachePolicyKind::Dummy,
            CachePolicyKind::DirectMapped,
            CachePolicyKind::Kona,
            CachePolicyKind::Our,
        ] {
            let mut top = top(kind);
            for i in 0..32u64 {
                while !top.add_transaction(i * 1088, i % 3 == 0) {
                    top.clock_tick();
                }
            }
            let mut reads = 0;
            for _ in 0..50_000 {
                top.clock_tick();
                while let Some(resp) = top.pop_response() {
                    reads += usize::from(!resp.is_write);
                }
                if top.is_idle() {
                    break;
                }
            }
            assert!(top.is_idle(), "{kind:?}");
            assert_eq!(reads, 21, "{kind:?}");
        }
    }

    #[test]
    fn reset_clears_link_and_pool_counters() {
        let mut top = top(CachePolicyKind::DirectMapped);
        top.add_transaction(0, false);
        wait_for(&mut top, 0, false);
        top.reset();
        assert_eq!(top.pool().stats().reads(), 0);
        assert_eq!(top.frontend().stats().misses, 0);
    }
}
