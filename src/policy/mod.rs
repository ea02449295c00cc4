use std::io::{self, Write};

use serde_json::{json, Value};

use crate::mem::dram::DramSystem;
use crate::mem::request::RemoteRequest;
use crate::sim::config::{CacheConfig, CachePolicyKind};
use crate::timeq::Cycle;

pub mod direct_map;
pub mod dummy;
pub mod frontend;
pub mod kona;
pub mod our;
pub mod stats;
pub mod tag;
pub mod tracker;

#[cfg(test)]
mod tests;

pub use direct_map::DirectMap;
pub use dummy::Dummy;
pub use frontend::FrontEndCore;
pub use kona::Kona;
pub use our::Our;
pub use stats::{FrontEndStats, Histogram};
pub use tag::Tag;
pub use tracker::Tracker;

// Which tag array a line lives in.  Only the adaptive policy uses `Block`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Region {
    Main,
    Block,
}

// Stable handle to one physical line owned by a policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LineRef {
    pub region: Region,
    pub index: usize,
}

impl LineRef {
    pub fn main(index: usize) -> Self {
        Self {
            region: Region::Main,
            index,
        }
    }

    pub fn block(index: usize) -> Self {
        Self {
            region: Region::Block,
            index,
        }
    }
}

// Outcome of probing policy-private buffers on a tag miss.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferProbe {
    Miss,
    // data is already held by the policy, answer as a hit
    Hit,
    // data is on its way, wait on the MSHR entry keyed by the address
    Merge(u64),
}

// The hooks a placement policy plugs into the shared front end.
pub trait PlacementPolicy {
    fn name(&self) -> String;

    fn tracker(&self) -> &Tracker;

    // Line size used to align warm-up installs.
    fn granularity(&self) -> u64;

    fn line(&self, line: LineRef) -> &Tag;

    fn line_mut(&mut self, line: LineRef) -> &mut Tag;

    // Cache DRAM address of the first byte of `line`.
    fn line_base(&self, line: LineRef) -> u64;

    // Tag lookup without timing side effects.
    fn lookup(&self, hex_addr: u64) -> Option<LineRef>;

    fn hex_tag(&self, remote_addr: u64) -> u64;

    // Choose the slot a fill from `remote_addr` lands in.
    fn alloc_line(&mut self, remote_addr: u64) -> LineRef;

    fn miss_handler(&mut self, core: &mut FrontEndCore, hex_addr: u64, is_write: bool);

    // Send the dirty part of `victim`, which lived at `cache_addr`, back to the pool.
    fn write_back_data(&mut self, core: &mut FrontEndCore, victim: &Tag, cache_addr: u64);

    // Cache DRAM reads issued by the policy itself.  False means nobody was waiting.
    fn hash_read_callback(&mut self, _core: &mut FrontEndCore, _addr: u64) -> bool {
        false
    }

    fn check_other_buffer(&mut self, _core: &mut FrontEndCore, _hex_addr: u64, _is_write: bool) -> BufferProbe {
        BufferProbe::Miss
    }

    fn drained(&mut self, core: &mut FrontEndCore) {
        core.drain_step(self);
    }

    fn refill(&mut self, core: &mut FrontEndCore, req: RemoteRequest) {
        let line = self.alloc_line(req.hex_addr);
        core.do_refill(self, req.hex_addr, line);
    }

    fn warm_up(&mut self, core: &mut FrontEndCore, hex_addr: u64, is_write: bool) {
        core.warm_up(self, hex_addr, is_write);
    }

    fn write_stats(&self, _out: &mut dyn Write) -> io::Result<()> {
        Ok(())
    }

    fn summary(&self) -> Value {
        Value::Null
    }

    fn reset_stats(&mut self) {}

    // No policy-private request is queued or in flight.
    fn is_idle(&self) -> bool {
        true
    }
}

// Closed set of policies; the front end dispatches with a match instead of a vtable.
pub enum Policy {
    Dummy(Dummy),
    DirectMap(DirectMap),
    Kona(Kona),
    Our(Box<Our>),
}

macro_rules! with_policy {
    ($policy:expr, $p:ident => $body:expr) => {
        match $policy {
            Policy::Dummy($p) => $body,
            Policy::DirectMap($p) => $body,
            Policy::Kona($p) => $body,
            Policy::Our($p) => {
                let $p = $p.as_mut();
                $body
            }
        }
    };
}

macro_rules! with_policy_ref {
    ($policy:expr, $p:ident => $body:expr) => {
        match $policy {
            Policy::Dummy($p) => $body,
            Policy::DirectMap($p) => $body,
            Policy::Kona($p) => $body,
            Policy::Our($p) => {
                let $p = $p.as_ref();
                $body
            }
        }
    };
}

impl Policy {
    pub fn new(config: &CacheConfig) -> Self {
        match config.cache_policy {
            CachePolicyKind::Dummy => Policy::Dummy(Dummy::new()),
            CachePolicyKind::DirectMapped => Policy::DirectMap(DirectMap::new(config)),
            CachePolicyKind::Kona => Policy::Kona(Kona::new(config)),
            CachePolicyKind::Our => Policy::Our(Box::new(Our::new(config))),
        }
    }

    pub fn name(&self) -> String {
        with_policy_ref!(self, p => p.name())
    }

    pub fn as_our(&self) -> Option<&Our> {
        match self {
            Policy::Our(p) => Some(p.as_ref()),
            _ => None,
        }
    }
}

// Cache controller: the shared front end plus the selected placement policy.
pub struct CacheFrontEnd {
    core: FrontEndCore,
    policy: Policy,
}

impl CacheFrontEnd {
    pub fn new(config: &CacheConfig, dram: Box<dyn DramSystem>) -> Self {
        Self {
            core: FrontEndCore::new(config, dram),
            policy: Policy::new(config),
        }
    }

    pub fn core(&self) -> &FrontEndCore {
        &self.core
    }

    pub fn policy(&self) -> &Policy {
        &self.policy
    }

    pub fn clk(&self) -> Cycle {
        self.core.clk()
    }

    pub fn will_accept_transaction(&self) -> bool {
        self.core.will_accept_transaction()
    }

    pub fn add_transaction(&mut self, hex_addr: u64, is_write: bool) -> bool {
        self.core.add_transaction(hex_addr, is_write)
    }

    // One controller step.
    pub fn drained(&mut self) {
        with_policy!(&mut self.policy, p => p.drained(&mut self.core))
    }

    // A remote read came back.
    pub fn refill(&mut self, req: RemoteRequest) {
        with_policy!(&mut self.policy, p => p.refill(&mut self.core, req))
    }

    pub fn clock_tick(&mut self) {
        with_policy!(&mut self.policy, p => self.core.clock_tick(p))
    }

    pub fn warm_up(&mut self, hex_addr: u64, is_write: bool) {
        with_policy!(&mut self.policy, p => p.warm_up(&mut self.core, hex_addr, is_write))
    }

    pub fn pop_remote(&mut self) -> Option<RemoteRequest> {
        self.core.pop_remote()
    }

    pub fn unpop_remote(&mut self, req: RemoteRequest) {
        self.core.unpop_remote(req)
    }

    pub fn pop_response(&mut self) -> Option<u64> {
        self.core.pop_response()
    }

    pub fn is_resident(&self, hex_addr: u64) -> bool {
        with_policy_ref!(&self.policy, p => p.lookup(hex_addr).is_some())
    }

    pub fn stats(&self) -> &FrontEndStats {
        self.core.stats()
    }

    pub fn is_idle(&self) -> bool {
        self.core.is_quiet() && with_policy_ref!(&self.policy, p => p.is_idle())
    }

    pub fn reset_stats(&mut self) {
        self.core.reset_stats();
        with_policy!(&mut self.policy, p => p.reset_stats())
    }

    pub fn write_stats(&self, out: &mut dyn Write) -> io::Result<()> {
        with_policy_ref!(&self.policy, p => p.write_stats(out))?;
        let stats = self.core.stats();
        writeln!(out, "# hit: {}", stats.hits)?;
        writeln!(out, "# miss: {}", stats.misses)?;
        writeln!(out, "# hit in write back buffer: {}", stats.wb_hits)?;
        writeln!(out, "# hit in other buffer: {}", stats.other_buffer_hits)?;
        writeln!(out, "# remote fetches: {} ({} flits)", stats.remote_fetches, stats.remote_fetch_flits)?;
        writeln!(
            out,
            "# remote write backs: {} ({} flits)",
            stats.remote_writebacks, stats.remote_writeback_flits
        )?;
        writeln!(out, "# cache line utilization")?;
        stats.line_utility.write_to(out)?;
        writeln!(out, "# cache line utilization at eviction")?;
        stats.eviction_utility.write_to(out)?;
        writeln!(out, "# waiting reqs in MSHR")?;
        stats.mshr_waiting.write_to(out)
    }

    pub fn summary(&self) -> Value {
        let policy_stats = with_policy_ref!(&self.policy, p => p.summary());
        json!({
            "policy": self.policy.name(),
            "frontend": self.core.stats(),
            "cache_dram": self.core.dram().stats(),
            "policy_stats": policy_stats,
        })
    }
}
