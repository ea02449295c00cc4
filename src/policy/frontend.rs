use std::collections::{BTreeMap, HashMap, VecDeque};

use log::{debug, trace};
use smallvec::SmallVec;

use crate::mem::dram::DramSystem;
use crate::mem::request::{RemoteRequest, Transaction, FLIT_BYTES};
use crate::policy::stats::FrontEndStats;
use crate::policy::tag::Tag;
use crate::policy::{BufferProbe, LineRef, PlacementPolicy};
use crate::sim::config::CacheConfig;
use crate::timeq::Cycle;

pub type MshrList = SmallVec<[Transaction; 4]>;

// A dirty victim whose old data is being read out of the cache DRAM before the new fill may be
// written over it.
#[derive(Debug, Clone, Copy)]
struct WriteBackEntry {
    victim: Tag,
    remaining: u64,
    fill_granularity: u64,
}

// Policy-independent half of the cache controller: queues, MSHRs, the write-back buffer and the
// refill machinery.  Policies drive it through `process_one_req` and `do_refill`.
pub struct FrontEndCore {
    latency: Cycle,
    front_q_capacity: usize,
    mshr_capacity: usize,
    pub(crate) front_q: VecDeque<Transaction>,
    lsq: VecDeque<RemoteRequest>,
    resp: VecDeque<(u64, Cycle)>,
    dram: Box<dyn DramSystem>,
    // flit address in the cache DRAM -> local addresses waiting for that read
    pending_req_to_cache: HashMap<u64, VecDeque<u64>>,
    refill_req_to_cache: VecDeque<Transaction>,
    refill_buffer: Vec<u64>,
    write_back_buffer: BTreeMap<u64, WriteBackEntry>,
    mshrs: BTreeMap<u64, MshrList>,
    mshr_occupancy: usize,
    stats: FrontEndStats,
}

impl FrontEndCore {
    pub fn new(config: &CacheConfig, dram: Box<dyn DramSystem>) -> Self {
        Self {
            latency: config.response_latency,
            front_q_capacity: config.front_queue_capacity,
            mshr_capacity: config.mshr_capacity,
            front_q: VecDeque::with_capacity(config.front_queue_capacity),
            lsq: VecDeque::new(),
            resp: VecDeque::new(),
            dram,
            pending_req_to_cache: HashMap::new(),
            refill_req_to_cache: VecDeque::new(),
            refill_buffer: Vec::new(),
            write_back_buffer: BTreeMap::new(),
            mshrs: BTreeMap::new(),
            mshr_occupancy: 0,
            stats: FrontEndStats::new(config.granularity, config.mshr_capacity),
        }
    }

    pub fn clk(&self) -> Cycle {
        self.dram.clk()
    }

    pub fn latency(&self) -> Cycle {
        self.latency
    }

    pub fn will_accept_transaction(&self) -> bool {
        self.front_q.len() < self.front_q_capacity
    }

    pub fn add_transaction(&mut self, hex_addr: u64, is_write: bool) -> bool {
        if !self.will_accept_transaction() {
            self.stats.rejected = self.stats.rejected.saturating_add(1);
            return false;
        }
        self.front_q.push_back(Transaction::new(hex_addr, is_write));
        self.stats.accepted = self.stats.accepted.saturating_add(1);
        true
    }

    pub fn front_len(&self) -> usize {
        self.front_q.len()
    }

    // Queue a request for the egress link.
    pub fn send_remote(&mut self, req: RemoteRequest) {
        trace!(
            "{} remote {:#x} x{} at {}",
            if req.is_write { "write back" } else { "fetch" },
            req.hex_addr,
            req.sz,
            self.clk()
        );
        if req.is_write {
            self.stats.remote_writebacks = self.stats.remote_writebacks.saturating_add(1);
            self.stats.remote_writeback_flits =
                self.stats.remote_writeback_flits.saturating_add(req.sz as u64);
        } else {
            self.stats.remote_fetches = self.stats.remote_fetches.saturating_add(1);
            self.stats.remote_fetch_flits =
                self.stats.remote_fetch_flits.saturating_add(req.sz as u64);
        }
        self.lsq.push_back(req);
    }

    pub fn pop_remote(&mut self) -> Option<RemoteRequest> {
        self.lsq.pop_front()
    }

    // Put back a request the link could not take this cycle.
    pub fn unpop_remote(&mut self, req: RemoteRequest) {
        self.lsq.push_front(req);
    }

    pub fn lsq_len(&self) -> usize {
        self.lsq.len()
    }

    pub fn respond(&mut self, hex_addr: u64, at: Cycle) {
        self.resp.push_back((hex_addr, at));
    }

    pub fn pop_response(&mut self) -> Option<u64> {
        let (addr, at) = *self.resp.front()?;
        if self.clk() < at {
            return None;
        }
        self.resp.pop_front();
        Some(addr)
    }

    pub fn mshr_occupancy(&self) -> usize {
        self.mshr_occupancy
    }

    pub fn mshr_capacity(&self) -> usize {
        self.mshr_capacity
    }

    pub fn mshr_entries(&self) -> usize {
        self.mshrs.len()
    }

    pub fn has_mshr(&self, key: u64) -> bool {
        self.mshrs.contains_key(&key)
    }

    pub fn mshr_waiters(&self, key: u64) -> Option<&MshrList> {
        self.mshrs.get(&key)
    }

    // Append to an existing entry, or create it.  Returns true when the entry is new.
    pub fn mshr_merge(&mut self, key: u64, txn: Transaction) -> bool {
        match self.mshrs.get_mut(&key) {
            Some(list) => {
                list.push(txn);
                false
            }
            None => {
                self.mshrs.insert(key, SmallVec::from_elem(txn, 1));
                true
            }
        }
    }

    pub fn mshr_insert(&mut self, key: u64, waiters: MshrList) {
        self.mshrs.insert(key, waiters);
    }

    pub fn mshr_take(&mut self, key: u64) -> Option<MshrList> {
        self.mshrs.remove(&key)
    }

    // Remove every entry whose key lies in `lo..hi`.
    pub fn mshr_remove_range(&mut self, lo: u64, hi: u64) -> Vec<(u64, MshrList)> {
        let keys: Vec<u64> = self.mshrs.range(lo..hi).map(|(key, _)| *key).collect();
        keys.into_iter()
            .filter_map(|key| self.mshrs.remove(&key).map(|list| (key, list)))
            .collect()
    }

    pub fn dram_will_accept(&self, addr: u64, is_write: bool) -> bool {
        self.dram.will_accept_transaction(addr, is_write)
    }

    pub fn dram_add(&mut self, addr: u64, is_write: bool) -> bool {
        self.dram.add_transaction(addr, is_write)
    }

    pub fn dram(&self) -> &dyn DramSystem {
        self.dram.as_ref()
    }

    pub fn dram_mut(&mut self) -> &mut dyn DramSystem {
        self.dram.as_mut()
    }

    pub fn stats(&self) -> &FrontEndStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut FrontEndStats {
        &mut self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats.reset();
        self.dram.reset_stats();
    }

    pub fn write_back_pending(&self) -> usize {
        self.write_back_buffer.len()
    }

    pub fn refill_backlog(&self) -> usize {
        self.refill_req_to_cache.len()
    }

    // Nothing queued, outstanding or waiting to be answered.
    pub fn is_quiet(&self) -> bool {
        self.front_q.is_empty()
            && self.lsq.is_empty()
            && self.resp.is_empty()
            && self.pending_req_to_cache.is_empty()
            && self.refill_req_to_cache.is_empty()
            && self.write_back_buffer.is_empty()
            && self.mshrs.is_empty()
    }

    // One front-queue request per cycle, then one refill write.
    pub fn drain_step<P: PlacementPolicy + ?Sized>(&mut self, policy: &mut P) {
        if let Some(txn) = self.front_q.front().copied() {
            let hit = policy.lookup(txn.addr);
            if self.process_one_req(policy, txn.addr, txn.is_write, hit) {
                self.front_q.pop_front();
            }
        }
        self.process_refill_req();
    }

    // Returns false when the request has to be retried on a later cycle.
    pub fn process_one_req<P: PlacementPolicy + ?Sized>(
        &mut self,
        policy: &mut P,
        hex_addr: u64,
        is_write: bool,
        hit: Option<LineRef>,
    ) -> bool {
        let tracker = *policy.tracker();
        let now = self.clk();

        // a lookup result can go stale while it waits, so check it again here
        let hit = hit.filter(|line| {
            tracker.test_hit(policy.line(*line), hex_addr, policy.line_base(*line))
        });
        if let Some(line) = hit {
            let base = policy.line_base(line);
            let granularity = policy.line(line).granularity;
            let flit = (base + (hex_addr & (granularity - 1))) / FLIT_BYTES * FLIT_BYTES;

            let buffered = self.refill_buffer.contains(&base)
                || self.refill_req_to_cache.iter().any(|txn| txn.addr == flit);
            if buffered {
                if !is_write {
                    self.respond(hex_addr, now + self.latency);
                }
            } else {
                if !self.dram.will_accept_transaction(flit, is_write)
                    || !self.dram.add_transaction(flit, is_write)
                {
                    return false;
                }
                if !is_write {
                    self.pending_req_to_cache
                        .entry(flit)
                        .or_default()
                        .push_back(hex_addr);
                }
            }

            let t = policy.line_mut(line);
            self.stats.record_hit(t.utilized());
            tracker.add_transaction(hex_addr, is_write, t);
            return true;
        }

        // line is mid-eviction, serve it from the buffered copy
        if let Some(entry) = self
            .write_back_buffer
            .iter_mut()
            .find(|(base, entry)| tracker.test_hit(&entry.victim, hex_addr, **base))
            .map(|(_, entry)| entry)
        {
            tracker.add_transaction(hex_addr, is_write, &mut entry.victim);
            self.stats.wb_hits = self.stats.wb_hits.saturating_add(1);
            if !is_write {
                self.respond(hex_addr, now + self.latency);
            }
            return true;
        }

        match policy.check_other_buffer(self, hex_addr, is_write) {
            BufferProbe::Hit => {
                self.stats.other_buffer_hits = self.stats.other_buffer_hits.saturating_add(1);
                if !is_write {
                    self.respond(hex_addr, now + self.latency);
                }
                return true;
            }
            BufferProbe::Merge(key) => {
                if self.mshr_occupancy >= self.mshr_capacity {
                    self.stats.mshr_full_stalls = self.stats.mshr_full_stalls.saturating_add(1);
                    return false;
                }
                self.mshr_occupancy += 1;
                self.mshr_merge(key, Transaction::new(hex_addr, is_write));
                self.stats.record_miss();
                return true;
            }
            BufferProbe::Miss => {}
        }

        if self.mshr_occupancy >= self.mshr_capacity {
            self.stats.mshr_full_stalls = self.stats.mshr_full_stalls.saturating_add(1);
            return false;
        }
        self.mshr_occupancy += 1;
        policy.miss_handler(self, hex_addr, is_write);
        self.stats.record_miss();
        true
    }

    // Issue the oldest cache-DRAM write/drain read, unless a read to the same flit is still in
    // flight (WAR/RAR order).
    pub fn process_refill_req(&mut self) {
        let Some(front) = self.refill_req_to_cache.front().copied() else {
            return;
        };
        if self.pending_req_to_cache.contains_key(&front.addr) {
            return;
        }
        if self.dram.will_accept_transaction(front.addr, front.is_write)
            && self.dram.add_transaction(front.addr, front.is_write)
        {
            self.refill_req_to_cache.pop_front();
        }
    }

    // Install the line fetched from `remote_addr` into `line`, evicting whatever is there.
    pub fn do_refill<P: PlacementPolicy + ?Sized>(
        &mut self,
        policy: &mut P,
        remote_addr: u64,
        line: LineRef,
    ) {
        let waiters = self.mshrs.remove(&remote_addr).unwrap_or_default();
        self.mshr_occupancy = self
            .mshr_occupancy
            .checked_sub(waiters.len())
            .unwrap_or_else(|| panic!("mshr occupancy underflow refilling {remote_addr:#x}"));

        let tracker = *policy.tracker();
        let tag = policy.hex_tag(remote_addr);
        let base = policy.line_base(line);
        let victim = *policy.line(line);
        let granularity = victim.granularity;
        let refill_buffer_miss = !self.refill_buffer.contains(&base);
        let old_dirty = victim.valid && victim.dirty();

        self.stats.refills = self.stats.refills.saturating_add(1);
        if victim.valid {
            self.stats.eviction_utility.sample(victim.utilized());
        }

        // new data parked in the refill buffer, old data can go straight out
        if !refill_buffer_miss && old_dirty {
            policy.write_back_data(self, &victim, base);
        }

        if old_dirty && refill_buffer_miss {
            debug!("refill {remote_addr:#x}: draining dirty victim at {base:#x}");
            for offset in (0..granularity).step_by(FLIT_BYTES as usize) {
                self.refill_req_to_cache
                    .push_back(Transaction::read(base + offset));
            }
            self.write_back_buffer.insert(
                base,
                WriteBackEntry {
                    victim,
                    remaining: granularity / FLIT_BYTES,
                    fill_granularity: granularity,
                },
            );
            self.refill_buffer.push(base);
        }

        if !old_dirty && refill_buffer_miss {
            for offset in (0..granularity).step_by(FLIT_BYTES as usize) {
                self.refill_req_to_cache
                    .push_back(Transaction::write(base + offset));
            }
        }

        self.stats.mshr_waiting.sample(waiters.len() as u64);
        let now = self.clk();
        let t = policy.line_mut(line);
        tracker.reset_tag(t, tag);
        for txn in waiters.iter() {
            if !txn.is_write {
                self.resp.push_back((txn.addr, now + 1));
            }
            tracker.add_transaction(txn.addr, txn.is_write, t);
        }
    }

    // Completion of a cache-DRAM read.
    pub fn cache_read_callback<P: PlacementPolicy + ?Sized>(&mut self, policy: &mut P, addr: u64) {
        let now = self.clk();
        if let Some(waiters) = self.pending_req_to_cache.get_mut(&addr) {
            let hex_addr = waiters.pop_front();
            if waiters.is_empty() {
                self.pending_req_to_cache.remove(&addr);
            }
            if let Some(hex_addr) = hex_addr {
                self.resp.push_back((hex_addr, now + self.latency));
                return;
            }
        }

        let draining = self
            .write_back_buffer
            .range_mut(..=addr)
            .rev()
            .find(|(base, entry)| addr < **base + entry.victim.granularity)
            .map(|(base, entry)| {
                entry.remaining -= 1;
                (*base, entry.remaining == 0)
            });
        if let Some((base, finished)) = draining {
            if !finished {
                return;
            }
            if let Some(entry) = self.write_back_buffer.remove(&base) {
                // old data is out, commit the new line from the refill buffer
                for offset in (0..entry.fill_granularity).step_by(FLIT_BYTES as usize) {
                    self.refill_req_to_cache
                        .push_back(Transaction::write(base + offset));
                }
                if let Some(pos) = self.refill_buffer.iter().position(|b| *b == base) {
                    self.refill_buffer.swap_remove(pos);
                }
                policy.write_back_data(self, &entry.victim, base);
            }
            return;
        }

        if !policy.hash_read_callback(self, addr) {
            panic!("cache DRAM read {addr:#x} without destination");
        }
    }

    // Tick the cache DRAM and route its read completions.
    pub fn clock_tick<P: PlacementPolicy + ?Sized>(&mut self, policy: &mut P) {
        self.dram.clock_tick();
        while let Some(done) = self.dram.pop_completion() {
            if !done.is_write {
                self.cache_read_callback(policy, done.addr);
            }
        }
    }

    // Untimed install used to pre-populate the cache.
    pub fn warm_up<P: PlacementPolicy + ?Sized>(&mut self, policy: &mut P, hex_addr: u64, is_write: bool) {
        let tracker = *policy.tracker();
        let line = match policy.lookup(hex_addr) {
            Some(line) => line,
            None => {
                let granularity = policy.granularity();
                let remote = hex_addr / granularity * granularity;
                let line = policy.alloc_line(remote);
                let tag = policy.hex_tag(remote);
                tracker.reset_tag(policy.line_mut(line), tag);
                line
            }
        };
        tracker.add_transaction(hex_addr, is_write, policy.line_mut(line));
    }
}
