use std::collections::{HashMap, VecDeque};

use log::{info, trace};
use serde_json::{json, Value};

use crate::mem::request::{RemoteRequest, Transaction, FLIT_BYTES};
use crate::policy::frontend::FrontEndCore;
use crate::policy::tag::Tag;
use crate::policy::tracker::Tracker;
use crate::policy::{LineRef, PlacementPolicy};
use crate::sim::config::CacheConfig;

const WAYS: usize = 4;

// 4-way bucketed cache.  Every remote request first reads its slot of a hash directory kept in
// the cache DRAM right after the data lines, and only leaves for the pool once that read is back.
pub struct Kona {
    lines: Vec<Tag>,
    granularity: u64,
    buckets: u64,
    tracker: Tracker,
    // directory base in the cache DRAM
    hashmap_base: u64,
    pending_req_to_hashmap: VecDeque<(u64, RemoteRequest)>,
    waiting_resp_from_hashmap: HashMap<u64, RemoteRequest>,
    hashmap_reads: u64,
}

impl Kona {
    pub fn new(config: &CacheConfig) -> Self {
        let lines = config.cache_lines();
        assert!(lines >= WAYS, "kona needs at least {WAYS} lines, got {lines}");
        let buckets = (lines / WAYS) as u64;
        info!("kona front end: {} buckets x {} ways of {}B", buckets, WAYS, config.granularity);
        Self {
            lines: vec![Tag::invalid(config.granularity); lines],
            granularity: config.granularity,
            buckets,
            tracker: Tracker::Kona { buckets },
            hashmap_base: lines as u64 * config.granularity,
            pending_req_to_hashmap: VecDeque::new(),
            waiting_resp_from_hashmap: HashMap::new(),
            hashmap_reads: 0,
        }
    }

    fn bucket_of(&self, hex_addr: u64) -> usize {
        (hex_addr / self.granularity % self.buckets) as usize
    }

    fn bucket(&self, hex_addr: u64) -> std::ops::Range<usize> {
        let first = self.bucket_of(hex_addr) * WAYS;
        first..first + WAYS
    }

    fn to_hashmap(&mut self, req: RemoteRequest) {
        self.pending_req_to_hashmap
            .push_back((req.hex_addr + self.hashmap_base, req));
    }

    pub fn lines(&self) -> &[Tag] {
        &self.lines
    }

    // Directory reads issued to the cache DRAM.
    pub fn hashmap_reads(&self) -> u64 {
        self.hashmap_reads
    }

    pub fn hashmap_backlog(&self) -> usize {
        self.pending_req_to_hashmap.len() + self.waiting_resp_from_hashmap.len()
    }

    // Issue the oldest directory read, one per cycle, never two to the same slot.
    fn hashmap_step(&mut self, core: &mut FrontEndCore) {
        let Some(&(slot, _)) = self.pending_req_to_hashmap.front() else {
            return;
        };
        if self.waiting_resp_from_hashmap.contains_key(&slot) {
            return;
        }
        if !core.dram_will_accept(slot, false) || !core.dram_add(slot, false) {
            return;
        }
        if let Some((slot, req)) = self.pending_req_to_hashmap.pop_front() {
            trace!("kona directory read {slot:#x} for {:#x}", req.hex_addr);
            self.hashmap_reads += 1;
            self.waiting_resp_from_hashmap.insert(slot, req);
        }
    }
}

impl PlacementPolicy for Kona {
    fn name(&self) -> String {
        format!("Kona_{}", self.granularity)
    }

    fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    fn granularity(&self) -> u64 {
        self.granularity
    }

    fn line(&self, line: LineRef) -> &Tag {
        &self.lines[line.index]
    }

    fn line_mut(&mut self, line: LineRef) -> &mut Tag {
        &mut self.lines[line.index]
    }

    fn line_base(&self, line: LineRef) -> u64 {
        line.index as u64 * self.granularity
    }

    fn lookup(&self, hex_addr: u64) -> Option<LineRef> {
        let tag = self.hex_tag(hex_addr);
        self.bucket(hex_addr)
            .find(|&i| self.lines[i].valid && self.lines[i].tag == tag)
            .map(LineRef::main)
    }

    fn hex_tag(&self, remote_addr: u64) -> u64 {
        remote_addr / self.granularity / self.buckets
    }

    fn alloc_line(&mut self, remote_addr: u64) -> LineRef {
        let mut slots = self.bucket(remote_addr);
        let first = slots.start;
        match slots.find(|&i| !self.lines[i].valid) {
            Some(i) => LineRef::main(i),
            None => LineRef::main(first + (self.hex_tag(remote_addr) % WAYS as u64) as usize),
        }
    }

    fn miss_handler(&mut self, core: &mut FrontEndCore, hex_addr: u64, is_write: bool) {
        let remote = hex_addr / self.granularity * self.granularity;
        if core.mshr_merge(remote, Transaction::new(hex_addr, is_write)) {
            self.to_hashmap(RemoteRequest::fetch(remote, (self.granularity / FLIT_BYTES) as u32));
        }
    }

    fn write_back_data(&mut self, _core: &mut FrontEndCore, victim: &Tag, cache_addr: u64) {
        let remote = self.tracker.remote_addr(victim, cache_addr);
        self.to_hashmap(RemoteRequest::write_back(remote, victim.dirty_count()));
    }

    fn hash_read_callback(&mut self, core: &mut FrontEndCore, addr: u64) -> bool {
        match self.waiting_resp_from_hashmap.remove(&addr) {
            Some(req) => {
                core.send_remote(req);
                true
            }
            None => false,
        }
    }

    fn drained(&mut self, core: &mut FrontEndCore) {
        core.drain_step(self);
        self.hashmap_step(core);
    }

    fn summary(&self) -> Value {
        json!({ "hashmap_reads": self.hashmap_reads })
    }

    fn reset_stats(&mut self) {
        self.hashmap_reads = 0;
    }

    fn is_idle(&self) -> bool {
        self.hashmap_backlog() == 0
    }
}
