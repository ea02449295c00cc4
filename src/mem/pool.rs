use std::collections::{HashMap, VecDeque};

use log::debug;
use serde::Serialize;

use crate::base::behavior::ModuleBehaviors;
use crate::mem::dram::{DramSystem, SimpleDram};
use crate::mem::request::RemoteRequest;

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct PoolStats {
    requests: u64,
    reads: u64,
    writes: u64,
    flits: u64,
    completed_reads: u64,
    completed_writes: u64,
}

impl PoolStats {
    pub fn requests(&self) -> u64 {
        self.requests
    }

    pub fn reads(&self) -> u64 {
        self.reads
    }

    pub fn writes(&self) -> u64 {
        self.writes
    }

    pub fn flits(&self) -> u64 {
        self.flits
    }

    pub fn completed_reads(&self) -> u64 {
        self.completed_reads
    }
}

#[derive(Debug)]
struct PendingRemote {
    request: RemoteRequest,
    remaining: u32,
}

#[derive(Debug, Clone, Copy)]
struct Flit {
    addr: u64,
    is_write: bool,
    handle: usize,
}

// The remote memory: splits every request into 64B flits against its media and reports a read
// once its last flit returns.  Pending requests live in a slot arena addressed by handle.
#[derive(Debug)]
pub struct MemoryPool {
    media: SimpleDram,
    flits_issue: VecDeque<Flit>,
    slots: Vec<Option<PendingRemote>>,
    free_slots: Vec<usize>,
    pending: HashMap<u64, VecDeque<usize>>,
    completed: VecDeque<RemoteRequest>,
    stats: PoolStats,
}

impl MemoryPool {
    pub fn new(media: SimpleDram) -> Self {
        Self {
            media,
            flits_issue: VecDeque::new(),
            slots: Vec::new(),
            free_slots: Vec::new(),
            pending: HashMap::new(),
            completed: VecDeque::new(),
            stats: PoolStats::default(),
        }
    }

    pub fn will_accept_transaction(&self, _req: &RemoteRequest) -> bool {
        true
    }

    pub fn add_transaction(&mut self, req: RemoteRequest) -> bool {
        let handle = self.alloc_slot(PendingRemote {
            request: req,
            remaining: req.sz,
        });
        for addr in req.flit_addrs() {
            self.flits_issue.push_back(Flit {
                addr,
                is_write: req.is_write,
                handle,
            });
        }
        self.stats.requests = self.stats.requests.saturating_add(1);
        if req.is_write {
            self.stats.writes = self.stats.writes.saturating_add(1);
        } else {
            self.stats.reads = self.stats.reads.saturating_add(1);
        }
        true
    }

    fn alloc_slot(&mut self, pending: PendingRemote) -> usize {
        match self.free_slots.pop() {
            Some(handle) => {
                self.slots[handle] = Some(pending);
                handle
            }
            None => {
                self.slots.push(Some(pending));
                self.slots.len() - 1
            }
        }
    }

    pub fn clock_tick(&mut self) {
        if let Some(flit) = self.flits_issue.front().copied() {
            if self.media.will_accept_transaction(flit.addr, flit.is_write)
                && self.media.add_transaction(flit.addr, flit.is_write)
            {
                self.pending.entry(flit.addr).or_default().push_back(flit.handle);
                self.stats.flits = self.stats.flits.saturating_add(1);
                self.flits_issue.pop_front();
            }
        }

        self.media.clock_tick();
        while let Some(done) = self.media.pop_completion() {
            self.media_callback(done.addr);
        }
    }

    fn media_callback(&mut self, addr: u64) {
        let Some(waiters) = self.pending.get_mut(&addr) else {
            panic!("pool media completion {addr:#x} has no pending request");
        };
        let handle = waiters
            .pop_front()
            .unwrap_or_else(|| panic!("pool media completion {addr:#x} has no pending request"));
        if waiters.is_empty() {
            self.pending.remove(&addr);
        }

        let slot = self.slots[handle]
            .as_mut()
            .unwrap_or_else(|| panic!("pool slot {handle} released twice"));
        slot.remaining -= 1;
        if slot.remaining > 0 {
            return;
        }

        let request = slot.request;
        self.slots[handle] = None;
        self.free_slots.push(handle);
        if request.is_write {
            self.stats.completed_writes = self.stats.completed_writes.saturating_add(1);
        } else {
            debug!("pool read {:#x} ({} flits) done", request.hex_addr, request.sz);
            self.stats.completed_reads = self.stats.completed_reads.saturating_add(1);
            self.completed.push_back(request);
        }
    }

    // Completed reads, ready to travel back to the cache.
    pub fn pop_completion(&mut self) -> Option<RemoteRequest> {
        self.completed.pop_front()
    }

    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats
    }

    pub fn media(&self) -> &SimpleDram {
        &self.media
    }

    pub fn reset_stats(&mut self) {
        self.stats = PoolStats::default();
        self.media.reset_stats();
    }
}

impl ModuleBehaviors for MemoryPool {
    fn tick_one(&mut self) {
        self.clock_tick();
    }

    fn reset(&mut self) {
        self.reset_stats();
    }
}
