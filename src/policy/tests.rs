use std::cell::Cell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::mem::dram::{DramCompletion, DramStats, DramSystem, SimpleDram};
use crate::mem::request::RemoteRequest;
use crate::policy::{CacheFrontEnd, PlacementPolicy, Policy, Region, Tag};
use crate::sim::config::{CacheConfig, CachePolicyKind, DramConfig};
use crate::timeq::Cycle;

// Cache DRAM that counts writes issued while a read to the same flit is still in flight.
struct CheckedDram {
    inner: SimpleDram,
    reads: HashMap<u64, u32>,
    violations: Rc<Cell<u64>>,
}

impl DramSystem for CheckedDram {
    fn will_accept_transaction(&self, addr: u64, is_write: bool) -> bool {
        self.inner.will_accept_transaction(addr, is_write)
    }

    fn add_transaction(&mut self, addr: u64, is_write: bool) -> bool {
        if !self.inner.add_transaction(addr, is_write) {
            return false;
        }
        if is_write {
            if self.reads.get(&addr).is_some_and(|n| *n > 0) {
                self.violations.set(self.violations.get() + 1);
            }
        } else {
            *self.reads.entry(addr).or_insert(0) += 1;
        }
        true
    }

    fn clock_tick(&mut self) {
        self.inner.clock_tick()
    }

    fn pop_completion(&mut self) -> Option<DramCompletion> {
        let done = self.inner.pop_completion()?;
        if !done.is_write {
            if let Some(n) = self.reads.get_mut(&done.addr) {
                *n -= 1;
            }
        }
        Some(done)
    }

    fn clk(&self) -> Cycle {
        self.inner.clk()
    }

    fn stats(&self) -> DramStats {
        self.inner.stats()
    }

    fn reset_stats(&mut self) {
        self.inner.reset_stats()
    }
}

// Front end plus a fixed-delay remote memory.
struct Harness {
    fe: CacheFrontEnd,
    rtt: Cycle,
    remote: VecDeque<(Cycle, RemoteRequest)>,
    fetches: Vec<RemoteRequest>,
    writebacks: Vec<RemoteRequest>,
    responses: Vec<u64>,
}

impl Harness {
    fn new(config: &CacheConfig, rtt: Cycle) -> Self {
        Self::with_dram(config, rtt, Box::new(SimpleDram::new(&DramConfig::default())))
    }

    fn with_dram(config: &CacheConfig, rtt: Cycle, dram: Box<dyn DramSystem>) -> Self {
        Self {
            fe: CacheFrontEnd::new(config, dram),
            rtt,
            remote: VecDeque::new(),
            fetches: Vec::new(),
            writebacks: Vec::new(),
            responses: Vec::new(),
        }
    }

    fn step(&mut self) {
        self.fe.drained();
        let now = self.fe.clk();
        while let Some(req) = self.fe.pop_remote() {
            if req.is_write {
                self.writebacks.push(req);
            } else {
                self.fetches.push(req);
                self.remote.push_back((now + self.rtt, req));
            }
        }
        while self.remote.front().is_some_and(|(at, _)| *at <= now) {
            if let Some((_, req)) = self.remote.pop_front() {
                self.fe.refill(req);
            }
        }
        self.fe.clock_tick();
        while let Some(addr) = self.fe.pop_response() {
            self.responses.push(addr);
        }
    }

    fn run(&mut self, cycles: u64) {
        for _ in 0..cycles {
            self.step();
        }
    }

    fn issue(&mut self, addr: u64, is_write: bool) {
        for _ in 0..100_000 {
            if self.fe.add_transaction(addr, is_write) {
                return;
            }
            self.step();
        }
        panic!("{addr:#x} never admitted");
    }

    fn settle(&mut self) {
        for _ in 0..200_000 {
            if self.fe.is_idle() && self.remote.is_empty() {
                return;
            }
            self.step();
        }
        panic!("front end did not settle");
    }

    fn served(&self, addr: u64) -> usize {
        self.responses.iter().filter(|a| **a == addr).count()
    }
}

fn config(kind: CachePolicyKind, granularity: u64, lines: u64) -> CacheConfig {
    CacheConfig {
        granularity,
        working_set_bytes: lines * granularity,
        ratio: 1.0,
        cache_policy: kind,
        ..CacheConfig::default()
    }
}

fn tags(fe: &CacheFrontEnd) -> Vec<Tag> {
    match fe.policy() {
        Policy::Dummy(_) => Vec::new(),
        Policy::DirectMap(p) => p.lines().to_vec(),
        Policy::Kona(p) => p.lines().to_vec(),
        Policy::Our(p) => p.pages().iter().chain(p.blocks()).copied().collect(),
    }
}

fn workload(seed: u64, n: usize, footprint: u64) -> Vec<(u64, bool)> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n)
        .map(|_| (rng.gen_range(0..footprint / 64) * 64, rng.gen_bool(0.3)))
        .collect()
}

#[test]
fn direct_map_cold_misses_then_hit() {
    let mut h = Harness::new(&config(CachePolicyKind::DirectMapped, 4096, 16), 500);
    for i in 0..16 {
        assert!(h.fe.add_transaction(i * 4096, false));
    }
    h.run(16);
    assert_eq!(h.fe.stats().misses, 16);
    assert_eq!(h.fe.core().mshr_occupancy(), 16);
    assert_eq!(h.fetches.len(), 16);
    assert!(h.fetches.iter().all(|req| req.sz == 64 && !req.is_write));

    // still missing: joins the outstanding fetch
    h.issue(0, false);
    h.run(2);
    assert_eq!(h.fe.stats().misses, 17);
    assert_eq!(h.fetches.len(), 16);
    assert_eq!(h.fe.core().mshr_occupancy(), 17);

    h.settle();
    assert_eq!(h.served(0), 2);
    assert_eq!(h.fe.core().mshr_occupancy(), 0);

    let sampled = h.fe.stats().line_utility.total();
    h.issue(0x80, false);
    h.settle();
    assert_eq!(h.fe.stats().hits, 1);
    assert_eq!(h.fe.stats().line_utility.total(), sampled + 1);
    assert_eq!(h.served(0x80), 1);
}

#[test]
fn one_fetch_serves_every_waiter() {
    for (kind, granularity) in [
        (CachePolicyKind::DirectMapped, 4096),
        (CachePolicyKind::Kona, 256),
        (CachePolicyKind::Our, 4096),
    ] {
        let mut h = Harness::new(&config(kind, granularity, 16), 300);
        for offset in [0x0, 0x40, 0x80, 0xc0] {
            h.issue(0x2000 + offset, false);
        }
        h.settle();
        let mut sent: Vec<(u64, u32)> = h.fetches.iter().map(|req| (req.hex_addr, req.sz)).collect();
        sent.sort_unstable();
        sent.dedup();
        assert_eq!(sent.len(), h.fetches.len(), "{kind:?} fetched a line twice");
        if kind != CachePolicyKind::Our {
            // the adaptive policy may pad an in-flight block fetch into a page fetch
            assert_eq!(h.fetches.len(), 1, "{kind:?}");
        }
        for offset in [0x0, 0x40, 0x80, 0xc0] {
            assert_eq!(h.served(0x2000 + offset), 1, "{kind:?} {offset:#x}");
        }
    }
}

#[test]
fn clean_eviction_sends_nothing_back() {
    let mut h = Harness::new(&config(CachePolicyKind::DirectMapped, 4096, 16), 100);
    h.issue(0, false);
    h.settle();
    h.issue(16 * 4096, false);
    h.settle();
    assert_eq!(h.fetches.len(), 2);
    assert!(h.writebacks.is_empty());
}

#[test]
fn dirty_eviction_writes_back_dirty_flits_once() {
    let mut h = Harness::new(&config(CachePolicyKind::DirectMapped, 4096, 16), 100);
    h.issue(0x000, true);
    h.issue(0x080, true);
    h.settle();
    assert!(h.writebacks.is_empty());

    h.issue(16 * 4096, false);
    h.settle();
    assert_eq!(h.writebacks.len(), 1);
    assert_eq!((h.writebacks[0].hex_addr, h.writebacks[0].sz), (0, 2));
    assert_eq!(h.served(16 * 4096), 1);
}

#[test]
fn kona_dirty_victim_goes_through_directory() {
    // 4 lines of 1024B form a single bucket
    let mut h = Harness::new(&config(CachePolicyKind::Kona, 1024, 4), 100);
    h.issue(0x000, true);
    h.issue(0x040, true);
    h.settle();
    for kib in 1..=4u64 {
        h.issue(kib * 1024, false);
        h.settle();
    }

    // remote line 4 maps to way 4 % 4 = 0, the dirty one
    let written: Vec<(u64, u32)> = h.writebacks.iter().map(|req| (req.hex_addr, req.sz)).collect();
    assert_eq!(written, vec![(0, 2)]);
    assert_eq!(h.fetches.len(), 5);
    assert_eq!(h.served(4 * 1024), 1);

    let Policy::Kona(kona) = h.fe.policy() else {
        panic!("expected kona");
    };
    // every remote request, write-backs included, read its directory slot first
    assert_eq!(kona.hashmap_reads(), (h.fetches.len() + h.writebacks.len()) as u64);
    assert_eq!(kona.lookup(0), None);
    assert!(kona.lookup(4 * 1024).is_some());
}

#[test]
fn refill_writes_never_overtake_reads() {
    let violations = Rc::new(Cell::new(0));
    let dram = CheckedDram {
        inner: SimpleDram::new(&DramConfig::default()),
        reads: HashMap::new(),
        violations: Rc::clone(&violations),
    };
    let mut h = Harness::with_dram(&config(CachePolicyKind::DirectMapped, 4096, 16), 80, Box::new(dram));

    // dirty every line once, then read conflicting and resident lines
    for line in 0..16 {
        h.issue(line * 4096 + 0x40, true);
    }
    h.settle();
    for round in 0..3u64 {
        for line in 0..16 {
            h.issue((16 * (round + 1) + line) * 4096, false);
            h.issue((16 * round + line) * 4096 + 0x100, false);
        }
    }
    h.settle();
    assert_eq!(violations.get(), 0);
    assert_eq!(h.writebacks.len(), 16);
}

#[test]
fn front_queue_rejects_past_capacity() {
    let mut h = Harness::new(&config(CachePolicyKind::DirectMapped, 4096, 16), 100);
    for i in 0..64 {
        assert!(h.fe.add_transaction(i * 64, false));
    }
    assert!(!h.fe.will_accept_transaction());
    assert!(!h.fe.add_transaction(0x10000, false));
    assert_eq!(h.fe.stats().rejected, 1);
    assert_eq!(h.fe.core().front_len(), 64);
}

#[test]
fn mshr_capacity_stalls_admission() {
    let cfg = CacheConfig {
        mshr_capacity: 4,
        ..config(CachePolicyKind::DirectMapped, 4096, 16)
    };
    let mut h = Harness::new(&cfg, 1000);
    for i in 0..8 {
        h.issue(i * 4096, false);
    }
    h.run(50);
    assert_eq!(h.fe.core().mshr_occupancy(), 4);
    assert_eq!(h.fetches.len(), 4);
    assert_eq!(h.fe.core().front_len(), 4);
    assert!(h.fe.stats().mshr_full_stalls > 0);

    h.settle();
    assert_eq!(h.fetches.len(), 8);
    assert_eq!(h.responses.len(), 8);
}

#[test]
fn dummy_forwards_everything() {
    let mut h = Harness::new(&config(CachePolicyKind::Dummy, 4096, 16), 50);
    h.issue(0x1234, false);
    h.issue(0x1234, false);
    h.issue(0x5000, true);
    h.settle();
    assert_eq!(h.fetches.len(), 2);
    assert_eq!(h.writebacks.len(), 1);
    assert_eq!(h.served(0x1234), 2);
}

#[test]
fn replay_is_deterministic_for_every_policy() {
    let trace = workload(11, 600, 64 * 4096);
    for (kind, granularity) in [
        (CachePolicyKind::DirectMapped, 4096),
        (CachePolicyKind::Kona, 1024),
        (CachePolicyKind::Our, 4096),
    ] {
        let run = || {
            let mut h = Harness::new(&config(kind, granularity, 16), 120);
            for &(addr, is_write) in trace.iter() {
                h.issue(addr, is_write);
            }
            h.settle();
            let stats = h.fe.stats();
            (stats.hits, stats.misses, stats.wb_hits, tags(&h.fe), h.fetches.len())
        };
        assert_eq!(run(), run(), "{kind:?}");
    }
}

#[test]
fn every_read_is_answered() {
    let trace = workload(5, 800, 48 * 4096);
    for (kind, granularity) in [
        (CachePolicyKind::DirectMapped, 1024),
        (CachePolicyKind::Kona, 4096),
        (CachePolicyKind::Our, 4096),
    ] {
        let mut h = Harness::new(&config(kind, granularity, 16), 150);
        for &(addr, is_write) in trace.iter() {
            h.issue(addr, is_write);
        }
        h.settle();
        let reads = trace.iter().filter(|(_, w)| !*w).count();
        assert_eq!(h.responses.len(), reads, "{kind:?}");
        assert_eq!(h.fe.core().mshr_occupancy(), 0, "{kind:?}");
    }
}

#[test]
fn translation_stays_consistent_under_load() {
    let cfg = CacheConfig {
        mwl: 400,
        ..config(CachePolicyKind::Our, 4096, 16)
    };
    let mut h = Harness::new(&cfg, 100);

    // dense pages and scattered blocks, so both regions fill and wrap
    let mut rng = StdRng::seed_from_u64(3);
    let mut trace = Vec::new();
    for page in 0..24u64 {
        for block in 0..16 {
            trace.push((page * 4096 + block * 256, block % 4 == 0));
        }
        for _ in 0..8 {
            let far = rng.gen_range(24..256u64) * 4096 + rng.gen_range(0..16u64) * 256;
            trace.push((far, rng.gen_bool(0.5)));
        }
    }

    for &(addr, is_write) in trace.iter() {
        h.issue(addr, is_write);
        h.step();
        if let Some(our) = h.fe.policy().as_our() {
            our.check_translation().unwrap();
        }
    }
    h.settle();

    let our = h.fe.policy().as_our().unwrap();
    our.check_translation().unwrap();
    assert!(our.stats().refill_to_block > 0);
    assert!(our.stats().refill_to_page > 0);
    assert!(our.stats().go_back_to_head > 0);
    assert!(our.tuner().promotion_t() <= 3);
    assert!(!our.tuner().trace().is_empty());
}

#[test]
fn our_warm_up_then_timed_hits() {
    let mut h = Harness::new(&config(CachePolicyKind::Our, 4096, 16), 100);
    for block in 0..16 {
        h.fe.warm_up(0x40000 + block * 256, false);
    }
    h.fe.reset_stats();
    h.fe.policy().as_our().unwrap().check_translation().unwrap();

    h.issue(0x40010, false);
    h.issue(0x40f00, true);
    h.settle();
    assert_eq!(h.fe.stats().hits, 2);
    assert!(h.fetches.is_empty());
    assert_eq!(h.served(0x40010), 1);
}

#[test]
fn padded_page_is_written_back_when_blocks_take_its_slot() {
    // one page of capacity, thresholds stay put
    let cfg = CacheConfig {
        mwl: 1 << 40,
        ..config(CachePolicyKind::Our, 4096, 1)
    };
    let mut h = Harness::new(&cfg, 1000);

    // the first block miss leaves as a block fetch
    h.issue(0x0, true);
    for _ in 0..10_000 {
        if !h.fetches.is_empty() {
            break;
        }
        h.step();
    }
    assert_eq!(h.fetches.len(), 1);
    assert_eq!((h.fetches[0].hex_addr, h.fetches[0].sz), (0, 4));

    // a second block miss while it is in flight pads the group into a page fetch
    for block in 1..16u64 {
        h.issue(block * 256, true);
    }
    h.settle();
    assert!(h.fetches.iter().any(|req| (req.hex_addr, req.sz) == (0, 64)));
    assert!(h.writebacks.is_empty());
    {
        let our = h.fe.policy().as_our().unwrap();
        let line = our.lookup(0x0).unwrap();
        assert_eq!(line.region, Region::Main);
        assert_eq!(our.line(line).dirty_count(), 16);
        let s = our.stats();
        assert_eq!((s.promotions, s.paddings), (1, 1));
        // the block fill came back after its page was promoted
        assert_eq!(s.wasted_blocks, 1);
        assert_eq!(s.refill_to_page, 1);
        our.check_translation().unwrap();
    }

    // scattered blocks fill downwards from the top of the only page slot
    for page in 1..=4u64 {
        h.issue(page * 4096, false);
        h.settle();
        assert_eq!(h.served(page * 4096), 1);
    }

    let page_zero: Vec<(u64, u32)> = h
        .writebacks
        .iter()
        .filter(|req| req.hex_addr < 4096)
        .map(|req| (req.hex_addr, req.sz))
        .collect();
    assert_eq!(page_zero, vec![(0, 16)]);
    assert_eq!(page_zero.iter().map(|(_, sz)| sz).sum::<u32>(), 16);

    let our = h.fe.policy().as_our().unwrap();
    assert_eq!(our.lookup(0x0), None);
    let s = our.stats();
    assert_eq!(s.cross_region_writebacks, 1);
    assert_eq!(s.refill_to_block, 4);
    assert_eq!((s.promotions, s.paddings, s.wasted_blocks), (1, 1, 1));
    our.check_translation().unwrap();
}
