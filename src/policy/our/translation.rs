use std::collections::{HashMap, HashSet, VecDeque};

use log::trace;
use rand::rngs::StdRng;
use rand::Rng;
use serde::Serialize;

use crate::mem::dram::DramSystem;
use crate::mem::request::FLIT_BYTES;

// Entries of one 64B group of the hashed page table.
pub const PTE_ASSOC: usize = 4;
pub const PTE_BYTES: u64 = 16;
pub const RPTE_BYTES: u64 = 8;
// 64B lines held by the reverse-map cache.
const RPT_LINES: usize = 4;

// Forward translation: remote line -> cache DRAM address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PtEntry {
    pub hex_addr_aligned: u64,
    pub hex_cache_addr: u64,
    pub valid: bool,
}

impl PtEntry {
    pub const INVALID: PtEntry = PtEntry {
        hex_addr_aligned: 0,
        hex_cache_addr: 0,
        valid: false,
    };

    pub fn new(hex_addr_aligned: u64, hex_cache_addr: u64) -> Self {
        Self {
            hex_addr_aligned,
            hex_cache_addr,
            valid: true,
        }
    }
}

// Reverse translation: physical slot -> page table entry that claims it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RptEntry {
    pub pt_index: u64,
    pub offset: u64,
    pub valid: bool,
}

impl RptEntry {
    pub const INVALID: RptEntry = RptEntry {
        pt_index: 0,
        offset: 0,
        valid: false,
    };

    pub fn new(pt_index: u64, offset: u64) -> Self {
        Self {
            pt_index,
            offset,
            valid: true,
        }
    }

    // Position of the claimed entry inside the page table.
    pub fn entry_index(&self) -> usize {
        (self.pt_index as usize / PTE_ASSOC) * PTE_ASSOC + self.offset as usize
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TranslationStats {
    pub hits: u64,
    pub misses: u64,
}

#[derive(Debug, Clone, Copy, Default)]
struct GroupTag {
    tag: u64,
    valid: bool,
    dirty: bool,
}

// Direct-mapped cache over 64B groups of a hashed page table kept in the cache DRAM.  The
// table itself lives in `backing`; cached groups always mirror it, so only tags are held here
// and every access is charged as cache DRAM traffic on a miss.
#[derive(Debug)]
pub struct SramCache {
    base: u64,
    backing: Vec<PtEntry>,
    tags: Vec<GroupTag>,
    pending: VecDeque<(u64, bool)>,
    // DRAM address -> table group being fetched
    waiting: HashMap<u64, u64>,
    // misses not yet answered, so a retry of the same lookup is not counted twice
    last_req: HashSet<u64>,
    stats: TranslationStats,
}

impl SramCache {
    pub fn new(base: u64, entries: u64, capacity_bytes: u64) -> Self {
        let groups = (capacity_bytes / PTE_BYTES / PTE_ASSOC as u64).max(1) as usize;
        let table_groups = entries.div_ceil(PTE_ASSOC as u64).max(1) as usize;
        Self {
            base,
            backing: vec![PtEntry::INVALID; table_groups * PTE_ASSOC],
            tags: vec![GroupTag::default(); groups],
            pending: VecDeque::new(),
            waiting: HashMap::new(),
            last_req: HashSet::new(),
            stats: TranslationStats::default(),
        }
    }

    fn locate(&self, pt_index: u64) -> (u64, usize, u64) {
        let group = pt_index / PTE_ASSOC as u64;
        let sets = self.tags.len() as u64;
        (group, (group % sets) as usize, group / sets)
    }

    fn group_addr(&self, group: u64) -> u64 {
        self.base + group * PTE_ASSOC as u64 * PTE_BYTES
    }

    fn is_cached(&self, pt_index: u64) -> bool {
        let (_, set, tag) = self.locate(pt_index);
        let t = &self.tags[set];
        t.valid && t.tag == tag
    }

    fn in_flight(&self, addr: u64) -> bool {
        self.waiting.contains_key(&addr) || self.pending.iter().any(|(a, _)| *a == addr)
    }

    fn count(&mut self, pt_index: u64, hit: bool) {
        if hit {
            if !self.last_req.remove(&pt_index) {
                self.stats.hits += 1;
            }
        } else if self.last_req.insert(pt_index) {
            self.stats.misses += 1;
        }
    }

    // Lookup of the group holding `pt_index`.  A miss schedules one fetch of the group.
    pub fn read(&mut self, pt_index: u64) -> bool {
        let hit = self.is_cached(pt_index);
        if !hit {
            let (group, _, _) = self.locate(pt_index);
            let addr = self.group_addr(group);
            let reading = self.waiting.contains_key(&addr)
                || self.pending.iter().any(|(a, w)| *a == addr && !*w);
            if !reading {
                self.pending.push_back((addr, false));
            }
        }
        self.count(pt_index, hit);
        hit
    }

    // Store `entry` into slot `offset` of the group holding `pt_index`.
    pub fn write(&mut self, pt_index: u64, offset: u64, entry: PtEntry) {
        let (group, set, _) = self.locate(pt_index);
        self.backing[group as usize * PTE_ASSOC + offset as usize] = entry;
        if self.is_cached(pt_index) {
            self.tags[set].dirty = true;
            self.count(pt_index, true);
            return;
        }
        // a fetch of the group already picks up the new value
        if self.in_flight(self.group_addr(group)) {
            return;
        }
        let addr = self.group_addr(group) + offset * PTE_BYTES;
        self.pending.push_back((addr, true));
    }

    // Issue the oldest queued access to the cache DRAM.
    pub fn drained(&mut self, dram: &mut dyn DramSystem) {
        let Some(&(addr, is_write)) = self.pending.front() else {
            return;
        };
        if !dram.will_accept_transaction(addr, is_write) || !dram.add_transaction(addr, is_write) {
            return;
        }
        if !is_write {
            self.waiting.insert(addr, (addr - self.base) / (PTE_ASSOC as u64 * PTE_BYTES));
        }
        self.pending.pop_front();
    }

    // Completion of a group fetch.  The displaced group is written back when dirty.
    pub fn read_back(&mut self, addr: u64) -> bool {
        let Some(group) = self.waiting.remove(&addr) else {
            return false;
        };
        let sets = self.tags.len() as u64;
        let set = (group % sets) as usize;
        let old = self.tags[set];
        if old.valid && old.dirty {
            let old_group = old.tag * sets + set as u64;
            trace!("page table group {old_group} written back");
            self.pending.push_back((self.group_addr(old_group), true));
        }
        self.tags[set] = GroupTag {
            tag: group / sets,
            valid: true,
            dirty: false,
        };
        true
    }

    // A free slot of the group, or a random victim when all four are taken.
    pub fn free_slot(&self, pt_index: u64, rng: &mut StdRng) -> (u64, PtEntry) {
        let group = self.group(pt_index);
        match group.iter().position(|e| !e.valid) {
            Some(offset) => (offset as u64, group[offset]),
            None => {
                let offset = rng.gen_range(0..PTE_ASSOC);
                (offset as u64, group[offset])
            }
        }
    }

    // Entry of the group translating `tag`, if any.
    pub fn find(&self, pt_index: u64, tag: u64) -> Option<PtEntry> {
        self.group(pt_index)
            .iter()
            .find(|e| e.valid && e.hex_addr_aligned == tag)
            .copied()
    }

    pub fn group(&self, pt_index: u64) -> &[PtEntry] {
        let start = (pt_index as usize / PTE_ASSOC) * PTE_ASSOC;
        &self.backing[start..start + PTE_ASSOC]
    }

    // Untimed: make the group resident.
    pub fn warm_read(&mut self, pt_index: u64) {
        let (_, set, tag) = self.locate(pt_index);
        if !self.is_cached(pt_index) {
            self.tags[set] = GroupTag {
                tag,
                valid: true,
                dirty: false,
            };
        }
    }

    // Untimed: store an entry and leave its group resident and dirty.
    pub fn warm_write(&mut self, pt_index: u64, offset: u64, entry: PtEntry) {
        let (group, set, tag) = self.locate(pt_index);
        self.backing[group as usize * PTE_ASSOC + offset as usize] = entry;
        self.tags[set] = GroupTag {
            tag,
            valid: true,
            dirty: true,
        };
    }

    pub fn entries(&self) -> &[PtEntry] {
        &self.backing
    }

    // Table size in entries, used to reduce hashes to an index.
    pub fn len(&self) -> u64 {
        self.backing.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.backing.is_empty()
    }

    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.waiting.is_empty()
    }

    pub fn stats(&self) -> TranslationStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = TranslationStats::default();
    }
}

// Reverse map cache: a 4-line FIFO over the reverse page table.  Reads allocate, writes update
// the table and go through to DRAM unless the line is held.
#[derive(Debug)]
pub struct RptCache {
    base: u64,
    backing: Vec<RptEntry>,
    pending: VecDeque<(u64, bool)>,
    // outstanding reads per DRAM address
    waiting: HashMap<u64, u32>,
    lines: VecDeque<u64>,
    stats: TranslationStats,
}

impl RptCache {
    pub fn new(base: u64, entries: u64) -> Self {
        Self {
            base,
            backing: vec![RptEntry::INVALID; entries as usize],
            pending: VecDeque::new(),
            waiting: HashMap::new(),
            lines: VecDeque::with_capacity(RPT_LINES),
            stats: TranslationStats::default(),
        }
    }

    fn line_of(index: u64) -> u64 {
        index * RPTE_BYTES / FLIT_BYTES
    }

    fn hold(&mut self, line: u64) {
        if self.lines.len() == RPT_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(line);
    }

    pub fn read(&mut self, index: u64) {
        let line = Self::line_of(index);
        if self.lines.contains(&line) {
            self.stats.hits += 1;
            return;
        }
        self.stats.misses += 1;
        self.pending.push_back((self.base + index * RPTE_BYTES, false));
        if self.lines.len() == RPT_LINES {
            if let Some(evicted) = self.lines.front().copied() {
                self.pending.push_back((self.base + evicted * FLIT_BYTES, true));
            }
        }
        self.hold(line);
    }

    pub fn write(&mut self, index: u64, entry: RptEntry) {
        self.backing[index as usize] = entry;
        if !self.lines.contains(&Self::line_of(index)) {
            self.pending.push_back((self.base + index * RPTE_BYTES, true));
        }
    }

    pub fn will_accept(&self) -> bool {
        self.pending.is_empty() && self.waiting.is_empty()
    }

    pub fn drained(&mut self, dram: &mut dyn DramSystem) {
        let Some(&(addr, is_write)) = self.pending.front() else {
            return;
        };
        // keep a write behind an outstanding read of the same address
        if is_write && self.waiting.contains_key(&addr) {
            return;
        }
        if !dram.will_accept_transaction(addr, is_write) || !dram.add_transaction(addr, is_write) {
            return;
        }
        if !is_write {
            *self.waiting.entry(addr).or_insert(0) += 1;
        }
        self.pending.pop_front();
    }

    pub fn read_back(&mut self, addr: u64) -> bool {
        let Some(count) = self.waiting.get_mut(&addr) else {
            return false;
        };
        *count -= 1;
        if *count == 0 {
            self.waiting.remove(&addr);
        }
        true
    }

    pub fn entry(&self, index: u64) -> RptEntry {
        self.backing[index as usize]
    }

    // Untimed access used by warm-up.
    pub fn warm(&mut self, index: u64, is_write: bool, entry: RptEntry) {
        if is_write {
            self.backing[index as usize] = entry;
        } else {
            let line = Self::line_of(index);
            self.hold(line);
        }
    }

    pub fn entries(&self) -> &[RptEntry] {
        &self.backing
    }

    pub fn is_idle(&self) -> bool {
        self.will_accept()
    }

    pub fn stats(&self) -> TranslationStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = TranslationStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::dram::SimpleDram;
    use crate::sim::config::DramConfig;
    use rand::SeedableRng;

    fn run(dram: &mut SimpleDram, mut on_read: impl FnMut(u64)) {
        for _ in 0..200 {
            dram.clock_tick();
            while let Some(done) = dram.pop_completion() {
                if !done.is_write {
                    on_read(done.addr);
                }
            }
        }
    }

    #[test]
    fn tlb_miss_fetches_group_once() {
        let mut dram = SimpleDram::new(&DramConfig::default());
        let mut tlb = SramCache::new(0x10000, 64, 1024);
        assert!(!tlb.read(5));
        assert!(!tlb.read(6));
        tlb.drained(&mut dram);
        tlb.drained(&mut dram);
        assert_eq!(dram.outstanding(), 1);
        // retried lookups are counted once
        assert_eq!(tlb.stats().misses, 2);
        assert!(!tlb.read(5));
        assert_eq!(tlb.stats().misses, 2);

        let mut fills = Vec::new();
        run(&mut dram, |addr| fills.push(addr));
        assert_eq!(fills, vec![0x10000 + 64]);
        assert!(tlb.read_back(fills[0]));
        assert!(tlb.read(5));
        assert!(tlb.read(7));
        assert_eq!(tlb.stats().hits, 1);
    }

    #[test]
    fn tlb_write_miss_goes_through() {
        let mut tlb = SramCache::new(0, 64, 1024);
        tlb.write(9, 1, PtEntry::new(0x4000, 0x1000));
        assert_eq!(tlb.pending.front(), Some(&(2 * 64 + 16, true)));
        assert_eq!(tlb.find(9, 0x4000), Some(PtEntry::new(0x4000, 0x1000)));
        assert_eq!(tlb.find(8, 0x4000), Some(PtEntry::new(0x4000, 0x1000)));
        assert_eq!(tlb.find(12, 0x4000), None);
    }

    #[test]
    fn tlb_write_behind_pending_read_is_absorbed() {
        let mut tlb = SramCache::new(0, 64, 1024);
        tlb.read(4);
        tlb.write(4, 0, PtEntry::new(0x1000, 0));
        assert_eq!(tlb.pending.len(), 1);
    }

    #[test]
    fn dirty_group_written_back_on_replacement() {
        // a single cached group
        let mut tlb = SramCache::new(0, 64, 64);
        tlb.warm_write(0, 0, PtEntry::new(0x1000, 0));
        assert!(!tlb.read(4));
        tlb.pending.clear();
        tlb.waiting.insert(64, 1);
        assert!(tlb.read_back(64));
        assert_eq!(tlb.pending.front(), Some(&(0, true)));
        assert!(tlb.read(5));
        assert!(!tlb.read(0));
    }

    #[test]
    fn free_slot_prefers_invalid_entry() {
        let mut rng = StdRng::seed_from_u64(0);
        let mut tlb = SramCache::new(0, 8, 1024);
        tlb.warm_write(0, 0, PtEntry::new(0x1000, 0));
        assert_eq!(tlb.free_slot(1, &mut rng), (1, PtEntry::INVALID));
        for offset in 1..4 {
            tlb.warm_write(0, offset, PtEntry::new(0x1000 * (offset + 1), 0));
        }
        let (offset, victim) = tlb.free_slot(2, &mut rng);
        assert!(victim.valid);
        assert!(offset < 4);
    }

    #[test]
    fn small_table_is_padded_to_a_group() {
        let tlb = SramCache::new(0, 2, 1024);
        assert_eq!(tlb.len(), 4);
        assert_eq!(tlb.group(1).len(), 4);
    }

    #[test]
    fn rpt_fifo_evicts_oldest_line() {
        let mut rpt = RptCache::new(0x100, 64);
        for line in 0..4 {
            rpt.read(line * 8);
        }
        assert_eq!(rpt.stats().misses, 4);
        rpt.read(1);
        assert_eq!(rpt.stats().hits, 1);
        rpt.pending.clear();
        rpt.read(4 * 8);
        assert_eq!(
            rpt.pending.iter().copied().collect::<Vec<_>>(),
            vec![(0x100 + 32 * 8, false), (0x100, true)]
        );
        assert!(!rpt.will_accept());
    }

    #[test]
    fn rpt_write_to_held_line_stays_local() {
        let mut rpt = RptCache::new(0, 64);
        rpt.warm(3, false, RptEntry::INVALID);
        rpt.write(2, RptEntry::new(7, 1));
        assert!(rpt.will_accept());
        assert_eq!(rpt.entry(2), RptEntry::new(7, 1));
        rpt.write(40, RptEntry::new(1, 0));
        assert!(!rpt.will_accept());
    }

    #[test]
    fn rpt_write_waits_for_read_to_same_address() {
        let mut dram = SimpleDram::new(&DramConfig::default());
        let mut rpt = RptCache::new(0, 64);
        rpt.read(0);
        rpt.drained(&mut dram);
        rpt.lines.clear();
        rpt.write(0, RptEntry::new(1, 1));
        rpt.drained(&mut dram);
        assert_eq!(dram.outstanding(), 1);
        run(&mut dram, |addr| assert!(rpt.read_back(addr)));
        rpt.drained(&mut dram);
        assert!(rpt.will_accept());
    }

    #[test]
    fn rpt_entry_index_names_table_slot() {
        assert_eq!(RptEntry::new(9, 2).entry_index(), 10);
    }
}
