use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};

use anyhow::{ensure, Result};
use log::{debug, info, trace};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use serde_json::{json, Value};

use crate::mem::request::{RemoteRequest, Transaction, FLIT_BYTES};
use crate::policy::frontend::FrontEndCore;
use crate::policy::stats::Histogram;
use crate::policy::tag::Tag;
use crate::policy::tracker::Tracker;
use crate::policy::{BufferProbe, LineRef, PlacementPolicy, Region};
use crate::sim::config::CacheConfig;
use crate::timeq::Cycle;

pub mod mshr;
pub mod translation;
pub mod tuner;

use mshr::{block_of, page_of, MshrGroup};
use translation::{PtEntry, RptCache, RptEntry, SramCache, PTE_BYTES, RPTE_BYTES};
use tuner::ThresholdTuner;

pub const PAGE_BYTES: u64 = 4096;
pub const BLOCK_BYTES: u64 = 256;
const BLOCKS_PER_PAGE: u64 = PAGE_BYTES / BLOCK_BYTES;
const PAGE_FLITS: u32 = (PAGE_BYTES / FLIT_BYTES) as u32;
const BLOCK_FLITS: u32 = (BLOCK_BYTES / FLIT_BYTES) as u32;

const TLB_BYTES: u64 = 64 * 1024;
const BLOCK_TLB_BYTES: u64 = 1024 * 1024;
// lookups parked between translation and the tag check
const LOOKUP_QUEUE_CAPACITY: usize = 64;

pub(crate) fn hash_u64(mut x: u64) -> u64 {
    x ^= x >> 33;
    x = x.wrapping_mul(0xff51afd7ed558ccd);
    x ^= x >> 33;
    x = x.wrapping_mul(0xc4ceb9fe1a85ec53);
    x ^= x >> 33;
    x
}

fn pt_hash(page: u64) -> u32 {
    hash_u64(page) as u32
}

fn region_bytes(region: Region) -> u64 {
    match region {
        Region::Main => PAGE_BYTES,
        Region::Block => BLOCK_BYTES,
    }
}

// A fill that came back from the pool and waits for a translation slot.
#[derive(Debug, Clone, Copy)]
struct Insertion {
    region: Region,
    req_id: u64,
    pt_index: u64,
    offset: u64,
    rpt_index: u64,
    pte: PtEntry,
    collision: bool,
    // promoted blocks were dirty
    dirty: bool,
}

impl Insertion {
    fn new(region: Region, pt_index: u64, req_id: u64, dirty: bool) -> Self {
        Self {
            region,
            req_id,
            pt_index,
            offset: 0,
            rpt_index: 0,
            pte: PtEntry::INVALID,
            collision: false,
            dirty,
        }
    }
}

// A request whose translation is done and which now goes through the shared tag check.
#[derive(Debug, Clone, Copy)]
struct MetaReq {
    hex_addr: u64,
    is_write: bool,
    hit: Option<LineRef>,
}

// A page-region miss waiting for the block-region translation.
#[derive(Debug, Clone, Copy)]
struct BlockLookup {
    hex_addr: u64,
    is_write: bool,
    pt_index_br: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct OurStats {
    pub collisions: u64,
    pub non_collisions: u64,
    pub refill_to_page: u64,
    pub refill_to_block: u64,
    pub go_back_to_head: u64,
    pub promotions: u64,
    pub paddings: u64,
    pub wasted_blocks: u64,
    pub cross_region_writebacks: u64,
    pub hit_pr: u64,
    pub hit_br: u64,
    pub miss_both: u64,
    // page-region share of the capacity, in 1/16ths, sampled at every wrap
    pub region_capacity: Histogram,
    pub capacity_trace: Vec<(Cycle, u64)>,
}

impl Default for OurStats {
    fn default() -> Self {
        Self {
            collisions: 0,
            non_collisions: 0,
            refill_to_page: 0,
            refill_to_block: 0,
            go_back_to_head: 0,
            promotions: 0,
            paddings: 0,
            wasted_blocks: 0,
            cross_region_writebacks: 0,
            hit_pr: 0,
            hit_br: 0,
            miss_both: 0,
            region_capacity: Histogram::with_range(BLOCKS_PER_PAGE - 1),
            capacity_trace: Vec::new(),
        }
    }
}

// Adaptive hybrid: a page region filled upwards and a block region filled downwards share the
// cache capacity, both reached through hashed page tables whose lookups cost cache DRAM traffic.
pub struct Our {
    tracker: Tracker,
    pages: Vec<Tag>,
    blocks: Vec<Tag>,
    tlb: SramCache,
    rtlb: RptCache,
    tlb_br: SramCache,
    rtlb_br: RptCache,
    capacity: u64,
    page_cursor: u64,
    block_cursor: u64,
    pending_to_meta: VecDeque<MetaReq>,
    pending_to_pt: VecDeque<Insertion>,
    pending_to_pt_br: VecDeque<Insertion>,
    front_q_br: VecDeque<BlockLookup>,
    groups: HashMap<u64, MshrGroup>,
    fetch_engine_q: VecDeque<MshrGroup>,
    send_page_q: VecDeque<MshrGroup>,
    tuner: ThresholdTuner,
    mwl: u64,
    rng: StdRng,
    ratio: f64,
    hpt_ratio: u64,
    stats: OurStats,
}

impl Our {
    pub fn new(config: &CacheConfig) -> Self {
        let lines = config.cache_lines() as u64;
        let capacity = lines * PAGE_BYTES;

        let tlb = SramCache::new(capacity, lines * config.hpt_ratio, TLB_BYTES);
        let rtlb_base = capacity + tlb.len() * PTE_BYTES;
        let rtlb = RptCache::new(rtlb_base, lines);
        let br_base = rtlb_base + lines * RPTE_BYTES;
        let tlb_br = SramCache::new(br_base, lines * BLOCKS_PER_PAGE * config.hpt_ratio, BLOCK_TLB_BYTES);
        let rtlb_br = RptCache::new(br_base + tlb_br.len() * PTE_BYTES, lines * BLOCKS_PER_PAGE);

        let padding_t = 2 * config.remote_latency();
        let max_promotion = FLIT_BYTES / PTE_BYTES - 1;
        info!(
            "our front end: {} pages, page table {} entries, block table {} entries, padding {}",
            lines,
            tlb.len(),
            tlb_br.len(),
            padding_t
        );

        Self {
            tracker: Tracker::Our,
            pages: vec![Tag::invalid(PAGE_BYTES); lines as usize],
            blocks: vec![Tag::invalid(BLOCK_BYTES); (lines * BLOCKS_PER_PAGE) as usize],
            tlb,
            rtlb,
            tlb_br,
            rtlb_br,
            capacity,
            page_cursor: 0,
            block_cursor: capacity - BLOCK_BYTES,
            pending_to_meta: VecDeque::new(),
            pending_to_pt: VecDeque::new(),
            pending_to_pt_br: VecDeque::new(),
            front_q_br: VecDeque::new(),
            groups: HashMap::new(),
            fetch_engine_q: VecDeque::new(),
            send_page_q: VecDeque::new(),
            tuner: ThresholdTuner::new(padding_t, max_promotion, config.seed),
            mwl: config.mwl,
            rng: StdRng::seed_from_u64(config.seed),
            ratio: config.ratio,
            hpt_ratio: config.hpt_ratio,
            stats: OurStats::default(),
        }
    }

    pub fn stats(&self) -> &OurStats {
        &self.stats
    }

    pub fn tuner(&self) -> &ThresholdTuner {
        &self.tuner
    }

    pub fn pages(&self) -> &[Tag] {
        &self.pages
    }

    pub fn blocks(&self) -> &[Tag] {
        &self.blocks
    }

    // Suffix used to name the per-run output files.
    pub fn file_suffix(&self) -> String {
        format!("{}_{}_{}", self.ratio, self.hpt_ratio, self.mwl)
    }

    // Nothing left in the translation or fetch pipelines.
    fn pipelines_idle(&self) -> bool {
        self.pending_to_meta.is_empty()
            && self.pending_to_pt.is_empty()
            && self.pending_to_pt_br.is_empty()
            && self.front_q_br.is_empty()
            && self.groups.is_empty()
            && self.fetch_engine_q.is_empty()
            && self.send_page_q.is_empty()
            && self.tlb.is_idle()
            && self.rtlb.is_idle()
            && self.tlb_br.is_idle()
            && self.rtlb_br.is_idle()
    }

    fn tlb(&self, region: Region) -> &SramCache {
        match region {
            Region::Main => &self.tlb,
            Region::Block => &self.tlb_br,
        }
    }

    fn tlb_mut(&mut self, region: Region) -> &mut SramCache {
        match region {
            Region::Main => &mut self.tlb,
            Region::Block => &mut self.tlb_br,
        }
    }

    fn rtlb(&self, region: Region) -> &RptCache {
        match region {
            Region::Main => &self.rtlb,
            Region::Block => &self.rtlb_br,
        }
    }

    fn rtlb_mut(&mut self, region: Region) -> &mut RptCache {
        match region {
            Region::Main => &mut self.rtlb,
            Region::Block => &mut self.rtlb_br,
        }
    }

    fn cursor(&self, region: Region) -> u64 {
        match region {
            Region::Main => self.page_cursor,
            Region::Block => self.block_cursor,
        }
    }

    // Translate through the table of `region`.  A valid entry must point at a line holding it.
    fn resolve(&self, region: Region, pt_index: u64, hex_addr: u64) -> Option<LineRef> {
        let g = region_bytes(region);
        let aligned = hex_addr / g * g;
        let pte = self.tlb(region).find(pt_index, aligned)?;
        let line = LineRef {
            region,
            index: (pte.hex_cache_addr / g) as usize,
        };
        let t = self.line(line);
        if !(t.valid && t.tag == aligned) {
            panic!(
                "{region:?} translation of {aligned:#x} points at slot {} holding {:#x} (valid {})",
                line.index, t.tag, t.valid
            );
        }
        Some(line)
    }

    fn table_indices(&self, hex_addr: u64) -> (u32, u64, u64) {
        let hash = pt_hash(page_of(hex_addr));
        (hash, hash as u64 % self.tlb.len(), hash as u64 % self.tlb_br.len())
    }

    // Advance the allocation cursor of `region`; both restart once they meet.
    fn proceed_to_next_free(&mut self, now: Cycle, region: Region, record: bool) {
        match region {
            Region::Main => self.page_cursor += PAGE_BYTES,
            Region::Block => self.block_cursor -= BLOCK_BYTES,
        }
        if self.block_cursor < self.page_cursor + PAGE_BYTES {
            if record {
                let ratio = self.page_cursor / (self.capacity / BLOCKS_PER_PAGE);
                self.stats.region_capacity.sample(ratio);
                self.stats.capacity_trace.push((now, ratio));
                self.stats.go_back_to_head += 1;
            }
            debug!("allocation cursors wrap at {now}, page region reached {:#x}", self.page_cursor);
            self.block_cursor = self.capacity - BLOCK_BYTES;
            self.page_cursor = 0;
        }
    }

    // Drop the line at `slot` of `region` together with its translation.  Without a core the
    // update is untimed and dirty data is dropped.
    fn release(&mut self, core: Option<&mut FrontEndCore>, region: Region, slot: u64) {
        let timed = core.is_some();
        if timed {
            self.rtlb_mut(region).read(slot);
        } else {
            self.rtlb_mut(region).warm(slot, false, RptEntry::INVALID);
        }
        let rpte = self.rtlb(region).entry(slot);
        if !rpte.valid {
            return;
        }
        if timed {
            self.tlb_mut(region).write(rpte.pt_index, rpte.offset, PtEntry::INVALID);
            self.rtlb_mut(region).write(slot, RptEntry::INVALID);
        } else {
            self.tlb_mut(region).warm_write(rpte.pt_index, rpte.offset, PtEntry::INVALID);
            self.rtlb_mut(region).warm(slot, true, RptEntry::INVALID);
        }

        let line = LineRef {
            region,
            index: slot as usize,
        };
        let victim = *self.line(line);
        if let Some(core) = core {
            if victim.valid && victim.dirty() {
                let base = self.line_base(line);
                self.write_back_data(core, &victim, base);
                self.stats.cross_region_writebacks += 1;
            }
        }
        self.line_mut(line).invalidate();
    }

    // A fresh slot of `region` may overlap lines of the other region.
    fn free_aliases(&mut self, mut core: Option<&mut FrontEndCore>, region: Region, slot: u64) {
        match region {
            Region::Block => self.release(core, Region::Main, slot / BLOCKS_PER_PAGE),
            Region::Main => {
                for i in 0..BLOCKS_PER_PAGE {
                    self.release(core.as_deref_mut(), Region::Block, slot * BLOCKS_PER_PAGE + i);
                }
            }
        }
    }

    fn refill_to_region(&mut self, core: &mut FrontEndCore, mut ins: Insertion) {
        let g = region_bytes(ins.region);
        let (offset, pte) = match ins.region {
            Region::Main => self.tlb.free_slot(ins.pt_index, &mut self.rng),
            Region::Block => self.tlb_br.free_slot(ins.pt_index, &mut self.rng),
        };
        ins.offset = offset;
        if pte.valid {
            self.stats.collisions += 1;
            ins.collision = true;
            ins.rpt_index = pte.hex_cache_addr / g;
            ins.pte = PtEntry::new(ins.req_id, pte.hex_cache_addr);
            if self.cursor(ins.region) == pte.hex_cache_addr {
                self.proceed_to_next_free(core.clk(), ins.region, true);
            }
            self.insert_remote_page(core, ins);
        } else {
            self.stats.non_collisions += 1;
            self.alloc_cpage(core, ins);
        }
    }

    fn alloc_cpage(&mut self, core: &mut FrontEndCore, mut ins: Insertion) {
        let head = self.cursor(ins.region);
        let index = head / region_bytes(ins.region);
        ins.rpt_index = index;
        ins.pte = PtEntry::new(ins.req_id, head);
        self.rtlb_mut(ins.region).read(index);
        self.insert_remote_page(core, ins);
        self.proceed_to_next_free(core.clk(), ins.region, true);
    }

    fn insert_remote_page(&mut self, core: &mut FrontEndCore, ins: Insertion) {
        let region = ins.region;
        trace!(
            "insert {:#x} into {region:?} at {:#x}{}",
            ins.pte.hex_addr_aligned,
            ins.pte.hex_cache_addr,
            if ins.collision { " (collision)" } else { "" }
        );
        if !ins.collision {
            let rpte = self.rtlb(region).entry(ins.rpt_index);
            if rpte.valid {
                self.tlb_mut(region).write(rpte.pt_index, rpte.offset, PtEntry::INVALID);
            } else {
                self.free_aliases(Some(&mut *core), region, ins.rpt_index);
            }
        }

        self.rtlb_mut(region)
            .write(ins.rpt_index, RptEntry::new(ins.pt_index, ins.offset));
        self.tlb_mut(region).write(ins.pt_index, ins.offset, ins.pte);

        let line = LineRef {
            region,
            index: (ins.pte.hex_cache_addr / region_bytes(region)) as usize,
        };
        if region == Region::Main {
            let old = self.pages[line.index];
            if old.valid {
                self.tuner.window.line_utility.sample(old.utilized());
            }
        }
        core.do_refill(self, ins.pte.hex_addr_aligned, line);
        if region == Region::Main && ins.dirty {
            self.pages[line.index].mark_all_dirty();
        }
    }

    fn step_pending_to_pt(&mut self, core: &mut FrontEndCore, region: Region) {
        let front = match region {
            Region::Main => self.pending_to_pt.front(),
            Region::Block => self.pending_to_pt_br.front(),
        };
        let Some(ins) = front.copied() else {
            return;
        };
        if !self.rtlb(region).will_accept() || !self.tlb_mut(region).read(ins.pt_index) {
            return;
        }
        match region {
            Region::Main => {
                self.stats.refill_to_page += 1;
                self.pending_to_pt.pop_front();
            }
            Region::Block => {
                self.stats.refill_to_block += 1;
                self.pending_to_pt_br.pop_front();
            }
        }
        self.refill_to_region(core, ins);
    }

    // Decide how the oldest new group is fetched: as blocks, or as a whole page.
    fn step_fetch_engine(&mut self, core: &mut FrontEndCore) {
        let Some(front) = self.fetch_engine_q.front() else {
            return;
        };
        let pt_index_br = front.pt_hash as u64 % self.tlb_br.len();
        if !self.tlb_br.read(pt_index_br) {
            return;
        }
        let Some(mut m) = self.fetch_engine_q.pop_front() else {
            return;
        };
        let page = m.hex_addr_page;
        m.adjacent_blocks += self
            .tlb_br
            .group(pt_index_br)
            .iter()
            .filter(|pte| pte.valid && page_of(pte.hex_addr_aligned) == page)
            .count() as u64;
        m.adjacent_blocks += self
            .pending_to_pt_br
            .iter()
            .filter(|ins| page_of(ins.req_id) == page)
            .count() as u64;

        if m.adjacent_blocks > self.tuner.promotion_t() || m.reqs.len() > 1 {
            self.send_page_q.push_back(m);
            return;
        }

        let now = core.clk();
        for &block in m.blocks.iter() {
            core.send_remote(RemoteRequest::fetch(block, BLOCK_FLITS));
            m.send_time.insert(block, now);
        }
        for txn in m.reqs.iter() {
            core.mshr_merge(block_of(txn.addr), *txn);
        }
        m.clock = now;
        self.groups.insert(page, m);
    }

    // Promote the oldest queued group to a single page fetch.
    fn step_send_page(&mut self, core: &mut FrontEndCore) {
        let Some(front) = self.send_page_q.front() else {
            return;
        };
        let pt_index_br = front.pt_hash as u64 % self.tlb_br.len();
        if !self.tlb_br.read(pt_index_br) {
            return;
        }
        let Some(mut m) = self.send_page_q.pop_front() else {
            return;
        };
        let page = m.hex_addr_page;

        // blocks of this page already back but not inserted ride along with the page
        let (cancelled, kept): (VecDeque<Insertion>, VecDeque<Insertion>) =
            std::mem::take(&mut self.pending_to_pt_br)
                .into_iter()
                .partition(|ins| page_of(ins.req_id) == page);
        self.pending_to_pt_br = kept;
        for ins in cancelled {
            m.adjacent_blocks = m.adjacent_blocks.saturating_sub(1);
            if let Some(waiters) = core.mshr_take(ins.req_id) {
                m.reqs.extend(waiters);
            }
            m.blocks.insert(ins.req_id);
        }
        // remaining block entries only hold copies of m.reqs
        core.mshr_remove_range(page, page + PAGE_BYTES);

        let resident: Vec<(u64, PtEntry)> = self
            .tlb_br
            .group(pt_index_br)
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, pte)| pte.valid && page_of(pte.hex_addr_aligned) == page)
            .map(|(offset, pte)| (offset as u64, pte))
            .collect();
        for (offset, pte) in resident {
            let slot = pte.hex_cache_addr / BLOCK_BYTES;
            m.pte_br.push(pte);
            m.dirty |= self.blocks[slot as usize].dirty();
            self.blocks[slot as usize].invalidate();
            self.tlb_br.write(pt_index_br, offset, PtEntry::INVALID);
            self.rtlb_br.write(slot, RptEntry::INVALID);
        }

        let now = core.clk();
        m.page_region = true;
        m.send_time.insert(page, now);
        m.clock = now;
        core.send_remote(RemoteRequest::fetch(page, PAGE_FLITS));
        core.mshr_insert(page, m.reqs.iter().copied().collect());
        debug!("promote {page:#x} with {} waiting requests", m.reqs.len());
        self.groups.insert(page, m);
        self.stats.promotions += 1;
        self.tuner.window.promotions += 1;
    }

    fn step_meta(&mut self, core: &mut FrontEndCore) {
        let Some(req) = self.pending_to_meta.front().copied() else {
            return;
        };
        if core.process_one_req(self, req.hex_addr, req.is_write, req.hit) {
            self.pending_to_meta.pop_front();
        }
    }

    fn step_block_lookup(&mut self) {
        if self.pending_to_meta.len() >= LOOKUP_QUEUE_CAPACITY {
            return;
        }
        let Some(req) = self.front_q_br.front().copied() else {
            return;
        };
        if !self.tlb_br.read(req.pt_index_br) {
            return;
        }
        let hit = self.resolve(Region::Block, req.pt_index_br, req.hex_addr);
        if hit.is_some() {
            self.stats.hit_br += 1;
            self.tuner.window.hit_br += 1;
        } else {
            self.stats.miss_both += 1;
            self.tuner.window.miss += 1;
        }
        self.pending_to_meta.push_back(MetaReq {
            hex_addr: req.hex_addr,
            is_write: req.is_write,
            hit,
        });
        self.front_q_br.pop_front();
    }

    fn step_page_lookup(&mut self, core: &mut FrontEndCore) {
        if self.pending_to_meta.len() >= LOOKUP_QUEUE_CAPACITY
            || self.front_q_br.len() >= LOOKUP_QUEUE_CAPACITY
        {
            return;
        }
        let Some(txn) = core.front_q.front().copied() else {
            return;
        };
        let (_, pt_index, pt_index_br) = self.table_indices(txn.addr);
        if !self.tlb.read(pt_index) {
            return;
        }
        match self.resolve(Region::Main, pt_index, txn.addr) {
            Some(line) => {
                self.stats.hit_pr += 1;
                self.tuner.window.hit_pr += 1;
                self.pending_to_meta.push_back(MetaReq {
                    hex_addr: txn.addr,
                    is_write: txn.is_write,
                    hit: Some(line),
                });
            }
            None => self.front_q_br.push_back(BlockLookup {
                hex_addr: txn.addr,
                is_write: txn.is_write,
                pt_index_br,
            }),
        }
        core.front_q.pop_front();
    }

    fn refill_to_region_warm_up(&mut self, mut ins: Insertion, hex_addr: u64, is_write: bool) {
        let region = ins.region;
        let g = region_bytes(region);
        if ins.pte.valid {
            ins.rpt_index = ins.pte.hex_cache_addr / g;
        } else {
            let head = self.cursor(region);
            ins.rpt_index = head / g;
            ins.pte.hex_cache_addr = head;
            self.proceed_to_next_free(0, region, false);

            self.rtlb_mut(region).warm(ins.rpt_index, false, RptEntry::INVALID);
            let rpte = self.rtlb(region).entry(ins.rpt_index);
            if rpte.valid {
                self.tlb_mut(region).warm_write(rpte.pt_index, rpte.offset, PtEntry::INVALID);
            } else {
                self.free_aliases(None, region, ins.rpt_index);
            }
        }

        self.rtlb_mut(region)
            .warm(ins.rpt_index, true, RptEntry::new(ins.pt_index, ins.offset));
        let pte = PtEntry::new(ins.req_id, ins.pte.hex_cache_addr);
        self.tlb_mut(region).warm_write(ins.pt_index, ins.offset, pte);

        let tracker = self.tracker;
        let line = LineRef {
            region,
            index: ins.rpt_index as usize,
        };
        let t = self.line_mut(line);
        tracker.reset_tag(t, pte.hex_addr_aligned);
        tracker.add_transaction(hex_addr, is_write, t);
    }

    // Every valid forward entry must be claimed back by the reverse map and hold its line, and
    // no physical range may be live in both regions.
    pub fn check_translation(&self) -> Result<()> {
        for region in [Region::Main, Region::Block] {
            let g = region_bytes(region);
            for (i, pte) in self.tlb(region).entries().iter().enumerate() {
                if !pte.valid {
                    continue;
                }
                let slot = pte.hex_cache_addr / g;
                let rpte = self.rtlb(region).entry(slot);
                ensure!(
                    rpte.valid && rpte.entry_index() == i,
                    "{region:?} entry {i} claims slot {slot} but the reverse map holds {rpte:?}"
                );
                let t = self.line(LineRef {
                    region,
                    index: slot as usize,
                });
                ensure!(
                    t.valid && t.tag == pte.hex_addr_aligned,
                    "{region:?} entry {i} maps {:#x} to slot {slot} holding {:#x}",
                    pte.hex_addr_aligned,
                    t.tag
                );
            }
        }
        for (index, page) in self.pages.iter().enumerate() {
            if !page.valid {
                continue;
            }
            let first = index * BLOCKS_PER_PAGE as usize;
            let overlap = self.blocks[first..first + BLOCKS_PER_PAGE as usize]
                .iter()
                .filter(|t| t.valid)
                .count();
            ensure!(overlap == 0, "page slot {index} overlaps {overlap} live blocks");
        }
        Ok(())
    }
}

impl PlacementPolicy for Our {
    fn name(&self) -> String {
        "our".to_string()
    }

    fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    fn granularity(&self) -> u64 {
        PAGE_BYTES
    }

    fn line(&self, line: LineRef) -> &Tag {
        match line.region {
            Region::Main => &self.pages[line.index],
            Region::Block => &self.blocks[line.index],
        }
    }

    fn line_mut(&mut self, line: LineRef) -> &mut Tag {
        match line.region {
            Region::Main => &mut self.pages[line.index],
            Region::Block => &mut self.blocks[line.index],
        }
    }

    fn line_base(&self, line: LineRef) -> u64 {
        line.index as u64 * region_bytes(line.region)
    }

    fn lookup(&self, hex_addr: u64) -> Option<LineRef> {
        let (_, pt_index, pt_index_br) = self.table_indices(hex_addr);
        self.resolve(Region::Main, pt_index, hex_addr)
            .or_else(|| self.resolve(Region::Block, pt_index_br, hex_addr))
    }

    fn hex_tag(&self, remote_addr: u64) -> u64 {
        remote_addr
    }

    fn alloc_line(&mut self, remote_addr: u64) -> LineRef {
        unreachable!("{remote_addr:#x}: lines are placed through the translation tables")
    }

    fn miss_handler(&mut self, core: &mut FrontEndCore, hex_addr: u64, is_write: bool) {
        let page = page_of(hex_addr);
        let block = block_of(hex_addr);
        let txn = Transaction::new(hex_addr, is_write);
        let now = core.clk();

        if let Some(g) = self.groups.get_mut(&page) {
            g.push(txn);
            let interval = now.saturating_sub(g.clock);
            if g.page_region {
                core.mshr_merge(page, txn);
            } else if interval < self.tuner.padding_t() {
                // a second block miss this soon: fetch the whole page instead
                self.stats.paddings += 1;
                self.tuner.window.paddings += 1;
                self.tuner.window.padding_interval.sample(interval);
                if let Some(g) = self.groups.remove(&page) {
                    self.send_page_q.push_back(g);
                }
            } else if !core.has_mshr(block) {
                core.mshr_merge(block, txn);
                core.send_remote(RemoteRequest::fetch(block, BLOCK_FLITS));
                g.send_time.insert(block, now);
                g.clock = now;
            } else {
                core.mshr_merge(block, txn);
                g.clock = now;
            }
            return;
        }

        let queued = self
            .fetch_engine_q
            .iter_mut()
            .chain(self.send_page_q.iter_mut())
            .find(|g| g.hex_addr_page == page);
        match queued {
            Some(g) => g.push(txn),
            None => self
                .fetch_engine_q
                .push_back(MshrGroup::new(txn, pt_hash(page))),
        }
    }

    fn write_back_data(&mut self, core: &mut FrontEndCore, victim: &Tag, _cache_addr: u64) {
        core.send_remote(RemoteRequest::write_back(victim.tag, victim.dirty_count()));
    }

    fn hash_read_callback(&mut self, _core: &mut FrontEndCore, addr: u64) -> bool {
        self.rtlb.read_back(addr)
            || self.tlb.read_back(addr)
            || self.rtlb_br.read_back(addr)
            || self.tlb_br.read_back(addr)
    }

    fn check_other_buffer(&mut self, _core: &mut FrontEndCore, hex_addr: u64, is_write: bool) -> BufferProbe {
        let page = page_of(hex_addr);
        let block = block_of(hex_addr);
        if let Some(g) = self.groups.get_mut(&page) {
            if g.holds_block(block) {
                g.dirty |= is_write;
                return BufferProbe::Hit;
            }
        }
        if self.pending_to_pt_br.iter().any(|ins| ins.req_id == block) {
            return BufferProbe::Merge(block);
        }
        if self.pending_to_pt.iter().any(|ins| ins.req_id == page) {
            return BufferProbe::Merge(page);
        }
        BufferProbe::Miss
    }

    fn drained(&mut self, core: &mut FrontEndCore) {
        let dram = core.dram_mut();
        self.tlb.drained(dram);
        self.rtlb.drained(dram);
        self.tlb_br.drained(dram);
        self.rtlb_br.drained(dram);

        let now = core.clk();
        if now % self.mwl == 0 {
            self.tuner.adapt(now);
        }

        self.step_pending_to_pt(core, Region::Main);
        self.step_pending_to_pt(core, Region::Block);
        self.step_fetch_engine(core);
        self.step_send_page(core);
        self.step_meta(core);
        self.step_block_lookup();
        self.step_page_lookup(core);
        core.process_refill_req();
    }

    fn refill(&mut self, core: &mut FrontEndCore, req: RemoteRequest) {
        let now = core.clk();
        if req.sz == PAGE_FLITS {
            let page = req.hex_addr;
            let promoted = self.groups.get(&page).is_some_and(|g| g.page_region);
            let Some(g) = promoted.then(|| self.groups.remove(&page)).flatten() else {
                self.stats.wasted_blocks += 1;
                return;
            };
            if let Some(waited) = g.waited(page, now) {
                self.tuner.window.miss_penalty.sample(waited);
            }
            let pt_index = g.pt_hash as u64 % self.tlb.len();
            self.pending_to_pt
                .push_back(Insertion::new(Region::Main, pt_index, page, g.dirty));
            return;
        }

        let block = req.hex_addr;
        let page = page_of(block);
        let pt_index_br = match self.groups.get_mut(&page) {
            Some(g) if !g.page_region && g.send_time.contains_key(&block) => {
                g.retire_block(block);
                g.adjacent_blocks += 1;
                if let Some(waited) = g.waited(block, now) {
                    self.tuner.window.miss_penalty.sample(waited);
                }
                let pt_index_br = g.pt_hash as u64 % self.tlb_br.len();
                if g.blocks.is_empty() {
                    self.groups.remove(&page);
                }
                pt_index_br
            }
            _ => {
                // the page was promoted after this block left
                self.stats.wasted_blocks += 1;
                return;
            }
        };
        self.pending_to_pt_br
            .push_back(Insertion::new(Region::Block, pt_index_br, block, false));
    }

    fn warm_up(&mut self, _core: &mut FrontEndCore, hex_addr: u64, is_write: bool) {
        let page = page_of(hex_addr);
        let block = block_of(hex_addr);
        let (_, pt_index, pt_index_br) = self.table_indices(hex_addr);
        self.tlb.warm_read(pt_index);
        self.tlb_br.warm_read(pt_index_br);

        let tracker = self.tracker;
        if let Some(pte) = self.tlb.find(pt_index, page) {
            let t = &mut self.pages[(pte.hex_cache_addr / PAGE_BYTES) as usize];
            tracker.add_transaction(hex_addr, is_write, t);
            return;
        }
        if let Some(pte) = self.tlb_br.find(pt_index_br, block) {
            let t = &mut self.blocks[(pte.hex_cache_addr / BLOCK_BYTES) as usize];
            tracker.add_transaction(hex_addr, is_write, t);
            return;
        }

        let siblings: Vec<(u64, PtEntry)> = self
            .tlb_br
            .group(pt_index_br)
            .iter()
            .copied()
            .enumerate()
            .filter(|(_, pte)| pte.valid && page_of(pte.hex_addr_aligned) == page)
            .map(|(offset, pte)| (offset as u64, pte))
            .collect();

        let mut ins = if siblings.len() as u64 > self.tuner.promotion_t() {
            for (offset, pte) in siblings {
                let slot = pte.hex_cache_addr / BLOCK_BYTES;
                self.tlb_br.warm_write(pt_index_br, offset, PtEntry::INVALID);
                self.rtlb_br.warm(slot, true, RptEntry::INVALID);
                self.blocks[slot as usize].invalidate();
            }
            Insertion::new(Region::Main, pt_index, page, false)
        } else {
            Insertion::new(Region::Block, pt_index_br, block, false)
        };
        let (offset, pte) = match ins.region {
            Region::Main => self.tlb.free_slot(pt_index, &mut self.rng),
            Region::Block => self.tlb_br.free_slot(pt_index_br, &mut self.rng),
        };
        ins.offset = offset;
        ins.pte = pte;
        self.refill_to_region_warm_up(ins, hex_addr, is_write);
    }

    fn write_stats(&self, out: &mut dyn Write) -> io::Result<()> {
        let s = &self.stats;
        writeln!(out, "# hashmap collision time: {}", s.collisions)?;
        writeln!(out, "# non collision time: {}", s.non_collisions)?;
        for (name, tlb, rtlb) in [
            ("page", &self.tlb, &self.rtlb),
            ("block", &self.tlb_br, &self.rtlb_br),
        ] {
            writeln!(out, "# {name} region TLB hit: {}", tlb.stats().hits)?;
            writeln!(out, "# {name} region TLB miss: {}", tlb.stats().misses)?;
            writeln!(out, "# {name} region RTLB hit: {}", rtlb.stats().hits)?;
            writeln!(out, "# {name} region RTLB miss: {}", rtlb.stats().misses)?;
        }
        writeln!(out, "# times of refilling to page: {}", s.refill_to_page)?;
        writeln!(out, "# times of refilling to block: {}", s.refill_to_block)?;
        writeln!(out, "# promotions: {} (padding {})", s.promotions, s.paddings)?;
        writeln!(out, "# num of wasted block: {}", s.wasted_blocks)?;
        writeln!(out, "# cross region write backs: {}", s.cross_region_writebacks)?;
        writeln!(out, "# times of go back to head: {}", s.go_back_to_head)?;
        writeln!(
            out,
            "# Final threshold status: {} {}",
            self.tuner.promotion_t(),
            self.tuner.padding_t()
        )?;
        writeln!(out, "# page region share of capacity (1/16)")?;
        s.region_capacity.write_to(out)
    }

    fn summary(&self) -> Value {
        json!({
            "stats": self.stats,
            "page_tlb": self.tlb.stats(),
            "page_rtlb": self.rtlb.stats(),
            "block_tlb": self.tlb_br.stats(),
            "block_rtlb": self.rtlb_br.stats(),
            "promotion_t": self.tuner.promotion_t(),
            "padding_t": self.tuner.padding_t(),
            "history": self.tuner.history().collect::<Vec<_>>(),
        })
    }

    fn reset_stats(&mut self) {
        self.stats = OurStats::default();
        self.tlb.reset_stats();
        self.rtlb.reset_stats();
        self.tlb_br.reset_stats();
        self.rtlb_br.reset_stats();
    }

    fn is_idle(&self) -> bool {
        self.pipelines_idle()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::dram::SimpleDram;
    use crate::sim::config::{CachePolicyKind, DramConfig};

    fn config(lines: u64) -> CacheConfig {
        CacheConfig {
            granularity: PAGE_BYTES,
            working_set_bytes: lines * PAGE_BYTES,
            ratio: 1.0,
            cache_policy: CachePolicyKind::Our,
            ..CacheConfig::default()
        }
    }

    fn core(cfg: &CacheConfig) -> FrontEndCore {
        FrontEndCore::new(cfg, Box::new(SimpleDram::new(&DramConfig::default())))
    }

    #[test]
    fn hash_is_stable() {
        assert_eq!(hash_u64(0), 0);
        assert_ne!(hash_u64(4096), hash_u64(8192));
        assert_eq!(pt_hash(4096), hash_u64(4096) as u32);
    }

    #[test]
    fn tables_are_laid_out_after_the_data() {
        let our = Our::new(&config(16));
        assert_eq!(our.capacity, 16 * PAGE_BYTES);
        assert_eq!(our.tlb.len(), 32);
        assert_eq!(our.tlb_br.len(), 16 * 16 * 2);
        assert_eq!(our.block_cursor, 16 * PAGE_BYTES - BLOCK_BYTES);
        assert_eq!(our.tuner.padding_t(), 2 * config(16).remote_latency());
    }

    #[test]
    fn cursors_wrap_together() {
        let mut our = Our::new(&config(4));
        // 4 pages: after one page, 32 blocks leave no room for another page
        our.proceed_to_next_free(5, Region::Main, true);
        for _ in 0..31 {
            our.proceed_to_next_free(6, Region::Block, true);
        }
        assert_eq!(our.stats.go_back_to_head, 0);
        our.proceed_to_next_free(7, Region::Block, true);
        assert_eq!(our.stats.go_back_to_head, 1);
        assert_eq!(our.page_cursor, 0);
        assert_eq!(our.block_cursor, 4 * PAGE_BYTES - BLOCK_BYTES);
        assert_eq!(our.stats.capacity_trace, vec![(7, 4)]);
    }

    #[test]
    fn warm_up_installs_block_then_promotes_page() {
        let mut our = Our::new(&config(16));
        let mut core = core(&config(16));
        our.warm_up(&mut core, 0x10040, true);
        let line = our.lookup(0x10040).unwrap();
        assert_eq!(line.region, Region::Block);
        assert!(our.line(line).dirty());
        our.check_translation().unwrap();

        // PROMOTION_T starts at 0, so one resident sibling moves the page to the page region
        our.warm_up(&mut core, 0x10800, false);
        let line = our.lookup(0x10800).unwrap();
        assert_eq!(line.region, Region::Main);
        assert!(our.lookup(0x10040).map_or(true, |l| l.region == Region::Main));
        our.check_translation().unwrap();
    }

    #[test]
    fn warm_up_hit_only_touches_line() {
        let mut our = Our::new(&config(16));
        let mut core = core(&config(16));
        our.warm_up(&mut core, 0x20000, false);
        let line = our.lookup(0x20000).unwrap();
        our.warm_up(&mut core, 0x20010, true);
        assert_eq!(our.lookup(0x20010), Some(line));
        assert!(our.line(line).dirty());
    }

    #[test]
    fn stale_block_fill_is_wasted() {
        let mut our = Our::new(&config(16));
        let mut core = core(&config(16));
        our.refill(&mut core, RemoteRequest::fetch(0x3100, BLOCK_FLITS));
        our.refill(&mut core, RemoteRequest::fetch(0x3000, PAGE_FLITS));
        assert_eq!(our.stats.wasted_blocks, 2);
        assert!(our.pending_to_pt_br.is_empty());
        assert!(our.pending_to_pt.is_empty());
    }

    #[test]
    fn first_miss_waits_in_fetch_engine() {
        let mut our = Our::new(&config(16));
        let mut core = core(&config(16));
        our.miss_handler(&mut core, 0x5040, false);
        our.miss_handler(&mut core, 0x5300, true);
        assert_eq!(our.fetch_engine_q.len(), 1);
        assert_eq!(our.fetch_engine_q[0].reqs.len(), 2);
        assert_eq!(our.fetch_engine_q[0].blocks.len(), 2);
        assert_eq!(core.lsq_len(), 0);
    }

    #[test]
    fn returned_block_merges_instead_of_refetching() {
        let mut our = Our::new(&config(16));
        let mut core = core(&config(16));
        let mut g = MshrGroup::new(Transaction::read(0x7100), pt_hash(0x7000));
        g.send_time.insert(0x7100, 0);
        our.groups.insert(0x7000, g);
        core.mshr_merge(0x7100, Transaction::read(0x7100));
        our.refill(&mut core, RemoteRequest::fetch(0x7100, BLOCK_FLITS));
        assert!(our.groups.is_empty());
        assert_eq!(
            our.check_other_buffer(&mut core, 0x7140, false),
            BufferProbe::Merge(0x7100)
        );
        assert_eq!(our.check_other_buffer(&mut core, 0x7200, false), BufferProbe::Miss);
    }
}
