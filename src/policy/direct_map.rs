use log::info;

use crate::mem::request::{RemoteRequest, Transaction, FLIT_BYTES};
use crate::policy::frontend::FrontEndCore;
use crate::policy::tag::Tag;
use crate::policy::tracker::Tracker;
use crate::policy::{LineRef, PlacementPolicy};
use crate::sim::config::CacheConfig;

// One slot per index: slot = (addr & capacity_mask) / granularity.
pub struct DirectMap {
    lines: Vec<Tag>,
    granularity: u64,
    capacity_mask: u64,
    tracker: Tracker,
}

impl DirectMap {
    pub fn new(config: &CacheConfig) -> Self {
        let lines = config.cache_lines();
        info!("direct mapped front end: {} lines of {}B", lines, config.granularity);
        Self {
            lines: vec![Tag::invalid(config.granularity); lines],
            granularity: config.granularity,
            capacity_mask: lines as u64 * config.granularity - 1,
            tracker: Tracker::DirectMap { lines: lines as u64 },
        }
    }

    fn index_of(&self, hex_addr: u64) -> usize {
        ((hex_addr & self.capacity_mask) / self.granularity) as usize
    }

    pub fn lines(&self) -> &[Tag] {
        &self.lines
    }
}

impl PlacementPolicy for DirectMap {
    fn name(&self) -> String {
        format!("DirectMap_{}", self.granularity)
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
        let index = self.index_of(hex_addr);
        let t = &self.lines[index];
        (t.valid && t.tag == self.hex_tag(hex_addr)).then(|| LineRef::main(index))
    }

    fn hex_tag(&self, remote_addr: u64) -> u64 {
        remote_addr / self.granularity / self.lines.len() as u64
    }

    fn alloc_line(&mut self, remote_addr: u64) -> LineRef {
        LineRef::main(self.index_of(remote_addr))
    }

    fn miss_handler(&mut self, core: &mut FrontEndCore, hex_addr: u64, is_write: bool) {
        let remote = hex_addr / self.granularity * self.granularity;
        if core.mshr_merge(remote, Transaction::new(hex_addr, is_write)) {
            core.send_remote(RemoteRequest::fetch(remote, (self.granularity / FLIT_BYTES) as u32));
        }
    }

    fn write_back_data(&mut self, core: &mut FrontEndCore, victim: &Tag, cache_addr: u64) {
        let remote = self.tracker.remote_addr(victim, cache_addr);
        core.send_remote(RemoteRequest::write_back(remote, victim.dirty_count()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::dram::SimpleDram;
    use crate::sim::config::DramConfig;

    // 16 lines of 4096B
    fn config() -> CacheConfig {
        CacheConfig {
            granularity: 4096,
            working_set_bytes: 16 * 4096,
            ratio: 1.0,
            ..CacheConfig::default()
        }
    }

    fn core() -> FrontEndCore {
        FrontEndCore::new(&config(), Box::new(SimpleDram::new(&DramConfig::default())))
    }

    #[test]
    fn slot_and_tag_split_the_address() {
        let mut dm = DirectMap::new(&config());
        assert_eq!(dm.capacity_mask, 16 * 4096 - 1);
        // remote line 35 = tag 2, index 3
        assert_eq!(dm.index_of(35 * 4096 + 0x7c0), 3);
        assert_eq!(dm.hex_tag(35 * 4096 + 0x7c0), 2);
        assert_eq!(dm.index_of(15 * 4096), 15);
        assert_eq!(dm.hex_tag(15 * 4096), 0);
        assert_eq!(dm.alloc_line(19 * 4096), LineRef::main(3));
        assert_eq!(dm.name(), "DirectMap_4096");
    }

    #[test]
    fn lookup_needs_matching_tag() {
        let mut dm = DirectMap::new(&config());
        assert_eq!(dm.lookup(35 * 4096), None);
        dm.lines[3] = Tag::new(2, 4096);
        assert_eq!(dm.lookup(35 * 4096 + 100), Some(LineRef::main(3)));
        // same index, other tags
        assert_eq!(dm.lookup(3 * 4096), None);
        assert_eq!(dm.lookup(19 * 4096), None);
        dm.lines[3].invalidate();
        assert_eq!(dm.lookup(35 * 4096), None);
    }

    #[test]
    fn victim_goes_back_to_its_remote_line() {
        let mut dm = DirectMap::new(&config());
        let mut core = core();
        let mut victim = Tag::new(2, 4096);
        victim.touch(0x40, true);
        victim.touch(0x80, true);
        victim.touch(0x800, false);
        dm.write_back_data(&mut core, &victim, dm.line_base(LineRef::main(3)));

        let wb = core.pop_remote().unwrap();
        assert_eq!((wb.hex_addr, wb.sz, wb.is_write), (35 * 4096, 2, true));
        assert_eq!(core.pop_remote(), None);
    }

    #[test]
    fn misses_to_one_line_fetch_it_once() {
        let mut dm = DirectMap::new(&config());
        let mut core = core();
        dm.miss_handler(&mut core, 35 * 4096 + 0x40, false);
        dm.miss_handler(&mut core, 35 * 4096 + 0x80, true);

        let fetch = core.pop_remote().unwrap();
        assert_eq!((fetch.hex_addr, fetch.sz, fetch.is_write), (35 * 4096, 64, false));
        assert_eq!(core.pop_remote(), None);
        assert_eq!(core.mshr_waiters(35 * 4096).map(|w| w.len()), Some(2));
    }
}
