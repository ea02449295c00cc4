use std::collections::{BTreeSet, HashMap};

use crate::mem::request::Transaction;
use crate::policy::our::translation::PtEntry;
use crate::policy::our::{BLOCK_BYTES, PAGE_BYTES};
use crate::timeq::Cycle;

// Misses to one remote page.  The group first waits in the fetch engine, is then either sent
// as block fetches or queued for a page fetch, and lives in the group table while data is on
// its way.
#[derive(Debug, Clone)]
pub struct MshrGroup {
    pub reqs: Vec<Transaction>,
    // block-aligned addresses touched so far
    pub blocks: BTreeSet<u64>,
    pub pt_hash: u32,
    pub page_region: bool,
    pub adjacent_blocks: u64,
    pub hex_addr_page: u64,
    // block-region entries folded into the page being fetched
    pub pte_br: Vec<PtEntry>,
    pub dirty: bool,
    // last time a block fetch was issued or joined
    pub clock: Cycle,
    pub send_time: HashMap<u64, Cycle>,
}

impl MshrGroup {
    pub fn new(txn: Transaction, pt_hash: u32) -> Self {
        Self {
            reqs: vec![txn],
            blocks: BTreeSet::from([block_of(txn.addr)]),
            pt_hash,
            page_region: false,
            adjacent_blocks: 0,
            hex_addr_page: page_of(txn.addr),
            pte_br: Vec::new(),
            dirty: false,
            clock: 0,
            send_time: HashMap::new(),
        }
    }

    pub fn push(&mut self, txn: Transaction) {
        self.blocks.insert(block_of(txn.addr));
        self.reqs.push(txn);
    }

    // Forget the requests served by the fill of `block`.
    pub fn retire_block(&mut self, block: u64) {
        self.reqs.retain(|txn| block_of(txn.addr) != block);
        self.blocks.remove(&block);
    }

    pub fn holds_block(&self, block: u64) -> bool {
        self.pte_br
            .iter()
            .any(|pte| pte.valid && pte.hex_addr_aligned == block)
    }

    pub fn waited(&self, addr: u64, now: Cycle) -> Option<Cycle> {
        self.send_time.get(&addr).map(|sent| now.saturating_sub(*sent))
    }
}

pub fn page_of(addr: u64) -> u64 {
    addr / PAGE_BYTES * PAGE_BYTES
}

pub fn block_of(addr: u64) -> u64 {
    addr / BLOCK_BYTES * BLOCK_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_group_tracks_first_block() {
        let g = MshrGroup::new(Transaction::read(0x5140), 7);
        assert_eq!(g.hex_addr_page, 0x5000);
        assert!(g.blocks.contains(&0x5100));
        assert_eq!(g.reqs.len(), 1);
    }

    #[test]
    fn retire_block_drops_its_requests() {
        let mut g = MshrGroup::new(Transaction::read(0x5140), 7);
        g.push(Transaction::write(0x5180));
        g.push(Transaction::read(0x5300));
        g.retire_block(0x5100);
        assert_eq!(g.reqs, vec![Transaction::read(0x5300)]);
        assert_eq!(g.blocks.iter().copied().collect::<Vec<_>>(), vec![0x5300]);
    }

    #[test]
    fn waited_measures_from_send() {
        let mut g = MshrGroup::new(Transaction::read(0x1000), 0);
        g.send_time.insert(0x1000, 40);
        assert_eq!(g.waited(0x1000, 100), Some(60));
        assert_eq!(g.waited(0x1100, 100), None);
    }
}
