use crate::policy::tag::Tag;

// Decides whether a physical line (or a line parked in the write-back buffer) holds a given
// remote address, and applies per-access bookkeeping to the line handed in by the policy.
// It only keeps the geometry needed to rebuild addresses, never the lines themselves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tracker {
    // tag = addr / granularity / lines
    DirectMap { lines: u64 },
    // tag = addr / granularity / buckets, 4 slots per bucket
    Kona { buckets: u64 },
    // tag is the aligned remote address itself
    Our,
    // front end without lines: nothing is ever resident
    None,
}

impl Tracker {
    // Line-aligned remote address held by `t` when it sits at `cache_addr`.
    pub fn remote_addr(&self, t: &Tag, cache_addr: u64) -> u64 {
        let g = t.granularity;
        match *self {
            Tracker::DirectMap { lines } => (t.tag * lines + cache_addr / g) * g,
            Tracker::Kona { buckets } => (cache_addr / g / 4 + t.tag * buckets) * g,
            Tracker::Our | Tracker::None => t.tag,
        }
    }

    pub fn test_hit(&self, t: &Tag, hex_addr: u64, cache_addr: u64) -> bool {
        if *self == Tracker::None {
            return false;
        }
        t.valid && self.remote_addr(t, cache_addr) == hex_addr / t.granularity * t.granularity
    }

    pub fn add_transaction(&self, offset: u64, is_write: bool, t: &mut Tag) {
        t.touch(offset & (t.granularity - 1), is_write);
    }

    pub fn reset_tag(&self, t: &mut Tag, tag: u64) {
        *t = Tag::new(tag, t.granularity);
    }
}
