use crate::mem::request::FLIT_BYTES;

// Sub-block tracked by the utilization bitmap.
pub const SUB_BLOCK_BYTES: u64 = 256;

// Metadata of one physical cache line.  `accessed` has one bit per 256B sub-block and
// `dirty_bits` one bit per 64B flit, so a 4096B line fits both masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tag {
    pub tag: u64,
    pub valid: bool,
    pub granularity: u64,
    accessed: u16,
    dirty_bits: u64,
}

impl Tag {
    pub fn new(tag: u64, granularity: u64) -> Self {
        debug_assert!(granularity.is_power_of_two() && (SUB_BLOCK_BYTES..=4096).contains(&granularity));
        Self {
            tag,
            valid: true,
            granularity,
            accessed: 0,
            dirty_bits: 0,
        }
    }

    pub fn invalid(granularity: u64) -> Self {
        Self {
            valid: false,
            ..Self::new(0, granularity)
        }
    }

    pub fn dirty(&self) -> bool {
        self.dirty_bits != 0
    }

    // Number of 256B sub-blocks touched since the line was filled.
    pub fn utilized(&self) -> u64 {
        self.accessed.count_ones() as u64
    }

    // Number of 64B flits written since the line was filled.
    pub fn dirty_count(&self) -> u32 {
        self.dirty_bits.count_ones()
    }

    pub fn flits(&self) -> u32 {
        (self.granularity / FLIT_BYTES) as u32
    }

    pub fn touch(&mut self, offset: u64, is_write: bool) {
        debug_assert!(offset < self.granularity);
        self.accessed |= 1 << (offset / SUB_BLOCK_BYTES);
        if is_write {
            self.dirty_bits |= 1 << (offset / FLIT_BYTES);
        }
    }

    pub fn mark_all_dirty(&mut self) {
        let flits = self.flits();
        self.dirty_bits = if flits >= 64 { u64::MAX } else { (1 << flits) - 1 };
    }

    pub fn invalidate(&mut self) {
        *self = Self::invalid(self.granularity);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_tag_is_clean() {
        let t = Tag::new(5, 4096);
        assert!(t.valid);
        assert!(!t.dirty());
        assert_eq!(t.utilized(), 0);
    }

    #[test]
    fn dirty_is_or_of_flit_bits() {
        let mut t = Tag::new(0, 4096);
        t.touch(0x10, false);
        assert!(!t.dirty());
        t.touch(0x40, true);
        t.touch(0x7f, true);
        t.touch(0x300, true);
        assert!(t.dirty());
        assert_eq!(t.dirty_count(), 2);
        assert_eq!(t.utilized(), 2);
    }

    #[test]
    fn mark_all_dirty_covers_line() {
        let mut t = Tag::new(0, 4096);
        t.mark_all_dirty();
        assert_eq!(t.dirty_count(), 64);
        let mut b = Tag::new(0, 256);
        b.mark_all_dirty();
        assert_eq!(b.dirty_count(), 4);
    }

    #[test]
    fn invalidate_keeps_granularity() {
        let mut t = Tag::new(9, 256);
        t.touch(0, true);
        t.invalidate();
        assert!(!t.valid);
        assert!(!t.dirty());
        assert_eq!(t.granularity, 256);
    }
}
