use crate::timeq::Cycle;

// Size of one remote access unit.
pub const FLIT_BYTES: u64 = 64;

// Bytes a read request occupies on the link before its data comes back.
pub const REQUEST_HEADER_BYTES: u32 = 16;

// One pending local request fragment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transaction {
    pub addr: u64,
    pub is_write: bool,
}

impl Transaction {
    pub fn new(addr: u64, is_write: bool) -> Self {
        Self { addr, is_write }
    }

    pub fn read(addr: u64) -> Self {
        Self::new(addr, false)
    }

    pub fn write(addr: u64) -> Self {
        Self::new(addr, true)
    }
}

// A request travelling between the cache and the remote pool.  `sz` counts 64B flits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteRequest {
    pub hex_addr: u64,
    pub sz: u32,
    pub is_write: bool,
    pub exit_time: Cycle,
}

impl RemoteRequest {
    pub fn new(is_write: bool, hex_addr: u64, sz: u32) -> Self {
        assert!(sz > 0, "remote request {hex_addr:#x} carries no flits");
        Self {
            hex_addr,
            sz,
            is_write,
            exit_time: 0,
        }
    }

    pub fn fetch(hex_addr: u64, sz: u32) -> Self {
        Self::new(false, hex_addr, sz)
    }

    pub fn write_back(hex_addr: u64, sz: u32) -> Self {
        Self::new(true, hex_addr, sz)
    }

    pub fn data_bytes(&self) -> u32 {
        self.sz * FLIT_BYTES as u32
    }

    // Bytes serialized on the cache-to-pool direction.
    pub fn egress_bytes(&self) -> u32 {
        if self.is_write {
            REQUEST_HEADER_BYTES + self.data_bytes()
        } else {
            REQUEST_HEADER_BYTES
        }
    }

    // Bytes serialized on the pool-to-cache direction.
    pub fn ingress_bytes(&self) -> u32 {
        if self.is_write {
            REQUEST_HEADER_BYTES
        } else {
            self.data_bytes()
        }
    }

    pub fn flit_addrs(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.sz as u64).map(move |i| self.hex_addr + i * FLIT_BYTES)
    }
}
