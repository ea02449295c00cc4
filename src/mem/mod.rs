pub mod dram;
pub mod ethernet;
pub mod pool;
pub mod request;

pub use dram::{DramCompletion, DramStats, DramSystem, SimpleDram};
pub use ethernet::Ethernet;
pub use pool::MemoryPool;
pub use request::{RemoteRequest, Transaction, FLIT_BYTES};
