use crate::mem::request::{RemoteRequest, FLIT_BYTES};
use crate::policy::frontend::FrontEndCore;
use crate::policy::tag::Tag;
use crate::policy::tracker::Tracker;
use crate::policy::{LineRef, PlacementPolicy};

// Pass-through front end: every request goes to the pool as a single flit, nothing is cached.
#[derive(Debug)]
pub struct Dummy {
    tracker: Tracker,
}

impl Dummy {
    pub fn new() -> Self {
        Self {
            tracker: Tracker::None,
        }
    }
}

impl PlacementPolicy for Dummy {
    fn name(&self) -> String {
        "Dummy".to_string()
    }

    fn tracker(&self) -> &Tracker {
        &self.tracker
    }

    fn granularity(&self) -> u64 {
        FLIT_BYTES
    }

    fn line(&self, _line: LineRef) -> &Tag {
        unreachable!("dummy front end holds no lines")
    }

    fn line_mut(&mut self, _line: LineRef) -> &mut Tag {
        unreachable!("dummy front end holds no lines")
    }

    fn line_base(&self, _line: LineRef) -> u64 {
        0
    }

    fn lookup(&self, _hex_addr: u64) -> Option<LineRef> {
        None
    }

    fn hex_tag(&self, remote_addr: u64) -> u64 {
        remote_addr
    }

    fn alloc_line(&mut self, _remote_addr: u64) -> LineRef {
        unreachable!("dummy front end never allocates")
    }

    fn miss_handler(&mut self, core: &mut FrontEndCore, hex_addr: u64, is_write: bool) {
        // the request address doubles as the response id
        core.send_remote(RemoteRequest::new(is_write, hex_addr, 1));
    }

    fn write_back_data(&mut self, _core: &mut FrontEndCore, _victim: &Tag, _cache_addr: u64) {}

    fn drained(&mut self, core: &mut FrontEndCore) {
        let Some(txn) = core.front_q.pop_front() else {
            return;
        };
        self.miss_handler(core, txn.addr, txn.is_write);
        core.stats_mut().record_miss();
    }

    fn refill(&mut self, core: &mut FrontEndCore, req: RemoteRequest) {
        let now = core.clk();
        core.respond(req.hex_addr, now + 1);
    }

    fn warm_up(&mut self, _core: &mut FrontEndCore, _hex_addr: u64, _is_write: bool) {}
}
