use log::trace;
use serde::Serialize;

use crate::timeq::{Backpressure, Cycle, ServerConfig, ServiceRequest, TimedServer};

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct LinkStats {
    sent: u64,
    bytes: u64,
    delivered: u64,
    stalls: u64,
}

impl LinkStats {
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn delivered(&self) -> u64 {
        self.delivered
    }

    pub fn stalls(&self) -> u64 {
        self.stalls
    }
}

// One direction of the cache <-> pool link: a propagation delay plus a bandwidth limit, with
// in-order delivery.
#[derive(Debug)]
pub struct Ethernet<T> {
    name: &'static str,
    server: TimedServer<T>,
    stats: LinkStats,
}

impl<T> Ethernet<T> {
    pub fn new(name: &'static str, latency: Cycle, bytes_per_cycle: u32, queue_capacity: usize) -> Self {
        Self {
            name,
            server: TimedServer::new(ServerConfig {
                base_latency: latency,
                bytes_per_cycle,
                queue_capacity,
            }),
            stats: LinkStats::default(),
        }
    }

    pub fn will_accept(&self) -> bool {
        !self.server.is_full()
    }

    // Returns the payload back when the link queue is full.
    pub fn try_send(&mut self, now: Cycle, item: T, bytes: u32) -> Result<Cycle, T> {
        match self.server.try_enqueue(now, ServiceRequest::new(item, bytes)) {
            Ok(ticket) => {
                trace!("{}: {} bytes exit at {}", self.name, bytes, ticket.ready_at());
                self.stats.sent = self.stats.sent.saturating_add(1);
                self.stats.bytes = self.stats.bytes.saturating_add(bytes as u64);
                Ok(ticket.ready_at())
            }
            Err(Backpressure::QueueFull { request, .. }) => {
                self.stats.stalls = self.stats.stalls.saturating_add(1);
                Err(request.payload)
            }
        }
    }

    pub fn pop_ready(&mut self, now: Cycle) -> Option<T> {
        let result = self.server.pop_ready(now)?;
        self.stats.delivered = self.stats.delivered.saturating_add(1);
        Some(result.payload)
    }

    pub fn peek_exit_time(&self) -> Option<Cycle> {
        self.server.oldest_ticket().map(|ticket| ticket.ready_at())
    }

    pub fn in_flight(&self) -> usize {
        self.server.len()
    }

    pub fn stats(&self) -> LinkStats {
        self.stats
    }

    pub fn reset_stats(&mut self) {
        self.stats = LinkStats::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_waits_for_latency_and_serialization() {
        let mut link: Ethernet<u64> = Ethernet::new("egress", 100, 16, 8);
        let exit = link.try_send(0, 7, 64).unwrap();
        assert_eq!(exit, 104);
        assert!(link.pop_ready(103).is_none());
        assert_eq!(link.pop_ready(104), Some(7));
        assert_eq!(link.stats().delivered(), 1);
    }

    #[test]
    fn bandwidth_spaces_out_large_payloads() {
        let mut link: Ethernet<u64> = Ethernet::new("ingress", 10, 16, 8);
        let first = link.try_send(0, 1, 4096).unwrap();
        let second = link.try_send(0, 2, 16).unwrap();
        assert_eq!(first, 266);
        assert_eq!(second, 267);
    }

    #[test]
    fn full_link_hands_back_item() {
        let mut link: Ethernet<u64> = Ethernet::new("egress", 1, 16, 1);
        link.try_send(0, 1, 16).unwrap();
        assert!(!link.will_accept());
        assert_eq!(link.try_send(0, 2, 16), Err(2));
        assert_eq!(link.stats().stalls(), 1);
    }
}
