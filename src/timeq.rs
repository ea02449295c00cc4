/*
Bandwidth/latency model shared by the DRAM banks and both link directions.

A TimedServer holds a bounded FIFO of payloads.  Each accepted payload occupies the server for
ceil(bytes / bytes_per_cycle) cycles and then waits base_latency more before it can be popped.
Occupancy is pipelined: the next payload starts once the previous one has been serialized, so
latencies overlap.  A full FIFO rejects with Backpressure and returns the payload untouched.
*/

use std::collections::VecDeque;

pub type Cycle = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ticket {
    issued_at: Cycle,
    ready_at: Cycle,
}

impl Ticket {
    pub fn issued_at(&self) -> Cycle {
        self.issued_at
    }

    pub fn ready_at(&self) -> Cycle {
        self.ready_at
    }

    pub fn is_ready(&self, now: Cycle) -> bool {
        now >= self.ready_at
    }
}

#[derive(Debug)]
pub struct ServiceRequest<T> {
    pub payload: T,
    pub size_bytes: u32,
}

impl<T> ServiceRequest<T> {
    pub fn new(payload: T, size_bytes: u32) -> Self {
        Self { payload, size_bytes }
    }
}

#[derive(Debug)]
pub struct ServiceResult<T> {
    pub payload: T,
    pub ticket: Ticket,
}

#[derive(Debug)]
pub enum Backpressure<T> {
    QueueFull { request: ServiceRequest<T>, capacity: usize },
}

impl<T> Backpressure<T> {
    pub fn into_request(self) -> ServiceRequest<T> {
        match self {
            Backpressure::QueueFull { request, .. } => request,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ServerConfig {
    pub base_latency: Cycle,
    pub bytes_per_cycle: u32,
    pub queue_capacity: usize,
}

#[derive(Debug)]
struct Queued<T> {
    payload: T,
    ticket: Ticket,
}

// Tickets leave in issue order because `busy_until` never decreases.
#[derive(Debug)]
pub struct TimedServer<T> {
    config: ServerConfig,
    queue: VecDeque<Queued<T>>,
    busy_until: Cycle,
}

impl<T> TimedServer<T> {
    pub fn new(config: ServerConfig) -> Self {
        assert!(config.bytes_per_cycle > 0, "server needs a positive bandwidth");
        assert!(config.queue_capacity > 0, "server needs room for one request");
        Self {
            config,
            queue: VecDeque::with_capacity(config.queue_capacity),
            busy_until: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.len() >= self.config.queue_capacity
    }

    pub fn try_enqueue(
        &mut self,
        now: Cycle,
        request: ServiceRequest<T>,
    ) -> Result<Ticket, Backpressure<T>> {
        if self.is_full() {
            return Err(Backpressure::QueueFull {
                request,
                capacity: self.config.queue_capacity,
            });
        }

        let occupancy = (request.size_bytes as u64).div_ceil(self.config.bytes_per_cycle as u64);
        self.busy_until = self.busy_until.max(now).saturating_add(occupancy);
        let ticket = Ticket {
            issued_at: now,
            ready_at: self.busy_until.saturating_add(self.config.base_latency),
        };
        self.queue.push_back(Queued {
            payload: request.payload,
            ticket,
        });
        Ok(ticket)
    }

    pub fn pop_ready(&mut self, now: Cycle) -> Option<ServiceResult<T>> {
        if !self.queue.front()?.ticket.is_ready(now) {
            return None;
        }
        self.queue.pop_front().map(|queued| ServiceResult {
            payload: queued.payload,
            ticket: queued.ticket,
        })
    }

    // Hands every payload finished by `now` to `callback`, oldest first.
    pub fn service_ready<F>(&mut self, now: Cycle, mut callback: F)
    where
        F: FnMut(ServiceResult<T>),
    {
        while let Some(result) = self.pop_ready(now) {
            callback(result);
        }
    }

    // Earliest cycle a new payload could start serializing.
    pub fn available_at(&self) -> Cycle {
        self.busy_until
    }

    pub fn oldest_ticket(&self) -> Option<&Ticket> {
        self.queue.front().map(|queued| &queued.ticket)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(latency: Cycle, bpc: u32, cap: usize) -> TimedServer<u32> {
        TimedServer::new(ServerConfig {
            base_latency: latency,
            bytes_per_cycle: bpc,
            queue_capacity: cap,
        })
    }

    #[test]
    fn ticket_pays_serialization_and_latency() {
        let mut srv = server(10, 16, 4);
        let ticket = srv.try_enqueue(5, ServiceRequest::new(1, 64)).unwrap();
        assert_eq!(ticket.issued_at(), 5);
        assert_eq!(ticket.ready_at(), 5 + 4 + 10);
    }

    #[test]
    fn back_to_back_requests_pipeline() {
        let mut srv = server(10, 16, 4);
        let first = srv.try_enqueue(0, ServiceRequest::new(1, 64)).unwrap();
        let second = srv.try_enqueue(0, ServiceRequest::new(2, 64)).unwrap();
        assert_eq!(first.ready_at(), 14);
        assert_eq!(second.ready_at(), 18);
        assert_eq!(srv.available_at(), 8);
    }

    #[test]
    fn partial_cycle_rounds_up() {
        let mut srv = server(0, 64, 2);
        let ticket = srv.try_enqueue(0, ServiceRequest::new(1, 65)).unwrap();
        assert_eq!(ticket.ready_at(), 2);
    }

    #[test]
    fn full_queue_returns_payload() {
        let mut srv = server(1, 64, 1);
        srv.try_enqueue(0, ServiceRequest::new(1, 64)).unwrap();
        let err = srv.try_enqueue(0, ServiceRequest::new(7, 64)).unwrap_err();
        assert_eq!(err.into_request().payload, 7);
    }

    #[test]
    fn pop_ready_respects_ticket() {
        let mut srv = server(3, 64, 2);
        srv.try_enqueue(0, ServiceRequest::new(9, 64)).unwrap();
        assert!(srv.pop_ready(3).is_none());
        let result = srv.pop_ready(4).unwrap();
        assert_eq!(result.payload, 9);
        assert!(srv.is_empty());
    }

    #[test]
    fn idle_server_restarts_at_now() {
        let mut srv = server(0, 1, 2);
        srv.try_enqueue(0, ServiceRequest::new(1, 2)).unwrap();
        srv.service_ready(10, |_| {});
        let ticket = srv.try_enqueue(10, ServiceRequest::new(2, 2)).unwrap();
        assert_eq!(ticket.ready_at(), 12);
    }
}
