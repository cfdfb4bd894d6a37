//! Bounded SPSC packet ring backing the sync-output producer/consumer split
//! (§4.6, §5 "SPSC handoff"): a fixed-capacity ring plus a condvar, the same
//! shape as `ring::RingBuffer` but without smart-start or PSI indexing —
//! this ring only ever feeds one dedicated consumer thread.

use std::sync::{Condvar, Mutex};

use crate::ts::PACKET_SIZE;

type Packet = [u8; PACKET_SIZE];

struct Inner {
    buf: Vec<Packet>,
    write: usize,
    count: usize,
    closed: bool,
}

/// A bounded ring of TS packets. `push` never blocks — on overflow it drops
/// the incoming packet so the producer (ingest thread) is never stalled by
/// a slow consumer (§5 backpressure).
pub struct PacedRing {
    inner: Mutex<Inner>,
    not_empty: Condvar,
    capacity: usize,
}

impl PacedRing {
    pub fn new(capacity_packets: usize) -> Self {
        let capacity = capacity_packets.max(1);
        PacedRing {
            inner: Mutex::new(Inner { buf: vec![[0u8; PACKET_SIZE]; capacity], write: 0, count: 0, closed: false }),
            not_empty: Condvar::new(),
            capacity,
        }
    }

    /// Pushes a packet. Returns `false` (and drops it) if the ring is full.
    pub fn push(&self, packet: Packet) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner.count == self.capacity {
            return false;
        }
        let idx = (inner.write + inner.count) % self.capacity;
        inner.buf[idx] = packet;
        inner.count += 1;
        drop(inner);
        self.not_empty.notify_one();
        true
    }

    /// Pops one packet, blocking up to `timeout` for data to arrive.
    /// Returns `None` on timeout or once the ring is closed and drained.
    pub fn pop_timeout(&self, timeout: std::time::Duration) -> Option<Packet> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if inner.count > 0 {
                let packet = inner.buf[inner.write];
                inner.write = (inner.write + 1) % self.capacity;
                inner.count -= 1;
                return Some(packet);
            }
            if inner.closed {
                return None;
            }
            let (guard, result) = self.not_empty.wait_timeout(inner, timeout).unwrap();
            inner = guard;
            if result.timed_out() && inner.count == 0 {
                return None;
            }
        }
    }

    pub fn close(&self) {
        self.inner.lock().unwrap().closed = true;
        self.not_empty.notify_all();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().count
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `close` has been called. Distinct from `is_empty` — a ring
    /// can be momentarily empty mid-stream without being closed.
    pub fn is_closed(&self) -> bool {
        self.inner.lock().unwrap().closed
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
