//! Bounded single-producer/single-consumer queue of raw PDU buffers.
//!
//! Slots are owned buffers that move between a free pool and a FIFO of
//! filled slots. The producer checks one out with [`ProbeRing::writer_slot`],
//! fills it, and hands it back with [`ProbeRing::writer_commit`]; the
//! consumer mirrors that with [`ProbeRing::reader_slot`] and
//! [`ProbeRing::reader_release`]. Buffers are allocated lazily up to the
//! configured capacity and then recycled, so steady-state operation does
//! not allocate.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// One fixed-size datagram buffer.
#[derive(Debug)]
pub struct PduSlot {
    buf: Box<[u8]>,
    len: usize,
}

impl PduSlot {
    fn new(size: usize) -> Self {
        PduSlot {
            buf: vec![0u8; size].into_boxed_slice(),
            len: 0,
        }
    }

    /// The whole buffer, for receiving into.
    #[inline]
    pub fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    /// Record how many bytes of the buffer hold data.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.buf.len());
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Copy `data` into the slot, truncating to the slot size.
    pub fn fill_from(&mut self, data: &[u8]) {
        let n = data.len().min(self.buf.len());
        self.buf[..n].copy_from_slice(&data[..n]);
        self.len = n;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RingStatus {
    Open,
    /// Producer is done; the consumer drains what is queued.
    Finished,
    /// Both sides are released immediately.
    Stopped,
}

struct RingState {
    free: Vec<PduSlot>,
    filled: VecDeque<PduSlot>,
    allocated: usize,
    status: RingStatus,
}

pub struct ProbeRing {
    slot_size: usize,
    capacity: usize,
    state: Mutex<RingState>,
    not_full: Condvar,
    not_empty: Condvar,
}

impl ProbeRing {
    /// A ring holding up to `capacity` slots of `slot_size` bytes each.
    pub fn new(slot_size: usize, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        ProbeRing {
            slot_size,
            capacity,
            state: Mutex::new(RingState {
                free: Vec::new(),
                filled: VecDeque::with_capacity(capacity),
                allocated: 0,
                status: RingStatus::Open,
            }),
            not_full: Condvar::new(),
            not_empty: Condvar::new(),
        }
    }

    pub fn slot_size(&self) -> usize {
        self.slot_size
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of filled slots waiting for the consumer.
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().filled.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check out an empty slot. Blocks while every slot is in use; returns
    /// `None` once the ring is stopped or finished.
    pub fn writer_slot(&self) -> Option<PduSlot> {
        let mut state = self.state.lock().unwrap();
        loop {
            if state.status != RingStatus::Open {
                return None;
            }
            if let Some(mut slot) = state.free.pop() {
                slot.len = 0;
                return Some(slot);
            }
            if state.allocated < self.capacity {
                state.allocated += 1;
                return Some(PduSlot::new(self.slot_size));
            }
            state = self.not_full.wait(state).unwrap();
        }
    }

    /// Queue a filled slot for the consumer.
    pub fn writer_commit(&self, slot: PduSlot) {
        let mut state = self.state.lock().unwrap();
        if state.status == RingStatus::Stopped {
            state.free.push(slot);
            return;
        }
        state.filled.push_back(slot);
        drop(state);
        self.not_empty.notify_one();
    }

    /// Return a slot the producer checked out but will not commit.
    pub fn writer_discard(&self, slot: PduSlot) {
        let mut state = self.state.lock().unwrap();
        state.free.push(slot);
        drop(state);
        self.not_full.notify_one();
    }

    /// Take the oldest filled slot. Blocks while the ring is empty; returns
    /// `None` once stopped, or once finished and drained.
    pub fn reader_slot(&self) -> Option<PduSlot> {
        let mut state = self.state.lock().unwrap();
        loop {
            match state.status {
                RingStatus::Stopped => return None,
                RingStatus::Finished => return state.filled.pop_front(),
                RingStatus::Open => {
                    if let Some(slot) = state.filled.pop_front() {
                        return Some(slot);
                    }
                }
            }
            state = self.not_empty.wait(state).unwrap();
        }
    }

    /// Give a consumed slot back to the producer.
    pub fn reader_release(&self, slot: PduSlot) {
        self.writer_discard(slot);
    }

    /// Release both sides; queued data is abandoned.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.status = RingStatus::Stopped;
        state.filled.clear();
        drop(state);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    /// Mark the producer as done. The consumer still sees queued slots.
    pub fn finish(&self) {
        let mut state = self.state.lock().unwrap();
        if state.status == RingStatus::Open {
            state.status = RingStatus::Finished;
        }
        drop(state);
        self.not_full.notify_all();
        self.not_empty.notify_all();
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().status == RingStatus::Stopped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    fn push(ring: &ProbeRing, byte: u8) {
        let mut slot = ring.writer_slot().unwrap();
        slot.fill_from(&[byte; 4]);
        ring.writer_commit(slot);
    }

    #[test]
    fn fifo_order() {
        let ring = ProbeRing::new(16, 8);
        for b in 1..=5 {
            push(&ring, b);
        }
        assert_eq!(ring.len(), 5);
        for b in 1..=5 {
            let slot = ring.reader_slot().unwrap();
            assert_eq!(slot.as_bytes(), &[b; 4]);
            ring.reader_release(slot);
        }
        assert!(ring.is_empty());
    }

    #[test]
    fn slot_truncates_oversized_data() {
        let ring = ProbeRing::new(4, 1);
        let mut slot = ring.writer_slot().unwrap();
        slot.fill_from(&[7u8; 10]);
        assert_eq!(slot.len(), 4);
    }

    #[test]
    fn producer_blocks_when_full() {
        let ring = Arc::new(ProbeRing::new(8, 2));
        push(&ring, 1);
        push(&ring, 2);

        let producer = {
            let ring = ring.clone();
            thread::spawn(move || {
                push(&ring, 3);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert_eq!(ring.len(), 2);

        let slot = ring.reader_slot().unwrap();
        assert_eq!(slot.as_bytes()[0], 1);
        ring.reader_release(slot);
        producer.join().unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let slot = ring.reader_slot().unwrap();
            seen.push(slot.as_bytes()[0]);
            ring.reader_release(slot);
        }
        assert_eq!(seen, vec![2, 3]);
    }

    #[test]
    fn stop_releases_blocked_reader() {
        let ring = Arc::new(ProbeRing::new(8, 2));
        let reader = {
            let ring = ring.clone();
            thread::spawn(move || ring.reader_slot().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        ring.stop();
        assert!(reader.join().unwrap());
        assert!(ring.writer_slot().is_none());
        assert!(ring.is_stopped());
    }

    #[test]
    fn stop_releases_blocked_writer() {
        let ring = Arc::new(ProbeRing::new(8, 1));
        push(&ring, 1);
        let writer = {
            let ring = ring.clone();
            thread::spawn(move || ring.writer_slot().is_none())
        };
        thread::sleep(Duration::from_millis(20));
        ring.stop();
        assert!(writer.join().unwrap());
        assert!(ring.reader_slot().is_none());
    }

    #[test]
    fn finish_drains_before_ending() {
        let ring = ProbeRing::new(8, 4);
        push(&ring, 9);
        push(&ring, 10);
        ring.finish();
        assert!(ring.writer_slot().is_none());
        let a = ring.reader_slot().unwrap();
        assert_eq!(a.as_bytes()[0], 9);
        ring.reader_release(a);
        let b = ring.reader_slot().unwrap();
        assert_eq!(b.as_bytes()[0], 10);
        ring.reader_release(b);
        assert!(ring.reader_slot().is_none());
    }
}
