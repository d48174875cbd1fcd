//! In-core node buffer.
//!
//! Memory is claimed one chunk at a time up to the budget. The first chunk
//! must succeed; later chunks may fail, in which case the buffer stops
//! growing and spills at its current size.

use super::engine::SortError;
use super::key::KeyDescriptor;

/// Number of chunks the budget is split into.
pub const NUM_CHUNKS: usize = 6;
/// Largest single chunk.
pub const MAX_CHUNK_SIZE: usize = 0x4000_0000;
/// Fewest records the buffer must be able to hold.
pub const MIN_IN_CORE_RECORDS: usize = 1000;
/// Default memory budget, 1920 MiB.
pub const DEFAULT_BUFFER_SIZE: usize = 1920 << 20;

pub struct NodeBuffer {
    data: Vec<u8>,
    node_size: usize,
    count: usize,
    max_records: usize,
    chunk_records: usize,
    order: Vec<usize>,
}

impl std::fmt::Debug for NodeBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeBuffer")
            .field("node_size", &self.node_size)
            .field("count", &self.count)
            .field("max_records", &self.max_records)
            .field("allocated", &self.capacity())
            .finish()
    }
}

impl NodeBuffer {
    /// Smallest budget that holds [`MIN_IN_CORE_RECORDS`] nodes.
    pub fn minimum_budget(node_size: usize) -> usize {
        node_size * MIN_IN_CORE_RECORDS
    }

    pub fn new(node_size: usize, budget: usize) -> Result<Self, SortError> {
        let max_records = budget / node_size;
        if max_records < MIN_IN_CORE_RECORDS {
            return Err(SortError::BufferTooSmall {
                budget,
                minimum: Self::minimum_budget(node_size),
            });
        }

        let mut chunks = NUM_CHUNKS;
        while max_records / chunks * node_size > MAX_CHUNK_SIZE {
            chunks += 1;
        }
        let mut data = Vec::new();
        let chunk_records = loop {
            let want = (max_records / chunks).max(MIN_IN_CORE_RECORDS);
            match data.try_reserve_exact(want * node_size) {
                Ok(()) => break want,
                Err(e) => {
                    let next = max_records / (chunks + 1);
                    if next < MIN_IN_CORE_RECORDS {
                        tracing::error!(
                            "Cannot allocate space for {} records: {}",
                            MIN_IN_CORE_RECORDS,
                            e
                        );
                        return Err(SortError::OutOfMemory);
                    }
                    chunks += 1;
                }
            }
        };
        data.resize(chunk_records * node_size, 0);
        tracing::debug!(
            "Sort buffer: node size {} bytes, chunk of {} records, at most {} records",
            node_size,
            chunk_records,
            max_records
        );

        Ok(NodeBuffer {
            data,
            node_size,
            count: 0,
            max_records,
            chunk_records,
            order: Vec::new(),
        })
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Records the buffer may hold before it must spill.
    pub fn max_records(&self) -> usize {
        self.max_records
    }

    /// Records the allocated memory holds right now.
    pub fn capacity(&self) -> usize {
        self.data.len() / self.node_size
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.max_records
    }

    /// Claim the next node slot, growing by a chunk when the allocated
    /// space is used up. Returns `None` once the buffer is full; a failed
    /// growth caps the buffer at its current size.
    pub fn push(&mut self) -> Option<&mut [u8]> {
        if self.is_full() {
            return None;
        }
        if self.count == self.capacity() && !self.grow() {
            return None;
        }
        let start = self.count * self.node_size;
        self.count += 1;
        self.order.clear();
        Some(&mut self.data[start..start + self.node_size])
    }

    fn grow(&mut self) -> bool {
        let records = self.chunk_records.min(self.max_records - self.count);
        let bytes = records * self.node_size;
        if let Err(e) = self.data.try_reserve_exact(bytes) {
            tracing::debug!(
                "Cannot grow sort buffer past {} records ({}); spilling at this size",
                self.count,
                e
            );
            self.max_records = self.count;
            return false;
        }
        let len = self.data.len() + bytes;
        self.data.resize(len, 0);
        true
    }

    pub fn node(&self, i: usize) -> &[u8] {
        let start = i * self.node_size;
        &self.data[start..start + self.node_size]
    }

    /// Order the buffered nodes by `key`. Equal nodes keep their arrival
    /// order.
    pub fn sort(&mut self, key: &KeyDescriptor) {
        let mut order = std::mem::take(&mut self.order);
        order.clear();
        order.extend(0..self.count);
        order.sort_by(|&a, &b| key.compare(self.node(a), self.node(b)));
        self.order = order;
    }

    /// Nodes in the order of the last [`NodeBuffer::sort`], or arrival
    /// order if the buffer changed since.
    pub fn sorted(&self) -> impl Iterator<Item = &[u8]> + '_ {
        let sorted = self.order.len() == self.count;
        (0..self.count).map(move |i| {
            let idx = if sorted { self.order[i] } else { i };
            self.node(idx)
        })
    }

    /// Empty the buffer, keeping the allocation.
    pub fn clear(&mut self) {
        self.count = 0;
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{FlowRecord, RECORD_LEN};
    use crate::sort::key::SortField;

    #[test]
    fn budget_floor() {
        let err = NodeBuffer::new(RECORD_LEN, RECORD_LEN * 999).unwrap_err();
        assert!(matches!(err, SortError::BufferTooSmall { minimum, .. } if minimum == RECORD_LEN * 1000));
        assert!(NodeBuffer::new(RECORD_LEN, NodeBuffer::minimum_budget(RECORD_LEN)).is_ok());
    }

    #[test]
    fn grows_in_chunks_up_to_the_budget() {
        let mut buf = NodeBuffer::new(RECORD_LEN, RECORD_LEN * 12_000).unwrap();
        assert_eq!(buf.max_records(), 12_000);
        assert_eq!(buf.capacity(), 2_000);
        for _ in 0..2_001 {
            assert!(buf.push().is_some());
        }
        assert_eq!(buf.capacity(), 4_000);
        while buf.push().is_some() {}
        assert!(buf.is_full());
        assert_eq!(buf.len(), 12_000);
        assert_eq!(buf.capacity(), 12_000);
        buf.clear();
        assert!(buf.is_empty());
        assert!(buf.push().is_some());
    }

    #[test]
    fn sort_is_stable() {
        let key = KeyDescriptor::builtin(&[SortField::DestPort], false);
        let mut buf = NodeBuffer::new(RECORD_LEN, RECORD_LEN * 1000).unwrap();
        let input = [(443, 1), (80, 2), (443, 3), (22, 4), (80, 5)];
        for (dport, sport) in input {
            let rec = FlowRecord {
                dport,
                sport,
                ..FlowRecord::default()
            };
            key.fill_node(&rec, buf.push().unwrap());
        }
        buf.sort(&key);
        let got: Vec<(u16, u16)> = buf
            .sorted()
            .map(FlowRecord::decode)
            .map(|r| (r.dport, r.sport))
            .collect();
        assert_eq!(got, vec![(22, 4), (80, 2), (80, 5), (443, 1), (443, 3)]);
    }
}
