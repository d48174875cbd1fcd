//! N-way heap merge of sorted runs.
//!
//! Each open input owns one node slot. The heap holds slot indices ordered
//! by the node in the slot, ties going to the lower index so a single pass
//! keeps inputs in the order they were given.

use std::cmp::Ordering;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};

use super::engine::SortError;
use super::key::KeyDescriptor;
use super::spill::{open_error, SpillError, SpillReader, SpillWriter, TempFileManager};
use crate::protocol::ParseError;
use crate::record::RECORD_LEN;
use crate::stream::{FlowFileReader, RecordSink, StreamError};

/// Most inputs one pass holds open.
pub const MAX_MERGE_FILES: usize = 1024;

/// Something the merger reads sorted nodes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeInput {
    /// A temp run, by index.
    Run(usize),
    /// A flow file already sorted by the key.
    File(PathBuf),
}

enum NodeReader {
    Run(SpillReader),
    File {
        path: PathBuf,
        reader: FlowFileReader<BufReader<File>>,
    },
}

impl NodeReader {
    fn open(input: &MergeInput, temps: &TempFileManager) -> Result<NodeReader, SortError> {
        match input {
            MergeInput::Run(idx) => Ok(NodeReader::Run(temps.open(*idx)?)),
            MergeInput::File(path) => {
                let file = File::open(path).map_err(open_error)?;
                let reader = FlowFileReader::new(BufReader::new(file)).map_err(|e| {
                    tracing::error!("Cannot read {}: {}", path.display(), e);
                    SortError::Stream(e)
                })?;
                Ok(NodeReader::File {
                    path: path.clone(),
                    reader,
                })
            }
        }
    }

    fn read_node(&mut self, key: &KeyDescriptor, node: &mut [u8]) -> Result<bool, SortError> {
        match self {
            NodeReader::Run(r) => Ok(r.read_node(node)?),
            NodeReader::File { path, reader } => match reader.next_encoded() {
                Ok(Some(rec)) => {
                    key.fill_node_from_encoded(rec, node);
                    Ok(true)
                }
                Ok(None) => Ok(false),
                Err(StreamError::Format(ParseError::TooShort { actual, .. })) => {
                    tracing::warn!(
                        "Short read of {}/{} bytes from {}; treating as end of file",
                        actual,
                        RECORD_LEN,
                        path.display()
                    );
                    Ok(false)
                }
                Err(e) => Err(SortError::Stream(e)),
            },
        }
    }

    fn run_index(&self) -> Option<usize> {
        match self {
            NodeReader::Run(r) => Some(r.index()),
            NodeReader::File { .. } => None,
        }
    }
}

enum Output<'o> {
    Final(&'o mut dyn RecordSink),
    Run(SpillWriter),
}

impl Output<'_> {
    fn put(&mut self, node: &[u8]) -> io::Result<()> {
        match self {
            Output::Final(sink) => sink.write_encoded(&node[..RECORD_LEN]),
            Output::Run(w) => w.write_node(node),
        }
    }
}

fn sift_up(heap: &mut [usize], mut pos: usize, cmp: &dyn Fn(usize, usize) -> Ordering) {
    while pos > 0 {
        let parent = (pos - 1) / 2;
        if cmp(heap[pos], heap[parent]) != Ordering::Less {
            break;
        }
        heap.swap(pos, parent);
        pos = parent;
    }
}

fn sift_down(heap: &mut [usize], mut pos: usize, cmp: &dyn Fn(usize, usize) -> Ordering) {
    loop {
        let left = 2 * pos + 1;
        if left >= heap.len() {
            break;
        }
        let right = left + 1;
        let child = if right < heap.len() && cmp(heap[right], heap[left]) == Ordering::Less {
            right
        } else {
            left
        };
        if cmp(heap[child], heap[pos]) != Ordering::Less {
            break;
        }
        heap.swap(pos, child);
        pos = child;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MergeSummary {
    pub passes: usize,
    pub intermediate_runs: usize,
    pub records: u64,
}

pub struct HeapMerger<'a> {
    key: &'a KeyDescriptor,
    temps: &'a mut TempFileManager,
    max_open: usize,
    cancel: Option<&'a AtomicBool>,
}

impl<'a> HeapMerger<'a> {
    pub fn new(key: &'a KeyDescriptor, temps: &'a mut TempFileManager, max_open: usize) -> Self {
        HeapMerger {
            key,
            temps,
            max_open: max_open.max(2),
            cancel: None,
        }
    }

    /// Abandon the merge between passes once `flag` is set.
    pub fn with_cancel(mut self, flag: &'a AtomicBool) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Merge `inputs` into `out`, spilling intermediate runs when more
    /// inputs exist than can be open at once. Runs are removed once
    /// consumed.
    pub fn merge(
        &mut self,
        inputs: Vec<MergeInput>,
        out: &mut dyn RecordSink,
    ) -> Result<MergeSummary, SortError> {
        let mut queue: VecDeque<MergeInput> = inputs.into();
        let mut summary = MergeSummary::default();

        loop {
            if self.cancel.is_some_and(|c| c.load(AtomicOrdering::Relaxed)) {
                return Err(SortError::Cancelled);
            }

            // The intermediate run is created before any input is opened.
            let reserved = if queue.len() > 1 {
                Some(self.temps.create().map_err(|e| match e {
                    SpillError::Exhausted(e) => {
                        tracing::error!("Unable to create an intermediate run: {}", e);
                        SortError::NoMergeProgress(e)
                    }
                    e => SortError::Spill(e),
                })?)
            } else {
                None
            };
            let readers = match self.open_some(&mut queue) {
                Ok(readers) => readers,
                Err(e) => {
                    if let Some(writer) = reserved {
                        self.release(writer);
                    }
                    return Err(e);
                }
            };
            summary.passes += 1;

            let writer = match reserved {
                Some(writer) if !queue.is_empty() => writer,
                unused => {
                    if let Some(writer) = unused {
                        self.release(writer);
                    }
                    tracing::debug!("Merging {} inputs into the output", readers.len());
                    summary.records = self.pass(readers, &mut Output::Final(&mut *out))?;
                    return Ok(summary);
                }
            };
            let index = writer.index();
            tracing::debug!(
                "Merging {} inputs into temp file #{}; {} inputs remain",
                readers.len(),
                index,
                queue.len()
            );
            let mut output = Output::Run(writer);
            self.pass(readers, &mut output)?;
            if let Output::Run(writer) = output {
                writer.finish().map_err(SpillError::Io)?;
            }
            summary.intermediate_runs += 1;
            queue.push_back(MergeInput::Run(index));
        }
    }

    /// Close and delete a reserved run that was never written.
    fn release(&mut self, writer: SpillWriter) {
        let index = writer.index();
        drop(writer);
        self.temps.remove(index);
    }

    /// Open inputs from the front of `queue` until the limit or until the
    /// system runs out of descriptors.
    fn open_some(&mut self, queue: &mut VecDeque<MergeInput>) -> Result<Vec<NodeReader>, SortError> {
        let mut readers = Vec::new();
        while readers.len() < self.max_open {
            let Some(input) = queue.pop_front() else {
                break;
            };
            match NodeReader::open(&input, self.temps) {
                Ok(r) => readers.push(r),
                Err(SortError::Spill(SpillError::Exhausted(e))) => {
                    if readers.len() < 2 {
                        tracing::error!("Unable to open enough inputs to merge: {}", e);
                        return Err(SortError::NoMergeProgress(e));
                    }
                    tracing::debug!(
                        "Out of file handles after opening {} inputs ({})",
                        readers.len(),
                        e
                    );
                    queue.push_front(input);
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(readers)
    }

    fn pass(&mut self, mut readers: Vec<NodeReader>, out: &mut Output<'_>) -> Result<u64, SortError> {
        let key = self.key;
        let size = key.node_size();
        let mut slots = vec![0u8; readers.len() * size];
        let mut heap: Vec<usize> = Vec::with_capacity(readers.len());
        let mut written = 0u64;

        for (i, reader) in readers.iter_mut().enumerate() {
            if reader.read_node(key, &mut slots[i * size..(i + 1) * size])? {
                heap.push(i);
                let len = heap.len();
                let cmp = |a: usize, b: usize| slot_cmp(key, &slots, size, a, b);
                sift_up(&mut heap, len - 1, &cmp);
            } else {
                tracing::debug!("Skipping empty merge input {}", i);
            }
        }

        while heap.len() > 1 {
            let top = heap[0];
            let range = top * size..(top + 1) * size;
            out.put(&slots[range.clone()])?;
            written += 1;
            if !readers[top].read_node(key, &mut slots[range])? {
                heap.swap_remove(0);
            }
            let cmp = |a: usize, b: usize| slot_cmp(key, &slots, size, a, b);
            sift_down(&mut heap, 0, &cmp);
        }

        if let Some(&last) = heap.first() {
            let range = last * size..(last + 1) * size;
            loop {
                out.put(&slots[range.clone()])?;
                written += 1;
                if !readers[last].read_node(key, &mut slots[range.clone()])? {
                    break;
                }
            }
        }

        for reader in readers {
            if let Some(idx) = reader.run_index() {
                drop(reader);
                self.temps.remove(idx);
            }
        }
        Ok(written)
    }
}

fn slot_cmp(key: &KeyDescriptor, slots: &[u8], size: usize, a: usize, b: usize) -> Ordering {
    key.compare(&slots[a * size..(a + 1) * size], &slots[b * size..(b + 1) * size])
        .then(a.cmp(&b))
}
