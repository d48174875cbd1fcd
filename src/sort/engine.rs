//! External merge sort of flow records.
//!
//! Random input is read into a [`NodeBuffer`]; each time the buffer fills
//! it is sorted and spilled to a temp run. If nothing spilled the buffer
//! goes straight to the output, otherwise the runs are merged. Presorted
//! input skips the buffer and is merged directly.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::key::{KeyDescriptor, KeyError};
use super::merge::{HeapMerger, MergeInput, MAX_MERGE_FILES};
use super::node::{NodeBuffer, DEFAULT_BUFFER_SIZE};
use super::spill::{SpillError, TempFileManager};
use crate::stream::{FlowFileReader, RecordSink, RecordSource, StreamError};

#[derive(Debug)]
pub enum SortError {
    Key(KeyError),
    Spill(SpillError),
    Stream(StreamError),
    Io(io::Error),
    BufferTooSmall { budget: usize, minimum: usize },
    OutOfMemory,
    /// Too few inputs could be opened for a merge to make progress.
    NoMergeProgress(io::Error),
    Cancelled,
}

impl fmt::Display for SortError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortError::Key(e) => write!(f, "{}", e),
            SortError::Spill(e) => write!(f, "{}", e),
            SortError::Stream(e) => write!(f, "{}", e),
            SortError::Io(e) => write!(f, "error writing output: {}", e),
            SortError::BufferTooSmall { budget, minimum } => write!(
                f,
                "sort buffer of {} bytes is too small; at least {} bytes are needed",
                budget, minimum
            ),
            SortError::OutOfMemory => write!(f, "cannot allocate the sort buffer"),
            SortError::NoMergeProgress(e) => {
                write!(f, "cannot open enough files to merge: {}", e)
            }
            SortError::Cancelled => write!(f, "sort cancelled"),
        }
    }
}

impl std::error::Error for SortError {}

impl From<KeyError> for SortError {
    fn from(e: KeyError) -> Self {
        SortError::Key(e)
    }
}

impl From<SpillError> for SortError {
    fn from(e: SpillError) -> Self {
        SortError::Spill(e)
    }
}

impl From<StreamError> for SortError {
    fn from(e: StreamError) -> Self {
        SortError::Stream(e)
    }
}

impl From<io::Error> for SortError {
    fn from(e: io::Error) -> Self {
        SortError::Io(e)
    }
}

#[derive(Debug, Clone)]
pub struct SortOptions {
    /// Memory budget for in-core nodes, in bytes.
    pub buffer_size: usize,
    /// Parent directory for temp runs; the system default when `None`.
    pub temp_dir: Option<PathBuf>,
    pub max_merge_files: usize,
    /// Inputs are already sorted by the key.
    pub presorted: bool,
}

impl Default for SortOptions {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            temp_dir: None,
            max_merge_files: MAX_MERGE_FILES,
            presorted: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SortSummary {
    pub records_in: u64,
    pub records_out: u64,
    /// Runs written by the in-core phase.
    pub runs: usize,
    pub merge_passes: usize,
}

pub struct Sorter {
    key: KeyDescriptor,
    options: SortOptions,
    cancel: Option<Arc<AtomicBool>>,
}

impl Sorter {
    pub fn new(key: KeyDescriptor, options: SortOptions) -> Self {
        Sorter {
            key,
            options,
            cancel: None,
        }
    }

    /// Check `token` between inputs and merge passes.
    pub fn with_cancel(mut self, token: Arc<AtomicBool>) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn key(&self) -> &KeyDescriptor {
        &self.key
    }

    pub fn options(&self) -> &SortOptions {
        &self.options
    }

    fn check_cancel(&self) -> Result<(), SortError> {
        match &self.cancel {
            Some(flag) if flag.load(Ordering::Relaxed) => Err(SortError::Cancelled),
            _ => Ok(()),
        }
    }

    /// Sort the flow files at `paths` into `out`.
    pub fn sort_files(&self, paths: &[PathBuf], out: &mut dyn RecordSink) -> Result<SortSummary, SortError> {
        if self.options.presorted {
            return self.merge_presorted(paths, out);
        }
        let mut sources = paths.iter().map(|p| open_input(p));
        self.sort_stream(&mut sources, out)
    }

    /// Sort records from every source into `out`.
    pub fn sort<S: RecordSource>(
        &self,
        sources: impl IntoIterator<Item = S>,
        out: &mut dyn RecordSink,
    ) -> Result<SortSummary, SortError> {
        let mut sources = sources.into_iter().map(Ok);
        self.sort_stream(&mut sources, out)
    }

    fn sort_stream<S: RecordSource>(
        &self,
        sources: &mut dyn Iterator<Item = Result<S, SortError>>,
        out: &mut dyn RecordSink,
    ) -> Result<SortSummary, SortError> {
        let key = &self.key;
        let mut buffer = NodeBuffer::new(key.node_size(), self.options.buffer_size)?;
        let mut temps = TempFileManager::new(self.options.temp_dir.as_deref())?;
        let mut summary = SortSummary::default();
        let mut runs = Vec::new();

        for source in sources {
            self.check_cancel()?;
            let mut source = source?;
            while let Some(rec) = source.next_record()? {
                summary.records_in += 1;
                loop {
                    if let Some(node) = buffer.push() {
                        key.fill_node(&rec, node);
                        break;
                    }
                    if buffer.is_empty() {
                        return Err(SortError::OutOfMemory);
                    }
                    runs.push(spill(&mut buffer, key, &mut temps)?);
                }
            }
        }

        if runs.is_empty() {
            buffer.sort(key);
            for node in buffer.sorted() {
                out.write_encoded(node)?;
                summary.records_out += 1;
            }
            tracing::debug!("Sorted {} records in core", summary.records_out);
            return Ok(summary);
        }

        if !buffer.is_empty() {
            runs.push(spill(&mut buffer, key, &mut temps)?);
        }
        drop(buffer);
        summary.runs = runs.len();
        tracing::debug!("Merging {} temp runs", runs.len());

        let inputs = runs.into_iter().map(MergeInput::Run).collect();
        let merged = self.merger(&mut temps).merge(inputs, out)?;
        summary.records_out = merged.records;
        summary.merge_passes = merged.passes;
        temps.teardown();
        Ok(summary)
    }

    /// Merge inputs that are each already sorted by the key.
    pub fn merge_presorted(&self, paths: &[PathBuf], out: &mut dyn RecordSink) -> Result<SortSummary, SortError> {
        self.check_cancel()?;
        let mut temps = TempFileManager::new(self.options.temp_dir.as_deref())?;
        let inputs = paths.iter().cloned().map(MergeInput::File).collect();
        let merged = self.merger(&mut temps).merge(inputs, out)?;
        temps.teardown();
        Ok(SortSummary {
            records_in: merged.records,
            records_out: merged.records,
            runs: 0,
            merge_passes: merged.passes,
        })
    }

    fn merger<'a>(&'a self, temps: &'a mut TempFileManager) -> HeapMerger<'a> {
        let merger = HeapMerger::new(&self.key, temps, self.options.max_merge_files);
        match &self.cancel {
            Some(flag) => merger.with_cancel(flag),
            None => merger,
        }
    }
}

fn open_input(path: &Path) -> Result<FlowFileReader<io::BufReader<std::fs::File>>, SortError> {
    FlowFileReader::open(path).map_err(|e| {
        tracing::error!("Cannot read {}: {}", path.display(), e);
        SortError::Stream(e)
    })
}

fn spill(buffer: &mut NodeBuffer, key: &KeyDescriptor, temps: &mut TempFileManager) -> Result<usize, SortError> {
    buffer.sort(key);
    let index = temps.write_buffer(buffer.sorted())?;
    tracing::debug!("Wrote {} records to temp file #{}", buffer.len(), index);
    buffer.clear();
    Ok(index)
}
