//! Temp-file manager for sort runs.
//!
//! Runs are raw node arrays, with no header, kept in a private directory
//! created under the configured temp directory. Files are addressed by a
//! numeric index, and everything still registered is removed on teardown
//! or drop.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use tempfile::TempDir;

use crate::stream::read_full;

/// Set to log every temp-file create, open and remove.
pub const TEMPFILE_DEBUG_ENV: &str = "FLOWPIPE_TEMPFILE_DEBUG";

#[derive(Debug)]
pub enum SpillError {
    Io(io::Error),
    /// Out of file descriptors or memory; the caller may retry with fewer
    /// files open.
    Exhausted(io::Error),
    UnknownIndex(usize),
}

impl fmt::Display for SpillError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SpillError::Io(e) => write!(f, "temp file error: {}", e),
            SpillError::Exhausted(e) => write!(f, "cannot open temp file: {}", e),
            SpillError::UnknownIndex(idx) => write!(f, "no temp file #{}", idx),
        }
    }
}

impl std::error::Error for SpillError {}

impl From<io::Error> for SpillError {
    fn from(e: io::Error) -> Self {
        SpillError::Io(e)
    }
}

/// Whether an open failure is resource exhaustion rather than a real error.
pub fn is_exhaustion(e: &io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOMEM)
    )
}

/// Classify an error from opening a file.
pub fn open_error(e: io::Error) -> SpillError {
    if is_exhaustion(&e) {
        SpillError::Exhausted(e)
    } else {
        SpillError::Io(e)
    }
}

/// Buffered writer for one run.
pub struct SpillWriter {
    index: usize,
    inner: BufWriter<File>,
    nodes: u64,
}

impl SpillWriter {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn write_node(&mut self, node: &[u8]) -> io::Result<()> {
        self.inner.write_all(node)?;
        self.nodes += 1;
        Ok(())
    }

    /// Flush and close; returns the number of nodes written.
    pub fn finish(self) -> io::Result<u64> {
        self.inner.into_inner().map_err(|e| e.into_error())?;
        Ok(self.nodes)
    }
}

/// Reads nodes back from a run.
pub struct SpillReader {
    index: usize,
    inner: BufReader<File>,
}

impl SpillReader {
    pub fn index(&self) -> usize {
        self.index
    }

    /// Read the next node into `buf`. A short read is logged and treated
    /// as the end of the run.
    pub fn read_node(&mut self, buf: &mut [u8]) -> io::Result<bool> {
        let got = read_full(&mut self.inner, buf)?;
        if got == buf.len() {
            return Ok(true);
        }
        if got != 0 {
            tracing::warn!(
                "Short read of {}/{} bytes from temp file #{}; treating as end of run",
                got,
                buf.len(),
                self.index
            );
        }
        Ok(false)
    }
}

pub struct TempFileManager {
    dir: Option<TempDir>,
    files: BTreeMap<usize, PathBuf>,
    next_index: usize,
    debug: bool,
}

impl fmt::Debug for TempFileManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TempFileManager")
            .field("dir", &self.dir.as_ref().map(|d| d.path().to_path_buf()))
            .field("files", &self.files.len())
            .finish()
    }
}

impl TempFileManager {
    /// Create the private run directory inside `parent`, or inside the
    /// system temp directory when `parent` is `None`.
    pub fn new(parent: Option<&Path>) -> Result<Self, SpillError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("flowpipe-sort.");
        let dir = match parent {
            Some(p) => builder.tempdir_in(p),
            None => builder.tempdir(),
        }
        .map_err(|e| {
            tracing::error!("Cannot create temp directory: {}", e);
            SpillError::Io(e)
        })?;
        let debug = std::env::var_os(TEMPFILE_DEBUG_ENV).is_some();
        if debug {
            tracing::debug!("Temp files go to {}", dir.path().display());
        }
        Ok(TempFileManager {
            dir: Some(dir),
            files: BTreeMap::new(),
            next_index: 0,
            debug,
        })
    }

    /// Directory holding the runs.
    pub fn path(&self) -> Option<&Path> {
        self.dir.as_ref().map(|d| d.path())
    }

    /// Number of runs on disk.
    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    fn dir_path(&self) -> Result<&Path, SpillError> {
        self.path().ok_or_else(|| {
            SpillError::Io(io::Error::new(io::ErrorKind::NotFound, "temp directory removed"))
        })
    }

    pub fn create(&mut self) -> Result<SpillWriter, SpillError> {
        let index = self.next_index;
        let path = self.dir_path()?.join(format!("run.{:06}", index));
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                tracing::error!("Cannot create temp file {}: {}", path.display(), e);
                open_error(e)
            })?;
        if self.debug {
            tracing::debug!("Created temp file #{} {}", index, path.display());
        }
        self.next_index += 1;
        self.files.insert(index, path);
        Ok(SpillWriter {
            index,
            inner: BufWriter::new(file),
            nodes: 0,
        })
    }

    pub fn open(&self, index: usize) -> Result<SpillReader, SpillError> {
        let path = self.files.get(&index).ok_or(SpillError::UnknownIndex(index))?;
        let file = File::open(path).map_err(open_error)?;
        if self.debug {
            tracing::debug!("Opened temp file #{} {}", index, path.display());
        }
        Ok(SpillReader {
            index,
            inner: BufReader::new(file),
        })
    }

    /// Write `nodes` to a new run; returns its index.
    pub fn write_buffer<'a, I>(&mut self, nodes: I) -> Result<usize, SpillError>
    where
        I: IntoIterator<Item = &'a [u8]>,
    {
        let mut writer = self.create()?;
        let index = writer.index();
        for node in nodes {
            writer.write_node(node)?;
        }
        let count = writer.finish()?;
        if self.debug {
            tracing::debug!("Wrote {} nodes to temp file #{}", count, index);
        }
        Ok(index)
    }

    pub fn remove(&mut self, index: usize) {
        let Some(path) = self.files.remove(&index) else {
            return;
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                if self.debug {
                    tracing::debug!("Removed temp file #{} {}", index, path.display());
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Cannot remove temp file {}: {}", path.display(), e),
        }
    }

    /// Remove every run and the directory.
    pub fn teardown(&mut self) {
        let indexes: Vec<usize> = self.files.keys().copied().collect();
        for index in indexes {
            self.remove(index);
        }
        if let Some(dir) = self.dir.take() {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!("Cannot remove temp directory {}: {}", path.display(), e);
            }
        }
    }
}

impl Drop for TempFileManager {
    fn drop(&mut self) {
        self.teardown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_write_read_remove() {
        let parent = tempfile::tempdir().unwrap();
        let mut temps = TempFileManager::new(Some(parent.path())).unwrap();
        let nodes: Vec<[u8; 8]> = vec![[1; 8], [2; 8], [3; 8]];
        let idx = temps.write_buffer(nodes.iter().map(|n| &n[..])).unwrap();
        assert_eq!(temps.len(), 1);

        let mut reader = temps.open(idx).unwrap();
        let mut buf = [0u8; 8];
        for want in &nodes {
            assert!(reader.read_node(&mut buf).unwrap());
            assert_eq!(&buf, want);
        }
        assert!(!reader.read_node(&mut buf).unwrap());
        drop(reader);

        temps.remove(idx);
        assert!(temps.is_empty());
        assert!(matches!(temps.open(idx), Err(SpillError::UnknownIndex(_))));
    }

    #[test]
    fn short_run_ends_early() {
        let mut temps = TempFileManager::new(None).unwrap();
        let mut w = temps.create().unwrap();
        w.write_node(&[7u8; 8]).unwrap();
        w.write_node(&[9u8; 3]).unwrap();
        let idx = w.index();
        w.finish().unwrap();

        let mut reader = temps.open(idx).unwrap();
        let mut buf = [0u8; 8];
        assert!(reader.read_node(&mut buf).unwrap());
        assert!(!reader.read_node(&mut buf).unwrap());
    }

    #[test]
    fn teardown_removes_everything() {
        let parent = tempfile::tempdir().unwrap();
        {
            let mut temps = TempFileManager::new(Some(parent.path())).unwrap();
            for _ in 0..3 {
                temps.write_buffer(std::iter::once(&[0u8; 4][..])).unwrap();
            }
            assert_eq!(fs::read_dir(temps.path().unwrap()).unwrap().count(), 3);
        }
        assert_eq!(fs::read_dir(parent.path()).unwrap().count(), 0);
    }

    #[test]
    fn exhaustion_is_classified() {
        let e = io::Error::from_raw_os_error(libc::EMFILE);
        assert!(matches!(open_error(e), SpillError::Exhausted(_)));
        let e = io::Error::from_raw_os_error(libc::ENOENT);
        assert!(matches!(open_error(e), SpillError::Io(_)));
    }
}
