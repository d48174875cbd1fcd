//! Replays a file of back-to-back 1464-byte PDU blocks into a probe.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use super::probe::Probe;
use crate::protocol::v5::V5_PDU_LEN;
use crate::stream::read_full;

/// Feed every block in `reader` to `probe`, then finish it. A short final
/// block is passed through and rejected by the validator like any other
/// truncated PDU. Returns the number of blocks read.
pub fn feed_reader<R: Read>(probe: &Probe, mut reader: R) -> io::Result<u64> {
    let mut block = vec![0u8; V5_PDU_LEN];
    let mut blocks = 0u64;
    let result = loop {
        let n = match read_full(&mut reader, &mut block) {
            Ok(n) => n,
            Err(e) => break Err(e),
        };
        if n == 0 {
            break Ok(blocks);
        }
        blocks += 1;
        if !probe.deposit(&block[..n]) {
            break Ok(blocks);
        }
        if n < V5_PDU_LEN {
            break Ok(blocks);
        }
    };
    probe.finish();
    result
}

pub fn feed_file(probe: &Probe, path: &Path) -> io::Result<u64> {
    let file = File::open(path)?;
    tracing::info!("'{}': reading PDUs from {}", probe.name(), path.display());
    feed_reader(probe, BufReader::new(file))
}

/// Run [`feed_file`] on its own thread.
pub fn spawn_file_source(probe: Arc<Probe>, path: &Path) -> io::Result<JoinHandle<io::Result<u64>>> {
    let path = path.to_path_buf();
    thread::Builder::new()
        .name(format!("fp-file-{}", probe.name()))
        .spawn(move || {
            let result = feed_file(&probe, &path);
            if let Err(e) = &result {
                tracing::error!("'{}': error reading {}: {}", probe.name(), path.display(), e);
            }
            result
        })
}
