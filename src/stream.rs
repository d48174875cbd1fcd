//! Flow files: a 16-byte header followed by fixed-size records.
//!
//! ```text
//!  off  len  field
//!    0    4  magic "FLWP"
//!    4    2  version (1), little-endian
//!    6    2  record length, little-endian
//!    8    8  reserved, zero
//! ```

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::protocol::ParseError;
use crate::record::{FlowRecord, RECORD_LEN};

pub const FILE_MAGIC: [u8; 4] = *b"FLWP";
pub const FILE_VERSION: u16 = 1;
pub const FILE_HEADER_LEN: usize = 16;

#[derive(Debug)]
pub enum StreamError {
    Io(io::Error),
    Format(ParseError),
}

impl fmt::Display for StreamError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamError::Io(err) => write!(f, "flow file io error: {}", err),
            StreamError::Format(err) => write!(f, "flow file format error: {}", err),
        }
    }
}

impl std::error::Error for StreamError {}

impl From<io::Error> for StreamError {
    fn from(e: io::Error) -> Self {
        StreamError::Io(e)
    }
}

impl From<ParseError> for StreamError {
    fn from(e: ParseError) -> Self {
        StreamError::Format(e)
    }
}

/// Anything that yields flow records one at a time.
pub trait RecordSource {
    fn next_record(&mut self) -> Result<Option<FlowRecord>, StreamError>;
}

/// Anything that accepts encoded flow records in order.
pub trait RecordSink {
    /// `rec` holds exactly [`RECORD_LEN`] bytes.
    fn write_encoded(&mut self, rec: &[u8]) -> io::Result<()>;

    fn write_record(&mut self, rec: &FlowRecord) -> io::Result<()> {
        self.write_encoded(&rec.encode())
    }
}

impl RecordSink for Vec<FlowRecord> {
    fn write_encoded(&mut self, rec: &[u8]) -> io::Result<()> {
        self.push(FlowRecord::decode(rec));
        Ok(())
    }

    fn write_record(&mut self, rec: &FlowRecord) -> io::Result<()> {
        self.push(*rec);
        Ok(())
    }
}

/// In-memory record source.
#[derive(Debug, Clone)]
pub struct VecSource {
    records: std::vec::IntoIter<FlowRecord>,
}

impl VecSource {
    pub fn new(records: Vec<FlowRecord>) -> Self {
        VecSource {
            records: records.into_iter(),
        }
    }
}

impl RecordSource for VecSource {
    fn next_record(&mut self) -> Result<Option<FlowRecord>, StreamError> {
        Ok(self.records.next())
    }
}

fn encode_header() -> [u8; FILE_HEADER_LEN] {
    let mut hdr = [0u8; FILE_HEADER_LEN];
    hdr[0..4].copy_from_slice(&FILE_MAGIC);
    hdr[4..6].copy_from_slice(&FILE_VERSION.to_le_bytes());
    hdr[6..8].copy_from_slice(&(RECORD_LEN as u16).to_le_bytes());
    hdr
}

fn check_header(hdr: &[u8]) -> Result<(), ParseError> {
    if hdr.len() < FILE_HEADER_LEN {
        return Err(ParseError::TooShort {
            expected: FILE_HEADER_LEN,
            actual: hdr.len(),
        });
    }
    if hdr[0..4] != FILE_MAGIC {
        return Err(ParseError::InvalidHeader("bad magic".into()));
    }
    let version = u16::from_le_bytes([hdr[4], hdr[5]]);
    if version != FILE_VERSION {
        return Err(ParseError::InvalidHeader(format!(
            "unsupported version {}",
            version
        )));
    }
    let rec_len = u16::from_le_bytes([hdr[6], hdr[7]]) as usize;
    if rec_len != RECORD_LEN {
        return Err(ParseError::InvalidHeader(format!(
            "record length {} (expected {})",
            rec_len, RECORD_LEN
        )));
    }
    Ok(())
}

/// Reads records from a flow file.
pub struct FlowFileReader<R: Read> {
    inner: R,
    buf: [u8; RECORD_LEN],
    records_read: u64,
}

impl FlowFileReader<BufReader<File>> {
    pub fn open(path: &Path) -> Result<Self, StreamError> {
        let file = File::open(path)?;
        FlowFileReader::new(BufReader::new(file))
    }
}

impl<R: Read> FlowFileReader<R> {
    pub fn new(mut inner: R) -> Result<Self, StreamError> {
        let mut hdr = [0u8; FILE_HEADER_LEN];
        let got = read_full(&mut inner, &mut hdr)?;
        check_header(&hdr[..got])?;
        Ok(FlowFileReader {
            inner,
            buf: [0u8; RECORD_LEN],
            records_read: 0,
        })
    }

    pub fn records_read(&self) -> u64 {
        self.records_read
    }

    /// Next record exactly as stored.
    pub fn next_encoded(&mut self) -> Result<Option<&[u8]>, StreamError> {
        let got = read_full(&mut self.inner, &mut self.buf)?;
        if got == 0 {
            return Ok(None);
        }
        if got < RECORD_LEN {
            return Err(StreamError::Format(ParseError::TooShort {
                expected: RECORD_LEN,
                actual: got,
            }));
        }
        self.records_read += 1;
        Ok(Some(&self.buf))
    }
}

impl<R: Read> RecordSource for FlowFileReader<R> {
    fn next_record(&mut self) -> Result<Option<FlowRecord>, StreamError> {
        Ok(self.next_encoded()?.map(FlowRecord::decode))
    }
}

/// Fill `buf` as far as the reader allows; returns the byte count read.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Writes records to a flow file.
pub struct FlowFileWriter<W: Write> {
    inner: BufWriter<W>,
    records_written: u64,
}

impl FlowFileWriter<File> {
    pub fn create(path: &Path) -> io::Result<Self> {
        FlowFileWriter::new(File::create(path)?)
    }
}

impl<W: Write> FlowFileWriter<W> {
    pub fn new(inner: W) -> io::Result<Self> {
        let mut inner = BufWriter::new(inner);
        inner.write_all(&encode_header())?;
        Ok(FlowFileWriter {
            inner,
            records_written: 0,
        })
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Flush buffered records and hand back the underlying writer.
    pub fn finish(self) -> io::Result<W> {
        self.inner.into_inner().map_err(|e| e.into_error())
    }
}

impl<W: Write> RecordSink for FlowFileWriter<W> {
    fn write_encoded(&mut self, rec: &[u8]) -> io::Result<()> {
        self.inner.write_all(&rec[..RECORD_LEN])?;
        self.records_written += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn rec(port: u16) -> FlowRecord {
        FlowRecord {
            sport: port,
            packets: 1,
            bytes: 64,
            ..FlowRecord::default()
        }
    }

    #[test]
    fn write_then_read_back() {
        let mut writer = FlowFileWriter::new(Vec::new()).unwrap();
        for port in [80, 443, 53] {
            writer.write_record(&rec(port)).unwrap();
        }
        assert_eq!(writer.records_written(), 3);
        let bytes = writer.finish().unwrap();
        assert_eq!(bytes.len(), FILE_HEADER_LEN + 3 * RECORD_LEN);

        let mut reader = FlowFileReader::new(Cursor::new(bytes)).unwrap();
        let mut ports = Vec::new();
        while let Some(r) = reader.next_record().unwrap() {
            ports.push(r.sport);
        }
        assert_eq!(ports, vec![80, 443, 53]);
        assert_eq!(reader.records_read(), 3);
    }

    #[test]
    fn reject_foreign_file() {
        let err = FlowFileReader::new(Cursor::new(b"NOPE00000000000000".to_vec())).err();
        assert!(matches!(err, Some(StreamError::Format(ParseError::InvalidHeader(_)))));
        let err = FlowFileReader::new(Cursor::new(b"FLW".to_vec())).err();
        assert!(matches!(err, Some(StreamError::Format(ParseError::TooShort { .. }))));
    }

    #[test]
    fn partial_trailing_record_is_an_error() {
        let mut writer = FlowFileWriter::new(Vec::new()).unwrap();
        writer.write_record(&rec(1)).unwrap();
        let mut bytes = writer.finish().unwrap();
        bytes.extend_from_slice(&[0u8; 10]);
        let mut reader = FlowFileReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.next_record().unwrap().is_some());
        assert!(reader.next_record().is_err());
    }
}
