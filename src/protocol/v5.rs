//! Zero-copy NetFlow v5 PDU parser.
//!
//! Header layout (24 bytes, big-endian):
//!   0                   1                   2                   3
//!   0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |            Version            |             Count             |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                           SysUptime                           |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                           unix_secs                           |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                           unix_nsecs                          |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |                         flow_sequence                         |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!  |  engine_type  |   engine_id   |       sampling_interval       |
//!  +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
//!
//! Followed by `count` 48-byte flow records.

use std::fmt;
use std::net::Ipv4Addr;

pub const V5_VERSION: u16 = 5;
pub const V5_HEADER_LEN: usize = 24;
pub const V5_RECORD_LEN: usize = 48;
pub const V5_MAX_RECORDS: usize = 30;
/// Largest legal PDU: header plus thirty records.
pub const V5_PDU_LEN: usize = V5_HEADER_LEN + V5_MAX_RECORDS * V5_RECORD_LEN;

/// Reasons a datagram is not a usable v5 PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduError {
    TruncatedHeader,
    BadVersion(u16),
    ZeroRecords,
    TooManyRecords(u16),
    TruncatedData { expected: usize, actual: usize },
}

impl PduError {
    /// Short reason text used in "Rejected PDU record ..." log lines.
    pub fn reason(&self) -> &'static str {
        match self {
            PduError::TruncatedHeader => "due to truncated header",
            PduError::BadVersion(_) => "not marked as version 5",
            PduError::ZeroRecords => "reporting zero records",
            PduError::TooManyRecords(_) => "reporting more than 30 records",
            PduError::TruncatedData { .. } => "due to truncated data section",
        }
    }
}

impl fmt::Display for PduError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PduError::BadVersion(v) => write!(f, "{} (got {})", self.reason(), v),
            PduError::TooManyRecords(n) => write!(f, "{} (got {})", self.reason(), n),
            PduError::TruncatedData { expected, actual } => write!(
                f,
                "{}: need {} bytes, got {}",
                self.reason(),
                expected,
                actual
            ),
            _ => f.write_str(self.reason()),
        }
    }
}

impl std::error::Error for PduError {}

#[inline]
fn be16(data: &[u8], off: usize) -> u16 {
    u16::from_be_bytes([data[off], data[off + 1]])
}

#[inline]
fn be32(data: &[u8], off: usize) -> u32 {
    u32::from_be_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

/// Zero-copy v5 header.
#[derive(Debug, Clone, Copy)]
pub struct V5Header<'a> {
    data: &'a [u8],
}

impl<'a> V5Header<'a> {
    #[inline]
    pub fn version(&self) -> u16 {
        be16(self.data, 0)
    }

    #[inline]
    pub fn count(&self) -> u16 {
        be16(self.data, 2)
    }

    /// Milliseconds since the exporter booted; wraps at 2^32.
    #[inline]
    pub fn sys_uptime(&self) -> u32 {
        be32(self.data, 4)
    }

    #[inline]
    pub fn unix_secs(&self) -> u32 {
        be32(self.data, 8)
    }

    #[inline]
    pub fn unix_nsecs(&self) -> u32 {
        be32(self.data, 12)
    }

    #[inline]
    pub fn flow_sequence(&self) -> u32 {
        be32(self.data, 16)
    }

    #[inline]
    pub fn engine_type(&self) -> u8 {
        self.data[20]
    }

    #[inline]
    pub fn engine_id(&self) -> u8 {
        self.data[21]
    }

    #[inline]
    pub fn sampling_interval(&self) -> u16 {
        be16(self.data, 22)
    }

    /// Export time as milliseconds since the UNIX epoch.
    #[inline]
    pub fn export_time_ms(&self) -> i64 {
        self.unix_secs() as i64 * 1000 + (self.unix_nsecs() / 1_000_000) as i64
    }

    /// `(engine_type << 8) | engine_id`.
    #[inline]
    pub fn engine_key(&self) -> u16 {
        ((self.engine_type() as u16) << 8) | self.engine_id() as u16
    }
}

/// Zero-copy v5 flow record.
#[derive(Debug, Clone, Copy)]
pub struct V5Record<'a> {
    data: &'a [u8],
}

impl<'a> V5Record<'a> {
    /// Record `index` of a datagram that already passed [`V5Pdu::parse`].
    /// `None` if the bytes stop short of it.
    #[inline]
    pub fn at(pdu: &'a [u8], index: usize) -> Option<V5Record<'a>> {
        let off = V5_HEADER_LEN + index * V5_RECORD_LEN;
        pdu.get(off..off + V5_RECORD_LEN).map(|data| V5Record { data })
    }

    #[inline]
    pub fn src_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(be32(self.data, 0))
    }

    #[inline]
    pub fn dst_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(be32(self.data, 4))
    }

    #[inline]
    pub fn next_hop(&self) -> Ipv4Addr {
        Ipv4Addr::from(be32(self.data, 8))
    }

    #[inline]
    pub fn input(&self) -> u16 {
        be16(self.data, 12)
    }

    #[inline]
    pub fn output(&self) -> u16 {
        be16(self.data, 14)
    }

    #[inline]
    pub fn packets(&self) -> u32 {
        be32(self.data, 16)
    }

    #[inline]
    pub fn octets(&self) -> u32 {
        be32(self.data, 20)
    }

    /// Uptime (ms) at the first packet of the flow.
    #[inline]
    pub fn first(&self) -> u32 {
        be32(self.data, 24)
    }

    /// Uptime (ms) at the last packet of the flow.
    #[inline]
    pub fn last(&self) -> u32 {
        be32(self.data, 28)
    }

    #[inline]
    pub fn src_port(&self) -> u16 {
        be16(self.data, 32)
    }

    #[inline]
    pub fn dst_port(&self) -> u16 {
        be16(self.data, 34)
    }

    #[inline]
    pub fn tcp_flags(&self) -> u8 {
        self.data[37]
    }

    #[inline]
    pub fn protocol(&self) -> u8 {
        self.data[38]
    }

    #[inline]
    pub fn tos(&self) -> u8 {
        self.data[39]
    }

    #[inline]
    pub fn src_as(&self) -> u16 {
        be16(self.data, 40)
    }

    #[inline]
    pub fn dst_as(&self) -> u16 {
        be16(self.data, 42)
    }

    #[inline]
    pub fn src_mask(&self) -> u8 {
        self.data[44]
    }

    #[inline]
    pub fn dst_mask(&self) -> u8 {
        self.data[45]
    }
}

/// A validated v5 PDU borrowing the datagram bytes.
#[derive(Debug, Clone, Copy)]
pub struct V5Pdu<'a> {
    header: V5Header<'a>,
    records: &'a [u8],
}

impl<'a> V5Pdu<'a> {
    /// Validate and wrap a datagram. Trailing bytes past the last record are ignored.
    pub fn parse(data: &'a [u8]) -> Result<Self, PduError> {
        if data.len() < V5_HEADER_LEN {
            return Err(PduError::TruncatedHeader);
        }
        let header = V5Header { data: &data[..V5_HEADER_LEN] };
        if header.version() != V5_VERSION {
            return Err(PduError::BadVersion(header.version()));
        }
        let count = header.count() as usize;
        if count == 0 {
            return Err(PduError::ZeroRecords);
        }
        if count > V5_MAX_RECORDS {
            return Err(PduError::TooManyRecords(header.count()));
        }
        let expected = V5_HEADER_LEN + count * V5_RECORD_LEN;
        if data.len() < expected {
            return Err(PduError::TruncatedData {
                expected,
                actual: data.len(),
            });
        }
        Ok(V5Pdu {
            header,
            records: &data[V5_HEADER_LEN..expected],
        })
    }

    #[inline]
    pub fn header(&self) -> V5Header<'a> {
        self.header
    }

    #[inline]
    pub fn count(&self) -> usize {
        self.records.len() / V5_RECORD_LEN
    }

    /// Record `index`; panics if out of range.
    #[inline]
    pub fn record(&self, index: usize) -> V5Record<'a> {
        let off = index * V5_RECORD_LEN;
        V5Record {
            data: &self.records[off..off + V5_RECORD_LEN],
        }
    }

    pub fn records(&self) -> impl Iterator<Item = V5Record<'a>> + 'a {
        self.records
            .chunks_exact(V5_RECORD_LEN)
            .map(|data| V5Record { data })
    }
}

/// Owned header values, used to build PDUs for replay files and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeaderFields {
    pub sys_uptime: u32,
    pub unix_secs: u32,
    pub unix_nsecs: u32,
    pub flow_sequence: u32,
    pub engine_type: u8,
    pub engine_id: u8,
    pub sampling_interval: u16,
}

/// Owned record values; the counterpart of [`V5Record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordFields {
    pub src_addr: Ipv4Addr,
    pub dst_addr: Ipv4Addr,
    pub next_hop: Ipv4Addr,
    pub input: u16,
    pub output: u16,
    pub packets: u32,
    pub octets: u32,
    pub first: u32,
    pub last: u32,
    pub src_port: u16,
    pub dst_port: u16,
    pub tcp_flags: u8,
    pub protocol: u8,
    pub tos: u8,
    pub src_as: u16,
    pub dst_as: u16,
    pub src_mask: u8,
    pub dst_mask: u8,
}

impl Default for RecordFields {
    fn default() -> Self {
        RecordFields {
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::UNSPECIFIED,
            next_hop: Ipv4Addr::UNSPECIFIED,
            input: 0,
            output: 0,
            packets: 1,
            octets: 40,
            first: 0,
            last: 0,
            src_port: 0,
            dst_port: 0,
            tcp_flags: 0,
            protocol: 6,
            tos: 0,
            src_as: 0,
            dst_as: 0,
            src_mask: 0,
            dst_mask: 0,
        }
    }
}

impl RecordFields {
    fn write_to(&self, out: &mut [u8]) {
        out[0..4].copy_from_slice(&self.src_addr.octets());
        out[4..8].copy_from_slice(&self.dst_addr.octets());
        out[8..12].copy_from_slice(&self.next_hop.octets());
        out[12..14].copy_from_slice(&self.input.to_be_bytes());
        out[14..16].copy_from_slice(&self.output.to_be_bytes());
        out[16..20].copy_from_slice(&self.packets.to_be_bytes());
        out[20..24].copy_from_slice(&self.octets.to_be_bytes());
        out[24..28].copy_from_slice(&self.first.to_be_bytes());
        out[28..32].copy_from_slice(&self.last.to_be_bytes());
        out[32..34].copy_from_slice(&self.src_port.to_be_bytes());
        out[34..36].copy_from_slice(&self.dst_port.to_be_bytes());
        out[36] = 0;
        out[37] = self.tcp_flags;
        out[38] = self.protocol;
        out[39] = self.tos;
        out[40..42].copy_from_slice(&self.src_as.to_be_bytes());
        out[42..44].copy_from_slice(&self.dst_as.to_be_bytes());
        out[44] = self.src_mask;
        out[45] = self.dst_mask;
        out[46] = 0;
        out[47] = 0;
    }
}

/// Encode a v5 PDU. The count field is taken from `records.len()`, which
/// the caller keeps within [`V5_MAX_RECORDS`].
pub fn encode_pdu(header: &HeaderFields, records: &[RecordFields]) -> Vec<u8> {
    let mut out = vec![0u8; V5_HEADER_LEN + records.len() * V5_RECORD_LEN];
    out[0..2].copy_from_slice(&V5_VERSION.to_be_bytes());
    out[2..4].copy_from_slice(&(records.len() as u16).to_be_bytes());
    out[4..8].copy_from_slice(&header.sys_uptime.to_be_bytes());
    out[8..12].copy_from_slice(&header.unix_secs.to_be_bytes());
    out[12..16].copy_from_slice(&header.unix_nsecs.to_be_bytes());
    out[16..20].copy_from_slice(&header.flow_sequence.to_be_bytes());
    out[20] = header.engine_type;
    out[21] = header.engine_id;
    out[22..24].copy_from_slice(&header.sampling_interval.to_be_bytes());
    for (rec, chunk) in records
        .iter()
        .zip(out[V5_HEADER_LEN..].chunks_exact_mut(V5_RECORD_LEN))
    {
        rec.write_to(chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_pdu(count: usize) -> Vec<u8> {
        let header = HeaderFields {
            sys_uptime: 3_600_000,
            unix_secs: 1_700_000_000,
            unix_nsecs: 250_000_000,
            flow_sequence: 42,
            engine_type: 1,
            engine_id: 7,
            sampling_interval: 0,
        };
        let records: Vec<RecordFields> = (0..count)
            .map(|i| RecordFields {
                src_addr: Ipv4Addr::new(10, 0, 0, i as u8),
                dst_addr: Ipv4Addr::new(192, 168, 1, 1),
                src_port: 1024 + i as u16,
                dst_port: 443,
                packets: 10,
                octets: 1500,
                first: 1000,
                last: 2000,
                ..RecordFields::default()
            })
            .collect();
        encode_pdu(&header, &records)
    }

    #[test]
    fn parse_header_fields() {
        let data = sample_pdu(2);
        let pdu = V5Pdu::parse(&data).unwrap();
        let hdr = pdu.header();
        assert_eq!(hdr.version(), 5);
        assert_eq!(hdr.count(), 2);
        assert_eq!(hdr.sys_uptime(), 3_600_000);
        assert_eq!(hdr.flow_sequence(), 42);
        assert_eq!(hdr.engine_key(), 0x0107);
        assert_eq!(hdr.export_time_ms(), 1_700_000_000_250);
    }

    #[test]
    fn parse_record_fields() {
        let data = sample_pdu(3);
        let pdu = V5Pdu::parse(&data).unwrap();
        assert_eq!(pdu.count(), 3);
        let rec = pdu.record(2);
        assert_eq!(rec.src_addr(), Ipv4Addr::new(10, 0, 0, 2));
        assert_eq!(rec.src_port(), 1026);
        assert_eq!(rec.dst_port(), 443);
        assert_eq!(rec.protocol(), 6);
        assert_eq!(rec.octets(), 1500);
        assert_eq!(pdu.records().count(), 3);
    }

    #[test]
    fn record_at_indexes_raw_bytes() {
        let data = sample_pdu(3);
        let pdu = V5Pdu::parse(&data).unwrap();
        for i in 0..3 {
            let rec = V5Record::at(&data, i).unwrap();
            assert_eq!(rec.src_addr(), pdu.record(i).src_addr());
            assert_eq!(rec.src_port(), pdu.record(i).src_port());
        }
        assert!(V5Record::at(&data, 3).is_none());
    }

    #[test]
    fn full_pdu_is_nominal_size() {
        assert_eq!(sample_pdu(30).len(), V5_PDU_LEN);
        assert_eq!(V5_PDU_LEN, 1464);
    }

    #[test]
    fn reject_short_header() {
        assert_eq!(V5Pdu::parse(&[0u8; 23]).unwrap_err(), PduError::TruncatedHeader);
    }

    #[test]
    fn reject_wrong_version() {
        let mut data = sample_pdu(1);
        data[1] = 9;
        assert_eq!(V5Pdu::parse(&data).unwrap_err(), PduError::BadVersion(9));
    }

    #[test]
    fn reject_bad_counts() {
        let mut data = sample_pdu(1);
        data[3] = 0;
        assert_eq!(V5Pdu::parse(&data).unwrap_err(), PduError::ZeroRecords);
        data[3] = 31;
        assert_eq!(V5Pdu::parse(&data).unwrap_err(), PduError::TooManyRecords(31));
    }

    #[test]
    fn reject_truncated_records() {
        let data = sample_pdu(2);
        let err = V5Pdu::parse(&data[..data.len() - 1]).unwrap_err();
        assert_eq!(
            err,
            PduError::TruncatedData {
                expected: 120,
                actual: 119
            }
        );
        assert_eq!(err.reason(), "due to truncated data section");
    }
}
