//! Canonical flow record and its fixed binary layout.
//!
//! Every record occupies [`RECORD_LEN`] bytes, little-endian:
//!
//! ```text
//!  off  len  field
//!    0    8  start time, ms since UNIX epoch (i64)
//!    8    4  duration, ms
//!   12    2  source port
//!   14    2  destination port
//!   16    1  protocol
//!   17    1  flow type (0xff = absent)
//!   18    2  sensor id (0xffff = absent)
//!   20    1  TCP flags (OR of all packets)
//!   21    1  initial-packet TCP flags
//!   22    1  session-rest TCP flags
//!   23    1  TCP state attributes (0x80 = addresses are IPv6)
//!   24    2  application
//!   26    2  memo
//!   28    2  input interface
//!   30    2  output interface
//!   32    4  packets
//!   36    4  bytes
//!   40   16  source IP      (IPv4 stored v4-mapped)
//!   56   16  destination IP
//!   72   16  next-hop IP
//! ```

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::protocol::IpProtocol;

pub const RECORD_LEN: usize = 88;

const FLOW_TYPE_ABSENT: u8 = 0xff;
const SENSOR_ABSENT: u16 = 0xffff;

/// TCP state attribute byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct TcpState(u8);

impl TcpState {
    pub const NO_INFO: TcpState = TcpState(0);
    /// Initial and session flags are set.
    pub const EXPANDED: u8 = 0x01;
    /// Flow received packets following a FIN that were not ACK or RST.
    pub const FIN_FOLLOWED_NOT_ACK: u8 = 0x08;
    /// Flow has packets all of the same size.
    pub const UNIFORM_PACKET_SIZE: u8 = 0x10;
    /// Flow ended prematurely due to a timeout.
    pub const TIMEOUT_KILLED: u8 = 0x20;
    /// Flow is a continuation of a timed-out flow.
    pub const TIMEOUT_STARTED: u8 = 0x40;
    /// Marks IPv6 addresses on disk; never part of the in-memory value.
    pub const IPV6: u8 = 0x80;

    const MASK: u8 = 0x79;

    pub fn from_bits(bits: u8) -> Self {
        TcpState(bits & Self::MASK)
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, bit: u8) -> bool {
        self.0 & bit == bit
    }
}

/// A canonical flow record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowRecord {
    pub start_time_ms: i64,
    pub elapsed_ms: u32,
    pub sport: u16,
    pub dport: u16,
    pub proto: u8,
    pub flow_type: Option<u8>,
    pub sensor: Option<u16>,
    pub flags: u8,
    pub init_flags: u8,
    pub rest_flags: u8,
    pub tcp_state: TcpState,
    pub application: u16,
    pub memo: u16,
    pub input: u16,
    pub output: u16,
    pub packets: u32,
    pub bytes: u32,
    pub sip: IpAddr,
    pub dip: IpAddr,
    pub nhip: IpAddr,
}

impl Default for FlowRecord {
    fn default() -> Self {
        FlowRecord {
            start_time_ms: 0,
            elapsed_ms: 0,
            sport: 0,
            dport: 0,
            proto: 0,
            flow_type: None,
            sensor: None,
            flags: 0,
            init_flags: 0,
            rest_flags: 0,
            tcp_state: TcpState::NO_INFO,
            application: 0,
            memo: 0,
            input: 0,
            output: 0,
            packets: 0,
            bytes: 0,
            sip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            dip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            nhip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        }
    }
}

fn widen(ip: &IpAddr) -> [u8; 16] {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
        IpAddr::V6(v6) => v6.octets(),
    }
}

fn narrow(bytes: &[u8], is_v6: bool) -> IpAddr {
    if is_v6 {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&bytes[..16]);
        IpAddr::V6(Ipv6Addr::from(octets))
    } else {
        IpAddr::V4(Ipv4Addr::new(bytes[12], bytes[13], bytes[14], bytes[15]))
    }
}

impl FlowRecord {
    /// End time (start plus duration) in ms since the UNIX epoch.
    pub fn end_time_ms(&self) -> i64 {
        self.start_time_ms + self.elapsed_ms as i64
    }

    pub fn is_ipv6(&self) -> bool {
        self.sip.is_ipv6() || self.dip.is_ipv6() || self.nhip.is_ipv6()
    }

    pub fn protocol(&self) -> IpProtocol {
        IpProtocol::from(self.proto)
    }

    /// ICMP type, or 0 when the flow is not ICMP.
    pub fn icmp_type(&self) -> u8 {
        if self.protocol().is_icmp() {
            (self.dport >> 8) as u8
        } else {
            0
        }
    }

    /// ICMP code, or 0 when the flow is not ICMP.
    pub fn icmp_code(&self) -> u8 {
        if self.protocol().is_icmp() {
            (self.dport & 0xff) as u8
        } else {
            0
        }
    }

    /// Write the record into `out`, which must hold at least [`RECORD_LEN`] bytes.
    pub fn encode_into(&self, out: &mut [u8]) {
        let out = &mut out[..RECORD_LEN];
        let is_v6 = self.is_ipv6();
        out[0..8].copy_from_slice(&self.start_time_ms.to_le_bytes());
        out[8..12].copy_from_slice(&self.elapsed_ms.to_le_bytes());
        out[12..14].copy_from_slice(&self.sport.to_le_bytes());
        out[14..16].copy_from_slice(&self.dport.to_le_bytes());
        out[16] = self.proto;
        out[17] = self.flow_type.unwrap_or(FLOW_TYPE_ABSENT);
        out[18..20].copy_from_slice(&self.sensor.unwrap_or(SENSOR_ABSENT).to_le_bytes());
        out[20] = self.flags;
        out[21] = self.init_flags;
        out[22] = self.rest_flags;
        out[23] = self.tcp_state.bits() | if is_v6 { TcpState::IPV6 } else { 0 };
        out[24..26].copy_from_slice(&self.application.to_le_bytes());
        out[26..28].copy_from_slice(&self.memo.to_le_bytes());
        out[28..30].copy_from_slice(&self.input.to_le_bytes());
        out[30..32].copy_from_slice(&self.output.to_le_bytes());
        out[32..36].copy_from_slice(&self.packets.to_le_bytes());
        out[36..40].copy_from_slice(&self.bytes.to_le_bytes());
        out[40..56].copy_from_slice(&widen(&self.sip));
        out[56..72].copy_from_slice(&widen(&self.dip));
        out[72..88].copy_from_slice(&widen(&self.nhip));
    }

    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let mut out = [0u8; RECORD_LEN];
        self.encode_into(&mut out);
        out
    }

    /// Decode from the first [`RECORD_LEN`] bytes of `data`.
    pub fn decode(data: &[u8]) -> FlowRecord {
        let view = RecordView::new(data);
        let is_v6 = view.is_ipv6();
        let flow_type = match data[17] {
            FLOW_TYPE_ABSENT => None,
            v => Some(v),
        };
        let sensor = match view.sensor_raw() {
            SENSOR_ABSENT => None,
            v => Some(v),
        };
        FlowRecord {
            start_time_ms: view.start_time_ms(),
            elapsed_ms: view.elapsed_ms(),
            sport: view.sport(),
            dport: view.dport(),
            proto: view.proto(),
            flow_type,
            sensor,
            flags: view.flags(),
            init_flags: view.init_flags(),
            rest_flags: view.rest_flags(),
            tcp_state: TcpState::from_bits(data[23]),
            application: view.application(),
            memo: u16::from_le_bytes([data[26], data[27]]),
            input: view.input(),
            output: view.output(),
            packets: view.packets(),
            bytes: view.bytes(),
            sip: narrow(view.sip(), is_v6),
            dip: narrow(view.dip(), is_v6),
            nhip: narrow(view.nhip(), is_v6),
        }
    }
}

impl fmt::Display for FlowRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{} proto={} pkts={} bytes={} stime={} dur={}ms",
            self.sip,
            self.sport,
            self.dip,
            self.dport,
            self.proto,
            self.packets,
            self.bytes,
            self.start_time_ms,
            self.elapsed_ms
        )
    }
}

/// Zero-copy accessor over an encoded record, used by the sort comparators.
#[derive(Debug, Clone, Copy)]
pub struct RecordView<'a> {
    data: &'a [u8],
}

impl<'a> RecordView<'a> {
    #[inline]
    pub fn new(data: &'a [u8]) -> Self {
        RecordView {
            data: &data[..RECORD_LEN],
        }
    }

    #[inline]
    fn le16(&self, off: usize) -> u16 {
        u16::from_le_bytes([self.data[off], self.data[off + 1]])
    }

    #[inline]
    fn le32(&self, off: usize) -> u32 {
        u32::from_le_bytes([
            self.data[off],
            self.data[off + 1],
            self.data[off + 2],
            self.data[off + 3],
        ])
    }

    #[inline]
    pub fn start_time_ms(&self) -> i64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.data[0..8]);
        i64::from_le_bytes(b)
    }

    #[inline]
    pub fn elapsed_ms(&self) -> u32 {
        self.le32(8)
    }

    #[inline]
    pub fn end_time_ms(&self) -> i64 {
        self.start_time_ms() + self.elapsed_ms() as i64
    }

    #[inline]
    pub fn sport(&self) -> u16 {
        self.le16(12)
    }

    #[inline]
    pub fn dport(&self) -> u16 {
        self.le16(14)
    }

    #[inline]
    pub fn proto(&self) -> u8 {
        self.data[16]
    }

    /// Raw flow type byte; absent sorts last.
    #[inline]
    pub fn flow_type_raw(&self) -> u8 {
        self.data[17]
    }

    /// Raw sensor id; absent sorts last.
    #[inline]
    pub fn sensor_raw(&self) -> u16 {
        self.le16(18)
    }

    #[inline]
    pub fn flags(&self) -> u8 {
        self.data[20]
    }

    #[inline]
    pub fn init_flags(&self) -> u8 {
        self.data[21]
    }

    #[inline]
    pub fn rest_flags(&self) -> u8 {
        self.data[22]
    }

    #[inline]
    pub fn tcp_state(&self) -> u8 {
        self.data[23] & !TcpState::IPV6
    }

    #[inline]
    pub fn is_ipv6(&self) -> bool {
        self.data[23] & TcpState::IPV6 != 0
    }

    #[inline]
    pub fn application(&self) -> u16 {
        self.le16(24)
    }

    #[inline]
    pub fn input(&self) -> u16 {
        self.le16(28)
    }

    #[inline]
    pub fn output(&self) -> u16 {
        self.le16(30)
    }

    #[inline]
    pub fn packets(&self) -> u32 {
        self.le32(32)
    }

    #[inline]
    pub fn bytes(&self) -> u32 {
        self.le32(36)
    }

    /// Source address widened to 16 bytes; compares correctly across families.
    #[inline]
    pub fn sip(&self) -> &'a [u8] {
        &self.data[40..56]
    }

    #[inline]
    pub fn dip(&self) -> &'a [u8] {
        &self.data[56..72]
    }

    #[inline]
    pub fn nhip(&self) -> &'a [u8] {
        &self.data[72..88]
    }

    #[inline]
    pub fn icmp_type(&self) -> u8 {
        if IpProtocol::from(self.proto()).is_icmp() {
            (self.dport() >> 8) as u8
        } else {
            0
        }
    }

    #[inline]
    pub fn icmp_code(&self) -> u8 {
        if IpProtocol::from(self.proto()).is_icmp() {
            (self.dport() & 0xff) as u8
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FlowRecord {
        FlowRecord {
            start_time_ms: 1_700_000_000_123,
            elapsed_ms: 4500,
            sport: 51515,
            dport: 443,
            proto: 6,
            sensor: Some(12),
            flags: 0x1b,
            tcp_state: TcpState::from_bits(TcpState::TIMEOUT_KILLED),
            input: 3,
            output: 9,
            packets: 12,
            bytes: 9000,
            sip: "10.1.2.3".parse().unwrap(),
            dip: "192.0.2.77".parse().unwrap(),
            nhip: "10.1.0.1".parse().unwrap(),
            ..FlowRecord::default()
        }
    }

    #[test]
    fn ipv4_record_survives_encoding() {
        let rec = sample();
        let bytes = rec.encode();
        assert_eq!(FlowRecord::decode(&bytes), rec);
        assert!(!RecordView::new(&bytes).is_ipv6());
        assert_eq!(bytes[17], 0xff);
    }

    #[test]
    fn ipv6_sets_marker_bit() {
        let mut rec = sample();
        rec.dip = "2001:db8::1".parse().unwrap();
        let bytes = rec.encode();
        let view = RecordView::new(&bytes);
        assert!(view.is_ipv6());
        assert_eq!(view.tcp_state(), TcpState::TIMEOUT_KILLED);
        let back = FlowRecord::decode(&bytes);
        assert_eq!(back.dip, rec.dip);
        assert_eq!(back.sip, IpAddr::V6("::ffff:10.1.2.3".parse().unwrap()));
        assert_eq!(back.encode(), bytes);
    }

    #[test]
    fn ipv4_orders_inside_widened_space() {
        let mut a = sample();
        let mut b = sample();
        a.sip = "255.255.255.255".parse().unwrap();
        b.sip = "::ffff:1:0:0".parse().unwrap();
        let (ea, eb) = (a.encode(), b.encode());
        assert!(RecordView::new(&ea).sip() < RecordView::new(&eb).sip());
    }

    #[test]
    fn icmp_type_and_code_come_from_dport() {
        let mut rec = sample();
        rec.proto = 1;
        rec.dport = 0x0803;
        assert_eq!(rec.icmp_type(), 8);
        assert_eq!(rec.icmp_code(), 3);
        let bytes = rec.encode();
        assert_eq!(RecordView::new(&bytes).icmp_type(), 8);
        rec.proto = 17;
        assert_eq!(rec.icmp_type(), 0);
    }

    #[test]
    fn end_time_adds_duration() {
        let rec = sample();
        assert_eq!(rec.end_time_ms(), 1_700_000_004_623);
        assert_eq!(RecordView::new(&rec.encode()).end_time_ms(), rec.end_time_ms());
    }
}
