//! Sort keys: the field list, plug-in key fields, node layout and the
//! composite comparator.
//!
//! A sort node is an encoded [`FlowRecord`] followed by the binary values
//! of any plug-in fields, padded to a multiple of 8 bytes.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::record::{FlowRecord, RecordView, RECORD_LEN};

/// Largest node the sorter will handle.
pub const MAX_NODE_SIZE: usize = 8192;
/// Most plug-in fields one key may use.
pub const MAX_PLUGIN_KEY_FIELDS: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    Empty,
    UnknownField { name: String, available: String },
    Duplicate(String),
    /// `icmpTypeCode` combined with `iType` or `iCode`.
    IcmpTypeCodeMix,
    TooManyPlugins(usize),
    NodeTooLarge(usize),
}

impl fmt::Display for KeyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyError::Empty => write!(f, "no sort fields given"),
            KeyError::UnknownField { name, available } => {
                write!(f, "unknown field '{}'; available fields: {}", name, available)
            }
            KeyError::Duplicate(name) => write!(f, "duplicate field '{}'", name),
            KeyError::IcmpTypeCodeMix => {
                write!(f, "may not mix field icmpTypeCode with iType or iCode")
            }
            KeyError::TooManyPlugins(n) => write!(
                f,
                "{} plug-in fields requested; at most {} are supported",
                n, MAX_PLUGIN_KEY_FIELDS
            ),
            KeyError::NodeTooLarge(n) => write!(
                f,
                "sort node of {} bytes exceeds the {} byte maximum",
                n, MAX_NODE_SIZE
            ),
        }
    }
}

impl std::error::Error for KeyError {}

/// Built-in record fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SortField {
    SourceIp,
    DestIp,
    SourcePort,
    DestPort,
    Protocol,
    Packets,
    Bytes,
    Flags,
    StartTime,
    Duration,
    EndTime,
    Sensor,
    Input,
    Output,
    NextHopIp,
    InitialFlags,
    SessionFlags,
    Attributes,
    Application,
    FlowClass,
    FlowType,
    IcmpType,
    IcmpCode,
}

/// Names accepted for each built-in field; the first is canonical.
const FIELD_NAMES: &[(SortField, &[&str])] = &[
    (SortField::SourceIp, &["sIP", "1"]),
    (SortField::DestIp, &["dIP", "2"]),
    (SortField::SourcePort, &["sPort", "3"]),
    (SortField::DestPort, &["dPort", "4"]),
    (SortField::Protocol, &["protocol", "5"]),
    (SortField::Packets, &["packets", "pkts", "6"]),
    (SortField::Bytes, &["bytes", "7"]),
    (SortField::Flags, &["flags", "8"]),
    (SortField::StartTime, &["sTime", "9"]),
    (SortField::Duration, &["duration", "dur", "10"]),
    (SortField::EndTime, &["eTime", "11"]),
    (SortField::Sensor, &["sensor", "12"]),
    (SortField::Input, &["in", "13"]),
    (SortField::Output, &["out", "14"]),
    (SortField::NextHopIp, &["nhIP", "15"]),
    (SortField::FlowClass, &["class", "20"]),
    (SortField::FlowType, &["type", "21"]),
    (SortField::InitialFlags, &["initialFlags", "26"]),
    (SortField::SessionFlags, &["sessionFlags", "27"]),
    (SortField::Attributes, &["attributes", "28"]),
    (SortField::Application, &["application", "29"]),
    (SortField::IcmpType, &["iType", "icmpType"]),
    (SortField::IcmpCode, &["iCode", "icmpCode"]),
];

const ICMP_TYPE_CODE: &str = "icmpTypeCode";

impl SortField {
    pub fn lookup(name: &str) -> Option<SortField> {
        FIELD_NAMES
            .iter()
            .find(|(_, names)| names.iter().any(|n| n.eq_ignore_ascii_case(name)))
            .map(|(field, _)| *field)
    }

    pub fn name(&self) -> &'static str {
        FIELD_NAMES
            .iter()
            .find(|(field, _)| field == self)
            .map(|(_, names)| names[0])
            .unwrap_or("?")
    }

    /// Compare two encoded records on this field.
    #[inline]
    pub fn compare(&self, a: &RecordView<'_>, b: &RecordView<'_>) -> Ordering {
        match self {
            SortField::SourceIp => a.sip().cmp(b.sip()),
            SortField::DestIp => a.dip().cmp(b.dip()),
            SortField::NextHopIp => a.nhip().cmp(b.nhip()),
            SortField::SourcePort => a.sport().cmp(&b.sport()),
            SortField::DestPort => a.dport().cmp(&b.dport()),
            SortField::Protocol => a.proto().cmp(&b.proto()),
            SortField::Packets => a.packets().cmp(&b.packets()),
            SortField::Bytes => a.bytes().cmp(&b.bytes()),
            SortField::Flags => a.flags().cmp(&b.flags()),
            SortField::StartTime => a.start_time_ms().cmp(&b.start_time_ms()),
            SortField::Duration => a.elapsed_ms().cmp(&b.elapsed_ms()),
            SortField::EndTime => a.end_time_ms().cmp(&b.end_time_ms()),
            SortField::Sensor => a.sensor_raw().cmp(&b.sensor_raw()),
            SortField::Input => a.input().cmp(&b.input()),
            SortField::Output => a.output().cmp(&b.output()),
            SortField::InitialFlags => a.init_flags().cmp(&b.init_flags()),
            SortField::SessionFlags => a.rest_flags().cmp(&b.rest_flags()),
            SortField::Attributes => a.tcp_state().cmp(&b.tcp_state()),
            SortField::Application => a.application().cmp(&b.application()),
            SortField::FlowClass | SortField::FlowType => {
                a.flow_type_raw().cmp(&b.flow_type_raw())
            }
            SortField::IcmpType => a.icmp_type().cmp(&b.icmp_type()),
            SortField::IcmpCode => a.icmp_code().cmp(&b.icmp_code()),
        }
    }
}

/// A sort field computed from the record into a fixed-width binary value.
pub trait KeyField: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    /// Bytes written by [`KeyField::extract`].
    fn width(&self) -> usize;

    /// Write this field's value for `rec` into `out` (`width()` bytes).
    fn extract(&self, rec: &FlowRecord, out: &mut [u8]);

    /// Order two extracted values. Defaults to byte order, which suits
    /// big-endian integers.
    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

impl fmt::Debug for dyn KeyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "KeyField({}, {} bytes)", self.name(), self.width())
    }
}

/// Plug-in fields available to `--fields`.
#[derive(Debug, Default, Clone)]
pub struct KeyFieldRegistry {
    fields: Vec<Arc<dyn KeyField>>,
}

impl KeyFieldRegistry {
    pub fn new() -> Self {
        KeyFieldRegistry::default()
    }

    /// Registry holding the bundled rate fields.
    pub fn with_bundled() -> Self {
        let mut reg = KeyFieldRegistry::new();
        super::plugins::register_bundled(&mut reg);
        reg
    }

    /// Add a field. The first registration of a name wins.
    pub fn register(&mut self, field: Arc<dyn KeyField>) {
        if self.get(field.name()).is_some() {
            tracing::warn!("Ignoring duplicate key field '{}'", field.name());
            return;
        }
        self.fields.push(field);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn KeyField>> {
        self.fields
            .iter()
            .find(|f| f.name().eq_ignore_ascii_case(name))
            .cloned()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name())
    }
}

#[derive(Debug, Clone)]
pub enum KeyPart {
    Builtin(SortField),
    Plugin {
        field: Arc<dyn KeyField>,
        /// Offset of the value within the node.
        offset: usize,
    },
}

impl KeyPart {
    pub fn name(&self) -> &str {
        match self {
            KeyPart::Builtin(f) => f.name(),
            KeyPart::Plugin { field, .. } => field.name(),
        }
    }
}

/// Every name `--fields` accepts, for error messages and help.
pub fn available_fields(registry: &KeyFieldRegistry) -> String {
    let mut names: Vec<&str> = FIELD_NAMES.iter().map(|(_, n)| n[0]).collect();
    names.push(ICMP_TYPE_CODE);
    names.extend(registry.names());
    names.join(",")
}

/// The parsed key: ordered fields, node layout and direction.
#[derive(Debug, Clone)]
pub struct KeyDescriptor {
    parts: Vec<KeyPart>,
    node_size: usize,
    reverse: bool,
}

impl KeyDescriptor {
    /// Parse a comma-separated field list.
    pub fn parse(
        fields: &str,
        registry: &KeyFieldRegistry,
        reverse: bool,
    ) -> Result<KeyDescriptor, KeyError> {
        let names: Vec<&str> = fields
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect();
        if names.is_empty() {
            return Err(KeyError::Empty);
        }

        enum Named {
            Builtin(SortField),
            Plugin(Arc<dyn KeyField>),
            TypeCode,
        }

        let mut named: Vec<Named> = Vec::with_capacity(names.len());
        for name in names {
            let next = if name.eq_ignore_ascii_case(ICMP_TYPE_CODE) {
                Named::TypeCode
            } else if let Some(field) = SortField::lookup(name) {
                Named::Builtin(field)
            } else if let Some(field) = registry.get(name) {
                Named::Plugin(field)
            } else {
                return Err(KeyError::UnknownField {
                    name: name.to_string(),
                    available: available_fields(registry),
                });
            };
            let duplicate = named.iter().any(|seen| match (seen, &next) {
                (Named::Builtin(a), Named::Builtin(b)) => a == b,
                (Named::Plugin(a), Named::Plugin(b)) => a.name() == b.name(),
                (Named::TypeCode, Named::TypeCode) => true,
                _ => false,
            });
            if duplicate {
                let canonical = match &next {
                    Named::Builtin(f) => f.name().to_string(),
                    Named::Plugin(f) => f.name().to_string(),
                    Named::TypeCode => ICMP_TYPE_CODE.to_string(),
                };
                return Err(KeyError::Duplicate(canonical));
            }
            named.push(next);
        }

        let has = |want: SortField| {
            named
                .iter()
                .any(|n| matches!(n, Named::Builtin(f) if *f == want))
        };
        if named.iter().any(|n| matches!(n, Named::TypeCode))
            && (has(SortField::IcmpType) || has(SortField::IcmpCode))
        {
            return Err(KeyError::IcmpTypeCodeMix);
        }
        let plugin_count = named
            .iter()
            .filter(|n| matches!(n, Named::Plugin(_)))
            .count();
        if plugin_count > MAX_PLUGIN_KEY_FIELDS {
            return Err(KeyError::TooManyPlugins(plugin_count));
        }

        let mut parts = Vec::with_capacity(named.len() + 1);
        let mut offset = RECORD_LEN;
        for n in named {
            match n {
                Named::Builtin(field) => parts.push(KeyPart::Builtin(field)),
                Named::TypeCode => {
                    parts.push(KeyPart::Builtin(SortField::IcmpType));
                    parts.push(KeyPart::Builtin(SortField::IcmpCode));
                }
                Named::Plugin(field) => {
                    let width = field.width();
                    parts.push(KeyPart::Plugin { field, offset });
                    offset += width;
                }
            }
        }

        let node_size = (offset + 7) & !7;
        if node_size > MAX_NODE_SIZE {
            return Err(KeyError::NodeTooLarge(node_size));
        }
        Ok(KeyDescriptor {
            parts,
            node_size,
            reverse,
        })
    }

    /// Key over built-in fields only.
    pub fn builtin(fields: &[SortField], reverse: bool) -> KeyDescriptor {
        KeyDescriptor {
            parts: fields.iter().map(|f| KeyPart::Builtin(*f)).collect(),
            node_size: RECORD_LEN,
            reverse,
        }
    }

    pub fn parts(&self) -> &[KeyPart] {
        &self.parts
    }

    pub fn node_size(&self) -> usize {
        self.node_size
    }

    pub fn reverse(&self) -> bool {
        self.reverse
    }

    /// Whether nodes carry anything beyond the record.
    pub fn has_extension(&self) -> bool {
        self.node_size != RECORD_LEN
    }

    /// Encode `rec` and its plug-in values into `node`.
    pub fn fill_node(&self, rec: &FlowRecord, node: &mut [u8]) {
        let node = &mut node[..self.node_size];
        rec.encode_into(node);
        node[RECORD_LEN..].fill(0);
        for part in &self.parts {
            if let KeyPart::Plugin { field, offset } = part {
                field.extract(rec, &mut node[*offset..*offset + field.width()]);
            }
        }
    }

    /// Rebuild a node from an encoded record, as read from a presorted
    /// input.
    pub fn fill_node_from_encoded(&self, rec: &[u8], node: &mut [u8]) {
        if self.has_extension() {
            self.fill_node(&FlowRecord::decode(rec), node);
        } else {
            node[..RECORD_LEN].copy_from_slice(&rec[..RECORD_LEN]);
        }
    }

    /// Composite comparison of two nodes.
    pub fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        let va = RecordView::new(a);
        let vb = RecordView::new(b);
        for part in &self.parts {
            let ord = match part {
                KeyPart::Builtin(field) => field.compare(&va, &vb),
                KeyPart::Plugin { field, offset } => {
                    let end = offset + field.width();
                    field.compare(&a[*offset..end], &b[*offset..end])
                }
            };
            if ord != Ordering::Equal {
                return if self.reverse { ord.reverse() } else { ord };
            }
        }
        Ordering::Equal
    }

    pub fn field_names(&self) -> Vec<&str> {
        self.parts.iter().map(|p| p.name()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    fn rec(dip: &str, dport: u16) -> FlowRecord {
        FlowRecord {
            dip: dip.parse::<IpAddr>().unwrap(),
            dport,
            packets: 1,
            bytes: 40,
            ..FlowRecord::default()
        }
    }

    fn node(key: &KeyDescriptor, r: &FlowRecord) -> Vec<u8> {
        let mut n = vec![0u8; key.node_size()];
        key.fill_node(r, &mut n);
        n
    }

    #[test]
    fn parse_names_and_aliases() {
        let reg = KeyFieldRegistry::new();
        let key = KeyDescriptor::parse("dIP, 4 ,PROTOCOL", &reg, false).unwrap();
        assert_eq!(key.field_names(), vec!["dIP", "dPort", "protocol"]);
        assert_eq!(key.node_size(), RECORD_LEN);
    }

    #[test]
    fn duplicates_are_rejected() {
        let reg = KeyFieldRegistry::new();
        assert_eq!(
            KeyDescriptor::parse("sIP,1", &reg, false).unwrap_err(),
            KeyError::Duplicate("sIP".into())
        );
    }

    #[test]
    fn unknown_field_lists_choices() {
        let reg = KeyFieldRegistry::with_bundled();
        match KeyDescriptor::parse("sIP,bogus", &reg, false).unwrap_err() {
            KeyError::UnknownField { name, available } => {
                assert_eq!(name, "bogus");
                assert!(available.contains("dPort"));
                assert!(available.contains("bytes/packet"));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(KeyDescriptor::parse(" , ", &reg, false).unwrap_err(), KeyError::Empty);
    }

    #[test]
    fn icmp_type_code_expands_in_place() {
        let reg = KeyFieldRegistry::new();
        let key = KeyDescriptor::parse("sIP,icmpTypeCode,dIP", &reg, false).unwrap();
        assert_eq!(key.field_names(), vec!["sIP", "iType", "iCode", "dIP"]);
        assert_eq!(
            KeyDescriptor::parse("icmpTypeCode,iType", &reg, false).unwrap_err(),
            KeyError::IcmpTypeCodeMix
        );
    }

    #[test]
    fn plugin_fields_extend_the_node() {
        let reg = KeyFieldRegistry::with_bundled();
        let key = KeyDescriptor::parse("bytes/packet,sIP", &reg, false).unwrap();
        assert_eq!(key.node_size(), RECORD_LEN + 8);
        assert!(key.has_extension());
        match &key.parts()[0] {
            KeyPart::Plugin { offset, .. } => assert_eq!(*offset, RECORD_LEN),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn composite_order() {
        let key = KeyDescriptor::builtin(&[SortField::DestIp, SortField::DestPort], false);
        let a = node(&key, &rec("10.0.0.1", 80));
        let b = node(&key, &rec("10.0.0.1", 443));
        let c = node(&key, &rec("10.0.0.2", 22));
        assert_eq!(key.compare(&a, &b), Ordering::Less);
        assert_eq!(key.compare(&b, &c), Ordering::Less);
        assert_eq!(key.compare(&a, &a), Ordering::Equal);

        let rev = KeyDescriptor::builtin(&[SortField::DestIp, SortField::DestPort], true);
        assert_eq!(rev.compare(&a, &b), Ordering::Greater);
    }

    #[test]
    fn ipv4_sorts_inside_the_widened_space() {
        let key = KeyDescriptor::builtin(&[SortField::DestIp], false);
        let v4 = node(&key, &rec("255.255.255.255", 0));
        let v6 = node(&key, &rec("2001:db8::1", 0));
        let low6 = node(&key, &rec("::1", 0));
        assert_eq!(key.compare(&v4, &v6), Ordering::Less);
        assert_eq!(key.compare(&low6, &v4), Ordering::Less);
    }

    #[test]
    fn absent_sensor_sorts_last() {
        let key = KeyDescriptor::builtin(&[SortField::Sensor], false);
        let with = node(&key, &FlowRecord { sensor: Some(3), ..FlowRecord::default() });
        let without = node(&key, &FlowRecord::default());
        assert_eq!(key.compare(&with, &without), Ordering::Less);
    }

    #[test]
    fn icmp_fields_are_zero_for_other_protocols() {
        let key = KeyDescriptor::builtin(&[SortField::IcmpType], false);
        let tcp = node(&key, &FlowRecord { proto: 6, dport: 0x0800, ..FlowRecord::default() });
        let icmp = node(&key, &FlowRecord { proto: 1, dport: 0x0300, ..FlowRecord::default() });
        assert_eq!(key.compare(&tcp, &icmp), Ordering::Less);
    }
}
