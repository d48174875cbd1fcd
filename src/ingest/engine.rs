//! Per-exporter-engine state: expected flow sequence, inferred boot time,
//! last uptime and last export timestamp.
//!
//! Engines are keyed by `(engine_type << 8) | engine_id`. An entry is created
//! on first sight and lives as long as the probe's processor.

use ahash::AHashMap;
use std::collections::TryReserveError;
use std::fmt;

use crate::protocol::v5::V5Header;

/// Boot time drift tolerated before assuming the exporter rebooted.
pub const ROUTER_BOOT_FUZZ_MS: i64 = 1000;
/// Largest forward sequence jump still counted as lost records.
pub const MAX_SEQUENCE_DEVIATION: i64 = 1000 * 3600;
/// Largest backward sequence jump still counted as a late arrival.
pub const LATE_WINDOW: i64 = 1000 * 60;
pub const ROLLOVER32: i64 = 1 << 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineState {
    pub key: u16,
    pub expected_sequence: u32,
    /// Exporter boot time, ms since the UNIX epoch.
    pub router_boot_ms: i64,
    pub sys_uptime_ms: u32,
    pub last_timestamp_ms: i64,
}

impl EngineState {
    pub fn engine_type(&self) -> u8 {
        (self.key >> 8) as u8
    }

    pub fn engine_id(&self) -> u8 {
        (self.key & 0xff) as u8
    }
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.engine_type(), self.engine_id())
    }
}

/// How a PDU's flow sequence relates to what the engine expected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceCheck {
    InSequence,
    /// Records were lost; `gap` is added to the missing count.
    Missing { gap: i64, wrapped: bool },
    /// A PDU arrived after its successors; its records are no longer missing.
    Late { behind: i64, wrapped: bool },
    /// The jump is too large to explain; start counting afresh.
    Reset { difference: i64 },
}

/// Compare `received` against `expected` and return the verdict together
/// with the next expected sequence number.
pub fn reconcile(expected: u32, received: u32, count: u32) -> (SequenceCheck, u32) {
    let advance = received.wrapping_add(count);
    if received == expected {
        return (SequenceCheck::InSequence, advance);
    }

    if received > expected {
        let differ = (received - expected) as i64;
        if differ < MAX_SEQUENCE_DEVIATION {
            (SequenceCheck::Missing { gap: differ, wrapped: false }, advance)
        } else if differ > ROLLOVER32 - LATE_WINDOW {
            // expected already wrapped; this one is from before the wrap
            (SequenceCheck::Late { behind: ROLLOVER32 - differ, wrapped: true }, expected)
        } else {
            (SequenceCheck::Reset { difference: differ }, advance)
        }
    } else {
        let differ = (expected - received) as i64;
        if differ > ROLLOVER32 - MAX_SEQUENCE_DEVIATION {
            (
                SequenceCheck::Missing {
                    gap: ROLLOVER32 - differ,
                    wrapped: true,
                },
                advance,
            )
        } else if differ < LATE_WINDOW {
            (SequenceCheck::Late { behind: differ, wrapped: false }, expected)
        } else {
            (SequenceCheck::Reset { difference: -differ }, advance)
        }
    }
}

/// Result of running one PDU header through the tracker.
#[derive(Debug, Clone, Copy)]
pub struct Tracked {
    /// Engine state after the update.
    pub engine: EngineState,
    /// Sequence the engine expected before this PDU.
    pub expected_before: u32,
    pub received: u32,
    /// `(previous_boot_ms, current_boot_ms)` when a reboot was detected.
    pub reboot: Option<(i64, i64)>,
    pub created: bool,
    pub sequence: SequenceCheck,
    /// Export time minus the previous export time from this engine.
    pub elapsed_ms: i64,
}

#[derive(Debug, Default)]
pub struct EngineTable {
    engines: AHashMap<u16, EngineState>,
    /// Most recently used key; PDUs arrive in runs from the same engine.
    last_key: Option<u16>,
}

impl EngineTable {
    pub fn new() -> Self {
        EngineTable::default()
    }

    pub fn len(&self) -> usize {
        self.engines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }

    pub fn get(&self, key: u16) -> Option<&EngineState> {
        self.engines.get(&key)
    }

    /// Update the engine named in `hdr`: reboot detection, then sequence
    /// reconciliation. Fails only if a new entry cannot be allocated.
    pub fn track(&mut self, hdr: &V5Header<'_>) -> Result<Tracked, TryReserveError> {
        let key = hdr.engine_key();
        let count = hdr.count() as u32;
        let received = hdr.flow_sequence();
        let now_ms = hdr.export_time_ms();
        let sys_uptime = hdr.sys_uptime();
        let router_boot = now_ms - sys_uptime as i64;

        let created = !self.engines.contains_key(&key);
        if created {
            self.engines.try_reserve(1)?;
        }
        self.last_key = Some(key);
        let engine = self.engines.entry(key).or_insert(EngineState {
            key,
            expected_sequence: received,
            router_boot_ms: router_boot,
            sys_uptime_ms: sys_uptime,
            last_timestamp_ms: now_ms,
        });

        let mut reboot = None;
        if (router_boot - engine.router_boot_ms).abs() > ROUTER_BOOT_FUZZ_MS {
            reboot = Some((engine.router_boot_ms, router_boot));
            engine.expected_sequence = received;
        }
        engine.router_boot_ms = router_boot;
        engine.sys_uptime_ms = sys_uptime;

        let expected_before = engine.expected_sequence;
        let (sequence, next) = reconcile(expected_before, received, count);
        engine.expected_sequence = next;

        let elapsed_ms = now_ms - engine.last_timestamp_ms;
        engine.last_timestamp_ms = now_ms;

        Ok(Tracked {
            engine: *engine,
            expected_before,
            received,
            reboot,
            created,
            sequence,
            elapsed_ms,
        })
    }

    /// The engine used by the most recent PDU.
    pub fn current(&self) -> Option<&EngineState> {
        self.last_key.and_then(|key| self.engines.get(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::v5::{encode_pdu, HeaderFields, RecordFields, V5Pdu};

    fn pdu(seq: u32, count: usize, unix_secs: u32, uptime: u32) -> Vec<u8> {
        let header = HeaderFields {
            sys_uptime: uptime,
            unix_secs,
            flow_sequence: seq,
            engine_type: 2,
            engine_id: 5,
            ..HeaderFields::default()
        };
        encode_pdu(&header, &vec![RecordFields::default(); count])
    }

    fn track(table: &mut EngineTable, data: &[u8]) -> Tracked {
        let pdu = V5Pdu::parse(data).unwrap();
        table.track(&pdu.header()).unwrap()
    }

    #[test]
    fn in_sequence_advances() {
        assert_eq!(reconcile(100, 100, 30), (SequenceCheck::InSequence, 130));
    }

    #[test]
    fn forward_gap_is_missing() {
        assert_eq!(
            reconcile(130, 190, 30),
            (SequenceCheck::Missing { gap: 60, wrapped: false }, 220)
        );
    }

    #[test]
    fn small_backward_jump_is_late() {
        assert_eq!(
            reconcile(190, 130, 30),
            (SequenceCheck::Late { behind: 60, wrapped: false }, 190)
        );
    }

    #[test]
    fn missing_across_wrap() {
        let expected = u32::MAX - 9;
        let (check, next) = reconcile(expected, 40, 30);
        assert_eq!(check, SequenceCheck::Missing { gap: 50, wrapped: true });
        assert_eq!(next, 70);
    }

    #[test]
    fn late_across_wrap() {
        let (check, next) = reconcile(20, u32::MAX - 9, 30);
        assert_eq!(check, SequenceCheck::Late { behind: 30, wrapped: true });
        assert_eq!(next, 20);
    }

    #[test]
    fn huge_jump_resets() {
        let (check, next) = reconcile(100, 100 + 5_000_000, 30);
        assert_eq!(check, SequenceCheck::Reset { difference: 5_000_000 });
        assert_eq!(next, 5_000_130);
        let (check, _) = reconcile(5_000_000, 100, 30);
        assert_eq!(check, SequenceCheck::Reset { difference: -4_999_900 });
    }

    #[test]
    fn first_pdu_creates_engine() {
        let mut table = EngineTable::new();
        let t = track(&mut table, &pdu(100, 30, 1_700_000_000, 60_000));
        assert!(t.created);
        assert_eq!(t.sequence, SequenceCheck::InSequence);
        assert_eq!(t.engine.expected_sequence, 130);
        assert_eq!(t.engine.router_boot_ms, 1_700_000_000_000 - 60_000);
        assert_eq!(t.engine.to_string(), "2.5");
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn wrap_is_in_sequence() {
        let mut table = EngineTable::new();
        track(&mut table, &pdu(u32::MAX - 9, 30, 1_700_000_000, 60_000));
        let t = track(&mut table, &pdu(20, 30, 1_700_000_001, 61_000));
        assert_eq!(t.sequence, SequenceCheck::InSequence);
        assert_eq!(t.engine.expected_sequence, 50);
        assert_eq!(t.elapsed_ms, 1000);
    }

    #[test]
    fn reboot_resets_expected_sequence() {
        let mut table = EngineTable::new();
        track(&mut table, &pdu(5000, 30, 1_700_000_000, 600_000));
        // Uptime went back to 2s while wall clock moved 1s: boot jumped ~599s.
        let t = track(&mut table, &pdu(7, 30, 1_700_000_001, 2_000));
        assert!(t.reboot.is_some());
        assert_eq!(t.sequence, SequenceCheck::InSequence);
        assert_eq!(t.expected_before, 7);
        assert_eq!(t.engine.expected_sequence, 37);
    }

    #[test]
    fn small_boot_drift_is_not_a_reboot() {
        let mut table = EngineTable::new();
        track(&mut table, &pdu(0, 1, 1_700_000_000, 10_000));
        let t = track(&mut table, &pdu(1, 1, 1_700_000_001, 10_500));
        assert!(t.reboot.is_none());
    }

    #[test]
    fn engines_are_independent() {
        let mut table = EngineTable::new();
        track(&mut table, &pdu(100, 30, 1_700_000_000, 60_000));
        let mut other = pdu(9000, 30, 1_700_000_000, 60_000);
        other[21] = 6;
        let t = track(&mut table, &other);
        assert!(t.created);
        assert_eq!(table.len(), 2);
        assert_eq!(table.current().map(|e| e.key), Some(0x0206));
        assert_eq!(table.get(0x0205).unwrap().expected_sequence, 130);
    }
}
