//! A probe is one logical ingest point: a ring of raw PDUs fed by a
//! receiver, the validator guarding that ring, and the counters both
//! sides update.

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex};

use super::ring::{PduSlot, ProbeRing};
use super::validator::{Decision, PacketFilter, PduValidator};
use crate::protocol::v5::V5_PDU_LEN;

/// Per-probe diagnostic switches. All off by default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogFlags(u8);

impl LogFlags {
    pub const NONE: LogFlags = LogFlags(0);
    /// Per-record timestamp and reboot details at info level.
    pub const TIMESTAMPS: LogFlags = LogFlags(0x01);
    /// Out-of-sequence and missing-record details.
    pub const MISSING: LogFlags = LogFlags(0x02);
    /// Per-record rejection warnings.
    pub const BAD: LogFlags = LogFlags(0x04);

    pub fn contains(&self, other: LogFlags) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: LogFlags) {
        self.0 |= other.0;
    }

    /// Parse a list of flag names (`timestamps`, `missing`, `bad`, `none`).
    pub fn parse<S: AsRef<str>>(names: &[S]) -> Result<LogFlags, String> {
        let mut flags = LogFlags::NONE;
        for name in names {
            match name.as_ref().trim().to_ascii_lowercase().as_str() {
                "timestamps" => flags.insert(LogFlags::TIMESTAMPS),
                "missing" => flags.insert(LogFlags::MISSING),
                "bad" => flags.insert(LogFlags::BAD),
                "none" | "" => {}
                other => return Err(format!("unknown log flag '{}'", other)),
            }
        }
        Ok(flags)
    }
}

impl std::ops::BitOr for LogFlags {
    type Output = LogFlags;

    fn bitor(self, rhs: LogFlags) -> LogFlags {
        LogFlags(self.0 | rhs.0)
    }
}

/// Probe counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProbeStats {
    pub processed_pdus: u64,
    pub bad_pdus: u64,
    pub good_records: u64,
    pub bad_records: u64,
    pub missing_records: i64,
}

impl ProbeStats {
    pub fn good_pdus(&self) -> u64 {
        self.processed_pdus - self.bad_pdus
    }

    /// Every record accounted for so far, including missing ones.
    pub fn all_records(&self) -> u64 {
        self.good_records + self.bad_records + self.missing_records.max(0) as u64
    }

    /// Add another interval's counters to these.
    pub fn accumulate(&mut self, other: &ProbeStats) {
        self.processed_pdus += other.processed_pdus;
        self.bad_pdus += other.bad_pdus;
        self.good_records += other.good_records;
        self.bad_records += other.bad_records;
        self.missing_records += other.missing_records;
    }

    /// Adjust the missing count; late arrivals never push it below zero.
    pub fn adjust_missing(&mut self, delta: i64) {
        self.missing_records = (self.missing_records + delta).max(0);
    }
}

/// Runtime settings for a probe.
#[derive(Debug, Clone)]
pub struct ProbeOptions {
    pub name: String,
    pub log_flags: LogFlags,
    /// Number of PDU slots between receiver and processor.
    pub ring_capacity: usize,
    /// Size of one slot; datagrams longer than this are truncated.
    pub slot_size: usize,
    /// Stamped onto every record this probe emits.
    pub sensor: Option<u16>,
    pub flow_type: Option<u8>,
}

impl ProbeOptions {
    pub fn new(name: impl Into<String>) -> Self {
        ProbeOptions {
            name: name.into(),
            log_flags: LogFlags::NONE,
            ring_capacity: 4096,
            slot_size: V5_PDU_LEN,
            sensor: None,
            flow_type: None,
        }
    }
}

pub struct Probe {
    options: ProbeOptions,
    stats: Mutex<ProbeStats>,
    ring: ProbeRing,
    filter: Box<dyn PacketFilter>,
    /// Writer slot kept across rejected datagrams.
    pending: Mutex<Option<PduSlot>>,
}

impl fmt::Debug for Probe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Probe")
            .field("name", &self.options.name)
            .field("ring_capacity", &self.ring.capacity())
            .finish()
    }
}

impl Probe {
    /// A probe guarded by the NetFlow v5 validator.
    pub fn new(options: ProbeOptions) -> Arc<Probe> {
        let filter = Box::new(PduValidator::new(options.name.clone()));
        Probe::with_filter(options, filter)
    }

    pub fn with_filter(options: ProbeOptions, filter: Box<dyn PacketFilter>) -> Arc<Probe> {
        let ring = ProbeRing::new(options.slot_size, options.ring_capacity);
        Arc::new(Probe {
            options,
            stats: Mutex::new(ProbeStats::default()),
            ring,
            filter,
            pending: Mutex::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.options.name
    }

    pub fn options(&self) -> &ProbeOptions {
        &self.options
    }

    pub fn log_flags(&self) -> LogFlags {
        self.options.log_flags
    }

    pub fn ring(&self) -> &ProbeRing {
        &self.ring
    }

    pub fn filter(&self) -> &dyn PacketFilter {
        self.filter.as_ref()
    }

    /// Copy one datagram into the ring, validating it first.
    ///
    /// Blocks while the ring is full. Returns `false` once the ring no
    /// longer accepts data.
    pub fn deposit(&self, data: &[u8]) -> bool {
        let mut pending = self.pending.lock().unwrap();
        let mut slot = match pending.take() {
            Some(slot) => slot,
            None => match self.ring.writer_slot() {
                Some(slot) => slot,
                None => return false,
            },
        };
        slot.fill_from(data);

        let decision = self.filter.accept_or_reject(slot.as_bytes());
        {
            let mut stats = self.stats.lock().unwrap();
            stats.processed_pdus += 1;
            if decision == Decision::Reject {
                stats.bad_pdus += 1;
            }
        }

        match decision {
            Decision::Accept => self.ring.writer_commit(slot),
            Decision::Reject => *pending = Some(slot),
        }
        true
    }

    /// Stop both sides of the ring immediately.
    pub fn stop(&self) {
        // Release a receiver blocked in writer_slot before touching `pending`.
        self.ring.stop();
        if let Some(slot) = self.pending.lock().unwrap().take() {
            self.ring.writer_discard(slot);
        }
    }

    /// No more datagrams will arrive; let the consumer drain.
    pub fn finish(&self) {
        self.ring.finish();
        if let Some(slot) = self.pending.lock().unwrap().take() {
            self.ring.writer_discard(slot);
        }
    }

    pub fn stats(&self) -> ProbeStats {
        *self.stats.lock().unwrap()
    }

    /// Run `f` with the counters locked.
    pub fn update_stats<T>(&self, f: impl FnOnce(&mut ProbeStats) -> T) -> T {
        let mut stats = self.stats.lock().unwrap();
        f(&mut stats)
    }

    pub fn clear_stats(&self) {
        *self.stats.lock().unwrap() = ProbeStats::default();
    }

    pub fn log_stats(&self) {
        let stats = self.stats.lock().unwrap();
        tracing::info!("{}", format_stats(self.name(), &stats));
    }

    /// Log the counters, reset them and return what they held.
    pub fn log_stats_and_clear(&self) -> ProbeStats {
        let mut stats = self.stats.lock().unwrap();
        tracing::info!("{}", format_stats(self.name(), &stats));
        std::mem::take(&mut *stats)
    }
}

pub fn format_stats(name: &str, stats: &ProbeStats) -> String {
    format!(
        "'{}': Pkts {}/{}, Recs {}, MissRecs {}, BadRecs {}",
        name,
        stats.good_pdus(),
        stats.processed_pdus,
        stats.good_records,
        stats.missing_records,
        stats.bad_records
    )
}
