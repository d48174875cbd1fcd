//! Inline PDU validation with run-length coalesced logging.
//!
//! The receiver asks a [`PacketFilter`] about every datagram before it is
//! committed to a probe's ring. The v5 implementation, [`PduValidator`],
//! classifies the datagram and logs only on transitions between reasons:
//! the first bad PDU of a run is logged immediately, the rest of the run is
//! counted and summarised when the run ends.

use std::sync::Mutex;

use crate::protocol::v5::{PduError, V5Pdu};

/// Outcome of inspecting one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Accept,
    Reject,
}

/// Decides whether a raw datagram is committed to a probe's ring.
pub trait PacketFilter: Send + Sync {
    fn accept_or_reject(&self, data: &[u8]) -> Decision;

    /// Called once the datagram stream has ended.
    fn flush(&self) {}
}

/// Classification of a datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PduStatus {
    Ok,
    BadVersion,
    ZeroRecords,
    TooManyRecords,
    TruncatedHeader,
    TruncatedData,
}

impl PduStatus {
    pub fn classify(data: &[u8]) -> PduStatus {
        match V5Pdu::parse(data) {
            Ok(_) => PduStatus::Ok,
            Err(err) => err.into(),
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            PduStatus::Ok => "No Error",
            PduStatus::BadVersion => "not marked as version 5",
            PduStatus::ZeroRecords => "reporting zero records",
            PduStatus::TooManyRecords => "reporting more than 30 records",
            PduStatus::TruncatedHeader => "due to truncated header",
            PduStatus::TruncatedData => "due to truncated data section",
        }
    }
}

impl From<PduError> for PduStatus {
    fn from(err: PduError) -> Self {
        match err {
            PduError::TruncatedHeader => PduStatus::TruncatedHeader,
            PduError::BadVersion(_) => PduStatus::BadVersion,
            PduError::ZeroRecords => PduStatus::ZeroRecords,
            PduError::TooManyRecords(_) => PduStatus::TooManyRecords,
            PduError::TruncatedData { .. } => PduStatus::TruncatedData,
        }
    }
}

/// A log line produced by a run transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunMessage {
    /// First PDU of a new bad run.
    Started(String),
    /// Summary of the PDUs after the first one in a finished run.
    Ended(String),
}

/// Tracks the current bad-PDU reason and how many more PDUs shared it.
#[derive(Debug)]
pub struct BadRunTracker {
    status: PduStatus,
    consecutive: u32,
}

impl Default for BadRunTracker {
    fn default() -> Self {
        BadRunTracker {
            status: PduStatus::Ok,
            consecutive: 0,
        }
    }
}

impl BadRunTracker {
    pub fn status(&self) -> PduStatus {
        self.status
    }

    /// Feed the status of the next datagram; returns the lines to log.
    pub fn observe(&mut self, name: &str, status: PduStatus) -> Vec<RunMessage> {
        if status == self.status {
            if status != PduStatus::Ok {
                self.consecutive += 1;
            }
            return Vec::new();
        }

        let mut out = Vec::new();
        if let Some(msg) = self.summary(name) {
            out.push(msg);
        }
        self.status = status;
        self.consecutive = 0;
        if status != PduStatus::Ok {
            out.push(RunMessage::Started(format!(
                "'{}': Rejected PDU record {}",
                name,
                status.reason()
            )));
        }
        out
    }

    /// Close any open run; used at end of stream.
    pub fn flush(&mut self, name: &str) -> Option<RunMessage> {
        let msg = self.summary(name);
        self.status = PduStatus::Ok;
        self.consecutive = 0;
        msg
    }

    fn summary(&self, name: &str) -> Option<RunMessage> {
        if self.status == PduStatus::Ok || self.consecutive == 0 {
            return None;
        }
        Some(RunMessage::Ended(format!(
            "'{}': Rejected {} additional PDU record{} {}",
            name,
            self.consecutive,
            if self.consecutive == 1 { "" } else { "s" },
            self.status.reason()
        )))
    }
}

fn emit(messages: impl IntoIterator<Item = RunMessage>) {
    for msg in messages {
        match msg {
            RunMessage::Started(line) => tracing::info!("{}", line),
            RunMessage::Ended(line) => tracing::warn!("{}", line),
        }
    }
}

/// NetFlow v5 datagram validator for one probe.
pub struct PduValidator {
    name: String,
    run: Mutex<BadRunTracker>,
}

impl PduValidator {
    pub fn new(name: impl Into<String>) -> Self {
        PduValidator {
            name: name.into(),
            run: Mutex::new(BadRunTracker::default()),
        }
    }
}

impl PacketFilter for PduValidator {
    fn accept_or_reject(&self, data: &[u8]) -> Decision {
        let status = PduStatus::classify(data);
        let messages = self.run.lock().unwrap().observe(&self.name, status);
        emit(messages);
        if status == PduStatus::Ok {
            Decision::Accept
        } else {
            Decision::Reject
        }
    }

    fn flush(&self) {
        let msg = self.run.lock().unwrap().flush(&self.name);
        emit(msg);
    }
}
