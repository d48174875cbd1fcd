//! NetFlow v5 ingest.
//!
//! Data flows receiver → probe ring → emitter:
//!
//! - A [`receiver::Receiver`] polls the sockets of one listen set and hands
//!   each datagram to the probe owning the sender ([`dispatch`]).
//! - [`probe::Probe::deposit`] validates the datagram ([`validator`]) and
//!   commits it to the probe's [`ring::ProbeRing`].
//! - A [`emitter::RecordEmitter`] on the consumer thread walks each PDU,
//!   tracks exporter engines ([`engine`]) and converts records
//!   ([`processor`]).
//!
//! [`registry::Registry`] decides which probes share a receiver, and
//! [`file`] replays captured PDU files through the same path.

pub mod dispatch;
pub mod emitter;
pub mod engine;
pub mod file;
pub mod probe;
pub mod processor;
pub mod receiver;
pub mod registry;
pub mod ring;
pub mod validator;

pub use emitter::RecordEmitter;
pub use probe::{format_stats, LogFlags, Probe, ProbeOptions, ProbeStats};
pub use registry::{ListenSpec, Registry, RegistryError, SocketBufferConfig};
