//! Bundled plug-in key fields: per-flow rates.
//!
//! Values are stored as big-endian `u64` fixed-point numbers with three
//! decimal places, so the default byte-wise comparison orders them.

use std::sync::Arc;

use super::key::{KeyField, KeyFieldRegistry};
use crate::record::FlowRecord;

const PRECISION: f64 = 1000.0;
/// Duration assumed for zero-length flows, in microseconds.
pub const ZERO_DURATION_MICROS: u64 = 400;

fn fixed_point(v: f64) -> u64 {
    ((v + 0.5 / PRECISION) * PRECISION) as u64
}

fn duration_micros(rec: &FlowRecord) -> u64 {
    if rec.elapsed_ms > 0 {
        rec.elapsed_ms as u64 * 1000
    } else {
        ZERO_DURATION_MICROS
    }
}

/// Bytes per packet.
#[derive(Debug, Default)]
pub struct BytesPerPacket;

impl KeyField for BytesPerPacket {
    fn name(&self) -> &str {
        "bytes/packet"
    }

    fn description(&self) -> &str {
        "Average number of bytes per packet"
    }

    fn width(&self) -> usize {
        8
    }

    fn extract(&self, rec: &FlowRecord, out: &mut [u8]) {
        let value = if rec.packets == 0 {
            0
        } else {
            fixed_point(rec.bytes as f64 / rec.packets as f64)
        };
        out[..8].copy_from_slice(&value.to_be_bytes());
    }
}

/// Bytes per second over the flow's duration.
#[derive(Debug, Default)]
pub struct BytesPerSecond;

impl KeyField for BytesPerSecond {
    fn name(&self) -> &str {
        "bytes/sec"
    }

    fn description(&self) -> &str {
        "Average number of bytes per second"
    }

    fn width(&self) -> usize {
        8
    }

    fn extract(&self, rec: &FlowRecord, out: &mut [u8]) {
        let rate = rec.bytes as f64 * 1e6 / duration_micros(rec) as f64;
        out[..8].copy_from_slice(&fixed_point(rate).to_be_bytes());
    }
}

pub fn register_bundled(registry: &mut KeyFieldRegistry) {
    registry.register(Arc::new(BytesPerPacket));
    registry.register(Arc::new(BytesPerSecond));
}
