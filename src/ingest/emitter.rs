//! Consumer side of a probe: pulls PDUs off the ring and yields one flow
//! record at a time.

use std::sync::Arc;

use super::engine::EngineState;
use super::probe::Probe;
use super::processor::PduProcessor;
use super::ring::PduSlot;
use crate::protocol::v5::{V5Pdu, V5Record};
use crate::record::FlowRecord;
use crate::stream::{RecordSource, StreamError};

/// The PDU currently being walked.
struct Current {
    slot: PduSlot,
    engine: EngineState,
    next: usize,
    count: usize,
}

pub struct RecordEmitter {
    processor: PduProcessor,
    current: Option<Current>,
    done: bool,
}

impl RecordEmitter {
    pub fn new(probe: Arc<Probe>) -> Self {
        RecordEmitter {
            processor: PduProcessor::new(probe),
            current: None,
            done: false,
        }
    }

    pub fn probe(&self) -> &Arc<Probe> {
        self.processor.probe()
    }

    pub fn processor(&self) -> &PduProcessor {
        &self.processor
    }

    /// Next good record, blocking for data. `None` once the probe is
    /// stopped, or finished and drained.
    pub fn next_record(&mut self) -> Option<FlowRecord> {
        loop {
            if self.done {
                return None;
            }

            if let Some(cur) = self.current.as_mut() {
                while cur.next < cur.count {
                    let idx = cur.next;
                    cur.next += 1;
                    let Some(raw) = V5Record::at(cur.slot.as_bytes(), idx) else {
                        break;
                    };
                    if let Ok(rec) = self.processor.convert(&cur.engine, &raw) {
                        return Some(rec);
                    }
                }
            }
            if let Some(cur) = self.current.take() {
                self.processor.probe().ring().reader_release(cur.slot);
            }

            let probe = self.processor.probe().clone();
            let Some(slot) = probe.ring().reader_slot() else {
                probe.filter().flush();
                self.done = true;
                return None;
            };

            let started = match V5Pdu::parse(slot.as_bytes()) {
                Ok(pdu) => Some(
                    self.processor
                        .begin_pdu(&pdu)
                        .map(|engine| (engine, pdu.count())),
                ),
                Err(err) => {
                    tracing::debug!("'{}': Skipping unparsable PDU: {}", probe.name(), err);
                    None
                }
            };
            let Some(started) = started else {
                probe.ring().reader_release(slot);
                continue;
            };
            match started {
                Ok((engine, count)) => {
                    self.current = Some(Current {
                        slot,
                        engine,
                        next: 0,
                        count,
                    });
                }
                Err(err) => {
                    tracing::error!("'{}': {}; stopping probe", probe.name(), err);
                    probe.ring().reader_release(slot);
                    probe.stop();
                    self.done = true;
                    return None;
                }
            }
        }
    }
}

impl RecordSource for RecordEmitter {
    fn next_record(&mut self) -> Result<Option<FlowRecord>, StreamError> {
        Ok(RecordEmitter::next_record(self))
    }
}

impl Iterator for RecordEmitter {
    type Item = FlowRecord;

    fn next(&mut self) -> Option<FlowRecord> {
        RecordEmitter::next_record(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::probe::ProbeOptions;
    use crate::protocol::v5::{encode_pdu, HeaderFields, RecordFields};
    use std::thread;

    fn pdu(seq: u32, records: &[RecordFields]) -> Vec<u8> {
        let header = HeaderFields {
            sys_uptime: 100_000,
            unix_secs: 1_700_000_000,
            flow_sequence: seq,
            ..HeaderFields::default()
        };
        encode_pdu(&header, records)
    }

    fn record(sport: u16) -> RecordFields {
        RecordFields {
            src_port: sport,
            first: 90_000,
            last: 95_000,
            ..RecordFields::default()
        }
    }

    #[test]
    fn yields_records_in_arrival_order() {
        let probe = Probe::new(ProbeOptions::new("e"));
        probe.deposit(&pdu(0, &[record(1), record(2)]));
        probe.deposit(&pdu(2, &[record(3)]));
        probe.finish();

        let ports: Vec<u16> = RecordEmitter::new(probe.clone()).map(|r| r.sport).collect();
        assert_eq!(ports, vec![1, 2, 3]);
        assert_eq!(probe.stats().good_records, 3);
    }

    #[test]
    fn bad_records_are_skipped() {
        let probe = Probe::new(ProbeOptions::new("e"));
        let zero = RecordFields {
            packets: 0,
            ..record(9)
        };
        probe.deposit(&pdu(0, &[zero, record(4)]));
        probe.finish();

        let out: Vec<FlowRecord> = RecordEmitter::new(probe.clone()).collect();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].sport, 4);
        assert_eq!(probe.stats().bad_records, 1);
    }

    #[test]
    fn rejected_pdus_never_reach_the_consumer() {
        let probe = Probe::new(ProbeOptions::new("e"));
        let mut bad = pdu(0, &[record(1)]);
        bad[1] = 9;
        probe.deposit(&bad);
        probe.deposit(&pdu(0, &[record(2)]));
        probe.finish();
        let out: Vec<u16> = RecordEmitter::new(probe).map(|r| r.sport).collect();
        assert_eq!(out, vec![2]);
    }

    #[test]
    fn stop_ends_a_blocked_consumer() {
        let probe = Probe::new(ProbeOptions::new("e"));
        let consumer = {
            let probe = probe.clone();
            thread::spawn(move || RecordEmitter::new(probe).next_record())
        };
        thread::sleep(std::time::Duration::from_millis(20));
        probe.stop();
        assert!(consumer.join().unwrap().is_none());
    }

    #[test]
    fn producer_and_consumer_threads() {
        let mut opts = ProbeOptions::new("e");
        opts.ring_capacity = 2;
        let probe = Probe::new(opts);
        let producer = {
            let probe = probe.clone();
            thread::spawn(move || {
                for seq in 0..50u32 {
                    probe.deposit(&pdu(seq * 3, &[record(1), record(2), record(3)]));
                }
                probe.finish();
            })
        };
        let count = RecordEmitter::new(probe.clone()).count();
        producer.join().unwrap();
        assert_eq!(count, 150);
        assert_eq!(probe.stats().missing_records, 0);
    }
}
