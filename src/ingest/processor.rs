//! Per-probe PDU processing: engine tracking, sequence accounting and
//! conversion of v5 records into canonical flow records.

use std::collections::TryReserveError;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use super::engine::{EngineState, EngineTable, SequenceCheck, ROLLOVER32};
use super::probe::{LogFlags, Probe};
use crate::protocol::v5::{V5Pdu, V5Record};
use crate::record::{FlowRecord, TcpState};

/// Largest plausible flow duration, and the window used to recognise
/// uptime counter rollover: 45 days in ms.
pub const MAX_FLOW_TIME_DEVIATION: i64 = 45 * 24 * 3600 * 1000;
const ONE_DAY_MS: i64 = 24 * 3600 * 1000;

#[derive(Debug)]
pub enum ProcessorError {
    EngineAlloc(TryReserveError),
}

impl fmt::Display for ProcessorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessorError::EngineAlloc(e) => {
                write!(f, "cannot allocate engine tracker entry: {}", e)
            }
        }
    }
}

impl std::error::Error for ProcessorError {}

impl From<TryReserveError> for ProcessorError {
    fn from(e: TryReserveError) -> Self {
        ProcessorError::EngineAlloc(e)
    }
}

/// Why a single v5 record was dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordReject {
    ZeroPacketsOrBytes,
    MorePacketsThanBytes,
    EndBeforeStart,
}

impl fmt::Display for RecordReject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordReject::ZeroPacketsOrBytes => {
                write!(f, "Netflow record has zero packets or bytes")
            }
            RecordReject::MorePacketsThanBytes => {
                write!(f, "Netflow record has more packets them bytes")
            }
            RecordReject::EndBeforeStart => {
                write!(f, "Netflow record has earlier end time than start time")
            }
        }
    }
}

/// Start time in epoch ms, plus which rollover (if any) was assumed.
fn start_time(engine: &EngineState, first: i64) -> (i64, &'static str) {
    let difference = engine.sys_uptime_ms as i64 - first;
    if difference > MAX_FLOW_TIME_DEVIATION {
        (engine.router_boot_ms + first + ROLLOVER32, ", assume First rollover")
    } else if difference < -MAX_FLOW_TIME_DEVIATION {
        (engine.router_boot_ms + first - ROLLOVER32, ", assume Uptime rollover")
    } else {
        (engine.router_boot_ms + first, "")
    }
}

pub struct PduProcessor {
    probe: Arc<Probe>,
    engines: EngineTable,
}

impl PduProcessor {
    pub fn new(probe: Arc<Probe>) -> Self {
        PduProcessor {
            probe,
            engines: EngineTable::new(),
        }
    }

    pub fn probe(&self) -> &Arc<Probe> {
        &self.probe
    }

    pub fn engines(&self) -> &EngineTable {
        &self.engines
    }

    fn name(&self) -> &str {
        self.probe.name()
    }

    /// Run a PDU header through the engine tracker and account for
    /// sequence gaps. Returns the engine state the records are converted
    /// against.
    pub fn begin_pdu(&mut self, pdu: &V5Pdu<'_>) -> Result<EngineState, ProcessorError> {
        let hdr = pdu.header();
        let tracked = self.engines.track(&hdr)?;
        let flags = self.probe.log_flags();
        let engine = tracked.engine;
        let name = self.probe.name();

        if tracked.created {
            tracing::trace!(
                "'{}': New engine {}; boot {}, uptime {}, sequence {}",
                name,
                engine,
                engine.router_boot_ms,
                engine.sys_uptime_ms,
                tracked.received
            );
        }

        if let Some((previous, current)) = tracked.reboot {
            if flags.contains(LogFlags::TIMESTAMPS) {
                tracing::info!(
                    "'{}': Router reboot for engine {}. Last time {}, Current time {}",
                    name,
                    engine,
                    previous,
                    current
                );
            } else {
                tracing::debug!(
                    "'{}': Router reboot for engine {}. Last time {}, Current time {}",
                    name,
                    engine,
                    previous,
                    current
                );
            }
        }

        if tracked.sequence == SequenceCheck::InSequence {
            return Ok(engine);
        }

        let count = hdr.count() as i64;
        let log_missing = flags.contains(LogFlags::MISSING);
        let raw = tracked.received as i64 - tracked.expected_before as i64;
        let difference = match tracked.sequence {
            SequenceCheck::Missing { gap, wrapped: true } => gap,
            SequenceCheck::Late { behind, wrapped: true } => -behind,
            _ => raw,
        };
        let oos = format!(
            "'{}': Out-of-sequence packet: expecting {}, received {}, difference {}, elapsed {:.3} sec, engine {};",
            name,
            tracked.expected_before,
            tracked.received,
            difference,
            tracked.elapsed_ms as f64 / 1000.0,
            engine
        );

        match tracked.sequence {
            SequenceCheck::InSequence => {}
            SequenceCheck::Missing { gap, wrapped } => {
                let stats = self.probe.update_stats(|s| {
                    s.adjust_missing(gap);
                    *s
                });
                if log_missing {
                    let all = stats.all_records().max(1);
                    let rollover = if wrapped {
                        format!(
                            " treating as missing packets during roll-over (difference without roll-over {});",
                            raw
                        )
                    } else {
                        String::new()
                    };
                    tracing::info!(
                        "{}{} adding to missing records {}/{} == {:.4}%",
                        oos,
                        rollover,
                        stats.missing_records,
                        all,
                        stats.missing_records as f64 / all as f64 * 100.0
                    );
                }
            }
            SequenceCheck::Late { wrapped, .. } => {
                self.probe.update_stats(|s| s.adjust_missing(-count));
                if log_missing {
                    if wrapped {
                        tracing::info!(
                            "{} treating {} flows as arriving late after roll-over (difference without roll-over {})",
                            oos,
                            count,
                            raw
                        );
                    } else {
                        tracing::info!("{} treating {} flows as arriving late", oos, count);
                    }
                }
            }
            SequenceCheck::Reset { .. } => {
                if log_missing {
                    tracing::info!(
                        "{} resetting sequence due to large difference; next expected packet {}",
                        oos,
                        engine.expected_sequence
                    );
                }
            }
        }
        Ok(engine)
    }

    /// Repair and convert one record, updating the good/bad counters.
    pub fn convert(
        &self,
        engine: &EngineState,
        rec: &V5Record<'_>,
    ) -> Result<FlowRecord, RecordReject> {
        match self.convert_inner(engine, rec) {
            Ok(flow) => {
                self.probe.update_stats(|s| s.good_records += 1);
                Ok(flow)
            }
            Err(reason) => {
                if self.probe.log_flags().contains(LogFlags::BAD) {
                    tracing::warn!("'{}': {}", self.name(), reason);
                }
                self.probe.update_stats(|s| s.bad_records += 1);
                Err(reason)
            }
        }
    }

    fn convert_inner(
        &self,
        engine: &EngineState,
        rec: &V5Record<'_>,
    ) -> Result<FlowRecord, RecordReject> {
        let packets = rec.packets();
        let bytes = rec.octets();
        if packets == 0 || bytes == 0 {
            return Err(RecordReject::ZeroPacketsOrBytes);
        }
        if packets > bytes {
            return Err(RecordReject::MorePacketsThanBytes);
        }

        let first = rec.first() as i64;
        let mut last = rec.last() as i64;
        let difference = last - first;
        if difference > MAX_FLOW_TIME_DEVIATION
            || (difference < 0 && difference > -MAX_FLOW_TIME_DEVIATION)
        {
            return Err(RecordReject::EndBeforeStart);
        }
        let rollover_last = if difference < 0 {
            last += ROLLOVER32;
            ", assume Last rollover"
        } else {
            ""
        };

        let (start_ms, rollover_first) = start_time(engine, first);
        let flags = self.probe.log_flags();
        let ahead = first - engine.sys_uptime_ms as i64;
        if rollover_first.is_empty() && ahead > ONE_DAY_MS {
            if flags.contains(LogFlags::TIMESTAMPS) {
                tracing::info!(
                    "'{}': Flow starts {} ms after exporter uptime {}; keeping boot-relative start",
                    self.name(),
                    ahead,
                    engine.sys_uptime_ms
                );
            } else {
                tracing::debug!(
                    "'{}': Flow starts {} ms after exporter uptime {}; keeping boot-relative start",
                    self.name(),
                    ahead,
                    engine.sys_uptime_ms
                );
            }
        }
        if flags.contains(LogFlags::TIMESTAMPS) {
            tracing::info!(
                "'{}': Router boot (ms)={}, Uptime={}, First={}, Last={}{}{}",
                self.name(),
                engine.router_boot_ms,
                engine.sys_uptime_ms,
                first,
                rec.last(),
                rollover_first,
                rollover_last
            );
        }

        let mut sport = rec.src_port();
        let mut dport = rec.dst_port();
        // Some exporters put ICMP type/code in the source port, byte-swapped.
        if rec.protocol() == 1 && dport == 0 && sport != 0 {
            dport = sport.swap_bytes();
            sport = 0;
        }

        let opts = self.probe.options();
        Ok(FlowRecord {
            start_time_ms: start_ms,
            elapsed_ms: (last - first) as u32,
            sport,
            dport,
            proto: rec.protocol(),
            flow_type: opts.flow_type,
            sensor: opts.sensor,
            flags: rec.tcp_flags(),
            init_flags: 0,
            rest_flags: 0,
            tcp_state: TcpState::NO_INFO,
            application: 0,
            memo: 0,
            input: rec.input(),
            output: rec.output(),
            packets,
            bytes,
            sip: IpAddr::V4(rec.src_addr()),
            dip: IpAddr::V4(rec.dst_addr()),
            nhip: IpAddr::V4(rec.next_hop()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::probe::ProbeOptions;
    use crate::protocol::v5::{encode_pdu, HeaderFields, RecordFields};
    use std::net::Ipv4Addr;

    const UNIX_SECS: u32 = 1_700_000_000;
    const UPTIME: u32 = 10_000_000;

    fn header(seq: u32) -> HeaderFields {
        HeaderFields {
            sys_uptime: UPTIME,
            unix_secs: UNIX_SECS,
            flow_sequence: seq,
            ..HeaderFields::default()
        }
    }

    fn good_record() -> RecordFields {
        RecordFields {
            src_addr: Ipv4Addr::new(10, 0, 0, 1),
            dst_addr: Ipv4Addr::new(10, 0, 0, 2),
            packets: 5,
            octets: 500,
            first: UPTIME - 5000,
            last: UPTIME - 1000,
            src_port: 1234,
            dst_port: 80,
            ..RecordFields::default()
        }
    }

    fn feed(proc: &mut PduProcessor, hdr: HeaderFields, records: &[RecordFields]) -> Vec<FlowRecord> {
        let data = encode_pdu(&hdr, records);
        let pdu = V5Pdu::parse(&data).unwrap();
        let engine = proc.begin_pdu(&pdu).unwrap();
        pdu.records()
            .filter_map(|r| proc.convert(&engine, &r).ok())
            .collect()
    }

    fn processor() -> PduProcessor {
        PduProcessor::new(Probe::new(ProbeOptions::new("test")))
    }

    fn expected_sequence(proc: &PduProcessor) -> u32 {
        proc.engines().current().unwrap().expected_sequence
    }

    #[test]
    fn in_sequence_pdus() {
        let mut proc = processor();
        feed(&mut proc, header(100), &[good_record(); 30]);
        feed(&mut proc, header(130), &[good_record(); 30]);
        let stats = proc.probe().stats();
        assert_eq!(stats.missing_records, 0);
        assert_eq!(stats.good_records, 60);
        assert_eq!(expected_sequence(&proc), 160);
    }

    #[test]
    fn dropped_pdu_counts_missing() {
        let mut proc = processor();
        feed(&mut proc, header(100), &[good_record(); 30]);
        feed(&mut proc, header(190), &[good_record(); 30]);
        let stats = proc.probe().stats();
        assert_eq!(stats.missing_records, 60);
        assert_eq!(stats.good_records, 60);
        assert_eq!(expected_sequence(&proc), 220);
    }

    #[test]
    fn late_arrival_repays_missing() {
        let mut proc = processor();
        feed(&mut proc, header(100), &[good_record(); 30]);
        feed(&mut proc, header(160), &[good_record(); 30]);
        assert_eq!(proc.probe().stats().missing_records, 30);
        feed(&mut proc, header(130), &[good_record(); 30]);
        assert_eq!(proc.probe().stats().missing_records, 0);
        assert_eq!(expected_sequence(&proc), 190);
    }

    #[test]
    fn sequence_wrap_stays_in_sequence() {
        let mut proc = processor();
        feed(&mut proc, header(u32::MAX - 9), &[good_record(); 30]);
        feed(&mut proc, header(20), &[good_record(); 30]);
        assert_eq!(proc.probe().stats().missing_records, 0);
        assert_eq!(expected_sequence(&proc), 50);
    }

    #[test]
    fn record_fields_and_times() {
        let mut proc = processor();
        let out = feed(&mut proc, header(1), &[good_record()]);
        let rec = &out[0];
        let boot = UNIX_SECS as i64 * 1000 - UPTIME as i64;
        assert_eq!(rec.start_time_ms, boot + (UPTIME - 5000) as i64);
        assert_eq!(rec.elapsed_ms, 4000);
        assert_eq!(rec.sip, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(rec.sport, 1234);
        assert_eq!(rec.packets, 5);
        assert_eq!(rec.sensor, None);
        assert_eq!(rec.tcp_state, TcpState::NO_INFO);
    }

    #[test]
    fn bad_records_are_counted() {
        let mut proc = processor();
        let zero = RecordFields {
            packets: 0,
            ..good_record()
        };
        let inverted = RecordFields {
            packets: 50,
            octets: 10,
            ..good_record()
        };
        let backwards = RecordFields {
            first: 5000,
            last: 4000,
            ..good_record()
        };
        let too_long = RecordFields {
            first: 0,
            last: (MAX_FLOW_TIME_DEVIATION + 1) as u32,
            ..good_record()
        };
        let out = feed(
            &mut proc,
            header(1),
            &[zero, good_record(), inverted, backwards, too_long],
        );
        assert_eq!(out.len(), 1);
        let stats = proc.probe().stats();
        assert_eq!(stats.good_records, 1);
        assert_eq!(stats.bad_records, 4);
    }

    #[test]
    fn last_rollover_keeps_exact_duration() {
        let mut proc = processor();
        let rec = RecordFields {
            first: u32::MAX - 999,
            last: 500,
            ..good_record()
        };
        let hdr = HeaderFields {
            sys_uptime: 600,
            ..header(1)
        };
        let out = feed(&mut proc, hdr, &[rec]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].elapsed_ms, 1500);
        // Uptime wrapped since First: start is before the current boot epoch.
        let boot = UNIX_SECS as i64 * 1000 - 600;
        assert_eq!(out[0].start_time_ms, boot + (u32::MAX - 999) as i64 - ROLLOVER32);
    }

    #[test]
    fn first_rollover_moves_start_forward() {
        let mut proc = processor();
        let uptime = u32::MAX - 100;
        let rec = RecordFields {
            first: 10,
            last: 20,
            ..good_record()
        };
        let hdr = HeaderFields {
            sys_uptime: uptime,
            ..header(1)
        };
        let out = feed(&mut proc, hdr, &[rec]);
        let boot = UNIX_SECS as i64 * 1000 - uptime as i64;
        assert_eq!(out[0].start_time_ms, boot + 10 + ROLLOVER32);
    }

    #[test]
    fn icmp_type_code_swapped_into_dport() {
        let mut proc = processor();
        let icmp = RecordFields {
            protocol: 1,
            src_port: 0x0308,
            dst_port: 0,
            ..good_record()
        };
        let out = feed(&mut proc, header(1), &[icmp]);
        assert_eq!(out[0].sport, 0);
        assert_eq!(out[0].dport, 0x0803);
        assert_eq!(out[0].icmp_type(), 8);
    }

    #[test]
    fn icmpv6_is_left_alone() {
        let mut proc = processor();
        let rec = RecordFields {
            protocol: 58,
            src_port: 0x0308,
            dst_port: 0,
            ..good_record()
        };
        let out = feed(&mut proc, header(1), &[rec]);
        assert_eq!(out[0].sport, 0x0308);
        assert_eq!(out[0].dport, 0);
    }

    #[test]
    fn probe_stamps_sensor_and_type() {
        let mut opts = ProbeOptions::new("s");
        opts.sensor = Some(7);
        opts.flow_type = Some(2);
        let mut proc = PduProcessor::new(Probe::new(opts));
        let out = feed(&mut proc, header(1), &[good_record()]);
        assert_eq!(out[0].sensor, Some(7));
        assert_eq!(out[0].flow_type, Some(2));
    }

    #[test]
    fn accounting_adds_up() {
        let mut proc = processor();
        let bad = RecordFields {
            octets: 0,
            ..good_record()
        };
        let mut records = vec![good_record(); 20];
        records.extend(vec![bad; 10]);
        let out = feed(&mut proc, header(1), &records);
        let stats = proc.probe().stats();
        assert_eq!(out.len() as u64 + stats.bad_records, 30);
    }
}
