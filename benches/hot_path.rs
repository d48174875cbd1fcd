//! Criterion benchmarks for the flowpipe hot paths:
//! - `V5Pdu::parse` (PDU validation and record access)
//! - `PduProcessor::convert` (per-record repair and conversion)
//! - `KeyDescriptor::compare` (sort-key comparison)
//! - `NodeBuffer::sort` (in-core sort of a full buffer)

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::net::{IpAddr, Ipv4Addr};

use flowpipe::ingest::processor::PduProcessor;
use flowpipe::ingest::{Probe, ProbeOptions};
use flowpipe::protocol::v5::{encode_pdu, HeaderFields, RecordFields, V5Pdu, V5_MAX_RECORDS};
use flowpipe::record::{FlowRecord, RECORD_LEN};
use flowpipe::sort::key::{KeyDescriptor, KeyFieldRegistry, SortField};
use flowpipe::sort::node::NodeBuffer;

/// A full 30-record PDU with varied addresses and ports.
fn full_pdu(seq: u32) -> Vec<u8> {
    let header = HeaderFields {
        sys_uptime: 3_600_000,
        unix_secs: 1_700_000_000,
        flow_sequence: seq,
        ..HeaderFields::default()
    };
    let records: Vec<RecordFields> = (0..V5_MAX_RECORDS as u32)
        .map(|i| RecordFields {
            src_addr: Ipv4Addr::from(0x0a00_0000 + i),
            dst_addr: Ipv4Addr::from(0xc0a8_0000 + i * 7),
            packets: 10 + i,
            octets: 1500 * (10 + i),
            first: 3_500_000 + i * 100,
            last: 3_590_000 + i * 100,
            src_port: 40_000 + i as u16,
            dst_port: 443,
            tcp_flags: 0x1b,
            ..RecordFields::default()
        })
        .collect();
    encode_pdu(&header, &records)
}

fn random_records(n: usize) -> Vec<FlowRecord> {
    let mut rng = StdRng::seed_from_u64(7);
    (0..n)
        .map(|_| FlowRecord {
            sip: IpAddr::V4(Ipv4Addr::from(rng.random::<u32>())),
            dip: IpAddr::V4(Ipv4Addr::from(rng.random::<u32>())),
            sport: rng.random(),
            dport: rng.random(),
            proto: 6,
            packets: rng.random_range(1..1000),
            bytes: rng.random_range(40..1_500_000),
            ..FlowRecord::default()
        })
        .collect()
}

fn bench_parse_pdu(c: &mut Criterion) {
    let pdu = full_pdu(0);

    let mut group = c.benchmark_group("parse_pdu");
    group.throughput(Throughput::Elements(V5_MAX_RECORDS as u64));

    group.bench_function("v5_30_records", |b| {
        b.iter(|| {
            let parsed = V5Pdu::parse(black_box(&pdu)).unwrap();
            let mut octets = 0u64;
            for rec in parsed.records() {
                octets += rec.octets() as u64;
            }
            black_box(octets)
        })
    });

    group.finish();
}

fn bench_convert(c: &mut Criterion) {
    let pdu = full_pdu(0);
    let parsed = V5Pdu::parse(&pdu).unwrap();
    let mut processor = PduProcessor::new(Probe::new(ProbeOptions::new("bench")));
    let engine = processor.begin_pdu(&parsed).unwrap();

    let mut group = c.benchmark_group("convert");
    group.throughput(Throughput::Elements(V5_MAX_RECORDS as u64));

    group.bench_function("pdu_records", |b| {
        b.iter(|| {
            for rec in parsed.records() {
                black_box(processor.convert(&engine, &rec).ok());
            }
        })
    });

    group.finish();
}

fn bench_key_compare(c: &mut Criterion) {
    let records = random_records(2);
    let builtin = KeyDescriptor::builtin(&[SortField::DestIp, SortField::DestPort], false);
    let registry = KeyFieldRegistry::with_bundled();
    let plugin = KeyDescriptor::parse("bytes/packet,sIP", &registry, false).unwrap();

    let node = |key: &KeyDescriptor, rec: &FlowRecord| {
        let mut n = vec![0u8; key.node_size()];
        key.fill_node(rec, &mut n);
        n
    };
    let (a, b) = (node(&builtin, &records[0]), node(&builtin, &records[1]));
    let (pa, pb) = (node(&plugin, &records[0]), node(&plugin, &records[1]));

    let mut group = c.benchmark_group("key_compare");
    group.throughput(Throughput::Elements(1));

    group.bench_function("dip_dport", |bench| {
        bench.iter(|| black_box(builtin.compare(black_box(&a), black_box(&b))))
    });
    group.bench_function("rate_plugin_sip", |bench| {
        bench.iter(|| black_box(plugin.compare(black_box(&pa), black_box(&pb))))
    });

    group.finish();
}

fn bench_buffer_sort(c: &mut Criterion) {
    const N: usize = 100_000;
    let records = random_records(N);
    let key = KeyDescriptor::builtin(&[SortField::DestIp, SortField::DestPort], false);

    let mut group = c.benchmark_group("buffer_sort");
    group.throughput(Throughput::Elements(N as u64));
    group.sample_size(20);

    group.bench_function("100k_records", |b| {
        b.iter_batched(
            || {
                let mut buf = NodeBuffer::new(RECORD_LEN, RECORD_LEN * N).unwrap();
                for rec in &records {
                    if let Some(node) = buf.push() {
                        key.fill_node(rec, node);
                    }
                }
                buf
            },
            |mut buf| {
                buf.sort(&key);
                black_box(buf.sorted().count())
            },
            BatchSize::LargeInput,
        )
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_parse_pdu,
    bench_convert,
    bench_key_compare,
    bench_buffer_sort
);
criterion_main!(benches);
