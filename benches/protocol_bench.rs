//! Benchmarks for the protocol module.
//!
//! Run with: `cargo bench --bench protocol_bench`

use bytes::Bytes;
use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use pgwire_edge::lsn::Lsn;
use pgwire_edge::protocol::messages::parse_error_response;
use pgwire_edge::protocol::pgoutput;
use pgwire_edge::protocol::replication::{encode_standby_status_update, parse_copy_data};

/// Generate a realistic XLogData payload
fn make_xlogdata_payload(data_size: usize) -> Bytes {
    let mut v = Vec::with_capacity(1 + 24 + data_size);
    v.push(b'w');
    v.extend_from_slice(&0x0123456789ABCDEFu64.to_be_bytes()); // wal_start
    v.extend_from_slice(&0xFEDCBA9876543210u64.to_be_bytes()); // wal_end
    v.extend_from_slice(&1234567890i64.to_be_bytes()); // server_time
    v.extend_from_slice(&vec![0x42u8; data_size]); // payload
    Bytes::from(v)
}

/// Generate a KeepAlive payload
fn make_keepalive_payload() -> Bytes {
    let mut v = Vec::with_capacity(18);
    v.push(b'k');
    v.extend_from_slice(&100i64.to_be_bytes());
    v.extend_from_slice(&200i64.to_be_bytes());
    v.push(1);
    Bytes::from(v)
}

/// Generate a pgoutput Insert message with the given number of text columns
fn make_insert_message(ncols: usize) -> Bytes {
    let mut v = vec![b'I'];
    v.extend_from_slice(&16384u32.to_be_bytes());
    v.push(b'N');
    v.extend_from_slice(&(ncols as i16).to_be_bytes());
    for i in 0..ncols {
        let value = format!("value-{i}");
        v.push(b't');
        v.extend_from_slice(&(value.len() as i32).to_be_bytes());
        v.extend_from_slice(value.as_bytes());
    }
    Bytes::from(v)
}

/// Generate a pgoutput Relation message with the given number of columns
fn make_relation_message(ncols: usize) -> Bytes {
    let mut v = vec![b'R'];
    v.extend_from_slice(&16384u32.to_be_bytes());
    v.extend_from_slice(b"public\0");
    v.extend_from_slice(b"bench_table\0");
    v.push(b'd');
    v.extend_from_slice(&(ncols as i16).to_be_bytes());
    for i in 0..ncols {
        v.push(u8::from(i == 0));
        v.extend_from_slice(format!("col_{i}\0").as_bytes());
        v.extend_from_slice(&25u32.to_be_bytes());
        v.extend_from_slice(&(-1i32).to_be_bytes());
    }
    Bytes::from(v)
}

/// Generate a realistic error response payload
fn make_error_payload() -> Vec<u8> {
    let mut payload = Vec::new();
    payload.extend_from_slice(b"SERROR\0");
    payload.extend_from_slice(b"VFATAL\0");
    payload.extend_from_slice(b"C42P01\0");
    payload.extend_from_slice(b"Mrelation \"users\" does not exist\0");
    payload.extend_from_slice(b"Dtable was dropped in a previous migration\0");
    payload.push(0);
    payload
}

fn bench_copy_data(c: &mut Criterion) {
    let mut group = c.benchmark_group("copy_data");

    for size in [64usize, 1024, 16 * 1024] {
        let payload = make_xlogdata_payload(size);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::new("xlogdata", size), &payload, |b, p| {
            b.iter(|| parse_copy_data(black_box(p.clone())).unwrap());
        });
    }

    let keepalive = make_keepalive_payload();
    group.bench_function("keepalive", |b| {
        b.iter(|| parse_copy_data(black_box(keepalive.clone())).unwrap());
    });

    group.finish();
}

fn bench_pgoutput_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("pgoutput");

    for ncols in [2usize, 8, 32] {
        let insert = make_insert_message(ncols);
        group.bench_with_input(BenchmarkId::new("insert", ncols), &insert, |b, p| {
            b.iter(|| pgoutput::decode(black_box(p.clone())).unwrap());
        });

        let relation = make_relation_message(ncols);
        group.bench_with_input(BenchmarkId::new("relation", ncols), &relation, |b, p| {
            b.iter(|| pgoutput::decode(black_box(p.clone())).unwrap());
        });
    }

    group.finish();
}

fn bench_status_update(c: &mut Criterion) {
    c.bench_function("standby_status_update", |b| {
        b.iter(|| encode_standby_status_update(black_box(Lsn(0xDEADBEEF)), 123456789, false));
    });
}

fn bench_error_response(c: &mut Criterion) {
    let payload = make_error_payload();
    c.bench_function("parse_error_response", |b| {
        b.iter(|| parse_error_response(black_box(&payload)));
    });
}

criterion_group!(
    benches,
    bench_copy_data,
    bench_pgoutput_decode,
    bench_status_update,
    bench_error_response
);
criterion_main!(benches);
