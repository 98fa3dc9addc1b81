//! Day file benchmarks
//!
//! Run with: cargo bench --package thoughtsig-storage

use chrono::NaiveDate;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::Rng;
use tempfile::TempDir;

use thoughtsig_core::{encode_entry, Entry};
use thoughtsig_storage::{IndexCache, Reader, Writer};

fn bench_day() -> NaiveDate {
    NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()
}

fn random_signature(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range(b'A'..=b'Z') as char).collect()
}

fn bench_writer_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("writer_append");

    for size in [256usize, 4096, 65536] {
        let entry = Entry::new("req", "call", random_signature(size), "", "model");
        let payload = encode_entry(&entry).unwrap();

        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &payload, |b, payload| {
            let dir = TempDir::new().unwrap();
            let writer = Writer::open(dir.path(), bench_day()).unwrap();
            let mut i = 0u64;
            b.iter(|| {
                i += 1;
                writer.write(&format!("req-{i}:call"), black_box(payload)).unwrap();
            });
        });
    }

    group.finish();
}

fn bench_reader_load(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let count = 10_000u64;
    {
        let writer = Writer::open(dir.path(), bench_day()).unwrap();
        for i in 0..count {
            let entry = Entry::new(format!("req-{i}"), "call", random_signature(512), "", "m");
            writer.write(&entry.key(), &encode_entry(&entry).unwrap()).unwrap();
        }
    }

    c.bench_function("reader_open_10k", |b| {
        b.iter(|| black_box(Reader::open(dir.path(), bench_day()).unwrap()))
    });

    let reader = Reader::open(dir.path(), bench_day()).unwrap();
    let mut rng = rand::thread_rng();
    c.bench_function("reader_load_random", |b| {
        b.iter(|| {
            let key = format!("req-{}:call", rng.gen_range(0..count));
            black_box(reader.load(&key).unwrap())
        })
    });
}

fn bench_index_cache(c: &mut Criterion) {
    let cache = IndexCache::new(50_000);
    let date = bench_day();
    for i in 0..50_000 {
        let entry = Entry::new(format!("req-{i}"), format!("call-{i}"), "sig", "", "m");
        cache.put(thoughtsig_core::EntryIndex::persisted(&entry, 50, date));
    }

    let mut rng = rand::thread_rng();
    c.bench_function("index_cache_get_by_tool_call", |b| {
        b.iter(|| {
            let id = format!("call-{}", rng.gen_range(0..50_000));
            black_box(cache.get_by_tool_call_id(&id))
        })
    });
}

criterion_group!(benches, bench_writer_append, bench_reader_load, bench_index_cache);
criterion_main!(benches);
