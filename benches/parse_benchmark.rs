//! Benchmarks for filter validation throughput.
//!
//! Run with: cargo bench

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use k2filter::parse::{count_rules, write_filter};
use std::io::{self, Cursor};

/// Generate a filter list with `rules` rules and a comment every tenth line.
fn generate_filter(rules: usize) -> Vec<u8> {
    let mut data = String::from("! Title: Benchmark list\n! Expires: 1 day\n\n");
    for i in 0..rules {
        if i % 10 == 0 {
            data.push_str(&format!("# section {}\n", i / 10));
        }
        data.push_str(&format!("||ads{}.example.com^\n", i));
    }
    data.into_bytes()
}

fn bench_write_filter(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_filter");
    for rules in [1_000, 50_000, 500_000] {
        let data = generate_filter(rules);
        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rules), &data, |b, data| {
            b.iter(|| {
                let count = write_filter(Cursor::new(black_box(data)), io::sink()).unwrap();
                assert_eq!(count, rules as u64);
            })
        });
    }
    group.finish();
}

fn bench_count_rules(c: &mut Criterion) {
    let data = generate_filter(50_000);
    let mut group = c.benchmark_group("count_rules");
    group.throughput(Throughput::Bytes(data.len() as u64));
    group.bench_function("50000", |b| {
        b.iter(|| count_rules(Cursor::new(black_box(&data))).unwrap())
    });
    group.finish();
}

criterion_group!(benches, bench_write_filter, bench_count_rules);
criterion_main!(benches);
