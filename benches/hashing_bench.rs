//! Benchmarks for the hash multiplexer and the manifest codec

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use mantree::hashing;
use mantree::manifest::ManifestFile;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::hint::black_box;
use std::path::Path;

/// Single- and multi-algorithm hashing over growing payloads
fn bench_hash_multiplexer(c: &mut Criterion) {
    let mut group = c.benchmark_group("hash_multiplexer");
    let mut rng = StdRng::seed_from_u64(42);

    for size in [4 * 1024, 64 * 1024, 1024 * 1024] {
        let data: Vec<u8> = (0..size).map(|_| rng.random()).collect();
        group.throughput(Throughput::Bytes(size as u64));

        group.bench_with_input(BenchmarkId::new("sha256", size), &data, |b, data| {
            let names = vec!["SHA256".to_string()];
            b.iter(|| hashing::hash_reader(black_box(&data[..]), &names).unwrap());
        });
        group.bench_with_input(
            BenchmarkId::new("sha512_blake2b", size),
            &data,
            |b, data| {
                let names = vec!["SHA512".to_string(), "BLAKE2B".to_string()];
                b.iter(|| hashing::hash_reader(black_box(&data[..]), &names).unwrap());
            },
        );
    }
    group.finish();
}

/// Parse and dump a manifest of growing entry counts
fn bench_manifest_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("manifest_codec");

    for entries in [100, 1000] {
        let text: String = (0..entries)
            .map(|i| {
                format!(
                    "DATA dir{}/file{}.txt {} SHA256 \
                     5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03\n",
                    i % 10,
                    i,
                    i
                )
            })
            .collect();

        group.bench_with_input(BenchmarkId::new("parse", entries), &text, |b, text| {
            b.iter(|| ManifestFile::parse(black_box(text), Path::new("Manifest"), None).unwrap());
        });

        let manifest = ManifestFile::parse(&text, Path::new("Manifest"), None).unwrap();
        group.bench_with_input(BenchmarkId::new("dump", entries), &manifest, |b, manifest| {
            b.iter(|| black_box(manifest.dump()));
        });
    }
    group.finish();
}

criterion_group!(benches, bench_hash_multiplexer, bench_manifest_codec);
criterion_main!(benches);
