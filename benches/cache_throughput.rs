//! Cache Throughput Benchmarks
//!
//! Key derivation, warm reads and writes under eviction pressure.
//!
//! Run with: `cargo bench --bench cache_throughput`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::time::Duration;

use file_reader_server::cache::{
    digest_bytes, CacheConfig, CacheKey, CacheManager, Namespace, ProcessingOptions,
};

fn payload(size: usize) -> Vec<u8> {
    (0..size).map(|i| (i % 251) as u8).collect()
}

fn key_for(i: usize) -> CacheKey {
    CacheKey::derive(
        &digest_bytes(format!("document-{i}").as_bytes()),
        "text",
        "1.0.0",
        "",
        &ProcessingOptions::default(),
    )
}

fn bench_key_derivation(c: &mut Criterion) {
    let mut group = c.benchmark_group("key_derivation");
    for size in [4 * 1024, 1024 * 1024] {
        let data = payload(size);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &data, |b, data| {
            b.iter(|| {
                let digest = digest_bytes(black_box(data));
                CacheKey::derive(&digest, "pdf", "1.2.0", "", &ProcessingOptions::default())
            })
        });
    }
    group.finish();
}

fn bench_get_put(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let dir = tempfile::TempDir::new().expect("temp dir");
    let cache = CacheManager::new(CacheConfig {
        root_dir: dir.path().to_path_buf(),
        total_size_bytes: 8 * 1024 * 1024,
        ..Default::default()
    });

    let value = payload(16 * 1024);
    runtime.block_on(async {
        for i in 0..64 {
            cache
                .put(Namespace::ParsedDocument, &key_for(i), &value)
                .await
                .expect("seed entry");
        }
    });

    let mut group = c.benchmark_group("cache");
    group.throughput(Throughput::Bytes(value.len() as u64));
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("warm_get", |b| {
        let mut i = 0usize;
        b.to_async(&runtime).iter(|| {
            i = (i + 1) % 64;
            let key = key_for(i);
            let cache = cache.clone();
            async move { black_box(cache.get(Namespace::ParsedDocument, &key).await) }
        })
    });

    // Namespace budget is ~4.8 MiB, so steady-state puts evict
    group.bench_function("put_with_eviction", |b| {
        let mut i = 1_000usize;
        b.to_async(&runtime).iter(|| {
            i += 1;
            let key = key_for(i);
            let cache = cache.clone();
            let value = value.clone();
            async move {
                cache
                    .put(Namespace::ParsedDocument, &key, &value)
                    .await
                    .expect("put")
            }
        })
    });

    group.finish();
}

criterion_group!(benches, bench_key_derivation, bench_get_put);
criterion_main!(benches);
