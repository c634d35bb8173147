// Key cache performance benchmarks.
// Covers cold-miss I/O cost, warm-hit lookup cost, dirty-write eviction
// pressure and concurrent reader/writer throughput.

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rusty_blockcache::io::{FileId, MemoryIo};
use rusty_blockcache::keycache::{FlushType, KeyCache, KeyCacheConfig};

fn seeded_cache(block_size: usize, blocks: usize) -> (Arc<KeyCache<MemoryIo>>, Arc<MemoryIo>, FileId) {
    let io = Arc::new(MemoryIo::new());
    let file = FileId::next();
    io.seed(file, vec![0u8; block_size * blocks * 4]);
    let cache = KeyCache::init(
        io.clone(),
        KeyCacheConfig { block_size, memory_size: block_size * blocks, ..Default::default() },
    )
    .unwrap();
    (Arc::new(cache), io, file)
}

fn bench_cold_miss(c: &mut Criterion) {
    let mut group = c.benchmark_group("cold_miss");

    for block_size in [512usize, 4096, 16384] {
        group.bench_with_input(BenchmarkId::from_parameter(block_size), &block_size, |b, &block_size| {
            b.iter_batched(
                || seeded_cache(block_size, 64),
                |(cache, _io, file)| {
                    let mut buf = vec![0u8; block_size];
                    for i in 0..32u64 {
                        cache.read(file, i * block_size as u64, black_box(&mut buf)).unwrap();
                    }
                },
                criterion::BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

fn bench_warm_hit(c: &mut Criterion) {
    let (cache, _io, file) = seeded_cache(1024, 64);
    let mut buf = vec![0u8; 1024];
    cache.read(file, 0, &mut buf).unwrap();

    c.bench_function("warm_hit", |b| {
        b.iter(|| {
            cache.read(file, 0, black_box(&mut buf)).unwrap();
        });
    });
}

fn bench_dirty_write_eviction(c: &mut Criterion) {
    c.bench_function("dirty_write_eviction", |b| {
        b.iter_batched(
            || seeded_cache(1024, 16),
            |(cache, _io, file)| {
                // fills capacity, then keeps forcing eviction of the oldest warm block.
                for i in 0..64u64 {
                    cache.write(file, (i % 32) * 1024, black_box(&[i as u8; 1024]), true).unwrap();
                }
                cache.flush(file, FlushType::Keep).unwrap();
            },
            criterion::BatchSize::SmallInput,
        );
    });
}

fn bench_concurrent_readers(c: &mut Criterion) {
    let mut group = c.benchmark_group("concurrent_readers");

    for num_threads in [1usize, 2, 4, 8] {
        group.bench_with_input(BenchmarkId::from_parameter(num_threads), &num_threads, |b, &num_threads| {
            let (cache, _io, file) = seeded_cache(1024, 64);
            b.iter(|| {
                let handles: Vec<_> = (0..num_threads)
                    .map(|t| {
                        let cache = cache.clone();
                        std::thread::spawn(move || {
                            let mut buf = vec![0u8; 1024];
                            for i in 0..16u64 {
                                let pos = ((t as u64 * 16 + i) % 32) * 1024;
                                cache.read(file, pos, &mut buf).unwrap();
                            }
                        })
                    })
                    .collect();
                for h in handles {
                    h.join().unwrap();
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_cold_miss, bench_warm_hit, bench_dirty_write_eviction, bench_concurrent_readers);
criterion_main!(benches);
