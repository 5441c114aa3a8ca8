use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

fn eviction_contention_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("eviction contention benchmark");
    group.sample_size(10);
    group.bench_function("4 touchers , 1 evictor", |b| {
        b.iter(|| eviction_benchmark_call(black_box(4)));
    });
    group.bench_function("8 touchers , 1 evictor", |b| {
        b.iter(|| eviction_benchmark_call(black_box(8)));
    });
    group.finish();

    let mut group = c.benchmark_group("touch throughput benchmark");
    group.sample_size(10);
    group.bench_function("8 threads", |b| {
        b.iter(|| touch_benchmark_call(black_box(8)));
    });
    group.bench_function("16 threads", |b| {
        b.iter(|| touch_benchmark_call(black_box(16)));
    });
    group.finish();
}

extern crate cachou;
use cachou::{Cache, CacheConfig, CoreId, IoQueue, PartConfig, PartId, Request};

use std::sync::Arc;
use std::thread;

const NUM_LINES: u32 = 4096;
const ROUNDS: u64 = 50;

fn populated_cache() -> Arc<Cache> {
    let config = CacheConfig {
        num_lines: NUM_LINES,
        num_cores: 2,
        ..CacheConfig::default()
    };
    let cache = Arc::new(Cache::try_new(config, vec![PartConfig::default()]).unwrap());
    cache.populate_freelist(NUM_LINES);

    // map the whole cache to core 0 so evictions always find victims
    let mut req = Request::new(
        CoreId(0),
        0,
        NUM_LINES as u64 - 1,
        PartId(0),
        Arc::new(IoQueue::new()),
    );
    req.lock_hash_range(cache.hash_locks());
    let got = cache.assign_lines(&mut req, PartId::FREELIST, NUM_LINES).unwrap();
    assert_eq!(got, NUM_LINES);
    req.unlock_lines(cache.line_locks());
    req.unlock_hash_range(cache.hash_locks());
    cache
}

fn eviction_benchmark_call(num_touch_threads: usize) {
    let cache = populated_cache();
    let mut threads = Vec::new();

    for t in 0..num_touch_threads {
        let cache = Arc::clone(&cache);
        let handle = thread::spawn(move || {
            let mut line = (t as u32 * 97) % NUM_LINES;
            for _ in 0..NUM_LINES as u64 {
                cache.touch(line);
                line = (line + 13) % NUM_LINES;
            }
        });
        threads.push(handle);
    }

    let cache_clone = Arc::clone(&cache);
    let handle = thread::spawn(move || {
        let queue = Arc::new(IoQueue::new());
        for round in 0..ROUNDS {
            let first = NUM_LINES as u64 + round * 32;
            let mut req = Request::new(
                CoreId(1),
                first,
                first + 31,
                PartId(0),
                Arc::clone(&queue),
            );
            req.lock_hash_range(cache_clone.hash_locks());
            let got = cache_clone.assign_lines(&mut req, PartId(0), 32).unwrap();
            req.unlock_lines(cache_clone.line_locks());
            req.unlock_hash_range(cache_clone.hash_locks());
            cache_clone.eviction_finished(got);
        }
    });
    threads.push(handle);

    for handle in threads {
        handle.join().unwrap();
    }
}

fn touch_benchmark_call(num_threads: usize) {
    let cache = populated_cache();
    let mut threads = Vec::new();

    for t in 0..num_threads {
        let cache = Arc::clone(&cache);
        let handle = thread::spawn(move || {
            let mut line = (t as u32 * 31) % NUM_LINES;
            for _ in 0..NUM_LINES as u64 {
                cache.touch(line);
                line = (line + 7) % NUM_LINES;
            }
        });
        threads.push(handle);
    }

    for handle in threads {
        handle.join().unwrap();
    }
}

criterion_group!(benches, eviction_contention_benchmark);
criterion_main!(benches);
