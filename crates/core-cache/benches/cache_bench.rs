use criterion::{Criterion, criterion_group, criterion_main};

use core_cache::ChunkCache;
use core_model::ReadChunk;

fn chunk(channel: u32, read_number: u32) -> ReadChunk {
    ReadChunk {
        channel,
        read_number,
        read_id: format!("read-{channel}-{read_number}"),
        raw_signal: vec![0; 512],
        chunk_start_sample: 0,
        chunk_length: 4000,
        median_before: 220.0,
        median: 90.0,
    }
}

// A full flow cell's worth of inserts followed by one drain, the shape of a
// single driver iteration at steady state.
fn insert_drain_cycle(c: &mut Criterion) {
    c.bench_function("insert_drain_512_channels", |b| {
        let cache = ChunkCache::new();
        b.iter(|| {
            for channel in 1..=512u32 {
                cache.insert(chunk(channel, 1));
            }
            std::hint::black_box(cache.drain());
        });
    });
}

fn replacement_churn(c: &mut Criterion) {
    c.bench_function("replace_same_read_8x", |b| {
        let cache = ChunkCache::new();
        b.iter(|| {
            for _ in 0..8 {
                cache.insert(chunk(1, 1));
            }
            std::hint::black_box(cache.drain());
        });
    });
}

criterion_group!(benches, insert_drain_cycle, replacement_churn);
criterion_main!(benches);
