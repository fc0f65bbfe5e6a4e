//! Bounded read-chunk cache.
//!
//! One pending entry per channel, holding the most recent chunk of the
//! in-progress read plus how many chunks of that read arrived since the
//! entry became pending. Capacity is therefore bounded by the channel count
//! regardless of instrument throughput.
//!
//! Policy on insert:
//! - same `(channel, read_number)` as the pending entry: the payload is
//!   replaced by the newer chunk and the counter increments; only the
//!   latest signal slice is ever analyzed, which keeps batch latency flat;
//! - different `read_number`: the pending entry is displaced (that read is
//!   abandoned for analysis) and the new chunk starts a fresh counter.
//!
//! The producer (instrument reader) and consumer (pipeline driver) share
//! the cache; a chunk racing a [`ChunkCache::drain`] lands either in that
//! batch or the next one, never both, never dropped.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};

use core_model::{Channel, ReadChunk};

/// The most recent chunk for one channel's in-progress read.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingRead {
    pub chunk: ReadChunk,
    /// Chunks of this read absorbed since the entry became pending
    /// (replacements included). The tracker accumulates these across drains.
    pub chunk_count: u32,
}

/// What an insert did to the channel's pending entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// No entry was pending on the channel.
    Fresh,
    /// Same read: payload replaced, counter bumped.
    Replaced,
    /// Different read: previous pending read abandoned.
    Displaced,
}

#[derive(Debug, Default)]
pub struct CacheMetrics {
    inserted: AtomicU64,
    replaced: AtomicU64,
    displaced: AtomicU64,
    drained_batches: AtomicU64,
    drained_chunks: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheMetricsSnapshot {
    pub inserted: u64,
    pub replaced: u64,
    pub displaced: u64,
    pub drained_batches: u64,
    pub drained_chunks: u64,
}

impl CacheMetrics {
    fn snapshot(&self) -> CacheMetricsSnapshot {
        CacheMetricsSnapshot {
            inserted: self.inserted.load(Relaxed),
            replaced: self.replaced.load(Relaxed),
            displaced: self.displaced.load(Relaxed),
            drained_batches: self.drained_batches.load(Relaxed),
            drained_chunks: self.drained_chunks.load(Relaxed),
        }
    }
}

#[derive(Debug, Default)]
pub struct ChunkCache {
    pending: Mutex<HashMap<Channel, PendingRead>>,
    metrics: CacheMetrics,
}

impl ChunkCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Absorb one chunk from the instrument.
    pub fn insert(&self, chunk: ReadChunk) -> InsertOutcome {
        self.metrics.inserted.fetch_add(1, Relaxed);
        let mut pending = self.lock();
        match pending.get_mut(&chunk.channel) {
            Some(entry) if entry.chunk.read_number == chunk.read_number => {
                entry.chunk = chunk;
                entry.chunk_count += 1;
                self.metrics.replaced.fetch_add(1, Relaxed);
                InsertOutcome::Replaced
            }
            Some(entry) => {
                *entry = PendingRead {
                    chunk,
                    chunk_count: 1,
                };
                self.metrics.displaced.fetch_add(1, Relaxed);
                InsertOutcome::Displaced
            }
            None => {
                pending.insert(
                    chunk.channel,
                    PendingRead {
                        chunk,
                        chunk_count: 1,
                    },
                );
                InsertOutcome::Fresh
            }
        }
    }

    /// Atomically remove and return every pending entry. Entries are
    /// ordered by channel so batches are reproducible in tests.
    pub fn drain(&self) -> Vec<PendingRead> {
        let drained = {
            let mut pending = self.lock();
            std::mem::take(&mut *pending)
        };
        let mut batch: Vec<PendingRead> = drained.into_values().collect();
        batch.sort_by_key(|entry| entry.chunk.channel);
        if !batch.is_empty() {
            self.metrics.drained_batches.fetch_add(1, Relaxed);
            self.metrics
                .drained_chunks
                .fetch_add(batch.len() as u64, Relaxed);
        }
        batch
    }

    /// Discard the channel's pending entry if it still belongs to the given
    /// read. Used when the instrument reports the read ended before the
    /// next drain; a newer read's entry is left alone.
    pub fn evict_read(&self, channel: Channel, read_number: u32) -> bool {
        let mut pending = self.lock();
        if pending
            .get(&channel)
            .is_some_and(|entry| entry.chunk.read_number == read_number)
        {
            pending.remove(&channel);
            true
        } else {
            false
        }
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn metrics_snapshot(&self) -> CacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Channel, PendingRead>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
