//! Action tracker: per-read chunk accounting and terminal-state gating.
//!
//! Owned by the pipeline driver (single writer). For every
//! (channel, read number) it keeps the cumulative chunk count and whether a
//! terminal action was already dispatched. At most one `unblock` and at
//! most one `stop_receiving` is ever emitted per read, and whichever is
//! issued first wins: once terminal, every later decision is suppressed,
//! including gate-derived unblocks. Entries are retained after the
//! instrument reports the read ended so late chunks can still be discarded,
//! and are garbage-collected by the periodic sweep.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use core_model::{Action, ActionCommand, Channel, ReadNumber};

/// Terminal dispatch state of one read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Terminal {
    #[default]
    None,
    StopReceivingSent,
    UnblockSent,
}

#[derive(Debug)]
struct ReadState {
    chunk_count: u32,
    terminal: Terminal,
    ended: bool,
    last_seen: Instant,
}

impl ReadState {
    fn new(now: Instant) -> Self {
        Self {
            chunk_count: 0,
            terminal: Terminal::None,
            ended: false,
            last_seen: now,
        }
    }
}

/// Counters for the run summary. Plain fields: the tracker has a single
/// owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackerSnapshot {
    pub tracked_reads: usize,
    pub unblocks_sent: u64,
    pub stop_receivings_sent: u64,
    pub suppressed: u64,
    pub swept: u64,
}

#[derive(Debug)]
pub struct ActionTracker {
    reads: HashMap<(Channel, ReadNumber), ReadState>,
    ttl: Duration,
    unblocks_sent: u64,
    stop_receivings_sent: u64,
    suppressed: u64,
    swept: u64,
}

impl ActionTracker {
    pub fn new(ttl: Duration) -> Self {
        Self {
            reads: HashMap::new(),
            ttl,
            unblocks_sent: 0,
            stop_receivings_sent: 0,
            suppressed: 0,
            swept: 0,
        }
    }

    /// Fold freshly drained chunks into the read's cumulative count and
    /// return the new total.
    pub fn note_chunks(
        &mut self,
        channel: Channel,
        read_number: ReadNumber,
        newly_seen: u32,
        now: Instant,
    ) -> u32 {
        let state = self
            .reads
            .entry((channel, read_number))
            .or_insert_with(|| ReadState::new(now));
        state.chunk_count = state.chunk_count.saturating_add(newly_seen);
        state.last_seen = now;
        state.chunk_count
    }

    pub fn chunk_count(&self, channel: Channel, read_number: ReadNumber) -> u32 {
        self.reads
            .get(&(channel, read_number))
            .map_or(0, |state| state.chunk_count)
    }

    /// Has a terminal action already been dispatched for this read?
    pub fn is_terminal(&self, channel: Channel, read_number: ReadNumber) -> bool {
        self.reads
            .get(&(channel, read_number))
            .is_some_and(|state| state.terminal != Terminal::None)
    }

    pub fn terminal_state(&self, channel: Channel, read_number: ReadNumber) -> Terminal {
        self.reads
            .get(&(channel, read_number))
            .map_or(Terminal::None, |state| state.terminal)
    }

    /// Turn a decision into a dispatchable command, or nothing. Idempotent:
    /// the first terminal action wins, repeats and later decisions for the
    /// same read are suppressed.
    pub fn record(
        &mut self,
        channel: Channel,
        read_number: ReadNumber,
        action: Action,
        unblock_duration: f64,
        now: Instant,
    ) -> Option<ActionCommand> {
        let state = self
            .reads
            .entry((channel, read_number))
            .or_insert_with(|| ReadState::new(now));
        state.last_seen = now;
        if state.terminal != Terminal::None {
            self.suppressed += 1;
            return None;
        }
        match action {
            Action::Proceed => None,
            Action::Unblock => {
                state.terminal = Terminal::UnblockSent;
                self.unblocks_sent += 1;
                Some(ActionCommand {
                    channel,
                    read_number,
                    action,
                    unblock_duration: Some(unblock_duration),
                })
            }
            Action::StopReceiving => {
                state.terminal = Terminal::StopReceivingSent;
                self.stop_receivings_sent += 1;
                Some(ActionCommand {
                    channel,
                    read_number,
                    action,
                    unblock_duration: None,
                })
            }
        }
    }

    /// Instrument said the read is over. The entry is kept (so a straggler
    /// chunk is still recognised and discarded) but becomes eligible for
    /// the next sweep.
    pub fn read_ended(&mut self, channel: Channel, read_number: ReadNumber) {
        if let Some(state) = self.reads.get_mut(&(channel, read_number)) {
            state.ended = true;
        }
    }

    /// Evict ended and stale entries. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let ttl = self.ttl;
        let before = self.reads.len();
        self.reads
            .retain(|_, state| !state.ended && now.duration_since(state.last_seen) < ttl);
        let removed = before - self.reads.len();
        self.swept += removed as u64;
        removed
    }

    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            tracked_reads: self.reads.len(),
            unblocks_sent: self.unblocks_sent,
            stop_receivings_sent: self.stop_receivings_sent,
            suppressed: self.suppressed,
            swept: self.swept,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> ActionTracker {
        ActionTracker::new(Duration::from_secs(60))
    }

    #[test]
    fn chunk_counts_accumulate_across_batches() {
        let mut tracker = tracker();
        let now = Instant::now();
        assert_eq!(tracker.note_chunks(1, 7, 2, now), 2);
        assert_eq!(tracker.note_chunks(1, 7, 1, now), 3);
        assert_eq!(tracker.chunk_count(1, 7), 3);
        // A different read on the same channel counts separately.
        assert_eq!(tracker.note_chunks(1, 8, 1, now), 1);
    }

    #[test]
    fn proceed_never_emits() {
        let mut tracker = tracker();
        let now = Instant::now();
        assert!(tracker.record(1, 7, Action::Proceed, 0.1, now).is_none());
        assert!(!tracker.is_terminal(1, 7));
    }

    #[test]
    fn unblock_emits_once_then_suppresses() {
        let mut tracker = tracker();
        let now = Instant::now();
        let command = tracker.record(1, 7, Action::Unblock, 0.1, now).unwrap();
        assert_eq!(command.action, Action::Unblock);
        assert_eq!(command.unblock_duration, Some(0.1));
        for _ in 0..3 {
            assert!(tracker.record(1, 7, Action::Unblock, 0.1, now).is_none());
        }
        assert_eq!(tracker.snapshot().unblocks_sent, 1);
        assert_eq!(tracker.snapshot().suppressed, 3);
    }

    // The first terminal action wins; the other kind is suppressed too.
    #[test]
    fn stop_receiving_blocks_later_unblock() {
        let mut tracker = tracker();
        let now = Instant::now();
        let command = tracker
            .record(1, 7, Action::StopReceiving, 0.1, now)
            .unwrap();
        assert_eq!(command.unblock_duration, None);
        assert!(tracker.record(1, 7, Action::Unblock, 0.1, now).is_none());
        assert_eq!(tracker.terminal_state(1, 7), Terminal::StopReceivingSent);
        let snap = tracker.snapshot();
        assert_eq!(snap.stop_receivings_sent, 1);
        assert_eq!(snap.unblocks_sent, 0);
    }

    #[test]
    fn reads_are_independent() {
        let mut tracker = tracker();
        let now = Instant::now();
        assert!(tracker.record(1, 7, Action::Unblock, 0.1, now).is_some());
        assert!(tracker.record(1, 8, Action::Unblock, 0.1, now).is_some());
        assert!(tracker.record(2, 7, Action::Unblock, 0.1, now).is_some());
        assert_eq!(tracker.snapshot().unblocks_sent, 3);
    }

    #[test]
    fn ended_reads_survive_until_sweep() {
        let mut tracker = tracker();
        let now = Instant::now();
        tracker.record(1, 7, Action::Unblock, 0.1, now);
        tracker.read_ended(1, 7);
        // Still terminal: a late chunk would be discarded, not re-analyzed.
        assert!(tracker.is_terminal(1, 7));
        assert_eq!(tracker.sweep(now), 1);
        assert!(!tracker.is_terminal(1, 7));
    }

    #[test]
    fn sweep_evicts_stale_entries_by_ttl() {
        let mut tracker = ActionTracker::new(Duration::from_millis(10));
        let start = Instant::now();
        tracker.note_chunks(1, 7, 1, start);
        tracker.note_chunks(2, 1, 1, start + Duration::from_millis(50));
        let removed = tracker.sweep(start + Duration::from_millis(55));
        assert_eq!(removed, 1);
        assert_eq!(tracker.chunk_count(1, 7), 0);
        assert_eq!(tracker.chunk_count(2, 1), 1);
        assert_eq!(tracker.snapshot().swept, 1);
    }
}
