//! Pipeline driver: the batch loop plus its two I/O threads.
//!
//! One reader thread moves instrument events into the chunk cache and
//! forwards control notices; one dispatcher thread pushes action commands
//! back out in submission order; the driver thread runs
//! drain → basecall → align → decide → record → dispatch. The driver blocks
//! in exactly two places: pulling the plugins' lazy sequences, and the
//! short throttle sleep when the cache is empty.
//!
//! Cancellation (external signal, instrument leaving the sequencing phase,
//! unrecoverable plugin failure) always travels through [`PipelineDriver::run`],
//! which halts I/O, drains the cache and disconnects both plugins on every
//! exit path.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering::Relaxed};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

use core_cache::{ChunkCache, PendingRead};
use core_config::ConditionResolver;
use core_decision::ActionTracker;
use core_model::{Action, ActionCommand, Channel, ReadNumber};
use core_plugin::{Aligner, Caller};

use crate::stats::{BatchStats, RunSummary};
use crate::transport::{
    InstrumentConnector, InstrumentEvent, InstrumentSource, RunPhase, TransportError,
};
use crate::PipelineError;

const READER_POLL: Duration = Duration::from_millis(100);
const NOTE_POLL: Duration = Duration::from_millis(50);
const ACTION_QUEUE_CAP: usize = 64;
const SLOW_WARN_EVERY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverMode {
    /// Full decision pipeline.
    Targets,
    /// Diagnostic latency mode: unblock every chunk, plugins untouched.
    UnblockAll,
}

#[derive(Debug, Clone)]
pub struct DriverOptions {
    pub mode: DriverMode,
    /// Sleep when a drain comes back empty.
    pub throttle: Duration,
    /// Instrument chunk cadence; the per-batch latency budget.
    pub chunk_duration: Duration,
    /// Warn when this fraction of the rolling window is slow.
    pub slow_warn_fraction: f64,
    pub slow_window: usize,
    /// How long to wait for the instrument to enter the sequencing phase.
    pub startup_timeout: Duration,
    pub max_reconnects: u32,
    pub reconnect_backoff: Duration,
    pub sweep_interval: Duration,
    pub heartbeat_interval: Duration,
    /// Tracker entries idle longer than this are swept.
    pub tracker_ttl: Duration,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            mode: DriverMode::Targets,
            throttle: Duration::from_millis(100),
            chunk_duration: Duration::from_secs(1),
            slow_warn_fraction: 0.5,
            slow_window: 20,
            startup_timeout: Duration::from_secs(60),
            max_reconnects: 3,
            reconnect_backoff: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
            tracker_ttl: Duration::from_secs(300),
        }
    }
}

/// Control notices the reader forwards to the driver thread.
enum ReaderNote {
    ReadEnded(Channel, ReadNumber),
    Phase(RunPhase),
    Lost(TransportError),
}

enum NotesOutcome {
    Continue,
    LeftSequencing(RunPhase),
    Lost(TransportError),
}

/// One generation of I/O threads bound to one transport connection.
struct IoTasks {
    reader: Option<JoinHandle<()>>,
    dispatcher: Option<JoinHandle<()>>,
    notes_rx: Receiver<ReaderNote>,
    actions_tx: Option<Sender<Vec<ActionCommand>>>,
    stop: Arc<AtomicBool>,
}

impl IoTasks {
    fn send_actions(&self, actions: Vec<ActionCommand>) -> bool {
        match &self.actions_tx {
            Some(tx) => tx.send(actions).is_ok(),
            None => false,
        }
    }

    /// Stop both threads and join them. Idempotent.
    fn halt(&mut self) {
        self.stop.store(true, Relaxed);
        // Dropping the sender ends the dispatcher's receive loop.
        self.actions_tx = None;
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.dispatcher.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for IoTasks {
    fn drop(&mut self) {
        self.halt();
    }
}

pub struct PipelineDriver {
    connector: Box<dyn InstrumentConnector>,
    caller: Box<dyn Caller>,
    aligner: Box<dyn Aligner>,
    resolver: ConditionResolver,
    options: DriverOptions,
    cache: Arc<ChunkCache>,
    tracker: ActionTracker,
    stats: BatchStats,
    shutdown: Arc<AtomicBool>,
}

impl PipelineDriver {
    pub fn new(
        connector: Box<dyn InstrumentConnector>,
        caller: Box<dyn Caller>,
        aligner: Box<dyn Aligner>,
        resolver: ConditionResolver,
        options: DriverOptions,
    ) -> Self {
        let tracker = ActionTracker::new(options.tracker_ttl);
        let stats = BatchStats::new(options.slow_window);
        Self {
            connector,
            caller,
            aligner,
            resolver,
            options,
            cache: Arc::new(ChunkCache::new()),
            tracker,
            stats,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag checked once per loop iteration; set it from a signal handler
    /// or another thread to stop the run.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        self.shutdown.clone()
    }

    /// Run until cancellation, returning the final summary. Plugins are
    /// disconnected and the cache drained on every exit path.
    pub fn run(&mut self) -> Result<RunSummary, PipelineError> {
        let result = self.run_inner();
        self.teardown();
        result.map(|()| self.summary())
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary::assemble(
            &self.stats,
            self.tracker.snapshot(),
            self.cache.metrics_snapshot(),
        )
    }

    fn run_inner(&mut self) -> Result<(), PipelineError> {
        info!(
            target: "pipeline.driver",
            instrument = %self.connector.describe(),
            caller = %self.caller.describe(),
            aligner = %self.aligner.describe(),
            mode = ?self.options.mode,
            "pipeline_starting"
        );
        let mut io = self.connect_io()?;
        let result = self.drive(&mut io);
        io.halt();
        result
    }

    fn drive(&mut self, io: &mut IoTasks) -> Result<(), PipelineError> {
        if !self.await_sequencing(io)? {
            return Ok(());
        }
        self.run_loop(io)
    }

    /// Park until the instrument advertises the sequencing phase. Returns
    /// `false` when an external shutdown arrived first.
    fn await_sequencing(&mut self, io: &mut IoTasks) -> Result<bool, PipelineError> {
        info!(target: "pipeline.driver", "waiting_for_sequencing_phase");
        let deadline = Instant::now() + self.options.startup_timeout;
        loop {
            if self.shutdown.load(Relaxed) {
                info!(target: "pipeline.driver", "shutdown_before_sequencing");
                return Ok(false);
            }
            if Instant::now() >= deadline {
                return Err(PipelineError::StartupTimeout(self.options.startup_timeout));
            }
            match io.notes_rx.recv_timeout(NOTE_POLL) {
                Ok(ReaderNote::Phase(RunPhase::Sequencing)) => {
                    info!(target: "pipeline.driver", "sequencing_started");
                    return Ok(true);
                }
                Ok(ReaderNote::Phase(phase)) => {
                    debug!(target: "pipeline.driver", ?phase, "phase_before_sequencing");
                }
                Ok(ReaderNote::ReadEnded(channel, read_number)) => {
                    self.tracker.read_ended(channel, read_number);
                    self.cache.evict_read(channel, read_number);
                }
                Ok(ReaderNote::Lost(err)) => return Err(err.into()),
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(PipelineError::Transport(TransportError::Lost(
                        std::io::Error::other("instrument reader stopped"),
                    )));
                }
            }
        }
    }

    fn run_loop(&mut self, io: &mut IoTasks) -> Result<(), PipelineError> {
        let mut last_heartbeat = Instant::now();
        let mut last_sweep = Instant::now();
        let mut last_slow_warn: Option<Instant> = None;

        loop {
            if self.shutdown.load(Relaxed) {
                info!(target: "pipeline.driver", "shutdown_requested");
                return Ok(());
            }

            match self.drain_notes(io) {
                NotesOutcome::Continue => {}
                NotesOutcome::LeftSequencing(phase) => {
                    info!(target: "pipeline.driver", ?phase, "instrument_left_sequencing");
                    return Ok(());
                }
                NotesOutcome::Lost(err) => {
                    self.reconnect(io, err)?;
                    continue;
                }
            }

            let batch = self.cache.drain();
            if batch.is_empty() {
                std::thread::sleep(self.options.throttle);
            } else {
                let started = Instant::now();
                let batch_len = batch.len();
                let commands = match self.options.mode {
                    DriverMode::Targets => self.process_batch(batch)?,
                    DriverMode::UnblockAll => self.unblock_all_batch(batch),
                };
                let command_count = commands.len();
                if !commands.is_empty() && !io.send_actions(commands) {
                    warn!(
                        target: "pipeline.driver",
                        dropped = command_count,
                        "action dispatcher unavailable"
                    );
                }
                let elapsed = started.elapsed();
                let verdict =
                    self.stats
                        .record_batch(batch_len, elapsed, self.options.chunk_duration);
                debug!(
                    target: "pipeline.driver",
                    chunks = batch_len,
                    commands = command_count,
                    elapsed_ms = elapsed.as_secs_f64() * 1_000.0,
                    slow = verdict.slow,
                    "batch_complete"
                );
                if verdict.window_full
                    && verdict.window_fraction >= self.options.slow_warn_fraction
                    && last_slow_warn.is_none_or(|at| at.elapsed() >= SLOW_WARN_EVERY)
                {
                    warn!(
                        target: "pipeline.driver",
                        slow_fraction = verdict.window_fraction,
                        budget_ms = self.options.chunk_duration.as_secs_f64() * 1_000.0,
                        "batches running slower than the instrument chunk cadence"
                    );
                    last_slow_warn = Some(Instant::now());
                }
            }

            if last_sweep.elapsed() >= self.options.sweep_interval {
                let removed = self.tracker.sweep(Instant::now());
                if removed > 0 {
                    debug!(target: "pipeline.driver", removed, "tracker_sweep");
                }
                last_sweep = Instant::now();
            }
            if last_heartbeat.elapsed() >= self.options.heartbeat_interval {
                let tracker = self.tracker.snapshot();
                info!(
                    target: "pipeline.driver",
                    batches = self.stats.batches,
                    chunks = self.stats.chunks,
                    slow_batches = self.stats.slow_batches,
                    unblocks = tracker.unblocks_sent,
                    stop_receivings = tracker.stop_receivings_sent,
                    pending_channels = self.cache.len(),
                    "heartbeat"
                );
                last_heartbeat = Instant::now();
            }
        }
    }

    /// The full decision path for one drained batch.
    fn process_batch(
        &mut self,
        batch: Vec<PendingRead>,
    ) -> Result<Vec<ActionCommand>, PipelineError> {
        let now = Instant::now();
        let unblock_duration = self.resolver.experiment().unblock_duration;

        let mut chunks = Vec::with_capacity(batch.len());
        let mut dropped = 0u64;
        for entry in batch {
            let channel = entry.chunk.channel;
            let read_number = entry.chunk.read_number;
            // A read that already got its terminal action is done; late
            // chunks are discarded without analysis.
            if self.tracker.is_terminal(channel, read_number) {
                dropped += 1;
                continue;
            }
            self.tracker
                .note_chunks(channel, read_number, entry.chunk_count, now);
            chunks.push(entry.chunk);
        }
        if dropped > 0 {
            self.stats.note_dropped_terminal(dropped);
        }
        if chunks.is_empty() {
            return Ok(Vec::new());
        }

        let reads = self.caller.basecall(chunks)?;
        let reads = self.aligner.align(reads);

        let mut commands = Vec::new();
        for mut read in reads {
            let condition = self
                .resolver
                .condition_for(read.channel, read.barcode.as_deref());
            let chunk_count = self.tracker.chunk_count(read.channel, read.read_number);
            let outcome = core_decision::decide(&read, condition, chunk_count);
            read.decision = Some(outcome.decision);
            tracing::trace!(
                target: "pipeline.driver",
                channel = read.channel,
                read_number = read.read_number,
                decision = %outcome.decision,
                action = %outcome.action,
                condition = %condition.name,
                "read_decided"
            );
            if let Some(command) = self.tracker.record(
                read.channel,
                read.read_number,
                outcome.action,
                unblock_duration,
                now,
            ) {
                commands.push(command);
            }
        }
        Ok(commands)
    }

    /// Diagnostic mode: every chunk earns an unblock, still deduplicated
    /// through the tracker.
    fn unblock_all_batch(&mut self, batch: Vec<PendingRead>) -> Vec<ActionCommand> {
        let now = Instant::now();
        let unblock_duration = self.resolver.experiment().unblock_duration;
        batch
            .into_iter()
            .filter_map(|entry| {
                let channel = entry.chunk.channel;
                let read_number = entry.chunk.read_number;
                self.tracker
                    .note_chunks(channel, read_number, entry.chunk_count, now);
                self.tracker
                    .record(channel, read_number, Action::Unblock, unblock_duration, now)
            })
            .collect()
    }

    fn drain_notes(&mut self, io: &IoTasks) -> NotesOutcome {
        loop {
            match io.notes_rx.try_recv() {
                Ok(ReaderNote::ReadEnded(channel, read_number)) => {
                    self.tracker.read_ended(channel, read_number);
                    self.cache.evict_read(channel, read_number);
                }
                Ok(ReaderNote::Phase(RunPhase::Sequencing)) => {}
                Ok(ReaderNote::Phase(phase)) => return NotesOutcome::LeftSequencing(phase),
                Ok(ReaderNote::Lost(err)) => return NotesOutcome::Lost(err),
                Err(TryRecvError::Empty) => return NotesOutcome::Continue,
                Err(TryRecvError::Disconnected) => {
                    return NotesOutcome::Lost(TransportError::Lost(std::io::Error::other(
                        "instrument reader stopped",
                    )));
                }
            }
        }
    }

    fn reconnect(&mut self, io: &mut IoTasks, err: TransportError) -> Result<(), PipelineError> {
        warn!(
            target: "pipeline.transport",
            error = %err,
            "instrument stream lost"
        );
        io.halt();
        let mut last = err;
        for attempt in 1..=self.options.max_reconnects {
            std::thread::sleep(self.options.reconnect_backoff);
            match self.connect_io() {
                Ok(new_io) => {
                    info!(target: "pipeline.transport", attempt, "reconnected");
                    *io = new_io;
                    return Ok(());
                }
                Err(PipelineError::Transport(err)) => {
                    warn!(
                        target: "pipeline.transport",
                        attempt,
                        max = self.options.max_reconnects,
                        error = %err,
                        "reconnect_failed"
                    );
                    last = err;
                }
                Err(other) => return Err(other),
            }
        }
        Err(PipelineError::Transport(last))
    }

    fn connect_io(&self) -> Result<IoTasks, PipelineError> {
        let link = self.connector.connect().map_err(PipelineError::Transport)?;
        let stop = Arc::new(AtomicBool::new(false));
        let (notes_tx, notes_rx) = crossbeam_channel::unbounded();
        let (actions_tx, actions_rx) = crossbeam_channel::bounded(ACTION_QUEUE_CAP);
        let reader = spawn_reader(link.source, self.cache.clone(), notes_tx.clone(), stop.clone())?;
        let dispatcher = spawn_dispatcher(link.sink, actions_rx, notes_tx, stop.clone())?;
        Ok(IoTasks {
            reader: Some(reader),
            dispatcher: Some(dispatcher),
            notes_rx,
            actions_tx: Some(actions_tx),
            stop,
        })
    }

    fn teardown(&mut self) {
        let leftover = self.cache.drain().len();
        if leftover > 0 {
            debug!(target: "pipeline.driver", leftover, "cache_drained_at_shutdown");
        }
        self.caller.disconnect();
        self.aligner.disconnect();
        let summary = self.summary();
        info!(
            target: "pipeline.driver",
            batches = summary.batches,
            chunks = summary.chunks,
            slow_batches = summary.slow_batches,
            unblocks = summary.unblocks_sent,
            stop_receivings = summary.stop_receivings_sent,
            suppressed = summary.suppressed,
            "run_complete"
        );
    }
}

fn spawn_reader(
    mut source: Box<dyn InstrumentSource>,
    cache: Arc<ChunkCache>,
    notes_tx: Sender<ReaderNote>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, PipelineError> {
    std::thread::Builder::new()
        .name("instrument-reader".to_string())
        .spawn(move || {
            while !stop.load(Relaxed) {
                match source.recv(READER_POLL) {
                    Ok(Some(InstrumentEvent::Chunk(chunk))) => {
                        cache.insert(chunk);
                    }
                    Ok(Some(InstrumentEvent::ReadEnded {
                        channel,
                        read_number,
                    })) => {
                        if notes_tx
                            .send(ReaderNote::ReadEnded(channel, read_number))
                            .is_err()
                        {
                            break;
                        }
                    }
                    Ok(Some(InstrumentEvent::Phase(phase))) => {
                        if notes_tx.send(ReaderNote::Phase(phase)).is_err() {
                            break;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        let _ = notes_tx.send(ReaderNote::Lost(err));
                        break;
                    }
                }
            }
            debug!(target: "pipeline.transport", "reader_stopped");
        })
        .map_err(|err| PipelineError::Runtime(format!("failed to spawn reader thread: {err}")))
}

fn spawn_dispatcher(
    mut sink: Box<dyn crate::transport::ActionSink>,
    actions_rx: Receiver<Vec<ActionCommand>>,
    notes_tx: Sender<ReaderNote>,
    stop: Arc<AtomicBool>,
) -> Result<JoinHandle<()>, PipelineError> {
    std::thread::Builder::new()
        .name("action-dispatcher".to_string())
        .spawn(move || {
            for actions in actions_rx.iter() {
                if stop.load(Relaxed) {
                    break;
                }
                if let Err(err) = sink.send(actions) {
                    let _ = notes_tx.send(ReaderNote::Lost(err));
                    break;
                }
            }
            debug!(target: "pipeline.transport", "dispatcher_stopped");
        })
        .map_err(|err| {
            PipelineError::Runtime(format!("failed to spawn dispatcher thread: {err}"))
        })
}

/// Run both plugins' `validate` on a helper thread so a hung basecaller or
/// index load cannot wedge startup past the configured timeout.
pub fn validate_plugins_with_timeout(
    mut caller: Box<dyn Caller>,
    mut aligner: Box<dyn Aligner>,
    timeout: Duration,
) -> Result<(Box<dyn Caller>, Box<dyn Aligner>), PipelineError> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    std::thread::Builder::new()
        .name("plugin-validate".to_string())
        .spawn(move || {
            let result = caller.validate().and_then(|()| aligner.validate());
            let _ = tx.send((caller, aligner, result));
        })
        .map_err(|err| {
            PipelineError::Runtime(format!("failed to spawn validation thread: {err}"))
        })?;
    match rx.recv_timeout(timeout) {
        Ok((caller, aligner, Ok(()))) => Ok((caller, aligner)),
        Ok((_, _, Err(err))) => Err(err.into()),
        Err(_) => Err(PipelineError::ValidateTimeout(timeout)),
    }
}
