//! Shared helpers for pipeline integration tests: scripted caller/aligner
//! doubles and a loopback-driven harness around the driver.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread::JoinHandle;
use std::time::Duration;

use core_config::{ConditionResolver, Experiment, ExperimentFile};
use core_model::{ActionCommand, Alignment, BasecalledRead, FlowcellLayout, ReadChunk, Strand};
use core_pipeline::{
    DriverMode, DriverOptions, InstrumentEvent, LoopbackHandle, PipelineDriver, PipelineError,
    RunPhase, RunSummary, loopback,
};
use core_plugin::{Aligner, Caller, PluginError, ReadStream};

pub fn chunk(channel: u32, read_number: u32) -> ReadChunk {
    ReadChunk {
        channel,
        read_number,
        read_id: format!("read-{channel}-{read_number}"),
        raw_signal: vec![0; 32],
        chunk_start_sample: 0,
        chunk_length: 4000,
        median_before: 220.0,
        median: 90.0,
    }
}

pub fn aln(contig: &str, strand: Strand, r_st: u64, r_en: u64) -> Alignment {
    Alignment {
        contig: contig.to_string(),
        strand,
        r_st,
        r_en,
        mapq: 60,
    }
}

/// What the scripted caller should say for one read.
#[derive(Debug, Clone, Default)]
pub struct ScriptedRead {
    pub sequence: String,
    pub barcode: Option<String>,
}

impl ScriptedRead {
    pub fn with_sequence() -> Self {
        Self {
            sequence: "ACGTACGTACGT".to_string(),
            barcode: None,
        }
    }

    pub fn with_barcode(barcode: &str) -> Self {
        Self {
            sequence: "ACGTACGTACGT".to_string(),
            barcode: Some(barcode.to_string()),
        }
    }
}

/// Caller double driven by a (channel, read_number) script. Unscripted
/// reads come back with empty sequences.
pub struct ScriptedCaller {
    script: HashMap<(u32, u32), ScriptedRead>,
}

impl ScriptedCaller {
    pub fn new(script: HashMap<(u32, u32), ScriptedRead>) -> Self {
        Self { script }
    }

    pub fn empty() -> Self {
        Self {
            script: HashMap::new(),
        }
    }
}

impl Caller for ScriptedCaller {
    fn basecall(&mut self, chunks: Vec<ReadChunk>) -> Result<ReadStream, PluginError> {
        let script = self.script.clone();
        Ok(Box::new(chunks.into_iter().map(move |chunk| {
            let scripted = script
                .get(&(chunk.channel, chunk.read_number))
                .cloned()
                .unwrap_or_default();
            let mut read = BasecalledRead::unbasecalled(&chunk, None);
            read.sequence = scripted.sequence;
            read.barcode = scripted.barcode;
            read.mean_qscore = 12.0;
            read
        })))
    }

    fn validate(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted caller".to_string()
    }

    fn disconnect(&mut self) {}
}

/// Aligner double attaching scripted alignments by (channel, read_number).
pub struct ScriptedAligner {
    script: Arc<HashMap<(u32, u32), Vec<Alignment>>>,
}

impl ScriptedAligner {
    pub fn new(script: HashMap<(u32, u32), Vec<Alignment>>) -> Self {
        Self {
            script: Arc::new(script),
        }
    }

    pub fn empty() -> Self {
        Self::new(HashMap::new())
    }
}

impl Aligner for ScriptedAligner {
    fn align(&self, reads: ReadStream) -> ReadStream {
        let script = self.script.clone();
        Box::new(reads.map(move |mut read| {
            if let Some(alignments) = script.get(&(read.channel, read.read_number)) {
                read.alignments = alignments.clone();
            }
            read
        }))
    }

    fn validate(&mut self) -> Result<(), PluginError> {
        Ok(())
    }

    fn describe(&self) -> String {
        "scripted aligner".to_string()
    }

    fn initialised(&self) -> bool {
        true
    }

    fn contigs(&self) -> Option<Vec<String>> {
        None
    }

    fn disconnect(&mut self) {}
}

/// Render a single-region experiment with the given action overrides on
/// top of an all-`proceed` table.
pub fn single_region_toml(
    min_chunks: u32,
    max_chunks: u32,
    overrides: &[(&str, &str)],
    extra: &str,
) -> String {
    let mut actions: BTreeMap<&str, &str> = BTreeMap::from([
        ("single_on", "proceed"),
        ("multi_on", "proceed"),
        ("single_off", "proceed"),
        ("multi_off", "proceed"),
        ("no_seq", "proceed"),
        ("no_map", "proceed"),
    ]);
    for (key, value) in overrides {
        actions.insert(key, value);
    }
    let mut toml = String::from(
        "[caller_settings.no_op]\n\n[mapper_settings.no_op]\n\n[[regions]]\nname = \"select\"\n",
    );
    toml.push_str(&format!("min_chunks = {min_chunks}\n"));
    toml.push_str(&format!("max_chunks = {max_chunks}\n"));
    toml.push_str("targets = [\"chr20\"]\n");
    for (key, value) in &actions {
        toml.push_str(&format!("{key} = \"{value}\"\n"));
    }
    if !extra.is_empty() {
        toml.push_str(extra);
        toml.push('\n');
    }
    toml
}

pub fn fast_options(mode: DriverMode) -> DriverOptions {
    DriverOptions {
        mode,
        throttle: Duration::from_millis(5),
        chunk_duration: Duration::from_millis(500),
        startup_timeout: Duration::from_secs(5),
        reconnect_backoff: Duration::from_millis(10),
        max_reconnects: 2,
        sweep_interval: Duration::from_secs(60),
        heartbeat_interval: Duration::from_secs(60),
        ..DriverOptions::default()
    }
}

pub struct Harness {
    pub handle: LoopbackHandle,
    pub shutdown: Arc<AtomicBool>,
    driver: JoinHandle<Result<RunSummary, PipelineError>>,
}

/// Spin up a driver thread against a loopback instrument already in the
/// sequencing phase.
pub fn start_pipeline(
    toml: &str,
    caller: ScriptedCaller,
    aligner: ScriptedAligner,
    options: DriverOptions,
) -> Harness {
    let file: ExperimentFile = toml::from_str(toml).expect("test toml parses");
    let experiment = Arc::new(Experiment::from_file(file, None).expect("test config valid"));
    let layout = FlowcellLayout::from_channel_count(512).expect("layout");
    let resolver = ConditionResolver::new(experiment, &layout).expect("resolver");
    let (handle, connector) = loopback();
    let mut driver = PipelineDriver::new(
        Box::new(connector),
        Box::new(caller),
        Box::new(aligner),
        resolver,
        options,
    );
    let shutdown = driver.shutdown_handle();
    let driver = std::thread::spawn(move || driver.run());
    handle
        .events
        .send(InstrumentEvent::Phase(RunPhase::Sequencing))
        .expect("driver alive");
    Harness {
        handle,
        shutdown,
        driver,
    }
}

impl Harness {
    pub fn send_chunk(&self, channel: u32, read_number: u32) {
        self.handle
            .events
            .send(InstrumentEvent::Chunk(chunk(channel, read_number)))
            .expect("driver alive");
    }

    pub fn expect_action(&self) -> ActionCommand {
        self.handle
            .actions
            .recv_timeout(Duration::from_secs(2))
            .expect("an action should have been dispatched")
    }

    pub fn expect_no_action(&self) {
        assert!(
            self.handle
                .actions
                .recv_timeout(Duration::from_millis(300))
                .is_err(),
            "no action should have been dispatched"
        );
    }

    /// Leave the sequencing phase and collect the run summary.
    pub fn finish(self) -> RunSummary {
        let _ = self
            .handle
            .events
            .send(InstrumentEvent::Phase(RunPhase::Finishing));
        self.driver
            .join()
            .expect("driver thread exits cleanly")
            .expect("run succeeds")
    }

    /// Tear the loopback down and return the driver's error.
    pub fn finish_with_error(self) -> PipelineError {
        drop(self.handle);
        self.driver
            .join()
            .expect("driver thread exits cleanly")
            .expect_err("run should fail")
    }
}
