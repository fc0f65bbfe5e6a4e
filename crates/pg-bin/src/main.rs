//! Poregate entrypoint.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;

use core_config::{ConditionResolver, Experiment};
use core_model::FlowcellLayout;
use core_pipeline::{
    DriverMode, DriverOptions, PipelineDriver, RunSummary, TcpConnector,
    validate_plugins_with_timeout,
};
use core_plugin::{Aligner, Caller, build_aligner, build_caller};

/// Fallback channel count when neither the configuration nor the CLI
/// overrides it.
const DEFAULT_CHANNELS: u32 = 512;

/// Experiment used by `unblock-all`, which needs no policy of its own.
const UNBLOCK_ALL_EXPERIMENT: &str = r#"
[caller_settings.no_op]

[mapper_settings.no_op]

[[regions]]
name = "unblock_all"
min_chunks = 0
max_chunks = 16
targets = []
single_on = "proceed"
multi_on = "proceed"
single_off = "proceed"
multi_off = "proceed"
no_seq = "proceed"
no_map = "proceed"
"#;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "poregate", version, about = "Adaptive sampling for nanopore sequencers")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the full decision pipeline against a live sequencing run.
    Targets(TargetsArgs),
    /// Eject every read as it is seen. Diagnostic latency testing only.
    UnblockAll(UnblockAllArgs),
    /// Load, validate and describe an experiment configuration.
    Validate(ValidateArgs),
    /// Print the machine-readable summary of a finished run.
    Stats(StatsArgs),
}

#[derive(clap::Args, Debug)]
struct TargetsArgs {
    /// Experiment configuration (TOML).
    #[arg(long)]
    config: PathBuf,
    /// Instrument device id, used to name the run summary.
    #[arg(long)]
    device: String,
    /// Instrument stream endpoint.
    #[arg(long, default_value = "127.0.0.1:9501")]
    address: String,
    /// Experiment label recorded in logs.
    #[arg(long)]
    experiment_name: Option<String>,
    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Flow-cell channel count (configuration `channels` wins if set).
    #[arg(long)]
    channels: Option<u32>,
    /// Vendor channel→(row, col) permutation table (TOML with a
    /// `positions` array of [row, col] pairs, one per channel).
    #[arg(long)]
    permutation: Option<PathBuf>,
    /// Sleep between empty cache drains, in seconds.
    #[arg(long, default_value_t = 0.1)]
    throttle: f64,
    /// Instrument chunk cadence in seconds; the per-batch latency budget.
    #[arg(long, default_value_t = 1.0)]
    chunk_duration: f64,
    /// Plugin validation timeout in seconds.
    #[arg(long, default_value_t = 120.0)]
    init_timeout: f64,
    /// Where to write the run summary (default: <device>_summary.json).
    #[arg(long)]
    summary: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct UnblockAllArgs {
    /// Instrument device id, used to name the run summary.
    #[arg(long)]
    device: String,
    /// Instrument stream endpoint.
    #[arg(long, default_value = "127.0.0.1:9501")]
    address: String,
    /// Append logs to this file instead of stderr.
    #[arg(long)]
    log_file: Option<PathBuf>,
    /// Flow-cell channel count.
    #[arg(long, default_value_t = DEFAULT_CHANNELS)]
    channels: u32,
    /// Seconds the ejection voltage is applied per unblock.
    #[arg(long, default_value_t = 0.1)]
    unblock_duration: f64,
    /// Sleep between empty cache drains, in seconds.
    #[arg(long, default_value_t = 0.1)]
    throttle: f64,
}

#[derive(clap::Args, Debug)]
struct ValidateArgs {
    /// Experiment configuration (TOML).
    #[arg(long)]
    config: PathBuf,
    /// Skip plugin construction and validation.
    #[arg(long)]
    no_plugins: bool,
    /// Flow-cell channel count used for the region-split check.
    #[arg(long)]
    channels: Option<u32>,
    /// Plugin validation timeout in seconds.
    #[arg(long, default_value_t = 120.0)]
    init_timeout: f64,
}

#[derive(clap::Args, Debug)]
struct StatsArgs {
    /// Run summary written by `targets` or `unblock-all`.
    #[arg(long)]
    summary: PathBuf,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let log_file = match &args.command {
        Command::Targets(t) => t.log_file.clone(),
        Command::UnblockAll(u) => u.log_file.clone(),
        _ => None,
    };
    let _log_guard = configure_logging(log_file);
    install_panic_hook();

    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Targets(args) => run_targets(args),
        Command::UnblockAll(args) => run_unblock_all(args),
        Command::Validate(args) => run_validate(args),
        Command::Stats(args) => run_stats(args),
    }
}

fn configure_logging(log_file: Option<PathBuf>) -> Option<WorkerGuard> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match log_file {
        Some(path) => {
            let directory = path.parent().unwrap_or_else(|| std::path::Path::new("."));
            let file_name = path.file_name().unwrap_or_else(|| "poregate.log".as_ref());
            let appender = tracing_appender::rolling::never(directory, file_name);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(writer)
                .with_ansi(false)
                .try_init();
            Some(guard)
        }
        None => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .try_init();
            None
        }
    }
}

fn install_panic_hook() {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        tracing::error!(target: "runtime.panic", ?info, "panic");
        default_panic(info);
    }));
}

fn build_validated_plugins(
    experiment: &Experiment,
    init_timeout: f64,
) -> Result<(Box<dyn Caller>, Box<dyn Aligner>)> {
    let caller = build_caller(&experiment.caller.name, &experiment.caller.options)?;
    let aligner = build_aligner(&experiment.mapper.name, &experiment.mapper.options)?;
    let timeout = Duration::from_secs_f64(init_timeout);
    let (caller, aligner) = validate_plugins_with_timeout(caller, aligner, timeout)?;
    info!(
        target: "runtime",
        caller = %caller.describe(),
        aligner = %aligner.describe(),
        "plugins_ready"
    );
    if let Some(contigs) = aligner.contigs() {
        let known: HashSet<String> = contigs.into_iter().collect();
        experiment.validate_reference_contigs(&known)?;
    }
    Ok((caller, aligner))
}

/// Vendor layout file: `positions[i]` is the grid position of channel
/// `i + 1`, obtained out-of-band from the instrument vendor.
#[derive(serde::Deserialize)]
struct PermutationFile {
    positions: Vec<(u16, u16)>,
}

fn resolver_for(
    experiment: Experiment,
    channels: u32,
    permutation: Option<&std::path::Path>,
) -> Result<ConditionResolver> {
    let mut layout = FlowcellLayout::from_channel_count(channels)?;
    if let Some(path) = permutation {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("reading permutation table {}", path.display()))?;
        let table: PermutationFile = toml::from_str(&content)
            .with_context(|| format!("parsing permutation table {}", path.display()))?;
        layout = layout.with_permutation(table.positions)?;
    }
    Ok(ConditionResolver::new(Arc::new(experiment), &layout)?)
}

fn run_targets(args: TargetsArgs) -> Result<()> {
    let experiment = Experiment::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    info!(
        target: "runtime",
        device = %args.device,
        experiment = args.experiment_name.as_deref(),
        config = %args.config.display(),
        regions = experiment.regions.len(),
        barcodes = experiment.barcodes.len(),
        "bootstrap_complete"
    );

    let (caller, aligner) = build_validated_plugins(&experiment, args.init_timeout)?;
    let channels = experiment
        .channels
        .or(args.channels)
        .unwrap_or(DEFAULT_CHANNELS);
    let resolver = resolver_for(experiment, channels, args.permutation.as_deref())?;

    let options = DriverOptions {
        mode: DriverMode::Targets,
        throttle: Duration::from_secs_f64(args.throttle),
        chunk_duration: Duration::from_secs_f64(args.chunk_duration),
        ..DriverOptions::default()
    };
    let connector = TcpConnector::new(args.address);
    let mut driver =
        PipelineDriver::new(Box::new(connector), caller, aligner, resolver, options);
    let summary = driver.run()?;

    let summary_path = args
        .summary
        .unwrap_or_else(|| PathBuf::from(format!("{}_summary.json", args.device)));
    summary
        .write_to(&summary_path)
        .with_context(|| format!("writing {}", summary_path.display()))?;
    info!(target: "runtime", path = %summary_path.display(), "summary_written");
    Ok(())
}

fn run_unblock_all(args: UnblockAllArgs) -> Result<()> {
    let file = toml::from_str(UNBLOCK_ALL_EXPERIMENT)
        .context("embedded unblock-all experiment failed to parse")?;
    let mut experiment = Experiment::from_file(file, None)
        .context("embedded unblock-all experiment failed validation")?;
    experiment.unblock_duration = args.unblock_duration;
    info!(
        target: "runtime",
        device = %args.device,
        channels = args.channels,
        "unblock_all_starting"
    );

    let caller = build_caller("no_op", &experiment.caller.options)?;
    let aligner = build_aligner("no_op", &experiment.mapper.options)?;
    let resolver = resolver_for(experiment, args.channels, None)?;

    let options = DriverOptions {
        mode: DriverMode::UnblockAll,
        throttle: Duration::from_secs_f64(args.throttle),
        ..DriverOptions::default()
    };
    let connector = TcpConnector::new(args.address);
    let mut driver =
        PipelineDriver::new(Box::new(connector), caller, aligner, resolver, options);
    let summary = driver.run()?;
    let summary_path = PathBuf::from(format!("{}_summary.json", args.device));
    summary
        .write_to(&summary_path)
        .with_context(|| format!("writing {}", summary_path.display()))?;
    Ok(())
}

fn run_validate(args: ValidateArgs) -> Result<()> {
    let experiment = Experiment::load_from(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;
    println!(
        "configuration OK: {} region(s), {} barcode condition(s)",
        experiment.regions.len(),
        experiment.barcodes.len()
    );
    for condition in experiment.conditions() {
        println!(
            "  {} {}: {}",
            if condition.control { "control  " } else { "condition" },
            condition.name,
            condition.targets
        );
    }

    let channels = experiment
        .channels
        .or(args.channels)
        .unwrap_or(DEFAULT_CHANNELS);
    println!(
        "caller plugin: {}\nmapper plugin: {}",
        experiment.caller.name, experiment.mapper.name
    );

    if args.no_plugins {
        // Region-split check still runs; plugin construction is skipped.
        resolver_for(experiment, channels, None)?;
        println!("plugin initialization skipped");
        return Ok(());
    }

    let (caller, aligner) = build_validated_plugins(&experiment, args.init_timeout)?;
    println!("caller ready:  {}", caller.describe());
    println!("mapper ready:  {}", aligner.describe());
    resolver_for(experiment, channels, None)?;
    Ok(())
}

fn run_stats(args: StatsArgs) -> Result<()> {
    let summary = RunSummary::read_from(&args.summary)
        .with_context(|| format!("no run summary at {}", args.summary.display()))?;
    println!("batches:             {}", summary.batches);
    println!("chunks analyzed:     {}", summary.chunks);
    println!("slow batches:        {}", summary.slow_batches);
    println!("mean batch time:     {:.2} ms", summary.mean_batch_ms);
    println!("unblocks sent:       {}", summary.unblocks_sent);
    println!("stop receiving sent: {}", summary.stop_receivings_sent);
    println!("suppressed repeats:  {}", summary.suppressed);
    println!(
        "cache activity:      {} inserted / {} replaced / {} displaced",
        summary.cache_inserted, summary.cache_replaced, summary.cache_displaced
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn embedded_unblock_all_experiment_is_valid() {
        let file = toml::from_str(UNBLOCK_ALL_EXPERIMENT).unwrap();
        let experiment = Experiment::from_file(file, None).unwrap();
        assert_eq!(experiment.regions.len(), 1);
        assert!(!experiment.barcoding_enabled());
    }

    #[test]
    fn stats_on_missing_summary_fails() {
        let dir = tempfile::tempdir().unwrap();
        let err = run_stats(StatsArgs {
            summary: dir.path().join("absent.json"),
        })
        .unwrap_err();
        assert!(err.to_string().contains("no run summary"));
    }

    #[test]
    fn cli_parses_targets_subcommand() {
        let args = Args::try_parse_from([
            "poregate",
            "targets",
            "--config",
            "experiment.toml",
            "--device",
            "MS00042",
            "--experiment-name",
            "enrichment-01",
        ])
        .unwrap();
        match args.command {
            Command::Targets(targets) => {
                assert_eq!(targets.device, "MS00042");
                assert_eq!(targets.experiment_name.as_deref(), Some("enrichment-01"));
                assert_eq!(targets.address, "127.0.0.1:9501");
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}
