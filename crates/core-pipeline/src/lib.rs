//! Real-time decision pipeline.
//!
//! Wires the chunk cache, plugins, decision engine and action tracker into
//! the batch loop described in [`driver`], against the instrument transport
//! contract in [`transport`]. Timing accounting and the end-of-run summary
//! live in [`stats`].

use std::time::Duration;

use thiserror::Error;

use core_config::ConfigError;
use core_plugin::PluginError;

pub mod driver;
pub mod stats;
pub mod transport;

pub use driver::{DriverMode, DriverOptions, PipelineDriver, validate_plugins_with_timeout};
pub use stats::{BatchStats, BatchVerdict, RunSummary};
pub use transport::{
    InstrumentConnector, InstrumentEvent, InstrumentLink, LoopbackConnector, LoopbackHandle,
    RunPhase, TcpConnector, TransportError, loopback,
};

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Plugin(#[from] PluginError),
    #[error("plugin validation did not finish within {0:?}")]
    ValidateTimeout(Duration),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("instrument did not enter the sequencing phase within {0:?}")]
    StartupTimeout(Duration),
    #[error("{0}")]
    Runtime(String),
}
