//! Caller and aligner plugin contracts plus the built-in registry.
//!
//! Plugins are capability-bearing values behind the [`Caller`] and
//! [`Aligner`] traits: a fixed operation set, constructed by name from the
//! registry with the verbatim options table out of the configuration.
//! Built-ins: callers `real` (basecaller server over a Unix socket) and
//! `no_op` (identity pass-through); aligners `mappy` (single-threaded
//! minimap2), `mappy_rs` (minimap2 behind a worker pool) and `no_op`.
//!
//! Failure model: a plugin failing on a single read yields a read with an
//! empty sequence and an error note; losing its transport or index is a
//! [`PluginError`] that propagates to the driver.

use serde::de::DeserializeOwned;
use thiserror::Error;
use toml::Table;

use core_model::{BasecalledRead, ReadChunk};

pub mod aligner;
pub mod caller;

pub use aligner::{MappyAligner, MappyRsAligner, NoOpAligner};
pub use caller::{NoOpCaller, RealCaller};

/// Built-in caller plugin names, in registry order.
pub const CALLER_PLUGINS: &[&str] = &["real", "no_op"];
/// Built-in aligner plugin names, in registry order.
pub const ALIGNER_PLUGINS: &[&str] = &["mappy", "mappy_rs", "no_op"];

/// Lazy, finite, non-restartable sequence of reads flowing between pipeline
/// stages. Order within a batch is unspecified; every read carries its own
/// channel and read number.
pub type ReadStream = Box<dyn Iterator<Item = BasecalledRead> + Send>;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("unknown {kind} plugin {name:?}, built-ins are {known:?}")]
    UnknownPlugin {
        kind: &'static str,
        name: String,
        known: &'static [&'static str],
    },
    #[error("{plugin}: invalid options: {reason}")]
    BadOptions { plugin: &'static str, reason: String },
    #[error("{plugin}: {reason}")]
    InitFailed { plugin: &'static str, reason: String },
    #[error("{plugin}: transport failed: {source}")]
    Transport {
        plugin: &'static str,
        #[source]
        source: std::io::Error,
    },
}

/// Basecaller contract.
pub trait Caller: Send {
    /// Basecall one batch. Yields one read per input chunk, in any order.
    /// A catastrophic failure (transport closed) is an error; a per-read
    /// failure is a read with an empty sequence and an error note.
    fn basecall(&mut self, chunks: Vec<ReadChunk>) -> Result<ReadStream, PluginError>;

    /// Verify preconditions (connectivity, model availability) and fail
    /// fast with a descriptive error.
    fn validate(&mut self) -> Result<(), PluginError>;

    /// Human-readable summary for logs.
    fn describe(&self) -> String;

    /// Tear down any held resources. Called on every exit path.
    fn disconnect(&mut self);
}

/// Aligner contract.
pub trait Aligner: Send {
    /// Attach alignments to each read in the stream. Reads with empty
    /// sequences pass through untouched.
    fn align(&self, reads: ReadStream) -> ReadStream;

    /// Verify preconditions and bring the plugin up (for the minimap2
    /// plugins this loads the reference index).
    fn validate(&mut self) -> Result<(), PluginError>;

    fn describe(&self) -> String;

    /// Whether the plugin is ready to serve [`Aligner::align`].
    fn initialised(&self) -> bool;

    /// Contig names of the loaded reference, or `None` when the plugin has
    /// no notion of a reference (pass-through aligner).
    fn contigs(&self) -> Option<Vec<String>>;

    fn disconnect(&mut self);
}

impl std::fmt::Debug for dyn Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

impl std::fmt::Debug for dyn Aligner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.describe())
    }
}

/// Construct a caller plugin by registry name.
pub fn build_caller(name: &str, options: &Table) -> Result<Box<dyn Caller>, PluginError> {
    match name {
        "real" => Ok(Box::new(RealCaller::from_options(options)?)),
        "no_op" => Ok(Box::new(NoOpCaller::new())),
        other => Err(PluginError::UnknownPlugin {
            kind: "caller",
            name: other.to_string(),
            known: CALLER_PLUGINS,
        }),
    }
}

/// Construct an aligner plugin by registry name.
pub fn build_aligner(name: &str, options: &Table) -> Result<Box<dyn Aligner>, PluginError> {
    match name {
        "mappy" => Ok(Box::new(MappyAligner::from_options(options)?)),
        "mappy_rs" => Ok(Box::new(MappyRsAligner::from_options(options)?)),
        "no_op" => Ok(Box::new(NoOpAligner::new())),
        other => Err(PluginError::UnknownPlugin {
            kind: "aligner",
            name: other.to_string(),
            known: ALIGNER_PLUGINS,
        }),
    }
}

/// Deserialize a plugin options table, mapping serde errors onto
/// [`PluginError::BadOptions`].
fn parse_options<T: DeserializeOwned>(
    plugin: &'static str,
    options: &Table,
) -> Result<T, PluginError> {
    toml::Value::Table(options.clone())
        .try_into()
        .map_err(|err| PluginError::BadOptions {
            plugin,
            reason: err.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_plugin_names_list_builtins() {
        let err = build_caller("guppy", &Table::new()).unwrap_err();
        assert!(err.to_string().contains("real"));
        let err = build_aligner("bwa", &Table::new()).unwrap_err();
        assert!(err.to_string().contains("mappy_rs"));
    }

    #[test]
    fn no_op_plugins_build_from_empty_options() {
        assert!(build_caller("no_op", &Table::new()).is_ok());
        assert!(build_aligner("no_op", &Table::new()).is_ok());
    }
}
