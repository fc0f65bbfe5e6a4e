//! Basecaller server client.
//!
//! The wire format is owned by this plugin: newline-delimited JSON
//! request/response pairs over a Unix domain socket, one request per chunk
//! and exactly one response per request (any order). The pipeline core only
//! sees the [`Caller`] operations.

use std::io::{BufRead, BufReader, Write};
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use toml::Table;
use tracing::{debug, info, warn};

use core_model::{BasecalledRead, ReadChunk};

use crate::{Caller, PluginError, ReadStream, parse_options};

const PLUGIN: &str = "caller.real";

fn default_response_timeout_ms() -> u64 {
    10_000
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RealCallerOptions {
    /// Path of the basecaller's Unix domain socket.
    pub socket: PathBuf,
    /// Advisory model name, reported in logs.
    #[serde(default)]
    pub model: Option<String>,
    /// Per-batch read/write timeout on the socket.
    #[serde(default = "default_response_timeout_ms")]
    pub response_timeout_ms: u64,
}

#[derive(Serialize)]
struct CallRequest<'a> {
    read_id: &'a str,
    channel: u32,
    read_number: u32,
    signal: &'a [u8],
    median: f32,
    median_before: f32,
}

#[derive(Deserialize)]
struct CallResponse {
    read_id: String,
    channel: u32,
    read_number: u32,
    #[serde(default)]
    sequence: String,
    #[serde(default)]
    mean_qscore: f32,
    #[serde(default)]
    barcode: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

impl From<CallResponse> for BasecalledRead {
    fn from(response: CallResponse) -> Self {
        let sequence = if response.error.is_some() {
            String::new()
        } else {
            response.sequence
        };
        BasecalledRead {
            read_id: response.read_id,
            channel: response.channel,
            read_number: response.read_number,
            barcode: response.barcode,
            sequence,
            mean_qscore: response.mean_qscore,
            error: response.error,
            alignments: Vec::new(),
            decision: None,
        }
    }
}

struct Connection {
    reader: BufReader<UnixStream>,
    writer: UnixStream,
}

impl Connection {
    fn open(options: &RealCallerOptions) -> std::io::Result<Self> {
        let stream = UnixStream::connect(&options.socket)?;
        let timeout = Duration::from_millis(options.response_timeout_ms);
        stream.set_read_timeout(Some(timeout))?;
        stream.set_write_timeout(Some(timeout))?;
        let reader = BufReader::new(stream.try_clone()?);
        Ok(Self {
            reader,
            writer: stream,
        })
    }
}

/// Client for an external basecaller server.
pub struct RealCaller {
    options: RealCallerOptions,
    connection: Option<Connection>,
}

impl RealCaller {
    pub fn from_options(options: &Table) -> Result<Self, PluginError> {
        let options: RealCallerOptions = parse_options(PLUGIN, options)?;
        Ok(Self {
            options,
            connection: None,
        })
    }

    fn transport(source: std::io::Error) -> PluginError {
        PluginError::Transport {
            plugin: PLUGIN,
            source,
        }
    }

    fn ensure_connected(&mut self) -> Result<(), PluginError> {
        if self.connection.is_none() {
            let connection = Connection::open(&self.options).map_err(Self::transport)?;
            debug!(
                target: "plugin.caller",
                socket = %self.options.socket.display(),
                "connected"
            );
            self.connection = Some(connection);
        }
        Ok(())
    }

    fn exchange(
        &mut self,
        chunks: &[ReadChunk],
    ) -> Result<Vec<BasecalledRead>, PluginError> {
        self.ensure_connected()?;
        let Some(connection) = self.connection.as_mut() else {
            return Err(Self::transport(std::io::Error::other(
                "basecaller connection unavailable",
            )));
        };
        for chunk in chunks {
            let request = CallRequest {
                read_id: &chunk.read_id,
                channel: chunk.channel,
                read_number: chunk.read_number,
                signal: &chunk.raw_signal,
                median: chunk.median,
                median_before: chunk.median_before,
            };
            serde_json::to_writer(&mut connection.writer, &request)
                .map_err(|err| Self::transport(err.into()))?;
            connection
                .writer
                .write_all(b"\n")
                .map_err(Self::transport)?;
        }
        connection.writer.flush().map_err(Self::transport)?;

        let mut reads = Vec::with_capacity(chunks.len());
        let mut line = String::new();
        for _ in 0..chunks.len() {
            line.clear();
            let n = connection
                .reader
                .read_line(&mut line)
                .map_err(Self::transport)?;
            if n == 0 {
                return Err(Self::transport(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "basecaller closed the stream mid-batch",
                )));
            }
            let response: CallResponse = serde_json::from_str(line.trim_end())
                .map_err(|err| Self::transport(err.into()))?;
            if let Some(error) = &response.error {
                warn!(
                    target: "plugin.caller",
                    read_id = %response.read_id,
                    error = %error,
                    "basecall_failed_for_read"
                );
            }
            reads.push(response.into());
        }
        Ok(reads)
    }
}

impl Caller for RealCaller {
    fn basecall(&mut self, chunks: Vec<ReadChunk>) -> Result<ReadStream, PluginError> {
        match self.exchange(&chunks) {
            Ok(reads) => Ok(Box::new(reads.into_iter())),
            Err(err) => {
                // A broken stream is not recoverable mid-batch: drop the
                // connection so the next batch reconnects from scratch.
                self.connection = None;
                Err(err)
            }
        }
    }

    fn validate(&mut self) -> Result<(), PluginError> {
        let metadata =
            std::fs::metadata(&self.options.socket).map_err(|err| PluginError::InitFailed {
                plugin: PLUGIN,
                reason: format!(
                    "basecaller socket does not exist: {}: {err}",
                    self.options.socket.display()
                ),
            })?;
        if !metadata.file_type().is_socket() {
            return Err(PluginError::InitFailed {
                plugin: PLUGIN,
                reason: format!(
                    "{} is not a Unix domain socket",
                    self.options.socket.display()
                ),
            });
        }
        self.ensure_connected()
            .map_err(|err| PluginError::InitFailed {
                plugin: PLUGIN,
                reason: format!(
                    "basecaller socket is not connectable (check permissions): {err}"
                ),
            })?;
        Ok(())
    }

    fn describe(&self) -> String {
        match &self.options.model {
            Some(model) => format!(
                "basecaller at {} (model {model})",
                self.options.socket.display()
            ),
            None => format!("basecaller at {}", self.options.socket.display()),
        }
    }

    fn disconnect(&mut self) {
        if self.connection.take().is_some() {
            info!(target: "plugin.caller", "disconnected");
        }
    }
}
