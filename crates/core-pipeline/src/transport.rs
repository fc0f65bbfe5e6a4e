//! Instrument transport contract.
//!
//! The pipeline does not negotiate the instrument protocol; it consumes a
//! bidirectional stream abstracted into two halves: an event source (signal
//! chunks, read-ended notices, run-phase changes) and an action sink. A
//! [`InstrumentConnector`] mints fresh halves, which is what bounded
//! reconnection is built on.
//!
//! Two implementations live here: a newline-delimited JSON client over TCP
//! for a real endpoint, and an in-process loopback used by tests and
//! rehearsals.

use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use core_model::{ActionCommand, Channel, ReadChunk, ReadNumber};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("instrument connection failed: {0}")]
    Connect(#[source] std::io::Error),
    #[error("instrument stream lost: {0}")]
    Lost(#[source] std::io::Error),
}

/// Advertised run phase of the instrument. The pipeline only works while
/// the instrument is sequencing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunPhase {
    MuxScan,
    Sequencing,
    Finishing,
    Unknown,
}

/// One inbound message from the instrument.
#[derive(Debug, Clone, PartialEq)]
pub enum InstrumentEvent {
    Chunk(ReadChunk),
    ReadEnded {
        channel: Channel,
        read_number: ReadNumber,
    },
    Phase(RunPhase),
}

/// Receiving half. `recv` blocks up to `timeout`; `Ok(None)` is a quiet
/// interval, an error means the stream is gone.
pub trait InstrumentSource: Send {
    fn recv(&mut self, timeout: Duration) -> Result<Option<InstrumentEvent>, TransportError>;
}

/// Sending half. Commands are transmitted in submission order.
pub trait ActionSink: Send {
    fn send(&mut self, actions: Vec<ActionCommand>) -> Result<(), TransportError>;
}

pub struct InstrumentLink {
    pub source: Box<dyn InstrumentSource>,
    pub sink: Box<dyn ActionSink>,
}

/// Factory for transport halves; called again on reconnect.
pub trait InstrumentConnector: Send {
    fn connect(&self) -> Result<InstrumentLink, TransportError>;
    fn describe(&self) -> String;
}

// ---------------------------------------------------------------------------
// TCP transport: newline-delimited JSON, one message per line.
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    Chunk {
        channel: Channel,
        read_number: ReadNumber,
        read_id: String,
        raw_signal: Vec<u8>,
        chunk_start_sample: u64,
        chunk_length: u64,
        median_before: f32,
        median: f32,
        /// Instrument-side chunk classifications; accepted but not used.
        #[serde(default)]
        classifications: Vec<String>,
    },
    ReadEnded {
        channel: Channel,
        read_number: ReadNumber,
    },
    Phase {
        phase: RunPhase,
    },
}

impl From<WireEvent> for InstrumentEvent {
    fn from(wire: WireEvent) -> Self {
        match wire {
            WireEvent::Chunk {
                channel,
                read_number,
                read_id,
                raw_signal,
                chunk_start_sample,
                chunk_length,
                median_before,
                median,
                classifications: _,
            } => InstrumentEvent::Chunk(ReadChunk {
                channel,
                read_number,
                read_id,
                raw_signal,
                chunk_start_sample,
                chunk_length,
                median_before,
                median,
            }),
            WireEvent::ReadEnded {
                channel,
                read_number,
            } => InstrumentEvent::ReadEnded {
                channel,
                read_number,
            },
            WireEvent::Phase { phase } => InstrumentEvent::Phase(phase),
        }
    }
}

/// Connects to an instrument endpoint speaking the JSON line protocol.
pub struct TcpConnector {
    address: String,
}

impl TcpConnector {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

impl InstrumentConnector for TcpConnector {
    fn connect(&self) -> Result<InstrumentLink, TransportError> {
        let stream = TcpStream::connect(&self.address).map_err(TransportError::Connect)?;
        stream.set_nodelay(true).map_err(TransportError::Connect)?;
        let writer = stream.try_clone().map_err(TransportError::Connect)?;
        // A wedged peer must not hold the dispatcher hostage.
        writer
            .set_write_timeout(Some(Duration::from_secs(5)))
            .map_err(TransportError::Connect)?;
        Ok(InstrumentLink {
            source: Box::new(TcpSource {
                reader: BufReader::new(stream),
                line: String::new(),
            }),
            sink: Box::new(TcpSink { writer }),
        })
    }

    fn describe(&self) -> String {
        format!("instrument at {}", self.address)
    }
}

struct TcpSource {
    reader: BufReader<TcpStream>,
    line: String,
}

impl InstrumentSource for TcpSource {
    fn recv(&mut self, timeout: Duration) -> Result<Option<InstrumentEvent>, TransportError> {
        self.reader
            .get_ref()
            .set_read_timeout(Some(timeout))
            .map_err(TransportError::Lost)?;
        // The line buffer persists across calls: a timeout mid-line keeps
        // the partial data and the next call appends the rest.
        match self.reader.read_line(&mut self.line) {
            Ok(0) => Err(TransportError::Lost(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "instrument closed the stream",
            ))),
            Ok(_) => {
                let parsed = serde_json::from_str::<WireEvent>(self.line.trim_end());
                self.line.clear();
                match parsed {
                    Ok(wire) => Ok(Some(wire.into())),
                    Err(err) => Err(TransportError::Lost(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        err,
                    ))),
                }
            }
            Err(err)
                if matches!(
                    err.kind(),
                    std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                ) =>
            {
                Ok(None)
            }
            Err(err) => Err(TransportError::Lost(err)),
        }
    }
}

struct TcpSink {
    writer: TcpStream,
}

impl ActionSink for TcpSink {
    fn send(&mut self, actions: Vec<ActionCommand>) -> Result<(), TransportError> {
        for action in &actions {
            serde_json::to_writer(&mut self.writer, action)
                .map_err(|err| TransportError::Lost(err.into()))?;
            self.writer.write_all(b"\n").map_err(TransportError::Lost)?;
        }
        self.writer.flush().map_err(TransportError::Lost)
    }
}

// ---------------------------------------------------------------------------
// Loopback transport: crossbeam channels, in-process.
// ---------------------------------------------------------------------------

/// Test/rehearsal side of a loopback pair: feed events in, observe actions.
/// Dropping the handle severs the "connection": in-flight receives fail and
/// further connect attempts are refused.
pub struct LoopbackHandle {
    pub events: crossbeam_channel::Sender<InstrumentEvent>,
    pub actions: crossbeam_channel::Receiver<ActionCommand>,
    // Never carries messages; its disconnection is the liveness signal.
    _alive: crossbeam_channel::Sender<()>,
}

pub struct LoopbackConnector {
    events: crossbeam_channel::Receiver<InstrumentEvent>,
    actions: crossbeam_channel::Sender<ActionCommand>,
    alive: crossbeam_channel::Receiver<()>,
}

/// Build a connected in-process transport pair.
pub fn loopback() -> (LoopbackHandle, LoopbackConnector) {
    let (event_tx, event_rx) = crossbeam_channel::unbounded();
    let (action_tx, action_rx) = crossbeam_channel::unbounded();
    let (alive_tx, alive_rx) = crossbeam_channel::bounded(0);
    (
        LoopbackHandle {
            events: event_tx,
            actions: action_rx,
            _alive: alive_tx,
        },
        LoopbackConnector {
            events: event_rx,
            actions: action_tx,
            alive: alive_rx,
        },
    )
}

impl InstrumentConnector for LoopbackConnector {
    fn connect(&self) -> Result<InstrumentLink, TransportError> {
        if matches!(
            self.alive.try_recv(),
            Err(crossbeam_channel::TryRecvError::Disconnected)
        ) {
            return Err(TransportError::Connect(std::io::Error::other(
                "loopback handle dropped",
            )));
        }
        Ok(InstrumentLink {
            source: Box::new(LoopbackSource {
                events: self.events.clone(),
            }),
            sink: Box::new(LoopbackSink {
                actions: self.actions.clone(),
            }),
        })
    }

    fn describe(&self) -> String {
        "in-process loopback instrument".to_string()
    }
}

struct LoopbackSource {
    events: crossbeam_channel::Receiver<InstrumentEvent>,
}

impl InstrumentSource for LoopbackSource {
    fn recv(&mut self, timeout: Duration) -> Result<Option<InstrumentEvent>, TransportError> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Ok(Some(event)),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => Ok(None),
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => Err(TransportError::Lost(
                std::io::Error::other("loopback handle dropped"),
            )),
        }
    }
}

struct LoopbackSink {
    actions: crossbeam_channel::Sender<ActionCommand>,
}

impl ActionSink for LoopbackSink {
    fn send(&mut self, actions: Vec<ActionCommand>) -> Result<(), TransportError> {
        for action in actions {
            self.actions.send(action).map_err(|_| {
                TransportError::Lost(std::io::Error::other("loopback handle dropped"))
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_model::Action;
    use std::net::TcpListener;

    #[test]
    fn wire_events_round_trip() {
        let chunk = WireEvent::Chunk {
            channel: 100,
            read_number: 1,
            read_id: "read".to_string(),
            raw_signal: vec![1, 2, 3],
            chunk_start_sample: 0,
            chunk_length: 4000,
            median_before: 210.0,
            median: 85.0,
            classifications: vec!["strand".to_string()],
        };
        let line = serde_json::to_string(&chunk).unwrap();
        assert!(line.contains("\"type\":\"chunk\""));
        let parsed: WireEvent = serde_json::from_str(&line).unwrap();
        assert!(matches!(
            InstrumentEvent::from(parsed),
            InstrumentEvent::Chunk(c) if c.channel == 100
        ));

        let phase = serde_json::to_string(&WireEvent::Phase {
            phase: RunPhase::MuxScan,
        })
        .unwrap();
        assert!(phase.contains("mux_scan"));
    }

    #[test]
    fn tcp_transport_round_trips_against_echo_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let peer = std::thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut writer = stream.try_clone().unwrap();
            // One phase event out, then echo received action lines back as
            // a count.
            writeln!(writer, r#"{{"type":"phase","phase":"sequencing"}}"#).unwrap();
            let reader = BufReader::new(stream);
            let mut seen = 0usize;
            for line in reader.lines() {
                let Ok(line) = line else { break };
                let value: serde_json::Value = serde_json::from_str(&line).unwrap();
                assert_eq!(value["action"], "unblock");
                seen += 1;
                if seen == 2 {
                    break;
                }
            }
            seen
        });

        let connector = TcpConnector::new(address);
        let InstrumentLink {
            mut source,
            mut sink,
        } = connector.connect().unwrap();
        let event = source.recv(Duration::from_secs(5)).unwrap().unwrap();
        assert_eq!(event, InstrumentEvent::Phase(RunPhase::Sequencing));
        // A quiet interval is not an error.
        assert!(source.recv(Duration::from_millis(20)).unwrap().is_none());

        let command = ActionCommand {
            channel: 1,
            read_number: 9,
            action: Action::Unblock,
            unblock_duration: Some(0.1),
        };
        sink.send(vec![command.clone(), command]).unwrap();
        assert_eq!(peer.join().unwrap(), 2);
    }

    #[test]
    fn loopback_reports_disconnect() {
        let (handle, connector) = loopback();
        let InstrumentLink { mut source, .. } = connector.connect().unwrap();
        drop(handle);
        assert!(source.recv(Duration::from_millis(10)).is_err());
    }
}
