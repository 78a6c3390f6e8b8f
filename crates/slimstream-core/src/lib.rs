//! SlimStreamer core - the capture-agnostic half of the capture-and-distribute
//! pipeline: Stream Markers, the Chunk Queue, the SlimProto Command Codec, the
//! Control Session and Streaming Session state machines, and the Dispatcher
//! that fans captured chunks out to streaming clients.
//!
//! This crate has no hardware dependency: the capture-device contract lives in
//! [`capture::CaptureDevice`], a trait implemented elsewhere (see the sibling
//! `slimstream-capture` crate) and consumed here by [`capture::CaptureSource`].
//! TCP acceptor plumbing, CLI/config parsing, and logging-sink configuration
//! are external collaborators; this crate only calls the `log` facade and
//! operates on plain `tokio::net::TcpStream`s handed to it by the caller.

#![warn(clippy::all)]

pub mod capture;
pub mod chunk;
pub mod codec;
pub mod control_session;
pub mod dispatcher;
pub mod error;
pub mod markers;
pub mod pcm;
pub mod protocol_constants;
pub mod registry;
pub mod stream;
pub mod streaming_session;

pub use capture::{CaptureDevice, CaptureSource};
pub use chunk::{Chunk, ChunkGuard, ChunkQueue};
pub use control_session::{ControlSession, ControlSessionConfig};
pub use dispatcher::{ChunkSink, Dispatcher, SessionRegistry};
pub use error::{ConfigError, DeviceError, ErrorCode, ProtocolDecodeError, TransportError};
pub use markers::{StreamMarker, StreamingState};
pub use pcm::PcmParameters;
pub use registry::{parse_client_id, ClientRegistry};
pub use streaming_session::{accept_streaming_connection, StreamingSession};
