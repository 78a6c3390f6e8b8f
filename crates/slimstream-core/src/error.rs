//! Centralized error types for the SlimStreamer core library.
//!
//! SlimProto has no error channel to clients beyond a closed TCP connection,
//! so unlike a JSON API these types carry no HTTP status mapping - they exist
//! purely to be logged and to drive the propagation policy of each component.

use thiserror::Error;

/// Trait for error types that provide a machine-readable error code, for use
/// in structured log lines.
pub trait ErrorCode {
    fn code(&self) -> &'static str;
}

/// Capture device open/read/recover failure.
#[derive(Debug, Error)]
pub enum DeviceError {
    #[error("capture device open failed: {0}")]
    Open(String),

    #[error("capture device read failed: {0}")]
    Read(String),

    #[error("capture device was stopped")]
    Stopped,
}

impl ErrorCode for DeviceError {
    fn code(&self) -> &'static str {
        match self {
            Self::Open(_) => "device_open_failed",
            Self::Read(_) => "device_read_failed",
            Self::Stopped => "device_stopped",
        }
    }
}

/// Malformed or incomplete client frame.
#[derive(Debug, Error)]
pub enum ProtocolDecodeError {
    #[error("incomplete frame, need {needed} more byte(s)")]
    Incomplete { needed: usize },

    #[error("malformed {opcode} frame: {reason}")]
    Malformed { opcode: String, reason: String },

    #[error("unknown opcode {0:?}")]
    UnknownOpcode([u8; 4]),
}

impl ErrorCode for ProtocolDecodeError {
    fn code(&self) -> &'static str {
        match self {
            Self::Incomplete { .. } => "frame_incomplete",
            Self::Malformed { .. } => "frame_malformed",
            Self::UnknownOpcode(_) => "frame_unknown_opcode",
        }
    }
}

/// Socket read/write/EOF failure.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ErrorCode for TransportError {
    fn code(&self) -> &'static str {
        match self {
            Self::Closed => "transport_closed",
            Self::Io(_) => "transport_io_error",
        }
    }
}

/// Invalid capture/streaming configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported sampling rate: {0} Hz")]
    UnsupportedRate(u32),

    #[error("bit depth must be a non-zero multiple of 8, got {0}")]
    InvalidBitDepth(u16),

    #[error("channel count must include at least one audio channel plus the marker channel, got {0}")]
    InvalidChannelCount(u16),
}

impl ErrorCode for ConfigError {
    fn code(&self) -> &'static str {
        match self {
            Self::UnsupportedRate(_) => "unsupported_sampling_rate",
            Self::InvalidBitDepth(_) => "invalid_bit_depth",
            Self::InvalidChannelCount(_) => "invalid_channel_count",
        }
    }
}
