//! Server configuration.
//!
//! Supports loading from YAML files with environment variable overrides.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;
use slimstream_core::{codec, ConfigError, PcmParameters};

/// Server configuration loaded from YAML with environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Capture device name, passed verbatim to the capture backend.
    /// Override: `SLIMSTREAM_DEVICE`
    pub device: String,

    /// Capture sampling rate in Hz. Must be one of the rates SlimProto's
    /// wire format can encode (see `codec::map_sampling_rate`).
    /// Override: `SLIMSTREAM_SAMPLING_RATE`
    pub sampling_rate: u32,

    /// Channel count *including* the trailing marker channel.
    pub channels: u16,

    /// Bits per sample; must be a non-zero multiple of 8.
    pub bit_depth: u16,

    /// Frames captured per chunk.
    pub frames_per_chunk: usize,

    /// Number of periods the capture backend's internal ring should hold.
    pub periods: u32,

    /// Number of `Chunk` slots in the Chunk Queue.
    pub queue_capacity: usize,

    /// Port the control-plane TCP listener binds to.
    /// Override: `SLIMSTREAM_CONTROL_PORT`
    pub control_port: u16,

    /// Port advertised in `STRM Start` and bound by the streaming-plane TCP
    /// listener.
    /// Override: `SLIMSTREAM_STREAM_PORT`
    pub stream_port: u16,

    /// Whether a streaming session logs a warning on every chunk dropped
    /// for a sampling-rate mismatch, or stays silent.
    pub log_rate_mismatch: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            device: "default".to_string(),
            sampling_rate: 48000,
            channels: 3, // stereo + marker channel
            bit_depth: 16,
            frames_per_chunk: 1024,
            periods: 4,
            queue_capacity: 32,
            control_port: 3483,
            stream_port: 9000,
            log_rate_mismatch: true,
        }
    }
}

impl ServerConfig {
    /// Loads configuration from a YAML file, then applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = if let Some(path) = path {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            serde_yaml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    /// Applies environment variable overrides to the configuration.
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("SLIMSTREAM_DEVICE") {
            self.device = val;
        }
        if let Ok(val) = std::env::var("SLIMSTREAM_SAMPLING_RATE") {
            if let Ok(rate) = val.parse() {
                self.sampling_rate = rate;
            }
        }
        if let Ok(val) = std::env::var("SLIMSTREAM_CONTROL_PORT") {
            if let Ok(port) = val.parse() {
                self.control_port = port;
            }
        }
        if let Ok(val) = std::env::var("SLIMSTREAM_STREAM_PORT") {
            if let Ok(port) = val.parse() {
                self.stream_port = port;
            }
        }
        if let Ok(val) = std::env::var("SLIMSTREAM_LOG_RATE_MISMATCH") {
            if let Ok(flag) = val.parse() {
                self.log_rate_mismatch = flag;
            }
        }
    }

    /// Validates this configuration and builds the `PcmParameters` the
    /// capture and streaming paths run on, in the manner of the teacher's
    /// `StreamingConfig::validate`.
    pub fn pcm_parameters(&self) -> Result<PcmParameters, ConfigError> {
        let params = PcmParameters::new(
            self.device.clone(),
            self.sampling_rate,
            self.channels,
            self.bit_depth,
            self.frames_per_chunk,
            self.periods,
        )?;

        codec::map_sampling_rate(self.sampling_rate)
            .ok_or(ConfigError::UnsupportedRate(self.sampling_rate))?;

        Ok(params)
    }

    /// The wire-encoded ASCII byte for `sampling_rate`, assuming
    /// `pcm_parameters` has already validated the rate is supported.
    pub fn sample_rate_byte(&self) -> u8 {
        codec::map_sampling_rate(self.sampling_rate).expect("validated by pcm_parameters")
    }
}
