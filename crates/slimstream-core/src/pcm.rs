//! Immutable capture-format parameters.

use crate::error::ConfigError;

/// Capture format, fixed for the lifetime of a `CaptureSource`.
///
/// `channels` includes the trailing marker channel; `payload_bytes_per_frame`
/// is the width of a frame once that channel is stripped, i.e. what actually
/// reaches a `Chunk` and, downstream, a client.
#[derive(Debug, Clone)]
pub struct PcmParameters {
    device_name: String,
    sampling_rate: u32,
    channels: u16,
    bit_depth: u16,
    frames_per_chunk: usize,
    periods: u32,
    bytes_per_frame: usize,
    payload_bytes_per_frame: usize,
}

impl PcmParameters {
    pub fn new(
        device_name: impl Into<String>,
        sampling_rate: u32,
        channels: u16,
        bit_depth: u16,
        frames_per_chunk: usize,
        periods: u32,
    ) -> Result<Self, ConfigError> {
        if bit_depth == 0 || bit_depth % 8 != 0 {
            return Err(ConfigError::InvalidBitDepth(bit_depth));
        }
        if channels < 2 {
            // at least one audio channel plus the marker channel
            return Err(ConfigError::InvalidChannelCount(channels));
        }

        let bytes_per_sample = (bit_depth / 8) as usize;
        let bytes_per_frame = channels as usize * bytes_per_sample;
        let payload_bytes_per_frame = (channels as usize - 1) * bytes_per_sample;

        Ok(Self {
            device_name: device_name.into(),
            sampling_rate,
            channels,
            bit_depth,
            frames_per_chunk,
            periods,
            bytes_per_frame,
            payload_bytes_per_frame,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn sampling_rate(&self) -> u32 {
        self.sampling_rate
    }

    pub fn channels(&self) -> u16 {
        self.channels
    }

    /// Channel count after the marker channel is stripped, as exposed to clients.
    pub fn payload_channels(&self) -> u16 {
        self.channels - 1
    }

    pub fn bit_depth(&self) -> u16 {
        self.bit_depth
    }

    pub fn frames_per_chunk(&self) -> usize {
        self.frames_per_chunk
    }

    pub fn periods(&self) -> u32 {
        self.periods
    }

    pub fn bytes_per_frame(&self) -> usize {
        self.bytes_per_frame
    }

    pub fn payload_bytes_per_frame(&self) -> usize {
        self.payload_bytes_per_frame
    }

    /// Maximum size in bytes of a fully-filled `Chunk` for this format.
    pub fn chunk_capacity_bytes(&self) -> usize {
        self.frames_per_chunk * self.payload_bytes_per_frame
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derives_frame_widths() {
        let p = PcmParameters::new("default", 48000, 3, 16, 480, 2).unwrap();
        assert_eq!(p.bytes_per_frame(), 6);
        assert_eq!(p.payload_bytes_per_frame(), 4);
        assert_eq!(p.payload_channels(), 2);
        assert_eq!(p.chunk_capacity_bytes(), 480 * 4);
    }

    #[test]
    fn rejects_non_multiple_of_8_bit_depth() {
        assert!(PcmParameters::new("default", 48000, 3, 12, 480, 2).is_err());
    }
}
