//! WAVE (RIFF) header emission for a streamed, unbounded-length PCM body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol_constants::{WAVE_DATA_SIZE_STREAMED, WAVE_FORMAT_PCM, WAVE_HEADER_SIZE};

/// Generates the 44-byte WAVE header for an infinite-length LPCM stream.
///
/// `channels` and `bits_per_sample` describe the payload *after* the marker
/// channel has been stripped (i.e. `PcmParameters::payload_channels()` /
/// `PcmParameters::bit_depth()`). The `data` chunk size is written as zero:
/// the stream has no known length and clients are expected to tolerate that.
pub fn create_wav_header(sample_rate: u32, channels: u16, bits_per_sample: u16) -> Bytes {
    let mut header = BytesMut::with_capacity(WAVE_HEADER_SIZE);

    let bytes_per_sample = bits_per_sample / 8;
    let byte_rate = sample_rate * channels as u32 * bytes_per_sample as u32;
    let block_align = channels * bytes_per_sample;

    header.put_slice(b"RIFF");
    header.put_u32_le(WAVE_DATA_SIZE_STREAMED); // overall file size: unknown, streamed
    header.put_slice(b"WAVE");

    header.put_slice(b"fmt ");
    header.put_u32_le(16); // fmt chunk size
    header.put_u16_le(WAVE_FORMAT_PCM);
    header.put_u16_le(channels);
    header.put_u32_le(sample_rate);
    header.put_u32_le(byte_rate);
    header.put_u16_le(block_align);
    header.put_u16_le(bits_per_sample);

    header.put_slice(b"data");
    header.put_u32_le(WAVE_DATA_SIZE_STREAMED);

    header.freeze()
}
