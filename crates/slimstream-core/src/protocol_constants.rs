//! Fixed protocol constants that should NOT be changed.
//!
//! These values are defined by the SlimProto wire format and the WAVE/RIFF
//! container format; changing them would break compatibility with playback
//! clients.

// ─────────────────────────────────────────────────────────────────────────────
// SlimProto opcodes
// ─────────────────────────────────────────────────────────────────────────────

/// Server-to-client streaming command opcode.
pub const OPCODE_STRM: &[u8; 4] = b"strm";

/// Client-to-server hello opcode.
pub const OPCODE_HELO: &[u8; 4] = b"HELO";

/// Client-to-server periodic status opcode.
pub const OPCODE_STAT: &[u8; 4] = b"STAT";

/// Client-to-server HTTP-headers-echo opcode.
pub const OPCODE_RESP: &[u8; 4] = b"RESP";

// ─────────────────────────────────────────────────────────────────────────────
// STRM frame layout
// ─────────────────────────────────────────────────────────────────────────────

/// Size of the fixed-layout STRM payload, excluding the variable `httpHeader`
/// trailer and the 2-byte size prefix: opcode(4) + command..endianness(7) +
/// reserved threshold..slaves(10) + replayGain(4) + serverPort(2) +
/// serverIP(4) = 31 bytes, matching the field-offset table byte-for-byte.
pub const STRM_FIXED_PAYLOAD_SIZE: usize = 31;

/// `autostart` field value: always on.
pub const STRM_AUTOSTART: u8 = b'1';

/// `format` field value: PCM.
pub const STRM_FORMAT_PCM: u8 = b'p';

/// `sampleSize` field value: 32 bits per sample.
pub const STRM_SAMPLE_SIZE_32: u8 = b'3';

/// `channels` field value: stereo.
pub const STRM_CHANNELS_STEREO: u8 = b'2';

/// `endianness` field value: WAV (little-endian).
pub const STRM_ENDIANNESS_WAV: u8 = b'1';

/// Fixed path prefix of the streaming-session URL placed in `httpHeader`.
pub const STREAM_PATH_PREFIX: &str = "GET /stream.pcm?player=";

// ─────────────────────────────────────────────────────────────────────────────
// WAVE / RIFF container
// ─────────────────────────────────────────────────────────────────────────────

/// PCM format tag stored in the `fmt ` chunk.
pub const WAVE_FORMAT_PCM: u16 = 0x0001;

/// Size in bytes of a generated WAVE header (RIFF + fmt + data chunk headers).
pub const WAVE_HEADER_SIZE: usize = 44;

/// `data` chunk size written in streamed WAVE headers: the stream has no
/// known length, and clients are expected to tolerate this.
pub const WAVE_DATA_SIZE_STREAMED: u32 = 0;

// ─────────────────────────────────────────────────────────────────────────────
// HTTP streaming response head
// ─────────────────────────────────────────────────────────────────────────────

/// Server identification string sent in the streaming response's `Server:` header.
pub const SERVER_NAME: &str = "SlimStreamer";
