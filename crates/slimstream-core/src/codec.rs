//! SlimProto wire format: the packed binary frames exchanged with playback
//! clients.
//!
//! Every frame on the wire is a 2-byte big-endian `size` prefix followed by
//! exactly `size` bytes of payload, fields packed without padding and
//! multi-byte integers in network byte order.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolDecodeError;
use crate::protocol_constants::{
    OPCODE_HELO, OPCODE_RESP, OPCODE_STAT, OPCODE_STRM, STREAM_PATH_PREFIX, STRM_AUTOSTART,
    STRM_CHANNELS_STEREO, STRM_ENDIANNESS_WAV, STRM_FIXED_PAYLOAD_SIZE, STRM_FORMAT_PCM,
    STRM_SAMPLE_SIZE_32,
};

/// `STRM` command selection (the single `command` byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandSelection {
    Start,
    Stop,
    Time,
}

impl CommandSelection {
    fn as_byte(self) -> u8 {
        match self {
            CommandSelection::Start => b's',
            CommandSelection::Stop => b'q',
            CommandSelection::Time => b't',
        }
    }

    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            b's' => Some(CommandSelection::Start),
            b'q' => Some(CommandSelection::Stop),
            b't' => Some(CommandSelection::Time),
            _ => None,
        }
    }
}

/// A fully decoded `STRM` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrmCommand {
    pub command: CommandSelection,
    /// Present only for `Start`.
    pub server_port: Option<u16>,
    /// Raw sample-rate byte as carried on the wire (ASCII-mapped).
    pub sample_rate_byte: u8,
    /// Present only for `Start`: `"GET /stream.pcm?player=<clientID>"`.
    pub http_header: Option<String>,
}

/// Maps a sampling rate in Hz to its single-byte SlimProto encoding.
/// Unsupported rates (including the still-unmapped 176400/192000 Hz) return
/// `None`, in which case negotiation must fail rather than encode `'?'`
/// silently past the caller.
pub fn map_sampling_rate(hz: u32) -> Option<u8> {
    Some(match hz {
        8000 => b'5',
        11025 => b'0',
        12000 => b'6',
        16000 => b'7',
        22500 => b'1',
        24000 => b'8',
        32000 => b'2',
        44100 => b'3',
        48000 => b'4',
        96000 => b'9',
        _ => return None,
    })
}

/// Inverse of [`map_sampling_rate`], for decoding/round-trip tests.
pub fn unmap_sampling_rate(byte: u8) -> Option<u32> {
    Some(match byte {
        b'5' => 8000,
        b'0' => 11025,
        b'6' => 12000,
        b'7' => 16000,
        b'1' => 22500,
        b'8' => 24000,
        b'2' => 32000,
        b'3' => 44100,
        b'4' => 48000,
        b'9' => 96000,
        _ => return None,
    })
}

/// Encodes a `STRM` command, including its 2-byte big-endian size prefix.
///
/// `sample_rate_byte` should come from [`map_sampling_rate`]; an unsupported
/// rate encodes as the literal `'?'` byte, matching the documented "fail
/// negotiation" behavior for unknown rates.
pub fn encode_strm(
    command: CommandSelection,
    server_port: u16,
    sample_rate_byte: u8,
    client_id: Option<&str>,
) -> Bytes {
    let http_header = if command == CommandSelection::Start {
        client_id.map(|id| format!("{STREAM_PATH_PREFIX}{id}"))
    } else {
        None
    };

    let header_len = http_header.as_ref().map(|h| h.len()).unwrap_or(0);
    let payload_size = STRM_FIXED_PAYLOAD_SIZE + header_len;

    let mut out = BytesMut::with_capacity(2 + payload_size);
    out.put_u16(payload_size as u16);

    out.put_slice(OPCODE_STRM);
    out.put_u8(command.as_byte());
    out.put_u8(STRM_AUTOSTART);
    out.put_u8(STRM_FORMAT_PCM);
    out.put_u8(STRM_SAMPLE_SIZE_32);
    out.put_u8(sample_rate_byte);
    out.put_u8(STRM_CHANNELS_STEREO);
    out.put_u8(STRM_ENDIANNESS_WAV);
    out.put_bytes(0, 10); // threshold .. slaves, reserved
    out.put_u32(0); // replayGain
    out.put_u16(if command == CommandSelection::Start {
        server_port
    } else {
        0
    });
    out.put_u32(0); // serverIP: 0 = same host as the control connection

    if let Some(header) = &http_header {
        out.put_slice(header.as_bytes());
    }

    out.freeze()
}

/// A decoded client-to-server frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Identifies the client; `client_id` is recovered from its MAC address
    /// as colon-separated uppercase hex octets (`"AA:BB:CC:DD:EE:FF"`).
    Helo { client_id: String },
    /// Periodic status; the body is opaque and only logged.
    Stat { body: Bytes },
    /// HTTP-headers echo; the body is opaque and only logged.
    Resp { body: Bytes },
}

/// Decodes one client-to-server frame from `buf`, consuming the bytes it
/// used on success. Returns `Incomplete` (without consuming anything) if
/// fewer bytes than the declared frame length have arrived yet.
pub fn decode(buf: &mut BytesMut) -> Result<Frame, ProtocolDecodeError> {
    if buf.len() < 2 {
        return Err(ProtocolDecodeError::Incomplete {
            needed: 2 - buf.len(),
        });
    }

    let declared_len = u16::from_be_bytes([buf[0], buf[1]]) as usize;
    if buf.len() < 2 + declared_len {
        return Err(ProtocolDecodeError::Incomplete {
            needed: 2 + declared_len - buf.len(),
        });
    }
    if declared_len < 4 {
        return Err(ProtocolDecodeError::Malformed {
            opcode: String::from("?"),
            reason: "frame shorter than a 4-byte opcode".into(),
        });
    }

    let opcode = [buf[2], buf[3], buf[4], buf[5]];
    let frame_end = 2 + declared_len;
    let body = Bytes::copy_from_slice(&buf[6..frame_end]);

    let frame = if &opcode == OPCODE_HELO {
        decode_helo(&body)?
    } else if &opcode == OPCODE_STAT {
        Frame::Stat { body }
    } else if &opcode == OPCODE_RESP {
        Frame::Resp { body }
    } else {
        return Err(ProtocolDecodeError::UnknownOpcode(opcode));
    };

    buf.advance(frame_end);
    Ok(frame)
}

/// Minimum HELO body length this decoder requires: device id (1) + firmware
/// revision (1) + 6-byte MAC address. Capability bytes beyond that are
/// accepted but not interpreted.
const HELO_MIN_BODY: usize = 8;

fn decode_helo(body: &Bytes) -> Result<Frame, ProtocolDecodeError> {
    if body.len() < HELO_MIN_BODY {
        return Err(ProtocolDecodeError::Malformed {
            opcode: "HELO".into(),
            reason: format!(
                "body too short: got {} bytes, need at least {}",
                body.len(),
                HELO_MIN_BODY
            ),
        });
    }

    let mac = &body[2..8];
    let client_id = mac
        .iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":");

    Ok(Frame::Helo { client_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_rate_mapping_round_trips_for_every_supported_hz() {
        for hz in [
            8000u32, 11025, 12000, 16000, 22500, 24000, 32000, 44100, 48000, 96000,
        ] {
            let byte = map_sampling_rate(hz).unwrap_or_else(|| panic!("{hz} should be supported"));
            assert_eq!(unmap_sampling_rate(byte), Some(hz));
        }
    }

    #[test]
    fn unsupported_sample_rate_has_no_mapping() {
        assert_eq!(map_sampling_rate(176400), None);
        assert_eq!(map_sampling_rate(192000), None);
        assert_eq!(map_sampling_rate(1), None);
    }

    #[test]
    fn strm_start_size_includes_header_and_client_id() {
        let encoded = encode_strm(CommandSelection::Start, 9000, b'4', Some("AA:BB:CC:DD:EE:FF"));
        let declared_len = u16::from_be_bytes([encoded[0], encoded[1]]) as usize;
        let expected_header_len = STREAM_PATH_PREFIX.len() + "AA:BB:CC:DD:EE:FF".len();
        assert_eq!(declared_len, STRM_FIXED_PAYLOAD_SIZE + expected_header_len);
        assert_eq!(&encoded[2..6], OPCODE_STRM);
        assert_eq!(encoded[6], b's');

        let header_start = 2 + STRM_FIXED_PAYLOAD_SIZE;
        assert_eq!(
            &encoded[header_start..],
            format!("{STREAM_PATH_PREFIX}AA:BB:CC:DD:EE:FF").as_bytes()
        );
    }

    #[test]
    fn strm_stop_and_time_have_no_http_header() {
        for command in [CommandSelection::Stop, CommandSelection::Time] {
            let encoded = encode_strm(command, 0, b'4', None);
            let declared_len = u16::from_be_bytes([encoded[0], encoded[1]]) as usize;
            assert_eq!(declared_len, STRM_FIXED_PAYLOAD_SIZE);
            assert_eq!(encoded.len(), 2 + STRM_FIXED_PAYLOAD_SIZE);
        }
    }

    #[test]
    fn server_port_is_network_order_and_only_set_for_start() {
        let encoded = encode_strm(CommandSelection::Start, 9000, b'4', Some("x"));
        let port_offset = 2 + 11 + 10 + 4; // size + (opcode..endianness) + reserved + replayGain
        let port = u16::from_be_bytes([encoded[port_offset], encoded[port_offset + 1]]);
        assert_eq!(port, 9000);

        let stop_encoded = encode_strm(CommandSelection::Stop, 9000, b'4', None);
        let port = u16::from_be_bytes([stop_encoded[port_offset], stop_encoded[port_offset + 1]]);
        assert_eq!(port, 0);
    }

    #[test]
    fn decodes_helo_client_id_from_mac() {
        let mut buf = BytesMut::new();
        buf.put_u16(10); // declared length: opcode(4) + device(1) + rev(1) + mac(6) - wait sized below
        buf.put_slice(OPCODE_HELO);
        buf.put_u8(0); // device id
        buf.put_u8(1); // firmware revision
        buf.put_slice(&[0xAA, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF]);

        // fix up the declared length to match what's actually buffered after opcode
        let actual_len = (buf.len() - 2) as u16;
        buf[0] = (actual_len >> 8) as u8;
        buf[1] = (actual_len & 0xFF) as u8;

        let frame = decode(&mut buf).expect("decodes cleanly");
        assert_eq!(
            frame,
            Frame::Helo {
                client_id: "AA:BB:CC:DD:EE:FF".to_string()
            }
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_frame_does_not_consume_buffer() {
        let mut buf = BytesMut::new();
        buf.put_u16(20);
        buf.put_slice(OPCODE_HELO);

        let err = decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolDecodeError::Incomplete { .. }));
        assert_eq!(buf.len(), 6);
    }

    #[test]
    fn unknown_opcode_is_reported() {
        let mut buf = BytesMut::new();
        buf.put_u16(4);
        buf.put_slice(b"xxxx");

        let err = decode(&mut buf).unwrap_err();
        assert!(matches!(err, ProtocolDecodeError::UnknownOpcode(op) if &op == b"xxxx"));
    }

    #[test]
    fn stat_and_resp_carry_opaque_bodies() {
        let mut buf = BytesMut::new();
        buf.put_u16(4 + 3);
        buf.put_slice(OPCODE_STAT);
        buf.put_slice(b"abc");

        let frame = decode(&mut buf).unwrap();
        assert_eq!(
            frame,
            Frame::Stat {
                body: Bytes::from_static(b"abc")
            }
        );
    }
}
