//! # Frame Codec
//!
//! Purpose: Turn packets into length-prefixed frames and back, parse the
//! fixed-size server greeting, and compute the `chap-sha1` scramble.
//!
//! ## Design Principles
//!
//! 1. **Incremental Decoding**: `PacketDecoder::decode` consumes from a
//!    `BytesMut` and returns `Ok(None)` until a whole frame is buffered, the
//!    same loop shape a socket reader already has.
//! 2. **Raw Bytes Kept**: Each decoded packet keeps its frame bytes so
//!    unmatched responses can be handed to observers untouched.
//! 3. **Fixed Prefix On Encode**: Frames are always written with the 5-byte
//!    `uint32` prefix; every prefix width is accepted on decode.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use rmpv::decode::read_value;
use rmpv::encode::write_value;
use sha1::{Digest, Sha1};

use crate::error::{ProtocolError, ProtocolResult};
use crate::protocol::{Body, Header, Packet};

/// Size of the server greeting in bytes.
pub const GREETING_SIZE: usize = 128;

/// Bytes of the salt used by `chap-sha1`.
pub const SCRAMBLE_SIZE: usize = 20;

/// Default upper bound for one frame.
pub const DEFAULT_MAX_FRAME: usize = 64 * 1024 * 1024;

/// Encodes a packet as one frame appended to `out`.
pub fn encode_packet(packet: &Packet, out: &mut BytesMut) -> ProtocolResult<()> {
    let mut payload = Vec::with_capacity(64);
    write_value(&mut payload, &packet.header.to_value())
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    write_value(&mut payload, &packet.body.to_value())
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;

    let len = u32::try_from(payload.len()).map_err(|_| ProtocolError::FrameTooLarge {
        len: payload.len(),
        limit: u32::MAX as usize,
    })?;
    out.reserve(5 + payload.len());
    out.put_u8(0xce);
    out.put_u32(len);
    out.extend_from_slice(&payload);
    Ok(())
}

/// Encodes a packet into a standalone frame.
pub fn encode_frame(header: Header, body: Body) -> ProtocolResult<Bytes> {
    let mut out = BytesMut::new();
    encode_packet(&Packet::new(header, body), &mut out)?;
    Ok(out.freeze())
}

/// A decoded packet together with its frame payload.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// Frame payload (header and body), without the length prefix.
    pub bytes: Bytes,
    pub packet: Packet,
}

/// Incremental frame decoder.
#[derive(Debug, Clone)]
pub struct PacketDecoder {
    max_frame: usize,
}

impl Default for PacketDecoder {
    fn default() -> Self {
        PacketDecoder::new()
    }
}

impl PacketDecoder {
    pub fn new() -> Self {
        PacketDecoder {
            max_frame: DEFAULT_MAX_FRAME,
        }
    }

    pub fn with_max_frame(max_frame: usize) -> Self {
        PacketDecoder { max_frame }
    }

    /// Decodes one packet if a complete frame is buffered.
    ///
    /// **Input**: read buffer; consumed bytes are removed on success.
    /// **Output**: `Ok(Some)` for a packet, `Ok(None)` when more bytes are
    /// needed, `Err` when the stream is not a valid frame sequence.
    pub fn decode(&mut self, buf: &mut BytesMut) -> ProtocolResult<Option<RawPacket>> {
        let Some((prefix_len, frame_len)) = read_length_prefix(&buf[..])? else {
            return Ok(None);
        };
        if frame_len > self.max_frame {
            return Err(ProtocolError::FrameTooLarge {
                len: frame_len,
                limit: self.max_frame,
            });
        }
        if buf.len() < prefix_len + frame_len {
            buf.reserve(prefix_len + frame_len - buf.len());
            return Ok(None);
        }

        buf.advance(prefix_len);
        let bytes = buf.split_to(frame_len).freeze();
        let packet = decode_payload(&bytes)?;
        Ok(Some(RawPacket { bytes, packet }))
    }
}

/// Reads a msgpack unsigned length prefix: `(prefix bytes, frame length)`.
fn read_length_prefix(buf: &[u8]) -> ProtocolResult<Option<(usize, usize)>> {
    let Some(&marker) = buf.first() else {
        return Ok(None);
    };
    let width = match marker {
        0x00..=0x7f => return Ok(Some((1, marker as usize))),
        0xcc => 1,
        0xcd => 2,
        0xce => 4,
        0xcf => 8,
        other => return Err(ProtocolError::InvalidLengthPrefix(other)),
    };
    if buf.len() < 1 + width {
        return Ok(None);
    }
    let mut len: u64 = 0;
    for byte in &buf[1..1 + width] {
        len = (len << 8) | *byte as u64;
    }
    Ok(Some((1 + width, len as usize)))
}

/// Decodes a frame payload (header map followed by an optional body map).
pub fn decode_payload(frame: &[u8]) -> ProtocolResult<Packet> {
    let mut cursor = frame;
    let header = Header::from_value(read_value(&mut cursor)?)?;
    let body = if cursor.is_empty() {
        Body::new()
    } else {
        Body::from_value(read_value(&mut cursor)?)?
    };
    Ok(Packet::new(header, body))
}

/// Parsed server greeting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Greeting {
    /// First line, trimmed, e.g. `Tarantool 3.1.0 (Binary) <uuid>`.
    pub server: String,
    /// Decoded salt; only the first `SCRAMBLE_SIZE` bytes are used.
    pub salt: Vec<u8>,
}

impl Greeting {
    /// Parses the 128-byte greeting.
    pub fn parse(raw: &[u8]) -> ProtocolResult<Self> {
        if raw.len() < GREETING_SIZE {
            return Err(ProtocolError::Greeting("greeting is shorter than 128 bytes"));
        }
        let (line1, line2) = raw[..GREETING_SIZE].split_at(GREETING_SIZE / 2);
        let server = std::str::from_utf8(line1)
            .map_err(|_| ProtocolError::Greeting("server line is not utf-8"))?
            .trim_end_matches(['\0', ' ', '\n'])
            .to_string();
        if !server.starts_with("Tarantool") {
            return Err(ProtocolError::Greeting("unexpected server banner"));
        }
        let encoded = std::str::from_utf8(line2)
            .map_err(|_| ProtocolError::Greeting("salt line is not utf-8"))?
            .trim_end_matches(['\0', ' ', '\n']);
        let salt = STANDARD
            .decode(encoded)
            .map_err(|_| ProtocolError::Greeting("salt is not base64"))?;
        if salt.len() < SCRAMBLE_SIZE {
            return Err(ProtocolError::Greeting("salt is too short"));
        }
        Ok(Greeting { server, salt })
    }

    /// Renders a greeting in wire form (two space-padded 64-byte lines).
    pub fn encode(&self) -> [u8; GREETING_SIZE] {
        let mut out = [b' '; GREETING_SIZE];
        write_line(&mut out[..GREETING_SIZE / 2], self.server.as_bytes());
        write_line(&mut out[GREETING_SIZE / 2..], STANDARD.encode(&self.salt).as_bytes());
        out
    }
}

fn write_line(line: &mut [u8], text: &[u8]) {
    let len = text.len().min(line.len() - 1);
    line[..len].copy_from_slice(&text[..len]);
    let last = line.len() - 1;
    line[last] = b'\n';
}

/// Computes the `chap-sha1` scramble for a password and greeting salt.
///
/// **Logic**: `sha1(pw) XOR sha1(salt[..20] ‖ sha1(sha1(pw)))`.
pub fn chap_sha1_scramble(salt: &[u8], password: &str) -> [u8; SCRAMBLE_SIZE] {
    let step1 = Sha1::digest(password.as_bytes());
    let step2 = Sha1::digest(step1);

    let mut hasher = Sha1::new();
    hasher.update(&salt[..salt.len().min(SCRAMBLE_SIZE)]);
    hasher.update(step2);
    let step3 = hasher.finalize();

    let mut scramble = [0u8; SCRAMBLE_SIZE];
    for (i, byte) in scramble.iter_mut().enumerate() {
        *byte = step1[i] ^ step3[i];
    }
    scramble
}
