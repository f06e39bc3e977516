use bytes::{Buf, BytesMut};
use tokio_util::codec::Decoder;
use zerocopy::byteorder::{big_endian::U64 as U64BE, little_endian::U32 as U32LE};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::constant::MAX_FRAME_LENGTH;
use crate::error::{Error, Result};

pub const FRAME_HEADER_LEN: usize = 12;

/// Query frame header (zero-copy)
///
/// Layout matches the post-handshake wire protocol:
/// - token: 8 bytes, big-endian when encoded from the counter; opaque to the
///   server and echoed verbatim on the response
/// - length: 4 bytes (little-endian, payload length)
///
/// The asymmetric byte order is part of the wire contract.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, KnownLayout, Immutable, IntoBytes)]
pub struct FrameHeader {
    token: U64BE,
    length: U32LE,
}

impl FrameHeader {
    pub fn encode(token: u64, length: usize) -> Self {
        Self {
            token: U64BE::new(token),
            length: U32LE::new(length as u32),
        }
    }

    pub fn token(&self) -> u64 {
        self.token.get()
    }

    pub fn length(&self) -> usize {
        self.length.get() as usize
    }
}

/// Frame decoder implementing tokio_util::Decoder
///
/// Reentrant on partial data: a chunk may carry any mix of partial headers,
/// whole frames, and partial payloads; residue stays in `src` between calls.
pub struct FrameDecoder {
    state: DecoderState,
}

enum DecoderState {
    ReadingHeader,
    ReadingPayload { token: u64, length: usize },
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            state: DecoderState::ReadingHeader,
        }
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameDecoder {
    type Item = (u64, BytesMut);
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        loop {
            match self.state {
                DecoderState::ReadingHeader => {
                    if src.len() < FRAME_HEADER_LEN {
                        return Ok(None);
                    }

                    let header = FrameHeader::read_from_bytes(&src[..FRAME_HEADER_LEN])
                        .map_err(Error::from_debug)?;
                    src.advance(FRAME_HEADER_LEN);

                    if header.length() > MAX_FRAME_LENGTH {
                        return Err(Error::Protocol(format!(
                            "declared frame length {} exceeds the {} byte bound",
                            header.length(),
                            MAX_FRAME_LENGTH
                        )));
                    }

                    self.state = DecoderState::ReadingPayload {
                        token: header.token(),
                        length: header.length(),
                    };
                }
                DecoderState::ReadingPayload { token, length } => {
                    if src.len() < length {
                        src.reserve(length - src.len());
                        return Ok(None);
                    }

                    let payload = src.split_to(length);

                    self.state = DecoderState::ReadingHeader;

                    return Ok(Some((token, payload)));
                }
            }
        }
    }
}

/// Helper function to write a frame header
#[inline]
pub fn write_frame_header(out: &mut Vec<u8>, token: u64, payload_length: usize) {
    out.extend_from_slice(FrameHeader::encode(token, payload_length).as_bytes());
}

/// Assemble a complete outbound frame.
pub fn encode_frame(token: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    write_frame_header(&mut out, token, payload.len());
    out.extend_from_slice(payload);
    out
}

/// Header for a spliced frame: the length field is the sum of the wrapper
/// pieces and the raw document, so the raw bytes are never re-parsed. The
/// caller emits `header ‖ prefix ‖ raw ‖ suffix` as a gathered write.
pub fn spliced_frame_header(
    token: u64,
    prefix: &[u8],
    raw: &[u8],
    suffix: &[u8],
) -> [u8; FRAME_HEADER_LEN] {
    let header = FrameHeader::encode(token, prefix.len() + raw.len() + suffix.len());
    let mut out = [0u8; FRAME_HEADER_LEN];
    out.copy_from_slice(header.as_bytes());
    out
}
