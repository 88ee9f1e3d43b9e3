//! Frame codec for the camera wire protocol.
//!
//! Every exchange with the camera is a variable-length frame:
//!
//! ```text
//! offset  size  field
//!      0     1  SOF (0xAA)
//!      1     2  VerLen: low 10 bits total length, high 6 bits version
//!      3     1  CmdType
//!      4     1  Enc (0, reserved)
//!      5     3  Res (0, reserved)
//!      8     2  Seq
//!     10     2  CRC-16 over bytes [0..10)
//!     12     1  CmdSet
//!     13     1  CmdId
//!     14     N  payload
//!   14+N     4  CRC-32 over bytes [0..14+N)
//! ```
//!
//! Multi-byte integers are little-endian. The decoder accepts any frame
//! that passes the SOF, length, and CRC checks regardless of CmdType; the
//! data segment (CmdSet, CmdId, payload) is returned as a borrowed view.

use bytes::BufMut;
use thiserror::Error;

use crate::crc::{crc16, crc32};

/// Start-of-frame marker.
pub const SOF: u8 = 0xAA;

/// Largest total frame length representable in the 10-bit VerLen field.
pub const MAX_FRAME_LEN: usize = 0x03FF;

/// Smallest frame the decoder accepts: header prefix, CRC-16, CRC-32, with
/// an empty data segment. Such frames carry no CmdSet/CmdId and are dropped
/// by the notification ingress.
pub const MIN_FRAME_LEN: usize = 16;

/// Fixed bytes around the payload: 12-byte header prefix, CmdSet, CmdId,
/// and the trailing CRC-32.
pub const ENVELOPE_LEN: usize = 18;

/// Largest payload that still fits the 10-bit total length.
pub const MAX_PAYLOAD_LEN: usize = MAX_FRAME_LEN - ENVELOPE_LEN;

/// Bit in the CmdType byte that marks a response (ack) frame.
pub const RESPONSE_FLAG: u8 = 0x20;

/// Whether a raw CmdType byte names a response frame.
pub fn is_response(cmd_type: u8) -> bool {
    cmd_type & RESPONSE_FLAG != 0
}

/// Frame direction and reply policy, as carried in the CmdType byte.
///
/// Bit 5 distinguishes command from response frames; the low two bits say
/// whether the peer is expected to answer and whether a missing answer is
/// an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmdType {
    /// Command frame, no reply expected.
    CmdNoResponse,
    /// Command frame, reply welcome but its absence is not an error.
    CmdResponseOrNot,
    /// Command frame, reply required; absence is an error.
    CmdWaitResult,
    /// Response frame, no further reply expected.
    AckNoResponse,
    /// Response frame, reply optional.
    AckResponseOrNot,
    /// Response frame, reply required.
    AckWaitResult,
}

/// What the sender of a frame expects back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplyPolicy {
    None,
    Optional,
    Required,
}

impl CmdType {
    pub fn raw(self) -> u8 {
        match self {
            CmdType::CmdNoResponse => 0x00,
            CmdType::CmdResponseOrNot => 0x01,
            CmdType::CmdWaitResult => 0x02,
            CmdType::AckNoResponse => 0x20,
            CmdType::AckResponseOrNot => 0x21,
            CmdType::AckWaitResult => 0x22,
        }
    }

    pub fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0x00 => Some(CmdType::CmdNoResponse),
            0x01 => Some(CmdType::CmdResponseOrNot),
            0x02 => Some(CmdType::CmdWaitResult),
            0x20 => Some(CmdType::AckNoResponse),
            0x21 => Some(CmdType::AckResponseOrNot),
            0x22 => Some(CmdType::AckWaitResult),
            _ => None,
        }
    }

    pub fn is_ack(self) -> bool {
        is_response(self.raw())
    }

    pub fn reply(self) -> ReplyPolicy {
        match self.raw() & 0x03 {
            0x00 => ReplyPolicy::None,
            0x01 => ReplyPolicy::Optional,
            _ => ReplyPolicy::Required,
        }
    }
}

/// Frame codec failures. The decode variants are distinct so callers can
/// tell transport corruption apart from framing mistakes.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("frame of {len} bytes is shorter than the {MIN_FRAME_LEN}-byte minimum")]
    TooShort { len: usize },
    #[error("bad start-of-frame byte {sof:#04x}")]
    BadSof { sof: u8 },
    #[error("declared length {declared} does not match received length {received}")]
    LengthMismatch { declared: usize, received: usize },
    #[error("CRC-16 mismatch: received {received:#06x}, calculated {calculated:#06x}")]
    BadCrc16 { received: u16, calculated: u16 },
    #[error("CRC-32 mismatch: received {received:#010x}, calculated {calculated:#010x}")]
    BadCrc32 { received: u32, calculated: u32 },
    #[error("frame of {len} bytes exceeds the 10-bit length field")]
    FrameTooLong { len: usize },
}

/// A decoded frame borrowing the data segment from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawFrame<'a> {
    /// Protocol version from the high six VerLen bits.
    pub version: u8,
    /// CmdType byte as received. Any value passes the codec.
    pub cmd_type: u8,
    /// Sequence number chosen by the frame's sender.
    pub seq: u16,
    data: &'a [u8],
}

impl<'a> RawFrame<'a> {
    /// The whole data segment: CmdSet, CmdId, payload.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// `(cmd_set, cmd_id)` when the data segment carries them.
    pub fn command(&self) -> Option<(u8, u8)> {
        (self.data.len() >= 2).then(|| (self.data[0], self.data[1]))
    }

    /// Payload bytes after CmdId; empty when the data segment is empty.
    pub fn payload(&self) -> &'a [u8] {
        if self.data.len() >= 2 { &self.data[2..] } else { &[] }
    }
}

/// Encode a frame around an already-serialized payload body.
pub fn encode(
    cmd_set: u8,
    cmd_id: u8,
    cmd_type: CmdType,
    seq: u16,
    payload: &[u8],
) -> Result<Vec<u8>, CodecError> {
    let total = ENVELOPE_LEN + payload.len();
    if total > MAX_FRAME_LEN {
        return Err(CodecError::FrameTooLong { len: total });
    }

    let mut frame = Vec::with_capacity(total);
    frame.put_u8(SOF);
    // Version 0 occupies the high six bits; the length is known to fit.
    frame.put_u16_le(total as u16 & 0x03FF);
    frame.put_u8(cmd_type.raw());
    frame.put_u8(0x00); // Enc
    frame.put_bytes(0x00, 3); // Res
    frame.put_u16_le(seq);
    let header_crc = crc16(&frame);
    frame.put_u16_le(header_crc);
    frame.put_u8(cmd_set);
    frame.put_u8(cmd_id);
    frame.extend_from_slice(payload);
    let frame_crc = crc32(&frame);
    frame.put_u32_le(frame_crc);
    Ok(frame)
}

/// Decode and validate a frame, returning a borrowed view of its fields.
pub fn decode(frame: &[u8]) -> Result<RawFrame<'_>, CodecError> {
    if frame.len() < MIN_FRAME_LEN {
        return Err(CodecError::TooShort { len: frame.len() });
    }
    if frame[0] != SOF {
        return Err(CodecError::BadSof { sof: frame[0] });
    }

    let ver_len = u16::from_le_bytes([frame[1], frame[2]]);
    let declared = (ver_len & 0x03FF) as usize;
    let version = (ver_len >> 10) as u8;
    if declared != frame.len() {
        return Err(CodecError::LengthMismatch {
            declared,
            received: frame.len(),
        });
    }

    let received16 = u16::from_le_bytes([frame[10], frame[11]]);
    let calculated16 = crc16(&frame[..10]);
    if received16 != calculated16 {
        return Err(CodecError::BadCrc16 {
            received: received16,
            calculated: calculated16,
        });
    }

    let tail = frame.len() - 4;
    let received32 = u32::from_le_bytes([frame[tail], frame[tail + 1], frame[tail + 2], frame[tail + 3]]);
    let calculated32 = crc32(&frame[..tail]);
    if received32 != calculated32 {
        return Err(CodecError::BadCrc32 {
            received: received32,
            calculated: calculated32,
        });
    }

    Ok(RawFrame {
        version,
        cmd_type: frame[3],
        seq: u16::from_le_bytes([frame[8], frame[9]]),
        data: &frame[12..tail],
    })
}
