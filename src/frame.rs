// Copyright (C) 2026 Brian Johnson
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Frame codec for XMODEM / YMODEM blocks.
//!
//! Wire format of a data block:
//! ```text
//! ┌────────────┬───────┬──────────┬─────────────────┬──────────────────┐
//! │ SOH / STX  │ block │ 255-block│ payload         │ sum (1B) or      │
//! │ (1B)       │ (1B)  │ (1B)     │ (128 or 1024B)  │ CRC-16 (2B, BE)  │
//! └────────────┴───────┴──────────┴─────────────────┴──────────────────┘
//! ```
//! Control frames (EOT, ACK, NAK, CAN, `C`) are a single byte.

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::DecodeError;
use crate::protocol::*;

// ============================================================================
// Modes and sizes
// ============================================================================

/// Integrity check negotiated during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// Legacy 1-byte arithmetic sum
    Checksum,
    /// CRC-16-CCITT, polynomial 0x1021, initial value 0
    Crc16,
}

impl ChecksumMode {
    /// Number of trailer bytes following the payload.
    pub fn trailer_len(self) -> usize {
        match self {
            ChecksumMode::Checksum => 1,
            ChecksumMode::Crc16 => 2,
        }
    }

    /// Byte a receiver sends to request this mode.
    pub fn request_byte(self) -> u8 {
        match self {
            ChecksumMode::Checksum => NAK,
            ChecksumMode::Crc16 => CRC_REQUEST,
        }
    }

    /// Mode selected by a receiver's handshake byte, if it is one.
    pub fn from_request(byte: u8) -> Option<Self> {
        match byte {
            NAK => Some(ChecksumMode::Checksum),
            CRC_REQUEST => Some(ChecksumMode::Crc16),
            _ => None,
        }
    }
}

/// Payload size of a data block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockSize {
    /// 128 bytes, introduced by SOH
    Standard,
    /// 1024 bytes, introduced by STX
    OneK,
}

impl BlockSize {
    pub fn len(self) -> usize {
        match self {
            BlockSize::Standard => 128,
            BlockSize::OneK => 1024,
        }
    }

    pub fn kind(self) -> FrameKind {
        match self {
            BlockSize::Standard => FrameKind::Soh,
            BlockSize::OneK => FrameKind::Stx,
        }
    }

    /// Smallest block that holds `len` bytes, if any does.
    pub fn fitting(len: usize) -> Option<Self> {
        if len <= BlockSize::Standard.len() {
            Some(BlockSize::Standard)
        } else if len <= BlockSize::OneK.len() {
            Some(BlockSize::OneK)
        } else {
            None
        }
    }
}

// ============================================================================
// Frame
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Soh,
    Stx,
    Eot,
    Ack,
    Nak,
    Can,
    Crc,
}

impl FrameKind {
    pub fn as_byte(self) -> u8 {
        match self {
            FrameKind::Soh => SOH,
            FrameKind::Stx => STX,
            FrameKind::Eot => EOT,
            FrameKind::Ack => ACK,
            FrameKind::Nak => NAK,
            FrameKind::Can => CAN,
            FrameKind::Crc => CRC_REQUEST,
        }
    }

    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            SOH => Some(FrameKind::Soh),
            STX => Some(FrameKind::Stx),
            EOT => Some(FrameKind::Eot),
            ACK => Some(FrameKind::Ack),
            NAK => Some(FrameKind::Nak),
            CAN => Some(FrameKind::Can),
            CRC_REQUEST => Some(FrameKind::Crc),
            _ => None,
        }
    }

    /// Payload size carried by this kind, `None` for control frames.
    pub fn block_size(self) -> Option<BlockSize> {
        match self {
            FrameKind::Soh => Some(BlockSize::Standard),
            FrameKind::Stx => Some(BlockSize::OneK),
            _ => None,
        }
    }
}

/// One protocol unit.
///
/// The checksum is not stored; it is derived from the payload by the codec
/// on encode and verified on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub kind: FrameKind,
    pub block: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn control(kind: FrameKind) -> Self {
        Frame {
            kind,
            block: 0,
            payload: Bytes::new(),
        }
    }

    /// Data block carrying `data`, padded with `pad` up to `size`.
    ///
    /// `data` longer than the block is cut to fit.
    pub fn data(block: u8, size: BlockSize, data: &[u8], pad: u8) -> Self {
        let len = size.len();
        let used = data.len().min(len);
        let mut payload = BytesMut::with_capacity(len);
        payload.put_slice(&data[..used]);
        payload.put_bytes(pad, len - used);

        Frame {
            kind: size.kind(),
            block,
            payload: payload.freeze(),
        }
    }

    pub fn is_data(&self) -> bool {
        self.kind.block_size().is_some()
    }
}

// ============================================================================
// Integrity checks
// ============================================================================

/// Arithmetic sum of `data` modulo 256.
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

const XMODEM_CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&crc::CRC_16_XMODEM);

/// CRC-16-CCITT as used by XMODEM (poly 0x1021, init 0, no reflection).
pub fn crc16(data: &[u8]) -> u16 {
    XMODEM_CRC.checksum(data)
}

// ============================================================================
// Codec
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    mode: ChecksumMode,
}

impl FrameCodec {
    pub fn new(mode: ChecksumMode) -> Self {
        FrameCodec { mode }
    }

    pub fn mode(&self) -> ChecksumMode {
        self.mode
    }

    /// Total wire length of a data block of `size`.
    pub fn frame_len(&self, size: BlockSize) -> usize {
        3 + size.len() + self.mode.trailer_len()
    }

    pub fn encode(&self, frame: &Frame) -> Bytes {
        let mut dst = BytesMut::new();
        self.encode_into(frame, &mut dst);
        dst.freeze()
    }

    pub fn encode_into(&self, frame: &Frame, dst: &mut BytesMut) {
        if !frame.is_data() {
            dst.put_u8(frame.kind.as_byte());
            return;
        }

        dst.reserve(3 + frame.payload.len() + self.mode.trailer_len());
        dst.put_u8(frame.kind.as_byte());
        dst.put_u8(frame.block);
        dst.put_u8(!frame.block);
        dst.put_slice(&frame.payload);

        match self.mode {
            ChecksumMode::Checksum => dst.put_u8(checksum(&frame.payload)),
            ChecksumMode::Crc16 => dst.put_u16(crc16(&frame.payload)),
        }
    }

    /// Decode exactly one frame from `src`.
    ///
    /// `src` must hold the whole frame and nothing else.
    pub fn decode(&self, src: &[u8]) -> Result<Frame, DecodeError> {
        let Some(&first) = src.first() else {
            return Err(DecodeError::Malformed("empty frame"));
        };

        let kind = FrameKind::from_byte(first).ok_or(DecodeError::Malformed("unknown frame type"))?;

        let Some(size) = kind.block_size() else {
            if src.len() != 1 {
                return Err(DecodeError::Malformed("trailing bytes after control frame"));
            }
            return Ok(Frame::control(kind));
        };

        if src.len() != self.frame_len(size) {
            return Err(DecodeError::Malformed("wrong frame length"));
        }

        let block = src[1];
        if src[2] != !block {
            return Err(DecodeError::Malformed("block number complement mismatch"));
        }

        let payload_end = 3 + size.len();
        let payload = &src[3..payload_end];
        let trailer = &src[payload_end..];

        let (expected, received) = match self.mode {
            ChecksumMode::Checksum => (checksum(payload) as u16, trailer[0] as u16),
            ChecksumMode::Crc16 => (crc16(payload), u16::from_be_bytes([trailer[0], trailer[1]])),
        };

        if expected != received {
            return Err(DecodeError::ChecksumMismatch { expected, received });
        }

        Ok(Frame {
            kind,
            block,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Hex dump of an encoded frame for trace logging.
pub fn hex_dump(bytes: &[u8]) -> String {
    let mut out = String::new();
    for (row, chunk) in bytes.chunks(16).enumerate() {
        out.push_str(&format!("\n  {:04x} ", row * 16));
        for b in chunk {
            out.push_str(&format!(" {:02x}", b));
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str("  ");
        out.extend(chunk.iter().map(|&b| if (0x20..0x7f).contains(&b) { b as char } else { '.' }));
    }
    out
}

// ============================================================================
// Tests
// ============================================================================
