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

//! XMODEM / YMODEM protocol constants

/// Start of header - begins a 128-byte data block
pub const SOH: u8 = 0x01;

/// Start of text - begins a 1024-byte data block
pub const STX: u8 = 0x02;

/// End of transmission - sender has no more data for the current file
pub const EOT: u8 = 0x04;

/// Acknowledge - receiver accepted the block
pub const ACK: u8 = 0x06;

/// Negative acknowledge - retransmit, or request checksum mode during handshake
pub const NAK: u8 = 0x15;

/// Cancel - abort the session
pub const CAN: u8 = 0x18;

/// Receiver requests CRC-16 mode during handshake
pub const CRC_REQUEST: u8 = b'C';

/// Filler for the unused tail of the final data block
pub const PAD: u8 = 0x1A;

/// Filler for the unused tail of a YMODEM header block
pub const HEADER_PAD: u8 = 0x00;

/// Bytes written when a session is aborted
pub const ABORT_SEQUENCE: [u8; 2] = [CAN, CAN];
