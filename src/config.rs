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

use std::time::Duration;

use crate::frame::BlockSize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    /// Single file, no header, starts at block 1
    XModem,
    /// Batch of files, each preceded by a block 0 header
    YModem,
}

/// Timing and retry policy for one transfer session.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub protocol: Protocol,
    /// Preferred data block size. Checksum-mode sessions always use 128.
    pub block_size: BlockSize,
    /// How long to wait for each handshake byte.
    pub handshake_timeout: Duration,
    /// Handshake rounds before giving up with `NoResponse`.
    pub handshake_attempts: u32,
    /// Receiver sends `C` this many times before falling back to NAK.
    pub crc_attempts: u32,
    /// How long to wait for a block, or for the answer to one.
    pub block_timeout: Duration,
    /// Consecutive failures on one block before `TooManyRetries`.
    pub max_retries: u32,
    /// Times the sender repeats EOT waiting for its ACK.
    pub eot_retries: u32,
    /// Only treat CAN as a cancellation when a second CAN follows.
    pub confirm_cancel: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        TransferConfig {
            protocol: Protocol::YModem,
            block_size: BlockSize::OneK,
            handshake_timeout: Duration::from_secs(3),
            handshake_attempts: 10,
            crc_attempts: 5,
            block_timeout: Duration::from_secs(10),
            max_retries: 10,
            eot_retries: 5,
            confirm_cancel: false,
        }
    }
}

impl TransferConfig {
    pub fn xmodem() -> Self {
        TransferConfig {
            protocol: Protocol::XModem,
            block_size: BlockSize::Standard,
            ..TransferConfig::default()
        }
    }
}
