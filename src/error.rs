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

use std::fmt;

/// Who asked for a session to be cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOrigin {
    /// The local caller tripped the session's cancel token.
    Local,
    /// The remote side sent CAN.
    Peer,
}

impl fmt::Display for CancelOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CancelOrigin::Local => write!(f, "locally"),
            CancelOrigin::Peer => write!(f, "by peer"),
        }
    }
}

/// Reasons a received frame is rejected by the codec.
///
/// These never leave the state machine on their own; the receiver answers
/// them with NAK and only escalates once the retry budget is spent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("checksum mismatch (expected 0x{expected:04X}, received 0x{received:04X})")]
    ChecksumMismatch { expected: u16, received: u16 },

    #[error("malformed frame: {0}")]
    Malformed(&'static str),
}

/// Terminal failure of a transfer session.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The peer never answered the handshake.
    #[error("no response from peer")]
    NoResponse,

    /// The same block failed too many times in a row.
    #[error("too many retries on block {block}")]
    TooManyRetries { block: u8 },

    #[error("transfer cancelled {0}")]
    Cancelled(CancelOrigin),

    /// The receiver got a block that is neither the next one nor a repeat.
    #[error("block out of sequence (expected {expected}, received {received})")]
    OutOfSequence { expected: u8, received: u8 },

    /// A YMODEM batch closed before carrying a single file.
    #[error("batch ended without a file")]
    EmptyBatch,

    /// The caller asked for something the protocol cannot carry.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The byte channel itself failed.
    #[error("channel error: {0}")]
    Channel(#[from] std::io::Error),
}

impl TransferError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, TransferError::Cancelled(_))
    }
}
