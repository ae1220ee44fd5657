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

//! Session bookkeeping shared by the sender and receiver state machines.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::frame::ChecksumMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Handshaking,
    Transferring,
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Cancelled | SessionState::Failed
        )
    }
}

/// Observable state of one transfer attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub role: Role,
    pub mode: ChecksumMode,
    pub state: SessionState,
    pub current_block: u8,
    pub retry_count: u32,
    /// Name from the current YMODEM header
    pub filename: Option<String>,
    /// Size from the current YMODEM header
    pub file_size: Option<u64>,
    pub bytes_transferred: u64,
}

impl Session {
    pub fn new(role: Role) -> Self {
        Session {
            role,
            mode: ChecksumMode::Crc16,
            state: SessionState::Idle,
            current_block: 0,
            retry_count: 0,
            filename: None,
            file_size: None,
            bytes_transferred: 0,
        }
    }
}

/// Cooperative local cancellation, checked before every state machine step.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Result of advancing a state machine by one step.
pub enum Step<S: ?Sized, T> {
    Next(Box<S>),
    Complete(T),
}

/// Session state a typed FSM state maps to.
pub(crate) trait Phase {
    const STATE: SessionState;
}
