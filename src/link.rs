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

use std::io;
use std::time::Duration;
use tracing::{trace, warn};

use crate::config::TransferConfig;
use crate::frame::hex_dump;
use crate::protocol::{ABORT_SEQUENCE, CAN};
use crate::serial::ByteChannel;
use crate::session::CancelToken;

/// Channel plus the policy both state machines share.
pub(crate) struct Link {
    channel: Box<dyn ByteChannel>,
    pub(crate) config: TransferConfig,
    cancel: CancelToken,
}

impl Link {
    pub(crate) fn new(channel: Box<dyn ByteChannel>, config: TransferConfig, cancel: CancelToken) -> Self {
        Link { channel, config, cancel }
    }

    pub(crate) fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        if bytes.len() > 1 {
            trace!("frame out:{}", hex_dump(bytes));
        }
        self.channel.write_all(bytes)
    }

    /// Next byte, or `None` when nothing arrives within `timeout`.
    pub(crate) fn recv(&mut self, timeout: Duration) -> io::Result<Option<u8>> {
        match self.channel.read_byte(timeout) {
            Ok(b) => Ok(Some(b)),
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Fill `buf`; `false` if the peer went quiet part way.
    pub(crate) fn recv_exact(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<bool> {
        match self.channel.read_exact_timeout(buf, timeout) {
            Ok(()) => {
                trace!("frame in (tail):{}", hex_dump(buf));
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub(crate) fn purge(&mut self) -> io::Result<()> {
        self.channel.clear_input()
    }

    pub(crate) fn cancel_requested(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Called after a CAN was read. True if it stands as a cancellation.
    pub(crate) fn confirm_cancel(&mut self) -> io::Result<bool> {
        if !self.config.confirm_cancel {
            return Ok(true);
        }
        let timeout = self.config.block_timeout;
        Ok(self.recv(timeout)? == Some(CAN))
    }

    /// Tell the peer we are giving up. A failed write is only logged.
    pub(crate) fn abort(&mut self) {
        if let Err(e) = self.channel.write_all(&ABORT_SEQUENCE) {
            warn!("failed to send cancel sequence: {}", e);
        }
    }
}
