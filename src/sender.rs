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

use std::collections::VecDeque;
use std::marker::PhantomData;
use bytes::Bytes;
use tracing::{debug, info, warn};

use crate::config::{Protocol, TransferConfig};
use crate::error::{CancelOrigin, TransferError};
use crate::frame::{BlockSize, ChecksumMode, Frame, FrameCodec};
use crate::header::{FileHeader, batch_end_frame};
use crate::link::Link;
use crate::protocol::*;
use crate::serial::ByteChannel;
use crate::session::{CancelToken, Phase, Role, Session, SessionState, Step};

// ============================================================================
// Public types
// ============================================================================

/// A file queued for sending.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingFile {
    pub name: String,
    pub data: Vec<u8>,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        OutgoingFile {
            name: name.into(),
            data: data.into(),
        }
    }
}

/// Summary of a completed send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendReport {
    pub bytes_transferred: u64,
    pub files: usize,
}

// ============================================================================
// States
// ============================================================================

/// Waiting for `C` or NAK before a header (YMODEM) or the first block (XMODEM)
pub struct AwaitStart;
/// Sending YMODEM block 0
pub struct SendHeader;
/// Header acknowledged, waiting for the receiver to ask for data
pub struct AwaitDataStart;
pub struct SendBlock;
pub struct SendEot;
/// Sending the null header that closes a YMODEM batch
pub struct SendBatchEnd;

impl Phase for AwaitStart {
    const STATE: SessionState = SessionState::Handshaking;
}
impl Phase for SendHeader {
    const STATE: SessionState = SessionState::Transferring;
}
impl Phase for AwaitDataStart {
    const STATE: SessionState = SessionState::Transferring;
}
impl Phase for SendBlock {
    const STATE: SessionState = SessionState::Transferring;
}
impl Phase for SendEot {
    const STATE: SessionState = SessionState::Finalizing;
}
impl Phase for SendBatchEnd {
    const STATE: SessionState = SessionState::Finalizing;
}

// ============================================================================
// FSM Structure
// ============================================================================

pub struct SenderFsm<State> {
    state: PhantomData<State>,
    link: Link,
    session: Session,
    files: VecDeque<OutgoingFile>,
    current: Option<OutgoingFile>,
    offset: usize,
    // Encoded frame awaiting ACK and the file bytes it carries
    pending: Option<(Bytes, usize)>,
    files_sent: usize,
}

// ============================================================================
// Trait
// ============================================================================

pub type SenderStep = Step<dyn SenderState, SendReport>;

pub trait SenderState: Send {
    fn step(self: Box<Self>) -> Result<SenderStep, TransferError>;

    fn session(&self) -> &Session;
}

/// What the receiver said about the last frame.
enum Reply {
    Ack,
    Nak,
    Cancel,
    Timeout,
    Other(u8),
}

// ============================================================================
// Helpers shared by every state
// ============================================================================

impl<S: Phase + 'static> SenderFsm<S> {
    fn transition<T: Phase>(self) -> Box<SenderFsm<T>> {
        let mut session = self.session;
        session.state = T::STATE;
        Box::new(SenderFsm {
            state: PhantomData,
            link: self.link,
            session,
            files: self.files,
            current: self.current,
            offset: self.offset,
            pending: self.pending,
            files_sent: self.files_sent,
        })
    }

    fn next<T: Phase + 'static>(self) -> Result<SenderStep, TransferError>
    where
        SenderFsm<T>: SenderState,
    {
        Ok(Step::Next(self.transition::<T>()))
    }

    fn stay(self) -> Result<SenderStep, TransferError>
    where
        SenderFsm<S>: SenderState,
    {
        Ok(Step::Next(Box::new(self)))
    }

    fn io_error(&self, e: std::io::Error) -> TransferError {
        let type_name = std::any::type_name::<S>();
        let state_name = type_name.split("::").last().unwrap_or(type_name);
        TransferError::Channel(std::io::Error::new(
            e.kind(),
            format!("{} (in state: {})", e, state_name)
        ))
    }

    fn codec(&self) -> FrameCodec {
        FrameCodec::new(self.session.mode)
    }

    fn check_cancel(&mut self) -> Result<(), TransferError> {
        if self.link.cancel_requested() {
            warn!("Transfer cancelled locally, sending CAN");
            self.link.abort();
            return Err(TransferError::Cancelled(CancelOrigin::Local));
        }
        Ok(())
    }

    fn recv(&mut self, timeout: std::time::Duration) -> Result<Option<u8>, TransferError> {
        self.link.recv(timeout).map_err(|e| self.io_error(e))
    }

    fn send(&mut self, bytes: &[u8]) -> Result<(), TransferError> {
        self.link.send(bytes).map_err(|e| self.io_error(e))
    }

    /// Write the pending frame, dropping stale input first.
    fn transmit_pending(&mut self) -> Result<(), TransferError> {
        let Some((frame, _)) = self.pending.clone() else {
            return Ok(());
        };
        self.link.purge().map_err(|e| self.io_error(e))?;
        self.send(&frame)?;
        debug!("Sent: block {} ({} bytes)", self.session.current_block, frame.len());
        Ok(())
    }

    fn await_reply(&mut self) -> Result<Reply, TransferError> {
        let timeout = self.link.config.block_timeout;
        let reply = match self.recv(timeout)? {
            Some(ACK) => Reply::Ack,
            // A receiver still asking for CRC mode wants the frame again
            Some(NAK) | Some(CRC_REQUEST) => Reply::Nak,
            Some(CAN) => {
                if self.link.confirm_cancel().map_err(|e| self.io_error(e))? {
                    Reply::Cancel
                } else {
                    Reply::Other(CAN)
                }
            }
            Some(other) => Reply::Other(other),
            None => Reply::Timeout,
        };
        Ok(reply)
    }

    /// Count a failed attempt, aborting once the budget is spent.
    fn retry(&mut self, limit: u32, reply: &Reply) -> Result<(), TransferError> {
        let block = self.session.current_block;
        match reply {
            Reply::Nak => warn!("Received NAK for block {}, retrying", block),
            Reply::Timeout => warn!("No response to block {}, retrying", block),
            Reply::Other(b) => warn!("Unexpected response 0x{:02X} to block {}, retrying", b, block),
            _ => {}
        }

        self.session.retry_count += 1;
        if self.session.retry_count >= limit {
            warn!("Block {} failed {} times, aborting", block, self.session.retry_count);
            self.link.abort();
            return Err(TransferError::TooManyRetries { block });
        }
        Ok(())
    }

    fn peer_cancelled(&self) -> TransferError {
        info!("Transfer cancelled by receiver");
        TransferError::Cancelled(CancelOrigin::Peer)
    }

    fn acknowledged(&mut self) {
        self.pending = None;
        self.session.retry_count = 0;
    }

    fn report(&self) -> SendReport {
        SendReport {
            bytes_transferred: self.session.bytes_transferred,
            files: self.files_sent,
        }
    }

    /// Block size for the next chunk when `remaining` bytes are left.
    fn block_size_for(&self, remaining: usize) -> BlockSize {
        match (self.session.mode, self.link.config.block_size) {
            (ChecksumMode::Crc16, BlockSize::OneK) if remaining > BlockSize::Standard.len() => BlockSize::OneK,
            _ => BlockSize::Standard,
        }
    }

    fn start_next_file(&mut self) {
        self.current = self.files.pop_front();
        self.offset = 0;
        self.pending = None;

        match (&self.current, self.link.config.protocol) {
            (Some(file), Protocol::YModem) => {
                self.session.filename = Some(file.name.clone());
                self.session.file_size = Some(file.data.len() as u64);
                self.session.current_block = 0;
            }
            _ => {
                self.session.filename = None;
                self.session.file_size = None;
                self.session.current_block = if self.current.is_some() { 1 } else { 0 };
            }
        }
    }

    /// Reject requests the protocol cannot carry before touching the wire.
    fn validate(&self) -> Result<(), TransferError> {
        match self.link.config.protocol {
            Protocol::XModem if self.files.len() != 1 => Err(TransferError::InvalidRequest(format!(
                "XMODEM sends exactly one file, got {}",
                self.files.len()
            ))),
            Protocol::XModem => Ok(()),
            Protocol::YModem => {
                for file in &self.files {
                    FileHeader::new(file.name.clone(), file.data.len() as u64).to_frame()?;
                }
                Ok(())
            }
        }
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl SenderState for SenderFsm<AwaitStart> {
    fn step(self: Box<Self>) -> Result<SenderStep, TransferError> {
        let mut fsm = *self;

        if fsm.session.state == SessionState::Idle {
            fsm.validate()?;
            info!("Waiting for receiver ({} file(s))", fsm.files.len());
        }
        fsm.session.state = SessionState::Handshaking;
        fsm.check_cancel()?;

        let timeout = fsm.link.config.handshake_timeout;
        let byte = fsm.recv(timeout)?;

        if let Some(mode) = byte.and_then(ChecksumMode::from_request) {
            debug!("Received: {:?} request", mode);
            fsm.session.mode = mode;
            fsm.session.retry_count = 0;

            if fsm.link.config.protocol == Protocol::YModem && fsm.files.is_empty() {
                return fsm.next::<SendBatchEnd>();
            }

            fsm.start_next_file();
            return match fsm.link.config.protocol {
                Protocol::XModem => fsm.next::<SendBlock>(),
                Protocol::YModem => fsm.next::<SendHeader>(),
            };
        }

        match byte {
            Some(CAN) if fsm.link.confirm_cancel().map_err(|e| fsm.io_error(e))? => {
                return Err(fsm.peer_cancelled());
            }
            Some(other) => debug!("Ignoring 0x{:02X} while waiting for receiver", other),
            None => debug!("Receiver not ready"),
        }

        fsm.session.retry_count += 1;
        if fsm.session.retry_count >= fsm.link.config.handshake_attempts {
            warn!("Receiver never answered after {} attempts", fsm.session.retry_count);
            return Err(TransferError::NoResponse);
        }
        fsm.stay()
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

impl SenderState for SenderFsm<SendHeader> {
    fn step(self: Box<Self>) -> Result<SenderStep, TransferError> {
        let mut fsm = *self;
        fsm.check_cancel()?;

        if fsm.pending.is_none() {
            let Some(file) = fsm.current.as_ref() else {
                return fsm.next::<SendBatchEnd>();
            };
            let header = FileHeader::new(file.name.clone(), file.data.len() as u64);
            let frame = header.to_frame()?;
            fsm.pending = Some((fsm.codec().encode(&frame), 0));
        }

        fsm.transmit_pending()?;

        match fsm.await_reply()? {
            Reply::Ack => {
                info!(
                    "Header accepted: {} ({} bytes)",
                    fsm.session.filename.as_deref().unwrap_or(""),
                    fsm.session.file_size.unwrap_or(0)
                );
                fsm.acknowledged();
                fsm.session.current_block = 1;
                fsm.next::<AwaitDataStart>()
            }
            Reply::Cancel => Err(fsm.peer_cancelled()),
            reply => {
                let limit = fsm.link.config.max_retries;
                fsm.retry(limit, &reply)?;
                fsm.stay()
            }
        }
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

impl SenderState for SenderFsm<AwaitDataStart> {
    fn step(self: Box<Self>) -> Result<SenderStep, TransferError> {
        let mut fsm = *self;
        fsm.check_cancel()?;

        let timeout = fsm.link.config.block_timeout;
        match fsm.recv(timeout)? {
            Some(b) if ChecksumMode::from_request(b).is_some() => {
                debug!("Received: data request");
            }
            Some(ACK) => {
                debug!("Received: duplicate ACK for header");
                return fsm.stay();
            }
            Some(CAN) if fsm.link.confirm_cancel().map_err(|e| fsm.io_error(e))? => {
                return Err(fsm.peer_cancelled());
            }
            Some(other) => {
                let limit = fsm.link.config.max_retries;
                fsm.retry(limit, &Reply::Other(other))?;
                return fsm.stay();
            }
            // Some receivers never ask; the first block's answer will tell
            None => debug!("No data request, sending anyway"),
        }

        let empty = fsm.current.as_ref().is_none_or(|f| f.data.is_empty());
        if empty {
            fsm.next::<SendEot>()
        } else {
            fsm.next::<SendBlock>()
        }
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

impl SenderState for SenderFsm<SendBlock> {
    fn step(self: Box<Self>) -> Result<SenderStep, TransferError> {
        let mut fsm = *self;
        fsm.check_cancel()?;

        if fsm.pending.is_none() {
            let Some(file) = fsm.current.as_ref() else {
                return fsm.next::<SendEot>();
            };

            let remaining = file.data.len() - fsm.offset;
            if remaining == 0 {
                return fsm.next::<SendEot>();
            }

            let size = fsm.block_size_for(remaining);
            let len = remaining.min(size.len());
            let chunk = &file.data[fsm.offset..fsm.offset + len];
            let frame = Frame::data(fsm.session.current_block, size, chunk, PAD);
            let encoded = fsm.codec().encode(&frame);
            fsm.pending = Some((encoded, len));
        }

        fsm.transmit_pending()?;

        match fsm.await_reply()? {
            Reply::Ack => {
                let len = fsm.pending.as_ref().map_or(0, |(_, len)| *len);
                debug!("Received: ACK for block {}", fsm.session.current_block);
                fsm.acknowledged();
                fsm.offset += len;
                fsm.session.bytes_transferred += len as u64;
                fsm.session.current_block = fsm.session.current_block.wrapping_add(1);
                fsm.stay()
            }
            Reply::Cancel => Err(fsm.peer_cancelled()),
            reply => {
                let limit = fsm.link.config.max_retries;
                fsm.retry(limit, &reply)?;
                fsm.stay()
            }
        }
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

impl SenderState for SenderFsm<SendEot> {
    fn step(self: Box<Self>) -> Result<SenderStep, TransferError> {
        let mut fsm = *self;
        fsm.check_cancel()?;

        fsm.send(&[EOT])?;
        debug!("Sent: EOT");

        match fsm.await_reply()? {
            Reply::Ack => {
                debug!("Received: ACK for EOT");
                fsm.acknowledged();
                fsm.files_sent += 1;
                fsm.current = None;
                info!("File complete ({} bytes sent so far)", fsm.session.bytes_transferred);

                match fsm.link.config.protocol {
                    Protocol::XModem => Ok(Step::Complete(fsm.report())),
                    Protocol::YModem => fsm.next::<AwaitStart>(),
                }
            }
            Reply::Cancel => Err(fsm.peer_cancelled()),
            reply => {
                let limit = fsm.link.config.eot_retries;
                fsm.retry(limit, &reply)?;
                fsm.stay()
            }
        }
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

impl SenderState for SenderFsm<SendBatchEnd> {
    fn step(self: Box<Self>) -> Result<SenderStep, TransferError> {
        let mut fsm = *self;
        fsm.check_cancel()?;

        if fsm.pending.is_none() {
            fsm.session.current_block = 0;
            fsm.session.filename = None;
            fsm.session.file_size = None;
            fsm.pending = Some((fsm.codec().encode(&batch_end_frame()), 0));
        }

        fsm.transmit_pending()?;

        match fsm.await_reply()? {
            Reply::Ack => {
                fsm.acknowledged();
                info!("Batch complete: {} file(s), {} bytes", fsm.files_sent, fsm.session.bytes_transferred);
                Ok(Step::Complete(fsm.report()))
            }
            Reply::Cancel => Err(fsm.peer_cancelled()),
            reply => {
                let limit = fsm.link.config.max_retries;
                fsm.retry(limit, &reply)?;
                fsm.stay()
            }
        }
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

// ============================================================================
// Constructor
// ============================================================================

impl SenderFsm<AwaitStart> {
    pub fn new(
        channel: Box<dyn ByteChannel>,
        files: Vec<OutgoingFile>,
        config: TransferConfig,
        cancel: CancelToken,
    ) -> Box<dyn SenderState> {
        Box::new(SenderFsm {
            state: PhantomData::<AwaitStart>,
            link: Link::new(channel, config, cancel),
            session: Session::new(Role::Sender),
            files: files.into(),
            current: None,
            offset: 0,
            pending: None,
            files_sent: 0,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================
