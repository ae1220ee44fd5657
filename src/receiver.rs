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

use std::marker::PhantomData;
use tracing::{debug, info, warn};

use crate::config::{Protocol, TransferConfig};
use crate::error::{CancelOrigin, TransferError};
use crate::frame::{ChecksumMode, Frame, FrameCodec, FrameKind};
use crate::header::FileHeader;
use crate::link::Link;
use crate::protocol::*;
use crate::serial::ByteChannel;
use crate::session::{CancelToken, Phase, Role, Session, SessionState, Step};

// ============================================================================
// Public types
// ============================================================================

/// A file delivered by the receiver.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ReceivedFile {
    /// Name from the YMODEM header; XMODEM transfers carry none.
    pub filename: Option<String>,
    pub size: Option<u64>,
    /// Payload, cut to `size` when the header announced one.
    pub data: Vec<u8>,
}

// ============================================================================
// States
// ============================================================================

/// Soliciting the sender with `C` or NAK
pub struct Handshake;
pub struct ReceiveBlock;
/// EOT seen, closing the current file
pub struct Finalize;

impl Phase for Handshake {
    const STATE: SessionState = SessionState::Handshaking;
}
impl Phase for ReceiveBlock {
    const STATE: SessionState = SessionState::Transferring;
}
impl Phase for Finalize {
    const STATE: SessionState = SessionState::Finalizing;
}

// ============================================================================
// FSM Structure
// ============================================================================

pub struct ReceiverFsm<State> {
    state: PhantomData<State>,
    link: Link,
    session: Session,
    // SOH/STX already consumed by the handshake
    pending_header: Option<u8>,
    expected: u8,
    last_accepted: Option<u8>,
    current: Option<ReceivedFile>,
    files: Vec<ReceivedFile>,
    got_data: bool,
}

// ============================================================================
// Trait
// ============================================================================

pub type ReceiverStep = Step<dyn ReceiverState, Vec<ReceivedFile>>;

pub trait ReceiverState: Send {
    fn step(self: Box<Self>) -> Result<ReceiverStep, TransferError>;

    fn session(&self) -> &Session;
}

// ============================================================================
// Helpers shared by every state
// ============================================================================

impl<S: Phase + 'static> ReceiverFsm<S> {
    fn transition<T: Phase>(self) -> Box<ReceiverFsm<T>> {
        let mut session = self.session;
        session.state = T::STATE;
        Box::new(ReceiverFsm {
            state: PhantomData,
            link: self.link,
            session,
            pending_header: self.pending_header,
            expected: self.expected,
            last_accepted: self.last_accepted,
            current: self.current,
            files: self.files,
            got_data: self.got_data,
        })
    }

    fn next<T: Phase + 'static>(self) -> Result<ReceiverStep, TransferError>
    where
        ReceiverFsm<T>: ReceiverState,
    {
        Ok(Step::Next(self.transition::<T>()))
    }

    fn stay(self) -> Result<ReceiverStep, TransferError>
    where
        ReceiverFsm<S>: ReceiverState,
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

    /// True if a CAN just read should end the session.
    fn peer_cancelled(&mut self) -> Result<bool, TransferError> {
        let confirmed = self.link.confirm_cancel().map_err(|e| self.io_error(e))?;
        if confirmed {
            info!("Transfer cancelled by sender");
        }
        Ok(confirmed)
    }

    /// Count a failed attempt on the expected block, aborting once the
    /// budget is spent.
    fn retry(&mut self) -> Result<(), TransferError> {
        self.session.retry_count += 1;
        if self.session.retry_count >= self.link.config.max_retries {
            warn!("Block {} failed {} times, aborting", self.expected, self.session.retry_count);
            self.link.abort();
            return Err(TransferError::TooManyRetries { block: self.expected });
        }
        Ok(())
    }

    /// Drop whatever is left of a bad frame and ask for it again.
    fn reject(&mut self, reason: &str) -> Result<(), TransferError> {
        warn!("Rejected block {}: {}", self.expected, reason);
        self.link.purge().map_err(|e| self.io_error(e))?;
        self.retry()?;
        self.send(&[NAK])?;
        debug!("Sent: NAK");
        Ok(())
    }

    fn out_of_sequence(&mut self, received: u8) -> TransferError {
        warn!("Block {} out of sequence, expected {}", received, self.expected);
        self.link.abort();
        TransferError::OutOfSequence {
            expected: self.expected,
            received,
        }
    }

    fn awaiting_header(&self) -> bool {
        self.link.config.protocol == Protocol::YModem && self.current.is_none()
    }
}

// ============================================================================
// State Implementations
// ============================================================================

impl ReceiverState for ReceiverFsm<Handshake> {
    fn step(self: Box<Self>) -> Result<ReceiverStep, TransferError> {
        let mut fsm = *self;
        fsm.check_cancel()?;

        let mode = if fsm.session.retry_count < fsm.link.config.crc_attempts {
            ChecksumMode::Crc16
        } else {
            ChecksumMode::Checksum
        };
        fsm.session.mode = mode;
        fsm.send(&[mode.request_byte()])?;
        debug!("Sent: {:?} request", mode);

        let timeout = fsm.link.config.handshake_timeout;
        match fsm.recv(timeout)? {
            Some(b @ (SOH | STX)) => {
                fsm.pending_header = Some(b);
                fsm.session.retry_count = 0;
                return fsm.next::<ReceiveBlock>();
            }
            // Our ACK to the last EOT was lost
            Some(EOT) if !fsm.files.is_empty() => {
                debug!("Received: repeated EOT");
                fsm.send(&[ACK])?;
            }
            Some(CAN) if fsm.peer_cancelled()? => {
                return Err(TransferError::Cancelled(CancelOrigin::Peer));
            }
            Some(other) => debug!("Ignoring 0x{:02X} while waiting for sender", other),
            None => debug!("Sender not ready"),
        }

        fsm.session.retry_count += 1;
        if fsm.session.retry_count >= fsm.link.config.handshake_attempts {
            if !fsm.files.is_empty() {
                warn!("Sender went quiet without closing the batch");
                return Ok(Step::Complete(fsm.files));
            }
            warn!("Sender never answered after {} attempts", fsm.session.retry_count);
            return Err(TransferError::NoResponse);
        }
        fsm.stay()
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

impl ReceiverFsm<ReceiveBlock> {
    /// Read the rest of a data frame whose type byte is `first`.
    /// `None` if the sender stalled part way.
    fn read_frame(&mut self, first: u8) -> Result<Option<Vec<u8>>, TransferError> {
        let codec = FrameCodec::new(self.session.mode);
        let len = FrameKind::from_byte(first)
            .and_then(FrameKind::block_size)
            .map_or(1, |size| codec.frame_len(size));

        let mut buf = vec![0u8; len];
        buf[0] = first;
        let timeout = self.link.config.block_timeout;
        let complete = self.link.recv_exact(&mut buf[1..], timeout).map_err(|e| self.io_error(e))?;
        Ok(complete.then_some(buf))
    }

    /// A sender answering an early `C` after we fell back to NAK sends CRC
    /// frames one byte longer than we read. Until the first block lands,
    /// try the rest of such a frame and switch to CRC if it checks out.
    fn late_crc_frame(&mut self, mut raw: Vec<u8>) -> Result<Option<Frame>, TransferError> {
        if self.session.mode != ChecksumMode::Checksum || self.got_data {
            return Ok(None);
        }

        let timeout = self.link.config.handshake_timeout;
        let Some(last) = self.recv(timeout)? else {
            return Ok(None);
        };
        raw.push(last);

        match FrameCodec::new(ChecksumMode::Crc16).decode(&raw) {
            Ok(frame) => {
                info!("Sender is using CRC, switching modes");
                self.session.mode = ChecksumMode::Crc16;
                Ok(Some(frame))
            }
            Err(_) => Ok(None),
        }
    }

    /// Block 0 of a YMODEM file, or the null header closing the batch.
    fn accept_header(mut self, frame: Frame) -> Result<ReceiverStep, TransferError> {
        let Some(header) = FileHeader::parse(&frame.payload) else {
            self.send(&[ACK])?;
            info!("Batch complete: {} file(s), {} bytes", self.files.len(), self.session.bytes_transferred);
            return Ok(Step::Complete(self.files));
        };

        info!("Receiving {} ({} bytes)", header.name, header.size.map_or("?".to_string(), |s| s.to_string()));
        self.session.filename = Some(header.name.clone());
        self.session.file_size = header.size;
        self.current = Some(ReceivedFile {
            filename: Some(header.name),
            size: header.size,
            data: Vec::new(),
        });
        self.last_accepted = Some(0);
        self.expected = 1;
        self.session.current_block = 1;
        self.session.retry_count = 0;
        self.got_data = false;

        let request = self.session.mode.request_byte();
        self.send(&[ACK, request])?;
        self.stay()
    }

    fn accept_data(mut self, frame: Frame) -> Result<ReceiverStep, TransferError> {
        if frame.block == self.expected {
            let Some(file) = self.current.as_mut() else {
                return Err(self.out_of_sequence(frame.block));
            };

            let take = match file.size {
                Some(size) => (size.saturating_sub(file.data.len() as u64) as usize).min(frame.payload.len()),
                None => frame.payload.len(),
            };
            file.data.extend_from_slice(&frame.payload[..take]);

            debug!("Received: block {} ({} bytes kept)", frame.block, take);
            self.session.bytes_transferred += take as u64;
            self.got_data = true;
            self.last_accepted = Some(frame.block);
            self.expected = frame.block.wrapping_add(1);
            self.session.current_block = self.expected;
            self.session.retry_count = 0;

            self.send(&[ACK])?;
            return self.stay();
        }

        if self.last_accepted == Some(frame.block) {
            debug!("Received: duplicate block {}", frame.block);
            if frame.block == 0 {
                let request = self.session.mode.request_byte();
                self.send(&[ACK, request])?;
            } else {
                self.send(&[ACK])?;
            }
            return self.stay();
        }

        Err(self.out_of_sequence(frame.block))
    }
}

impl ReceiverState for ReceiverFsm<ReceiveBlock> {
    fn step(self: Box<Self>) -> Result<ReceiverStep, TransferError> {
        let mut fsm = *self;
        fsm.check_cancel()?;

        let byte = match fsm.pending_header.take() {
            Some(b) => Some(b),
            None => {
                let timeout = fsm.link.config.block_timeout;
                fsm.recv(timeout)?
            }
        };

        match byte {
            Some(b @ (SOH | STX)) => {
                let Some(raw) = fsm.read_frame(b)? else {
                    fsm.reject("timed out mid-block")?;
                    return fsm.stay();
                };

                let frame = match FrameCodec::new(fsm.session.mode).decode(&raw) {
                    Ok(frame) => frame,
                    Err(e) => match fsm.late_crc_frame(raw)? {
                        Some(frame) => frame,
                        None => {
                            fsm.reject(&e.to_string())?;
                            return fsm.stay();
                        }
                    },
                };

                if fsm.awaiting_header() {
                    if frame.block != 0 {
                        return Err(fsm.out_of_sequence(frame.block));
                    }
                    return fsm.accept_header(frame);
                }
                fsm.accept_data(frame)
            }
            Some(EOT) if fsm.current.is_some() => {
                debug!("Received: EOT");
                fsm.next::<Finalize>()
            }
            Some(EOT) => {
                fsm.send(&[ACK])?;
                fsm.stay()
            }
            Some(CAN) if fsm.peer_cancelled()? => Err(TransferError::Cancelled(CancelOrigin::Peer)),
            Some(other) => {
                fsm.reject(&format!("unexpected byte 0x{:02X}", other))?;
                fsm.stay()
            }
            None => {
                warn!("Timed out waiting for block {}", fsm.expected);
                fsm.retry()?;
                // Keep asking for CRC until the sender commits to a block
                let answer = if fsm.session.mode == ChecksumMode::Crc16 && !fsm.got_data {
                    CRC_REQUEST
                } else {
                    NAK
                };
                fsm.send(&[answer])?;
                fsm.stay()
            }
        }
    }

    fn session(&self) -> &Session {
        &self.session
    }
}

impl ReceiverState for ReceiverFsm<Finalize> {
    fn step(self: Box<Self>) -> Result<ReceiverStep, TransferError> {
        let mut fsm = *self;

        fsm.send(&[ACK])?;
        debug!("Sent: ACK for EOT");

        if let Some(file) = fsm.current.take() {
            info!(
                "File complete: {} ({} bytes)",
                file.filename.as_deref().unwrap_or("<unnamed>"),
                file.data.len()
            );
            fsm.files.push(file);
        }

        match fsm.link.config.protocol {
            Protocol::XModem => Ok(Step::Complete(fsm.files)),
            Protocol::YModem => {
                fsm.expected = 0;
                fsm.last_accepted = None;
                fsm.got_data = false;
                fsm.session.current_block = 0;
                fsm.session.retry_count = 0;
                fsm.session.filename = None;
                fsm.session.file_size = None;
                fsm.next::<Handshake>()
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

impl ReceiverFsm<Handshake> {
    pub fn new(
        channel: Box<dyn ByteChannel>,
        config: TransferConfig,
        cancel: CancelToken,
    ) -> Box<dyn ReceiverState> {
        let xmodem = config.protocol == Protocol::XModem;
        let mut session = Session::new(Role::Receiver);
        session.current_block = if xmodem { 1 } else { 0 };

        Box::new(ReceiverFsm {
            state: PhantomData::<Handshake>,
            link: Link::new(channel, config, cancel),
            session,
            pending_header: None,
            expected: if xmodem { 1 } else { 0 },
            last_accepted: None,
            current: xmodem.then(ReceivedFile::default),
            files: Vec::new(),
            got_data: false,
        })
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::BlockSize;
    use crate::header::batch_end_frame;
    use crate::serial::MockSerialPort;
    use std::time::Duration;

    fn run_receiver(mut fsm: Box<dyn ReceiverState>) -> Result<Vec<ReceivedFile>, TransferError> {
        loop {
            match fsm.step()? {
                Step::Next(next) => fsm = next,
                Step::Complete(files) => return Ok(files),
            }
        }
    }

    fn incoming(bytes: &[u8]) -> Vec<Option<u8>> {
        bytes.iter().map(|&b| Some(b)).collect()
    }

    fn block(mode: ChecksumMode, number: u8, data: &[u8]) -> Vec<u8> {
        FrameCodec::new(mode).encode(&Frame::data(number, BlockSize::Standard, data, PAD)).to_vec()
    }

    fn header(name: &str, size: u64) -> Vec<u8> {
        let frame = FileHeader::new(name, size).to_frame().unwrap();
        FrameCodec::new(ChecksumMode::Crc16).encode(&frame).to_vec()
    }

    fn config(protocol: Protocol) -> TransferConfig {
        TransferConfig {
            protocol,
            handshake_timeout: Duration::from_millis(10),
            block_timeout: Duration::from_millis(10),
            ..TransferConfig::default()
        }
    }

    fn padded(data: &[u8]) -> Vec<u8> {
        let mut out = data.to_vec();
        out.resize(128, PAD);
        out
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 7 % 256) as u8).collect()
    }

    #[test]
    fn test_xmodem_single_block() {
        let mut input = block(ChecksumMode::Crc16, 1, b"hello");
        input.push(EOT);

        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), vec![CRC_REQUEST, ACK, ACK]));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::XModem), CancelToken::new());

        let files = run_receiver(fsm).expect("transfer should succeed");
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename, None);
        assert_eq!(files[0].data, padded(b"hello"));
    }

    #[test]
    fn test_ymodem_three_block_file() {
        let data = content(300);

        let mut input = header("test.txt", 300);
        for (i, chunk) in data.chunks(128).enumerate() {
            input.extend(block(ChecksumMode::Crc16, (i + 1) as u8, chunk));
        }
        input.push(EOT);
        input.extend(FrameCodec::new(ChecksumMode::Crc16).encode(&batch_end_frame()));

        let expected_writes = vec![CRC_REQUEST, ACK, CRC_REQUEST, ACK, ACK, ACK, ACK, CRC_REQUEST, ACK];

        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), expected_writes));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::YModem), CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].filename.as_deref(), Some("test.txt"));
        assert_eq!(files[0].size, Some(300));
        assert_eq!(files[0].data, data);
    }

    #[test]
    fn test_duplicate_block_is_not_delivered_twice() {
        let frame = block(ChecksumMode::Crc16, 1, b"once");
        let mut input = frame.clone();
        input.extend(&frame);
        input.push(EOT);

        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), vec![CRC_REQUEST, ACK, ACK, ACK]));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::XModem), CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        assert_eq!(files[0].data, padded(b"once"));
    }

    #[test]
    fn test_bad_crc_is_nakked_then_accepted() {
        let good = block(ChecksumMode::Crc16, 1, b"fixme");
        let mut bad = good.clone();
        bad[10] ^= 0x40;

        let mut input = bad;
        input.extend(&good);
        input.push(EOT);

        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), vec![CRC_REQUEST, NAK, ACK, ACK]));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::XModem), CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        assert_eq!(files[0].data, padded(b"fixme"));
    }

    #[test]
    fn test_falls_back_to_checksum() {
        let mut responses = vec![None, None];
        let mut input = block(ChecksumMode::Checksum, 1, b"old");
        input.push(EOT);
        responses.extend(incoming(&input));

        let mut cfg = config(Protocol::XModem);
        cfg.crc_attempts = 2;
        let mock_serial = Box::new(MockSerialPort::new(responses, vec![CRC_REQUEST, CRC_REQUEST, NAK, ACK, ACK]));
        let fsm = ReceiverFsm::new(mock_serial, cfg, CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        assert_eq!(files[0].data, padded(b"old"));
    }

    #[test]
    fn test_no_response() {
        let mut cfg = config(Protocol::YModem);
        cfg.handshake_attempts = 3;
        let mock_serial = Box::new(MockSerialPort::new(vec![None, None, None], vec![CRC_REQUEST; 3]));
        let fsm = ReceiverFsm::new(mock_serial, cfg, CancelToken::new());

        assert!(matches!(run_receiver(fsm), Err(TransferError::NoResponse)));
    }

    #[test]
    fn test_peer_cancel() {
        let mut input = block(ChecksumMode::Crc16, 1, b"part");
        input.push(CAN);

        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), vec![CRC_REQUEST, ACK]));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::XModem), CancelToken::new());

        assert!(matches!(run_receiver(fsm), Err(TransferError::Cancelled(CancelOrigin::Peer))));
    }

    #[test]
    fn test_local_cancel() {
        let cancel = CancelToken::new();
        cancel.cancel();

        let mock_serial = Box::new(MockSerialPort::new(vec![], ABORT_SEQUENCE.to_vec()));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::YModem), cancel);

        assert!(matches!(run_receiver(fsm), Err(TransferError::Cancelled(CancelOrigin::Local))));
    }

    #[test]
    fn test_out_of_sequence_aborts() {
        let mut input = block(ChecksumMode::Crc16, 1, b"one");
        input.extend(block(ChecksumMode::Crc16, 3, b"three"));

        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), vec![CRC_REQUEST, ACK, CAN, CAN]));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::XModem), CancelToken::new());

        assert!(matches!(
            run_receiver(fsm),
            Err(TransferError::OutOfSequence { expected: 2, received: 3 })
        ));
    }

    #[test]
    fn test_too_many_timeouts() {
        let mut responses = incoming(&block(ChecksumMode::Crc16, 1, b"then silence"));
        responses.extend([None, None, None]);

        let mut cfg = config(Protocol::XModem);
        cfg.max_retries = 3;
        let mock_serial = Box::new(MockSerialPort::new(responses, vec![CRC_REQUEST, ACK, NAK, NAK, CAN, CAN]));
        let fsm = ReceiverFsm::new(mock_serial, cfg, CancelToken::new());

        assert!(matches!(run_receiver(fsm), Err(TransferError::TooManyRetries { block: 2 })));
    }

    #[test]
    fn test_block_numbers_wrap() {
        let data = content(257 * 128);
        let mut input = Vec::new();
        for (i, chunk) in data.chunks(128).enumerate() {
            input.extend(block(ChecksumMode::Crc16, ((i + 1) % 256) as u8, chunk));
        }
        input.push(EOT);

        let mut expected_writes = vec![CRC_REQUEST];
        expected_writes.extend(std::iter::repeat_n(ACK, 258));

        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), expected_writes));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::XModem), CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        assert_eq!(files[0].data, data);
    }

    #[test]
    fn test_stall_mid_block_is_nakked() {
        let frame = block(ChecksumMode::Crc16, 1, b"stall");
        let mut responses = incoming(&frame[..40]);
        responses.push(None);
        responses.extend(incoming(&frame));
        responses.push(Some(EOT));

        let mock_serial = Box::new(MockSerialPort::new(responses, vec![CRC_REQUEST, NAK, ACK, ACK]));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::XModem), CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        assert_eq!(files[0].data, padded(b"stall"));
    }

    #[test]
    fn test_batch_without_terminator_still_completes() {
        let mut input = header("lone.bin", 4);
        input.extend(block(ChecksumMode::Crc16, 1, b"lone"));
        input.push(EOT);
        let mut responses = incoming(&input);
        responses.extend([None, None]);

        let mut cfg = config(Protocol::YModem);
        cfg.handshake_attempts = 2;
        let expected_writes = vec![CRC_REQUEST, ACK, CRC_REQUEST, ACK, ACK, CRC_REQUEST, CRC_REQUEST];
        let mock_serial = Box::new(MockSerialPort::new(responses, expected_writes));
        let fsm = ReceiverFsm::new(mock_serial, cfg, CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].data, b"lone");
    }

    #[test]
    fn test_repeated_header_is_reacknowledged() {
        let head = header("twice.txt", 2);
        let mut input = head.clone();
        input.extend(&head);
        input.extend(block(ChecksumMode::Crc16, 1, b"ok"));
        input.push(EOT);
        input.extend(FrameCodec::new(ChecksumMode::Crc16).encode(&batch_end_frame()));

        let expected_writes = vec![
            CRC_REQUEST, ACK, CRC_REQUEST, ACK, CRC_REQUEST, ACK, ACK, CRC_REQUEST, ACK,
        ];
        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), expected_writes));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::YModem), CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        assert_eq!(files[0].data, b"ok");
    }

    #[test]
    fn test_repeated_eot_is_reacknowledged() {
        let mut input = header("eot.txt", 3);
        input.extend(block(ChecksumMode::Crc16, 1, b"eot"));
        input.push(EOT);
        input.push(EOT);
        input.extend(FrameCodec::new(ChecksumMode::Crc16).encode(&batch_end_frame()));

        let expected_writes = vec![
            CRC_REQUEST, ACK, CRC_REQUEST, ACK, ACK, CRC_REQUEST, ACK, CRC_REQUEST, ACK,
        ];
        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), expected_writes));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::YModem), CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].data, b"eot");
    }

    #[test]
    fn test_unconfirmed_can_is_noise() {
        let mut input = block(ChecksumMode::Crc16, 1, b"first");
        input.extend([CAN, 0x00]);
        input.extend(block(ChecksumMode::Crc16, 2, b"second"));
        input.push(EOT);

        let mut cfg = config(Protocol::XModem);
        cfg.confirm_cancel = true;
        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), vec![CRC_REQUEST, ACK, NAK, ACK, ACK]));
        let fsm = ReceiverFsm::new(mock_serial, cfg, CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        let mut expected = padded(b"first");
        expected.extend(padded(b"second"));
        assert_eq!(files[0].data, expected);
    }

    #[test]
    fn test_confirmed_can_cancels() {
        let mut input = block(ChecksumMode::Crc16, 1, b"first");
        input.extend([CAN, CAN]);

        let mut cfg = config(Protocol::XModem);
        cfg.confirm_cancel = true;
        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), vec![CRC_REQUEST, ACK]));
        let fsm = ReceiverFsm::new(mock_serial, cfg, CancelToken::new());

        assert!(matches!(run_receiver(fsm), Err(TransferError::Cancelled(CancelOrigin::Peer))));
    }

    #[test]
    fn test_duplicate_across_wrap_is_not_delivered_twice() {
        let data = content(256 * 128);
        let chunks: Vec<&[u8]> = data.chunks(128).collect();

        let mut input = Vec::new();
        for (i, chunk) in chunks.iter().enumerate().take(255) {
            input.extend(block(ChecksumMode::Crc16, (i + 1) as u8, chunk));
        }
        input.extend(block(ChecksumMode::Crc16, 255, chunks[254]));
        input.extend(block(ChecksumMode::Crc16, 0, chunks[255]));
        input.push(EOT);

        let mut expected_writes = vec![CRC_REQUEST];
        expected_writes.extend(std::iter::repeat_n(ACK, 258));

        let mock_serial = Box::new(MockSerialPort::new(incoming(&input), expected_writes));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::XModem), CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        assert_eq!(files[0].data, data);
    }

    #[test]
    fn test_late_crc_block_after_checksum_fallback() {
        let first = block(ChecksumMode::Crc16, 1, b"late");
        // The CRC frame must not also pass as a checksum frame
        assert_ne!(crate::frame::checksum(&first[3..131]), first[131]);

        let mut responses = vec![None];
        responses.extend(incoming(&first));
        responses.extend(incoming(&block(ChecksumMode::Crc16, 2, b"crc")));
        responses.push(Some(EOT));

        let mut cfg = config(Protocol::XModem);
        cfg.crc_attempts = 1;
        let mock_serial = Box::new(MockSerialPort::new(responses, vec![CRC_REQUEST, NAK, ACK, ACK, ACK]));
        let fsm = ReceiverFsm::new(mock_serial, cfg, CancelToken::new());

        let files = run_receiver(fsm).unwrap();
        let mut expected = padded(b"late");
        expected.extend(padded(b"crc"));
        assert_eq!(files[0].data, expected);
    }

    #[test]
    fn test_write_failure_is_channel_error() {
        let mock_serial = Box::new(MockSerialPort::failing_writes(vec![], std::io::ErrorKind::BrokenPipe));
        let fsm = ReceiverFsm::new(mock_serial, config(Protocol::YModem), CancelToken::new());

        match run_receiver(fsm) {
            Err(TransferError::Channel(e)) => {
                assert_eq!(e.kind(), std::io::ErrorKind::BrokenPipe);
                assert!(e.to_string().contains("Handshake"));
            }
            other => panic!("expected channel error, got {:?}", other),
        }
    }
}
