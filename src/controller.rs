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

//! Drives a sender or receiver state machine to a terminal state.
//!
//! [`transfer`], [`send_file`] and [`receive_file`] block until the session
//! ends. [`SessionController`] exposes the same loop one step at a time for
//! callers that want to observe the [`Session`] between steps.

use tracing::{info, warn};

use crate::config::TransferConfig;
use crate::error::TransferError;
use crate::receiver::{ReceivedFile, ReceiverFsm, ReceiverState};
use crate::sender::{OutgoingFile, SendReport, SenderFsm, SenderState};
use crate::serial::ByteChannel;
use crate::session::{CancelToken, Role, Session, SessionState, Step};

/// What a finished session produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Sent(SendReport),
    Received(Vec<ReceivedFile>),
}

impl Outcome {
    pub fn bytes_transferred(&self) -> u64 {
        match self {
            Outcome::Sent(report) => report.bytes_transferred,
            Outcome::Received(files) => files.iter().map(|f| f.data.len() as u64).sum(),
        }
    }
}

pub type TransferResult = Result<Outcome, TransferError>;

#[derive(Debug, Clone)]
pub enum TransferRequest {
    Send { files: Vec<OutgoingFile> },
    Receive,
}

enum Machine {
    Sender(Box<dyn SenderState>),
    Receiver(Box<dyn ReceiverState>),
    Done,
}

type ProgressFn = Box<dyn FnMut(&Session) + Send>;

pub struct SessionController {
    machine: Machine,
    session: Session,
    cancel: CancelToken,
    progress: Option<ProgressFn>,
    result: Option<TransferResult>,
}

impl SessionController {
    pub fn start(channel: Box<dyn ByteChannel>, request: TransferRequest, config: TransferConfig) -> Self {
        match request {
            TransferRequest::Send { files } => Self::start_send(channel, files, config),
            TransferRequest::Receive => Self::start_receive(channel, config),
        }
    }

    pub fn start_send(channel: Box<dyn ByteChannel>, files: Vec<OutgoingFile>, config: TransferConfig) -> Self {
        let cancel = CancelToken::new();
        let fsm = SenderFsm::new(channel, files, config, cancel.clone());
        Self::with_machine(Machine::Sender(fsm), Role::Sender, cancel)
    }

    pub fn start_receive(channel: Box<dyn ByteChannel>, config: TransferConfig) -> Self {
        let cancel = CancelToken::new();
        let fsm = ReceiverFsm::new(channel, config, cancel.clone());
        Self::with_machine(Machine::Receiver(fsm), Role::Receiver, cancel)
    }

    fn with_machine(machine: Machine, role: Role, cancel: CancelToken) -> Self {
        SessionController {
            machine,
            session: Session::new(role),
            cancel,
            progress: None,
            result: None,
        }
    }

    /// Call `f` with the session whenever more bytes have been moved.
    pub fn on_progress<F>(mut self, f: F) -> Self
    where
        F: FnMut(&Session) + Send + 'static,
    {
        self.progress = Some(Box::new(f));
        self
    }

    /// Token that cancels this session from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn is_finished(&self) -> bool {
        self.result.is_some()
    }

    pub fn result(&self) -> Option<&TransferResult> {
        self.result.as_ref()
    }

    /// Advance the state machine by one step. Returns true once the
    /// session has reached a terminal state.
    pub fn poll(&mut self) -> bool {
        match std::mem::replace(&mut self.machine, Machine::Done) {
            Machine::Sender(fsm) => match fsm.step() {
                Ok(Step::Next(next)) => {
                    self.observe(next.session());
                    self.machine = Machine::Sender(next);
                }
                Ok(Step::Complete(report)) => self.finish(Ok(Outcome::Sent(report))),
                Err(e) => self.finish(Err(e)),
            },
            Machine::Receiver(fsm) => match fsm.step() {
                Ok(Step::Next(next)) => {
                    self.observe(next.session());
                    self.machine = Machine::Receiver(next);
                }
                Ok(Step::Complete(files)) => self.finish(Ok(Outcome::Received(files))),
                Err(e) => self.finish(Err(e)),
            },
            Machine::Done => {}
        }
        self.is_finished()
    }

    /// Poll until the session ends and hand back its result.
    pub fn run(mut self) -> TransferResult {
        loop {
            if let Some(result) = self.result.take() {
                return result;
            }
            self.poll();
        }
    }

    fn observe(&mut self, session: &Session) {
        let advanced = session.bytes_transferred != self.session.bytes_transferred;
        self.session.clone_from(session);
        if advanced {
            self.report_progress();
        }
    }

    fn report_progress(&mut self) {
        if let Some(progress) = self.progress.as_mut() {
            progress(&self.session);
        }
    }

    fn finish(&mut self, result: TransferResult) {
        match &result {
            Ok(outcome) => {
                self.session.state = SessionState::Completed;
                let total = outcome.bytes_transferred();
                if total != self.session.bytes_transferred {
                    self.session.bytes_transferred = total;
                    self.report_progress();
                }
                info!("Session completed: {} bytes", total);
            }
            Err(e) if e.is_cancelled() => {
                self.session.state = SessionState::Cancelled;
                warn!("Session {}", e);
            }
            Err(e) => {
                self.session.state = SessionState::Failed;
                warn!("Session failed: {}", e);
            }
        }
        self.result = Some(result);
    }
}

/// Run one session to completion.
pub fn transfer(channel: Box<dyn ByteChannel>, request: TransferRequest, config: TransferConfig) -> TransferResult {
    SessionController::start(channel, request, config).run()
}

/// Send a single file. XMODEM ignores `filename`.
pub fn send_file(
    channel: Box<dyn ByteChannel>,
    data: &[u8],
    filename: &str,
    config: TransferConfig,
) -> Result<SendReport, TransferError> {
    let files = vec![OutgoingFile::new(filename, data)];
    match transfer(channel, TransferRequest::Send { files }, config)? {
        Outcome::Sent(report) => Ok(report),
        Outcome::Received(_) => Err(TransferError::InvalidRequest("send session ended as a receive".into())),
    }
}

/// Receive a single file.
///
/// A YMODEM sender may still push a whole batch; only its first file is
/// returned and the rest are dropped with a warning. Use [`transfer`] with
/// [`TransferRequest::Receive`] to keep every file.
pub fn receive_file(channel: Box<dyn ByteChannel>, config: TransferConfig) -> Result<ReceivedFile, TransferError> {
    match transfer(channel, TransferRequest::Receive, config)? {
        Outcome::Received(files) => {
            if files.len() > 1 {
                warn!("Discarding {} extra file(s) from the batch", files.len() - 1);
            }
            files.into_iter().next().ok_or(TransferError::EmptyBatch)
        }
        Outcome::Sent(_) => Err(TransferError::InvalidRequest("receive session ended as a send".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Protocol;
    use crate::error::CancelOrigin;
    use crate::frame::{BlockSize, ChecksumMode, FrameCodec};
    use crate::header::batch_end_frame;
    use crate::protocol::*;
    use crate::serial::{LoopbackPort, MockSerialPort};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    fn fast(protocol: Protocol, block_size: BlockSize) -> TransferConfig {
        TransferConfig {
            protocol,
            block_size,
            handshake_timeout: Duration::from_millis(200),
            block_timeout: Duration::from_millis(500),
            ..TransferConfig::default()
        }
    }

    fn content(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn test_ymodem_send_and_receive_over_loopback() {
        let (a, b) = LoopbackPort::pair();
        let cfg = fast(Protocol::YModem, BlockSize::Standard);

        let receiver_cfg = cfg.clone();
        let receiver = thread::spawn(move || receive_file(Box::new(b), receiver_cfg));

        let data = content(300, 7);
        let report = send_file(Box::new(a), &data, "test.txt", cfg).expect("send should succeed");
        let file = receiver.join().unwrap().expect("receive should succeed");

        assert_eq!(report.bytes_transferred, 300);
        assert_eq!(file.filename.as_deref(), Some("test.txt"));
        assert_eq!(file.size, Some(300));
        assert_eq!(file.data, data);
    }

    #[test]
    fn test_ymodem_batch_with_1k_blocks() {
        let (a, b) = LoopbackPort::pair();
        let cfg = fast(Protocol::YModem, BlockSize::OneK);

        let receiver_cfg = cfg.clone();
        let receiver = thread::spawn(move || transfer(Box::new(b), TransferRequest::Receive, receiver_cfg));

        let files = vec![
            OutgoingFile::new("big.bin", content(2100, 1)),
            OutgoingFile::new("small.txt", b"tiny".to_vec()),
        ];
        let sent = transfer(Box::new(a), TransferRequest::Send { files: files.clone() }, cfg).unwrap();
        let received = receiver.join().unwrap().unwrap();

        assert_eq!(sent, Outcome::Sent(SendReport { bytes_transferred: 2104, files: 2 }));
        let Outcome::Received(received) = received else {
            panic!("receiver reported a send");
        };
        assert_eq!(received.len(), 2);
        for (got, want) in received.iter().zip(&files) {
            assert_eq!(got.filename.as_deref(), Some(want.name.as_str()));
            assert_eq!(got.data, want.data);
        }
    }

    #[test]
    fn test_xmodem_keeps_padding() {
        let (a, b) = LoopbackPort::pair();
        let cfg = fast(Protocol::XModem, BlockSize::Standard);

        let receiver_cfg = cfg.clone();
        let receiver = thread::spawn(move || receive_file(Box::new(b), receiver_cfg));

        let data = content(200, 3);
        send_file(Box::new(a), &data, "unused", cfg).unwrap();
        let file = receiver.join().unwrap().unwrap();

        assert_eq!(file.filename, None);
        assert_eq!(file.data.len(), 256);
        assert_eq!(&file.data[..200], &data[..]);
        assert!(file.data[200..].iter().all(|&b| b == PAD));
    }

    #[test]
    fn test_poll_reports_progress() {
        let (a, b) = LoopbackPort::pair();
        let cfg = fast(Protocol::YModem, BlockSize::Standard);

        let receiver_cfg = cfg.clone();
        let receiver = thread::spawn(move || receive_file(Box::new(b), receiver_cfg));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let files = vec![OutgoingFile::new("test.txt", content(300, 9))];
        let mut controller = SessionController::start_send(Box::new(a), files, cfg)
            .on_progress(move |session| sink.lock().unwrap().push(session.bytes_transferred));

        assert_eq!(controller.session().state, SessionState::Idle);
        let mut steps = 0;
        while !controller.poll() {
            steps += 1;
            assert!(!controller.session().state.is_terminal());
        }
        receiver.join().unwrap().unwrap();

        assert!(steps > 3);
        assert!(controller.is_finished());
        assert_eq!(controller.session().state, SessionState::Completed);
        assert_eq!(controller.session().bytes_transferred, 300);
        assert_eq!(*seen.lock().unwrap(), vec![128, 256, 300]);
        assert!(matches!(controller.result(), Some(Ok(Outcome::Sent(_)))));
    }

    #[test]
    fn test_no_response_marks_session_failed() {
        let mut cfg = fast(Protocol::YModem, BlockSize::Standard);
        cfg.handshake_attempts = 2;
        let mock_serial = Box::new(MockSerialPort::new(vec![None, None], vec![]));
        let files = vec![OutgoingFile::new("test.txt", b"data".to_vec())];

        let mut controller = SessionController::start_send(mock_serial, files, cfg);
        while !controller.poll() {}

        assert_eq!(controller.session().state, SessionState::Failed);
        assert!(matches!(controller.result(), Some(Err(TransferError::NoResponse))));
    }

    #[test]
    fn test_peer_cancel_marks_session_cancelled() {
        let mut input = FrameCodec::new(ChecksumMode::Crc16)
            .encode(&crate::frame::Frame::data(1, BlockSize::Standard, b"part", PAD))
            .to_vec();
        input.push(CAN);
        let responses = input.into_iter().map(Some).collect();

        let mock_serial = Box::new(MockSerialPort::new(responses, vec![CRC_REQUEST, ACK]));
        let mut controller = SessionController::start_receive(mock_serial, fast(Protocol::XModem, BlockSize::Standard));
        while !controller.poll() {}

        assert_eq!(controller.session().state, SessionState::Cancelled);
        assert!(matches!(
            controller.result(),
            Some(Err(TransferError::Cancelled(CancelOrigin::Peer)))
        ));
    }

    #[test]
    fn test_cancel_token_stops_session() {
        let mock_serial = Box::new(MockSerialPort::new(vec![], ABORT_SEQUENCE.to_vec()));
        let controller = SessionController::start_receive(mock_serial, fast(Protocol::YModem, BlockSize::Standard));
        controller.cancel_token().cancel();

        assert!(matches!(
            controller.run(),
            Err(TransferError::Cancelled(CancelOrigin::Local))
        ));
    }

    #[test]
    fn test_receive_file_keeps_first_of_batch() {
        let (a, b) = LoopbackPort::pair();
        let cfg = fast(Protocol::YModem, BlockSize::Standard);

        let receiver_cfg = cfg.clone();
        let receiver = thread::spawn(move || receive_file(Box::new(b), receiver_cfg));

        let files = vec![
            OutgoingFile::new("one.txt", b"one".to_vec()),
            OutgoingFile::new("two.txt", b"two".to_vec()),
        ];
        transfer(Box::new(a), TransferRequest::Send { files }, cfg).unwrap();
        let file = receiver.join().unwrap().unwrap();

        assert_eq!(file.filename.as_deref(), Some("one.txt"));
        assert_eq!(file.data, b"one");
    }

    #[test]
    fn test_receive_file_on_empty_batch() {
        let responses = FrameCodec::new(ChecksumMode::Crc16)
            .encode(&batch_end_frame())
            .iter()
            .map(|&b| Some(b))
            .collect();
        let mock_serial = Box::new(MockSerialPort::new(responses, vec![CRC_REQUEST, ACK]));

        let result = receive_file(mock_serial, fast(Protocol::YModem, BlockSize::Standard));
        assert!(matches!(result, Err(TransferError::EmptyBatch)));
    }
}
