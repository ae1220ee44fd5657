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

//! XMODEM and YMODEM file transfer over any byte channel.
//!
//! The codec in [`frame`] turns blocks into bytes and back, the typed state
//! machines in [`sender`] and [`receiver`] run the protocol, and
//! [`controller`] drives either one to a [`TransferResult`].

pub mod config;
pub mod controller;
pub mod error;
pub mod frame;
pub mod header;
mod link;
pub mod protocol;
pub mod receiver;
pub mod sender;
pub mod serial;
pub mod session;

pub use config::{Protocol, TransferConfig};
pub use controller::{
    Outcome, SessionController, TransferRequest, TransferResult, receive_file, send_file, transfer,
};
pub use error::{CancelOrigin, DecodeError, TransferError};
pub use frame::{BlockSize, ChecksumMode, Frame, FrameCodec, FrameKind};
pub use receiver::ReceivedFile;
pub use sender::{OutgoingFile, SendReport};
pub use serial::{ByteChannel, RealSerialPort};
pub use session::{CancelToken, Role, Session, SessionState};
