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
use serialport::{ClearBuffer, DataBits, Parity, SerialPort as SerialPortTrait, StopBits};

// ============================================================================
// ByteChannel Trait
// ============================================================================

/// Duplex byte transport the transfer engine runs over.
///
/// A read that sees no data within its timeout fails with
/// `io::ErrorKind::TimedOut`; any other error is fatal to the session.
pub trait ByteChannel: Send {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()>;

    /// Read whatever is available, at most `buf.len()` bytes.
    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize>;

    /// Discard bytes received but not yet read.
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }

    /// Fill `buf` completely, each chunk bounded by `timeout`.
    fn read_exact_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.read_timeout(&mut buf[filled..], timeout)? {
                0 => return Err(io::Error::new(io::ErrorKind::TimedOut, "short read")),
                n => filled += n,
            }
        }
        Ok(())
    }

    fn read_byte(&mut self, timeout: Duration) -> io::Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact_timeout(&mut buf, timeout)?;
        Ok(buf[0])
    }
}

// ============================================================================
// Real Serial Port Implementation
// ============================================================================

/// UART channel backed by the serialport crate
pub struct RealSerialPort {
    port: Box<dyn SerialPortTrait>,
}

impl RealSerialPort {
    pub fn open(
        port_name: &str,
        baud_rate: u32,
        data_bits: DataBits,
        parity: Parity,
        stop_bits: StopBits,
    ) -> Result<Self, serialport::Error> {
        let port = serialport::new(port_name, baud_rate)
            .data_bits(data_bits)
            .parity(parity)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(100))
            .open()?;

        Ok(RealSerialPort { port })
    }
}

impl ByteChannel for RealSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        self.port.write_all(buf)?;
        self.port.flush()?;
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        self.port.set_timeout(timeout)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.port.read(buf)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))
    }
}

// ============================================================================
// Mock Serial Port for Testing
// ============================================================================

#[cfg(test)]
pub struct MockSerialPort {
    // Data to return on reads (None = timeout)
    read_buffer: Vec<Option<u8>>,
    read_pos: usize,
    // Track what was written
    write_log: Vec<u8>,
    // Expected writes for verification
    expected_writes: Vec<u8>,
    // Fail the next write with this error kind
    fail_write: Option<io::ErrorKind>,
}

#[cfg(test)]
impl MockSerialPort {
    pub fn new(responses: Vec<Option<u8>>, expected_writes: Vec<u8>) -> Self {
        MockSerialPort {
            read_buffer: responses,
            read_pos: 0,
            write_log: Vec::new(),
            expected_writes,
            fail_write: None,
        }
    }

    /// Replays `responses` but rejects every write with `kind`.
    pub fn failing_writes(responses: Vec<Option<u8>>, kind: io::ErrorKind) -> Self {
        let mut port = MockSerialPort::new(responses, Vec::new());
        port.fail_write = Some(kind);
        port
    }
}

#[cfg(test)]
impl ByteChannel for MockSerialPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        if let Some(kind) = self.fail_write {
            return Err(io::Error::new(kind, "Mock write failure"));
        }
        self.write_log.extend_from_slice(buf);
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], _timeout: Duration) -> io::Result<usize> {
        // Out of responses = timeout
        if self.read_pos >= self.read_buffer.len() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Mock timeout"));
        }

        // If current response is None = timeout
        if self.read_buffer[self.read_pos].is_none() {
            self.read_pos += 1;
            return Err(io::Error::new(io::ErrorKind::TimedOut, "Mock timeout"));
        }

        let mut bytes_read = 0;
        while bytes_read < buf.len() && self.read_pos < self.read_buffer.len() {
            match self.read_buffer[self.read_pos] {
                Some(byte) => {
                    buf[bytes_read] = byte;
                    bytes_read += 1;
                    self.read_pos += 1;
                }
                None => break,  // Stop at timeout marker
            }
        }

        Ok(bytes_read)
    }
}

#[cfg(test)]
impl Drop for MockSerialPort {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }

        assert_eq!(
            self.read_pos,
            self.read_buffer.len(),
            "MockSerialPort dropped with {} unconsumed responses (read {} of {} bytes)",
            self.read_buffer.len() - self.read_pos,
            self.read_pos,
            self.read_buffer.len()
        );

        assert_eq!(
            &self.write_log,
            &self.expected_writes,
            "MockSerialPort write log mismatch!\nExpected {} bytes:\n{:02X?}\nGot {} bytes:\n{:02X?}",
            self.expected_writes.len(),
            self.expected_writes,
            self.write_log.len(),
            self.write_log
        );
    }
}

// ============================================================================
// In-memory loopback for sender/receiver runs
// ============================================================================

#[cfg(test)]
pub struct LoopbackPort {
    tx: std::sync::mpsc::Sender<u8>,
    rx: std::sync::mpsc::Receiver<u8>,
}

#[cfg(test)]
impl LoopbackPort {
    /// Two ports wired back to back.
    pub fn pair() -> (LoopbackPort, LoopbackPort) {
        let (a_tx, b_rx) = std::sync::mpsc::channel();
        let (b_tx, a_rx) = std::sync::mpsc::channel();
        (
            LoopbackPort { tx: a_tx, rx: a_rx },
            LoopbackPort { tx: b_tx, rx: b_rx },
        )
    }
}

#[cfg(test)]
impl ByteChannel for LoopbackPort {
    fn write_all(&mut self, buf: &[u8]) -> io::Result<()> {
        for &b in buf {
            self.tx.send(b)
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "peer hung up"))?;
        }
        Ok(())
    }

    fn read_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> io::Result<usize> {
        use std::sync::mpsc::RecvTimeoutError;

        if buf.is_empty() {
            return Ok(0);
        }

        buf[0] = match self.rx.recv_timeout(timeout) {
            Ok(b) => b,
            Err(RecvTimeoutError::Timeout) => {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "Loopback timeout"));
            }
            Err(RecvTimeoutError::Disconnected) => {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "peer hung up"));
            }
        };

        let mut n = 1;
        while n < buf.len() {
            match self.rx.try_recv() {
                Ok(b) => {
                    buf[n] = b;
                    n += 1;
                }
                Err(_) => break,
            }
        }
        Ok(n)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        while self.rx.try_recv().is_ok() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_exact_spans_chunks() {
        let mut port = MockSerialPort::new(vec![Some(1), Some(2), Some(3)], vec![]);
        let mut buf = [0u8; 3];
        port.read_exact_timeout(&mut buf, Duration::from_millis(10)).unwrap();
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_read_exact_times_out_mid_frame() {
        let mut port = MockSerialPort::new(vec![Some(1), None], vec![]);
        let mut buf = [0u8; 2];
        let err = port.read_exact_timeout(&mut buf, Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_loopback_pair() {
        let (mut a, mut b) = LoopbackPort::pair();
        a.write_all(b"hi").unwrap();
        assert_eq!(b.read_byte(Duration::from_millis(100)).unwrap(), b'h');
        assert_eq!(b.read_byte(Duration::from_millis(100)).unwrap(), b'i');
        let err = b.read_byte(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
