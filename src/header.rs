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

//! YMODEM block 0: `name NUL size [fields...]`, zero padded.

use crate::error::TransferError;
use crate::frame::{BlockSize, Frame};
use crate::protocol::HEADER_PAD;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileHeader {
    pub name: String,
    pub size: Option<u64>,
}

impl FileHeader {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        FileHeader {
            name: name.into(),
            size: Some(size),
        }
    }

    /// Raw header bytes before padding.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.name.len() + 21);
        buf.extend_from_slice(self.name.as_bytes());
        buf.push(0);
        if let Some(size) = self.size {
            buf.extend_from_slice(size.to_string().as_bytes());
        }
        buf
    }

    /// Block 0 frame carrying this header, 1K only when 128 bytes is too small.
    pub fn to_frame(&self) -> Result<Frame, TransferError> {
        if self.name.is_empty() || self.name.contains('\0') {
            return Err(TransferError::InvalidRequest(format!(
                "unusable filename {:?}",
                self.name
            )));
        }

        let bytes = self.to_bytes();
        let size = BlockSize::fitting(bytes.len()).ok_or_else(|| {
            TransferError::InvalidRequest(format!(
                "filename too long for a header block ({} bytes)",
                self.name.len()
            ))
        })?;

        Ok(Frame::data(0, size, &bytes, HEADER_PAD))
    }

    /// Parse a block 0 payload. `None` is the null header that ends a batch.
    pub fn parse(payload: &[u8]) -> Option<Self> {
        let name_end = payload.iter().position(|&b| b == 0).unwrap_or(payload.len());
        if name_end == 0 {
            return None;
        }

        let name = String::from_utf8_lossy(&payload[..name_end]).into_owned();

        let rest = payload.get(name_end + 1..).unwrap_or(&[]);
        let fields_end = rest.iter().position(|&b| b == 0).unwrap_or(rest.len());
        let size = std::str::from_utf8(&rest[..fields_end])
            .ok()
            .and_then(|fields| fields.split(' ').next())
            .and_then(|s| s.parse::<u64>().ok());

        Some(FileHeader { name, size })
    }
}

/// Payload of the null header that terminates a YMODEM batch.
pub fn batch_end_frame() -> Frame {
    Frame::data(0, BlockSize::Standard, &[], HEADER_PAD)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameKind;

    #[test]
    fn test_header_frame_layout() {
        let frame = FileHeader::new("test.txt", 300).to_frame().unwrap();

        assert_eq!(frame.kind, FrameKind::Soh);
        assert_eq!(frame.block, 0);
        assert_eq!(&frame.payload[..12], b"test.txt\x00300");
        assert!(frame.payload[12..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_long_name_uses_1k_block() {
        let name = "n".repeat(200);
        let frame = FileHeader::new(name, 1).to_frame().unwrap();
        assert_eq!(frame.kind, FrameKind::Stx);
    }

    #[test]
    fn test_name_too_long_is_rejected() {
        let name = "n".repeat(1024);
        assert!(matches!(
            FileHeader::new(name, 1).to_frame(),
            Err(TransferError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_empty_name_is_rejected() {
        assert!(FileHeader::new("", 1).to_frame().is_err());
    }

    #[test]
    fn test_parse() {
        let mut payload = [0u8; 128];
        payload[..16].copy_from_slice(b"foo.bin\x001234 777");
        assert_eq!(
            FileHeader::parse(&payload),
            Some(FileHeader::new("foo.bin", 1234))
        );

        payload[8..16].fill(0);
        assert_eq!(
            FileHeader::parse(&payload),
            Some(FileHeader { name: "foo.bin".into(), size: None })
        );
    }

    #[test]
    fn test_parse_unterminated() {
        let payload = [b'a'; 128];
        let header = FileHeader::parse(&payload).unwrap();
        assert_eq!(header.name.len(), 128);
        assert_eq!(header.size, None);
    }

    #[test]
    fn test_parse_null_header() {
        assert_eq!(FileHeader::parse(&batch_end_frame().payload), None);
    }
}
