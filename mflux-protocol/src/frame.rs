//! Binary packet header format.
//!
//! Every request and response body is a sequence of packets. Each packet
//! starts with a 16 byte header, followed by the mime type bytes and then
//! the payload:
//!
//! ```text
//! +--------+----------+------------+-----------+-----------+
//! | format | compress | length     | remaining | mime_len  |
//! | 1 byte | 1 byte   | i64 BE     | i32 BE    | i16 BE    |
//! +--------+----------+------------+-----------+-----------+
//! | mime type (mime_len bytes) | payload (length bytes)    |
//! +----------------------------+---------------------------+
//! ```
//!
//! A length of `-1` means the payload length is not known up front and the
//! reader has to consume until the transport signals the end of the data.
//! `remaining` counts the packets that still follow this one, so the last
//! packet of a message carries `0`.

use crate::error::ProtocolError;
use bytes::{BufMut, BytesMut};

/// Format marker carried in the first header byte.
pub const FORMAT_MARKER: u8 = 0x01;

/// Size of the fixed packet header in bytes (1+1+8+4+2 = 16).
pub const PACKET_HEADER_SIZE: usize = 16;

/// Length sentinel for payloads whose size is not known in advance.
pub const UNKNOWN_LENGTH: i64 = -1;

/// A decoded packet header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeader {
    /// Payload is flagged as compressed.
    pub compressed: bool,
    /// Payload length, or [`UNKNOWN_LENGTH`].
    pub length: i64,
    /// Number of packets that follow this one.
    pub remaining: i32,
    /// Mime type of the payload, if any.
    pub mime_type: Option<String>,
}

impl PacketHeader {
    pub fn new(length: i64, remaining: i32) -> Self {
        Self {
            compressed: false,
            length,
            remaining,
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Returns whether the payload length is known.
    pub fn has_known_length(&self) -> bool {
        self.length >= 0
    }

    /// Number of bytes the header occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        PACKET_HEADER_SIZE + self.mime_type.as_ref().map_or(0, |m| m.len())
    }

    /// Encodes the header into bytes.
    pub fn encode(&self) -> Result<BytesMut, ProtocolError> {
        if self.length < UNKNOWN_LENGTH {
            return Err(ProtocolError::InvalidHeader(format!(
                "negative payload length {}",
                self.length
            )));
        }
        if self.remaining < 0 {
            return Err(ProtocolError::InvalidHeader(format!(
                "negative remaining count {}",
                self.remaining
            )));
        }

        let mime = self.mime_type.as_deref().unwrap_or("").as_bytes();
        let mime_len = i16::try_from(mime.len())
            .map_err(|_| ProtocolError::MimeTypeTooLong(mime.len()))?;

        let mut buf = BytesMut::with_capacity(PACKET_HEADER_SIZE + mime.len());
        buf.put_u8(FORMAT_MARKER);
        buf.put_u8(u8::from(self.compressed));
        buf.put_i64(self.length);
        buf.put_i32(self.remaining);
        buf.put_i16(mime_len);
        buf.put_slice(mime);

        Ok(buf)
    }

    /// Decodes a header from the start of `buf` without consuming it.
    ///
    /// Returns `Ok(Some((header, size)))` where `size` is the number of
    /// header bytes (including the mime type), `Ok(None)` if more data is
    /// needed, or `Err` if the bytes cannot be a packet header.
    pub fn decode(buf: &[u8]) -> Result<Option<(Self, usize)>, ProtocolError> {
        if buf.len() < PACKET_HEADER_SIZE {
            return Ok(None);
        }

        if buf[0] != FORMAT_MARKER {
            return Err(ProtocolError::UnsupportedFormat(buf[0]));
        }
        let compressed = buf[1] != 0;

        let length = i64::from_be_bytes([
            buf[2], buf[3], buf[4], buf[5], buf[6], buf[7], buf[8], buf[9],
        ]);
        if length < UNKNOWN_LENGTH {
            return Err(ProtocolError::InvalidHeader(format!(
                "negative payload length {}",
                length
            )));
        }

        let remaining = i32::from_be_bytes([buf[10], buf[11], buf[12], buf[13]]);
        if remaining < 0 {
            return Err(ProtocolError::InvalidHeader(format!(
                "negative remaining count {}",
                remaining
            )));
        }

        // Non-positive lengths mean "no mime type".
        let mime_len = i16::from_be_bytes([buf[14], buf[15]]).max(0) as usize;
        let total = PACKET_HEADER_SIZE + mime_len;
        if buf.len() < total {
            return Ok(None);
        }

        let mime_type = if mime_len == 0 {
            None
        } else {
            let raw = &buf[PACKET_HEADER_SIZE..total];
            Some(String::from_utf8_lossy(raw).into_owned())
        };

        Ok(Some((
            Self {
                compressed,
                length,
                remaining,
                mime_type,
            },
            total,
        )))
    }
}
