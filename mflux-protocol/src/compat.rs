//! Legacy server encodings layered over HTTP chunked transfer.
//!
//! Some server versions write packet bodies with extra length framing inside
//! the HTTP chunks. The byte patterns are matched exactly as the server emits
//! them:
//!
//! - **Length override**: a 4 byte chunk followed by CRLF carries a big
//!   endian `i32` that replaces the size of the next chunk. The next chunk's
//!   hex size line, when it starts within 8 bytes, must echo the same value.
//!   An override of `-1` terminates an unknown-length body.
//! - **Post-header marker**: when a packet header carrying a mime type is
//!   followed by exactly 4 buffered bytes at a chunk boundary, those bytes
//!   are a length marker and not payload.
//! - **Length wrapper**: in unknown-length bodies a chunk of the form
//!   `len-8 (i32 BE) | data | FF FF FF FF` is unwrapped to `data`.
//!
//! All three are applied only when [`ChunkCompat::Legacy`] is selected.

use bytes::{Buf, BytesMut};

/// Chunked transfer decoding mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChunkCompat {
    /// Recognize the legacy in-chunk length framing.
    #[default]
    Legacy,
    /// Plain HTTP/1.1 chunked decoding.
    Strict,
}

impl ChunkCompat {
    pub fn is_legacy(self) -> bool {
        self == ChunkCompat::Legacy
    }
}

/// Override value that marks the end of an unknown-length body.
pub const TERMINATOR_OVERRIDE: i32 = -1;

/// Trailer that closes a wrapped chunk.
const WRAPPER_TRAILER: [u8; 4] = [0xFF; 4];

/// The echoed size line must start within this many bytes.
const MAX_ECHO_OFFSET: usize = 8;

/// Reads a length override from the data of a 4 byte chunk.
///
/// `raw` starts at the chunk data. Needs at least 6 bytes to decide.
pub fn length_override(raw: &[u8]) -> Option<i32> {
    if raw.len() < 6 || &raw[4..6] != b"\r\n" {
        return None;
    }
    Some(i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

/// Result of looking for the hex size line that echoes an override.
#[derive(Debug, PartialEq, Eq)]
pub enum EchoScan {
    /// The line ends at this offset.
    Found(usize),
    /// Not enough bytes buffered to decide.
    NeedMore,
    /// No echo line; the override applies to the bytes that follow.
    Absent,
}

pub fn scan_echo(raw: &[u8]) -> EchoScan {
    match find_crlf(raw) {
        Some(idx) if idx <= MAX_ECHO_OFFSET => EchoScan::Found(idx),
        Some(_) => EchoScan::Absent,
        None if raw.len() < MAX_ECHO_OFFSET + 2 => EchoScan::NeedMore,
        None => EchoScan::Absent,
    }
}

/// Returns whether the bytes left after a packet header are the
/// post-header length marker.
pub fn is_header_marker(has_mime_type: bool, pending: usize, at_chunk_boundary: bool) -> bool {
    has_mime_type && pending == 4 && at_chunk_boundary
}

/// Unwraps a `len-8 | data | FF FF FF FF` chunk in place.
///
/// Returns `true` if the chunk was wrapped.
pub fn strip_length_wrapper(chunk: &mut BytesMut) -> bool {
    let len = chunk.len();
    if len < 8 || chunk[len - 4..] != WRAPPER_TRAILER {
        return false;
    }
    let declared = i32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    if i64::from(declared) != len as i64 - 8 {
        return false;
    }
    chunk.truncate(len - 4);
    chunk.advance(4);
    true
}

pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
