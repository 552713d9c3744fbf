//! HTTP chunked transfer decoding.

use crate::compat::{self, ChunkCompat, EchoScan, TERMINATOR_OVERRIDE};
use crate::error::ProtocolError;
use crate::BUFFER_SIZE;
use bytes::{Buf, BytesMut};
use std::io::{self, Read};
use tracing::trace;

/// Longest chunk size line accepted, extensions included.
const MAX_SIZE_LINE: usize = 1024;

/// Longest chunk handed out in one piece. Larger chunks are split into
/// [`BUFFER_SIZE`] pieces. The margin keeps a full buffer inside a legacy
/// `len-8 | data | FFFFFFFF` wrapper whole.
const WHOLE_CHUNK_LIMIT: usize = BUFFER_SIZE + 8;

/// Decodes HTTP chunks from a byte stream.
///
/// Bytes already read past the response head are passed in as `residual`.
/// The CRLF that closes a chunk's data is left in the raw buffer until the
/// next chunk is requested.
pub struct ChunkDecoder<R> {
    reader: R,
    raw: BytesMut,
    compat: ChunkCompat,
    /// Data bytes of the current chunk not yet handed out.
    left: usize,
    /// Whether the last piece handed out was a complete chunk.
    whole: bool,
    finished: bool,
}

impl<R: Read> ChunkDecoder<R> {
    pub fn new(reader: R, residual: BytesMut, compat: ChunkCompat) -> Self {
        Self {
            reader,
            raw: residual,
            compat,
            left: 0,
            whole: false,
            finished: false,
        }
    }

    pub fn compat(&self) -> ChunkCompat {
        self.compat
    }

    /// Returns whether the last-chunk has been seen or the stream ended.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns whether part of the current chunk is still to be read.
    pub fn in_chunk(&self) -> bool {
        self.left > 0
    }

    /// Returns whether the last piece returned by [`next_chunk`] held a
    /// complete chunk.
    ///
    /// [`next_chunk`]: ChunkDecoder::next_chunk
    pub fn last_was_whole(&self) -> bool {
        self.whole
    }

    /// Reads the next piece of chunk data.
    ///
    /// Chunks up to `BUFFER_SIZE + 8` bytes come back whole; longer ones in
    /// pieces of at most [`BUFFER_SIZE`] bytes. Returns `Ok(None)` after the
    /// zero-size last chunk or when the stream ends. An empty piece is
    /// returned for the legacy body terminator. A chunk cut short by the end
    /// of the stream is returned with the bytes that did arrive.
    pub fn next_chunk(&mut self) -> Result<Option<BytesMut>, ProtocolError> {
        if self.left == 0 {
            if self.finished {
                return Ok(None);
            }
            match self.start_chunk()? {
                Some(0) => {
                    self.whole = true;
                    return Ok(Some(BytesMut::new()));
                }
                Some(size) => {
                    self.left = size;
                    self.whole = size <= WHOLE_CHUNK_LIMIT;
                }
                None => return Ok(None),
            }
        }

        let want = if self.whole {
            self.left
        } else {
            self.left.min(BUFFER_SIZE)
        };
        while self.raw.len() < want {
            if self.fill_raw()? == 0 {
                self.finished = true;
                self.left = 0;
                if self.raw.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(self.raw.split()));
            }
        }
        self.left -= want;
        Ok(Some(self.raw.split_to(want)))
    }

    /// Reads a chunk size line and any legacy length override. Returns the
    /// data size, `Some(0)` for the legacy terminator and `None` at the end.
    fn start_chunk(&mut self) -> Result<Option<usize>, ProtocolError> {
        self.skip_crlfs()?;

        let line_end = loop {
            if let Some(idx) = compat::find_crlf(&self.raw) {
                break idx;
            }
            if self.raw.len() > MAX_SIZE_LINE {
                return Err(ProtocolError::InvalidChunkSize(
                    String::from_utf8_lossy(&self.raw[..32]).into_owned(),
                ));
            }
            if self.fill_raw()? == 0 {
                self.finished = true;
                return Ok(None);
            }
        };
        let mut size = parse_size_line(&self.raw[..line_end])?;
        self.raw.advance(line_end + 2);

        if size == 0 {
            trace!("last chunk");
            self.finished = true;
            return Ok(None);
        }

        if size == 4 && self.compat.is_legacy() {
            self.ensure(6)?;
            if let Some(value) = compat::length_override(&self.raw) {
                self.raw.advance(6);
                if value == TERMINATOR_OVERRIDE {
                    trace!("body terminator chunk");
                    return Ok(Some(0));
                }
                size = self.apply_override(value)?;
                if size == 0 {
                    return Ok(Some(0));
                }
            }
        }

        trace!(size, "chunk");
        Ok(Some(size))
    }

    /// Returns whether the raw stream is positioned at the CRLF that closes
    /// a chunk.
    pub fn at_chunk_boundary(&mut self) -> Result<bool, ProtocolError> {
        if self.left > 0 {
            return Ok(false);
        }
        self.ensure(2)?;
        Ok(self.raw.starts_with(b"\r\n"))
    }

    fn apply_override(&mut self, value: i32) -> Result<usize, ProtocolError> {
        if value < 0 {
            return Err(ProtocolError::InvalidChunkSize(format!(
                "negative length override {}",
                value
            )));
        }
        loop {
            match compat::scan_echo(&self.raw) {
                EchoScan::Found(idx) => {
                    let echoed = parse_size_line(&self.raw[..idx])?;
                    if echoed != value as usize {
                        return Err(ProtocolError::ChunkLengthMismatch {
                            declared: i64::from(value),
                            echoed: echoed as i64,
                        });
                    }
                    self.raw.advance(idx + 2);
                    break;
                }
                EchoScan::NeedMore => {
                    if self.fill_raw()? == 0 {
                        break;
                    }
                }
                EchoScan::Absent => break,
            }
        }
        trace!(length = value, "chunk length override");
        Ok(value as usize)
    }

    fn skip_crlfs(&mut self) -> Result<(), ProtocolError> {
        loop {
            if !self.ensure(2)? {
                return Ok(());
            }
            if !self.raw.starts_with(b"\r\n") {
                return Ok(());
            }
            self.raw.advance(2);
        }
    }

    /// Reads until at least `n` raw bytes are buffered. Returns `false` if the
    /// stream ended first.
    fn ensure(&mut self, n: usize) -> Result<bool, ProtocolError> {
        while self.raw.len() < n {
            if self.fill_raw()? == 0 {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn fill_raw(&mut self) -> Result<usize, ProtocolError> {
        read_into(&mut self.reader, &mut self.raw)
    }
}

/// Reads up to [`BUFFER_SIZE`] bytes from `reader` and appends them to `buf`.
pub(crate) fn read_into<R: Read>(reader: &mut R, buf: &mut BytesMut) -> Result<usize, ProtocolError> {
    let mut block = [0u8; BUFFER_SIZE];
    loop {
        match reader.read(&mut block) {
            Ok(n) => {
                buf.extend_from_slice(&block[..n]);
                return Ok(n);
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(ProtocolError::from_read(e)),
        }
    }
}

fn parse_size_line(line: &[u8]) -> Result<usize, ProtocolError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProtocolError::InvalidChunkSize(String::from_utf8_lossy(line).into_owned()))?;
    let digits = text.split(';').next().unwrap_or("").trim();
    usize::from_str_radix(digits, 16).map_err(|_| ProtocolError::InvalidChunkSize(text.to_string()))
}
