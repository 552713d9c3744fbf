//! Response demultiplexing.
//!
//! A response body is a sequence of packets: packet 0 carries the reply
//! document and packets `1..=n` carry the service outputs, in order. The
//! body arrives either as raw bytes after the head (counted by packet
//! lengths) or wrapped in HTTP chunks. Both paths go through the same packet
//! loop; only the source of protocol bytes differs.

use crate::chunked::{read_into, ChunkDecoder};
use crate::compat::{self, ChunkCompat};
use crate::error::ProtocolError;
use crate::frame::PacketHeader;
use crate::http::{read_head, ResponseHead};
use crate::output::Output;
use crate::xml::XmlElement;
use crate::BUFFER_SIZE;
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use tracing::{debug, warn};

/// The reply carried by packet 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The `result` element of a successful reply.
    Result(XmlElement),
    /// The whole `reply` element of a failed call.
    Error(XmlElement),
}

impl Reply {
    /// Classifies a reply document by the `type` attribute of its `reply`
    /// element. The document root may be `response` or `reply` itself.
    pub fn parse(bytes: &[u8]) -> Result<Self, ProtocolError> {
        let root = XmlElement::parse_bytes(bytes)?;
        let reply = if root.name() == "reply" {
            root
        } else {
            root.element("reply")?
                .cloned()
                .ok_or(ProtocolError::UnexpectedReplyType(None))?
        };

        let kind = reply.attribute("type").map(str::to_string);
        match kind.as_deref() {
            Some("result") => {
                let result = reply
                    .element("result")?
                    .cloned()
                    .unwrap_or_else(|| XmlElement::new("result"));
                Ok(Reply::Result(result))
            }
            Some("error") => Ok(Reply::Error(reply)),
            _ => Err(ProtocolError::UnexpectedReplyType(kind)),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

/// A fully read response.
#[derive(Debug)]
pub struct Response {
    pub head: ResponseHead,
    pub reply: Reply,
}

/// Reads a response from a byte stream into a reply and output sinks.
pub struct ResponseReader<R> {
    inner: R,
    compat: ChunkCompat,
}

impl<R: Read> ResponseReader<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            compat: ChunkCompat::default(),
        }
    }

    pub fn with_compat(mut self, compat: ChunkCompat) -> Self {
        self.compat = compat;
        self
    }

    /// Reads the head and every packet of the response.
    ///
    /// Outputs are written in packet order. If the reply is an error the
    /// remaining packets are drained and no output is opened. A packet count
    /// that disagrees with `outputs.len()` fails before any output is
    /// opened.
    pub fn read_response(mut self, outputs: &mut [Output]) -> Result<Response, ProtocolError> {
        let mut raw = BytesMut::new();
        let head = read_head(&mut self.inner, &mut raw)?;

        let reply = if head.is_chunked() {
            let mut feed = ChunkedFeed {
                decoder: ChunkDecoder::new(&mut self.inner, raw, self.compat),
            };
            demux(&mut feed, outputs)?
        } else {
            let mut feed = DirectFeed {
                reader: &mut self.inner,
                residual: raw,
            };
            demux(&mut feed, outputs)?
        };

        Ok(Response { head, reply })
    }
}

/// Source of protocol bytes for the packet loop.
trait Feed {
    /// Appends the next run of protocol bytes to `pending`. Returns the
    /// number of bytes appended, `0` at the end of the data.
    fn fill(&mut self, pending: &mut BytesMut) -> Result<usize, ProtocolError>;

    fn is_chunked(&self) -> bool;

    /// Whether the HTTP chunk currently being read has bytes left.
    fn in_chunk(&self) -> bool {
        false
    }

    /// Called with the bytes left over once a packet header is consumed.
    fn after_header(
        &mut self,
        _header: &PacketHeader,
        _pending: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        Ok(())
    }

    /// Called on each run of an unknown-length body before it is written.
    fn unwrap_body(&self, _run: &mut BytesMut) {}
}

/// Bytes straight from the stream after the head.
struct DirectFeed<'a, R> {
    reader: &'a mut R,
    residual: BytesMut,
}

impl<R: Read> Feed for DirectFeed<'_, R> {
    fn fill(&mut self, pending: &mut BytesMut) -> Result<usize, ProtocolError> {
        if !self.residual.is_empty() {
            let n = self.residual.len();
            pending.extend_from_slice(&self.residual);
            self.residual.clear();
            return Ok(n);
        }
        read_into(&mut *self.reader, pending)
    }

    fn is_chunked(&self) -> bool {
        false
    }
}

/// One piece of chunk data per fill, at most one buffer unless the chunk is
/// small enough to hand out whole.
struct ChunkedFeed<R> {
    decoder: ChunkDecoder<R>,
}

impl<R: Read> Feed for ChunkedFeed<R> {
    fn fill(&mut self, pending: &mut BytesMut) -> Result<usize, ProtocolError> {
        match self.decoder.next_chunk()? {
            Some(chunk) => {
                pending.extend_from_slice(&chunk);
                Ok(chunk.len())
            }
            None => Ok(0),
        }
    }

    fn is_chunked(&self) -> bool {
        true
    }

    fn in_chunk(&self) -> bool {
        self.decoder.in_chunk()
    }

    fn after_header(
        &mut self,
        header: &PacketHeader,
        pending: &mut BytesMut,
    ) -> Result<(), ProtocolError> {
        if !self.decoder.compat().is_legacy() || pending.len() != 4 {
            return Ok(());
        }
        let boundary = self.decoder.at_chunk_boundary()?;
        if compat::is_header_marker(header.mime_type.is_some(), pending.len(), boundary) {
            debug!(
                marker = i32::from_be_bytes([pending[0], pending[1], pending[2], pending[3]]),
                "discarding post-header length marker"
            );
            pending.clear();
        }
        Ok(())
    }

    fn unwrap_body(&self, run: &mut BytesMut) {
        if self.decoder.compat().is_legacy() && self.decoder.last_was_whole() {
            compat::strip_length_wrapper(run);
        }
    }
}

fn demux<F: Feed>(feed: &mut F, outputs: &mut [Output]) -> Result<Reply, ProtocolError> {
    let mut pending = BytesMut::new();

    let header = next_header(feed, &mut pending, 0)?;
    let envelope = read_envelope(feed, &mut pending, &header)?;
    let reply = Reply::parse(&envelope)?;

    if reply.is_error() {
        drain(feed, &mut pending, header.remaining)?;
        return Ok(reply);
    }

    if header.remaining as usize != outputs.len() {
        return Err(ProtocolError::OutputCountMismatch {
            expected: outputs.len(),
            found: header.remaining,
        });
    }

    let mut remaining = header.remaining;
    let mut index = 0;
    while remaining > 0 {
        index += 1;
        let header = next_header(feed, &mut pending, index)?;
        let expected = outputs.len() - index;
        if header.remaining as usize != expected {
            return Err(ProtocolError::PacketCountMismatch {
                index,
                expected,
                found: header.remaining,
            });
        }

        let output = &mut outputs[index - 1];
        output.set_mime_type(header.mime_type.clone());
        let mut sink = output.open()?;
        let written = copy_body(feed, &mut pending, &header, index, &mut sink)?;
        sink.flush()?;
        debug!(index, bytes = written, "output received");

        remaining = header.remaining;
    }

    Ok(reply)
}

/// Decodes the next packet header, pulling more bytes as needed.
fn next_header<F: Feed>(
    feed: &mut F,
    pending: &mut BytesMut,
    index: usize,
) -> Result<PacketHeader, ProtocolError> {
    loop {
        if let Some((header, size)) = PacketHeader::decode(pending)? {
            pending.advance(size);
            debug!(
                index,
                length = header.length,
                remaining = header.remaining,
                mime_type = ?header.mime_type,
                "packet header"
            );
            if header.compressed {
                warn!(index, "packet flagged as compressed, passing payload through");
            }
            feed.after_header(&header, pending)?;
            return Ok(header);
        }
        if feed.fill(pending)? == 0 {
            return Err(ProtocolError::IncompletePacket { index });
        }
    }
}

fn read_envelope<F: Feed>(
    feed: &mut F,
    pending: &mut BytesMut,
    header: &PacketHeader,
) -> Result<BytesMut, ProtocolError> {
    if header.has_known_length() {
        let length = header.length as usize;
        while pending.len() < length {
            if feed.fill(pending)? == 0 {
                return Err(ProtocolError::IncompletePacket { index: 0 });
            }
        }
        return Ok(pending.split_to(length));
    }

    if feed.is_chunked() {
        // Unknown-length envelope: the rest of the chunk that carried its header.
        while feed.in_chunk() && feed.fill(pending)? > 0 {}
        return Ok(pending.split());
    }
    if header.remaining != 0 {
        return Err(ProtocolError::UnknownLengthNotFinal { index: 0 });
    }
    while feed.fill(pending)? > 0 {}
    Ok(pending.split())
}

/// Copies one packet body into `sink`, returning the bytes written.
fn copy_body<F: Feed>(
    feed: &mut F,
    pending: &mut BytesMut,
    header: &PacketHeader,
    index: usize,
    sink: &mut dyn Write,
) -> Result<u64, ProtocolError> {
    if header.has_known_length() {
        let mut left = header.length as u64;
        loop {
            let take = (pending.len() as u64).min(left) as usize;
            if take > 0 {
                write_buffered(sink, &pending[..take])?;
                pending.advance(take);
                left -= take as u64;
            }
            if left == 0 {
                return Ok(header.length as u64);
            }
            if feed.fill(pending)? == 0 {
                return Err(ProtocolError::IncompletePacket { index });
            }
        }
    }

    // Chunked streams can delimit an unknown-length body with the legacy
    // terminator; direct streams can only end it with the stream itself.
    if !feed.is_chunked() && header.remaining != 0 {
        return Err(ProtocolError::UnknownLengthNotFinal { index });
    }

    let mut written = pending.len() as u64;
    write_buffered(sink, pending)?;
    pending.clear();
    while feed.fill(pending)? > 0 {
        feed.unwrap_body(pending);
        write_buffered(sink, pending)?;
        written += pending.len() as u64;
        pending.clear();
    }
    Ok(written)
}

/// Writes `bytes` to `sink` at most [`BUFFER_SIZE`] bytes at a time.
fn write_buffered(sink: &mut dyn Write, bytes: &[u8]) -> io::Result<()> {
    for piece in bytes.chunks(BUFFER_SIZE) {
        sink.write_all(piece)?;
    }
    Ok(())
}

/// Skips the packets that follow an error reply.
fn drain<F: Feed>(
    feed: &mut F,
    pending: &mut BytesMut,
    mut remaining: i32,
) -> Result<(), ProtocolError> {
    let mut index = 0;
    while remaining > 0 {
        index += 1;
        let header = next_header(feed, pending, index)?;
        copy_body(feed, pending, &header, index, &mut io::sink())?;
        remaining = header.remaining;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::UNKNOWN_LENGTH;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const VERSION_REPLY: &str = r#"<?xml version="1.0" encoding="UTF-8"?><response><reply type="result"><result><version>4.9</version></result></reply></response>"#;

    fn packet(body: &[u8], remaining: i32, mime_type: Option<&str>) -> Vec<u8> {
        let mut header = PacketHeader::new(body.len() as i64, remaining);
        if let Some(m) = mime_type {
            header = header.with_mime_type(m);
        }
        let mut out = header.encode().unwrap().to_vec();
        out.extend_from_slice(body);
        out
    }

    fn direct(body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/mflux\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    fn chunk(out: &mut Vec<u8>, data: &[u8]) {
        out.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        out.extend_from_slice(data);
        out.extend_from_slice(b"\r\n");
    }

    /// Chunks `pieces` as given, then writes the last chunk.
    fn chunked(pieces: &[&[u8]]) -> Vec<u8> {
        let mut out =
            b"HTTP/1.1 200 OK\r\nContent-Type: application/mflux\r\nTransfer-Encoding: chunked\r\n\r\n"
                .to_vec();
        for piece in pieces {
            chunk(&mut out, piece);
        }
        out.extend_from_slice(b"0\r\n\r\n");
        out
    }

    /// Splits `body` into chunks of `size` bytes, never producing a 4 byte
    /// chunk.
    fn fixed_chunks(body: &[u8], size: usize) -> Vec<&[u8]> {
        let mut pieces: Vec<&[u8]> = body.chunks(size).collect();
        if pieces.last().is_some_and(|p| p.len() == 4) && pieces.len() > 1 {
            let last = pieces.len() - 1;
            let start = body.len() - pieces[last].len() - pieces[last - 1].len();
            pieces.truncate(last - 1);
            pieces.push(&body[start..]);
        }
        pieces
    }

    fn read(stream: Vec<u8>, outputs: &mut [Output]) -> Result<Response, ProtocolError> {
        ResponseReader::new(Cursor::new(stream)).read_response(outputs)
    }

    fn read_strict(stream: Vec<u8>, outputs: &mut [Output]) -> Result<Response, ProtocolError> {
        ResponseReader::new(Cursor::new(stream))
            .with_compat(ChunkCompat::Strict)
            .read_response(outputs)
    }

    fn result_of(response: Response) -> XmlElement {
        match response.reply {
            Reply::Result(result) => result,
            Reply::Error(e) => panic!("unexpected error reply: {}", e),
        }
    }

    /// Reader that returns at most `step` bytes per call.
    struct Fragmented {
        data: Cursor<Vec<u8>>,
        step: usize,
    }

    impl Read for Fragmented {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let end = buf.len().min(self.step);
            self.data.read(&mut buf[..end])
        }
    }

    #[test]
    fn test_server_version_result() {
        let stream = direct(&packet(VERSION_REPLY.as_bytes(), 0, Some("text/xml")));
        let response = read(stream, &mut []).unwrap();

        assert_eq!(response.head.code, 200);
        let result = result_of(response);
        assert_eq!(result.name(), "result");
        assert_eq!(result.value("version").unwrap().as_deref(), Some("4.9"));
    }

    #[test]
    fn test_bare_reply_root() {
        let doc = br#"<reply type="result"><result><version>4.9</version></result></reply>"#;
        let response = read(direct(&packet(doc, 0, None)), &mut []).unwrap();
        assert_eq!(
            result_of(response).value("version").unwrap().as_deref(),
            Some("4.9")
        );
    }

    #[test]
    fn test_service_error_leaves_outputs_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.bin");
        let doc = br#"<response><reply type="error"><error>arc.asset.get</error><message>Asset does not exist</message></reply></response>"#;

        let mut outputs = vec![Output::to_path(&path)];
        let response = read(direct(&packet(doc, 0, Some("text/xml"))), &mut outputs).unwrap();

        match response.reply {
            Reply::Error(reply) => {
                assert_eq!(
                    reply.value("message").unwrap().as_deref(),
                    Some("Asset does not exist")
                );
            }
            Reply::Result(_) => panic!("expected error reply"),
        }
        assert!(!path.exists());
        assert_eq!(outputs[0].mime_type(), None);
    }

    #[test]
    fn test_error_reply_drains_trailing_packets() {
        let doc = br#"<response><reply type="error"><message>no</message></reply></response>"#;
        let mut body = packet(doc, 1, Some("text/xml"));
        body.extend(packet(b"leftover", 0, Some("text/plain")));

        let response = read(direct(&body), &mut []).unwrap();
        assert!(response.reply.is_error());
    }

    #[test]
    fn test_unknown_reply_type() {
        let doc = br#"<response><reply type="maybe"/></response>"#;
        let err = read(direct(&packet(doc, 0, None)), &mut []).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::UnexpectedReplyType(Some(ref t)) if t == "maybe"
        ));
    }

    #[test]
    fn test_truncated_header() {
        let full = packet(VERSION_REPLY.as_bytes(), 0, None);
        let mut stream = b"HTTP/1.1 200 OK\r\nContent-Length: 100\r\n\r\n".to_vec();
        stream.extend_from_slice(&full[..10]);

        let err = read(stream, &mut []).unwrap_err();
        assert!(matches!(err, ProtocolError::IncompletePacket { index: 0 }));
    }

    #[test]
    fn test_truncated_output_body() {
        let mut body = packet(VERSION_REPLY.as_bytes(), 1, None);
        let out = packet(b"0123456789", 0, None);
        body.extend_from_slice(&out[..out.len() - 3]);

        let mut outputs = vec![Output::to_buffer()];
        let err = read(direct(&body), &mut outputs).unwrap_err();
        assert!(matches!(err, ProtocolError::IncompletePacket { index: 1 }));
    }

    #[test]
    fn test_output_count_mismatch_before_any_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.bin");

        // Server sends no outputs, caller expects one
        let body = packet(VERSION_REPLY.as_bytes(), 0, Some("text/xml"));
        let mut outputs = vec![Output::to_path(&path)];
        let err = read(direct(&body), &mut outputs).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::OutputCountMismatch {
                expected: 1,
                found: 0
            }
        ));
        assert!(!path.exists());

        // Server sends one output, caller expects none
        let mut body = packet(VERSION_REPLY.as_bytes(), 1, Some("text/xml"));
        body.extend(packet(b"data", 0, None));
        let err = read(direct(&body), &mut []).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::OutputCountMismatch {
                expected: 0,
                found: 1
            }
        ));
    }

    #[test]
    fn test_outputs_written_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("first.txt");

        let mut body = packet(VERSION_REPLY.as_bytes(), 2, Some("text/xml"));
        body.extend(packet(b"first output", 1, Some("text/plain")));
        body.extend(packet(&[0u8, 1, 2, 3, 255], 0, Some("application/octet-stream")));

        let mut outputs = vec![Output::to_path(&path), Output::to_buffer()];
        let response = read(direct(&body), &mut outputs).unwrap();
        assert!(!response.reply.is_error());

        assert_eq!(std::fs::read(&path).unwrap(), b"first output");
        assert_eq!(outputs[0].mime_type(), Some("text/plain"));
        assert_eq!(outputs[1].bytes(), Some(&[0u8, 1, 2, 3, 255][..]));
        assert_eq!(outputs[1].mime_type(), Some("application/octet-stream"));
    }

    #[test]
    fn test_packet_count_mismatch() {
        let mut body = packet(VERSION_REPLY.as_bytes(), 2, None);
        body.extend(packet(b"a", 0, None));
        body.extend(packet(b"b", 0, None));

        let mut outputs = vec![Output::to_buffer(), Output::to_buffer()];
        let err = read(direct(&body), &mut outputs).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::PacketCountMismatch {
                index: 1,
                expected: 1,
                found: 0
            }
        ));
    }

    #[test]
    fn test_fragmented_direct_reads() {
        let payload: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let mut body = packet(VERSION_REPLY.as_bytes(), 1, Some("text/xml"));
        body.extend(packet(&payload, 0, Some("application/octet-stream")));
        let stream = direct(&body);

        for step in [1, 3, 16, 17, 1000, 8192] {
            let mut outputs = vec![Output::to_buffer()];
            let reader = Fragmented {
                data: Cursor::new(stream.clone()),
                step,
            };
            let response = ResponseReader::new(reader)
                .read_response(&mut outputs)
                .unwrap();
            assert!(!response.reply.is_error());
            assert_eq!(outputs[0].bytes(), Some(&payload[..]), "step {}", step);
        }
    }

    #[test]
    fn test_direct_unknown_length_final_output() {
        let mut body = packet(VERSION_REPLY.as_bytes(), 1, None);
        body.extend(PacketHeader::new(UNKNOWN_LENGTH, 0).encode().unwrap());
        body.extend_from_slice(b"streamed until close");
        let mut stream = b"HTTP/1.1 200 OK\r\n\r\n".to_vec();
        stream.extend(body);

        let mut outputs = vec![Output::to_buffer()];
        read(stream, &mut outputs).unwrap();
        assert_eq!(outputs[0].bytes(), Some(&b"streamed until close"[..]));
    }

    #[test]
    fn test_direct_unknown_length_must_be_final() {
        let mut body = packet(VERSION_REPLY.as_bytes(), 2, None);
        body.extend(PacketHeader::new(UNKNOWN_LENGTH, 1).encode().unwrap());
        body.extend_from_slice(b"data");

        let mut outputs = vec![Output::to_buffer(), Output::to_buffer()];
        let err = read(direct(&body), &mut outputs).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownLengthNotFinal { index: 1 }));
    }

    #[test]
    fn test_chunked_matches_direct() {
        let payload: Vec<u8> = (0..3000u32).map(|i| (i * 7 % 256) as u8).collect();
        let mut body = packet(VERSION_REPLY.as_bytes(), 2, Some("text/xml"));
        body.extend(packet(b"small output", 1, None));
        body.extend(packet(&payload, 0, Some("application/octet-stream")));

        let mut expected = vec![Output::to_buffer(), Output::to_buffer()];
        let direct_reply = read(direct(&body), &mut expected).unwrap().reply;

        for size in [1, 2, 3, 5, 7, 16, 100, 4096] {
            let mut outputs = vec![Output::to_buffer(), Output::to_buffer()];
            let reply = read_strict(chunked(&fixed_chunks(&body, size)), &mut outputs)
                .unwrap()
                .reply;
            assert_eq!(reply, direct_reply, "chunk size {}", size);
            for (got, want) in outputs.iter().zip(&expected) {
                assert_eq!(got.bytes(), want.bytes(), "chunk size {}", size);
                assert_eq!(got.mime_type(), want.mime_type());
            }
        }
    }

    #[test]
    fn test_chunked_legacy_packet_aligned() {
        let mut pieces: Vec<Vec<u8>> = Vec::new();
        let envelope = packet(VERSION_REPLY.as_bytes(), 1, Some("text/xml"));
        pieces.push(envelope[..24].to_vec());
        pieces.push(envelope[24..].to_vec());
        let output = packet(b"hello output", 0, Some("text/plain"));
        pieces.push(output[..26].to_vec());
        pieces.push(output[26..].to_vec());
        let refs: Vec<&[u8]> = pieces.iter().map(Vec::as_slice).collect();

        let mut outputs = vec![Output::to_buffer()];
        let response = read(chunked(&refs), &mut outputs).unwrap();
        assert_eq!(
            result_of(response).value("version").unwrap().as_deref(),
            Some("4.9")
        );
        assert_eq!(outputs[0].bytes(), Some(&b"hello output"[..]));
    }

    #[test]
    fn test_chunked_length_override() {
        let envelope = packet(VERSION_REPLY.as_bytes(), 1, Some("text/xml"));
        let payload = b"overridden body".to_vec();
        let header = PacketHeader::new(payload.len() as i64, 0)
            .with_mime_type("text/plain")
            .encode()
            .unwrap();

        let mut stream =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        chunk(&mut stream, &envelope);
        chunk(&mut stream, &header);
        // 4 byte override chunk, then the echoed size line and the data
        chunk(&mut stream, &(payload.len() as i32).to_be_bytes());
        chunk(&mut stream, &payload);
        stream.extend_from_slice(b"0\r\n\r\n");

        let mut outputs = vec![Output::to_buffer()];
        read(stream, &mut outputs).unwrap();
        assert_eq!(outputs[0].bytes(), Some(&payload[..]));
    }

    #[test]
    fn test_chunked_post_header_marker() {
        let envelope = VERSION_REPLY.as_bytes();
        let mut first = PacketHeader::new(envelope.len() as i64, 0)
            .with_mime_type("text/xml")
            .encode()
            .unwrap()
            .to_vec();
        first.extend_from_slice(&(envelope.len() as i32).to_be_bytes());

        let mut stream =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        chunk(&mut stream, &first);
        chunk(&mut stream, envelope);
        stream.extend_from_slice(b"0\r\n\r\n");

        let response = read(stream.clone(), &mut []).unwrap();
        assert_eq!(
            result_of(response).value("version").unwrap().as_deref(),
            Some("4.9")
        );

        // Without the legacy decoding the marker is taken as envelope bytes
        assert!(read_strict(stream, &mut []).is_err());
    }

    #[test]
    fn test_chunked_unknown_length_output_with_wrappers() {
        let envelope = packet(VERSION_REPLY.as_bytes(), 1, Some("text/xml"));
        let header = PacketHeader::new(UNKNOWN_LENGTH, 0).encode().unwrap();

        let mut wrapped = (5i32).to_be_bytes().to_vec();
        wrapped.extend_from_slice(b"first");
        wrapped.extend_from_slice(&[0xFF; 4]);

        let mut stream =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        chunk(&mut stream, &envelope);
        chunk(&mut stream, &header);
        chunk(&mut stream, &wrapped);
        chunk(&mut stream, b"-plain-");
        stream.extend_from_slice(b"0\r\n\r\n");

        let mut outputs = vec![Output::to_buffer()];
        read(stream, &mut outputs).unwrap();
        assert_eq!(outputs[0].bytes(), Some(&b"first-plain-"[..]));
    }

    #[test]
    fn test_chunked_terminator_between_outputs() {
        let envelope = packet(VERSION_REPLY.as_bytes(), 2, Some("text/xml"));
        let streamed = PacketHeader::new(UNKNOWN_LENGTH, 1).encode().unwrap();
        let last = packet(b"tail", 0, None);

        let mut stream =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        chunk(&mut stream, &envelope);
        chunk(&mut stream, &streamed);
        chunk(&mut stream, b"streamed body");
        chunk(&mut stream, &[0xFF; 4]);
        chunk(&mut stream, &last);
        stream.extend_from_slice(b"0\r\n\r\n");

        let mut outputs = vec![Output::to_buffer(), Output::to_buffer()];
        read(stream, &mut outputs).unwrap();
        assert_eq!(outputs[0].bytes(), Some(&b"streamed body"[..]));
        assert_eq!(outputs[1].bytes(), Some(&b"tail"[..]));
    }

    #[test]
    fn test_chunked_unknown_length_envelope() {
        let doc = VERSION_REPLY.as_bytes();
        let mut first = PacketHeader::new(UNKNOWN_LENGTH, 0).encode().unwrap().to_vec();
        first.extend_from_slice(doc);

        let response = read(chunked(&[&first]), &mut []).unwrap();
        assert_eq!(
            result_of(response).value("version").unwrap().as_deref(),
            Some("4.9")
        );
    }

    #[test]
    fn test_chunked_truncated_stream() {
        let envelope = packet(VERSION_REPLY.as_bytes(), 0, None);
        let mut stream =
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n".to_vec();
        chunk(&mut stream, &envelope[..10]);

        let err = read(stream, &mut []).unwrap_err();
        assert!(matches!(err, ProtocolError::IncompletePacket { index: 0 }));
    }

    /// Sink that keeps a digest of what it receives and its largest write.
    #[derive(Clone, Default)]
    struct WriteStats {
        total: Arc<AtomicUsize>,
        checksum: Arc<AtomicUsize>,
        largest: Arc<AtomicUsize>,
    }

    impl Write for WriteStats {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let offset = self.total.fetch_add(buf.len(), Ordering::SeqCst);
            let sum = buf
                .iter()
                .enumerate()
                .map(|(i, b)| (offset + i).wrapping_mul(*b as usize))
                .fold(0usize, usize::wrapping_add);
            self.checksum.fetch_add(sum, Ordering::SeqCst);
            self.largest.fetch_max(buf.len(), Ordering::SeqCst);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn expected_checksum(data: &[u8]) -> usize {
        data.iter()
            .enumerate()
            .map(|(i, b)| i.wrapping_mul(*b as usize))
            .fold(0usize, usize::wrapping_add)
    }

    #[test]
    fn test_large_chunk_streamed_in_buffers() {
        let payload: Vec<u8> = (0..4 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
        let mut body = packet(VERSION_REPLY.as_bytes(), 1, Some("text/xml"));
        body.extend(packet(&payload, 0, Some("application/octet-stream")));

        let stats = WriteStats::default();
        let mut outputs = vec![Output::to_writer(stats.clone())];
        read(chunked(&[&body]), &mut outputs).unwrap();

        assert_eq!(stats.total.load(Ordering::SeqCst), payload.len());
        assert_eq!(
            stats.checksum.load(Ordering::SeqCst),
            expected_checksum(&payload)
        );
        assert!(stats.largest.load(Ordering::SeqCst) <= BUFFER_SIZE);
    }

    #[test]
    fn test_large_unknown_length_chunk_streamed_in_buffers() {
        let payload: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 241) as u8).collect();
        let mut body = packet(VERSION_REPLY.as_bytes(), 1, Some("text/xml"));
        body.extend(PacketHeader::new(UNKNOWN_LENGTH, 0).encode().unwrap());
        body.extend_from_slice(&payload);

        let stats = WriteStats::default();
        let mut outputs = vec![Output::to_writer(stats.clone())];
        read(chunked(&[&body]), &mut outputs).unwrap();

        assert_eq!(stats.total.load(Ordering::SeqCst), payload.len());
        assert_eq!(
            stats.checksum.load(Ordering::SeqCst),
            expected_checksum(&payload)
        );
        assert!(stats.largest.load(Ordering::SeqCst) <= BUFFER_SIZE);
    }

    #[test]
    fn test_http_error_status() {
        let stream =
            b"HTTP/1.1 500 Server Error\r\nContent-Type: text/plain\r\nContent-Length: 4\r\n\r\noops"
                .to_vec();
        let err = read(stream, &mut []).unwrap_err();
        assert!(err.to_string().contains("500 Server Error. Content: oops"));
    }

    #[test]
    fn test_compressed_flag_passes_payload_through() {
        let mut body = packet(VERSION_REPLY.as_bytes(), 1, None);
        let header = PacketHeader::new(3, 0).with_compressed(true).encode().unwrap();
        body.extend(header);
        body.extend_from_slice(b"xyz");

        let mut outputs = vec![Output::to_buffer()];
        read(direct(&body), &mut outputs).unwrap();
        assert_eq!(outputs[0].bytes(), Some(&b"xyz"[..]));
    }
}
