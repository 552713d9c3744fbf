//! Service request building and streaming.
//!
//! A request is packet 0, the XML envelope naming the service, followed by
//! one packet per input. Input packets reference their file or URL and are
//! streamed through a fixed-size buffer when the request is written.

use crate::error::ClientError;
use crate::input::{Input, InputSource};
use bytes::Bytes;
use mflux_protocol::{PacketHeader, XmlElement, XmlWriter, BUFFER_SIZE, UNKNOWN_LENGTH};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use tracing::trace;

/// Declaration that prefixes every envelope.
pub const XML_DECLARATION: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>";

/// Mime type of the envelope packet.
pub const ENVELOPE_MIME_TYPE: &str = "text/xml";

/// Execution mode for distributed service calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecMode {
    DistributedFirst,
    DistributedAll,
}

impl ExecMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecMode::DistributedFirst => "distributed-first",
            ExecMode::DistributedAll => "distributed-all",
        }
    }
}

impl fmt::Display for ExecMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Payload of a packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PacketSource {
    InMemory(Bytes),
    File(PathBuf),
    Remote(String),
}

/// One request packet.
#[derive(Debug, Clone)]
pub struct Packet {
    pub source: PacketSource,
    /// Payload length, or `-1` if unknown.
    pub length: i64,
    pub mime_type: Option<String>,
    pub compressed: bool,
}

impl Packet {
    /// The envelope packet for an XML document.
    pub fn envelope(xml: String) -> Self {
        let bytes = Bytes::from(xml);
        Self {
            length: bytes.len() as i64,
            source: PacketSource::InMemory(bytes),
            mime_type: Some(ENVELOPE_MIME_TYPE.to_string()),
            compressed: false,
        }
    }

    pub fn from_input(input: &Input) -> Self {
        let source = match input.source() {
            InputSource::File(path) => PacketSource::File(path.clone()),
            InputSource::Url(url) => PacketSource::Remote(url.clone()),
        };
        Self {
            source,
            length: input.length(),
            mime_type: input.mime_type().map(str::to_string),
            compressed: false,
        }
    }

    pub fn header(&self, remaining: i32) -> PacketHeader {
        let header = PacketHeader::new(self.length, remaining).with_compressed(self.compressed);
        match self.mime_type {
            Some(ref mime_type) => header.with_mime_type(mime_type.clone()),
            None => header,
        }
    }

    /// Bytes this packet occupies on the wire, if its length is known.
    pub fn wire_len(&self) -> Option<u64> {
        if self.length == UNKNOWN_LENGTH {
            return None;
        }
        let mime = self.mime_type.as_ref().map_or(0, |m| m.len()) as u64;
        Some(16 + mime + self.length as u64)
    }

    /// Writes the header and payload. Returns the payload bytes written.
    pub fn write_to<W: Write>(&self, out: &mut W, remaining: i32) -> Result<u64, ClientError> {
        out.write_all(&self.header(remaining).encode()?)?;

        let declared = u64::try_from(self.length).ok();
        let written = match self.source {
            PacketSource::InMemory(ref bytes) => {
                out.write_all(bytes)?;
                bytes.len() as u64
            }
            PacketSource::File(ref path) => {
                let mut file = File::open(path)?;
                copy_payload(&mut file, out, declared)?
            }
            PacketSource::Remote(ref url) => {
                let mut response = reqwest::blocking::get(url)
                    .and_then(|r| r.error_for_status())
                    .map_err(|e| {
                        ClientError::HttpResponse(format!("failed to fetch {}: {}", url, e))
                    })?;
                copy_payload(&mut response, out, declared)?
            }
        };
        trace!(remaining, bytes = written, "packet written");
        Ok(written)
    }
}

/// Streams `length` bytes (or everything, if `None`) from `src` to `out`.
fn copy_payload<R: Read, W: Write>(
    src: &mut R,
    out: &mut W,
    length: Option<u64>,
) -> io::Result<u64> {
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut total = 0u64;
    loop {
        let want = match length {
            Some(len) => (len - total).min(BUFFER_SIZE as u64) as usize,
            None => BUFFER_SIZE,
        };
        if want == 0 {
            return Ok(total);
        }
        let n = match src.read(&mut buf[..want]) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        if n == 0 {
            return match length {
                Some(len) => Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("attachment ended after {} of {} bytes", total, len),
                )),
                None => Ok(total),
            };
        }
        out.write_all(&buf[..n])?;
        total += n as u64;
    }
}

/// Fields of the `service` element.
#[derive(Debug, Clone, Default)]
pub struct Envelope<'a> {
    pub generation: i64,
    pub sequence: u64,
    pub service: &'a str,
    pub args: Option<&'a XmlElement>,
    /// Number of outputs the caller expects.
    pub outputs: usize,
    pub route: Option<&'a str>,
    pub emode: Option<ExecMode>,
    pub session: Option<&'a str>,
    pub token: Option<&'a str>,
    pub token_type: Option<&'a str>,
    pub app: Option<&'a str>,
    pub output_protocols: &'a [String],
}

impl Envelope<'_> {
    /// Renders the envelope document, declaration included.
    pub fn to_xml(&self, inputs: &[Input]) -> String {
        let mut w = XmlWriter::new("request");
        for protocol in self.output_protocols {
            w.add("output-protocol", protocol);
        }

        let sgen = self.generation.to_string();
        let seq = self.sequence.to_string();
        let outputs = (self.outputs > 0).then(|| self.outputs.to_string());
        w.push_with(
            "service",
            &[
                ("emode", self.emode.map(ExecMode::as_str)),
                ("target", self.route),
                ("name", Some(self.service)),
                ("session", self.session),
                ("token-type", self.token_type),
                ("token", self.token),
                ("app", self.app),
                ("sgen", Some(sgen.as_str())),
                ("seq", Some(seq.as_str())),
                ("data-out-min", outputs.as_deref()),
                ("data-out-max", outputs.as_deref()),
            ],
        );
        if let Some(args) = self.args {
            w.add_element(args);
        }
        for input in inputs {
            w.push("attachment");
            if let Some(url) = input.url() {
                w.add("source", url);
            }
            if let Some(csum) = input.checksum() {
                w.add("csum", csum);
            }
            w.pop();
        }

        format!("{}{}", XML_DECLARATION, w.doc_text())
    }
}

/// A request ready to be written.
#[derive(Debug, Clone)]
pub struct Request {
    packets: Vec<Packet>,
}

impl Request {
    pub fn new(envelope: &Envelope<'_>, inputs: &[Input]) -> Self {
        let mut packets = Vec::with_capacity(inputs.len() + 1);
        packets.push(Packet::envelope(envelope.to_xml(inputs)));
        packets.extend(inputs.iter().map(Packet::from_input));
        Self { packets }
    }

    pub fn packets(&self) -> &[Packet] {
        &self.packets
    }

    /// Total body length, or `None` if any packet length is unknown.
    pub fn content_length(&self) -> Option<u64> {
        self.packets.iter().map(Packet::wire_len).sum()
    }

    /// Writes every packet in order. Returns the payload bytes written.
    pub fn write_to<W: Write>(&self, out: &mut W) -> Result<u64, ClientError> {
        let count = i32::try_from(self.packets.len())
            .map_err(|_| ClientError::Config("too many request packets".to_string()))?;
        let mut total = 0;
        for (packet, remaining) in self.packets.iter().zip((0..count).rev()) {
            total += packet.write_to(out, remaining)?;
        }
        Ok(total)
    }
}
