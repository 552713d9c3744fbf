//! HTTP/1.1 request and response heads.
//!
//! Only the small part of HTTP the service protocol needs: a fixed `POST`
//! request head, status line and header parsing, and chunked request
//! bodies for uploads of unknown length.

use crate::chunked::read_into;
use crate::error::ProtocolError;
use crate::{CONTENT_TYPE, SERVICE_PATH, USER_AGENT};
use bytes::{Buf, BytesMut};
use std::io::{self, Read, Write};
use tracing::debug;

/// Largest response head accepted before giving up.
const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Request head for one service call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub host: String,
    pub port: u16,
    pub encrypted: bool,
    /// Request goes through a forward proxy.
    pub via_proxy: bool,
    pub proxy_authorization: Option<String>,
    pub cookie: Option<String>,
    /// Body length, or `None` for a chunked body.
    pub content_length: Option<u64>,
}

impl RequestHead {
    pub fn new(host: impl Into<String>, port: u16, encrypted: bool) -> Self {
        Self {
            host: host.into(),
            port,
            encrypted,
            via_proxy: false,
            proxy_authorization: None,
            cookie: None,
            content_length: None,
        }
    }

    pub fn with_proxy(mut self, authorization: Option<String>) -> Self {
        self.via_proxy = true;
        self.proxy_authorization = authorization;
        self
    }

    pub fn with_cookie(mut self, cookie: Option<String>) -> Self {
        self.cookie = cookie;
        self
    }

    pub fn with_content_length(mut self, content_length: Option<u64>) -> Self {
        self.content_length = content_length;
        self
    }

    /// Absolute URI of the service endpoint.
    pub fn uri(&self) -> String {
        let scheme = if self.encrypted { "https" } else { "http" };
        format!(
            "{}://{}:{}{}",
            scheme,
            bracket_host(&self.host),
            self.port,
            SERVICE_PATH
        )
    }

    /// Encodes the request line and headers, blank line included.
    pub fn encode(&self) -> String {
        let mut head = format!("POST {} HTTP/1.1\r\n", self.uri());
        head.push_str(&format!("Host: {}:{}\r\n", self.host, self.port));
        head.push_str(&format!("User-Agent: {}\r\n", USER_AGENT));
        head.push_str("Connection: keep-alive\r\n");
        head.push_str("Keep-Alive: 300\r\n");
        if self.via_proxy {
            head.push_str("Proxy-Connection: keep-alive\r\n");
            if let Some(ref value) = self.proxy_authorization {
                head.push_str(&format!("Proxy-Authorization: {}\r\n", value));
            }
        }
        if let Some(ref cookie) = self.cookie {
            head.push_str(&format!("Cookie: {}\r\n", cookie));
        }
        head.push_str(&format!("Content-Type: {}\r\n", CONTENT_TYPE));
        match self.content_length {
            Some(len) => head.push_str(&format!("Content-Length: {}\r\n", len)),
            None => head.push_str("Transfer-Encoding: chunked\r\n"),
        }
        head.push_str("\r\n");
        head
    }
}

/// Wraps IPv6 literals in brackets.
pub fn bracket_host(host: &str) -> String {
    if host.contains(':') && !host.starts_with('[') {
        format!("[{}]", host)
    } else {
        host.to_string()
    }
}

/// Parsed status line and headers of a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub version: String,
    pub code: u16,
    pub reason: String,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// Parses a head without its terminating blank line.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let mut lines = text.split("\r\n");
        let status = lines.next().unwrap_or("").trim();

        let rest = status
            .strip_prefix("HTTP/")
            .ok_or_else(|| ProtocolError::HttpResponse(format!("invalid status line: {:?}", status)))?;
        let (version, rest) = rest
            .split_once(' ')
            .ok_or_else(|| ProtocolError::HttpResponse("missing status code".to_string()))?;
        let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
        let code = code
            .trim()
            .parse::<u16>()
            .map_err(|_| ProtocolError::HttpResponse(format!("invalid status code: {:?}", code)))?;

        let headers = lines
            .filter_map(|line| line.split_once(':'))
            .map(|(name, value)| (name.trim().to_string(), value.trim().to_string()))
            .collect();

        Ok(Self {
            version: version.to_string(),
            code,
            reason: reason.trim().to_string(),
            headers,
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn is_chunked(&self) -> bool {
        self.header("Transfer-Encoding")
            .is_some_and(|v| v.to_ascii_lowercase().contains("chunked"))
    }

    pub fn content_length(&self) -> Option<u64> {
        self.header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
    }
}

/// Reads a response head and checks its status.
///
/// Bytes read past the head are left in `raw`. A `407` becomes
/// [`ProtocolError::ProxyAuthenticationRequired`]; any other non-`200`
/// status becomes [`ProtocolError::HttpStatus`], carrying the body when the
/// head declares both its type and length.
pub fn read_head<R: Read>(reader: &mut R, raw: &mut BytesMut) -> Result<ResponseHead, ProtocolError> {
    let mut searched = 0;
    let end = loop {
        if let Some(pos) = find_head_end(&raw[searched..]) {
            break searched + pos;
        }
        searched = raw.len().saturating_sub(3);
        if raw.len() > MAX_HEAD_SIZE {
            return Err(ProtocolError::HttpResponse(
                "response head too large".to_string(),
            ));
        }
        if read_into(reader, raw)? == 0 {
            return Err(ProtocolError::HttpResponse(format!(
                "incomplete header: {}",
                String::from_utf8_lossy(&raw[..])
            )));
        }
    };

    let text = String::from_utf8_lossy(&raw[..end]).into_owned();
    raw.advance(end + 4);
    let head = ResponseHead::parse(&text)?;
    debug!(code = head.code, chunked = head.is_chunked(), "response head");

    match head.code {
        200 => Ok(head),
        407 => Err(ProtocolError::ProxyAuthenticationRequired),
        _ => {
            let content = match (head.header("Content-Type"), head.content_length()) {
                (Some(_), Some(len)) => Some(read_error_body(reader, raw, len)?),
                _ => None,
            };
            Err(ProtocolError::HttpStatus {
                version: head.version,
                code: head.code,
                reason: head.reason,
                content,
            })
        }
    }
}

fn read_error_body<R: Read>(
    reader: &mut R,
    raw: &mut BytesMut,
    len: u64,
) -> Result<String, ProtocolError> {
    let len = usize::try_from(len).unwrap_or(usize::MAX);
    while raw.len() < len {
        if read_into(reader, raw)? == 0 {
            break;
        }
    }
    let end = raw.len().min(len);
    Ok(String::from_utf8_lossy(&raw[..end]).into_owned())
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

/// Writes a request body with HTTP chunked transfer encoding.
///
/// Each `write` becomes one chunk. [`finish`](Self::finish) writes the last
/// chunk.
pub struct ChunkedWriter<W: Write> {
    inner: W,
}

impl<W: Write> ChunkedWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    /// Writes the terminating zero-size chunk and returns the inner writer.
    pub fn finish(mut self) -> io::Result<W> {
        self.inner.write_all(b"0\r\n\r\n")?;
        self.inner.flush()?;
        Ok(self.inner)
    }
}

impl<W: Write> Write for ChunkedWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        write!(self.inner, "{:x}\r\n", buf.len())?;
        self.inner.write_all(buf)?;
        self.inner.write_all(b"\r\n")?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
