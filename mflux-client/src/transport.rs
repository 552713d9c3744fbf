//! Socket setup and request sending.
//!
//! Every service call gets its own socket: TCP connect, an optional
//! `CONNECT` tunnel through a forward proxy, then an optional TLS session.

use crate::connection::ConnectionConfig;
use crate::error::ClientError;
use crate::request::Request;
use crate::stream::ClientStream;
use crate::tls;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use mflux_protocol::http::bracket_host;
use mflux_protocol::{ChunkedWriter, RequestHead, ResponseHead, BUFFER_SIZE};
use rustls::{ClientConnection, StreamOwned};
use std::fmt;
use std::io::{self, BufWriter, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::str::FromStr;
use std::time::Duration;
use tracing::debug;

/// Largest proxy reply head accepted.
const MAX_TUNNEL_REPLY: usize = 8 * 1024;

/// Transport scheme of the server endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheme {
    Http,
    #[default]
    Https,
}

impl Scheme {
    pub fn is_encrypted(self) -> bool {
        self == Scheme::Https
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Scheme::Http => "http",
            Scheme::Https => "https",
        }
    }
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Scheme {
    type Err = ClientError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "http" => Ok(Scheme::Http),
            "https" => Ok(Scheme::Https),
            other => Err(ClientError::Config(format!(
                "unsupported transport {:?}, expected http or https",
                other
            ))),
        }
    }
}

/// Forward proxy reached with HTTP `CONNECT`.
#[derive(Clone, PartialEq, Eq)]
pub struct ProxyConfig {
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
}

impl ProxyConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            user: None,
            password: None,
        }
    }

    pub fn with_credentials(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.user = Some(user.into());
        self.password = Some(password.into());
        self
    }

    /// `Proxy-Authorization` value, when both user and password are set.
    pub fn authorization(&self) -> Option<String> {
        match (&self.user, &self.password) {
            (Some(user), Some(password)) => Some(format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", user, password))
            )),
            _ => None,
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Opens a socket to the server, through the proxy and TLS as configured.
pub fn connect(config: &ConnectionConfig) -> Result<ClientStream, ClientError> {
    let tcp = match config.proxy {
        Some(ref proxy) => {
            let mut tcp = open_tcp(&proxy.host, proxy.port, config.connect_timeout)?;
            tcp.set_read_timeout(Some(config.recv_timeout))?;
            tunnel(&mut tcp, &config.host, config.port, proxy)?;
            tcp
        }
        None => {
            let tcp = open_tcp(&config.host, config.port, config.connect_timeout)?;
            tcp.set_read_timeout(Some(config.recv_timeout))?;
            tcp
        }
    };
    tcp.set_write_timeout(Some(config.recv_timeout))?;

    if !config.scheme.is_encrypted() {
        return Ok(ClientStream::Plain(tcp));
    }

    let client_config = tls::client_config(&config.tls)?;
    let server_name = tls::server_name(&config.tls, &config.host)?;
    let conn = ClientConnection::new(client_config, server_name)
        .map_err(|e| ClientError::TlsConfig(e.to_string()))?;
    let mut stream = StreamOwned::new(conn, tcp);
    while stream.conn.is_handshaking() {
        stream
            .conn
            .complete_io(&mut stream.sock)
            .map_err(handshake_error)?;
    }
    debug!(host = %config.host, "TLS handshake complete");

    Ok(ClientStream::Tls(Box::new(stream)))
}

/// Keeps read timeouts distinct from TLS failures during the handshake.
fn handshake_error(err: io::Error) -> ClientError {
    match err.kind() {
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut => ClientError::from(err),
        _ => ClientError::TlsHandshake(err.to_string()),
    }
}

fn open_tcp(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ClientError> {
    debug!("connecting to {}:{}", host, port);
    let host = host.trim_start_matches('[').trim_end_matches(']');
    let mut last_err = None;
    for addr in (host, port).to_socket_addrs()? {
        match TcpStream::connect_timeout(&addr, timeout) {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                debug!(%addr, "connected");
                return Ok(stream);
            }
            Err(e) => {
                debug!(%addr, error = %e, "connect failed");
                last_err = Some(e);
            }
        }
    }
    Err(match last_err {
        Some(e) => ClientError::from(e),
        None => ClientError::Config(format!("no addresses found for {}", host)),
    })
}

/// Asks the proxy to open a tunnel to `host:port`.
fn tunnel(
    tcp: &mut TcpStream,
    host: &str,
    port: u16,
    proxy: &ProxyConfig,
) -> Result<(), ClientError> {
    let authority = format!("{}:{}", bracket_host(host), port);
    let mut request = format!("CONNECT {} HTTP/1.1\r\nHost: {}\r\n", authority, authority);
    if let Some(authorization) = proxy.authorization() {
        request.push_str(&format!("Proxy-Authorization: {}\r\n", authorization));
    }
    request.push_str("\r\n");
    tcp.write_all(request.as_bytes())?;
    tcp.flush()?;
    debug!(proxy = %proxy.host, %authority, "CONNECT sent");

    // Byte at a time so nothing after the reply head is consumed.
    let mut reply = Vec::with_capacity(256);
    let mut byte = [0u8; 1];
    while !reply.ends_with(b"\r\n\r\n") {
        if reply.len() > MAX_TUNNEL_REPLY {
            return Err(ClientError::HttpResponse(
                "proxy reply head too large".to_string(),
            ));
        }
        if tcp.read(&mut byte)? == 0 {
            return Err(ClientError::HttpResponse(format!(
                "proxy closed the connection: {}",
                String::from_utf8_lossy(&reply)
            )));
        }
        reply.push(byte[0]);
    }

    let text = String::from_utf8_lossy(&reply[..reply.len() - 4]);
    let head = ResponseHead::parse(&text)?;
    match head.code {
        200 => {
            debug!(%authority, "proxy tunnel established");
            Ok(())
        }
        407 => Err(ClientError::ProxyAuthenticationRequired),
        code => Err(ClientError::HttpResponse(format!(
            "unexpected HTTP/{} response from proxy: {} {}",
            head.version, code, head.reason
        ))),
    }
}

/// Request head for `config` and a body of `content_length` bytes.
pub fn request_head(config: &ConnectionConfig, content_length: Option<u64>) -> RequestHead {
    let mut head = RequestHead::new(config.host.clone(), config.port, config.scheme.is_encrypted())
        .with_cookie(config.cookie.clone())
        .with_content_length(content_length);
    if let Some(ref proxy) = config.proxy {
        head = head.with_proxy(proxy.authorization());
    }
    head
}

/// Writes the request head and body. The body is sent chunked when its
/// length is unknown. Returns the number of body payload bytes written.
pub fn send_request<W: Write>(
    stream: &mut W,
    config: &ConnectionConfig,
    request: &Request,
) -> Result<u64, ClientError> {
    let content_length = request.content_length();
    let head = request_head(config, content_length);

    let mut writer = BufWriter::with_capacity(BUFFER_SIZE, stream);
    writer.write_all(head.encode().as_bytes())?;
    let written = match content_length {
        Some(_) => request.write_to(&mut writer)?,
        None => {
            let mut chunked = ChunkedWriter::new(&mut writer);
            let written = request.write_to(&mut chunked)?;
            chunked.finish()?;
            written
        }
    };
    writer.flush()?;
    Ok(written)
}
