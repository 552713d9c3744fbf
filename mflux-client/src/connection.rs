//! Connection lifecycle and service execution.

use crate::error::{ClientError, ServiceError};
use crate::input::Input;
use crate::request::{Envelope, ExecMode, Request};
use crate::sequence::SequenceCounter;
use crate::stream::ClientStream;
use crate::transport::{self, ProxyConfig, Scheme};
use chrono::{DateTime, Utc};
use mflux_protocol::compat::ChunkCompat;
use mflux_protocol::{Output, Reply, ResponseReader, XmlElement, XmlWriter};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::tls::TlsClientConfig;

/// Service that authenticates and opens a session.
pub const LOGON_SERVICE: &str = "system.logon";

/// Service that ends the session.
pub const LOGOFF_SERVICE: &str = "system.logoff";

/// Default connect timeout.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Default per-read timeout while waiting for the server.
pub const DEFAULT_RECV_TIMEOUT: Duration = Duration::from_secs(10);

/// Session lifetime assumed when the server does not report one.
pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(600);

/// Domain, user and password for a logon.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub domain: String,
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(
        domain: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            user: user.into(),
            password: password.into(),
        }
    }

    fn is_complete(&self) -> bool {
        !self.domain.is_empty() && !self.user.is_empty() && !self.password.is_empty()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("domain", &self.domain)
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,
    pub scheme: Scheme,
    /// Forward proxy to tunnel through (optional).
    pub proxy: Option<ProxyConfig>,
    pub credentials: Option<Credentials>,
    /// Secure identity token (optional).
    pub token: Option<String>,
    pub token_type: Option<String>,
    /// Existing session to reuse (optional).
    pub session: Option<String>,
    /// Application name, used to restrict identity tokens.
    pub app: Option<String>,
    pub connect_timeout: Duration,
    pub recv_timeout: Duration,
    pub cookie: Option<String>,
    /// Protocols the server may use to deliver outputs.
    pub output_protocols: Vec<String>,
    pub tls: TlsClientConfig,
    /// Counter for request numbering. The process-wide one if unset.
    pub sequence: Option<Arc<SequenceCounter>>,
    pub chunk_compat: ChunkCompat,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            scheme: Scheme::default(),
            proxy: None,
            credentials: None,
            token: None,
            token_type: None,
            session: None,
            app: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            recv_timeout: DEFAULT_RECV_TIMEOUT,
            cookie: None,
            output_protocols: Vec::new(),
            tls: TlsClientConfig::default(),
            sequence: None,
            chunk_compat: ChunkCompat::default(),
        }
    }

    pub fn with_transport(mut self, scheme: Scheme) -> Self {
        self.scheme = scheme;
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_credentials(
        mut self,
        domain: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials::new(domain, user, password));
        self
    }

    pub fn with_token(mut self, token: impl Into<String>, token_type: Option<String>) -> Self {
        self.token = Some(token.into());
        self.token_type = token_type;
        self
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.session = Some(session.into());
        self
    }

    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = Some(app.into());
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_cookie(mut self, cookie: impl Into<String>) -> Self {
        self.cookie = Some(cookie.into());
        self
    }

    pub fn with_output_protocols(mut self, protocols: Vec<String>) -> Self {
        self.output_protocols = protocols;
        self
    }

    pub fn with_tls(mut self, tls: TlsClientConfig) -> Self {
        self.tls = tls;
        self
    }

    pub fn with_sequence(mut self, sequence: Arc<SequenceCounter>) -> Self {
        self.sequence = Some(sequence);
        self
    }

    pub fn with_chunk_compat(mut self, compat: ChunkCompat) -> Self {
        self.chunk_compat = compat;
        self
    }

    /// Whether any form of logon credential is configured.
    pub fn can_logon(&self) -> bool {
        self.credentials.as_ref().is_some_and(Credentials::is_complete)
            || self.token.is_some()
            || self.session.is_some()
    }
}

/// An authenticated session.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub token: String,
    pub id: Option<i64>,
    pub timeout: Duration,
    pub logon_time: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
}

impl Session {
    /// Whether the server will have dropped the session by `now`.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.last_activity)
            .to_std()
            .is_ok_and(|idle| idle > self.timeout)
    }
}

/// Routing options for distributed service calls.
#[derive(Debug, Clone, Default)]
pub struct ServiceOptions {
    /// Peer the call is routed to.
    pub route: Option<String>,
    pub emode: Option<ExecMode>,
}

impl ServiceOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_route(mut self, route: impl Into<String>) -> Self {
        self.route = Some(route.into());
        self
    }

    pub fn with_emode(mut self, emode: ExecMode) -> Self {
        self.emode = Some(emode);
        self
    }
}

/// A connection to a Mediaflux server.
///
/// Each call opens its own socket and closes it before returning, so a
/// connection only carries session state between calls.
pub struct Connection {
    config: ConnectionConfig,
    sequence: Arc<SequenceCounter>,
    session: Mutex<Option<Session>>,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let sequence = config
            .sequence
            .clone()
            .unwrap_or_else(SequenceCounter::global);
        Self {
            config,
            sequence,
            session: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_open(&self) -> bool {
        self.session.lock().is_some()
    }

    /// The current session, if logged on.
    pub fn session(&self) -> Option<Session> {
        self.session.lock().clone()
    }

    /// Logs on and returns the session token.
    pub fn open(&self) -> Result<String, ClientError> {
        if !self.config.can_logon() {
            return Err(ClientError::Config(
                "cannot open connection: no user credentials, token or session configured"
                    .to_string(),
            ));
        }

        let mut w = XmlWriter::new("args");
        if let Some(ref app) = self.config.app {
            w.add("app", app);
        }
        w.add("host", &self.config.host);
        match (&self.config.credentials, &self.config.token) {
            (Some(creds), _) if creds.is_complete() => {
                w.add("domain", &creds.domain);
                w.add("user", &creds.user);
                w.add("password", &creds.password);
            }
            (_, Some(token)) => {
                w.add("token", token);
            }
            _ => {
                if let Some(ref sid) = self.config.session {
                    w.add("sid", sid);
                }
            }
        }
        let args = w.doc_elem()?;

        let result = self.execute(LOGON_SERVICE, Some(&args), &[], &mut [])?;
        let token = result.value("session")?.ok_or_else(|| {
            ClientError::HttpResponse("logon reply carries no session".to_string())
        })?;
        let id = result.int_value("session/@id")?;
        let timeout = result
            .int_value("session/@timeout")?
            .and_then(|secs| u64::try_from(secs).ok())
            .map_or(DEFAULT_SESSION_TIMEOUT, Duration::from_secs);

        let now = Utc::now();
        *self.session.lock() = Some(Session {
            token: token.clone(),
            id,
            timeout,
            logon_time: now,
            last_activity: now,
        });
        info!(host = %self.config.host, session_id = ?id, "logged on");
        Ok(token)
    }

    /// Logs off. The session is cleared even if the logoff call fails.
    pub fn close(&self) {
        if !self.is_open() {
            return;
        }
        if let Err(e) = self.execute(LOGOFF_SERVICE, None, &[], &mut []) {
            warn!(error = %e, "logoff failed");
        }
        *self.session.lock() = None;
        debug!(host = %self.config.host, "session closed");
    }

    /// Executes `service` and returns its result element.
    pub fn execute(
        &self,
        service: &str,
        args: Option<&XmlElement>,
        inputs: &[Input],
        outputs: &mut [Output],
    ) -> Result<XmlElement, ClientError> {
        self.execute_with(service, args, inputs, outputs, &ServiceOptions::default())
    }

    /// Executes `service` with routing options.
    pub fn execute_with(
        &self,
        service: &str,
        args: Option<&XmlElement>,
        inputs: &[Input],
        outputs: &mut [Output],
        options: &ServiceOptions,
    ) -> Result<XmlElement, ClientError> {
        let session = self
            .session
            .lock()
            .as_ref()
            .map(|s| s.token.clone())
            .or_else(|| self.config.session.clone());
        if session.is_none() && self.config.token.is_none() && service != LOGON_SERVICE {
            return Err(ClientError::NotConnected);
        }

        let (generation, sequence) = self.sequence.next();
        let envelope = Envelope {
            generation,
            sequence,
            service,
            args,
            outputs: outputs.len(),
            route: options.route.as_deref(),
            emode: options.emode,
            session: session.as_deref(),
            token: self.config.token.as_deref(),
            token_type: self.config.token_type.as_deref(),
            app: self.config.app.as_deref(),
            output_protocols: &self.config.output_protocols,
        };
        let request = Request::new(&envelope, inputs);

        let mut stream = transport::connect(&self.config)?;
        let result = self.exchange(&mut stream, &request, outputs);
        stream.close();

        let reply = result?;
        debug!(service, seq = sequence, error = reply.is_error(), "reply received");
        if let Some(session) = self.session.lock().as_mut() {
            session.last_activity = Utc::now();
        }
        match reply {
            Reply::Result(result) => Ok(result),
            Reply::Error(reply) => Err(ClientError::Service(ServiceError::from_reply(reply))),
        }
    }

    fn exchange(
        &self,
        stream: &mut ClientStream,
        request: &Request,
        outputs: &mut [Output],
    ) -> Result<Reply, ClientError> {
        let sent = transport::send_request(stream, &self.config, request)?;
        debug!(
            packets = request.packets().len(),
            bytes = sent,
            "request sent"
        );
        let response = ResponseReader::new(stream)
            .with_compat(self.config.chunk_compat)
            .read_response(outputs)?;
        Ok(response.reply)
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("host", &self.config.host)
            .field("port", &self.config.port)
            .field("open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mflux_protocol::PacketHeader;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn envelope_packet(xml: &str) -> Vec<u8> {
        packet(xml.as_bytes(), 0, Some("text/xml"))
    }

    fn packet(payload: &[u8], remaining: i32, mime_type: Option<&str>) -> Vec<u8> {
        let mut header = PacketHeader::new(payload.len() as i64, remaining);
        if let Some(mime_type) = mime_type {
            header = header.with_mime_type(mime_type);
        }
        let mut out = header.encode().unwrap().to_vec();
        out.extend_from_slice(payload);
        out
    }

    fn http_ok(body: &[u8]) -> Vec<u8> {
        let mut out = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: application/mflux\r\nContent-Length: {}\r\n\r\n",
            body.len()
        )
        .into_bytes();
        out.extend_from_slice(body);
        out
    }

    /// Reads one request: head plus `Content-Length` bytes, or up to the
    /// chunked terminator.
    fn read_request(socket: &mut std::net::TcpStream) -> Vec<u8> {
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            if let Some(split) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&seen[..split]).to_string();
                let length = head
                    .lines()
                    .find_map(|l| l.strip_prefix("Content-Length: "))
                    .and_then(|v| v.trim().parse::<usize>().ok());
                let done = match length {
                    Some(len) => seen.len() >= split + 4 + len,
                    None => seen.ends_with(b"0\r\n\r\n"),
                };
                if done {
                    return seen;
                }
            }
            let n = socket.read(&mut buf).unwrap();
            if n == 0 {
                return seen;
            }
            seen.extend_from_slice(&buf[..n]);
        }
    }

    /// Serves one canned reply per connection and returns the requests seen.
    fn stub_server(replies: Vec<Vec<u8>>) -> (u16, thread::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = thread::spawn(move || {
            let mut requests = Vec::new();
            for reply in replies {
                let (mut socket, _) = listener.accept().unwrap();
                let request = read_request(&mut socket);
                requests.push(String::from_utf8_lossy(&request).to_string());
                socket.write_all(&reply).unwrap();
            }
            requests
        });
        (port, handle)
    }

    fn config(port: u16) -> ConnectionConfig {
        ConnectionConfig::new("127.0.0.1", port)
            .with_transport(Scheme::Http)
            .with_sequence(Arc::new(SequenceCounter::new()))
    }

    const LOGON_REPLY: &str = r#"<?xml version="1.0"?><response><reply type="result"><result><session id="7" timeout="900">sess-1</session></result></reply></response>"#;
    const LOGOFF_REPLY: &str = r#"<reply type="result"><result/></reply>"#;

    #[test]
    fn test_server_version() {
        let reply = r#"<reply type="result"><result><version>4.9</version></result></reply>"#;
        let (port, server) = stub_server(vec![http_ok(&envelope_packet(reply))]);
        let conn = Connection::new(config(port).with_session("abc"));

        let result = conn.execute("server.version", None, &[], &mut []).unwrap();
        assert_eq!(result.value("version").unwrap().as_deref(), Some("4.9"));

        let requests = server.join().unwrap();
        assert!(requests[0].starts_with(&format!(
            "POST http://127.0.0.1:{}/__mflux_svc__/ HTTP/1.1\r\n",
            port
        )));
        assert!(requests[0].contains("name=\"server.version\" session=\"abc\""));
    }

    #[test]
    fn test_service_error_leaves_outputs_untouched() {
        let reply = r#"<reply type="error"><message>Asset does not exist</message></reply>"#;
        let (port, server) = stub_server(vec![http_ok(&envelope_packet(reply))]);
        let conn = Connection::new(config(port).with_session("abc"));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bin");
        let mut outputs = [Output::to_path(&path)];
        let err = conn
            .execute("asset.get", None, &[], &mut outputs)
            .unwrap_err();

        let service = err.service_error().unwrap();
        assert_eq!(service.message.as_deref(), Some("Asset does not exist"));
        assert!(!path.exists());
        server.join().unwrap();
    }

    #[test]
    fn test_truncated_header() {
        let mut body = http_ok(&[0u8; 16]);
        // 10 of 16 header bytes, then the socket closes
        body.truncate(body.len() - 6);
        let (port, server) = stub_server(vec![body]);
        let conn = Connection::new(config(port).with_session("abc"));

        let err = conn.execute("server.version", None, &[], &mut []).unwrap_err();
        assert!(matches!(err, ClientError::IncompletePacket { index: 0 }));
        assert!(err.is_retryable());
        server.join().unwrap();
    }

    #[test]
    fn test_silent_server_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            read_request(&mut socket);
            // Hold the socket open without answering until the client leaves.
            let _ = socket.read_to_end(&mut Vec::new());
        });

        let conn = Connection::new(
            config(port)
                .with_session("abc")
                .with_recv_timeout(Duration::from_millis(200)),
        );
        let err = conn
            .execute("server.version", None, &[], &mut [])
            .unwrap_err();
        assert!(matches!(err, ClientError::Timeout), "got {:?}", err);
        assert!(err.is_retryable());
        server.join().unwrap();
    }

    #[test]
    fn test_not_connected_without_session() {
        let conn = Connection::new(config(1));
        let err = conn.execute("server.version", None, &[], &mut []).unwrap_err();
        assert!(matches!(err, ClientError::NotConnected));
    }

    #[test]
    fn test_open_without_credentials() {
        let conn = Connection::new(config(1));
        assert!(matches!(conn.open(), Err(ClientError::Config(_))));
        assert!(!conn.is_open());
    }

    #[test]
    fn test_logon_and_logoff() {
        let (port, server) = stub_server(vec![
            http_ok(&envelope_packet(LOGON_REPLY)),
            http_ok(&envelope_packet(LOGOFF_REPLY)),
        ]);
        let conn = Connection::new(
            config(port)
                .with_credentials("system", "manager", "change_me")
                .with_app("demo"),
        );

        assert_eq!(conn.open().unwrap(), "sess-1");
        let session = conn.session().unwrap();
        assert_eq!(session.id, Some(7));
        assert_eq!(session.timeout, Duration::from_secs(900));
        assert!(!session.is_expired(session.logon_time));

        conn.close();
        assert!(!conn.is_open());

        let requests = server.join().unwrap();
        assert!(requests[0].contains("name=\"system.logon\""));
        assert!(requests[0].contains(
            "<args><app>demo</app><host>127.0.0.1</host><domain>system</domain>\
             <user>manager</user><password>change_me</password></args>"
        ));
        assert!(requests[1].contains("name=\"system.logoff\" session=\"sess-1\""));
    }

    #[test]
    fn test_close_clears_session_when_logoff_fails() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            read_request(&mut socket);
            socket.write_all(&http_ok(&envelope_packet(LOGON_REPLY))).unwrap();
            // logoff connection is refused once the listener is gone
        });

        let conn = Connection::new(config(port).with_token("tok", Some("identity".into())));
        conn.open().unwrap();
        server.join().unwrap();

        conn.close();
        assert!(conn.session().is_none());
    }

    #[test]
    fn test_session_expiry() {
        let now = Utc::now();
        let session = Session {
            token: "t".into(),
            id: None,
            timeout: Duration::from_secs(60),
            logon_time: now,
            last_activity: now,
        };
        assert!(!session.is_expired(now + chrono::Duration::seconds(59)));
        assert!(session.is_expired(now + chrono::Duration::seconds(61)));
        assert!(!session.is_expired(now - chrono::Duration::seconds(600)));
    }

    #[test]
    fn test_file_upload_and_output() {
        let data: Vec<u8> = (0..20_000u32).map(|i| (i % 199) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&data).unwrap();

        let reply = r#"<reply type="result"><result><id>1001</id></result></reply>"#;
        let mut body = packet(reply.as_bytes(), 1, Some("text/xml"));
        body.extend(packet(b"content bytes", 0, Some("text/plain")));
        let (port, server) = stub_server(vec![http_ok(&body)]);

        let conn = Connection::new(config(port).with_session("abc"));
        let inputs = [Input::from_path(file.path()).unwrap()];
        let mut outputs = [Output::to_buffer()];
        let args = XmlWriter::new("args").doc_elem().unwrap();
        let result = conn
            .execute("asset.create", Some(&args), &inputs, &mut outputs)
            .unwrap();

        assert_eq!(result.int_value("id").unwrap(), Some(1001));
        assert_eq!(outputs[0].bytes(), Some(&b"content bytes"[..]));
        assert_eq!(outputs[0].mime_type(), Some("text/plain"));

        let request = server.join().unwrap().remove(0);
        assert!(request.contains("data-out-min=\"1\" data-out-max=\"1\""));
        assert!(request.contains("<attachment></attachment>"));
    }

    #[test]
    fn test_routing_options() {
        let reply = r#"<reply type="result"><result/></reply>"#;
        let (port, server) = stub_server(vec![http_ok(&envelope_packet(reply))]);
        let conn = Connection::new(config(port).with_session("abc"));

        let options = ServiceOptions::new()
            .with_route("peer-2")
            .with_emode(ExecMode::DistributedFirst);
        conn.execute_with("asset.count", None, &[], &mut [], &options)
            .unwrap();

        let request = server.join().unwrap().remove(0);
        assert!(request.contains(
            "<service emode=\"distributed-first\" target=\"peer-2\" name=\"asset.count\""
        ));
    }

    #[test]
    fn test_credentials_redacted() {
        let config = config(1).with_credentials("d", "u", "hunter2");
        assert!(!format!("{:?}", config).contains("hunter2"));
    }
}
