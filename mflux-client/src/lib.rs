//! # mflux-client
//!
//! Blocking client for Mediaflux servers.
//!
//! This crate provides:
//! - Connection lifecycle: logon, service execution, logoff
//! - Request building with file and URL attachments
//! - Direct, proxy-tunnelled and TLS transports
//! - A process-level request sequence counter

pub mod connection;
pub mod error;
pub mod input;
pub mod request;
pub mod sequence;
pub mod stream;
pub mod tls;
pub mod transport;

pub use connection::{Connection, ConnectionConfig, Credentials, ServiceOptions, Session};
pub use error::{ClientError, ServiceError};
pub use input::{Input, InputSource};
pub use mflux_protocol::compat::ChunkCompat;
pub use mflux_protocol::{Output, XmlElement, XmlWriter};
pub use request::{Envelope, ExecMode, Packet, PacketSource, Request};
pub use sequence::SequenceCounter;
pub use tls::TlsClientConfig;
pub use transport::{ProxyConfig, Scheme};
