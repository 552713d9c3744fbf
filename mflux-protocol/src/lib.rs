//! # mflux-protocol
//!
//! Wire protocol implementation for the Mediaflux service protocol.
//!
//! This crate provides:
//! - Binary packet header encoding/decoding
//! - HTTP request head encoding, response head parsing and chunked framing
//! - Response demultiplexing into a reply document and output sinks
//! - A small XML document model for request arguments and replies
//!
//! Nothing in here owns a socket: every reader and writer is generic over
//! `std::io::Read`/`Write`.

pub mod chunked;
pub mod compat;
pub mod error;
pub mod frame;
pub mod http;
pub mod output;
pub mod response;
pub mod xml;

pub use error::ProtocolError;
pub use frame::{PacketHeader, FORMAT_MARKER, PACKET_HEADER_SIZE, UNKNOWN_LENGTH};
pub use http::{ChunkedWriter, RequestHead, ResponseHead};
pub use output::{Output, OutputTarget};
pub use response::{Reply, Response, ResponseReader};
pub use xml::{XmlElement, XmlError, XmlWriter};

/// Path of the service endpoint on the server.
pub const SERVICE_PATH: &str = "/__mflux_svc__/";

/// Content type of request and response bodies.
pub const CONTENT_TYPE: &str = "application/mflux";

/// User agent sent with every request.
pub const USER_AGENT: &str = "Mediaflux/3.0";

/// Size of the buffer used to stream payload bytes (8 KiB).
pub const BUFFER_SIZE: usize = 8 * 1024;
