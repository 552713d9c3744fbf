//! Service input descriptors.

use crate::error::ClientError;
use mflux_protocol::{BUFFER_SIZE, UNKNOWN_LENGTH};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout for probing remote inputs.
const PROBE_TIMEOUT: Duration = Duration::from_secs(30);

/// Where an input's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputSource {
    File(PathBuf),
    Url(String),
}

/// A service input attached to a request.
#[derive(Debug, Clone)]
pub struct Input {
    source: InputSource,
    mime_type: Option<String>,
    length: i64,
    checksum: Option<u32>,
}

impl Input {
    /// Input read from a local file. The length comes from file metadata.
    pub fn from_path(path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let path = path.into();
        let length = std::fs::metadata(&path)?.len();
        Ok(Self {
            source: InputSource::File(path),
            mime_type: None,
            length: i64::try_from(length).unwrap_or(UNKNOWN_LENGTH),
            checksum: None,
        })
    }

    /// Input read from a local file with its CRC32 computed up front.
    pub fn from_path_with_checksum(path: impl Into<PathBuf>) -> Result<Self, ClientError> {
        let mut input = Self::from_path(path)?;
        if let InputSource::File(ref path) = input.source {
            input.checksum = Some(crc32_file(path)?);
        }
        Ok(input)
    }

    /// Input fetched from a URL while the request is sent.
    ///
    /// The URL is probed with a `HEAD` request for its length and content
    /// type. If the probe fails the length stays unknown and the request is
    /// sent chunked.
    pub fn from_url(url: impl Into<String>) -> Self {
        let url = url.into();
        let mut input = Self {
            source: InputSource::Url(url.clone()),
            mime_type: None,
            length: UNKNOWN_LENGTH,
            checksum: None,
        };
        match probe_url(&url) {
            Ok((length, mime_type)) => {
                debug!(%url, ?length, ?mime_type, "probed remote input");
                if let Some(length) = length {
                    input.length = length;
                }
                input.mime_type = mime_type;
            }
            Err(e) => warn!(%url, error = %e, "failed to probe remote input"),
        }
        input
    }

    /// Input with every property supplied by the caller.
    pub fn with_source(source: InputSource, length: i64) -> Self {
        Self {
            source,
            mime_type: None,
            length,
            checksum: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }

    pub fn with_checksum(mut self, checksum: u32) -> Self {
        self.checksum = Some(checksum);
        self
    }

    pub fn source(&self) -> &InputSource {
        &self.source
    }

    pub fn path(&self) -> Option<&Path> {
        match self.source {
            InputSource::File(ref path) => Some(path),
            InputSource::Url(_) => None,
        }
    }

    pub fn url(&self) -> Option<&str> {
        match self.source {
            InputSource::Url(ref url) => Some(url),
            InputSource::File(_) => None,
        }
    }

    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn set_mime_type(&mut self, mime_type: Option<String>) {
        self.mime_type = mime_type;
    }

    /// Length in bytes, or `-1` if unknown.
    pub fn length(&self) -> i64 {
        self.length
    }

    pub fn checksum(&self) -> Option<u32> {
        self.checksum
    }

    pub fn set_checksum(&mut self, checksum: Option<u32>) {
        self.checksum = checksum;
    }
}

/// Computes the CRC32 of a file, reading it in fixed-size blocks.
pub fn crc32_file(path: &Path) -> Result<u32, ClientError> {
    let mut file = File::open(path)?;
    crc32_reader(&mut file)
}

/// Computes the CRC32 of everything `reader` yields.
pub fn crc32_reader<R: Read>(reader: &mut R) -> Result<u32, ClientError> {
    let mut hasher = crc32fast::Hasher::new();
    let mut block = vec![0u8; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut block)?;
        if n == 0 {
            break;
        }
        hasher.update(&block[..n]);
    }
    Ok(hasher.finalize())
}

fn probe_url(url: &str) -> Result<(Option<i64>, Option<String>), reqwest::Error> {
    let client = reqwest::blocking::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()?;
    let response = client.head(url).send()?.error_for_status()?;

    let length = response
        .headers()
        .get(reqwest::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<i64>().ok());
    let mime_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

    Ok((length, mime_type))
}
