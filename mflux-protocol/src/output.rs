//! Destinations for service output payloads.

use std::fmt;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Where an output payload is written.
pub enum OutputTarget {
    /// A file that is created (or truncated) when the payload arrives.
    File(PathBuf),
    /// A caller-supplied writer.
    Writer(Box<dyn Write + Send>),
    /// An in-memory buffer, readable through [`Output::bytes`].
    Memory(Vec<u8>),
}

impl fmt::Debug for OutputTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputTarget::File(path) => f.debug_tuple("File").field(path).finish(),
            OutputTarget::Writer(_) => f.write_str("Writer(..)"),
            OutputTarget::Memory(buf) => write!(f, "Memory({} bytes)", buf.len()),
        }
    }
}

/// A service output slot.
///
/// The mime type is unknown until the server's packet for this output has
/// been read.
#[derive(Debug)]
pub struct Output {
    target: OutputTarget,
    mime_type: Option<String>,
}

impl Output {
    pub fn new(target: OutputTarget) -> Self {
        Self {
            target,
            mime_type: None,
        }
    }

    /// Output written to the file at `path`.
    pub fn to_path(path: impl Into<PathBuf>) -> Self {
        Self::new(OutputTarget::File(path.into()))
    }

    /// Output written to an arbitrary writer.
    pub fn to_writer<W: Write + Send + 'static>(writer: W) -> Self {
        Self::new(OutputTarget::Writer(Box::new(writer)))
    }

    /// Output collected in memory.
    pub fn to_buffer() -> Self {
        Self::new(OutputTarget::Memory(Vec::new()))
    }

    pub fn target(&self) -> &OutputTarget {
        &self.target
    }

    /// Bytes collected by an in-memory output.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self.target {
            OutputTarget::Memory(ref buf) => Some(buf),
            _ => None,
        }
    }

    /// Consumes the output, returning collected bytes for in-memory outputs.
    pub fn into_bytes(self) -> Option<Vec<u8>> {
        match self.target {
            OutputTarget::Memory(buf) => Some(buf),
            _ => None,
        }
    }

    /// `file:` URL of a file output.
    pub fn url(&self) -> Option<String> {
        match self.target {
            OutputTarget::File(ref path) => Some(format!("file:{}", absolute(path).display())),
            _ => None,
        }
    }

    /// Mime type reported by the server, once the output has been received.
    pub fn mime_type(&self) -> Option<&str> {
        self.mime_type.as_deref()
    }

    pub fn set_mime_type(&mut self, mime_type: Option<String>) {
        self.mime_type = mime_type;
    }

    /// Opens the sink for a fresh payload.
    ///
    /// Memory outputs are cleared so a reused output only holds the latest
    /// payload.
    pub(crate) fn open(&mut self) -> io::Result<Sink<'_>> {
        match self.target {
            OutputTarget::File(ref path) => {
                Ok(Sink::File(BufWriter::new(File::create(path)?)))
            }
            OutputTarget::Writer(ref mut writer) => Ok(Sink::Borrowed(writer.as_mut())),
            OutputTarget::Memory(ref mut buf) => {
                buf.clear();
                Ok(Sink::Borrowed(buf))
            }
        }
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_dir()
        .map(|dir| dir.join(path))
        .unwrap_or_else(|_| path.to_path_buf())
}

/// An open output destination.
pub(crate) enum Sink<'a> {
    File(BufWriter<File>),
    Borrowed(&'a mut dyn Write),
}

impl Write for Sink<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Sink::File(w) => w.write(buf),
            Sink::Borrowed(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Sink::File(w) => w.flush(),
            Sink::Borrowed(w) => w.flush(),
        }
    }
}
