//! JSON-RPC framing codec for LSP communication.
//!
//! LSP uses `Content-Length: N\r\n\r\n{json}` framing over stdin/stdout.
//! [`FrameParser`] is push-based: bytes arrive in arbitrary chunks and
//! complete frames come out in arrival order. [`FrameWriter`] serializes one
//! frame at a time onto an async writer.
//!
//! Both halves fail closed. A corrupted framing boundary cannot be
//! resynchronized, so the parser latches after its first error and the writer
//! latches after the destination closes.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Maximum header block size.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 8 * 1024;

/// Maximum declared body size (4 MiB).
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;

/// Maximum bytes held while waiting for frames to complete.
pub const DEFAULT_MAX_BUFFER_BYTES: usize = DEFAULT_MAX_MESSAGE_BYTES + DEFAULT_MAX_HEADER_BYTES;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameLimits {
    pub max_header_bytes: usize,
    pub max_message_bytes: usize,
    pub max_buffer_bytes: usize,
}

impl Default for FrameLimits {
    fn default() -> Self {
        Self {
            max_header_bytes: DEFAULT_MAX_HEADER_BYTES,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
            max_buffer_bytes: DEFAULT_MAX_BUFFER_BYTES,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("header block exceeds {limit} bytes")]
    HeaderTooLarge { limit: usize },
    #[error("Content-Length {declared} exceeds maximum {limit}")]
    MessageTooLarge { declared: usize, limit: usize },
    #[error("buffered {buffered} bytes exceeds maximum {limit}")]
    BufferOverflow { buffered: usize, limit: usize },
    #[error("missing Content-Length header")]
    MissingContentLength,
    #[error("invalid Content-Length value: {0}")]
    InvalidContentLength(String),
    #[error("parsing JSON-RPC frame: {0}")]
    Json(String),
}

/// Output of one [`FrameParser::push`].
#[derive(Debug, PartialEq)]
pub enum FrameEvent {
    Message(serde_json::Value),
    Error(FrameError),
}

/// Incremental frame decoder.
///
/// After the first [`FrameEvent::Error`] the parser drops its buffer and
/// ignores every further push.
#[derive(Debug)]
pub struct FrameParser {
    limits: FrameLimits,
    buffer: Vec<u8>,
    /// Parsed header for the frame currently waiting on its body:
    /// `(header_len_including_terminator, content_length)`.
    pending: Option<(usize, usize)>,
    closed: bool,
}

impl Default for FrameParser {
    fn default() -> Self {
        Self::new(FrameLimits::default())
    }
}

impl FrameParser {
    #[must_use]
    pub fn new(limits: FrameLimits) -> Self {
        Self {
            limits,
            buffer: Vec::new(),
            pending: None,
            closed: false,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feed bytes and collect every frame they complete.
    ///
    /// Messages decoded before an error in the same push are still returned,
    /// followed by exactly one error.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<FrameEvent> {
        let mut events = Vec::new();
        if self.closed || bytes.is_empty() {
            return events;
        }

        let buffered = self.buffer.len() + bytes.len();
        if buffered > self.limits.max_buffer_bytes {
            self.fail(
                &mut events,
                FrameError::BufferOverflow {
                    buffered,
                    limit: self.limits.max_buffer_bytes,
                },
            );
            return events;
        }
        self.buffer.extend_from_slice(bytes);

        loop {
            match self.next_frame() {
                Ok(Some(value)) => events.push(FrameEvent::Message(value)),
                Ok(None) => break,
                Err(err) => {
                    self.fail(&mut events, err);
                    break;
                }
            }
        }
        events
    }

    fn fail(&mut self, events: &mut Vec<FrameEvent>, err: FrameError) {
        self.closed = true;
        self.pending = None;
        self.buffer = Vec::new();
        events.push(FrameEvent::Error(err));
    }

    fn next_frame(&mut self) -> Result<Option<serde_json::Value>, FrameError> {
        let (header_len, content_length) = match self.pending {
            Some(parsed) => parsed,
            None => {
                let Some(parsed) = self.parse_header()? else {
                    return Ok(None);
                };
                self.pending = Some(parsed);
                parsed
            }
        };

        let frame_len = header_len + content_length;
        if self.buffer.len() < frame_len {
            return Ok(None);
        }

        let value = serde_json::from_slice(&self.buffer[header_len..frame_len])
            .map_err(|e| FrameError::Json(e.to_string()))?;
        self.buffer.drain(..frame_len);
        self.pending = None;
        Ok(Some(value))
    }

    /// Parse the header block at the front of the buffer.
    ///
    /// Returns `None` until the terminator has arrived.
    fn parse_header(&self) -> Result<Option<(usize, usize)>, FrameError> {
        let limit = self.limits.max_header_bytes;
        let Some(end) = find_subslice(&self.buffer, HEADER_TERMINATOR) else {
            if self.buffer.len() > limit {
                return Err(FrameError::HeaderTooLarge { limit });
            }
            return Ok(None);
        };
        if end > limit {
            return Err(FrameError::HeaderTooLarge { limit });
        }

        let header = String::from_utf8_lossy(&self.buffer[..end]);
        let mut content_length: Option<usize> = None;
        for line in header.split("\r\n") {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            // LSP spec uses "Content-Length" but parse case-insensitively for robustness.
            if let Some((key, value)) = trimmed.split_once(':')
                && key.trim().eq_ignore_ascii_case("Content-Length")
            {
                let value = value.trim();
                let len = value
                    .parse::<usize>()
                    .map_err(|_| FrameError::InvalidContentLength(value.to_string()))?;
                content_length = Some(len);
            }
            // Ignore other headers (e.g. Content-Type)
        }

        let content_length = content_length.ok_or(FrameError::MissingContentLength)?;
        if content_length > self.limits.max_message_bytes {
            return Err(FrameError::MessageTooLarge {
                declared: content_length,
                limit: self.limits.max_message_bytes,
            });
        }
        Ok(Some((end + HEADER_TERMINATOR.len(), content_length)))
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Encode one frame: header plus serialized body.
pub fn encode_frame(msg: &serde_json::Value) -> Result<Vec<u8>, serde_json::Error> {
    let body = serde_json::to_vec(msg)?;
    let mut out = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    out.extend_from_slice(&body);
    Ok(out)
}

#[derive(Debug, Error)]
pub enum WriteError {
    /// The destination is gone. Terminal; retrying cannot succeed.
    #[error("destination closed")]
    Closed,
    #[error("serializing JSON-RPC frame: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("writing frame: {0}")]
    Io(io::Error),
}

/// True for IO errors that mean the peer has gone away.
#[must_use]
pub fn is_closed_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::BrokenPipe
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::WriteZero
    )
}

/// Writes JSON-RPC frames to an async writer.
///
/// Owned by a single writer task; concurrent senders go through that task's
/// queue so frames never interleave.
pub struct FrameWriter<W> {
    writer: W,
    closed: bool,
}

impl<W: AsyncWrite + Unpin> FrameWriter<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            closed: false,
        }
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Write a JSON-RPC frame with `Content-Length` header.
    pub async fn write_frame(&mut self, msg: &serde_json::Value) -> Result<(), WriteError> {
        if self.closed {
            return Err(WriteError::Closed);
        }
        let frame = encode_frame(msg)?;
        let result = async {
            self.writer.write_all(&frame).await?;
            self.writer.flush().await
        }
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(err) if is_closed_error(&err) => {
                self.closed = true;
                Err(WriteError::Closed)
            }
            Err(err) => Err(WriteError::Io(err)),
        }
    }
}
