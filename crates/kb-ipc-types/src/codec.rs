//! Newline-delimited JSON framing for wire messages.
//!
//! The wire carries an unbounded stream of independent messages over a
//! byte-oriented connection. Each message is one JSON document terminated by
//! a newline, so a receiver can parse incrementally without knowing message
//! lengths in advance. Decoding is lenient: blank lines (keepalives, stray
//! whitespace) are skipped silently and a line that fails to parse is logged
//! and discarded, because a single corrupt message must never stall or crash
//! the connection.

use std::io::Write;

use thiserror::Error;
use tracing::warn;

use crate::envelope::WireMessage;

const CODEC_TARGET: &str = "kb_ipc_types::codec";

/// Maximum bytes a single line may occupy before the stream is considered
/// broken. Matches the bound the parent process places on request lines.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Errors surfaced while encoding messages or framing the inbound stream.
#[derive(Debug, Error)]
pub enum CodecError {
    /// The message could not be serialized to JSON.
    #[error("failed to serialise wire message: {0}")]
    Serialize(#[from] serde_json::Error),
    /// Writing the encoded message to the output stream failed.
    #[error("failed to write wire message: {0}")]
    Io(#[from] std::io::Error),
    /// The inbound stream accumulated more than the line limit without a
    /// newline; the connection cannot recover its framing.
    #[error("wire line exceeds maximum size of {limit} bytes")]
    OversizedLine {
        /// The configured line limit.
        limit: usize,
    },
}

/// Encodes a message as a newline-terminated JSON line.
///
/// # Errors
///
/// Returns [`CodecError::Serialize`] if the message cannot be serialized.
pub fn encode_message(message: &WireMessage) -> Result<String, CodecError> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

/// Serializes a message and writes it to the stream, newline-terminated,
/// flushing afterwards.
///
/// # Errors
///
/// Returns [`CodecError::Serialize`] if serialization fails, or
/// [`CodecError::Io`] if writing or flushing fails.
pub fn write_message<W: Write>(writer: &mut W, message: &WireMessage) -> Result<(), CodecError> {
    serde_json::to_writer(&mut *writer, message)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
}

/// Parses a single frame into a message.
///
/// The line is trimmed before parsing. Returns `None` for blank lines and
/// for lines that fail to parse; parse failures are logged at `warn` so an
/// operator can notice a misbehaving peer.
#[must_use]
pub fn decode_line(line: &[u8]) -> Option<WireMessage> {
    let trimmed = line.trim_ascii();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_slice(trimmed) {
        Ok(message) => Some(message),
        Err(error) => {
            warn!(
                target: CODEC_TARGET,
                %error,
                line_bytes = trimmed.len(),
                "discarding malformed wire line"
            );
            None
        }
    }
}

/// Incremental decoder for a newline-delimited message stream.
///
/// Each connection owns one decoder. Reads append raw bytes; the decoder
/// extracts every complete line and yields the messages that parse,
/// retaining any trailing partial line for the next read.
#[derive(Debug)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    max_line_bytes: usize,
}

impl LineDecoder {
    /// Creates a decoder with the default line limit.
    #[must_use]
    pub const fn new() -> Self {
        Self::with_limit(MAX_LINE_BYTES)
    }

    /// Creates a decoder with a custom line limit.
    #[must_use]
    pub const fn with_limit(max_line_bytes: usize) -> Self {
        Self {
            buffer: Vec::new(),
            max_line_bytes,
        }
    }

    /// Appends received bytes and drains every complete message.
    ///
    /// Corrupt and blank lines are skipped; decoding continues with the
    /// remaining buffer.
    ///
    /// # Errors
    ///
    /// Returns [`CodecError::OversizedLine`] when any line, complete or
    /// still partial, outgrows the limit. The stream's framing is
    /// unrecoverable at that point and the caller should drop the
    /// connection.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<WireMessage>, CodecError> {
        self.buffer.extend_from_slice(bytes);

        let mut messages = Vec::new();
        while let Some(newline_pos) = self.buffer.iter().position(|byte| *byte == b'\n') {
            if newline_pos > self.max_line_bytes {
                return Err(CodecError::OversizedLine {
                    limit: self.max_line_bytes,
                });
            }
            let line: Vec<u8> = self.buffer.drain(..=newline_pos).collect();
            if let Some(message) = decode_line(&line) {
                messages.push(message);
            }
        }

        if self.buffer.len() > self.max_line_bytes {
            return Err(CodecError::OversizedLine {
                limit: self.max_line_bytes,
            });
        }

        Ok(messages)
    }

    /// Returns the number of buffered bytes awaiting a newline.
    #[must_use]
    pub const fn pending_bytes(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
