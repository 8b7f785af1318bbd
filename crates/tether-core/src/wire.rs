//! Newline-delimited JSON framing.
//!
//! One frame is one serialized [`Envelope`] followed by a single `\n`. No
//! length prefix. This module is sans-io: sockets push bytes into a
//! [`FrameDecoder`] and pull complete lines back out, so both connection
//! roles share the same splitting rules.

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::message::{ContractError, Envelope, MessageKind};

/// Frame delimiter.
pub const DELIMITER: u8 = b'\n';

/// Longest line the decoder buffers before giving up on the stream.
pub const MAX_FRAME_LEN: usize = 1024 * 1024;

/// Read buffer size used by the socket loops.
pub const READ_CHUNK: usize = 8 * 1024;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// The stream cannot be resynchronised. Close the connection.
    #[error("frame exceeds {max} bytes without a delimiter ({len} buffered)")]
    Oversized { len: usize, max: usize },

    #[error("frame is not valid UTF-8")]
    InvalidUtf8,

    #[error("failed to encode envelope: {0}")]
    Encode(#[from] serde_json::Error),
}

impl FrameError {
    /// Whether the connection must be dropped after this error.
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Oversized { .. })
    }
}

/// A complete line that did not yield a valid envelope.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("malformed JSON: {reason}")]
    Malformed { reason: String },

    #[error("envelope has no message_type")]
    MissingKind { correlation_id: Option<String> },

    #[error("{source}")]
    Invalid {
        correlation_id: Option<String>,
        #[source]
        source: ContractError,
    },
}

impl DecodeError {
    /// Correlation id of the offending envelope, when it could be read.
    pub fn correlation_id(&self) -> Option<&str> {
        match self {
            Self::Malformed { .. } => None,
            Self::MissingKind { correlation_id } | Self::Invalid { correlation_id, .. } => {
                correlation_id.as_deref()
            }
        }
    }
}

// ── Encoding ──────────────────────────────────────────────────────────────────

/// Serialize an envelope into one frame, delimiter included.
pub fn encode_frame(envelope: &Envelope) -> Result<Bytes, FrameError> {
    // serde_json escapes control characters, so the body never holds a raw newline.
    let mut out = serde_json::to_vec(envelope)?;
    out.push(DELIMITER);
    Ok(Bytes::from(out))
}

// ── Decoding ──────────────────────────────────────────────────────────────────

/// Parse one line into a validated envelope.
///
/// Validation stops at the first failure, in order: JSON syntax, envelope
/// shape, known `message_type`, then the payload schema for that kind. The
/// correlation id is recovered whenever the line was at least a JSON object
/// with a string `task_id`.
pub fn decode_line(line: &str) -> Result<Envelope, DecodeError> {
    let value: Value = serde_json::from_str(line).map_err(|e| DecodeError::Malformed {
        reason: e.to_string(),
    })?;
    let Value::Object(object) = value else {
        return Err(DecodeError::Malformed {
            reason: "top-level value is not an object".into(),
        });
    };

    let correlation_id = object
        .get("task_id")
        .and_then(Value::as_str)
        .map(str::to_string);

    let kind = match object.get("message_type") {
        None | Some(Value::Null) => return Err(DecodeError::MissingKind { correlation_id }),
        Some(Value::String(tag)) => MessageKind::parse(tag).ok_or_else(|| DecodeError::Invalid {
            correlation_id: correlation_id.clone(),
            source: ContractError::UnknownKind(tag.clone()),
        })?,
        Some(other) => {
            return Err(DecodeError::Invalid {
                correlation_id,
                source: ContractError::UnknownKind(other.to_string()),
            })
        }
    };

    let envelope: Envelope =
        serde_json::from_value(Value::Object(object)).map_err(|e| DecodeError::Invalid {
            correlation_id: correlation_id.clone(),
            source: ContractError::InvalidPayload {
                kind,
                reason: e.to_string(),
            },
        })?;

    envelope.message().map_err(|source| DecodeError::Invalid {
        correlation_id: Some(envelope.correlation_id.clone()),
        source,
    })?;
    Ok(envelope)
}

/// Incremental line splitter over a byte stream.
///
/// Partial reads stay buffered until their delimiter arrives; a single read
/// holding several frames yields them one by one. Blank lines are skipped.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
    /// Prefix of `buf` already searched for a delimiter.
    scanned: usize,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(READ_CHUNK),
            scanned: 0,
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Bytes received but not yet terminated by a delimiter.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete, non-empty line. `None` means more input is needed.
    pub fn next_line(&mut self) -> Option<Result<String, FrameError>> {
        loop {
            let found = self.buf[self.scanned..]
                .iter()
                .position(|b| *b == DELIMITER)
                .map(|p| p + self.scanned);
            let Some(pos) = found else {
                self.scanned = self.buf.len();
                if self.buf.len() > MAX_FRAME_LEN {
                    return Some(Err(FrameError::Oversized {
                        len: self.buf.len(),
                        max: MAX_FRAME_LEN,
                    }));
                }
                return None;
            };

            let frame = self.buf.split_to(pos + 1);
            self.scanned = 0;
            if pos > MAX_FRAME_LEN {
                return Some(Err(FrameError::Oversized {
                    len: pos,
                    max: MAX_FRAME_LEN,
                }));
            }
            let text = match std::str::from_utf8(&frame[..pos]) {
                Ok(text) => text.trim(),
                Err(_) => return Some(Err(FrameError::InvalidUtf8)),
            };
            if text.is_empty() {
                continue;
            }
            return Some(Ok(text.to_string()));
        }
    }
}
