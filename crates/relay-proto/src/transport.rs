//! Length-prefixed frame codec for relay envelopes.
//!
//! Frame format:
//! ```text
//! +----------------+-----------------------+
//! |  4 bytes       |  N bytes              |
//! |  (length BE)   |  (UTF-8 JSON object)  |
//! +----------------+-----------------------+
//! ```
//!
//! A malformed frame is never recoverable: once the decoder returns an error
//! the stream position is undefined and the connection must be dropped.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

use crate::envelope::Envelope;

/// Default maximum payload size (16 MB)
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Length prefix size in bytes
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for length-prefixed JSON envelopes
#[derive(Debug)]
pub struct FrameCodec {
    current_length: Option<usize>,
    max_frame_size: usize,
}

impl FrameCodec {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    #[must_use]
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            current_length: None,
            max_frame_size,
        }
    }

    #[must_use]
    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Envelope;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if self.current_length.is_none() {
            if src.len() < LENGTH_PREFIX_SIZE {
                return Ok(None);
            }

            let len = src.get_u32() as usize;

            // Reject before reserving anything for the announced payload.
            if len > self.max_frame_size {
                return Err(CodecError::FrameTooLarge {
                    size: len,
                    max: self.max_frame_size,
                });
            }

            self.current_length = Some(len);
        }

        let Some(length) = self.current_length else {
            return Ok(None);
        };

        if src.len() < length {
            src.reserve(length - src.len());
            return Ok(None);
        }

        let payload = src.split_to(length);
        self.current_length = None;

        parse_payload(&payload).map(Some)
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(envelope) => Ok(Some(envelope)),
            None if buf.is_empty() && self.current_length.is_none() => Ok(None),
            None => {
                let expected = self.current_length.take().unwrap_or(LENGTH_PREFIX_SIZE);
                let received = buf.len();
                buf.clear();
                Err(CodecError::Truncated { expected, received })
            }
        }
    }
}

impl Encoder<Envelope> for FrameCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_into(&item, self.max_frame_size, dst)
    }
}

// Payload size is checked against max_frame_size, which callers keep below u32::MAX
#[allow(clippy::cast_possible_truncation)]
fn encode_into(item: &Envelope, max_frame_size: usize, dst: &mut BytesMut) -> Result<(), CodecError> {
    let json = serde_json::to_vec(item)?;

    if json.len() > max_frame_size || u32::try_from(json.len()).is_err() {
        return Err(CodecError::FrameTooLarge {
            size: json.len(),
            max: max_frame_size,
        });
    }

    dst.reserve(LENGTH_PREFIX_SIZE + json.len());
    dst.put_u32(json.len() as u32);
    dst.put_slice(&json);

    Ok(())
}

fn parse_payload(payload: &[u8]) -> Result<Envelope, CodecError> {
    let json_str = std::str::from_utf8(payload)?;
    let value: serde_json::Value = serde_json::from_str(json_str)?;
    Envelope::from_value(value).map_err(|_| CodecError::NotAnObject)
}

/// Encode a single envelope into a standalone frame.
///
/// # Errors
///
/// Returns an error if the envelope fails to serialize or exceeds the default frame limit.
pub fn encode_frame(envelope: &Envelope) -> Result<Bytes, CodecError> {
    let mut buf = BytesMut::new();
    encode_into(envelope, DEFAULT_MAX_FRAME_SIZE, &mut buf)?;
    Ok(buf.freeze())
}

/// Decode exactly one complete frame.
///
/// # Errors
///
/// Returns [`CodecError::Truncated`] if `frame` ends before the announced
/// payload, or any other codec error for a malformed payload.
pub fn decode_frame(frame: &[u8]) -> Result<Envelope, CodecError> {
    let mut codec = FrameCodec::new();
    let mut buf = BytesMut::from(frame);
    codec
        .decode_eof(&mut buf)?
        .ok_or(CodecError::Truncated {
            expected: LENGTH_PREFIX_SIZE,
            received: 0,
        })
}

/// Errors that can occur during codec operations
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("UTF-8 error: {0}")]
    Utf8(#[from] std::str::Utf8Error),

    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("Frame payload is not a JSON object")]
    NotAnObject,

    #[error("Stream ended mid-frame: expected {expected} bytes, received {received}")]
    Truncated { expected: usize, received: usize },
}
