//! Framed codec for the test host connection.
//!
//! Each frame is a length-prefixed UTF-8 string holding one JSON [`Message`].
//! The prefix is a 7-bit variable-length unsigned integer (low group first, high
//! bit marks continuation), the same layout .NET's `BinaryWriter.Write(string)`
//! produces, so either end can be written on top of a plain binary writer.

use serde::Deserialize;
use tokio_util::bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::Message;

/// Frames above this size are rejected in both directions.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

/// A u32 needs at most five 7-bit groups.
const MAX_PREFIX_BYTES: usize = 5;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("length prefix does not fit in 32 bits")]
    PrefixOverflow,
    #[error("frame of {len} bytes exceeds limit of {max} bytes")]
    FrameTooLarge { len: usize, max: usize },
    #[error("stream ended inside a frame ({buffered} bytes buffered)")]
    Truncated { buffered: usize },
    #[error("frame is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),
    #[error("frame is not a valid message: {0}")]
    InvalidJson(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// Codec that frames [`Message`]s with a varint length prefix and JSON body.
#[derive(Debug, Clone)]
pub struct MessageCodec {
    max_frame_length: usize,
}

impl Default for MessageCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageCodec {
    pub fn new() -> Self {
        Self {
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}

/// Returns `(body_len, prefix_len)` once the whole prefix is buffered.
fn read_prefix(src: &[u8]) -> Result<Option<(usize, usize)>, CodecError> {
    let mut value: u64 = 0;
    for (i, &byte) in src.iter().take(MAX_PREFIX_BYTES).enumerate() {
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            if value > u64::from(i32::MAX as u32) {
                return Err(CodecError::PrefixOverflow);
            }
            return Ok(Some((value as usize, i + 1)));
        }
    }
    if src.len() >= MAX_PREFIX_BYTES {
        return Err(CodecError::PrefixOverflow);
    }
    Ok(None)
}

fn write_prefix(mut len: usize, dst: &mut BytesMut) {
    while len >= 0x80 {
        dst.put_u8((len as u8 & 0x7f) | 0x80);
        len >>= 7;
    }
    dst.put_u8(len as u8);
}

impl Decoder for MessageCodec {
    type Item = Message;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some((len, prefix_len)) = read_prefix(src)? else {
            return Ok(None);
        };
        if len > self.max_frame_length {
            return Err(CodecError::FrameTooLarge {
                len,
                max: self.max_frame_length,
            });
        }

        let frame_len = prefix_len + len;
        if src.len() < frame_len {
            src.reserve(frame_len - src.len());
            return Ok(None);
        }

        src.advance(prefix_len);
        let body = src.split_to(len);
        let text = std::str::from_utf8(&body)?;
        let value: serde_json::Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(CodecError::NotAnObject);
        }
        let message = Message::deserialize(value)?;
        tracing::trace!(
            frame_bytes = len,
            message_type = %message.message_type,
            "Decoded frame"
        );
        Ok(Some(message))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(message) => Ok(Some(message)),
            None if buf.is_empty() => Ok(None),
            None => Err(CodecError::Truncated {
                buffered: buf.len(),
            }),
        }
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json = serde_json::to_vec(&item)?;
        if json.len() > self.max_frame_length {
            return Err(CodecError::FrameTooLarge {
                len: json.len(),
                max: self.max_frame_length,
            });
        }
        tracing::trace!(
            frame_bytes = json.len(),
            message_type = %item.message_type,
            "Encoding frame"
        );
        dst.reserve(MAX_PREFIX_BYTES + json.len());
        write_prefix(json.len(), dst);
        dst.extend_from_slice(&json);
        Ok(())
    }
}
