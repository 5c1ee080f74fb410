// src/core/protocol/resp_frame.rs

//! Implements the RESP (REdis Serialization Protocol) frame structure and the
//! corresponding `Encoder` and `Decoder`.
//!
//! The gateway never decodes relayed traffic into frames. Frames are only used for
//! what the gateway itself writes: the hidden `SELECT` and its own error replies.
//! The decoder is kept for peers that want structured access, such as test upstreams.

use crate::core::GatewayError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// The CRLF (Carriage Return, Line Feed) sequence used to terminate lines in RESP.
pub const CRLF: &[u8] = b"\r\n";
pub const CRLF_LEN: usize = 2;

// Protocol-level limits shared with the raw frame reader.
pub const MAX_FRAME_ELEMENTS: usize = 1_024 * 1_024; // Max elements in an array.
pub const MAX_BULK_STRING_SIZE: usize = 512 * 1024 * 1024; // 512MB max bulk string size.
pub const MAX_RECURSION_DEPTH: usize = 256; // Limit recursion to prevent stack overflow.

/// An enum representing a single frame in the RESP protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    BulkString(Bytes),
    Null,
    NullArray,
    Array(Vec<RespFrame>),
}

impl RespFrame {
    /// Builds a command as an array of bulk strings, the form every client library sends.
    pub fn command<I, B>(parts: I) -> Self
    where
        I: IntoIterator<Item = B>,
        B: Into<Bytes>,
    {
        RespFrame::Array(
            parts
                .into_iter()
                .map(|p| RespFrame::BulkString(p.into()))
                .collect(),
        )
    }

    /// A convenience method to encode a frame into a `Vec<u8>`.
    pub fn encode_to_vec(&self) -> Result<Vec<u8>, GatewayError> {
        let mut buf = BytesMut::new();
        RespFrameCodec.encode(self.clone(), &mut buf)?;
        Ok(buf.to_vec())
    }
}

/// A `tokio_util::codec` implementation for encoding and decoding `RespFrame`s.
#[derive(Debug, Default, Clone, Copy)]
pub struct RespFrameCodec;

impl Encoder<RespFrame> for RespFrameCodec {
    type Error = GatewayError;

    fn encode(&mut self, item: RespFrame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        match item {
            RespFrame::SimpleString(s) => {
                dst.extend_from_slice(b"+");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Error(s) => {
                dst.extend_from_slice(b"-");
                dst.extend_from_slice(s.as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Integer(i) => {
                dst.extend_from_slice(b":");
                dst.extend_from_slice(i.to_string().as_bytes());
                dst.extend_from_slice(CRLF);
            }
            RespFrame::BulkString(b) => {
                dst.extend_from_slice(b"$");
                dst.extend_from_slice(b.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                dst.extend_from_slice(&b);
                dst.extend_from_slice(CRLF);
            }
            RespFrame::Null => {
                dst.extend_from_slice(b"$-1\r\n");
            }
            RespFrame::NullArray => {
                dst.extend_from_slice(b"*-1\r\n");
            }
            RespFrame::Array(arr) => {
                dst.extend_from_slice(b"*");
                dst.extend_from_slice(arr.len().to_string().as_bytes());
                dst.extend_from_slice(CRLF);
                for frame in arr {
                    self.encode(frame, dst)?;
                }
            }
        }
        Ok(())
    }
}

/// Internal parse outcome: either more bytes are needed or the input is malformed.
enum DecodeError {
    Incomplete,
    Invalid(String),
}

type DecodeResult<T> = Result<T, DecodeError>;

impl Decoder for RespFrameCodec {
    type Item = RespFrame;
    type Error = GatewayError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.is_empty() {
            return Ok(None);
        }

        let mut bytes = &src[..];
        match decode_recursive(&mut bytes, 0) {
            Ok(frame) => {
                let len = src.len() - bytes.len();
                src.advance(len);
                Ok(Some(frame))
            }
            Err(DecodeError::Incomplete) => Ok(None),
            Err(DecodeError::Invalid(msg)) => Err(GatewayError::Protocol(msg)),
        }
    }
}

fn decode_recursive(bytes: &mut &[u8], depth: usize) -> DecodeResult<RespFrame> {
    if depth > MAX_RECURSION_DEPTH {
        return Err(DecodeError::Invalid(
            "RESP recursion depth limit exceeded".to_string(),
        ));
    }
    let Some(&prefix) = bytes.first() else {
        return Err(DecodeError::Incomplete);
    };
    *bytes = &bytes[1..];

    match prefix {
        b'+' => Ok(RespFrame::SimpleString(lossy(parse_line(bytes)?))),
        b'-' => Ok(RespFrame::Error(lossy(parse_line(bytes)?))),
        b':' => Ok(RespFrame::Integer(parse_number(parse_line(bytes)?)?)),
        b'$' => {
            let len = parse_number(parse_line(bytes)?)?;
            if len == -1 {
                return Ok(RespFrame::Null);
            }
            let len = checked_len(len, MAX_BULK_STRING_SIZE, "bulk length")?;
            if bytes.len() < len + CRLF_LEN {
                return Err(DecodeError::Incomplete);
            }
            if &bytes[len..len + CRLF_LEN] != CRLF {
                return Err(DecodeError::Invalid(
                    "bulk string not terminated by CRLF".to_string(),
                ));
            }
            let data = Bytes::copy_from_slice(&bytes[..len]);
            *bytes = &bytes[len + CRLF_LEN..];
            Ok(RespFrame::BulkString(data))
        }
        b'*' => {
            let len = parse_number(parse_line(bytes)?)?;
            if len == -1 {
                return Ok(RespFrame::NullArray);
            }
            let len = checked_len(len, MAX_FRAME_ELEMENTS, "array length")?;
            let mut frames = Vec::with_capacity(len.min(64));
            for _ in 0..len {
                frames.push(decode_recursive(bytes, depth + 1)?);
            }
            Ok(RespFrame::Array(frames))
        }
        other => Err(DecodeError::Invalid(format!(
            "unexpected type byte '{}'",
            other.escape_ascii()
        ))),
    }
}

/// Splits off the next CRLF-terminated line, advancing past the terminator.
fn parse_line<'a>(bytes: &mut &'a [u8]) -> DecodeResult<&'a [u8]> {
    let pos = find_crlf(bytes).ok_or(DecodeError::Incomplete)?;
    let line = &bytes[..pos];
    *bytes = &bytes[pos + CRLF_LEN..];
    Ok(line)
}

fn parse_number(line: &[u8]) -> DecodeResult<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| DecodeError::Invalid(format!("invalid number '{}'", line.escape_ascii())))
}

fn checked_len(value: i64, max: usize, what: &str) -> DecodeResult<usize> {
    usize::try_from(value)
        .ok()
        .filter(|len| *len <= max)
        .ok_or_else(|| DecodeError::Invalid(format!("invalid {what} {value}")))
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).to_string()
}

/// Helper function to find the next CRLF sequence in a buffer.
fn find_crlf(src: &[u8]) -> Option<usize> {
    src.windows(CRLF_LEN).position(|window| window == CRLF)
}
