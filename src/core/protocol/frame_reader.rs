// src/core/protocol/frame_reader.rs

//! Reads complete RESP commands and replies off a buffered stream as raw bytes.
//!
//! Unlike [`RespFrameCodec`](super::RespFrameCodec), nothing here builds a frame tree.
//! A command or reply is returned as the exact byte span received so it can be
//! replayed to the other side unchanged. The only structure recorded is where each
//! command argument starts and ends, which is enough to classify `AUTH`.

use super::resp_frame::{CRLF, CRLF_LEN, MAX_BULK_STRING_SIZE, MAX_FRAME_ELEMENTS, MAX_RECURSION_DEPTH};
use crate::core::GatewayError;
use bytes::{Bytes, BytesMut};
use std::ops::Range;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};

/// Longest accepted line: inline commands, length headers and status replies.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Which peer a frame is being read from. Decides the error a framing fault maps to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Peer {
    Client,
    Upstream,
}

impl Peer {
    fn error(self, msg: impl Into<String>) -> GatewayError {
        match self {
            Peer::Client => GatewayError::Protocol(msg.into()),
            Peer::Upstream => GatewayError::UpstreamProtocol(msg.into()),
        }
    }
}

/// One complete client command, exactly as it arrived on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawCommand {
    raw: Bytes,
    args: Vec<Range<usize>>,
}

impl RawCommand {
    /// The full command, headers and payloads included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }

    pub fn arg_count(&self) -> usize {
        self.args.len()
    }

    /// The payload of the argument at `index`, without its length header.
    pub fn arg(&self, index: usize) -> Option<&[u8]> {
        self.args.get(index).map(|range| &self.raw[range.clone()])
    }

    /// The command name, i.e. the first token.
    pub fn name(&self) -> Option<&[u8]> {
        self.arg(0)
    }

    /// Case-insensitive comparison of the command name.
    pub fn is(&self, name: &str) -> bool {
        self.name()
            .is_some_and(|n| n.eq_ignore_ascii_case(name.as_bytes()))
    }

    /// True for a blank inline line or `*0`. Servers ignore these without replying.
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Returns this command with `prefix` placed in front of its raw bytes. Argument
    /// positions are shifted so that `arg` keeps returning the same payloads.
    pub fn with_prefix(self, prefix: &[u8]) -> RawCommand {
        if prefix.is_empty() {
            return self;
        }
        let mut raw = BytesMut::with_capacity(prefix.len() + self.raw.len());
        raw.extend_from_slice(prefix);
        raw.extend_from_slice(&self.raw);
        let shift = prefix.len();
        RawCommand {
            raw: raw.freeze(),
            args: self
                .args
                .into_iter()
                .map(|range| range.start + shift..range.end + shift)
                .collect(),
        }
    }
}

/// One complete reply, exactly as it arrived on the wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RawReply {
    raw: Bytes,
}

impl RawReply {
    pub fn as_bytes(&self) -> &[u8] {
        &self.raw
    }

    pub fn into_bytes(self) -> Bytes {
        self.raw
    }

    /// True when the reply starts with the positive status marker (`+`).
    pub fn is_ok(&self) -> bool {
        self.raw.first() == Some(&b'+')
    }

    /// The first line of the reply without its terminator, for logging.
    pub fn summary(&self) -> String {
        String::from_utf8_lossy(trim_line(first_line(&self.raw))).to_string()
    }
}

/// Reads the next complete command from `reader`.
///
/// Returns `Ok(None)` when the stream ends cleanly before the first byte of a command.
/// A stream that ends anywhere inside a command is a protocol error.
pub async fn read_command<R>(reader: &mut R) -> Result<Option<RawCommand>, GatewayError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = BytesMut::new();
    if !read_line(reader, &mut buf, Peer::Client).await? {
        return Ok(None);
    }

    let line = trim_line(&buf);
    if line.first() != Some(&b'*') {
        let args = inline_tokens(line);
        return Ok(Some(RawCommand {
            raw: buf.freeze(),
            args,
        }));
    }

    let count = parse_length(&line[1..], Peer::Client, "array length")?;
    let count = checked_length(count, MAX_FRAME_ELEMENTS, Peer::Client, "array length")?;
    let mut args = Vec::with_capacity(count.min(16));
    for _ in 0..count {
        let header_start = buf.len();
        if !read_line(reader, &mut buf, Peer::Client).await? {
            return Err(Peer::Client.error("stream ended mid-command"));
        }
        let header = trim_line(&buf[header_start..]);
        if header.first() != Some(&b'$') {
            return Err(Peer::Client.error(format!(
                "expected bulk string header, got '{}'",
                header.escape_ascii()
            )));
        }
        let len = parse_length(&header[1..], Peer::Client, "bulk length")?;
        let len = checked_length(len, MAX_BULK_STRING_SIZE, Peer::Client, "bulk length")?;
        let payload_start = buf.len();
        read_payload(reader, &mut buf, len, Peer::Client).await?;
        args.push(payload_start..payload_start + len);
    }

    Ok(Some(RawCommand {
        raw: buf.freeze(),
        args,
    }))
}

/// Reads the next complete reply from `reader`.
///
/// Accepts every RESP2 and RESP3 reply type so that a reply to a pass-through command
/// (such as `HELLO 3`) can still be relayed whole. Returns `Ok(None)` when the stream
/// ends cleanly before the reply starts.
pub async fn read_reply<R>(reader: &mut R) -> Result<Option<RawReply>, GatewayError>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = BytesMut::new();
    // Stack of values still owed by each open aggregate.
    let mut pending: Vec<usize> = vec![1];

    while let Some(top) = pending.last_mut() {
        if *top == 0 {
            pending.pop();
            continue;
        }
        *top -= 1;

        let line_start = buf.len();
        if !read_line(reader, &mut buf, Peer::Upstream).await? {
            if line_start == 0 {
                return Ok(None);
            }
            return Err(Peer::Upstream.error("stream ended mid-reply"));
        }
        let line = trim_line(&buf[line_start..]);
        let Some((&kind, rest)) = line.split_first() else {
            return Err(Peer::Upstream.error("empty reply line"));
        };

        match kind {
            b'+' | b'-' | b':' | b'_' | b',' | b'#' | b'(' => {}
            b'$' | b'!' | b'=' => {
                let len = parse_length(rest, Peer::Upstream, "bulk length")?;
                if len == -1 {
                    continue;
                }
                let len = checked_length(len, MAX_BULK_STRING_SIZE, Peer::Upstream, "bulk length")?;
                read_payload(reader, &mut buf, len, Peer::Upstream).await?;
            }
            b'*' | b'~' | b'>' | b'%' | b'|' => {
                let len = parse_length(rest, Peer::Upstream, "aggregate length")?;
                if len == -1 {
                    continue;
                }
                let len =
                    checked_length(len, MAX_FRAME_ELEMENTS, Peer::Upstream, "aggregate length")?;
                let owed = match kind {
                    b'%' => len * 2,
                    // An attribute map is followed by the value it annotates.
                    b'|' => len * 2 + 1,
                    _ => len,
                };
                if owed > 0 {
                    if pending.len() > MAX_RECURSION_DEPTH {
                        return Err(Peer::Upstream.error("reply nesting depth limit exceeded"));
                    }
                    pending.push(owed);
                }
            }
            other => {
                return Err(Peer::Upstream.error(format!(
                    "unexpected reply type byte '{}'",
                    other.escape_ascii()
                )));
            }
        }
    }

    Ok(Some(RawReply { raw: buf.freeze() }))
}

/// Appends one `\n`-terminated line to `out`, terminator included.
///
/// Returns `Ok(false)` if the stream was already at its end.
async fn read_line<R>(reader: &mut R, out: &mut BytesMut, peer: Peer) -> Result<bool, GatewayError>
where
    R: AsyncBufRead + Unpin,
{
    let start = out.len();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if out.len() == start {
                return Ok(false);
            }
            return Err(peer.error("stream ended mid-line"));
        }
        let (taken, complete) = match available.iter().position(|b| *b == b'\n') {
            Some(pos) => (pos + 1, true),
            None => (available.len(), false),
        };
        out.extend_from_slice(&available[..taken]);
        reader.consume(taken);

        if out.len() - start > MAX_LINE_LENGTH {
            return Err(peer.error("line exceeds maximum length"));
        }
        if complete {
            return Ok(true);
        }
    }
}

/// Appends exactly `len` payload bytes plus the CRLF terminator to `out`.
///
/// The payload is copied as it arrives, so a large declared length never allocates
/// ahead of the data actually received.
async fn read_payload<R>(
    reader: &mut R,
    out: &mut BytesMut,
    len: usize,
    peer: Peer,
) -> Result<(), GatewayError>
where
    R: AsyncBufRead + Unpin,
{
    let start = out.len();
    let mut remaining = len + CRLF_LEN;
    while remaining > 0 {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(peer.error(format!(
                "stream ended after {} of {} declared bytes",
                len + CRLF_LEN - remaining,
                len + CRLF_LEN
            )));
        }
        let taken = available.len().min(remaining);
        out.extend_from_slice(&available[..taken]);
        reader.consume(taken);
        remaining -= taken;
    }

    if &out[start + len..] != CRLF {
        return Err(peer.error("bulk payload not terminated by CRLF"));
    }
    Ok(())
}

fn parse_length(digits: &[u8], peer: Peer, what: &str) -> Result<i64, GatewayError> {
    std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| peer.error(format!("invalid {what} '{}'", digits.escape_ascii())))
}

fn checked_length(value: i64, max: usize, peer: Peer, what: &str) -> Result<usize, GatewayError> {
    usize::try_from(value)
        .ok()
        .filter(|len| *len <= max)
        .ok_or_else(|| peer.error(format!("{what} {value} out of range")))
}

/// Strips the trailing `\n` and an optional preceding `\r`.
fn trim_line(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn first_line(raw: &[u8]) -> &[u8] {
    match raw.iter().position(|b| *b == b'\n') {
        Some(pos) => &raw[..=pos],
        None => raw,
    }
}

/// Byte ranges of the whitespace-separated tokens of an inline command.
fn inline_tokens(line: &[u8]) -> Vec<Range<usize>> {
    let mut tokens = Vec::new();
    let mut start = None;
    for (i, b) in line.iter().enumerate() {
        match (b.is_ascii_whitespace(), start) {
            (true, Some(s)) => {
                tokens.push(s..i);
                start = None;
            }
            (false, None) => start = Some(i),
            _ => {}
        }
    }
    if let Some(s) = start {
        tokens.push(s..line.len());
    }
    tokens
}
