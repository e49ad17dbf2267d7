//! # RESP Reply Decoding
//!
//! Purpose: Decode typed replies from a `PipeReader` that receives bytes in
//! arbitrary increments, asking the read pump for more whenever a frame is
//! incomplete.
//!
//! ## Design Principles
//! 1. **Resumable Cursor**: Nothing is consumed until a whole line (or a whole
//!    bulk payload plus its terminator) is buffered, so split deliveries
//!    decode the same as one large delivery.
//! 2. **Fail Fast**: Bad tags, bad lengths, missing terminators and premature
//!    end-of-input are protocol errors, never retried.
//! 3. **Bounded**: Array nesting and declared bulk lengths are capped by
//!    `DecodeLimits`; a reply past either cap is a protocol error.
//! 4. **Top-Level Errors Fail the Command**: `read_response` turns a `-` line
//!    into `CommandFailure`; nested error lines stay `Reply::Error`.
//!
//! ## Wire Format (subset)
//!
//! ```text
//! +OK\r\n                 status
//! -ERR message\r\n        error
//! :1000\r\n               integer
//! $5\r\nhello\r\n         bulk string ($-1 = null)
//! *2\r\n:1\r\n:2\r\n      array (*-1 = null, nested replies follow)
//! ```

use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

use respline_common::{ClientConfig, RespError, RespResult};

use crate::command::CRLF;
use crate::pipe::PipeReader;
use crate::value::Reply;

type DecodeFuture<'a> = Pin<Box<dyn Future<Output = RespResult<Reply>> + Send + 'a>>;

/// Bounds applied to untrusted reply headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodeLimits {
    /// Deepest array nesting accepted; the outermost array is level 1.
    pub max_depth: usize,
    /// Largest declared bulk string length accepted.
    pub max_bulk_len: usize,
}

impl Default for DecodeLimits {
    fn default() -> Self {
        DecodeLimits::from(&ClientConfig::default())
    }
}

impl From<&ClientConfig> for DecodeLimits {
    fn from(config: &ClientConfig) -> Self {
        DecodeLimits {
            max_depth: config.max_reply_depth,
            max_bulk_len: config.max_bulk_len,
        }
    }
}

/// Reads one reply, failing the command if the server sent an error line.
pub async fn read_response(
    reader: &mut PipeReader,
    command: &str,
    limits: DecodeLimits,
) -> RespResult<Reply> {
    match decode_reply(reader, limits).await? {
        Reply::Error(message) => Err(RespError::CommandFailure {
            message,
            command: command.to_string(),
        }),
        reply => Ok(reply),
    }
}

/// Decodes one reply of any shape, including error lines.
pub fn decode_reply(reader: &mut PipeReader, limits: DecodeLimits) -> DecodeFuture<'_> {
    decode_nested(reader, limits, 0)
}

// Boxed because arrays recurse; `depth` counts the arrays enclosing this reply.
fn decode_nested(reader: &mut PipeReader, limits: DecodeLimits, depth: usize) -> DecodeFuture<'_> {
    Box::pin(async move {
        let line = read_line(reader).await?;
        let (&tag, body) = line
            .split_first()
            .ok_or_else(|| RespError::protocol("unexpected reply: empty line"))?;

        match tag {
            b'+' => Ok(Reply::Status(lossy(body))),
            b'-' => Ok(Reply::Error(lossy(body))),
            b':' => parse_i64(body)
                .map(Reply::Integer)
                .ok_or_else(|| RespError::protocol("invalid integer")),
            b'$' => {
                let len = parse_i64(body).ok_or_else(|| RespError::protocol("invalid length"))?;
                read_bulk(reader, len, limits).await.map(Reply::Bulk)
            }
            b'*' => {
                let count = parse_i64(body).ok_or_else(|| RespError::protocol("invalid length"))?;
                if depth >= limits.max_depth {
                    return Err(RespError::protocol("nesting too deep"));
                }
                read_array(reader, count, limits, depth + 1)
                    .await
                    .map(Reply::Array)
            }
            _ => Err(RespError::protocol(format!("unexpected reply: {}", lossy(&line)))),
        }
    })
}

/// Reads a CRLF-terminated line, without the terminator.
pub async fn read_line(reader: &mut PipeReader) -> RespResult<Bytes> {
    // Bytes already scanned without finding CRLF; resume one byte early in
    // case the CR was the last byte of the previous segment.
    let mut scanned = 0;
    loop {
        let buffered = reader.buffered();
        if let Some(pos) = find_crlf(&buffered[scanned..]) {
            let end = scanned + pos;
            let line = reader.take(end);
            reader.consume(CRLF.len());
            return Ok(line);
        }
        scanned = buffered.len().saturating_sub(1);

        if !reader.fill().await? {
            return Err(RespError::protocol("unexpected end of stream before line terminator"));
        }
    }
}

async fn read_bulk(
    reader: &mut PipeReader,
    len: i64,
    limits: DecodeLimits,
) -> RespResult<Option<Bytes>> {
    if len == -1 {
        return Ok(None);
    }
    let len = usize::try_from(len)
        .ok()
        .filter(|&len| len <= limits.max_bulk_len)
        .ok_or_else(|| RespError::protocol("invalid length"))?;

    // Payload and terminator must both be buffered before anything is consumed.
    let needed = len
        .checked_add(CRLF.len())
        .ok_or_else(|| RespError::protocol("invalid length"))?;
    while reader.buffered().len() < needed {
        if !reader.fill().await? {
            return Err(RespError::protocol("unexpected end of stream inside bulk string"));
        }
    }

    if &reader.buffered()[len..needed] != CRLF {
        return Err(RespError::protocol("invalid termination"));
    }
    let data = reader.take(len);
    reader.consume(CRLF.len());
    Ok(Some(data))
}

async fn read_array(
    reader: &mut PipeReader,
    count: i64,
    limits: DecodeLimits,
    depth: usize,
) -> RespResult<Option<Vec<Reply>>> {
    if count == -1 {
        return Ok(None);
    }
    let count = usize::try_from(count).map_err(|_| RespError::protocol("invalid length"))?;

    // Cap the preallocation; the count is untrusted.
    let mut items = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        items.push(decode_nested(reader, limits, depth).await?);
    }
    Ok(Some(items))
}

fn find_crlf(data: &[u8]) -> Option<usize> {
    data.windows(2).position(|window| window == CRLF)
}

fn lossy(data: &[u8]) -> String {
    String::from_utf8_lossy(data).into_owned()
}

fn parse_i64(data: &[u8]) -> Option<i64> {
    std::str::from_utf8(data).ok()?.parse().ok()
}
