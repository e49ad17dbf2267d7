//! # Replies and Decoded Values
//!
//! Purpose: Model what the server sent (`Reply`) and what a caller asked for
//! (`DecodedValue`, `StringValue`), plus the decoders that bridge the two.
//!
//! ## Design Principles
//! 1. **No Conflation**: A null bulk (`$-1`) and a null array (`*-1`) are
//!    `None`; an empty bulk or array is `Some(empty)`.
//! 2. **Strategy Pattern**: Typed commands pass a `Decode` implementation to
//!    the engine; plain closures qualify.
//! 3. **Encode Mirrors Decode**: `Reply::encode` writes exactly what the
//!    codec reads back.

use bytes::{BufMut, Bytes, BytesMut};

use respline_common::{RespError, RespResult};

use crate::command::unescape_newlines;

/// A decoded RESP reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// `+OK` style status line.
    Status(String),
    /// `-ERR ...` line nested inside an array.
    ///
    /// A top-level error line never becomes a `Reply`; it fails the command.
    Error(String),
    /// `:123` signed integer.
    Integer(i64),
    /// `$<len>` bulk string, `None` for `$-1`.
    Bulk(Option<Bytes>),
    /// `*<count>` array, `None` for `*-1`.
    Array(Option<Vec<Reply>>),
}

impl Reply {
    /// Short name of the reply shape, for error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Reply::Status(_) => "status",
            Reply::Error(_) => "error",
            Reply::Integer(_) => "integer",
            Reply::Bulk(_) => "bulk string",
            Reply::Array(_) => "array",
        }
    }

    /// Appends the wire form of this reply to `out`.
    pub fn encode(&self, out: &mut BytesMut) {
        match self {
            Reply::Status(text) => put_line(out, b'+', text.as_bytes()),
            Reply::Error(text) => put_line(out, b'-', text.as_bytes()),
            Reply::Integer(value) => put_line(out, b':', value.to_string().as_bytes()),
            Reply::Bulk(None) => out.put_slice(b"$-1\r\n"),
            Reply::Bulk(Some(data)) => {
                put_line(out, b'$', data.len().to_string().as_bytes());
                out.put_slice(data);
                out.put_slice(b"\r\n");
            }
            Reply::Array(None) => out.put_slice(b"*-1\r\n"),
            Reply::Array(Some(items)) => {
                put_line(out, b'*', items.len().to_string().as_bytes());
                for item in items {
                    item.encode(out);
                }
            }
        }
    }

    /// Wire form of this reply.
    pub fn to_bytes(&self) -> Bytes {
        let mut out = BytesMut::new();
        self.encode(&mut out);
        out.freeze()
    }
}

fn put_line(out: &mut BytesMut, tag: u8, body: &[u8]) {
    out.reserve(body.len() + 3);
    out.put_u8(tag);
    out.put_slice(body);
    out.put_slice(b"\r\n");
}

/// A decoded value with a presence test.
///
/// Presence means "differs from `T::default()`".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedValue<T> {
    value: T,
}

impl<T> DecodedValue<T> {
    pub fn new(value: T) -> Self {
        DecodedValue { value }
    }

    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T: Default + PartialEq> DecodedValue<T> {
    /// Returns true when the value is not the type's default.
    pub fn has_value(&self) -> bool {
        self.value != T::default()
    }
}

/// A decoded string value.
///
/// Null and empty strings are both absent. Newlines escaped by the encoder
/// are restored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringValue {
    value: Option<String>,
}

impl StringValue {
    pub fn new(value: Option<String>) -> Self {
        let value = value.map(|text| unescape_newlines(&text).into_owned());
        StringValue { value }
    }

    /// Returns true for a non-null, non-empty string.
    pub fn has_value(&self) -> bool {
        self.value.as_deref().map_or(false, |text| !text.is_empty())
    }

    pub fn as_deref(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn into_inner(self) -> Option<String> {
        self.value
    }
}

/// Converts a reply into the shape a command expects.
pub trait Decode: Send {
    type Output: Send;

    fn decode(self, reply: Reply) -> RespResult<Self::Output>;
}

impl<F, T> Decode for F
where
    F: FnOnce(Reply) -> RespResult<T> + Send,
    T: Send,
{
    type Output = T;

    fn decode(self, reply: Reply) -> RespResult<T> {
        self(reply)
    }
}

fn unexpected(reply: &Reply) -> RespError {
    RespError::protocol(format!("unexpected reply: {}", reply.kind()))
}

/// Stock decoders for the common reply shapes.
pub mod decode {
    use super::*;

    /// Returns the reply untouched.
    pub fn reply(reply: Reply) -> RespResult<Reply> {
        Ok(reply)
    }

    /// Expects a status line and returns its text.
    pub fn status(reply: Reply) -> RespResult<String> {
        match reply {
            Reply::Status(text) => Ok(text),
            other => Err(unexpected(&other)),
        }
    }

    /// Expects `+OK`.
    pub fn ok(reply: Reply) -> RespResult<()> {
        match reply {
            Reply::Status(ref text) if text == "OK" => Ok(()),
            other => Err(unexpected(&other)),
        }
    }

    /// Expects an integer.
    pub fn integer(reply: Reply) -> RespResult<DecodedValue<i64>> {
        match reply {
            Reply::Integer(value) => Ok(DecodedValue::new(value)),
            other => Err(unexpected(&other)),
        }
    }

    /// Expects a bulk string (or status) and decodes it as UTF-8.
    pub fn string(reply: Reply) -> RespResult<StringValue> {
        match reply {
            Reply::Bulk(None) => Ok(StringValue::new(None)),
            Reply::Bulk(Some(data)) => {
                let text = String::from_utf8(data.to_vec())
                    .map_err(|_| RespError::protocol("bulk string is not valid UTF-8"))?;
                Ok(StringValue::new(Some(text)))
            }
            Reply::Status(text) => Ok(StringValue::new(Some(text))),
            other => Err(unexpected(&other)),
        }
    }

    /// Expects a bulk string and returns its raw bytes.
    pub fn bytes(reply: Reply) -> RespResult<Option<Bytes>> {
        match reply {
            Reply::Bulk(data) => Ok(data),
            other => Err(unexpected(&other)),
        }
    }
}
