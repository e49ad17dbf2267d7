//! # Encoded Commands
//!
//! Purpose: Pair a command's text with its wire bytes, computed once and
//! frozen, so repeated sends reuse the exact same buffer.
//!
//! ## Design Principles
//! 1. **Immutable Encoding**: `Command` holds `Bytes`; cloning is a refcount bump.
//! 2. **Encode Once**: `CommandCache` hands back the same encoding for the same text.
//! 3. **Line-Safe**: The wire is line-oriented, so literal newlines inside the
//!    text are escaped with `ENCODED_NEWLINE` (reversed by `StringValue`).

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

/// Sentinel that stands in for a newline inside a command line.
pub const ENCODED_NEWLINE: &str = "%RESPLINE_NL%";

/// Line terminator for requests and replies.
pub const CRLF: &[u8] = b"\r\n";

/// Immutable command: textual form plus precomputed wire bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    text: Arc<str>,
    encoded: Bytes,
}

impl Command {
    /// Encodes `text` as UTF-8 followed by CRLF.
    pub fn new(text: &str) -> Self {
        let escaped = escape_newlines(text);
        let mut buf = BytesMut::with_capacity(escaped.len() + CRLF.len());
        buf.put_slice(escaped.as_bytes());
        buf.put_slice(CRLF);
        Command {
            text: Arc::from(text),
            encoded: buf.freeze(),
        }
    }

    /// Original command text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Wire bytes, terminator included.
    pub fn encoded(&self) -> &Bytes {
        &self.encoded
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Command").field(&self.text).finish()
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Replaces literal newlines with `ENCODED_NEWLINE`.
pub fn escape_newlines(text: &str) -> Cow<'_, str> {
    if text.contains('\n') {
        Cow::Owned(text.replace('\n', ENCODED_NEWLINE))
    } else {
        Cow::Borrowed(text)
    }
}

/// Reverses `escape_newlines`.
pub fn unescape_newlines(text: &str) -> Cow<'_, str> {
    if text.contains(ENCODED_NEWLINE) {
        Cow::Owned(text.replace(ENCODED_NEWLINE, "\n"))
    } else {
        Cow::Borrowed(text)
    }
}

/// Bounded cache of encoded commands keyed by text.
///
/// Once full, new texts are encoded on demand but not retained, so a stream
/// of unique keys cannot grow the cache without bound.
pub struct CommandCache {
    capacity: usize,
    entries: Mutex<HashMap<Arc<str>, Command>>,
}

impl CommandCache {
    /// Creates a cache holding at most `capacity` encodings.
    pub fn new(capacity: usize) -> Self {
        CommandCache {
            capacity,
            entries: Mutex::new(HashMap::with_capacity(capacity.min(64))),
        }
    }

    /// Returns the cached encoding for `text`, encoding it on a miss.
    pub fn get_or_encode(&self, text: &str) -> Command {
        let mut entries = self.entries.lock();
        if let Some(command) = entries.get(text) {
            return command.clone();
        }

        let command = Command::new(text);
        if entries.len() < self.capacity {
            entries.insert(Arc::clone(&command.text), command.clone());
        }
        command
    }

    /// Number of cached encodings.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Returns true when nothing is cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
