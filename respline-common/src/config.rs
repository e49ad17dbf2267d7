//! # Client Configuration
//!
//! Purpose: Describe where a client connects and how patient it is. The
//! configuration is consumed read-only by the engine and its Connector.
//!
//! ## Design Principles
//! 1. **Plain Data**: A serde-friendly struct with sensible defaults.
//! 2. **Validate Once**: `validate()` runs before a client is built, so the
//!    hot path never re-checks configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RespError, RespResult};

/// Default per-operation timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;

/// Default read-pump segment size in bytes.
pub const DEFAULT_READ_CHUNK_SIZE: usize = 512;

/// Default number of consecutive transient read errors tolerated.
pub const DEFAULT_READ_RETRY_LIMIT: u32 = 3;

/// Default capacity of the write queue feeding the write pump.
pub const DEFAULT_WRITE_QUEUE_CAPACITY: usize = 1024;

/// Default number of distinct encoded commands kept in the cache.
pub const DEFAULT_COMMAND_CACHE_CAPACITY: usize = 1024;

/// Default cap on a declared bulk string length (512 MiB, the server's own limit).
pub const DEFAULT_MAX_BULK_LEN: usize = 512 * 1024 * 1024;

/// Default cap on array nesting within one reply.
pub const DEFAULT_MAX_REPLY_DEPTH: usize = 64;

/// Configuration for a single client connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Server host name or IP.
    pub host: String,
    /// Server port.
    pub port: u16,
    /// Per-operation timeout in milliseconds.
    pub timeout_ms: u64,
    /// Whether the Connector should establish a TLS stream.
    pub tls: bool,
    /// Optional password sent with `AUTH` after connecting.
    pub password: Option<String>,
    /// Optional database index sent with `SELECT` after connecting.
    pub database: Option<u32>,
    /// Optional name sent with `CLIENT SETNAME` after connecting.
    pub client_name: Option<String>,
    /// Size of each read-pump buffer segment.
    pub read_chunk_size: usize,
    /// Consecutive transient read errors tolerated before the pipe fails.
    pub read_retry_limit: u32,
    /// Bounded capacity of the write queue.
    pub write_queue_capacity: usize,
    /// Maximum distinct commands whose encoding is cached.
    pub command_cache_capacity: usize,
    /// Largest bulk string length a reply may declare.
    pub max_bulk_len: usize,
    /// Deepest array nesting a reply may use.
    pub max_reply_depth: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            host: "127.0.0.1".to_string(),
            port: 6379,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            tls: false,
            password: None,
            database: None,
            client_name: None,
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
            read_retry_limit: DEFAULT_READ_RETRY_LIMIT,
            write_queue_capacity: DEFAULT_WRITE_QUEUE_CAPACITY,
            command_cache_capacity: DEFAULT_COMMAND_CACHE_CAPACITY,
            max_bulk_len: DEFAULT_MAX_BULK_LEN,
            max_reply_depth: DEFAULT_MAX_REPLY_DEPTH,
        }
    }
}

impl ClientConfig {
    /// Creates a configuration for `host:port` with default settings.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ClientConfig {
            host: host.into(),
            port,
            ..ClientConfig::default()
        }
    }

    /// Parses a JSON document; missing fields take their defaults.
    pub fn from_json(raw: &str) -> RespResult<Self> {
        let config: ClientConfig =
            serde_json::from_str(raw).map_err(|err| RespError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the per-operation timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis().min(u64::MAX as u128) as u64;
        self
    }

    /// Per-operation timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Returns the `host:port` endpoint string.
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Rejects configurations the engine cannot run with.
    pub fn validate(&self) -> RespResult<()> {
        if self.host.is_empty() {
            return Err(RespError::Config("host must not be empty".to_string()));
        }
        if self.timeout_ms == 0 {
            return Err(RespError::Config("timeout_ms must be positive".to_string()));
        }
        if self.read_chunk_size == 0 {
            return Err(RespError::Config("read_chunk_size must be positive".to_string()));
        }
        if self.write_queue_capacity == 0 {
            return Err(RespError::Config(
                "write_queue_capacity must be positive".to_string(),
            ));
        }
        if self.max_reply_depth == 0 {
            return Err(RespError::Config("max_reply_depth must be positive".to_string()));
        }
        Ok(())
    }
}
