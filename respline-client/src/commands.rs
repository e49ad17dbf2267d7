//! # Typed Commands
//!
//! Thin wrappers over `RespClient::execute`: each supplies a command line
//! and a decoder for the reply shape it expects. Commands are sent inline
//! (space-separated), so keys and values must not contain spaces.

use std::time::Duration;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use respline_common::RespResult;

use crate::client::RespClient;
use crate::value::{decode, DecodedValue, Reply, StringValue};

impl RespClient {
    /// Pings the server and returns the status text (normally `PONG`).
    pub async fn ping(&self) -> RespResult<String> {
        self.execute("PING", decode::status, &CancellationToken::new())
            .await
    }

    /// Fetches server INFO output.
    pub async fn info(&self) -> RespResult<StringValue> {
        self.info_with_cancel(&CancellationToken::new()).await
    }

    /// Fetches server INFO output, abandoning it if `cancel` fires.
    pub async fn info_with_cancel(&self, cancel: &CancellationToken) -> RespResult<StringValue> {
        self.execute("INFO", decode::string, cancel).await
    }

    /// Number of keys in the selected database.
    pub async fn db_size(&self) -> RespResult<i64> {
        self.db_size_with_cancel(&CancellationToken::new()).await
    }

    /// Number of keys, abandoning the call if `cancel` fires.
    pub async fn db_size_with_cancel(&self, cancel: &CancellationToken) -> RespResult<i64> {
        self.execute("DBSIZE", decode::integer, cancel)
            .await
            .map(DecodedValue::into_inner)
    }

    /// Fetches a value by key; absent when the key is missing.
    pub async fn get(&self, key: &str) -> RespResult<StringValue> {
        let command = format!("GET {}", key);
        self.execute(&command, decode::string, &CancellationToken::new())
            .await
    }

    /// Fetches raw bytes by key.
    pub async fn get_bytes(&self, key: &str) -> RespResult<Option<Bytes>> {
        let command = format!("GET {}", key);
        self.execute(&command, decode::bytes, &CancellationToken::new())
            .await
    }

    /// Sets a value for a key without expiration.
    pub async fn set(&self, key: &str, value: &str) -> RespResult<()> {
        let command = format!("SET {} {}", key, value);
        self.execute(&command, decode::ok, &CancellationToken::new())
            .await
    }

    /// Sets a value and attaches an expiration in seconds.
    pub async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> RespResult<()> {
        let command = format!("SET {} {} EX {}", key, value, ttl.as_secs().max(1));
        self.execute(&command, decode::ok, &CancellationToken::new())
            .await
    }

    /// Deletes a key. Returns true when a key was removed.
    pub async fn del(&self, key: &str) -> RespResult<bool> {
        let command = format!("DEL {}", key);
        let removed = self
            .execute(&command, decode::integer, &CancellationToken::new())
            .await?;
        Ok(removed.has_value())
    }

    /// Sends an arbitrary command and returns the raw reply.
    pub async fn raw(&self, command: &str) -> RespResult<Reply> {
        self.execute(command, decode::reply, &CancellationToken::new())
            .await
    }
}
