//! # Execution Engine
//!
//! Purpose: Run one logical command at a time over a `DuplexPipe`, racing
//! every operation against the caller's cancellation and a per-operation
//! timer, classifying faults, and re-establishing the connection when a
//! transport fault invalidates it.
//!
//! ## Design Principles
//! 1. **Single-Flight**: The admission lock owns the connection slot, so the
//!    write → read → decode cycle of one command never interleaves with
//!    another's.
//! 2. **Classify, Then Decide**: Protocol, command-failure, timeout and
//!    cancellation errors pass through untouched; any other fault tears the
//!    transport down and surfaces as a connection error.
//! 3. **Replace, Never Patch**: Reconnecting drops the old pipe and builds a
//!    new one under the lock, so no pump ever sees a half-built transport.
//! 4. **Non-Owning Backlog**: Deferred commands are drained by a task that
//!    holds only a `Weak` handle to the client.
//!
//! ## Execute Flow
//!
//! ```text
//! execute(text, decoder, cancel)
//!   ├─ cancel already fired? ──────────────► Cancelled
//!   └─ select! { dispatch | cancel | timer }
//!        dispatch:
//!          lock admission ─► ensure connected (connect + handshake if needed)
//!          ─► write encoded command ─► read reply ─► decode
//!          ─► classify fault (invalidate on unclassified I/O)
//! ```

use std::io;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use respline_common::{ClientConfig, RespError, RespResult};

use crate::backlog::{Backlog, Deferred};
use crate::codec::{self, DecodeLimits};
use crate::command::{Command, CommandCache};
use crate::connector::{Connector, TcpConnector};
use crate::pipe::{self, DuplexPipe, PipeOptions};
use crate::value::{decode, Decode};

/// Lifecycle of the client's connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => ConnectionState::Connecting,
            2 => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }
}

/// A live pipe plus the bookkeeping needed to know whether it is reusable.
struct Connection {
    pipe: DuplexPipe,
    // Set after a write, cleared once the full reply was consumed. A pipe
    // still awaiting a reply at admission holds a stale reply and is replaced.
    awaiting_reply: bool,
}

impl Connection {
    fn is_reusable(&self) -> bool {
        !self.awaiting_reply && !self.pipe.is_closed()
    }
}

/// Decrements the outstanding counter on every exit path.
struct OutstandingGuard<'a>(&'a AtomicU64);

impl<'a> OutstandingGuard<'a> {
    fn enter(counter: &'a AtomicU64) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        OutstandingGuard(counter)
    }
}

impl Drop for OutstandingGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Holds the state at `Connecting` for one connect attempt.
///
/// Dropping it before `established` (an error, or the timer or caller
/// abandoning the attempt) falls back to `Disconnected`.
struct ConnectAttempt<'a> {
    state: &'a AtomicU8,
    established: bool,
}

impl<'a> ConnectAttempt<'a> {
    fn begin(state: &'a AtomicU8) -> Self {
        state.store(ConnectionState::Connecting as u8, Ordering::Release);
        ConnectAttempt {
            state,
            established: false,
        }
    }

    fn established(mut self) {
        self.established = true;
        self.state
            .store(ConnectionState::Connected as u8, Ordering::Release);
    }
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.established {
            self.state
                .store(ConnectionState::Disconnected as u8, Ordering::Release);
        }
    }
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    endpoint: String,
    connector: Arc<dyn Connector>,
    weak_self: Weak<ClientInner>,
    // Admission lock: whoever holds it owns the connection slot.
    connection: AsyncMutex<Option<Connection>>,
    state: AtomicU8,
    outstanding: AtomicU64,
    performed: AtomicU64,
    last_action: Mutex<&'static str>,
    last_command: Mutex<Option<String>>,
    commands: CommandCache,
    pub(crate) backlog: Backlog,
}

/// Single-connection RESP client.
///
/// Cheap to clone; clones share one connection and one admission lock.
#[derive(Clone)]
pub struct RespClient {
    inner: Arc<ClientInner>,
}

impl RespClient {
    /// Creates a client that connects over plain TCP on first use.
    pub fn new(config: ClientConfig) -> RespResult<Self> {
        Self::with_connector(config, TcpConnector)
    }

    /// Creates a client that obtains transports from `connector`.
    pub fn with_connector<C>(config: ClientConfig, connector: C) -> RespResult<Self>
    where
        C: Connector + 'static,
    {
        config.validate()?;
        let endpoint = config.endpoint();
        let commands = CommandCache::new(config.command_cache_capacity);
        let inner = Arc::new_cyclic(|weak_self| ClientInner {
            config,
            endpoint,
            connector: Arc::new(connector),
            weak_self: weak_self.clone(),
            connection: AsyncMutex::new(None),
            state: AtomicU8::new(ConnectionState::Disconnected as u8),
            outstanding: AtomicU64::new(0),
            performed: AtomicU64::new(0),
            last_action: Mutex::new("idle"),
            last_command: Mutex::new(None),
            commands,
            backlog: Backlog::new(),
        });
        Ok(RespClient { inner })
    }

    /// Sends `command` and decodes its reply with `decoder`.
    ///
    /// Fails with `Cancelled` if `cancel` fires first, `Timeout` if the
    /// configured timeout elapses first, and `Connection` (after tearing the
    /// transport down) on any unclassified transport fault.
    pub async fn execute<D: Decode>(
        &self,
        command: &str,
        decoder: D,
        cancel: &CancellationToken,
    ) -> RespResult<D::Output> {
        let command = self.inner.commands.get_or_encode(command);
        self.inner.execute_command(command, decoder, cancel).await
    }

    /// Queues `command` for replay once a connection is usable.
    ///
    /// The returned future resolves with the raw reply when the backlog
    /// drain dispatches it.
    pub fn defer(&self, command: &str) -> Deferred {
        let command = self.inner.commands.get_or_encode(command);
        let deferred = self.inner.backlog.push(command, self.inner.endpoint.clone());
        self.inner.backlog.schedule(self.inner.weak_self.clone());
        deferred
    }

    /// Tears down the current connection, if any.
    ///
    /// The next command reconnects.
    pub async fn disconnect(&self) {
        let mut slot = self.inner.connection.lock().await;
        self.inner.invalidate(&mut slot);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.state() == ConnectionState::Connected
    }

    /// Commands currently inside `execute`, waiting or running.
    pub fn outstanding_operations(&self) -> u64 {
        self.inner.outstanding.load(Ordering::Acquire)
    }

    /// Commands admitted over the client's lifetime.
    pub fn operations_performed(&self) -> u64 {
        self.inner.performed.load(Ordering::Acquire)
    }

    /// Step the client is in (or was in when it last failed).
    pub fn last_action(&self) -> &'static str {
        self.inner.last_action()
    }

    pub fn last_command(&self) -> Option<String> {
        self.inner.last_command()
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Deferred commands not yet dispatched.
    pub fn backlog_len(&self) -> usize {
        self.inner.backlog.len()
    }
}

impl ClientInner {
    pub(crate) fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn set_action(&self, action: &'static str) {
        *self.last_action.lock() = action;
    }

    fn last_action(&self) -> &'static str {
        *self.last_action.lock()
    }

    fn last_command(&self) -> Option<String> {
        self.last_command.lock().clone()
    }

    pub(crate) async fn execute_command<D: Decode>(
        &self,
        command: Command,
        decoder: D,
        cancel: &CancellationToken,
    ) -> RespResult<D::Output> {
        if cancel.is_cancelled() {
            self.set_action("rejecting an already cancelled operation");
            return Err(RespError::Cancelled);
        }

        let _outstanding = OutstandingGuard::enter(&self.outstanding);
        let timer = tokio::time::sleep(self.config.timeout());

        // Dropping `dispatch` releases the admission lock; a pipe abandoned
        // mid-exchange is replaced at the next admission.
        tokio::select! {
            biased;
            result = self.dispatch(&command, decoder, cancel) => result,
            _ = cancel.cancelled() => {
                debug!(command = command.as_str(), "operation cancelled by caller");
                Err(RespError::Cancelled)
            }
            _ = timer => {
                warn!(
                    endpoint = %self.endpoint,
                    command = command.as_str(),
                    last_action = self.last_action(),
                    "operation timed out"
                );
                Err(self.timeout_error())
            }
        }
    }

    /// Ensures a usable connection exists, connecting if needed.
    ///
    /// Used by the backlog drain before it dequeues anything.
    pub(crate) async fn ensure_connection(&self) -> RespResult<()> {
        let establish = async {
            let mut slot = self.connection.lock().await;
            self.ensure_connected(&mut slot).await.map(|_| ())
        };
        match tokio::time::timeout(self.config.timeout(), establish).await {
            Ok(result) => result,
            Err(_) => Err(self.timeout_error()),
        }
    }

    async fn dispatch<D: Decode>(
        &self,
        command: &Command,
        decoder: D,
        cancel: &CancellationToken,
    ) -> RespResult<D::Output> {
        self.set_action("waiting for the admission lock");
        let mut slot = self.connection.lock().await;

        self.performed.fetch_add(1, Ordering::AcqRel);
        *self.last_command.lock() = Some(command.as_str().to_string());
        debug!(command = command.as_str(), "executing command");

        let result = match self.ensure_connected(&mut slot).await {
            Ok(connection) => self.round_trip(connection, command, decoder).await,
            Err(err) => Err(err),
        };

        let result = result.map_err(|err| self.classify(err, cancel, &mut slot));
        self.set_action("releasing the admission lock");
        result
    }

    /// Returns the live connection, replacing a missing, closed, or stale one.
    async fn ensure_connected<'a>(
        &self,
        slot: &'a mut Option<Connection>,
    ) -> RespResult<&'a mut Connection> {
        let reusable = self.state() == ConnectionState::Connected
            && slot.as_ref().map_or(false, Connection::is_reusable);

        if !reusable {
            if slot.take().is_some() {
                debug!(endpoint = %self.endpoint, "discarding unusable connection");
            }
            let fresh = self.connect().await?;
            *slot = Some(fresh);
        }

        match slot {
            Some(connection) => Ok(connection),
            None => Err(RespError::Connection {
                endpoint: self.endpoint.clone(),
                source: io::Error::new(io::ErrorKind::NotConnected, "no connection available"),
            }),
        }
    }

    async fn connect(&self) -> RespResult<Connection> {
        let attempt = ConnectAttempt::begin(&self.state);
        self.set_action("connecting");
        debug!(endpoint = %self.endpoint, "establishing connection");

        let transport = match self.connector.connect(&self.config).await {
            Ok(transport) => transport,
            Err(source) => {
                warn!(endpoint = %self.endpoint, error = %source, "connect failed");
                return Err(RespError::Connection {
                    endpoint: self.endpoint.clone(),
                    source,
                });
            }
        };

        let mut connection = Connection {
            pipe: DuplexPipe::new(transport, PipeOptions::from(&self.config)),
            awaiting_reply: false,
        };

        if let Err(err) = self.handshake(&mut connection).await {
            warn!(endpoint = %self.endpoint, error = %err, "connection handshake failed");
            return Err(match err {
                RespError::Io(source) => RespError::Connection {
                    endpoint: self.endpoint.clone(),
                    source,
                },
                other => other,
            });
        }

        attempt.established();
        debug!(endpoint = %self.endpoint, "connected");

        if !self.backlog.is_empty() {
            self.backlog.schedule(self.weak_self.clone());
        }
        Ok(connection)
    }

    /// Replays session setup on a fresh connection.
    ///
    /// Runs while the admission lock is already held, so it talks to the
    /// pipe directly instead of re-entering `execute`.
    async fn handshake(&self, connection: &mut Connection) -> RespResult<()> {
        if let Some(password) = &self.config.password {
            self.set_action("authenticating");
            let auth = Command::new(&format!("AUTH {}", password));
            self.round_trip(connection, &auth, decode::ok).await?;
        }
        if let Some(database) = self.config.database {
            self.set_action("selecting database");
            let select = Command::new(&format!("SELECT {}", database));
            self.round_trip(connection, &select, decode::ok).await?;
        }
        if let Some(name) = &self.config.client_name {
            self.set_action("naming connection");
            let setname = Command::new(&format!("CLIENT SETNAME {}", name));
            self.round_trip(connection, &setname, decode::ok).await?;
        }
        Ok(())
    }

    async fn round_trip<D: Decode>(
        &self,
        connection: &mut Connection,
        command: &Command,
        decoder: D,
    ) -> RespResult<D::Output> {
        self.set_action("writing command");
        connection.awaiting_reply = true;
        connection
            .pipe
            .output()
            .write(command.encoded().clone())
            .await?;

        self.set_action("reading reply");
        let limits = DecodeLimits::from(&self.config);
        let response = codec::read_response(connection.pipe.input(), command.as_str(), limits).await;
        // An error line is consumed whole; only I/O and framing failures can
        // leave part of a reply behind.
        if !matches!(response, Err(RespError::Io(_)) | Err(RespError::Protocol(_))) {
            connection.awaiting_reply = false;
        }
        let reply = response?;

        self.set_action("decoding reply");
        decoder.decode(reply)
    }

    fn classify(
        &self,
        err: RespError,
        cancel: &CancellationToken,
        slot: &mut Option<Connection>,
    ) -> RespError {
        match err {
            RespError::Io(source) if pipe::is_aborted(&source) => {
                debug!(error = %source, "transport aborted by cancellation");
                if cancel.is_cancelled() {
                    RespError::Cancelled
                } else {
                    self.timeout_error()
                }
            }
            RespError::Io(source) => {
                warn!(endpoint = %self.endpoint, error = %source, "transport fault, invalidating connection");
                self.invalidate(slot);
                RespError::Connection {
                    endpoint: self.endpoint.clone(),
                    source,
                }
            }
            other => other,
        }
    }

    fn invalidate(&self, slot: &mut Option<Connection>) {
        self.set_state(ConnectionState::Disconnected);
        if slot.take().is_some() {
            debug!(endpoint = %self.endpoint, "connection torn down");
        }
    }

    fn timeout_error(&self) -> RespError {
        RespError::Timeout {
            endpoint: self.endpoint.clone(),
            timeout: self.config.timeout(),
            last_action: self.last_action(),
            last_command: self.last_command(),
        }
    }
}
