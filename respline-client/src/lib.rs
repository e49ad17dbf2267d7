//! # respline Client
//!
//! Purpose: Speak RESP over a single duplex connection, one command at a
//! time, with timeouts, cancellation, fault classification, reconnection,
//! and a backlog for commands issued while no connection is usable.
//!
//! ## Design Principles
//! 1. **Single-Flight**: One admission lock per connection covers write,
//!    read and decode, so the protocol state machine needs no other locking.
//! 2. **Pumped I/O**: A `DuplexPipe` moves bytes in the background; the
//!    codec decodes from a resumable cursor regardless of read sizes.
//! 3. **Classified Failures**: Only unclassified transport faults tear the
//!    connection down (see `RespError`).
//! 4. **Pluggable Transport**: A `Connector` supplies streams (TCP, TLS, or
//!    in-memory for tests).

mod backlog;
mod client;
pub mod codec;
mod command;
mod commands;
mod connector;
pub mod pipe;
mod value;

pub use backlog::Deferred;
pub use codec::DecodeLimits;
pub use client::{ConnectionState, RespClient};
pub use command::{Command, CommandCache, ENCODED_NEWLINE};
pub use connector::{Connector, TcpConnector};
pub use pipe::{BoxedTransport, DuplexPipe, PipeOptions, PipeReader, PipeWriter, Transport};
pub use value::{decode, Decode, DecodedValue, Reply, StringValue};

pub use respline_common::{ClientConfig, RespError, RespResult};
