//! # Connectors
//!
//! Purpose: Turn a `ClientConfig` into a live duplex transport. The engine
//! calls its Connector on first use and again after any fault invalidates
//! the connection; how the stream is made (TCP, TLS, in-memory) is the
//! Connector's business.

use std::io;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use respline_common::ClientConfig;

use crate::pipe::BoxedTransport;

/// Source of fresh transports.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Opens a readable and writable stream to the configured server.
    async fn connect(&self, config: &ClientConfig) -> io::Result<BoxedTransport>;
}

/// Plain TCP connector.
///
/// TLS needs a connector that wraps the socket in a TLS stream; this one
/// refuses configurations with `tls` enabled rather than silently
/// downgrading.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, config: &ClientConfig) -> io::Result<BoxedTransport> {
        if config.tls {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "TLS requested but TcpConnector only opens plain sockets",
            ));
        }

        let endpoint = config.endpoint();
        debug!(%endpoint, "opening TCP connection");
        let stream = TcpStream::connect(endpoint.as_str()).await?;
        // Disable Nagle to keep request latency low for small commands.
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}
