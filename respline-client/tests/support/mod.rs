//! Scripted in-memory server for integration tests.

#![allow(dead_code)]

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{duplex, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, DuplexStream, ReadBuf};

use respline_client::{BoxedTransport, ClientConfig, Connector, Reply, RespClient};

/// What the fake server does with one command line.
pub enum Response {
    Reply(Reply),
    /// Never answer.
    Silent,
    /// Make the client's next transport read fail with a reset.
    Fault,
}

type Handler = dyn Fn(&str) -> Response + Send + Sync;

struct ServerState {
    accepting: AtomicBool,
    attempts: AtomicUsize,
    connects: AtomicUsize,
    received: Mutex<Vec<String>>,
    handler: Box<Handler>,
}

/// Connector whose every connection is served by a scripted handler.
#[derive(Clone)]
pub struct ScriptedServer {
    state: Arc<ServerState>,
}

impl ScriptedServer {
    pub fn new<F>(handler: F) -> Self
    where
        F: Fn(&str) -> Response + Send + Sync + 'static,
    {
        ScriptedServer {
            state: Arc::new(ServerState {
                accepting: AtomicBool::new(true),
                attempts: AtomicUsize::new(0),
                connects: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
                handler: Box::new(handler),
            }),
        }
    }

    /// Server that answers every command with `+OK`.
    pub fn ok() -> Self {
        ScriptedServer::new(|_| Response::Reply(Reply::Status("OK".to_string())))
    }

    pub fn set_accepting(&self, accepting: bool) {
        self.state.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Connection attempts, refused ones included.
    pub fn attempts(&self) -> usize {
        self.state.attempts.load(Ordering::SeqCst)
    }

    /// Connections actually established.
    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    /// Every command line received, across connections, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.state.received.lock().expect("received lock").clone()
    }

    pub fn client(&self, timeout: Duration) -> RespClient {
        let config = ClientConfig::default().with_timeout(timeout);
        RespClient::with_connector(config, self.clone()).expect("client")
    }
}

#[async_trait]
impl Connector for ScriptedServer {
    async fn connect(&self, _config: &ClientConfig) -> io::Result<BoxedTransport> {
        self.state.attempts.fetch_add(1, Ordering::SeqCst);
        if !self.state.accepting.load(Ordering::SeqCst) {
            return Err(io::Error::from(io::ErrorKind::ConnectionRefused));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);

        let (client, server) = duplex(64 * 1024);
        let fail_reads = Arc::new(AtomicBool::new(false));
        tokio::spawn(serve(server, Arc::clone(&self.state), Arc::clone(&fail_reads)));
        Ok(Box::new(FaultyStream {
            inner: client,
            fail_reads,
        }))
    }
}

async fn serve(stream: DuplexStream, state: Arc<ServerState>, fail_reads: Arc<AtomicBool>) {
    let (read, mut write) = tokio::io::split(stream);
    let mut lines = BufReader::new(read).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        state.received.lock().expect("received lock").push(line.clone());
        match (state.handler)(&line) {
            Response::Reply(reply) => {
                if write.write_all(&reply.to_bytes()).await.is_err() {
                    break;
                }
            }
            Response::Silent => {}
            Response::Fault => {
                fail_reads.store(true, Ordering::SeqCst);
                // Wake the client's pending read so it observes the fault.
                let _ = write.write_all(b"x").await;
            }
        }
    }
}

/// Duplex stream whose reads can be switched to fail.
struct FaultyStream {
    inner: DuplexStream,
    fail_reads: Arc<AtomicBool>,
}

impl AsyncRead for FaultyStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Poll::Ready(Err(io::Error::from(io::ErrorKind::ConnectionReset)));
        }
        Pin::new(&mut self.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for FaultyStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Installs a test subscriber; output is controlled by `RUST_LOG`.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Polls `condition` until it holds or `limit` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, limit: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
