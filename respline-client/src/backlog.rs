//! # Command Backlog
//!
//! Purpose: Hold commands issued while no connection is usable and replay
//! them, in order, once one is.
//!
//! ## Design Principles
//! 1. **Strict FIFO**: One drain runs at a time and dispatches items one by
//!    one in enqueue order; an item leaves the queue exactly once.
//! 2. **Lazy, Coalesced Drain**: Enqueueing schedules a drain only if none is
//!    already scheduled; a successful connect schedules one too.
//! 3. **Non-Owning**: The drain task holds a `Weak` handle and checks it is
//!    still alive before doing anything, so an idle backlog never keeps its
//!    client alive.
//!
//! ## Failure Policy
//!
//! - Cannot connect: nothing is dequeued; items wait for the next trigger.
//! - An item fails with a connection fault: that item's waiter gets the
//!   error (it is not re-enqueued), the drain halts, and the remaining items
//!   stay queued in order.
//! - Any other per-item error goes to that item's waiter and the drain
//!   continues.

use std::collections::VecDeque;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use respline_common::{RespError, RespResult};

use crate::client::{ClientInner, ConnectionState};
use crate::command::Command;
use crate::value::{decode, Reply};

/// A deferred command and the channel its reply is delivered on.
struct BacklogItem {
    command: Command,
    reply: oneshot::Sender<RespResult<Reply>>,
}

/// Reply to a deferred command, resolved when the backlog drain runs it.
pub struct Deferred {
    rx: oneshot::Receiver<RespResult<Reply>>,
    endpoint: String,
}

impl Future for Deferred {
    type Output = RespResult<Reply>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx).poll(cx).map(|received| match received {
            Ok(result) => result,
            // The sender was dropped with the client before the item ran.
            Err(_) => Err(RespError::Connection {
                endpoint: this.endpoint.clone(),
                source: io::Error::new(
                    io::ErrorKind::NotConnected,
                    "client dropped before the deferred command ran",
                ),
            }),
        })
    }
}

/// How a drain run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DrainOutcome {
    Emptied,
    Halted,
}

/// FIFO queue of deferred commands.
pub(crate) struct Backlog {
    queue: Mutex<VecDeque<BacklogItem>>,
    scheduled: AtomicBool,
}

impl Backlog {
    pub fn new() -> Self {
        Backlog {
            queue: Mutex::new(VecDeque::new()),
            scheduled: AtomicBool::new(false),
        }
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    pub(crate) fn push(&self, command: Command, endpoint: String) -> Deferred {
        let (tx, rx) = oneshot::channel();
        self.queue.lock().push_back(BacklogItem { command, reply: tx });
        Deferred { rx, endpoint }
    }

    fn pop_front(&self) -> Option<BacklogItem> {
        self.queue.lock().pop_front()
    }

    /// Schedules a drain unless one is already scheduled or running.
    ///
    /// Outside a Tokio runtime nothing is spawned; items wait for the next
    /// successful connect.
    pub(crate) fn schedule(&self, client: Weak<ClientInner>) {
        if self.scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(drain(client));
            }
            Err(_) => {
                self.scheduled.store(false, Ordering::Release);
                debug!("no runtime available, backlog drain deferred");
            }
        }
    }
}

impl Default for Backlog {
    fn default() -> Self {
        Backlog::new()
    }
}

async fn drain(client: Weak<ClientInner>) {
    loop {
        let Some(inner) = client.upgrade() else {
            trace!("client gone, backlog drain skipped");
            return;
        };

        let outcome = run_drain(&inner).await;
        inner.backlog.scheduled.store(false, Ordering::Release);

        // Items may have arrived after the last dequeue but before the flag
        // was cleared. Re-run only when the connection is usable, so a down
        // server does not spin the drain.
        let rerun = !inner.backlog.is_empty()
            && (outcome == DrainOutcome::Emptied || inner.state() == ConnectionState::Connected)
            && !inner.backlog.scheduled.swap(true, Ordering::AcqRel);
        if !rerun {
            return;
        }
        drop(inner);
    }
}

async fn run_drain(inner: &Arc<ClientInner>) -> DrainOutcome {
    if inner.backlog.is_empty() {
        return DrainOutcome::Emptied;
    }

    if let Err(err) = inner.ensure_connection().await {
        debug!(error = %err, pending = inner.backlog.len(), "backlog waiting for a connection");
        return DrainOutcome::Halted;
    }

    let never = CancellationToken::new();
    while let Some(item) = inner.backlog.pop_front() {
        trace!(command = item.command.as_str(), "replaying deferred command");
        let result = inner
            .execute_command(item.command, decode::reply, &never)
            .await;
        let halt = matches!(&result, Err(err) if err.is_connection_fault());
        // The waiter may have given up; the command still ran.
        let _ = item.reply.send(result);
        if halt {
            debug!(pending = inner.backlog.len(), "backlog drain halted by connection fault");
            return DrainOutcome::Halted;
        }
    }
    DrainOutcome::Emptied
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn push_preserves_order() {
        let backlog = Backlog::new();
        let _a = backlog.push(Command::new("A"), "e".into());
        let _b = backlog.push(Command::new("B"), "e".into());
        let _c = backlog.push(Command::new("C"), "e".into());

        let order: Vec<String> = std::iter::from_fn(|| backlog.pop_front())
            .map(|item| item.command.as_str().to_string())
            .collect();
        assert_eq!(order, ["A", "B", "C"]);
        assert!(backlog.is_empty());
    }

    #[tokio::test]
    async fn dropped_item_resolves_with_connection_error() {
        let backlog = Backlog::new();
        let deferred = backlog.push(Command::new("PING"), "cache:6379".into());
        drop(backlog);

        let err = deferred.await.unwrap_err();
        assert!(err.is_connection_fault());
    }

    #[tokio::test]
    async fn drain_for_dead_client_is_noop() {
        let backlog = Backlog::new();
        let _deferred = backlog.push(Command::new("PING"), "e".into());
        // A Weak that never pointed at a live client.
        drain(Weak::new()).await;
        assert_eq!(backlog.len(), 1);
    }

    #[test]
    fn schedule_without_runtime_leaves_flag_clear() {
        let backlog = Backlog::new();
        backlog.schedule(Weak::new());
        assert!(!backlog.scheduled.load(Ordering::Acquire));
    }
}
