//! A single live monitoring connection to one shard
//!
//! ```text
//!   ShardClient::monitor()          pump task
//!   ┌──────────────┐         ┌────────────────────┐
//!   │ EventStream  │────────►│ seq += 1           │──► on_event sender
//!   └──────────────┘         │ stream ended?      │──► on_end notify (once)
//!                            └────────────────────┘
//! ```
//!
//! The pump only runs while the connection is `Ready` and a handler is
//! registered. `disconnect()` aborts the pump and waits for it, so no
//! handler is invoked after it returns.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::error::ConnectError;
use crate::event::{ShardEvent, ShardId};

use super::{EventStream, ShardClient};

/// Lifecycle of a shard connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShardStatus {
    /// Not connected yet
    Disconnected,
    /// Monitoring command in flight
    Connecting,
    /// Stream established, events flow
    Ready,
    /// Connect failed
    Error,
    /// Disconnected locally or ended by the backend
    Closed,
}

type EndNotify = Arc<Mutex<Option<oneshot::Sender<ShardId>>>>;

/// Live event stream from one shard, owned by its multiplexer
pub struct ShardConnection {
    shard: ShardId,
    status: ShardStatus,

    /// Stream waiting for a handler before the pump starts
    stream: Option<EventStream>,

    /// Current event handler; replaced on re-registration
    handler: watch::Sender<Option<mpsc::Sender<ShardEvent>>>,

    /// Fires once when the backend ends the stream
    end_notify: EndNotify,

    pump: Option<JoinHandle<()>>,

    connect_timeout: Duration,
    disconnect_timeout: Duration,
}

impl ShardConnection {
    /// Create a disconnected connection for `shard`
    pub fn new(shard: ShardId, connect_timeout: Duration, disconnect_timeout: Duration) -> Self {
        let (handler, _) = watch::channel(None);

        Self {
            shard,
            status: ShardStatus::Disconnected,
            stream: None,
            handler,
            end_notify: Arc::new(Mutex::new(None)),
            pump: None,
            connect_timeout,
            disconnect_timeout,
        }
    }

    /// Shard this connection monitors
    pub fn shard(&self) -> &ShardId {
        &self.shard
    }

    /// Current status; a stream ended by the backend reads as `Closed`
    pub fn status(&self) -> ShardStatus {
        match &self.pump {
            Some(pump) if pump.is_finished() => ShardStatus::Closed,
            _ => self.status,
        }
    }

    /// Check whether an event handler is registered
    pub fn has_handler(&self) -> bool {
        self.handler.borrow().is_some()
    }

    /// Establish the monitoring stream
    ///
    /// Not retried: on failure the connection moves to `Error` and stays
    /// there.
    pub async fn connect(&mut self, client: &dyn ShardClient) -> Result<(), ConnectError> {
        match self.status {
            ShardStatus::Disconnected => {}
            ShardStatus::Ready | ShardStatus::Connecting => return Ok(()),
            ShardStatus::Error | ShardStatus::Closed => {
                return Err(ConnectError::unavailable(
                    self.shard.clone(),
                    "connection already failed or closed",
                ));
            }
        }

        self.status = ShardStatus::Connecting;
        tracing::debug!(shard = %self.shard, "Connecting to shard");

        match tokio::time::timeout(self.connect_timeout, client.monitor(&self.shard)).await {
            Ok(Ok(stream)) => {
                self.stream = Some(stream);
                self.status = ShardStatus::Ready;
                tracing::debug!(shard = %self.shard, "Shard stream ready");
                self.start_pump();
                Ok(())
            }
            Ok(Err(e)) => {
                self.status = ShardStatus::Error;
                tracing::warn!(shard = %self.shard, error = %e, "Shard connect failed");
                Err(e)
            }
            Err(_) => {
                self.status = ShardStatus::Error;
                tracing::warn!(
                    shard = %self.shard,
                    timeout_ms = self.connect_timeout.as_millis() as u64,
                    "Shard connect timed out"
                );
                Err(ConnectError::unavailable(
                    self.shard.clone(),
                    format!("timed out after {:?}", self.connect_timeout),
                ))
            }
        }
    }

    /// Register the event handler, replacing any previous one
    pub fn on_event(&mut self, sender: mpsc::Sender<ShardEvent>) {
        if self.status == ShardStatus::Closed {
            return;
        }
        self.handler.send_replace(Some(sender));
        self.start_pump();
    }

    /// Register the end notification, replacing any previous one
    pub fn on_end(&mut self, notify: oneshot::Sender<ShardId>) {
        if self.status == ShardStatus::Closed {
            return;
        }
        *lock(&self.end_notify) = Some(notify);
    }

    /// Stop the stream. Idempotent.
    ///
    /// Waits at most `disconnect_timeout` for the pump to stop; the pump is
    /// aborted either way.
    pub async fn disconnect(&mut self) {
        if self.status == ShardStatus::Closed {
            return;
        }

        lock(&self.end_notify).take();
        self.handler.send_replace(None);
        self.stream = None;

        if let Some(pump) = self.pump.take() {
            pump.abort();
            if tokio::time::timeout(self.disconnect_timeout, pump)
                .await
                .is_err()
            {
                tracing::warn!(shard = %self.shard, "Shard pump did not stop in time");
            }
        }

        self.status = ShardStatus::Closed;
        tracing::debug!(shard = %self.shard, "Shard disconnected");
    }

    fn start_pump(&mut self) {
        if self.status != ShardStatus::Ready || self.pump.is_some() || !self.has_handler() {
            return;
        }
        let Some(stream) = self.stream.take() else {
            return;
        };

        let shard = self.shard.clone();
        let handler = self.handler.subscribe();
        let end_notify = Arc::clone(&self.end_notify);

        self.pump = Some(tokio::spawn(pump(shard, stream, handler, end_notify)));
    }
}

impl Drop for ShardConnection {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl std::fmt::Debug for ShardConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConnection")
            .field("shard", &self.shard)
            .field("status", &self.status())
            .finish()
    }
}

async fn pump(
    shard: ShardId,
    mut stream: EventStream,
    handler: watch::Receiver<Option<mpsc::Sender<ShardEvent>>>,
    end_notify: EndNotify,
) {
    let mut sequence = 0u64;

    while let Some(data) = stream.next().await {
        let sender = handler.borrow().clone();
        let Some(sender) = sender else {
            // Handler cleared by disconnect()
            return;
        };

        let event = ShardEvent::new(shard.clone(), sequence, data);
        sequence += 1;

        if sender.send(event).await.is_err() {
            tracing::debug!(shard = %shard, "Shard event receiver dropped");
            return;
        }
    }

    tracing::debug!(shard = %shard, events = sequence, "Shard stream ended by backend");
    if let Some(notify) = lock(&end_notify).take() {
        let _ = notify.send(shard);
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
