//! Batched subscriber client
//!
//! Buffers delivered events in a [`BoundedEventBuffer`] and hands them to
//! the consumer in batches, once per flush interval. A slow consumer never
//! slows the multiplexer down: the buffer evicts its oldest events instead
//! and each batch reports how many were lost.
//!
//! ```text
//!   multiplexer ──deliver()──► buffer (capacity N, oldest evicted)
//!                                 │ every flush_interval
//!                                 ▼
//!                        ClientEvent::Batch { events, dropped } ──► consumer
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::time::MissedTickBehavior;

use crate::buffer::BoundedEventBuffer;
use crate::error::SinkError;
use crate::event::ShardEvent;
use crate::mux::{EventSink, SubscriberId, Subscription};
use crate::registry::RegistryConfig;

/// Events received by the consumer of a [`BatchedClient`]
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// Events buffered since the previous batch, oldest first
    Batch {
        events: Vec<ShardEvent>,
        /// Events evicted from the buffer before they could be sent
        dropped: u64,
    },

    /// The upstream ended; no batch follows
    Disconnected,
}

struct Shared {
    buffer: Mutex<BoundedEventBuffer<ShardEvent>>,
    tx: mpsc::Sender<ClientEvent>,
    notify: Arc<Notify>,
    disconnected: AtomicBool,
}

/// Subscriber that delivers events to its consumer in batches
///
/// Cloning yields another handle to the same buffer.
///
/// # Example
/// ```no_run
/// use monitor_mux::client::{BatchedClient, ClientEvent};
/// use monitor_mux::registry::RegistryConfig;
///
/// # async fn example() {
/// let (client, mut events) = BatchedClient::new("profiler-1", &RegistryConfig::default());
/// let subscription = client.subscription();
/// // registry.subscribe(&target, &backend, subscription).await?;
///
/// while let Some(event) = events.recv().await {
///     match event {
///         ClientEvent::Batch { events, dropped } => {
///             println!("{} events, {} dropped", events.len(), dropped);
///         }
///         ClientEvent::Disconnected => break,
///     }
/// }
/// # }
/// ```
#[derive(Clone)]
pub struct BatchedClient {
    id: SubscriberId,
    shared: Arc<Shared>,
}

impl BatchedClient {
    /// Create a client and the receiver for its batches
    ///
    /// Spawns the flush task, so this must be called inside a tokio runtime.
    pub fn new(
        id: impl Into<SubscriberId>,
        config: &RegistryConfig,
    ) -> (Self, mpsc::Receiver<ClientEvent>) {
        let (tx, rx) = mpsc::channel(config.client_queue_capacity.max(1));
        let notify = Arc::new(Notify::new());

        let shared = Arc::new(Shared {
            buffer: Mutex::new(BoundedEventBuffer::with_capacity(config.buffer_capacity)),
            tx,
            notify: Arc::clone(&notify),
            disconnected: AtomicBool::new(false),
        });

        tokio::spawn(flush_loop(
            Arc::downgrade(&shared),
            notify,
            config.flush_interval,
        ));

        let client = Self {
            id: id.into(),
            shared,
        };
        (client, rx)
    }

    /// Subscriber id
    pub fn id(&self) -> &SubscriberId {
        &self.id
    }

    /// Registration for a multiplexer, delivering into this client
    pub fn subscription(&self) -> Subscription {
        Subscription::new(self.id.clone(), Arc::new(self.clone()))
    }

    /// Events waiting for the next flush
    pub fn pending(&self) -> usize {
        lock(&self.shared.buffer).len()
    }

    /// Events evicted since the last batch
    pub fn dropped(&self) -> u64 {
        lock(&self.shared.buffer).evicted()
    }

    /// Check whether the upstream has ended
    pub fn is_disconnected(&self) -> bool {
        self.shared.disconnected.load(Ordering::Acquire)
    }
}

impl EventSink for BatchedClient {
    fn deliver(&self, event: &ShardEvent) -> Result<(), SinkError> {
        if self.shared.tx.is_closed() || self.is_disconnected() {
            return Err(SinkError::Closed);
        }
        lock(&self.shared.buffer).push(event.clone());
        Ok(())
    }

    fn on_disconnect(&self) {
        self.shared.disconnected.store(true, Ordering::Release);
        self.shared.notify.notify_one();
    }
}

impl std::fmt::Debug for BatchedClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchedClient")
            .field("id", &self.id)
            .field("pending", &self.pending())
            .field("disconnected", &self.is_disconnected())
            .finish()
    }
}

async fn flush_loop(shared: Weak<Shared>, notify: Arc<Notify>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = notify.notified() => {}
        }

        // Every handle dropped: nothing left to flush to
        let Some(shared) = shared.upgrade() else {
            break;
        };

        let (events, dropped) = {
            let mut buffer = lock(&shared.buffer);
            (buffer.drain(), buffer.take_evicted())
        };

        if !events.is_empty() || dropped > 0 {
            if dropped > 0 {
                tracing::debug!(dropped = dropped, "Client buffer overflowed");
            }
            if shared.tx.send(ClientEvent::Batch { events, dropped }).await.is_err() {
                tracing::trace!("Client consumer dropped");
                break;
            }
        }

        if shared.disconnected.load(Ordering::Acquire) {
            let _ = shared.tx.send(ClientEvent::Disconnected).await;
            break;
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use tokio_test::assert_ok;

    use super::*;
    use crate::event::{ShardId, TargetId};
    use crate::mux::MultiplexerStatus;
    use crate::registry::MultiplexerRegistry;
    use crate::shard::ShardClient;
    use crate::testing::ScriptedClient;

    fn event(sequence: u64) -> ShardEvent {
        ShardEvent::new(
            ShardId::new("n1"),
            sequence,
            Bytes::from(format!("event {sequence}")),
        )
    }

    async fn next(rx: &mut mpsc::Receiver<ClientEvent>) -> ClientEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("no client event within 2s")
            .expect("client channel closed")
    }

    #[tokio::test]
    async fn test_flushes_in_batches() {
        let config = RegistryConfig::default().flush_interval(Duration::from_millis(20));
        let (client, mut rx) = BatchedClient::new("s1", &config);

        for i in 0..3 {
            assert_ok!(client.deliver(&event(i)));
        }

        match next(&mut rx).await {
            ClientEvent::Batch { events, dropped } => {
                let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
                assert_eq!(sequences, vec![0, 1, 2]);
                assert_eq!(dropped, 0);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert_eq!(client.pending(), 0);
    }

    #[tokio::test]
    async fn test_overflow_reports_dropped_and_flushes_on_disconnect() {
        let config = RegistryConfig::default()
            .buffer_capacity(2)
            .flush_interval(Duration::from_secs(60));
        let (client, mut rx) = BatchedClient::new("s1", &config);

        // Let the immediate first tick pass
        tokio::time::sleep(Duration::from_millis(20)).await;

        for i in 0..5 {
            assert_ok!(client.deliver(&event(i)));
        }
        assert_eq!(client.pending(), 2);
        assert_eq!(client.dropped(), 3);

        client.on_disconnect();

        match next(&mut rx).await {
            ClientEvent::Batch { events, dropped } => {
                let sequences: Vec<u64> = events.iter().map(|e| e.sequence).collect();
                assert_eq!(sequences, vec![3, 4]);
                assert_eq!(dropped, 3);
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(matches!(next(&mut rx).await, ClientEvent::Disconnected));
        assert_eq!(client.deliver(&event(5)), Err(SinkError::Closed));
    }

    #[tokio::test]
    async fn test_dropped_consumer_closes_sink() {
        let (client, rx) = BatchedClient::new("s1", &RegistryConfig::default());
        drop(rx);

        assert_eq!(client.deliver(&event(0)), Err(SinkError::Closed));
    }

    #[tokio::test]
    async fn test_receives_shard_events_through_registry() {
        let registry = MultiplexerRegistry::with_config(
            RegistryConfig::default().flush_interval(Duration::from_millis(10)),
        );
        let scripted = ScriptedClient::with_topology("clusterA", &["n1", "n2"]);
        let backend: Arc<dyn ShardClient> = scripted.clone();
        let target = TargetId::new("clusterA");

        let (client, mut rx) = BatchedClient::new("s1", registry.config());
        let mux = assert_ok!(registry.subscribe(&target, &backend, client.subscription()).await);
        let mut status = mux.status_watch();

        scripted.emit("n1", "a").await;
        scripted.emit("n2", "b").await;

        let mut received = Vec::new();
        while received.len() < 2 {
            match next(&mut rx).await {
                ClientEvent::Batch { events, .. } => received.extend(events),
                ClientEvent::Disconnected => panic!("disconnected early"),
            }
        }
        let mut shards: Vec<&str> = received.iter().map(|e| e.shard.as_str()).collect();
        shards.sort();
        assert_eq!(shards, vec!["n1", "n2"]);

        // Backend closing one shard ends the whole target
        scripted.end_shard("n2");
        assert!(matches!(next(&mut rx).await, ClientEvent::Disconnected));
        assert!(client.is_disconnected());

        let ended = tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|status| *status == MultiplexerStatus::End),
        )
        .await
        .is_ok();
        assert!(ended);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!registry.contains(&target).await);
    }
}
