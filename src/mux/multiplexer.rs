//! Stream multiplexer
//!
//! One task per target owns the shard connections and the subscriber
//! registry. Every mutation goes through that task, so subscribe,
//! unsubscribe, teardown and shard events are serialized without locks:
//!
//! ```text
//!   StreamMultiplexer (handle, Clone)
//!        │ Command (mpsc mailbox)
//!        ▼
//!   ┌───────────────────────────┐      ShardEvent     ┌──────────────┐
//!   │ MultiplexerTask           │◄────────────────────│ shard pump 1 │
//!   │   shards: Vec<Connection> │◄────────────────────│ shard pump 2 │
//!   │   subscribers             │      end notify     └──────────────┘
//!   └─────────────┬─────────────┘
//!                 │ deliver() in registration order
//!        ┌────────┼────────┐
//!        ▼        ▼        ▼
//!      sink     sink     sink
//! ```
//!
//! Since commands and events are handled by the same task, once
//! `unsubscribe` or `clear` returns the removed sinks get nothing more.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use futures::future::{join_all, BoxFuture};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot, watch};

use crate::error::{ConnectError, Error, MultiplexError, Result};
use crate::event::{ShardEvent, ShardId, TargetId};
use crate::registry::RegistryConfig;
use crate::shard::{ShardClient, ShardConnection};
use crate::stats::{FanOutCounters, MultiplexerStats, ShardStats};

use super::state::MultiplexerStatus;
use super::subscriber::{Delivery, SubscriberId, SubscriberRegistry, Subscription};

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Called once when a multiplexer reaches `End` or `Error`
pub(crate) type EndHook = Box<dyn FnOnce(TargetId, u64) -> BoxFuture<'static, ()> + Send>;

enum Command {
    Subscribe {
        subscription: Subscription,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        id: SubscriberId,
        reply: oneshot::Sender<()>,
    },
    Clear {
        reply: oneshot::Sender<()>,
    },
    Stats {
        reply: oneshot::Sender<MultiplexerStats>,
    },
}

/// Handle to the multiplexer of one target
#[derive(Clone)]
pub struct StreamMultiplexer {
    target: TargetId,
    instance_id: u64,
    commands: mpsc::Sender<Command>,
    status: watch::Receiver<MultiplexerStatus>,
    subscriber_count: Arc<AtomicUsize>,
}

impl StreamMultiplexer {
    /// Spawn a multiplexer for `target` in the `Wait` state
    ///
    /// Nothing is connected until the first subscribe.
    pub fn spawn(target: TargetId, client: Arc<dyn ShardClient>, config: &RegistryConfig) -> Self {
        Self::spawn_with_hook(target, client, config, None)
    }

    pub(crate) fn spawn_with_hook(
        target: TargetId,
        client: Arc<dyn ShardClient>,
        config: &RegistryConfig,
        end_hook: Option<EndHook>,
    ) -> Self {
        let instance_id = NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed);
        let (commands_tx, commands_rx) = mpsc::channel(config.mailbox_capacity.max(1));
        let (events_tx, events_rx) = mpsc::channel(config.shard_queue_capacity.max(1));
        let (status_tx, status_rx) = watch::channel(MultiplexerStatus::Wait);
        let subscriber_count = Arc::new(AtomicUsize::new(0));

        let task = MultiplexerTask {
            target: target.clone(),
            instance_id,
            client,
            config: config.clone(),
            status: status_tx,
            subscribers: SubscriberRegistry::new(),
            subscriber_count: Arc::clone(&subscriber_count),
            shards: Vec::new(),
            events_tx,
            events_rx,
            ends: FuturesUnordered::new(),
            counters: FanOutCounters::new(),
            created_at: Instant::now(),
            end_hook,
        };
        tokio::spawn(task.run(commands_rx));

        tracing::debug!(target_id = %target, instance = instance_id, "Multiplexer spawned");

        Self {
            target,
            instance_id,
            commands: commands_tx,
            status: status_rx,
            subscriber_count,
        }
    }

    /// Target this multiplexer serves
    pub fn target(&self) -> &TargetId {
        &self.target
    }

    /// Unique id of this instance
    pub fn instance_id(&self) -> u64 {
        self.instance_id
    }

    /// Current status
    pub fn status(&self) -> MultiplexerStatus {
        *self.status.borrow()
    }

    /// Receiver observing status transitions
    pub fn status_watch(&self) -> watch::Receiver<MultiplexerStatus> {
        self.status.clone()
    }

    /// Number of registered subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscriber_count.load(Ordering::Acquire)
    }

    /// Register a subscriber, connecting the shards on first use
    ///
    /// Setup is all-or-nothing: if any shard fails, the ones already
    /// connected are disconnected, the multiplexer moves to `Error`, and
    /// the shard's [`ConnectError`] is returned. Registering an id twice is
    /// a no-op. Fails with [`MultiplexError::Unavailable`] in `Error`/`End`.
    pub async fn subscribe(&self, subscription: Subscription) -> Result<()> {
        if self.status().is_terminal() {
            return Err(self.unavailable());
        }

        let (reply, rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Subscribe {
                subscription,
                reply,
            })
            .await
            .is_err()
        {
            return Err(self.unavailable());
        }

        rx.await.unwrap_or_else(|_| Err(self.unavailable()))
    }

    /// Remove a subscriber. Idempotent.
    ///
    /// Removing the last subscriber disconnects every shard and ends the
    /// multiplexer before this returns. A multiplexer still in `Wait`, with
    /// no subscriber at all, ends as well.
    pub async fn unsubscribe(&self, id: &SubscriberId) {
        let (reply, rx) = oneshot::channel();
        let command = Command::Unsubscribe {
            id: id.clone(),
            reply,
        };
        if self.commands.send(command).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Disconnect every shard and drop every subscriber
    pub async fn clear(&self) {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Clear { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }

    /// Statistics snapshot, or `None` once the multiplexer has stopped
    pub async fn stats(&self) -> Option<MultiplexerStats> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Stats { reply }).await.ok()?;
        rx.await.ok()
    }

    fn unavailable(&self) -> Error {
        MultiplexError::Unavailable {
            target: self.target.clone(),
            status: self.status(),
        }
        .into()
    }
}

impl std::fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("target", &self.target)
            .field("instance_id", &self.instance_id)
            .field("status", &self.status())
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

struct MultiplexerTask {
    target: TargetId,
    instance_id: u64,
    client: Arc<dyn ShardClient>,
    config: RegistryConfig,
    status: watch::Sender<MultiplexerStatus>,
    subscribers: SubscriberRegistry,
    subscriber_count: Arc<AtomicUsize>,
    shards: Vec<ShardConnection>,
    events_tx: mpsc::Sender<ShardEvent>,
    events_rx: mpsc::Receiver<ShardEvent>,
    ends: FuturesUnordered<oneshot::Receiver<ShardId>>,
    counters: FanOutCounters,
    created_at: Instant,
    end_hook: Option<EndHook>,
}

impl MultiplexerTask {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        loop {
            tokio::select! {
                biased;

                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!(target_id = %self.target, "All multiplexer handles dropped");
                        if !self.current_status().is_terminal() {
                            self.teardown(true).await;
                        }
                    }
                },

                Some(event) = self.events_rx.recv(),
                    if self.current_status() == MultiplexerStatus::Ready =>
                {
                    self.fan_out(event).await;
                }

                Some(ended) = self.ends.next(), if !self.ends.is_empty() => {
                    if let Ok(shard) = ended {
                        self.on_shard_end(shard).await;
                    }
                }
            }

            if self.current_status().is_terminal() {
                break;
            }
        }

        tracing::trace!(target_id = %self.target, instance = self.instance_id, "Multiplexer task exited");
    }

    fn current_status(&self) -> MultiplexerStatus {
        *self.status.borrow()
    }

    fn set_status(&self, next: MultiplexerStatus) {
        let current = self.current_status();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            tracing::warn!(
                target_id = %self.target,
                from = %current,
                to = %next,
                "Unexpected multiplexer transition"
            );
        }
        self.status.send_replace(next);
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Subscribe {
                subscription,
                reply,
            } => {
                let result = self.subscribe(subscription).await;
                let _ = reply.send(result);
            }
            Command::Unsubscribe { id, reply } => {
                self.remove_subscriber(&id).await;
                let _ = reply.send(());
            }
            Command::Clear { reply } => {
                if !self.current_status().is_terminal() {
                    self.teardown(true).await;
                }
                let _ = reply.send(());
            }
            Command::Stats { reply } => {
                let _ = reply.send(self.stats());
            }
        }
    }

    async fn subscribe(&mut self, subscription: Subscription) -> Result<()> {
        match self.current_status() {
            MultiplexerStatus::Wait => self.connect_all().await?,
            MultiplexerStatus::Ready => {}
            status => {
                return Err(MultiplexError::Unavailable {
                    target: self.target.clone(),
                    status,
                }
                .into());
            }
        }

        let id = subscription.id.clone();
        if self.subscribers.add(subscription) {
            self.subscriber_count
                .store(self.subscribers.len(), Ordering::Release);
            tracing::info!(
                target_id = %self.target,
                subscriber = %id,
                subscribers = self.subscribers.len(),
                "Subscriber added"
            );
        } else {
            tracing::debug!(target_id = %self.target, subscriber = %id, "Subscriber already registered");
        }

        Ok(())
    }

    /// Connect every shard concurrently; all-or-nothing
    async fn connect_all(&mut self) -> Result<()> {
        self.set_status(MultiplexerStatus::Connecting);
        tracing::info!(target_id = %self.target, instance = self.instance_id, "Connecting multiplexer");

        let shards = match self.client.shards(&self.target).await {
            Ok(shards) if !shards.is_empty() => shards,
            Ok(_) => {
                let err = ConnectError::Topology {
                    target: self.target.clone(),
                    reason: "target has no shards".into(),
                };
                return Err(self.fail_setup(err, Vec::new()).await);
            }
            Err(e) => return Err(self.fail_setup(e, Vec::new()).await),
        };

        let mut connections: Vec<ShardConnection> = shards
            .into_iter()
            .map(|shard| {
                ShardConnection::new(
                    shard,
                    self.config.connect_timeout,
                    self.config.disconnect_timeout,
                )
            })
            .collect();

        let client = Arc::clone(&self.client);
        let results = join_all(
            connections
                .iter_mut()
                .map(|connection| connection.connect(client.as_ref())),
        )
        .await;

        if let Some(err) = results.into_iter().find_map(|result| result.err()) {
            return Err(self.fail_setup(err, connections).await);
        }

        for connection in &mut connections {
            // End notification goes first so an early end isn't missed
            let (end_tx, end_rx) = oneshot::channel();
            connection.on_end(end_tx);
            connection.on_event(self.events_tx.clone());
            self.ends.push(end_rx);
        }

        self.shards = connections;
        self.set_status(MultiplexerStatus::Ready);
        tracing::info!(
            target_id = %self.target,
            instance = self.instance_id,
            shards = self.shards.len(),
            "Multiplexer ready"
        );

        Ok(())
    }

    async fn fail_setup(
        &mut self,
        err: ConnectError,
        mut connections: Vec<ShardConnection>,
    ) -> Error {
        join_all(connections.iter_mut().map(|connection| connection.disconnect())).await;

        self.set_status(MultiplexerStatus::Error);
        tracing::warn!(
            target_id = %self.target,
            instance = self.instance_id,
            error = %err,
            "Multiplexer setup failed"
        );
        self.run_end_hook().await;

        err.into()
    }

    async fn fan_out(&mut self, event: ShardEvent) {
        self.counters.record_received(&event.shard);

        let mut failed = Vec::new();
        for subscription in self.subscribers.snapshot() {
            match subscription.deliver(&event) {
                Delivery::Delivered => self.counters.events_delivered += 1,
                Delivery::Filtered => {}
                Delivery::Dropped => {
                    self.counters.events_dropped += 1;
                    tracing::trace!(
                        target_id = %self.target,
                        subscriber = %subscription.id,
                        shard = %event.shard,
                        "Sink full, event dropped"
                    );
                }
                Delivery::Failed => failed.push(subscription.id),
            }
        }

        for id in failed {
            self.counters.sink_failures += 1;
            tracing::warn!(target_id = %self.target, subscriber = %id, "Sink failed, removing subscriber");
            self.remove_subscriber(&id).await;
        }
    }

    async fn remove_subscriber(&mut self, id: &SubscriberId) {
        if !self.subscribers.contains(id) {
            // A multiplexer nobody ever subscribed to has nothing to keep it
            if self.subscribers.is_empty() && self.current_status() == MultiplexerStatus::Wait {
                self.teardown(false).await;
            }
            return;
        }

        let now_empty = self.subscribers.remove(id);
        self.subscriber_count
            .store(self.subscribers.len(), Ordering::Release);
        tracing::debug!(
            target_id = %self.target,
            subscriber = %id,
            subscribers = self.subscribers.len(),
            "Subscriber removed"
        );

        if now_empty {
            self.teardown(false).await;
        }
    }

    async fn on_shard_end(&mut self, shard: ShardId) {
        if self.current_status() != MultiplexerStatus::Ready {
            return;
        }

        tracing::info!(target_id = %self.target, shard = %shard, "Shard stream ended");
        self.teardown(true).await;
    }

    /// Disconnect every shard, drop every subscriber, move to `End`
    async fn teardown(&mut self, notify: bool) {
        join_all(self.shards.iter_mut().map(|connection| connection.disconnect())).await;
        let shard_count = self.shards.len();
        self.shards.clear();
        self.ends.clear();

        let subscribers = self.subscribers.drain();
        self.subscriber_count.store(0, Ordering::Release);
        if notify {
            for subscription in &subscribers {
                subscription.notify_disconnect();
            }
        }

        self.set_status(MultiplexerStatus::End);
        tracing::info!(
            target_id = %self.target,
            instance = self.instance_id,
            shards = shard_count,
            notified = if notify { subscribers.len() } else { 0 },
            "Multiplexer ended"
        );

        self.run_end_hook().await;
    }

    async fn run_end_hook(&mut self) {
        if let Some(hook) = self.end_hook.take() {
            hook(self.target.clone(), self.instance_id).await;
        }
    }

    fn stats(&self) -> MultiplexerStats {
        MultiplexerStats {
            target: self.target.clone(),
            instance_id: self.instance_id,
            status: self.current_status(),
            subscriber_count: self.subscribers.len(),
            shards: self
                .shards
                .iter()
                .map(|connection| ShardStats {
                    shard: connection.shard().clone(),
                    status: connection.status(),
                    events: self.counters.shard_events(connection.shard()),
                })
                .collect(),
            counters: self.counters.clone(),
            created_at: self.created_at,
        }
    }
}
