//! Test doubles: a scriptable shard backend and recording sinks

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::error::{ConnectError, SinkError};
use crate::event::{ShardEvent, ShardId, TargetId};
use crate::mux::EventSink;
use crate::shard::{EventStream, ShardClient};

#[derive(Default)]
struct ShardScript {
    failure: Option<String>,
    stall: bool,
    delay: Option<Duration>,
    calls: usize,
    sender: Option<mpsc::Sender<Bytes>>,
}

#[derive(Default)]
struct ClientState {
    topologies: HashMap<TargetId, Result<Vec<ShardId>, String>>,
    shards: HashMap<ShardId, ShardScript>,
}

/// Backend whose shards are driven by the test
#[derive(Default)]
pub(crate) struct ScriptedClient {
    state: Mutex<ClientState>,
}

impl ScriptedClient {
    /// Every target resolves to a single shard named after it
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_topology(target: &str, shards: &[&str]) -> Arc<Self> {
        let client = Self::new();
        client.set_topology(target, shards);
        client
    }

    pub fn set_topology(&self, target: &str, shards: &[&str]) {
        let shards = shards.iter().map(|shard| ShardId::new(*shard)).collect();
        self.state
            .lock()
            .unwrap()
            .topologies
            .insert(TargetId::new(target), Ok(shards));
    }

    pub fn fail_topology(&self, target: &str, reason: &str) {
        self.state
            .lock()
            .unwrap()
            .topologies
            .insert(TargetId::new(target), Err(reason.to_string()));
    }

    pub fn fail_shard(&self, shard: &str, reason: &str) {
        self.script(shard, |script| script.failure = Some(reason.to_string()));
    }

    /// `monitor()` never completes
    pub fn stall_shard(&self, shard: &str) {
        self.script(shard, |script| script.stall = true);
    }

    pub fn delay_shard(&self, shard: &str, delay: Duration) {
        self.script(shard, |script| script.delay = Some(delay));
    }

    /// Close the shard stream from the backend side
    pub fn end_shard(&self, shard: &str) {
        self.script(shard, |script| script.sender = None);
    }

    pub fn monitor_calls(&self, shard: &str) -> usize {
        let state = self.state.lock().unwrap();
        state
            .shards
            .get(&ShardId::new(shard))
            .map_or(0, |script| script.calls)
    }

    pub fn total_monitor_calls(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.shards.values().map(|script| script.calls).sum()
    }

    /// True while the consumer side of the shard stream is alive
    pub fn is_open(&self, shard: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .shards
            .get(&ShardId::new(shard))
            .and_then(|script| script.sender.as_ref())
            .map_or(false, |sender| !sender.is_closed())
    }

    pub async fn emit(&self, shard: &str, line: &str) {
        self.emit_checked(shard, line).await;
    }

    /// Emit a line; false if the stream is closed
    pub async fn emit_checked(&self, shard: &str, line: &str) -> bool {
        let sender = {
            let state = self.state.lock().unwrap();
            state
                .shards
                .get(&ShardId::new(shard))
                .and_then(|script| script.sender.clone())
        };
        match sender {
            Some(sender) => sender.send(Bytes::from(line.to_string())).await.is_ok(),
            None => false,
        }
    }

    fn script(&self, shard: &str, f: impl FnOnce(&mut ShardScript)) {
        let mut state = self.state.lock().unwrap();
        f(state.shards.entry(ShardId::new(shard)).or_default());
    }
}

#[async_trait]
impl ShardClient for ScriptedClient {
    async fn shards(&self, target: &TargetId) -> Result<Vec<ShardId>, ConnectError> {
        let state = self.state.lock().unwrap();
        match state.topologies.get(target) {
            Some(Ok(shards)) => Ok(shards.clone()),
            Some(Err(reason)) => Err(ConnectError::Topology {
                target: target.clone(),
                reason: reason.clone(),
            }),
            None => Ok(vec![ShardId::new(target.as_str())]),
        }
    }

    async fn monitor(&self, shard: &ShardId) -> Result<EventStream, ConnectError> {
        let (failure, stall, delay) = {
            let mut state = self.state.lock().unwrap();
            let script = state.shards.entry(shard.clone()).or_default();
            script.calls += 1;
            (script.failure.clone(), script.stall, script.delay)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if stall {
            futures::future::pending::<()>().await;
        }
        if let Some(reason) = failure {
            return Err(ConnectError::unavailable(shard.clone(), reason));
        }

        let (tx, rx) = mpsc::channel(1024);
        self.state
            .lock()
            .unwrap()
            .shards
            .entry(shard.clone())
            .or_default()
            .sender = Some(tx);

        Ok(futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|data| (data, rx))
        })
        .boxed())
    }
}

/// Sink that records everything it receives
#[derive(Default)]
pub(crate) struct RecordingSink {
    events: Mutex<Vec<ShardEvent>>,
    disconnected: AtomicBool,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ShardEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn disconnected(&self) -> bool {
        self.disconnected.load(Ordering::SeqCst)
    }

    /// Wait until at least `count` events arrived; panics after 2s
    pub async fn wait_for(&self, count: usize) {
        let reached = tokio::time::timeout(Duration::from_secs(2), async {
            while self.len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "expected {count} events, got {}", self.len());
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: &ShardEvent) -> Result<(), SinkError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    fn on_disconnect(&self) {
        self.disconnected.store(true, Ordering::SeqCst);
    }
}

/// Sink whose consumer is gone
pub(crate) struct ClosedSink;

impl EventSink for ClosedSink {
    fn deliver(&self, _event: &ShardEvent) -> Result<(), SinkError> {
        Err(SinkError::Closed)
    }
}

/// Sink that is always full
pub(crate) struct FullSink;

impl EventSink for FullSink {
    fn deliver(&self, _event: &ShardEvent) -> Result<(), SinkError> {
        Err(SinkError::Backpressure)
    }
}

/// Sink that panics on every call
pub(crate) struct PanickingSink;

impl EventSink for PanickingSink {
    fn deliver(&self, _event: &ShardEvent) -> Result<(), SinkError> {
        panic!("sink exploded");
    }

    fn on_disconnect(&self) {
        panic!("sink exploded on disconnect");
    }
}
