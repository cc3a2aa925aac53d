//! Monitor fan-out demo - Several profiler clients sharing one simulated cluster
//!
//! Run with: cargo run --example monitor_fanout
//!
//! This example demonstrates:
//! - Implementing `ShardClient` for a backend (here a fake three-node cluster)
//! - Two `BatchedClient`s and a `ChannelSink` sharing the same shard streams
//! - Parsing MONITOR lines with `MonitorRecord`
//! - Teardown once the last subscriber leaves
//!
//! ```text
//!   node-1 ─┐                         ┌──► profiler-a (batched)
//!   node-2 ─┼──► StreamMultiplexer ───┼──► profiler-b (batched)
//!   node-3 ─┘                         └──► tail (channel)
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;

use monitor_mux::client::{BatchedClient, ChannelSink, ClientEvent, SinkMessage};
use monitor_mux::error::ConnectError;
use monitor_mux::event::{ShardId, TargetId};
use monitor_mux::mux::Subscription;
use monitor_mux::registry::{MultiplexerRegistry, RegistryConfig};
use monitor_mux::shard::{EventStream, ShardClient};

const COMMANDS: [&str; 5] = [
    "\"GET\" \"user:1\"",
    "\"SET\" \"user:1\" \"alice\"",
    "\"INCR\" \"hits\"",
    "\"HGETALL\" \"session:42\"",
    "\"EXPIRE\" \"session:42\" \"60\"",
];

/// Fake cluster emitting a MONITOR line every few milliseconds per node
struct SimulatedCluster {
    nodes: Vec<ShardId>,
    tick: Duration,
    opened: AtomicU64,
}

impl SimulatedCluster {
    fn new(nodes: usize, tick: Duration) -> Self {
        Self {
            nodes: (1..=nodes)
                .map(|i| ShardId::node(format!("10.0.0.{i}"), 6379))
                .collect(),
            tick,
            opened: AtomicU64::new(0),
        }
    }
}

#[async_trait]
impl ShardClient for SimulatedCluster {
    async fn shards(&self, _target: &TargetId) -> Result<Vec<ShardId>, ConnectError> {
        Ok(self.nodes.clone())
    }

    async fn monitor(&self, shard: &ShardId) -> Result<EventStream, ConnectError> {
        self.opened.fetch_add(1, Ordering::Relaxed);
        tracing::info!(shard = %shard, "MONITOR issued");

        let source = shard.to_string();
        let interval = tokio::time::interval(self.tick);
        let stream = futures::stream::unfold((interval, 0usize), move |(mut interval, n)| {
            let source = source.clone();
            async move {
                interval.tick().await;
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs_f64();
                let line = format!(
                    "{now:.6} [0 {source}] {}",
                    COMMANDS[n % COMMANDS.len()]
                );
                Some((Bytes::from(line), (interval, n + 1)))
            }
        });

        Ok(stream.boxed())
    }
}

async fn run_profiler(name: &'static str, mut batches: tokio::sync::mpsc::Receiver<ClientEvent>) {
    let mut total = 0usize;
    while let Some(event) = batches.recv().await {
        match event {
            ClientEvent::Batch { events, dropped } => {
                total += events.len();
                let commands: Vec<String> = events
                    .iter()
                    .filter_map(|e| e.monitor_record().ok())
                    .filter_map(|record| record.command())
                    .collect();
                println!(
                    "[{name}] batch of {} ({} dropped): {}",
                    events.len(),
                    dropped,
                    commands.join(" ")
                );
            }
            ClientEvent::Disconnected => {
                println!("[{name}] upstream disconnected");
                break;
            }
        }
    }
    println!("[{name}] received {total} events");
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("monitor_mux=debug".parse()?)
                .add_directive("monitor_fanout=info".parse()?),
        )
        .init();

    let config = RegistryConfig::default()
        .buffer_capacity(50)
        .flush_interval(Duration::from_millis(250));
    let registry = MultiplexerRegistry::try_with_config(config)?;

    let cluster = Arc::new(SimulatedCluster::new(3, Duration::from_millis(40)));
    let backend: Arc<dyn ShardClient> = cluster.clone();
    let target = TargetId::new("cache-cluster");

    let (profiler_a, batches_a) = BatchedClient::new("profiler-a", registry.config());
    let (profiler_b, batches_b) = BatchedClient::new("profiler-b", registry.config());
    let a = tokio::spawn(run_profiler("profiler-a", batches_a));
    let b = tokio::spawn(run_profiler("profiler-b", batches_b));

    registry.subscribe(&target, &backend, profiler_a.subscription()).await?;
    registry.subscribe(&target, &backend, profiler_b.subscription()).await?;

    // A third subscriber only interested in the first node
    let (tail, mut tail_rx) = ChannelSink::new(64);
    let first_node = ShardId::node("10.0.0.1", 6379);
    let subscription = Subscription::new("tail", Arc::new(tail)).with_shard_filter([first_node]);
    registry.subscribe(&target, &backend, subscription).await?;

    let tail_task = tokio::spawn(async move {
        let mut seen = 0;
        while let Some(message) = tail_rx.recv().await {
            match message {
                SinkMessage::Event(event) if seen < 3 => {
                    seen += 1;
                    println!("[tail] {}", event.as_str().unwrap_or("<binary>"));
                }
                SinkMessage::Event(_) => {}
                SinkMessage::Disconnected => break,
            }
        }
    });

    println!(
        "{} shard streams opened for 3 subscribers",
        cluster.opened.load(Ordering::Relaxed)
    );

    tokio::time::sleep(Duration::from_secs(1)).await;

    if let Some(stats) = registry.stats(&target).await {
        println!(
            "{}: {} shards, {} subscribers, {} events received, {:.1} events/s",
            stats.target,
            stats.shard_count(),
            stats.subscriber_count,
            stats.counters.events_received,
            stats.event_rate()
        );
    }

    // Forced teardown notifies every subscriber
    registry.clear(&target).await;

    let _ = tokio::join!(a, b, tail_task);
    println!("registry empty: {}", registry.is_empty().await);

    Ok(())
}
