//! Channel-backed event sink
//!
//! Forwards every delivered event into a bounded mpsc channel. The
//! multiplexer never waits on the consumer: a full channel drops the event.
//! One slot beyond the requested capacity is kept free for the final
//! [`SinkMessage::Disconnected`], so the consumer always learns of the end.

use tokio::sync::mpsc::{self, error::TrySendError};

use crate::error::SinkError;
use crate::event::ShardEvent;
use crate::mux::EventSink;

/// Messages received by the consumer of a [`ChannelSink`]
#[derive(Debug, Clone)]
pub enum SinkMessage {
    /// An event from one of the target's shards
    Event(ShardEvent),

    /// The upstream ended or the multiplexer was cleared
    Disconnected,
}

/// Sink that forwards into a bounded channel
///
/// Clones share one sender; the receiver only sees the channel close once
/// every clone is dropped, so consumers should stop on `Disconnected`.
///
/// # Example
/// ```no_run
/// use std::sync::Arc;
/// use monitor_mux::client::{ChannelSink, SinkMessage};
/// use monitor_mux::mux::Subscription;
///
/// let (sink, mut rx) = ChannelSink::new(256);
/// let subscription = Subscription::new("dashboard", Arc::new(sink));
///
/// tokio::spawn(async move {
///     while let Some(SinkMessage::Event(event)) = rx.recv().await {
///         println!("{}: {:?}", event.shard, event.as_str());
///     }
/// });
/// ```
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<SinkMessage>,
}

impl ChannelSink {
    /// Create a sink and the receiver for its messages
    ///
    /// Up to `capacity` events are queued before the sink reports
    /// backpressure.
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<SinkMessage>) {
        let (tx, rx) = mpsc::channel(capacity.max(1) + 1);
        (Self { tx }, rx)
    }

    /// Wrap an existing sender
    ///
    /// One slot of its channel stays reserved for `Disconnected`.
    pub fn from_sender(tx: mpsc::Sender<SinkMessage>) -> Self {
        Self { tx }
    }
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: &ShardEvent) -> Result<(), SinkError> {
        if self.tx.is_closed() {
            return Err(SinkError::Closed);
        }
        // Last free slot belongs to `Disconnected`
        if self.tx.capacity() <= 1 {
            return Err(SinkError::Backpressure);
        }
        self.tx
            .try_send(SinkMessage::Event(event.clone()))
            .map_err(|e| match e {
                TrySendError::Full(_) => SinkError::Backpressure,
                TrySendError::Closed(_) => SinkError::Closed,
            })
    }

    fn on_disconnect(&self) {
        // Only fails if the receiver is gone or a clone already used the slot
        let _ = self.tx.try_send(SinkMessage::Disconnected);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use bytes::Bytes;
    use tokio_test::assert_ok;

    use super::*;
    use crate::event::{ShardId, TargetId};
    use crate::mux::{StreamMultiplexer, Subscription};
    use crate::registry::RegistryConfig;
    use crate::shard::ShardClient;
    use crate::testing::ScriptedClient;

    fn event(line: &'static str) -> ShardEvent {
        ShardEvent::new(ShardId::new("n1"), 0, Bytes::from_static(line.as_bytes()))
    }

    #[test]
    fn test_full_channel_is_backpressure() {
        let (sink, _rx) = ChannelSink::new(1);

        assert!(sink.deliver(&event("a")).is_ok());
        assert_eq!(sink.deliver(&event("b")), Err(SinkError::Backpressure));
    }

    #[tokio::test]
    async fn test_disconnect_delivered_when_full() {
        let (sink, mut rx) = ChannelSink::new(2);

        assert!(sink.deliver(&event("a")).is_ok());
        assert!(sink.deliver(&event("b")).is_ok());
        assert_eq!(sink.deliver(&event("c")), Err(SinkError::Backpressure));
        sink.on_disconnect();

        for expected in ["a", "b"] {
            match rx.recv().await {
                Some(SinkMessage::Event(event)) => assert_eq!(event.as_str(), Some(expected)),
                other => panic!("unexpected message: {other:?}"),
            }
        }
        assert!(matches!(rx.recv().await, Some(SinkMessage::Disconnected)));
    }

    #[test]
    fn test_dropped_receiver_is_closed() {
        let (sink, rx) = ChannelSink::new(4);
        drop(rx);

        assert_eq!(sink.deliver(&event("a")), Err(SinkError::Closed));
    }

    #[tokio::test]
    async fn test_receives_events_then_disconnect() {
        let scripted = ScriptedClient::new();
        let client: Arc<dyn ShardClient> = scripted.clone();
        let mux = StreamMultiplexer::spawn(TargetId::new("T"), client, &RegistryConfig::default());

        let (sink, mut rx) = ChannelSink::new(16);
        assert_ok!(mux.subscribe(Subscription::new("s1", Arc::new(sink))).await);

        scripted.emit("T", "1339518083.107412 [0 127.0.0.1:60866] \"ping\"").await;
        let message = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match message {
            SinkMessage::Event(event) => {
                let record = event.monitor_record().unwrap();
                assert_eq!(record.command().as_deref(), Some("PING"));
            }
            other => panic!("unexpected message: {other:?}"),
        }

        mux.clear().await;
        assert!(matches!(rx.recv().await, Some(SinkMessage::Disconnected)));
        assert!(rx.recv().await.is_none());
    }
}
