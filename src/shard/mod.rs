//! Upstream shard connections
//!
//! The backend itself (the Redis client, cluster node discovery) lives
//! behind [`ShardClient`]. This module only consumes what it returns: a
//! list of shards for a target, and one lazy event stream per shard.

pub mod connection;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

use crate::error::ConnectError;
use crate::event::{ShardId, TargetId};

pub use connection::{ShardConnection, ShardStatus};

/// Live event stream of one shard; ends when the backend closes it.
/// Dropping the stream closes the underlying monitoring connection.
pub type EventStream = BoxStream<'static, Bytes>;

/// Backend collaborator that resolves topologies and opens monitor streams
#[async_trait]
pub trait ShardClient: Send + Sync + 'static {
    /// Shards making up `target`: one for standalone, one per reachable
    /// node for a cluster.
    async fn shards(&self, target: &TargetId) -> Result<Vec<ShardId>, ConnectError>;

    /// Issue the monitoring command on `shard` and return its event stream.
    ///
    /// Fails with [`ConnectError::Unavailable`] when the shard cannot be
    /// reached or rejects the command (e.g. missing ACL permissions).
    async fn monitor(&self, shard: &ShardId) -> Result<EventStream, ConnectError>;
}
