//! Multiplexer registry implementation
//!
//! Maps each target to its live multiplexer so that every client watching
//! the same target shares one set of shard connections.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use futures::future::BoxFuture;
use tokio::sync::RwLock;

use crate::error::Result;
use crate::event::TargetId;
use crate::mux::{EndHook, StreamMultiplexer, SubscriberId, Subscription};
use crate::shard::ShardClient;
use crate::stats::MultiplexerStats;

use super::config::RegistryConfig;

/// Lookups racing against a multiplexer that just ended are retried this
/// many times before giving up.
const SUBSCRIBE_ATTEMPTS: usize = 3;

type MultiplexerMap = RwLock<HashMap<TargetId, StreamMultiplexer>>;

/// Registry of live multiplexers, one per target
///
/// Passed to call sites explicitly (no global instance). Lookup-or-create
/// runs under a single write guard, so two multiplexers are never created
/// for the same target.
pub struct MultiplexerRegistry {
    /// Map of target to its multiplexer
    multiplexers: Arc<MultiplexerMap>,

    /// Configuration
    config: RegistryConfig,
}

impl MultiplexerRegistry {
    /// Create a new registry with default configuration
    pub fn new() -> Self {
        Self::with_config(RegistryConfig::default())
    }

    /// Create a new registry with custom configuration
    pub fn with_config(config: RegistryConfig) -> Self {
        Self {
            multiplexers: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Create a new registry, rejecting an invalid configuration
    pub fn try_with_config(config: RegistryConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_config(config))
    }

    /// Get the registry configuration
    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Get the live multiplexer for `target`, creating one if needed
    ///
    /// An entry that already reached `End` or `Error` is replaced. A new
    /// entry stays in `Wait` until [`subscribe`](Self::subscribe); an
    /// `unsubscribe` reaching it before then removes it.
    pub async fn get_or_create(
        &self,
        target: &TargetId,
        client: &Arc<dyn ShardClient>,
    ) -> StreamMultiplexer {
        let mut multiplexers = self.multiplexers.write().await;

        if let Some(existing) = multiplexers.get(target) {
            if !existing.status().is_terminal() {
                return existing.clone();
            }
        }

        let multiplexer = StreamMultiplexer::spawn_with_hook(
            target.clone(),
            Arc::clone(client),
            &self.config,
            Some(self.end_hook()),
        );
        multiplexers.insert(target.clone(), multiplexer.clone());

        tracing::info!(
            target_id = %target,
            instance = multiplexer.instance_id(),
            multiplexers = multiplexers.len(),
            "Multiplexer created"
        );

        multiplexer
    }

    /// Remove the entry for `target` if it is still `instance_id`
    ///
    /// Returns false if the entry is absent or was already replaced by a
    /// newer instance.
    pub async fn remove(&self, target: &TargetId, instance_id: u64) -> bool {
        remove_instance(&self.multiplexers, target, instance_id).await
    }

    /// Subscribe to `target`, sharing its multiplexer with other subscribers
    pub async fn subscribe(
        &self,
        target: &TargetId,
        client: &Arc<dyn ShardClient>,
        subscription: Subscription,
    ) -> Result<StreamMultiplexer> {
        let mut attempt = 1;
        loop {
            let multiplexer = self.get_or_create(target, client).await;
            match multiplexer.subscribe(subscription.clone()).await {
                Ok(()) => return Ok(multiplexer),
                Err(e) if e.is_ended() && attempt < SUBSCRIBE_ATTEMPTS => {
                    tracing::debug!(
                        target_id = %target,
                        attempt = attempt,
                        "Multiplexer ended during subscribe, retrying"
                    );
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Unsubscribe from `target`. Idempotent.
    pub async fn unsubscribe(&self, target: &TargetId, id: &SubscriberId) {
        // Clone out of the map: ending the multiplexer takes the write lock
        if let Some(multiplexer) = self.get(target).await {
            multiplexer.unsubscribe(id).await;
        }
    }

    /// Force teardown of the multiplexer for `target`
    pub async fn clear(&self, target: &TargetId) {
        if let Some(multiplexer) = self.get(target).await {
            multiplexer.clear().await;
        }
    }

    /// Tear down every multiplexer
    pub async fn clear_all(&self) {
        let multiplexers: Vec<StreamMultiplexer> =
            self.multiplexers.read().await.values().cloned().collect();

        for multiplexer in multiplexers {
            multiplexer.clear().await;
        }
    }

    /// Get the multiplexer for `target`, if present
    pub async fn get(&self, target: &TargetId) -> Option<StreamMultiplexer> {
        self.multiplexers.read().await.get(target).cloned()
    }

    /// Check if `target` has a multiplexer
    pub async fn contains(&self, target: &TargetId) -> bool {
        self.multiplexers.read().await.contains_key(target)
    }

    /// Targets currently present
    pub async fn targets(&self) -> Vec<TargetId> {
        let mut targets: Vec<TargetId> =
            self.multiplexers.read().await.keys().cloned().collect();
        targets.sort();
        targets
    }

    /// Number of multiplexers
    pub async fn len(&self) -> usize {
        self.multiplexers.read().await.len()
    }

    /// Check if the registry is empty
    pub async fn is_empty(&self) -> bool {
        self.multiplexers.read().await.is_empty()
    }

    /// Statistics for the multiplexer of `target`
    pub async fn stats(&self, target: &TargetId) -> Option<MultiplexerStats> {
        self.get(target).await?.stats().await
    }

    fn end_hook(&self) -> EndHook {
        let multiplexers: Weak<MultiplexerMap> = Arc::downgrade(&self.multiplexers);

        Box::new(move |target: TargetId, instance_id: u64| -> BoxFuture<'static, ()> {
            Box::pin(async move {
                if let Some(multiplexers) = multiplexers.upgrade() {
                    remove_instance(&multiplexers, &target, instance_id).await;
                }
            })
        })
    }
}

impl Default for MultiplexerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

async fn remove_instance(multiplexers: &MultiplexerMap, target: &TargetId, instance_id: u64) -> bool {
    let mut multiplexers = multiplexers.write().await;

    match multiplexers.get(target) {
        Some(existing) if existing.instance_id() == instance_id => {
            multiplexers.remove(target);
            tracing::info!(
                target_id = %target,
                instance = instance_id,
                multiplexers = multiplexers.len(),
                "Multiplexer removed"
            );
            true
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use tokio_test::{assert_err, assert_ok};

    use super::*;
    use crate::error::{ConnectError, Error};
    use crate::mux::MultiplexerStatus;
    use crate::testing::{RecordingSink, ScriptedClient};

    fn registry() -> MultiplexerRegistry {
        MultiplexerRegistry::with_config(
            RegistryConfig::default()
                .connect_timeout(Duration::from_millis(500))
                .disconnect_timeout(Duration::from_millis(200)),
        )
    }

    fn shard_client(client: &Arc<ScriptedClient>) -> Arc<dyn ShardClient> {
        client.clone()
    }

    #[tokio::test]
    async fn test_get_or_create_reuses_live_entry() {
        let registry = registry();
        let client = shard_client(&ScriptedClient::new());
        let target = TargetId::new("db");

        let first = registry.get_or_create(&target, &client).await;
        let second = registry.get_or_create(&target, &client).await;

        assert_eq!(first.instance_id(), second.instance_id());
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_concurrent_subscribes_share_one_upstream() {
        let registry = Arc::new(registry());
        let scripted = ScriptedClient::with_topology("clusterA", &["n1", "n2", "n3"]);
        for shard in ["n1", "n2", "n3"] {
            scripted.delay_shard(shard, Duration::from_millis(30));
        }
        let client = shard_client(&scripted);
        let target = TargetId::new("clusterA");

        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = Arc::clone(&registry);
            let client = Arc::clone(&client);
            let target = target.clone();
            tasks.push(tokio::spawn(async move {
                let subscription = Subscription::new(format!("s{i}").as_str(), RecordingSink::new());
                registry
                    .subscribe(&target, &client, subscription)
                    .await
                    .map(|mux| mux.instance_id())
            }));
        }

        let mut instances = Vec::new();
        for task in tasks {
            instances.push(assert_ok!(task.await.unwrap()));
        }
        instances.dedup();

        assert_eq!(instances.len(), 1);
        assert_eq!(scripted.total_monitor_calls(), 3);
        let mux = registry.get(&target).await.unwrap();
        assert_eq!(mux.subscriber_count(), 16);
    }

    #[tokio::test]
    async fn test_fan_out_isolated_per_target() {
        let registry = registry();
        let scripted = ScriptedClient::with_topology("clusterA", &["n1", "n2", "n3"]);
        scripted.set_topology("other", &["m1"]);
        let client = shard_client(&scripted);

        let s1 = RecordingSink::new();
        let s2 = RecordingSink::new();
        let bystander = RecordingSink::new();
        let cluster = TargetId::new("clusterA");
        let other = TargetId::new("other");

        assert_ok!(registry.subscribe(&cluster, &client, Subscription::new("s1", s1.clone())).await);
        assert_ok!(registry.subscribe(&cluster, &client, Subscription::new("s2", s2.clone())).await);
        assert_ok!(
            registry
                .subscribe(&other, &client, Subscription::new("s1", bystander.clone()))
                .await
        );

        scripted.emit("n3", "E").await;
        s1.wait_for(1).await;
        s2.wait_for(1).await;

        assert_eq!(s1.events()[0].shard.as_str(), "n3");
        assert_eq!(s2.events()[0].shard.as_str(), "n3");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(bystander.is_empty());
        assert_eq!(registry.targets().await, vec![cluster, other]);
    }

    #[tokio::test]
    async fn test_last_unsubscribe_removes_entry_and_resubscribe_is_fresh() {
        let registry = registry();
        let scripted = ScriptedClient::new();
        scripted.delay_shard("T", Duration::from_millis(50));
        let client = shard_client(&scripted);
        let target = TargetId::new("T");

        let first = assert_ok!(
            registry
                .subscribe(&target, &client, Subscription::new("s1", RecordingSink::new()))
                .await
        );
        registry.unsubscribe(&target, &"s1".into()).await;

        assert_eq!(first.status(), MultiplexerStatus::End);
        assert!(!registry.contains(&target).await);
        assert!(!scripted.is_open("T"));

        // A brand-new instance goes through Wait -> Connecting -> Ready
        let second = registry.get_or_create(&target, &client).await;
        assert_ne!(first.instance_id(), second.instance_id());
        assert_eq!(second.status(), MultiplexerStatus::Wait);

        let mut status = second.status_watch();
        let subscribing = {
            let second = second.clone();
            tokio::spawn(async move {
                second
                    .subscribe(Subscription::new("s1", RecordingSink::new()))
                    .await
            })
        };

        let connecting = tokio::time::timeout(
            Duration::from_secs(1),
            status.wait_for(|status| *status == MultiplexerStatus::Connecting),
        )
        .await
        .is_ok();
        assert!(connecting);

        assert_ok!(subscribing.await.unwrap());
        assert_eq!(second.status(), MultiplexerStatus::Ready);
        assert_eq!(scripted.monitor_calls("T"), 2);
    }

    #[tokio::test]
    async fn test_failed_setup_is_evicted() {
        let registry = registry();
        let scripted = ScriptedClient::with_topology("clusterA", &["n1", "n2", "n3"]);
        scripted.fail_shard("n1", "connection refused");
        let client = shard_client(&scripted);
        let target = TargetId::new("clusterA");

        let err = assert_err!(
            registry
                .subscribe(&target, &client, Subscription::new("s1", RecordingSink::new()))
                .await
        );
        assert!(matches!(err, Error::Connect(ConnectError::Unavailable { .. })));
        assert!(!registry.contains(&target).await);
        assert!(!scripted.is_open("n2"));
        assert!(!scripted.is_open("n3"));
    }

    #[tokio::test]
    async fn test_remove_guards_against_newer_instance() {
        let registry = registry();
        let client = shard_client(&ScriptedClient::new());
        let target = TargetId::new("db");

        let old = registry.get_or_create(&target, &client).await;
        old.clear().await;
        assert!(!registry.contains(&target).await);

        let new = registry.get_or_create(&target, &client).await;
        assert!(!registry.remove(&target, old.instance_id()).await);
        assert!(registry.contains(&target).await);

        assert!(registry.remove(&target, new.instance_id()).await);
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_entry_without_subscribers() {
        let registry = registry();
        let scripted = ScriptedClient::new();
        let client = shard_client(&scripted);
        let target = TargetId::new("U");

        let idle = registry.get_or_create(&target, &client).await;
        assert_eq!(idle.status(), MultiplexerStatus::Wait);

        registry.unsubscribe(&target, &"nobody".into()).await;
        assert_eq!(idle.status(), MultiplexerStatus::End);
        assert!(!registry.contains(&target).await);
        assert_eq!(scripted.monitor_calls("U"), 0);
    }

    #[tokio::test]
    async fn test_clear_notifies_subscribers() {
        let registry = registry();
        let scripted = ScriptedClient::new();
        let client = shard_client(&scripted);
        let target = TargetId::new("db");
        let sink = RecordingSink::new();

        assert_ok!(registry.subscribe(&target, &client, Subscription::new("s1", sink.clone())).await);
        registry.clear(&target).await;

        assert!(sink.disconnected());
        assert!(!registry.contains(&target).await);
        assert!(registry.stats(&target).await.is_none());
    }

    #[tokio::test]
    async fn test_clear_all() {
        let registry = registry();
        let client = shard_client(&ScriptedClient::new());

        for name in ["a", "b", "c"] {
            assert_ok!(
                registry
                    .subscribe(
                        &TargetId::new(name),
                        &client,
                        Subscription::new("s1", RecordingSink::new())
                    )
                    .await
            );
        }
        assert_eq!(registry.len().await, 3);

        registry.clear_all().await;
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_stats_by_target() {
        let registry = registry();
        let client = shard_client(&ScriptedClient::with_topology("db", &["n1", "n2"]));
        let target = TargetId::new("db");

        assert_ok!(
            registry
                .subscribe(&target, &client, Subscription::new("s1", RecordingSink::new()))
                .await
        );

        let stats = registry.stats(&target).await.unwrap();
        assert_eq!(stats.shard_count(), 2);
        assert_eq!(stats.subscriber_count, 1);
    }

    #[test]
    fn test_try_with_config_validates() {
        let result = MultiplexerRegistry::try_with_config(RegistryConfig::default().buffer_capacity(0));
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
