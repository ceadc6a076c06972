//! The cluster-singleton coordinator: rebalances subscription assignments
//! under a cluster-wide lock.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use super::difference::{allocate_sources, diff};
use super::lock::LockManager;
use super::mapping::SourceMappingStore;
use super::node::NodeStateStore;
use super::subscriber::{SubscriberHealth, SubscriberState, SubscriberStateStore};
use super::subscription::{SubscriptionState, SubscriptionStateStore};
use super::{Lifecycle, RunState};

/// Name of the cluster-wide lock serializing coordination passes.
pub const COORDINATOR_LOCK_NAME: &str = "coordinator";

/// Periodically recomputes the desired assignment of event sources to
/// subscribers and applies the difference to the subscription state store.
///
/// Any node may run a coordinator; the `"coordinator"` lock guarantees a
/// single writer per pass. Ticks that fail with infrastructure errors are
/// logged and retried on the next tick; the lock's scoped release guarantees
/// no partial changeset is ever visible.
pub struct Coordinator {
    node_id: Uuid,
    lock_manager: Arc<dyn LockManager>,
    node_store: Arc<dyn NodeStateStore>,
    subscriber_states: Arc<dyn SubscriberStateStore>,
    mappings: Arc<dyn SourceMappingStore>,
    subscriptions: Arc<dyn SubscriptionStateStore>,
    tick_interval: Duration,
    liveness_threshold: Duration,
    lifecycle: Lifecycle,
}

impl Coordinator {
    /// Creates a coordinator for `node_id` over the given cluster stores.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: Uuid,
        lock_manager: Arc<dyn LockManager>,
        node_store: Arc<dyn NodeStateStore>,
        subscriber_states: Arc<dyn SubscriberStateStore>,
        mappings: Arc<dyn SourceMappingStore>,
        subscriptions: Arc<dyn SubscriptionStateStore>,
        tick_interval: Duration,
        liveness_threshold: Duration,
    ) -> Self {
        Self {
            node_id,
            lock_manager,
            node_store,
            subscriber_states,
            mappings,
            subscriptions,
            tick_interval,
            liveness_threshold,
            lifecycle: Lifecycle::new(),
        }
    }

    /// The coordinator's run state.
    pub fn state(&self) -> RunState {
        self.lifecycle.state()
    }

    /// Requests the run loop to stop.
    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    /// Executes a single coordination pass.
    ///
    /// Skips silently when another node holds the coordinator lock.
    pub async fn tick(&self) -> Result<(), anyhow::Error> {
        self.node_store.heartbeat(self.node_id).await?;

        let lock = self.lock_manager.try_lock(COORDINATOR_LOCK_NAME).await?;
        if !lock.is_locked() {
            tracing::debug!(node_id = %self.node_id, "coordinator lock held elsewhere, skipping");
            return Ok(());
        }

        let nodes = self.node_store.list(self.liveness_threshold).await?;
        let subscribers = self.subscriber_states.list(self.liveness_threshold).await?;
        let mappings = self.mappings.list().await?;
        let actual = self.subscriptions.list().await?;

        let live_nodes: HashSet<Uuid> = nodes.into_iter().map(|node| node.id).collect();

        let mut desired: Vec<SubscriptionState> = Vec::new();
        for mapping in &mappings {
            let members: Vec<SubscriberState> = subscribers
                .iter()
                .filter(|state| state.key.group == mapping.subscriber_group)
                .filter(|state| state.health == SubscriberHealth::Healthy)
                .filter(|state| live_nodes.contains(&state.node_id))
                .cloned()
                .collect();

            desired.extend(allocate_sources(&members, &mapping.event_sources));
        }

        let changeset = diff(&desired, &actual);
        if !changeset.is_empty() {
            tracing::info!(
                node_id = %self.node_id,
                changes = changeset.len(),
                "applying subscription changes"
            );
            self.subscriptions.apply(changeset).await?;
        }

        lock.release();
        Ok(())
    }

    /// Runs coordination passes until stopped.
    pub async fn run(&self) {
        self.lifecycle.set(RunState::Running);

        let mut stop = self.lifecycle.stop_signal();
        let mut ticker = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.tick().await {
                        tracing::error!(node_id = %self.node_id, %error, "coordinator tick failed");
                    }
                }
                _ = stop.changed() => break,
            }
        }

        self.lifecycle.set(RunState::Stopped);
    }
}
