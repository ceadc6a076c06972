//! Subscribers: the external worker contract, the per-node registry of
//! subscribers to run locally, and their cluster-visible health.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{Lifecycle, RunState};
use crate::source::EventSource;

/// Identifies a subscriber instance: the group it load-shares with and its
/// instance id within the group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberKey {
    /// The subscriber group sharing a partition of event sources.
    pub group: String,
    /// The instance id within the group.
    pub id: String,
}

impl SubscriberKey {
    /// Creates a subscriber key.
    pub fn new(group: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for SubscriberKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.group, self.id)
    }
}

/// Health of a subscriber as reported to the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriberHealth {
    /// The subscriber is processing normally.
    Healthy,
    /// The subscriber failed; the coordinator redistributes its sources.
    Unhealthy,
}

/// An event-processing worker, opaque to the engine.
///
/// The observer delivers the full set of assigned sources through
/// [`accept`][EventSubscriber::accept] whenever the assignment changes; an
/// empty set revokes all work.
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// The subscriber's cluster-wide identity.
    fn key(&self) -> SubscriberKey;

    /// The subscriber's current health.
    fn health(&self) -> SubscriberHealth;

    /// Replaces the subscriber's set of event sources.
    async fn accept(&self, sources: Vec<Arc<dyn EventSource>>) -> Result<(), anyhow::Error>;
}

/// Per-node registry of the subscribers this process runs.
#[derive(Default)]
pub struct SubscriberStore {
    subscribers: Mutex<HashMap<SubscriberKey, Arc<dyn EventSubscriber>>>,
}

impl SubscriberStore {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber under its key, replacing any previous instance.
    pub fn add(&self, subscriber: Arc<dyn EventSubscriber>) {
        self.subscribers.lock().insert(subscriber.key(), subscriber);
    }

    /// Removes the subscriber with the given key, if registered.
    pub fn remove(&self, key: &SubscriberKey) {
        self.subscribers.lock().remove(key);
    }

    /// The subscriber with the given key, if registered.
    pub fn get(&self, key: &SubscriberKey) -> Option<Arc<dyn EventSubscriber>> {
        self.subscribers.lock().get(key).cloned()
    }

    /// All registered subscribers, in key order.
    pub fn list(&self) -> Vec<Arc<dyn EventSubscriber>> {
        let subscribers = self.subscribers.lock();

        let mut entries: Vec<_> = subscribers.iter().collect();
        entries.sort_by(|(a, _), (b, _)| a.cmp(b));

        entries.into_iter().map(|(_, s)| s.clone()).collect()
    }
}

impl fmt::Debug for SubscriberStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let keys: Vec<SubscriberKey> = self.subscribers.lock().keys().cloned().collect();
        f.debug_struct("SubscriberStore").field("keys", &keys).finish()
    }
}

/// A subscriber's cluster-visible state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberState {
    /// The subscriber's identity.
    pub key: SubscriberKey,
    /// The node running the subscriber.
    pub node_id: Uuid,
    /// When the subscriber last heartbeat.
    pub last_seen_at: DateTime<Utc>,
    /// The subscriber's reported health.
    pub health: SubscriberHealth,
}

/// All possible error types returned by [`SubscriberStateStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberStoreError {
    /// The store encountered an infrastructure error.
    #[error("subscriber state store failure: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Cluster-visible registry of subscriber health, fed by each node's
/// [`SubscriberManager`] and read by the coordinator.
#[async_trait]
pub trait SubscriberStateStore: Send + Sync {
    /// Upserts the subscriber's state with a fresh timestamp.
    async fn heartbeat(
        &self,
        node_id: Uuid,
        key: &SubscriberKey,
        health: SubscriberHealth,
    ) -> Result<(), SubscriberStoreError>;

    /// Subscribers seen within the last `max_age`, in key order.
    async fn list(&self, max_age: Duration) -> Result<Vec<SubscriberState>, SubscriberStoreError>;

    /// Deletes subscribers not seen for longer than `older_than`.
    async fn purge(&self, older_than: Duration) -> Result<(), SubscriberStoreError>;
}

/// In-memory [`SubscriberStateStore`].
#[derive(Debug, Default)]
pub struct InMemorySubscriberStateStore {
    states: Mutex<HashMap<SubscriberKey, SubscriberState>>,
}

impl InMemorySubscriberStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriberStateStore for InMemorySubscriberStateStore {
    async fn heartbeat(
        &self,
        node_id: Uuid,
        key: &SubscriberKey,
        health: SubscriberHealth,
    ) -> Result<(), SubscriberStoreError> {
        self.states.lock().insert(
            key.clone(),
            SubscriberState {
                key: key.clone(),
                node_id,
                last_seen_at: Utc::now(),
                health,
            },
        );
        Ok(())
    }

    async fn list(&self, max_age: Duration) -> Result<Vec<SubscriberState>, SubscriberStoreError> {
        let cutoff = Utc::now() - max_age;

        let mut states: Vec<SubscriberState> = self
            .states
            .lock()
            .values()
            .filter(|state| state.last_seen_at >= cutoff)
            .cloned()
            .collect();

        states.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(states)
    }

    async fn purge(&self, older_than: Duration) -> Result<(), SubscriberStoreError> {
        let cutoff = Utc::now() - older_than;
        self.states
            .lock()
            .retain(|_, state| state.last_seen_at >= cutoff);
        Ok(())
    }
}

/// Publishes the health of this node's subscribers to the cluster.
pub struct SubscriberManager {
    node_id: Uuid,
    store: Arc<SubscriberStore>,
    state_store: Arc<dyn SubscriberStateStore>,
    heartbeat_interval: Duration,
    purge_after: Duration,
    purge_every: u32,
    lifecycle: Lifecycle,
}

impl SubscriberManager {
    /// Creates a manager heartbeating every registered subscriber's health
    /// into `state_store`.
    pub fn new(
        node_id: Uuid,
        store: Arc<SubscriberStore>,
        state_store: Arc<dyn SubscriberStateStore>,
        heartbeat_interval: Duration,
        purge_after: Duration,
        purge_every: u32,
    ) -> Self {
        Self {
            node_id,
            store,
            state_store,
            heartbeat_interval,
            purge_after,
            purge_every: purge_every.max(1),
            lifecycle: Lifecycle::new(),
        }
    }

    /// The manager's run state.
    pub fn state(&self) -> RunState {
        self.lifecycle.state()
    }

    /// Requests the run loop to stop.
    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    /// Heartbeats every local subscriber once.
    pub async fn tick(&self) -> Result<(), anyhow::Error> {
        for subscriber in self.store.list() {
            let key = subscriber.key();
            self.state_store
                .heartbeat(self.node_id, &key, subscriber.health())
                .await?;
        }

        Ok(())
    }

    /// Runs the heartbeat loop until stopped.
    pub async fn run(&self) {
        self.lifecycle.set(RunState::Running);

        let mut stop = self.lifecycle.stop_signal();
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        let mut heartbeats: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.tick().await {
                        tracing::error!(node_id = %self.node_id, %error, "subscriber heartbeat failed");
                    }

                    heartbeats = heartbeats.wrapping_add(1);
                    if heartbeats % self.purge_every == 0 {
                        if let Err(error) = self.state_store.purge(self.purge_after).await {
                            tracing::warn!(%error, "subscriber purge failed");
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }

        self.lifecycle.set(RunState::Stopped);
    }
}
