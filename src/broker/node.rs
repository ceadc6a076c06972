//! Cluster membership: node heartbeats, liveness listing, and the per-node
//! heartbeat loop.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use uuid::Uuid;

use super::{Lifecycle, RunState};

/// A cluster node as last seen by the membership store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    /// The node's process-unique id.
    pub id: Uuid,
    /// When the node last heartbeat.
    pub last_seen_at: DateTime<Utc>,
}

/// All possible error types returned by [`NodeStateStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum NodeStoreError {
    /// The store encountered an infrastructure error.
    #[error("node state store failure: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Cluster-visible registry of live nodes.
#[async_trait]
pub trait NodeStateStore: Send + Sync {
    /// Upserts `(node_id, now)`.
    async fn heartbeat(&self, node_id: Uuid) -> Result<(), NodeStoreError>;

    /// Nodes seen within the last `max_age`.
    async fn list(&self, max_age: Duration) -> Result<Vec<NodeState>, NodeStoreError>;

    /// Deletes nodes not seen for longer than `older_than`.
    async fn purge(&self, older_than: Duration) -> Result<(), NodeStoreError>;
}

/// In-memory [`NodeStateStore`].
#[derive(Debug, Default)]
pub struct InMemoryNodeStateStore {
    nodes: Mutex<HashMap<Uuid, DateTime<Utc>>>,
}

impl InMemoryNodeStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl NodeStateStore for InMemoryNodeStateStore {
    async fn heartbeat(&self, node_id: Uuid) -> Result<(), NodeStoreError> {
        self.nodes.lock().insert(node_id, Utc::now());
        Ok(())
    }

    async fn list(&self, max_age: Duration) -> Result<Vec<NodeState>, NodeStoreError> {
        let cutoff = Utc::now() - max_age;

        let mut nodes: Vec<NodeState> = self
            .nodes
            .lock()
            .iter()
            .filter(|(_, last_seen_at)| **last_seen_at >= cutoff)
            .map(|(id, last_seen_at)| NodeState {
                id: *id,
                last_seen_at: *last_seen_at,
            })
            .collect();

        nodes.sort_by_key(|node| node.id);
        Ok(nodes)
    }

    async fn purge(&self, older_than: Duration) -> Result<(), NodeStoreError> {
        let cutoff = Utc::now() - older_than;
        self.nodes
            .lock()
            .retain(|_, last_seen_at| *last_seen_at >= cutoff);
        Ok(())
    }
}

/// Keeps this node's membership row fresh, purging stale peers
/// opportunistically.
pub struct NodeManager {
    node_id: Uuid,
    store: Arc<dyn NodeStateStore>,
    heartbeat_interval: Duration,
    purge_after: Duration,
    purge_every: u32,
    lifecycle: Lifecycle,
}

impl NodeManager {
    /// Creates a manager heartbeating `node_id` into `store` every
    /// `heartbeat_interval`, purging rows older than `purge_after` every
    /// `purge_every` heartbeats.
    pub fn new(
        node_id: Uuid,
        store: Arc<dyn NodeStateStore>,
        heartbeat_interval: Duration,
        purge_after: Duration,
        purge_every: u32,
    ) -> Self {
        Self {
            node_id,
            store,
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

    /// Runs the heartbeat loop until stopped.
    pub async fn run(&self) {
        self.lifecycle.set(RunState::Running);

        let mut stop = self.lifecycle.stop_signal();
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        let mut heartbeats: u32 = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.store.heartbeat(self.node_id).await {
                        tracing::error!(node_id = %self.node_id, %error, "node heartbeat failed");
                    }

                    heartbeats = heartbeats.wrapping_add(1);
                    if heartbeats % self.purge_every == 0 {
                        if let Err(error) = self.store.purge(self.purge_after).await {
                            tracing::warn!(%error, "node purge failed");
                        }
                    }
                }
                _ = stop.changed() => break,
            }
        }

        self.lifecycle.set(RunState::Stopped);
    }
}
