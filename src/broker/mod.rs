//! Cluster-wide distribution of subscriber-group → event-source assignments.
//!
//! Every node runs the same set of loops:
//!
//! - a [`NodeManager`] keeping the node's membership row fresh,
//! - a [`SubscriberManager`] publishing local subscriber health,
//! - a [`Coordinator`] that, when it wins the cluster-wide `"coordinator"`
//!   lock, rebalances the assignment table against declared
//!   [source mappings][mapping] and live subscribers,
//! - an [`Observer`] reconciling the node's local subscribers with its rows
//!   in the assignment table.
//!
//! [`Broker`] assembles the four loops over a shared set of stores.

pub mod coordinator;
pub mod difference;
pub mod lock;
pub mod mapping;
pub mod node;
pub mod observer;
pub mod subscriber;
pub mod subscription;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use uuid::Uuid;

pub use coordinator::{Coordinator, COORDINATOR_LOCK_NAME};
pub use difference::{allocate_sources, diff};
pub use lock::{advisory_key, InMemoryLockManager, Lock, LockError, LockManager};
pub use mapping::{
    InMemorySourceMappingStore, MappingStoreError, SourceMapping, SourceMappingStore,
};
pub use node::{InMemoryNodeStateStore, NodeManager, NodeState, NodeStateStore, NodeStoreError};
pub use observer::Observer;
pub use subscriber::{
    EventSubscriber, InMemorySubscriberStateStore, SubscriberHealth, SubscriberKey,
    SubscriberManager, SubscriberState, SubscriberStateStore, SubscriberStore,
    SubscriberStoreError,
};
pub use subscription::{
    Changeset, InMemorySubscriptionStateStore, SubscriptionChange, SubscriptionState,
    SubscriptionStateStore, SubscriptionStoreError,
};

use crate::identifier::Identifier;
use crate::source::{EventSourceFactory, StoreEventSourceFactory};
use crate::store::EventStorageAdapter;

/// Run state of a broker component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    /// Constructed, not yet running.
    Initialized,
    /// The run loop is ticking.
    Running,
    /// The run loop has exited.
    Stopped,
}

/// Shared state/shutdown plumbing for the broker run loops.
pub(crate) struct Lifecycle {
    state: Mutex<RunState>,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            state: Mutex::new(RunState::Initialized),
            stop_tx,
            stop_rx,
        }
    }

    pub(crate) fn state(&self) -> RunState {
        *self.state.lock()
    }

    pub(crate) fn set(&self, state: RunState) {
        *self.state.lock() = state;
    }

    pub(crate) fn stop(&self) {
        // The receiver half is kept alive by this struct, so the send cannot
        // fail.
        let _ = self.stop_tx.send(true);
    }

    /// A receiver that resolves even when `stop` was called before the
    /// subscription.
    pub(crate) fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_rx.clone()
    }
}

/// Intervals and thresholds for the broker loops.
#[derive(Debug, Clone, Copy)]
pub struct BrokerSettings {
    /// How often the node heartbeats its membership row.
    pub node_heartbeat_interval: Duration,
    /// How often local subscriber health is published.
    pub subscriber_heartbeat_interval: Duration,
    /// How often a coordination pass is attempted.
    pub coordinator_tick_interval: Duration,
    /// How often local subscribers are reconciled with assignments.
    pub observer_tick_interval: Duration,
    /// Maximum heartbeat age for a node or subscriber to count as live.
    pub liveness_threshold: Duration,
    /// Purge stale rows every this many heartbeats.
    pub purge_every: u32,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            node_heartbeat_interval: Duration::from_secs(2),
            subscriber_heartbeat_interval: Duration::from_secs(2),
            coordinator_tick_interval: Duration::from_secs(5),
            observer_tick_interval: Duration::from_secs(5),
            liveness_threshold: Duration::from_secs(20),
            purge_every: 10,
        }
    }
}

/// One node's view of the event broker: the four run loops plus the local
/// subscriber registry, wired over a shared set of cluster stores.
pub struct Broker {
    node_id: Uuid,
    subscriber_store: Arc<SubscriberStore>,
    mapping_store: Arc<dyn SourceMappingStore>,
    node_manager: NodeManager,
    subscriber_manager: SubscriberManager,
    coordinator: Coordinator,
    observer: Observer,
    lifecycle: Lifecycle,
}

impl Broker {
    /// Creates a broker node over the given cluster stores. A fresh node id
    /// is generated for this process.
    pub fn new(
        settings: BrokerSettings,
        lock_manager: Arc<dyn LockManager>,
        node_store: Arc<dyn NodeStateStore>,
        subscriber_state_store: Arc<dyn SubscriberStateStore>,
        mapping_store: Arc<dyn SourceMappingStore>,
        subscription_store: Arc<dyn SubscriptionStateStore>,
        source_factory: Arc<dyn EventSourceFactory>,
    ) -> Self {
        let node_id = Uuid::new_v4();
        let subscriber_store = Arc::new(SubscriberStore::new());

        let node_manager = NodeManager::new(
            node_id,
            node_store.clone(),
            settings.node_heartbeat_interval,
            settings.liveness_threshold,
            settings.purge_every,
        );

        let subscriber_manager = SubscriberManager::new(
            node_id,
            subscriber_store.clone(),
            subscriber_state_store.clone(),
            settings.subscriber_heartbeat_interval,
            settings.liveness_threshold,
            settings.purge_every,
        );

        let coordinator = Coordinator::new(
            node_id,
            lock_manager,
            node_store,
            subscriber_state_store,
            mapping_store.clone(),
            subscription_store.clone(),
            settings.coordinator_tick_interval,
            settings.liveness_threshold,
        );

        let observer = Observer::new(
            node_id,
            subscriber_store.clone(),
            subscription_store,
            source_factory,
            settings.observer_tick_interval,
        );

        Self {
            node_id,
            subscriber_store,
            mapping_store,
            node_manager,
            subscriber_manager,
            coordinator,
            observer,
            lifecycle: Lifecycle::new(),
        }
    }

    /// Creates a single-process broker with in-memory stores, serving events
    /// from `adapter`.
    pub fn in_memory(adapter: Arc<dyn EventStorageAdapter>, settings: BrokerSettings) -> Self {
        Self::new(
            settings,
            Arc::new(InMemoryLockManager::new()),
            Arc::new(InMemoryNodeStateStore::new()),
            Arc::new(InMemorySubscriberStateStore::new()),
            Arc::new(InMemorySourceMappingStore::new()),
            Arc::new(InMemorySubscriptionStateStore::new()),
            Arc::new(StoreEventSourceFactory::new(adapter)),
        )
    }

    /// This node's id.
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// The broker's run state.
    pub fn state(&self) -> RunState {
        self.lifecycle.state()
    }

    /// Registers a subscriber to run on this node and declares the sources
    /// its group consumes.
    pub async fn register(
        &self,
        subscriber: Arc<dyn EventSubscriber>,
        event_sources: Vec<Identifier>,
    ) -> Result<(), MappingStoreError> {
        let key = subscriber.key();

        self.mapping_store.add(&key.group, event_sources).await?;
        self.subscriber_store.add(subscriber);

        Ok(())
    }

    /// Runs all broker loops until [`stop`][Broker::stop] is called.
    pub async fn run(&self) {
        self.lifecycle.set(RunState::Running);
        tracing::info!(node_id = %self.node_id, "event broker starting");

        futures::join!(
            self.node_manager.run(),
            self.subscriber_manager.run(),
            self.coordinator.run(),
            self.observer.run(),
        );

        tracing::info!(node_id = %self.node_id, "event broker stopped");
        self.lifecycle.set(RunState::Stopped);
    }

    /// Requests every broker loop to stop.
    pub fn stop(&self) {
        self.node_manager.stop();
        self.subscriber_manager.stop();
        self.coordinator.stop();
        self.observer.stop();
        self.lifecycle.stop();
    }
}
