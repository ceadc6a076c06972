//! The per-node observer: reconciles locally-registered subscribers with the
//! assignments recorded for this node.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;

use super::subscriber::{SubscriberKey, SubscriberStore};
use super::subscription::SubscriptionStateStore;
use super::{Lifecycle, RunState};
use crate::identifier::Identifier;
use crate::source::EventSourceFactory;

/// Watches the subscription state store and starts, stops, and re-feeds the
/// subscribers registered on this node so they match their assignments.
///
/// Sources are built through the [`EventSourceFactory`]; subscribers resume
/// from their privately-tracked positions by iterating the sources with a
/// `sequence_number_after` constraint.
pub struct Observer {
    node_id: Uuid,
    subscribers: Arc<SubscriberStore>,
    subscriptions: Arc<dyn SubscriptionStateStore>,
    sources: Arc<dyn EventSourceFactory>,
    tick_interval: Duration,
    running: Mutex<HashMap<SubscriberKey, Vec<Identifier>>>,
    lifecycle: Lifecycle,
}

impl Observer {
    /// Creates an observer for the subscribers registered in `subscribers`
    /// on node `node_id`.
    pub fn new(
        node_id: Uuid,
        subscribers: Arc<SubscriberStore>,
        subscriptions: Arc<dyn SubscriptionStateStore>,
        sources: Arc<dyn EventSourceFactory>,
        tick_interval: Duration,
    ) -> Self {
        Self {
            node_id,
            subscribers,
            subscriptions,
            sources,
            tick_interval,
            running: Mutex::new(HashMap::new()),
            lifecycle: Lifecycle::new(),
        }
    }

    /// The observer's run state.
    pub fn state(&self) -> RunState {
        self.lifecycle.state()
    }

    /// Requests the run loop to stop.
    pub fn stop(&self) {
        self.lifecycle.stop();
    }

    /// Executes a single reconciliation pass.
    pub async fn tick(&self) -> Result<(), anyhow::Error> {
        let mut assigned: HashMap<SubscriberKey, Vec<Identifier>> = self
            .subscriptions
            .list()
            .await?
            .into_iter()
            .filter(|state| state.node_id == self.node_id)
            .map(|state| (state.key, state.event_sources))
            .collect();

        for subscriber in self.subscribers.list() {
            let key = subscriber.key();
            let desired = assigned.remove(&key).unwrap_or_default();

            let current = self.running.lock().get(&key).cloned().unwrap_or_default();
            if same_sources(&current, &desired) {
                continue;
            }

            if desired.is_empty() {
                tracing::info!(node_id = %self.node_id, subscriber = %key, "stopping subscriber");
            } else {
                tracing::info!(
                    node_id = %self.node_id,
                    subscriber = %key,
                    sources = desired.len(),
                    "feeding subscriber"
                );
            }

            let built = desired
                .iter()
                .map(|identifier| self.sources.build(identifier))
                .collect();

            if let Err(error) = subscriber.accept(built).await {
                tracing::warn!(
                    node_id = %self.node_id,
                    subscriber = %key,
                    %error,
                    "subscriber rejected its sources"
                );
                continue;
            }

            let mut running = self.running.lock();
            if desired.is_empty() {
                running.remove(&key);
            } else {
                running.insert(key, desired);
            }
        }

        Ok(())
    }

    /// Runs reconciliation passes until stopped.
    pub async fn run(&self) {
        self.lifecycle.set(RunState::Running);

        let mut stop = self.lifecycle.stop_signal();
        let mut ticker = tokio::time::interval(self.tick_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(error) = self.tick().await {
                        tracing::error!(node_id = %self.node_id, %error, "observer tick failed");
                    }
                }
                _ = stop.changed() => break,
            }
        }

        self.lifecycle.set(RunState::Stopped);
    }
}

fn same_sources(current: &[Identifier], desired: &[Identifier]) -> bool {
    let current: HashSet<&Identifier> = current.iter().collect();
    let desired: HashSet<&Identifier> = desired.iter().collect();
    current == desired
}
