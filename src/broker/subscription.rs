//! The authoritative assignment table: which node runs which subscriber, fed
//! with which event sources.
//!
//! Only the coordinator mutates this table, and only while holding the
//! cluster-wide coordinator lock; observers read their own node's rows.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::subscriber::SubscriberKey;
use crate::identifier::Identifier;

/// An assignment row: one subscriber instance, the node it runs on, and the
/// event sources it is fed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionState {
    /// The assigned subscriber.
    pub key: SubscriberKey,
    /// The node the subscriber runs on.
    pub node_id: uuid::Uuid,
    /// The sources assigned to the subscriber.
    pub event_sources: Vec<Identifier>,
}

/// A single mutation of the assignment table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionChange {
    /// Inserts a new assignment row.
    Add(SubscriptionState),
    /// Deletes the row with the given key.
    Remove(SubscriberKey),
    /// Replaces the event sources of the row with the given key.
    Replace(SubscriberKey, Vec<Identifier>),
}

/// An ordered set of assignment mutations applied atomically.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Changeset {
    /// The changes, applied in order.
    pub changes: Vec<SubscriptionChange>,
}

impl Changeset {
    /// Whether the changeset mutates anything.
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Number of changes.
    pub fn len(&self) -> usize {
        self.changes.len()
    }
}

/// All possible error types returned by [`SubscriptionStateStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum SubscriptionStoreError {
    /// An `Add` targeted a key that already has a row.
    #[error("subscription already exists for {0}")]
    Conflict(SubscriberKey),

    /// The store encountered an infrastructure error.
    #[error("subscription state store failure: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Store of assignment rows, unique per subscriber key.
///
/// `apply` must be linearizable with respect to the coordinator lock held
/// while it runs, and all-or-nothing: no partial changeset may become
/// visible.
#[async_trait]
pub trait SubscriptionStateStore: Send + Sync {
    /// All assignment rows, in key order.
    async fn list(&self) -> Result<Vec<SubscriptionState>, SubscriptionStoreError>;

    /// The assignment row for `key`, if any.
    async fn get(
        &self,
        key: &SubscriberKey,
    ) -> Result<Option<SubscriptionState>, SubscriptionStoreError>;

    /// Applies the changeset atomically.
    async fn apply(&self, changeset: Changeset) -> Result<(), SubscriptionStoreError>;
}

/// In-memory [`SubscriptionStateStore`].
#[derive(Debug, Default)]
pub struct InMemorySubscriptionStateStore {
    states: Mutex<HashMap<SubscriberKey, SubscriptionState>>,
}

impl InMemorySubscriptionStateStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStateStore for InMemorySubscriptionStateStore {
    async fn list(&self) -> Result<Vec<SubscriptionState>, SubscriptionStoreError> {
        let mut states: Vec<SubscriptionState> = self.states.lock().values().cloned().collect();
        states.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(states)
    }

    async fn get(
        &self,
        key: &SubscriberKey,
    ) -> Result<Option<SubscriptionState>, SubscriptionStoreError> {
        Ok(self.states.lock().get(key).cloned())
    }

    async fn apply(&self, changeset: Changeset) -> Result<(), SubscriptionStoreError> {
        let mut states = self.states.lock();

        // Stage against a scratch copy so a failing change leaves the table
        // untouched.
        let mut staged = states.clone();

        for change in changeset.changes {
            match change {
                SubscriptionChange::Add(state) => {
                    if staged.contains_key(&state.key) {
                        return Err(SubscriptionStoreError::Conflict(state.key));
                    }
                    staged.insert(state.key.clone(), state);
                }
                SubscriptionChange::Remove(key) => {
                    staged.remove(&key);
                }
                SubscriptionChange::Replace(key, event_sources) => {
                    if let Some(state) = staged.get_mut(&key) {
                        state.event_sources = event_sources;
                    }
                }
            }
        }

        *states = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;

    fn state(group: &str, id: &str, node_id: Uuid, sources: Vec<Identifier>) -> SubscriptionState {
        SubscriptionState {
            key: SubscriberKey::new(group, id),
            node_id,
            event_sources: sources,
        }
    }

    #[tokio::test]
    async fn apply_adds_removes_and_replaces() {
        let store = InMemorySubscriptionStateStore::new();
        let node_id = Uuid::new_v4();

        store
            .apply(Changeset {
                changes: vec![
                    SubscriptionChange::Add(state(
                        "g",
                        "s1",
                        node_id,
                        vec![Identifier::category("orders")],
                    )),
                    SubscriptionChange::Add(state(
                        "g",
                        "s2",
                        node_id,
                        vec![Identifier::category("payments")],
                    )),
                ],
            })
            .await
            .expect("apply should not fail");

        store
            .apply(Changeset {
                changes: vec![
                    SubscriptionChange::Remove(SubscriberKey::new("g", "s2")),
                    SubscriptionChange::Replace(
                        SubscriberKey::new("g", "s1"),
                        vec![Identifier::log()],
                    ),
                ],
            })
            .await
            .expect("apply should not fail");

        let states = store.list().await.expect("list should not fail");
        assert_eq!(1, states.len());
        assert_eq!(SubscriberKey::new("g", "s1"), states[0].key);
        assert_eq!(vec![Identifier::log()], states[0].event_sources);

        let fetched = store
            .get(&SubscriberKey::new("g", "s1"))
            .await
            .expect("get should not fail");
        assert_eq!(Some(states[0].clone()), fetched);

        let missing = store
            .get(&SubscriberKey::new("g", "s2"))
            .await
            .expect("get should not fail");
        assert_eq!(None, missing);
    }

    #[tokio::test]
    async fn adding_an_existing_key_is_a_conflict() {
        let store = InMemorySubscriptionStateStore::new();
        let node_id = Uuid::new_v4();

        store
            .apply(Changeset {
                changes: vec![SubscriptionChange::Add(state("g", "s1", node_id, vec![]))],
            })
            .await
            .expect("apply should not fail");

        let error = store
            .apply(Changeset {
                changes: vec![SubscriptionChange::Add(state("g", "s1", node_id, vec![]))],
            })
            .await
            .expect_err("the key already has a row");

        assert!(matches!(error, SubscriptionStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn a_failing_changeset_leaves_no_partial_state() {
        let store = InMemorySubscriptionStateStore::new();
        let node_id = Uuid::new_v4();

        store
            .apply(Changeset {
                changes: vec![SubscriptionChange::Add(state("g", "s1", node_id, vec![]))],
            })
            .await
            .expect("apply should not fail");

        let error = store
            .apply(Changeset {
                changes: vec![
                    SubscriptionChange::Add(state("g", "s2", node_id, vec![])),
                    // Conflicts: the whole changeset must be discarded.
                    SubscriptionChange::Add(state("g", "s1", node_id, vec![])),
                ],
            })
            .await
            .expect_err("the second change conflicts");
        assert!(matches!(error, SubscriptionStoreError::Conflict(_)));

        let keys: Vec<SubscriberKey> = store
            .list()
            .await
            .expect("list should not fail")
            .into_iter()
            .map(|s| s.key)
            .collect();
        assert_eq!(vec![SubscriberKey::new("g", "s1")], keys);
    }

    #[tokio::test]
    async fn removing_or_replacing_an_absent_key_is_a_no_op() {
        let store = InMemorySubscriptionStateStore::new();

        store
            .apply(Changeset {
                changes: vec![
                    SubscriptionChange::Remove(SubscriberKey::new("g", "missing")),
                    SubscriptionChange::Replace(
                        SubscriberKey::new("g", "missing"),
                        vec![Identifier::log()],
                    ),
                ],
            })
            .await
            .expect("absent keys are ignored");

        assert!(store.list().await.expect("list should not fail").is_empty());
    }
}
