//! Source mappings: the event sources each subscriber group declares it wants
//! to consume.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::identifier::Identifier;

/// A subscriber group's declared event sources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceMapping {
    /// The declaring subscriber group.
    pub subscriber_group: String,
    /// The sources the group consumes, partitioned across its members by the
    /// coordinator.
    pub event_sources: Vec<Identifier>,
}

/// All possible error types returned by [`SourceMappingStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum MappingStoreError {
    /// The store encountered an infrastructure error.
    #[error("source mapping store failure: {0}")]
    Internal(#[from] anyhow::Error),
}

/// Registry of group → declared-sources mappings.
#[async_trait]
pub trait SourceMappingStore: Send + Sync {
    /// Declares the sources `subscriber_group` consumes, replacing any
    /// previous declaration for the group.
    async fn add(
        &self,
        subscriber_group: &str,
        event_sources: Vec<Identifier>,
    ) -> Result<(), MappingStoreError>;

    /// Removes the group's declaration. Removing an absent group is a no-op.
    async fn remove(&self, subscriber_group: &str) -> Result<(), MappingStoreError>;

    /// All declared mappings, in group order.
    async fn list(&self) -> Result<Vec<SourceMapping>, MappingStoreError>;
}

/// In-memory [`SourceMappingStore`].
#[derive(Debug, Default)]
pub struct InMemorySourceMappingStore {
    mappings: Mutex<HashMap<String, Vec<Identifier>>>,
}

impl InMemorySourceMappingStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SourceMappingStore for InMemorySourceMappingStore {
    async fn add(
        &self,
        subscriber_group: &str,
        event_sources: Vec<Identifier>,
    ) -> Result<(), MappingStoreError> {
        self.mappings
            .lock()
            .insert(subscriber_group.to_owned(), event_sources);
        Ok(())
    }

    async fn remove(&self, subscriber_group: &str) -> Result<(), MappingStoreError> {
        self.mappings.lock().remove(subscriber_group);
        Ok(())
    }

    async fn list(&self) -> Result<Vec<SourceMapping>, MappingStoreError> {
        let mut mappings: Vec<SourceMapping> = self
            .mappings
            .lock()
            .iter()
            .map(|(subscriber_group, event_sources)| SourceMapping {
                subscriber_group: subscriber_group.clone(),
                event_sources: event_sources.clone(),
            })
            .collect();

        mappings.sort_by(|a, b| a.subscriber_group.cmp(&b.subscriber_group));
        Ok(mappings)
    }
}
