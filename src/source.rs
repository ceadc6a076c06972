//! Event sources: pull-based views over an event sequence, handed to
//! subscribers by the [observer][crate::broker::observer].
//!
//! A source wraps a storage adapter target. Subscribers resume by iterating
//! with a [`sequence_number_after`][crate::constraint::sequence_number_after]
//! constraint for their privately-tracked last processed sequence number.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::TryStreamExt;

use crate::constraint::QueryConstraint;
use crate::event::StoredEvent;
use crate::identifier::Identifier;
use crate::store::{EventStorageAdapter, EventStream, ScanError};

/// A finite, repeatable view over the events of one sequence identifier.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// The sequence this source reads from.
    fn identifier(&self) -> &Identifier;

    /// The event with the maximal sequence number in the source, if any.
    async fn latest(&self) -> Result<Option<StoredEvent>, ScanError>;

    /// Iterates the source's events in ascending sequence-number order,
    /// applying the given constraints on top of any the source already
    /// carries.
    fn iterate<'a>(&'a self, constraints: &[Arc<dyn QueryConstraint>]) -> EventStream<'a>;

    /// Collects the source's events into memory. Prefer [`EventSource::iterate`]
    /// for unbounded sequences.
    async fn read(
        &self,
        constraints: &[Arc<dyn QueryConstraint>],
    ) -> Result<Vec<StoredEvent>, ScanError> {
        self.iterate(constraints).try_collect().await
    }
}

/// An [`EventSource`] reading directly from a storage adapter.
#[derive(Clone)]
pub struct StoreEventSource {
    adapter: Arc<dyn EventStorageAdapter>,
    identifier: Identifier,
}

impl StoreEventSource {
    /// Creates a source over `identifier` backed by `adapter`.
    pub fn new(adapter: Arc<dyn EventStorageAdapter>, identifier: Identifier) -> Self {
        Self {
            adapter,
            identifier,
        }
    }
}

impl fmt::Debug for StoreEventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreEventSource")
            .field("identifier", &self.identifier)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventSource for StoreEventSource {
    fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    async fn latest(&self) -> Result<Option<StoredEvent>, ScanError> {
        self.adapter.latest(&self.identifier).await
    }

    fn iterate<'a>(&'a self, constraints: &[Arc<dyn QueryConstraint>]) -> EventStream<'a> {
        self.adapter.scan(&self.identifier, constraints)
    }
}

/// Decorator applying a fixed constraint set to every read of a delegate
/// source.
#[derive(Clone)]
pub struct ConstrainedEventSource {
    delegate: Arc<dyn EventSource>,
    constraints: Vec<Arc<dyn QueryConstraint>>,
}

impl ConstrainedEventSource {
    /// Wraps `delegate` so `constraints` apply to every iteration.
    pub fn new(delegate: Arc<dyn EventSource>, constraints: Vec<Arc<dyn QueryConstraint>>) -> Self {
        Self {
            delegate,
            constraints,
        }
    }
}

impl fmt::Debug for ConstrainedEventSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstrainedEventSource")
            .field("identifier", self.delegate.identifier())
            .field("constraints", &self.constraints)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl EventSource for ConstrainedEventSource {
    fn identifier(&self) -> &Identifier {
        self.delegate.identifier()
    }

    async fn latest(&self) -> Result<Option<StoredEvent>, ScanError> {
        self.delegate.latest().await
    }

    fn iterate<'a>(&'a self, constraints: &[Arc<dyn QueryConstraint>]) -> EventStream<'a> {
        let combined: Vec<Arc<dyn QueryConstraint>> = self
            .constraints
            .iter()
            .chain(constraints.iter())
            .cloned()
            .collect();

        self.delegate.iterate(&combined)
    }
}

/// Builds [`EventSource`]s for the identifiers assigned to subscribers.
pub trait EventSourceFactory: Send + Sync {
    /// Builds a source reading from `identifier`.
    fn build(&self, identifier: &Identifier) -> Arc<dyn EventSource>;
}

/// [`EventSourceFactory`] producing [`StoreEventSource`]s over one adapter.
#[derive(Clone)]
pub struct StoreEventSourceFactory {
    adapter: Arc<dyn EventStorageAdapter>,
}

impl StoreEventSourceFactory {
    /// Creates a factory over `adapter`.
    pub fn new(adapter: Arc<dyn EventStorageAdapter>) -> Self {
        Self { adapter }
    }
}

impl EventSourceFactory for StoreEventSourceFactory {
    fn build(&self, identifier: &Identifier) -> Arc<dyn EventSource> {
        Arc::new(StoreEventSource::new(
            self.adapter.clone(),
            identifier.clone(),
        ))
    }
}
