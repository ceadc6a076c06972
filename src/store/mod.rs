//! The event storage adapter interface: ordered append with write conditions,
//! resumable scans with query constraints, and configurable serialization
//! guarantees.

pub mod memory;

use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::condition::{UnmetWriteCondition, WriteCondition};
use crate::constraint::QueryConstraint;
use crate::event::{NewEvent, StoredEvent};
use crate::identifier::{Identifier, StreamId};

pub use memory::InMemoryEventStorageAdapter;

/// The level at which committed sequence numbers appear as a hole-free,
/// strictly-increasing prefix to readers.
///
/// Writers within one scope are serialized; writers in different scopes are
/// not, so a reader of a wider target than the guarantee may observe apparent
/// reordering and permanent skips. The weaker levels exist to increase write
/// concurrency; pick the guarantee matching the widest target your readers
/// scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SerializationGuarantee {
    /// All commits are totally ordered: any log-level reader observes a
    /// contiguous strictly-increasing prefix of sequence numbers.
    #[default]
    Log,
    /// The prefix guarantee holds per category; a log reader may observe
    /// holes across categories.
    Category,
    /// The prefix guarantee holds per stream only.
    Stream,
}

impl SerializationGuarantee {
    /// The name of the write-serialization scope covering `stream_id` under
    /// this guarantee. Adapters key their write locks by this name.
    pub fn scope(&self, stream_id: &StreamId) -> String {
        match self {
            Self::Log => "log".to_owned(),
            Self::Category => format!("category:{}", stream_id.category),
            Self::Stream => format!("stream:{stream_id}"),
        }
    }
}

/// All possible error types returned by [`EventStorageAdapter::save`].
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// The write condition was not met by the stream tail. Non-retryable.
    #[error(transparent)]
    UnmetWriteCondition(#[from] UnmetWriteCondition),

    /// The adapter encountered an infrastructure error.
    #[error("failed to append new events, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// All possible error types returned while scanning events.
#[derive(Debug, thiserror::Error)]
pub enum ScanError {
    /// The adapter encountered an infrastructure error.
    #[error("failed to read events, an error occurred: {0}")]
    Internal(#[from] anyhow::Error),
}

/// A finite, lazy stream of stored events in ascending sequence-number order.
///
/// Not restartable: re-invoke the scan to read again.
pub type EventStream<'a> = BoxStream<'a, Result<StoredEvent, ScanError>>;

/// An append-only event store addressed by log, category, and stream targets.
#[async_trait]
pub trait EventStorageAdapter: Send + Sync {
    /// Atomically appends `events`, in order, to the target stream.
    ///
    /// Positions continue contiguously from the stream tail and fresh
    /// sequence numbers are assigned at commit. `condition` is evaluated
    /// against the stream tail inside the same serialized unit as the append;
    /// on failure the whole save is rejected with
    /// [`SaveError::UnmetWriteCondition`].
    ///
    /// Returns the stored events in input order.
    async fn save(
        &self,
        target: &StreamId,
        events: Vec<NewEvent>,
        condition: WriteCondition,
    ) -> Result<Vec<StoredEvent>, SaveError>;

    /// Scans events matching `target` in ascending sequence-number order.
    ///
    /// Constraints are applied as post-filters; adapters may push recognized
    /// constraints down into their queries as long as semantics are
    /// unchanged.
    fn scan<'a>(
        &'a self,
        target: &Identifier,
        constraints: &[Arc<dyn QueryConstraint>],
    ) -> EventStream<'a>;

    /// The event with the maximal sequence number within `target`, if any.
    async fn latest(&self, target: &Identifier) -> Result<Option<StoredEvent>, ScanError>;
}
