//! Event types persisted and served by the storage adapters.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::identifier::StreamId;

/// An event that has not been persisted yet.
///
/// `observed_at` is when the writing process first saw the event and is always
/// at or before commit time; `occurred_at` is caller-supplied domain time and
/// is unconstrained.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewEvent {
    /// The domain name of the event, e.g. `"order-placed"`.
    pub name: String,
    /// Opaque JSON payload. Use a [`Codec`][crate::codec::Codec] to convert
    /// domain types to and from this representation.
    pub payload: Value,
    /// When the writing process observed the event.
    pub observed_at: DateTime<Utc>,
    /// When the event occurred in the domain.
    pub occurred_at: DateTime<Utc>,
}

impl NewEvent {
    /// Creates a new event observed and occurred now.
    pub fn new(name: impl Into<String>, payload: Value) -> Self {
        let now = Utc::now();

        Self {
            name: name.into(),
            payload,
            observed_at: now,
            occurred_at: now,
        }
    }

    /// Overrides the observation timestamp.
    #[must_use]
    pub fn with_observed_at(mut self, observed_at: DateTime<Utc>) -> Self {
        self.observed_at = observed_at;
        self
    }

    /// Overrides the domain timestamp.
    #[must_use]
    pub fn with_occurred_at(mut self, occurred_at: DateTime<Utc>) -> Self {
        self.occurred_at = occurred_at;
        self
    }
}

/// An event committed to the log.
///
/// `position` is the 0-based index within the event's stream, contiguous in
/// commit order. `sequence_number` is the globally unique, strictly-increasing
/// integer assigned at commit; it is the resume token for scans.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredEvent {
    /// Globally unique event id.
    pub id: Uuid,
    /// The domain name of the event.
    pub name: String,
    /// Category the event's stream belongs to.
    pub category: String,
    /// Stream the event was appended to.
    pub stream: String,
    /// 0-based position within the stream.
    pub position: u64,
    /// Global commit-order sequence number.
    pub sequence_number: u64,
    /// Opaque JSON payload.
    pub payload: Value,
    /// When the writing process observed the event.
    pub observed_at: DateTime<Utc>,
    /// When the event occurred in the domain.
    pub occurred_at: DateTime<Utc>,
}

impl StoredEvent {
    /// The identifier of the stream this event belongs to.
    pub fn stream_id(&self) -> StreamId {
        StreamId::new(self.category.clone(), self.stream.clone())
    }
}
