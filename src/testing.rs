//! Builders and helpers for constructing events in tests.

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::event::{NewEvent, StoredEvent};

/// A random category name, unique per call.
pub fn random_category_name() -> String {
    format!("category-{}", Uuid::new_v4().simple())
}

/// A random stream name, unique per call.
pub fn random_stream_name() -> String {
    format!("stream-{}", Uuid::new_v4().simple())
}

/// Builder for [`NewEvent`] values with sensible defaults.
#[derive(Debug, Clone)]
pub struct NewEventBuilder {
    name: String,
    payload: Value,
    observed_at: DateTime<Utc>,
    occurred_at: DateTime<Utc>,
}

impl Default for NewEventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl NewEventBuilder {
    /// A builder producing an event with a unique name and payload.
    pub fn new() -> Self {
        let now = Utc::now();

        Self {
            name: format!("event-{}", Uuid::new_v4().simple()),
            payload: json!({ "value": Uuid::new_v4().to_string() }),
            observed_at: now,
            occurred_at: now,
        }
    }

    /// Sets the event name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Builds the event.
    pub fn build(self) -> NewEvent {
        NewEvent {
            name: self.name,
            payload: self.payload,
            observed_at: self.observed_at,
            occurred_at: self.occurred_at,
        }
    }
}

/// Builder for [`StoredEvent`] values with sensible defaults.
#[derive(Debug, Clone)]
pub struct StoredEventBuilder {
    id: Uuid,
    name: String,
    category: String,
    stream: String,
    position: u64,
    sequence_number: u64,
    payload: Value,
    observed_at: DateTime<Utc>,
    occurred_at: DateTime<Utc>,
}

impl Default for StoredEventBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl StoredEventBuilder {
    /// A builder producing a stored event with unique identity fields.
    pub fn new() -> Self {
        let now = Utc::now();

        Self {
            id: Uuid::new_v4(),
            name: format!("event-{}", Uuid::new_v4().simple()),
            category: random_category_name(),
            stream: random_stream_name(),
            position: 0,
            sequence_number: 1,
            payload: json!({ "value": Uuid::new_v4().to_string() }),
            observed_at: now,
            occurred_at: now,
        }
    }

    /// Sets the event name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the category.
    #[must_use]
    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = category.into();
        self
    }

    /// Sets the stream.
    #[must_use]
    pub fn with_stream(mut self, stream: impl Into<String>) -> Self {
        self.stream = stream.into();
        self
    }

    /// Sets the stream position.
    #[must_use]
    pub fn with_position(mut self, position: u64) -> Self {
        self.position = position;
        self
    }

    /// Sets the global sequence number.
    #[must_use]
    pub fn with_sequence_number(mut self, sequence_number: u64) -> Self {
        self.sequence_number = sequence_number;
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    /// Builds the event.
    pub fn build(self) -> StoredEvent {
        StoredEvent {
            id: self.id,
            name: self.name,
            category: self.category,
            stream: self.stream,
            position: self.position,
            sequence_number: self.sequence_number,
            payload: self.payload,
            observed_at: self.observed_at,
            occurred_at: self.occurred_at,
        }
    }
}
