//! Addressing for event sequences: the whole log, one category, or one stream.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::event::StoredEvent;

/// Identifies a single event stream within a category.
///
/// This is the only valid *write* target: events are always appended to one
/// stream. Reads accept the wider [`Identifier`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamId {
    /// Name of the category the stream belongs to.
    pub category: String,
    /// Name of the stream within the category.
    pub stream: String,
}

impl StreamId {
    /// Creates a new stream identifier.
    pub fn new(category: impl Into<String>, stream: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            stream: stream.into(),
        }
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.category, self.stream)
    }
}

/// Identifies an ordered sequence of events that can be scanned or subscribed
/// to: the whole log, every stream sharing a category, or a single stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", rename_all = "snake_case")]
pub enum Identifier {
    /// The totally-ordered global sequence of all events.
    Log,
    /// All streams sharing the given category name.
    Category {
        /// Name of the category.
        category: String,
    },
    /// A single ordered stream.
    Stream {
        /// Name of the category the stream belongs to.
        category: String,
        /// Name of the stream within the category.
        stream: String,
    },
}

impl Identifier {
    /// The whole-log identifier.
    pub fn log() -> Self {
        Self::Log
    }

    /// Identifier for every stream in `category`.
    pub fn category(category: impl Into<String>) -> Self {
        Self::Category {
            category: category.into(),
        }
    }

    /// Identifier for a single stream.
    pub fn stream(category: impl Into<String>, stream: impl Into<String>) -> Self {
        Self::Stream {
            category: category.into(),
            stream: stream.into(),
        }
    }

    /// Whether `event` belongs to the sequence this identifier addresses.
    pub fn includes(&self, event: &StoredEvent) -> bool {
        match self {
            Self::Log => true,
            Self::Category { category } => event.category == *category,
            Self::Stream { category, stream } => {
                event.category == *category && event.stream == *stream
            }
        }
    }
}

impl From<StreamId> for Identifier {
    fn from(id: StreamId) -> Self {
        Self::Stream {
            category: id.category,
            stream: id.stream,
        }
    }
}

impl fmt::Display for Identifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Log => f.write_str("log"),
            Self::Category { category } => write!(f, "category:{category}"),
            Self::Stream { category, stream } => write!(f, "stream:{category}/{stream}"),
        }
    }
}
