//! Post-filter predicates applied to scan output.
//!
//! Constraints are an open set: adapters may push implementations they
//! recognize down into their queries (see the `durably-postgres` crate), but
//! they must fall back to in-memory filtering through [`QueryConstraint::met_by`]
//! for anything else. Semantics must be identical either way.

use std::any::Any;
use std::fmt::Debug;
use std::sync::Arc;

use serde_json::Value;

use crate::event::StoredEvent;

/// A predicate over stored events, applied after the target selection of a
/// scan.
pub trait QueryConstraint: Debug + Send + Sync {
    /// Whether `event` satisfies the constraint.
    fn met_by(&self, event: &StoredEvent) -> bool;

    /// Used by adapters to recognize constraint implementations they can push
    /// down into their queries.
    fn as_any(&self) -> &dyn Any;
}

/// Met by events with a sequence number strictly greater than the given one.
///
/// This is the resume token for scans: a reader that processed up to sequence
/// number `N` re-scans with `sequence_number_after(N)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceNumberAfter(pub u64);

impl QueryConstraint for SequenceNumberAfter {
    fn met_by(&self, event: &StoredEvent) -> bool {
        event.sequence_number > self.0
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Met by events whose payload holds exactly `value` at the given path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadAtPathEquals {
    /// Path of object keys into the payload.
    pub path: Vec<String>,
    /// The expected scalar value.
    pub value: Value,
}

impl QueryConstraint for PayloadAtPathEquals {
    fn met_by(&self, event: &StoredEvent) -> bool {
        value_at_path(&event.payload, &self.path) == Some(&self.value)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Met by events whose payload *contains* `value` at the given path, using
/// JSON containment semantics (objects contain a subset of keys recursively,
/// arrays contain every element of the needle).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadAtPathContains {
    /// Path of object keys into the payload.
    pub path: Vec<String>,
    /// The value that must be contained.
    pub value: Value,
}

impl QueryConstraint for PayloadAtPathContains {
    fn met_by(&self, event: &StoredEvent) -> bool {
        value_at_path(&event.payload, &self.path)
            .map_or(false, |found| contains(found, &self.value))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Constraint on events having a sequence number strictly after `sequence_number`.
pub fn sequence_number_after(sequence_number: u64) -> Arc<dyn QueryConstraint> {
    Arc::new(SequenceNumberAfter(sequence_number))
}

/// Constraint on payloads holding exactly `value` at `path`.
pub fn payload_at_path_equals(path: &[&str], value: Value) -> Arc<dyn QueryConstraint> {
    Arc::new(PayloadAtPathEquals {
        path: path.iter().map(ToString::to_string).collect(),
        value,
    })
}

/// Constraint on payloads containing `value` at `path`.
pub fn payload_at_path_contains(path: &[&str], value: Value) -> Arc<dyn QueryConstraint> {
    Arc::new(PayloadAtPathContains {
        path: path.iter().map(ToString::to_string).collect(),
        value,
    })
}

fn value_at_path<'a>(payload: &'a Value, path: &[String]) -> Option<&'a Value> {
    path.iter()
        .try_fold(payload, |value, key| value.get(key.as_str()))
}

/// JSON containment, matching the semantics of Postgres' `@>` operator.
fn contains(haystack: &Value, needle: &Value) -> bool {
    match (haystack, needle) {
        (Value::Object(hay), Value::Object(need)) => need
            .iter()
            .all(|(key, value)| hay.get(key).map_or(false, |found| contains(found, value))),
        (Value::Array(hay), Value::Array(need)) => need
            .iter()
            .all(|value| hay.iter().any(|found| contains(found, value))),
        (Value::Array(hay), scalar) => hay.iter().any(|found| found == scalar),
        (found, expected) => found == expected,
    }
}
