//! Composable pre-write predicates evaluated against the tail of a stream.
//!
//! A [`WriteCondition`] is checked against the last event of the target stream
//! (or `None` for an empty stream) inside the same serialized unit as the
//! append itself, so concurrent checked writes cannot both pass.

use std::ops::{BitAnd, BitOr};

use crate::event::StoredEvent;

/// Error raised when a write condition is not met by the stream tail.
///
/// Non-retryable: the caller decides whether to reload and retry the whole
/// operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unmet write condition: {reason}")]
pub struct UnmetWriteCondition {
    /// Human-readable reason for the failure.
    pub reason: &'static str,
}

/// How the members of a combined condition are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Combinator {
    /// Every member must be met.
    And,
    /// At least one member must be met; if none is, the *first* member's
    /// failure is surfaced.
    Or,
}

/// A predicate over the last event of a stream, required to hold for a write
/// to succeed.
///
/// Conditions compose with [`and`][WriteCondition::and] /
/// [`or`][WriteCondition::or] (also available as `&` and `|`). Combining
/// performs fused absorption at construction: AND of AND and OR of OR merge
/// into a single member set, and duplicate members are dropped.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCondition {
    /// Trivially met.
    Unconditional,
    /// Met iff the target stream has no events.
    StreamIsEmpty,
    /// Met iff the last event of the stream has exactly this position.
    PositionIs(u64),
    /// A combined set of conditions.
    Combined {
        /// How the members combine.
        combinator: Combinator,
        /// The member conditions, in insertion order, deduplicated.
        conditions: Vec<WriteCondition>,
    },
}

/// Condition met iff the target stream has no events.
pub fn stream_is_empty() -> WriteCondition {
    WriteCondition::StreamIsEmpty
}

/// Condition met iff the last event of the target stream has `position`.
///
/// Fails against an empty stream.
pub fn position_is(position: u64) -> WriteCondition {
    WriteCondition::PositionIs(position)
}

impl Default for WriteCondition {
    fn default() -> Self {
        Self::Unconditional
    }
}

impl WriteCondition {
    /// Checks the condition against the last event of the target stream.
    pub fn assert_met_by(
        &self,
        last_event: Option<&StoredEvent>,
    ) -> Result<(), UnmetWriteCondition> {
        match self {
            Self::Unconditional => Ok(()),

            Self::StreamIsEmpty => match last_event {
                None => Ok(()),
                Some(_) => Err(UnmetWriteCondition {
                    reason: "stream is not empty",
                }),
            },

            Self::PositionIs(position) => match last_event {
                Some(event) if event.position == *position => Ok(()),
                _ => Err(UnmetWriteCondition {
                    reason: "unexpected stream position",
                }),
            },

            Self::Combined {
                combinator: Combinator::And,
                conditions,
            } => {
                for condition in conditions {
                    condition.assert_met_by(last_event)?;
                }
                Ok(())
            }

            Self::Combined {
                combinator: Combinator::Or,
                conditions,
            } => {
                let mut first_failure = None;

                for condition in conditions {
                    match condition.assert_met_by(last_event) {
                        Ok(()) => return Ok(()),
                        Err(failure) => {
                            first_failure.get_or_insert(failure);
                        }
                    }
                }

                match first_failure {
                    Some(failure) => Err(failure),
                    None => Ok(()),
                }
            }
        }
    }

    /// Combines with `other` so both must be met.
    #[must_use]
    pub fn and(self, other: WriteCondition) -> WriteCondition {
        combine(Combinator::And, self, other)
    }

    /// Combines with `other` so at least one must be met.
    #[must_use]
    pub fn or(self, other: WriteCondition) -> WriteCondition {
        combine(Combinator::Or, self, other)
    }
}

fn combine(combinator: Combinator, lhs: WriteCondition, rhs: WriteCondition) -> WriteCondition {
    let mut conditions = members_of(combinator, lhs);

    for condition in members_of(combinator, rhs) {
        if !conditions.contains(&condition) {
            conditions.push(condition);
        }
    }

    WriteCondition::Combined {
        combinator,
        conditions,
    }
}

fn members_of(combinator: Combinator, condition: WriteCondition) -> Vec<WriteCondition> {
    match condition {
        WriteCondition::Combined {
            combinator: inner,
            conditions,
        } if inner == combinator => conditions,
        other => vec![other],
    }
}

impl BitAnd for WriteCondition {
    type Output = WriteCondition;

    fn bitand(self, rhs: WriteCondition) -> WriteCondition {
        self.and(rhs)
    }
}

impl BitOr for WriteCondition {
    type Output = WriteCondition;

    fn bitor(self, rhs: WriteCondition) -> WriteCondition {
        self.or(rhs)
    }
}
