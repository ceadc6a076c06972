//! SQL fragments for constraint push-down over event payloads.
//!
//! Scalar comparisons extract the JSON path as text and cast it to the type
//! of the comparison value; containment checks extract as JSONB and use the
//! `@>` operator. The choice is driven by the operator's declared extraction
//! type, never by the shape of the stored data.

use serde_json::Value;
use sqlx::{Postgres, QueryBuilder};

/// How a payload path is extracted for an operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionType {
    /// `#>>`: extract as text, optionally cast for typed comparison.
    Text,
    /// `#>`: extract as JSONB.
    Jsonb,
}

/// Operators supported for payload push-down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    /// Scalar equality.
    Equal,
    /// JSONB containment.
    Contains,
}

impl Operator {
    /// The extraction this operator requires.
    pub fn extraction_type(self) -> ExtractionType {
        match self {
            Self::Equal => ExtractionType::Text,
            Self::Contains => ExtractionType::Jsonb,
        }
    }
}

/// The SQL cast applied to a text-extracted path for comparison with `value`.
///
/// Numbers always cast to `numeric` and booleans to `boolean`; text compares
/// without a cast.
///
/// # Panics
///
/// Panics on values a scalar comparison cannot be built for (null, arrays,
/// objects); such a constraint is a programmer error.
fn cast_type_for(value: &Value) -> Option<&'static str> {
    match value {
        Value::Bool(_) => Some("boolean"),
        Value::Number(_) => Some("numeric"),
        Value::String(_) => None,
        other => panic!("unsupported payload comparison value: {other}"),
    }
}

/// Appends `payload <path> <operator> <value>` to the query.
pub fn push_payload_predicate(
    builder: &mut QueryBuilder<'static, Postgres>,
    path: &[String],
    operator: Operator,
    value: &Value,
) {
    match operator.extraction_type() {
        ExtractionType::Text => {
            match cast_type_for(value) {
                Some(cast) => {
                    builder.push("(payload #>> ");
                    builder.push_bind(path.to_vec());
                    builder.push(")::");
                    builder.push(cast);
                }
                None => {
                    builder.push("payload #>> ");
                    builder.push_bind(path.to_vec());
                }
            }

            builder.push(" = ");
            match value {
                Value::Bool(value) => builder.push_bind(*value),
                Value::Number(number) => {
                    builder.push_bind(number.as_f64().expect("a finite JSON number"))
                }
                Value::String(value) => builder.push_bind(value.clone()),
                other => panic!("unsupported payload comparison value: {other}"),
            };
        }

        ExtractionType::Jsonb => {
            builder.push("payload #> ");
            builder.push_bind(path.to_vec());
            builder.push(" @> ");
            builder.push_bind(value.clone());
        }
    }
}
