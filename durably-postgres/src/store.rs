//! PostgreSQL implementation of the event storage adapter.

use std::sync::Arc;

use anyhow::anyhow;
use async_stream::try_stream;
use async_trait::async_trait;
use durably::broker::advisory_key;
use durably::condition::WriteCondition;
use durably::constraint::{
    PayloadAtPathContains, PayloadAtPathEquals, QueryConstraint, SequenceNumberAfter,
};
use durably::event::{NewEvent, StoredEvent};
use durably::identifier::{Identifier, StreamId};
use durably::store::{
    EventStorageAdapter, EventStream, SaveError, ScanError, SerializationGuarantee,
};
use futures::TryStreamExt;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::query::{push_payload_predicate, Operator};

const EVENT_COLUMNS: &str =
    "id, name, category, stream, position, sequence_number, payload, observed_at, occurred_at";

/// Event storage adapter backed by a single `events` table.
///
/// Conditional appends serialize on a transaction-scoped advisory lock keyed
/// by the write scope the adapter's [`SerializationGuarantee`] derives for
/// the target stream, then read the stream tail, check the condition, and
/// insert. Sequence numbers come from the table's `BIGSERIAL` column.
#[derive(Debug, Clone)]
pub struct PostgresEventStorageAdapter {
    pool: PgPool,
    guarantee: SerializationGuarantee,
}

impl PostgresEventStorageAdapter {
    /// Creates an adapter over `pool`, running any pending migrations first.
    pub async fn new(
        pool: PgPool,
        guarantee: SerializationGuarantee,
    ) -> Result<Self, sqlx::migrate::MigrateError> {
        crate::MIGRATIONS.run(&pool).await?;

        Ok(Self { pool, guarantee })
    }
}

fn try_get_column<'a, T>(row: &'a PgRow, name: &'static str) -> Result<T, anyhow::Error>
where
    T: sqlx::Type<Postgres> + sqlx::Decode<'a, Postgres>,
{
    row.try_get(name)
        .map_err(|err| anyhow!("failed to get column '{name}' from result row: {err}"))
}

fn event_from_row(row: &PgRow) -> Result<StoredEvent, anyhow::Error> {
    let position: i64 = try_get_column(row, "position")?;
    let sequence_number: i64 = try_get_column(row, "sequence_number")?;

    Ok(StoredEvent {
        id: try_get_column(row, "id")?,
        name: try_get_column(row, "name")?,
        category: try_get_column(row, "category")?,
        stream: try_get_column(row, "stream")?,
        position: position as u64,
        sequence_number: sequence_number as u64,
        payload: try_get_column(row, "payload")?,
        observed_at: try_get_column(row, "observed_at")?,
        occurred_at: try_get_column(row, "occurred_at")?,
    })
}

/// Builds the scan query for `target` with every recognized constraint pushed
/// down, returning the constraints that must be applied in memory instead.
fn build_scan_query(
    target: &Identifier,
    constraints: &[Arc<dyn QueryConstraint>],
) -> (QueryBuilder<'static, Postgres>, Vec<Arc<dyn QueryConstraint>>) {
    let mut builder = QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events"));
    let mut has_clauses = false;

    let mut clause = move |builder: &mut QueryBuilder<'static, Postgres>| {
        if has_clauses {
            builder.push(" AND ");
        } else {
            builder.push(" WHERE ");
            has_clauses = true;
        }
    };

    match target {
        Identifier::Log => {}
        Identifier::Category { category } => {
            clause(&mut builder);
            builder.push("category = ");
            builder.push_bind(category.clone());
        }
        Identifier::Stream { category, stream } => {
            clause(&mut builder);
            builder.push("category = ");
            builder.push_bind(category.clone());
            clause(&mut builder);
            builder.push("stream = ");
            builder.push_bind(stream.clone());
        }
    }

    let mut residual = Vec::new();
    for constraint in constraints {
        let any = constraint.as_any();

        if let Some(after) = any.downcast_ref::<SequenceNumberAfter>() {
            clause(&mut builder);
            builder.push("sequence_number > ");
            builder.push_bind(after.0 as i64);
        } else if let Some(equals) = any.downcast_ref::<PayloadAtPathEquals>() {
            clause(&mut builder);
            push_payload_predicate(&mut builder, &equals.path, Operator::Equal, &equals.value);
        } else if let Some(contains) = any.downcast_ref::<PayloadAtPathContains>() {
            clause(&mut builder);
            push_payload_predicate(
                &mut builder,
                &contains.path,
                Operator::Contains,
                &contains.value,
            );
        } else {
            // Unrecognized constraint implementations fall back to in-memory
            // filtering with identical semantics.
            residual.push(constraint.clone());
        }
    }

    builder.push(" ORDER BY sequence_number");

    (builder, residual)
}

#[async_trait]
impl EventStorageAdapter for PostgresEventStorageAdapter {
    async fn save(
        &self,
        target: &StreamId,
        events: Vec<NewEvent>,
        condition: WriteCondition,
    ) -> Result<Vec<StoredEvent>, SaveError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| anyhow!("failed to begin transaction: {err}"))?;

        let scope = self.guarantee.scope(target);
        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(advisory_key(&scope))
            .execute(&mut *tx)
            .await
            .map_err(|err| anyhow!("failed to acquire write-scope lock: {err}"))?;

        let tail = sqlx::query(&format!(
            "SELECT {EVENT_COLUMNS} FROM events \
             WHERE category = $1 AND stream = $2 \
             ORDER BY position DESC LIMIT 1"
        ))
        .bind(&target.category)
        .bind(&target.stream)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|err| anyhow!("failed to read stream tail: {err}"))?
        .map(|row| event_from_row(&row))
        .transpose()
        .map_err(SaveError::Internal)?;

        // Dropping the transaction on the error path rolls it back and
        // releases the advisory lock.
        condition.assert_met_by(tail.as_ref())?;

        let start_position = tail.map_or(0, |event| event.position + 1);

        let mut stored = Vec::with_capacity(events.len());
        for (i, event) in events.into_iter().enumerate() {
            let id = Uuid::new_v4();
            let position = start_position + i as u64;

            let row = sqlx::query(
                "INSERT INTO events \
                 (id, name, category, stream, position, payload, observed_at, occurred_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 RETURNING sequence_number",
            )
            .bind(id)
            .bind(&event.name)
            .bind(&target.category)
            .bind(&target.stream)
            .bind(position as i64)
            .bind(&event.payload)
            .bind(event.observed_at)
            .bind(event.occurred_at)
            .fetch_one(&mut *tx)
            .await
            .map_err(|err| anyhow!("failed to insert event: {err}"))?;

            let sequence_number: i64 = row
                .try_get("sequence_number")
                .map_err(|err| anyhow!("failed to read assigned sequence number: {err}"))?;

            stored.push(StoredEvent {
                id,
                name: event.name,
                category: target.category.clone(),
                stream: target.stream.clone(),
                position,
                sequence_number: sequence_number as u64,
                payload: event.payload,
                observed_at: event.observed_at,
                occurred_at: event.occurred_at,
            });
        }

        tx.commit()
            .await
            .map_err(|err| anyhow!("failed to commit transaction: {err}"))?;

        Ok(stored)
    }

    fn scan<'a>(
        &'a self,
        target: &Identifier,
        constraints: &[Arc<dyn QueryConstraint>],
    ) -> EventStream<'a> {
        let pool = self.pool.clone();
        let (builder, residual) = build_scan_query(target, constraints);

        Box::pin(try_stream! {
            let mut builder = builder;
            let mut rows = builder.build().fetch(&pool);

            while let Some(row) = rows
                .try_next()
                .await
                .map_err(|err| ScanError::Internal(anyhow!("failed to scan events: {err}")))?
            {
                let event = event_from_row(&row).map_err(ScanError::Internal)?;

                if residual.iter().all(|constraint| constraint.met_by(&event)) {
                    yield event;
                }
            }
        })
    }

    async fn latest(&self, target: &Identifier) -> Result<Option<StoredEvent>, ScanError> {
        let mut builder = QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events"));

        match target {
            Identifier::Log => {}
            Identifier::Category { category } => {
                builder.push(" WHERE category = ");
                builder.push_bind(category.clone());
            }
            Identifier::Stream { category, stream } => {
                builder.push(" WHERE category = ");
                builder.push_bind(category.clone());
                builder.push(" AND stream = ");
                builder.push_bind(stream.clone());
            }
        }

        builder.push(" ORDER BY sequence_number DESC LIMIT 1");

        let row = builder
            .build()
            .fetch_optional(&self.pool)
            .await
            .map_err(|err| anyhow!("failed to read latest event: {err}"))?;

        row.map(|row| event_from_row(&row))
            .transpose()
            .map_err(ScanError::Internal)
    }
}
