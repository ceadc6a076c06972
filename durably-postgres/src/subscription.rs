//! Postgres-backed assignment table.

use anyhow::anyhow;
use async_trait::async_trait;
use durably::broker::{
    Changeset, SubscriberKey, SubscriptionChange, SubscriptionState, SubscriptionStateStore,
    SubscriptionStoreError,
};
use durably::identifier::Identifier;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

/// [`SubscriptionStateStore`] over a `subscriptions` table keyed by
/// `(subscriber_group, subscriber_id)`, with the assigned sources stored as
/// JSONB.
///
/// `apply` runs in a single transaction, so a failing change rolls the whole
/// changeset back.
#[derive(Debug, Clone)]
pub struct PostgresSubscriptionStateStore {
    pool: PgPool,
}

impl PostgresSubscriptionStateStore {
    /// Creates a store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn state_from_row(row: &PgRow) -> Result<SubscriptionState, anyhow::Error> {
    let group: String = row
        .try_get("subscriber_group")
        .map_err(|err| anyhow!("failed to get column 'subscriber_group': {err}"))?;
    let id: String = row
        .try_get("subscriber_id")
        .map_err(|err| anyhow!("failed to get column 'subscriber_id': {err}"))?;
    let event_sources: serde_json::Value = row
        .try_get("event_sources")
        .map_err(|err| anyhow!("failed to get column 'event_sources': {err}"))?;

    Ok(SubscriptionState {
        key: SubscriberKey::new(group, id),
        node_id: row
            .try_get("node_id")
            .map_err(|err| anyhow!("failed to get column 'node_id': {err}"))?,
        event_sources: serde_json::from_value::<Vec<Identifier>>(event_sources)
            .map_err(|err| anyhow!("failed to deserialize event sources: {err}"))?,
    })
}

fn sources_to_column(event_sources: &[Identifier]) -> Result<serde_json::Value, anyhow::Error> {
    serde_json::to_value(event_sources)
        .map_err(|err| anyhow!("failed to serialize event sources: {err}"))
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    err.as_database_error()
        .and_then(|db| db.code())
        .map_or(false, |code| code == "23505")
}

#[async_trait]
impl SubscriptionStateStore for PostgresSubscriptionStateStore {
    async fn list(&self) -> Result<Vec<SubscriptionState>, SubscriptionStoreError> {
        let rows = sqlx::query(
            "SELECT subscriber_group, subscriber_id, node_id, event_sources \
             FROM subscriptions ORDER BY subscriber_group, subscriber_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| anyhow!("failed to list subscriptions: {err}"))?;

        rows.iter()
            .map(|row| state_from_row(row).map_err(SubscriptionStoreError::Internal))
            .collect()
    }

    async fn get(
        &self,
        key: &SubscriberKey,
    ) -> Result<Option<SubscriptionState>, SubscriptionStoreError> {
        let row = sqlx::query(
            "SELECT subscriber_group, subscriber_id, node_id, event_sources \
             FROM subscriptions WHERE subscriber_group = $1 AND subscriber_id = $2",
        )
        .bind(&key.group)
        .bind(&key.id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| anyhow!("failed to get subscription: {err}"))?;

        row.map(|row| state_from_row(&row))
            .transpose()
            .map_err(SubscriptionStoreError::Internal)
    }

    async fn apply(&self, changeset: Changeset) -> Result<(), SubscriptionStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| anyhow!("failed to begin transaction: {err}"))?;

        for change in changeset.changes {
            match change {
                SubscriptionChange::Add(state) => {
                    sqlx::query(
                        "INSERT INTO subscriptions \
                         (subscriber_group, subscriber_id, node_id, event_sources) \
                         VALUES ($1, $2, $3, $4)",
                    )
                    .bind(&state.key.group)
                    .bind(&state.key.id)
                    .bind(state.node_id)
                    .bind(sources_to_column(&state.event_sources)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| {
                        if is_unique_violation(&err) {
                            SubscriptionStoreError::Conflict(state.key.clone())
                        } else {
                            SubscriptionStoreError::Internal(anyhow!(
                                "failed to insert subscription: {err}"
                            ))
                        }
                    })?;
                }

                SubscriptionChange::Remove(key) => {
                    sqlx::query(
                        "DELETE FROM subscriptions \
                         WHERE subscriber_group = $1 AND subscriber_id = $2",
                    )
                    .bind(&key.group)
                    .bind(&key.id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| anyhow!("failed to delete subscription: {err}"))?;
                }

                SubscriptionChange::Replace(key, event_sources) => {
                    sqlx::query(
                        "UPDATE subscriptions SET event_sources = $3 \
                         WHERE subscriber_group = $1 AND subscriber_id = $2",
                    )
                    .bind(&key.group)
                    .bind(&key.id)
                    .bind(sources_to_column(&event_sources)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(|err| anyhow!("failed to replace subscription sources: {err}"))?;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|err| anyhow!("failed to commit transaction: {err}"))?;

        Ok(())
    }
}
