//! Postgres-backed cluster-visible subscriber health store.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use durably::broker::{
    SubscriberHealth, SubscriberKey, SubscriberState, SubscriberStateStore, SubscriberStoreError,
};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// [`SubscriberStateStore`] over a `subscribers` table keyed by
/// `(subscriber_group, subscriber_id)`.
#[derive(Debug, Clone)]
pub struct PostgresSubscriberStateStore {
    pool: PgPool,
}

impl PostgresSubscriberStateStore {
    /// Creates a store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn health_to_column(health: SubscriberHealth) -> &'static str {
    match health {
        SubscriberHealth::Healthy => "healthy",
        SubscriberHealth::Unhealthy => "unhealthy",
    }
}

fn health_from_column(value: &str) -> Result<SubscriberHealth, anyhow::Error> {
    match value {
        "healthy" => Ok(SubscriberHealth::Healthy),
        "unhealthy" => Ok(SubscriberHealth::Unhealthy),
        other => Err(anyhow!("unknown subscriber health: {other}")),
    }
}

fn state_from_row(row: &PgRow) -> Result<SubscriberState, anyhow::Error> {
    let group: String = row
        .try_get("subscriber_group")
        .map_err(|err| anyhow!("failed to get column 'subscriber_group': {err}"))?;
    let id: String = row
        .try_get("subscriber_id")
        .map_err(|err| anyhow!("failed to get column 'subscriber_id': {err}"))?;
    let health: String = row
        .try_get("health")
        .map_err(|err| anyhow!("failed to get column 'health': {err}"))?;

    Ok(SubscriberState {
        key: SubscriberKey::new(group, id),
        node_id: row
            .try_get("node_id")
            .map_err(|err| anyhow!("failed to get column 'node_id': {err}"))?,
        last_seen_at: row
            .try_get("last_seen_at")
            .map_err(|err| anyhow!("failed to get column 'last_seen_at': {err}"))?,
        health: health_from_column(&health)?,
    })
}

#[async_trait]
impl SubscriberStateStore for PostgresSubscriberStateStore {
    async fn heartbeat(
        &self,
        node_id: Uuid,
        key: &SubscriberKey,
        health: SubscriberHealth,
    ) -> Result<(), SubscriberStoreError> {
        sqlx::query(
            "INSERT INTO subscribers \
             (subscriber_group, subscriber_id, node_id, health, last_seen_at) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (subscriber_group, subscriber_id) DO UPDATE SET \
             node_id = excluded.node_id, \
             health = excluded.health, \
             last_seen_at = excluded.last_seen_at",
        )
        .bind(&key.group)
        .bind(&key.id)
        .bind(node_id)
        .bind(health_to_column(health))
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| anyhow!("failed to heartbeat subscriber: {err}"))?;

        Ok(())
    }

    async fn list(&self, max_age: Duration) -> Result<Vec<SubscriberState>, SubscriberStoreError> {
        let cutoff = Utc::now() - max_age;

        let rows = sqlx::query(
            "SELECT subscriber_group, subscriber_id, node_id, health, last_seen_at \
             FROM subscribers WHERE last_seen_at >= $1 \
             ORDER BY subscriber_group, subscriber_id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| anyhow!("failed to list subscribers: {err}"))?;

        rows.iter()
            .map(|row| state_from_row(row).map_err(SubscriberStoreError::Internal))
            .collect()
    }

    async fn purge(&self, older_than: Duration) -> Result<(), SubscriberStoreError> {
        let cutoff = Utc::now() - older_than;

        sqlx::query("DELETE FROM subscribers WHERE last_seen_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|err| anyhow!("failed to purge subscribers: {err}"))?;

        Ok(())
    }
}
