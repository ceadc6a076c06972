//! Postgres-backed cluster membership store.

use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::Utc;
use durably::broker::{NodeState, NodeStateStore, NodeStoreError};
use sqlx::{PgPool, Row};
use uuid::Uuid;

/// [`NodeStateStore`] over a `nodes` table keyed by node id.
#[derive(Debug, Clone)]
pub struct PostgresNodeStateStore {
    pool: PgPool,
}

impl PostgresNodeStateStore {
    /// Creates a store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl NodeStateStore for PostgresNodeStateStore {
    async fn heartbeat(&self, node_id: Uuid) -> Result<(), NodeStoreError> {
        sqlx::query(
            "INSERT INTO nodes (id, last_seen_at) VALUES ($1, $2) \
             ON CONFLICT (id) DO UPDATE SET last_seen_at = excluded.last_seen_at",
        )
        .bind(node_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|err| anyhow!("failed to heartbeat node: {err}"))?;

        Ok(())
    }

    async fn list(&self, max_age: Duration) -> Result<Vec<NodeState>, NodeStoreError> {
        let cutoff = Utc::now() - max_age;

        let rows = sqlx::query(
            "SELECT id, last_seen_at FROM nodes WHERE last_seen_at >= $1 ORDER BY id",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(|err| anyhow!("failed to list nodes: {err}"))?;

        rows.into_iter()
            .map(|row| {
                Ok(NodeState {
                    id: row
                        .try_get("id")
                        .map_err(|err| anyhow!("failed to get column 'id': {err}"))?,
                    last_seen_at: row
                        .try_get("last_seen_at")
                        .map_err(|err| anyhow!("failed to get column 'last_seen_at': {err}"))?,
                })
            })
            .collect()
    }

    async fn purge(&self, older_than: Duration) -> Result<(), NodeStoreError> {
        let cutoff = Utc::now() - older_than;

        sqlx::query("DELETE FROM nodes WHERE last_seen_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|err| anyhow!("failed to purge nodes: {err}"))?;

        Ok(())
    }
}
