//! Postgres-backed source mapping registry.

use anyhow::anyhow;
use async_trait::async_trait;
use durably::broker::{MappingStoreError, SourceMapping, SourceMappingStore};
use durably::identifier::Identifier;
use sqlx::{PgPool, Row};

/// [`SourceMappingStore`] over a `source_mappings` table keyed by subscriber
/// group. Adding a group's sources replaces any previous declaration.
#[derive(Debug, Clone)]
pub struct PostgresSourceMappingStore {
    pool: PgPool,
}

impl PostgresSourceMappingStore {
    /// Creates a store over `pool`.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SourceMappingStore for PostgresSourceMappingStore {
    async fn add(
        &self,
        subscriber_group: &str,
        event_sources: Vec<Identifier>,
    ) -> Result<(), MappingStoreError> {
        let event_sources = serde_json::to_value(&event_sources)
            .map_err(|err| anyhow!("failed to serialize event sources: {err}"))?;

        sqlx::query(
            "INSERT INTO source_mappings (subscriber_group, event_sources) VALUES ($1, $2) \
             ON CONFLICT (subscriber_group) DO UPDATE SET \
             event_sources = excluded.event_sources",
        )
        .bind(subscriber_group)
        .bind(event_sources)
        .execute(&self.pool)
        .await
        .map_err(|err| anyhow!("failed to add source mapping: {err}"))?;

        Ok(())
    }

    async fn remove(&self, subscriber_group: &str) -> Result<(), MappingStoreError> {
        sqlx::query("DELETE FROM source_mappings WHERE subscriber_group = $1")
            .bind(subscriber_group)
            .execute(&self.pool)
            .await
            .map_err(|err| anyhow!("failed to remove source mapping: {err}"))?;

        Ok(())
    }

    async fn list(&self) -> Result<Vec<SourceMapping>, MappingStoreError> {
        let rows = sqlx::query(
            "SELECT subscriber_group, event_sources FROM source_mappings \
             ORDER BY subscriber_group",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|err| anyhow!("failed to list source mappings: {err}"))?;

        rows.iter()
            .map(|row| {
                let subscriber_group: String = row
                    .try_get("subscriber_group")
                    .map_err(|err| anyhow!("failed to get column 'subscriber_group': {err}"))?;
                let event_sources: serde_json::Value = row
                    .try_get("event_sources")
                    .map_err(|err| anyhow!("failed to get column 'event_sources': {err}"))?;

                Ok(SourceMapping {
                    subscriber_group,
                    event_sources: serde_json::from_value(event_sources)
                        .map_err(|err| anyhow!("failed to deserialize event sources: {err}"))?,
                })
            })
            .collect()
    }
}
