use super::message::ClaimType;
use anyhow::Context;
use async_trait::async_trait;
use sqlx::PgPool;
use std::collections::HashMap;
use tokio::sync::Mutex;

/// Highest committed stream sequence per claim type.
///
/// Recording never moves a sequence backwards.
#[async_trait]
pub trait ProgressStore: Send + Sync {
    async fn last_sequence(&self, claim_type: ClaimType) -> anyhow::Result<Option<i64>>;

    async fn record_sequence(&self, claim_type: ClaimType, sequence: i64) -> anyhow::Result<()>;
}

#[derive(Debug, Default)]
pub struct MemoryProgressStore {
    sequences: Mutex<HashMap<ClaimType, i64>>,
}

impl MemoryProgressStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProgressStore for MemoryProgressStore {
    async fn last_sequence(&self, claim_type: ClaimType) -> anyhow::Result<Option<i64>> {
        Ok(self.sequences.lock().await.get(&claim_type).copied())
    }

    async fn record_sequence(&self, claim_type: ClaimType, sequence: i64) -> anyhow::Result<()> {
        let mut sequences = self.sequences.lock().await;
        let entry = sequences.entry(claim_type).or_insert(sequence);
        *entry = (*entry).max(sequence);
        Ok(())
    }
}

/// Progress kept in the `rda_progress` table.
#[derive(Debug, Clone)]
pub struct PgProgressStore {
    pool: PgPool,
}

impl PgProgressStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProgressStore for PgProgressStore {
    async fn last_sequence(&self, claim_type: ClaimType) -> anyhow::Result<Option<i64>> {
        let sequence: Option<i64> =
            sqlx::query_scalar("SELECT last_sequence FROM rda_progress WHERE claim_type = $1")
                .bind(claim_type.as_str())
                .fetch_optional(&self.pool)
                .await
                .context("Failed to read stream progress")?;
        Ok(sequence)
    }

    async fn record_sequence(&self, claim_type: ClaimType, sequence: i64) -> anyhow::Result<()> {
        sqlx::query(
            r#"
            INSERT INTO rda_progress (claim_type, last_sequence, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (claim_type)
            DO UPDATE SET
                last_sequence = GREATEST(rda_progress.last_sequence, EXCLUDED.last_sequence),
                updated_at = NOW()
            "#,
        )
        .bind(claim_type.as_str())
        .bind(sequence)
        .execute(&self.pool)
        .await
        .context("Failed to record stream progress")?;
        Ok(())
    }
}
