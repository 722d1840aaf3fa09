use super::{BatchSink, ProcessingFailure, SinkFactory};
use crate::rda::transform::TransformedClaim;
use async_trait::async_trait;
use sqlx::PgPool;

/// Upserts claims into `rda_claims`, keyed by claim id.
///
/// Each write is its own statement, so a committed count always matches what
/// the database holds. A stale change (lower sequence than the stored row)
/// still counts as committed; it is applied as a no-op.
pub struct PgClaimSink {
    pool: Option<PgPool>,
}

impl PgClaimSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool: Some(pool) }
    }
}

#[async_trait]
impl BatchSink<TransformedClaim> for PgClaimSink {
    async fn write_one(&mut self, claim: &TransformedClaim) -> Result<u64, ProcessingFailure> {
        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| ProcessingFailure::new(anyhow::anyhow!("sink is closed"), 0))?;

        sqlx::query(
            r#"
            INSERT INTO rda_claims (
                claim_id, claim_type, sequence_number, mbi_hash, last_updated, payload
            )
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (claim_id)
            DO UPDATE SET
                claim_type = EXCLUDED.claim_type,
                sequence_number = EXCLUDED.sequence_number,
                mbi_hash = EXCLUDED.mbi_hash,
                last_updated = EXCLUDED.last_updated,
                payload = EXCLUDED.payload
            WHERE rda_claims.sequence_number <= EXCLUDED.sequence_number
            "#,
        )
        .bind(&claim.claim_id)
        .bind(claim.claim_type.as_str())
        .bind(claim.sequence)
        .bind(claim.mbi_hash.as_deref())
        .bind(claim.last_updated)
        .bind(&claim.payload)
        .execute(pool)
        .await
        .map_err(|e| ProcessingFailure::new(e, 0))?;

        Ok(1)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        // the pool is shared with other sinks, so only this handle is dropped
        self.pool.take();
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct PgClaimTarget {
    pool: PgPool,
}

impl PgClaimTarget {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SinkFactory<TransformedClaim> for PgClaimTarget {
    async fn open(&self) -> anyhow::Result<Box<dyn BatchSink<TransformedClaim>>> {
        Ok(Box::new(PgClaimSink::new(self.pool.clone())))
    }
}
