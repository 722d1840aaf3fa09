//! Changes the pipeline could not apply
//!
//! A rejected change is recorded here and the stream moves on. Letters that
//! carry a sequence number are offered again at the start of later runs and
//! removed once they load. Raw message bodies are never stored, only where
//! the message was and why it was rejected.

use super::message::ClaimType;
use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub claim_type: ClaimType,
    pub sequence: Option<i64>,
    /// Identifies the message within its source; unique per claim type
    pub location: String,
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        claim_type: ClaimType,
        sequence: Option<i64>,
        location: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            claim_type,
            sequence,
            location: location.into(),
            reason: reason.into(),
            recorded_at: Utc::now(),
        }
    }

    /// Location used for changes that decoded but were rejected later.
    pub fn sequence_location(sequence: i64) -> String {
        format!("sequence {sequence}")
    }
}

#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Returns `false` when a letter for the same location already exists.
    async fn record(&self, letter: &DeadLetter) -> anyhow::Result<bool>;

    /// Outstanding letters of `claim_type`, lowest sequence first.
    async fn unresolved(&self, claim_type: ClaimType) -> anyhow::Result<Vec<DeadLetter>>;

    /// Remove a letter once its change has loaded.
    async fn resolve(&self, claim_type: ClaimType, location: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Default)]
pub struct MemoryDeadLetterStore {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn letters(&self) -> Vec<DeadLetter> {
        self.letters.lock().await.clone()
    }
}

#[async_trait]
impl DeadLetterStore for MemoryDeadLetterStore {
    async fn record(&self, letter: &DeadLetter) -> anyhow::Result<bool> {
        let mut letters = self.letters.lock().await;
        let exists = letters
            .iter()
            .any(|l| l.claim_type == letter.claim_type && l.location == letter.location);
        if !exists {
            letters.push(letter.clone());
        }
        Ok(!exists)
    }

    async fn unresolved(&self, claim_type: ClaimType) -> anyhow::Result<Vec<DeadLetter>> {
        let mut found: Vec<DeadLetter> = self
            .letters
            .lock()
            .await
            .iter()
            .filter(|l| l.claim_type == claim_type)
            .cloned()
            .collect();
        found.sort_by_key(|l| (l.sequence.is_none(), l.sequence, l.location.clone()));
        Ok(found)
    }

    async fn resolve(&self, claim_type: ClaimType, location: &str) -> anyhow::Result<bool> {
        let mut letters = self.letters.lock().await;
        let before = letters.len();
        letters.retain(|l| !(l.claim_type == claim_type && l.location == location));
        Ok(letters.len() < before)
    }
}

/// Letters kept in the `rda_message_errors` table.
#[derive(Debug, Clone)]
pub struct PgDeadLetterStore {
    pool: PgPool,
}

impl PgDeadLetterStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DeadLetterStore for PgDeadLetterStore {
    async fn record(&self, letter: &DeadLetter) -> anyhow::Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO rda_message_errors (claim_type, location, sequence_number, reason, recorded_at)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (claim_type, location) DO NOTHING
            "#,
        )
        .bind(letter.claim_type.as_str())
        .bind(&letter.location)
        .bind(letter.sequence)
        .bind(&letter.reason)
        .bind(letter.recorded_at)
        .execute(&self.pool)
        .await
        .context("Failed to record dead letter")?;
        Ok(result.rows_affected() == 1)
    }

    async fn unresolved(&self, claim_type: ClaimType) -> anyhow::Result<Vec<DeadLetter>> {
        let rows: Vec<(Option<i64>, String, String, DateTime<Utc>)> = sqlx::query_as(
            r#"
            SELECT sequence_number, location, reason, recorded_at
            FROM rda_message_errors
            WHERE claim_type = $1
            ORDER BY sequence_number NULLS LAST, location
            "#,
        )
        .bind(claim_type.as_str())
        .fetch_all(&self.pool)
        .await
        .context("Failed to read dead letters")?;

        Ok(rows
            .into_iter()
            .map(|(sequence, location, reason, recorded_at)| DeadLetter {
                claim_type,
                sequence,
                location,
                reason,
                recorded_at,
            })
            .collect())
    }

    async fn resolve(&self, claim_type: ClaimType, location: &str) -> anyhow::Result<bool> {
        let result =
            sqlx::query("DELETE FROM rda_message_errors WHERE claim_type = $1 AND location = $2")
                .bind(claim_type.as_str())
                .bind(location)
                .execute(&self.pool)
                .await
                .context("Failed to resolve dead letter")?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_records_once_per_location() {
        let store = MemoryDeadLetterStore::new();
        let letter = DeadLetter::new(ClaimType::Fiss, None, "fiss.ndjson:4", "bad json");

        assert!(store.record(&letter).await.unwrap());
        assert!(!store.record(&letter).await.unwrap());
        // same location on another stream is a different letter
        assert!(store
            .record(&DeadLetter { claim_type: ClaimType::Mcs, ..letter.clone() })
            .await
            .unwrap());
        assert_eq!(store.letters().await.len(), 2);
    }

    #[tokio::test]
    async fn test_memory_store_orders_and_resolves() {
        let store = MemoryDeadLetterStore::new();
        for letter in [
            DeadLetter::new(ClaimType::Fiss, None, "fiss.ndjson:1", "bad json"),
            DeadLetter::new(ClaimType::Fiss, Some(9), DeadLetter::sequence_location(9), "x"),
            DeadLetter::new(ClaimType::Fiss, Some(3), DeadLetter::sequence_location(3), "y"),
        ] {
            store.record(&letter).await.unwrap();
        }

        let sequences: Vec<_> = store
            .unresolved(ClaimType::Fiss)
            .await
            .unwrap()
            .iter()
            .map(|l| l.sequence)
            .collect();
        assert_eq!(sequences, vec![Some(3), Some(9), None]);
        assert!(store.unresolved(ClaimType::Mcs).await.unwrap().is_empty());

        assert!(store.resolve(ClaimType::Fiss, "sequence 3").await.unwrap());
        assert!(!store.resolve(ClaimType::Fiss, "sequence 3").await.unwrap());
        assert_eq!(store.unresolved(ClaimType::Fiss).await.unwrap().len(), 2);
    }
}
