//! Postgres connection pool and the tables the pipeline writes

use anyhow::Context;
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;

pub const DEFAULT_MAX_CONNECTIONS: u32 = 5;

pub async fn create_pool(url: &str, max_connections: u32) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(max_connections)
        .acquire_timeout(Duration::from_secs(30))
        .idle_timeout(Duration::from_secs(600))
        .connect(url)
        .await
        .context("Failed to connect to database")?;

    info!(max_connections, "Database connection pool created");
    Ok(pool)
}

/// Create the claim, progress and dead letter tables if they are missing.
///
/// Schema changes beyond this are owned by the migration tooling.
pub async fn ensure_schema(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rda_claims (
            claim_id        TEXT PRIMARY KEY,
            claim_type      TEXT NOT NULL,
            sequence_number BIGINT NOT NULL,
            mbi_hash        TEXT,
            last_updated    TIMESTAMPTZ,
            payload         JSONB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create rda_claims")?;

    // tables created before change timestamps became optional
    sqlx::query("ALTER TABLE rda_claims ALTER COLUMN last_updated DROP NOT NULL")
        .execute(pool)
        .await
        .context("Failed to relax rda_claims.last_updated")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rda_progress (
            claim_type    TEXT PRIMARY KEY,
            last_sequence BIGINT NOT NULL,
            updated_at    TIMESTAMPTZ NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create rda_progress")?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rda_message_errors (
            claim_type      TEXT NOT NULL,
            location        TEXT NOT NULL,
            sequence_number BIGINT,
            reason          TEXT NOT NULL,
            recorded_at     TIMESTAMPTZ NOT NULL,
            PRIMARY KEY (claim_type, location)
        )
        "#,
    )
    .execute(pool)
    .await
    .context("Failed to create rda_message_errors")?;

    Ok(())
}

pub async fn health_check(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("SELECT 1")
        .execute(pool)
        .await
        .context("Database health check failed")?;
    Ok(())
}
