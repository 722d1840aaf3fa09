//! Assembles a [`PipelineManager`] with the jobs enabled in [`AppConfig`]

use crate::ccw::{CcwRifLoadJob, DataSetQueue, StagingDirProcessor};
use crate::config::AppConfig;
use crate::db;
use crate::jobs::{JobRecordStore, PipelineManager};
use crate::rda::{
    ClaimChangeSource, ClaimTransformer, DeadLetterStore, MemoryDeadLetterStore,
    MemoryProgressStore, NdjsonClaimSource, PgDeadLetterStore, PgProgressStore, ProgressStore,
    RdaLoadJob, RdaLoadOptions, TransformedClaim,
};
use crate::sink::{JsonLinesTarget, PgClaimTarget, SinkFactory};
use crate::storage::{RetryPolicy, S3ObjectStore};
use anyhow::Context;
use bfd_common::hashing::{CachedIdHasher, IdHasher};
use std::sync::Arc;
use tracing::{info, warn};

/// Build the manager and register every enabled job. Nothing runs until
/// [`PipelineManager::start`].
pub async fn build_pipeline(config: &AppConfig) -> anyhow::Result<PipelineManager> {
    config.validate()?;

    let store = Arc::new(JobRecordStore::new());
    let manager = PipelineManager::new(store, config.manager.clone());

    if config.ccw.enabled {
        manager.register_job(Arc::new(ccw_job(config).await?)).await?;
        info!(bucket = %config.storage.bucket, "CCW RIF loading enabled");
    }

    if config.rda.enabled {
        for job in rda_jobs(config).await? {
            manager.register_job(Arc::new(job)).await?;
        }
        info!(claim_types = ?config.rda.claim_types, "Claims-change loading enabled");
    }

    if !config.ccw.enabled && !config.rda.enabled {
        warn!("No pipeline jobs enabled; set CCW_ENABLED or RDA_ENABLED");
    }

    Ok(manager)
}

async fn ccw_job(config: &AppConfig) -> anyhow::Result<CcwRifLoadJob> {
    let store = S3ObjectStore::new(config.storage.clone()).await?;
    let queue = DataSetQueue::new(
        Arc::new(store),
        &config.ccw.temp_dir,
        RetryPolicy::with_attempts(config.ccw.download_attempts),
        config.ccw.max_manifest_age,
    );
    let processor = Arc::new(StagingDirProcessor::new(&config.ccw.staging_dir));
    Ok(CcwRifLoadJob::new(queue, processor, config.ccw.run_interval))
}

/// One load job per configured claim type, sharing the hasher cache and
/// the stores.
async fn rda_jobs(config: &AppConfig) -> anyhow::Result<Vec<RdaLoadJob>> {
    let rda = &config.rda;
    let claim_types = rda.parsed_claim_types()?;
    let source_dir = rda
        .source_dir
        .as_ref()
        .context("RDA_SOURCE_DIR is required when RDA_ENABLED is set")?;

    let hasher = IdHasher::from_hex_pepper(&config.hasher.pepper, config.hasher.iterations)?;
    let transformer = ClaimTransformer::new(Arc::new(CachedIdHasher::new(
        hasher,
        config.hasher.cache_size,
    )));
    let source: Arc<dyn ClaimChangeSource> = Arc::new(NdjsonClaimSource::new(source_dir));

    let (sinks, progress, dead_letters): (
        Arc<dyn SinkFactory<TransformedClaim>>,
        Arc<dyn ProgressStore>,
        Arc<dyn DeadLetterStore>,
    ) = match &rda.database_url {
        Some(url) => {
            let pool = db::create_pool(url, db::DEFAULT_MAX_CONNECTIONS).await?;
            db::ensure_schema(&pool).await?;
            (
                Arc::new(PgClaimTarget::new(pool.clone())),
                Arc::new(PgProgressStore::new(pool.clone())),
                Arc::new(PgDeadLetterStore::new(pool)),
            )
        },
        None => {
            warn!(
                output = %rda.output_file.display(),
                "No DATABASE_URL; writing JSON lines and keeping progress and dead letters in memory only"
            );
            (
                Arc::new(JsonLinesTarget::new(&rda.output_file)),
                Arc::new(MemoryProgressStore::new()),
                Arc::new(MemoryDeadLetterStore::new()),
            )
        },
    };

    Ok(claim_types
        .into_iter()
        .map(|claim_type| {
            RdaLoadJob::new(
                RdaLoadOptions {
                    batch_size: rda.batch_size,
                    starting_sequence: rda.starting_sequence,
                    run_interval: rda.run_interval,
                    retry: RetryPolicy::with_attempts(rda.retry_attempts),
                    replay_dead_letters: rda.replay_dead_letters,
                    ..RdaLoadOptions::new(claim_type)
                },
                Arc::clone(&source),
                transformer.clone(),
                Arc::clone(&sinks),
                Arc::clone(&progress),
                Arc::clone(&dead_letters),
            )
        })
        .collect())
}
