//! Queue of CCW data sets waiting in the bucket
//!
//! Only the oldest eligible manifest is ever offered. If its files have not
//! all landed yet nothing is offered, so data sets always load in arrival
//! order.

use super::event::{LocalRifFile, RifFile, RifFilesEvent};
use super::manifest::{DataSetManifest, ManifestKey, INCOMING_PREFIX, SYNTHETIC_INCOMING_PREFIX};
use crate::error::JobError;
use crate::jobs::JobContext;
use crate::storage::{download_verified, ObjectStore, RetryPolicy};
use chrono::{DateTime, Duration, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};

/// A manifest chosen for loading.
#[derive(Debug, Clone)]
pub struct PendingDataSet {
    pub key: ManifestKey,
    pub manifest: DataSetManifest,
}

pub struct DataSetQueue {
    store: Arc<dyn ObjectStore>,
    temp_dir: PathBuf,
    retry: RetryPolicy,
    max_manifest_age: Duration,
}

impl DataSetQueue {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        temp_dir: impl Into<PathBuf>,
        retry: RetryPolicy,
        max_manifest_age: Duration,
    ) -> Self {
        Self {
            store,
            temp_dir: temp_dir.into(),
            retry,
            max_manifest_age,
        }
    }

    /// Every parsable manifest in the incoming locations, oldest first.
    ///
    /// Manifests that cannot be downloaded intact or fail to parse are logged
    /// and left where they are.
    pub async fn list_manifests(&self) -> Result<Vec<PendingDataSet>, JobError> {
        let mut pending = Vec::new();

        for prefix in [INCOMING_PREFIX, SYNTHETIC_INCOMING_PREFIX] {
            let listing = self.store.list(&format!("{prefix}/")).await?;
            for key in listing.iter().filter_map(|o| ManifestKey::parse(&o.key)) {
                // `Incoming/` never lists synthetic keys, but a bare prefix match could
                if key.prefix != prefix {
                    continue;
                }
                let data = match download_verified(self.store.as_ref(), &key.key, &self.retry).await {
                    Ok(data) => data,
                    Err(e) => {
                        error!(key = %key.key, error = %e, "Skipping manifest that could not be downloaded");
                        continue;
                    },
                };
                match DataSetManifest::parse_bytes(&data.bytes) {
                    Ok(manifest) => pending.push(PendingDataSet { key, manifest }),
                    Err(e) => error!(key = %key.key, error = %format!("{e:#}"), "Skipping unreadable manifest"),
                }
            }
        }

        pending.sort_by_key(|p| p.manifest.id);
        Ok(pending)
    }

    /// The data set to load next, if one is ready as of `now`.
    #[instrument(skip(self))]
    pub async fn next_ready(&self, now: DateTime<Utc>) -> Result<Option<PendingDataSet>, JobError> {
        let oldest_allowed = now - self.max_manifest_age;

        let candidate = self.list_manifests().await?.into_iter().find(|p| {
            let ts = p.manifest.id.timestamp;
            if ts > now {
                debug!(manifest = %p.manifest.id, "Skipping manifest from the future");
                false
            } else if ts < oldest_allowed {
                debug!(manifest = %p.manifest.id, "Skipping expired manifest");
                false
            } else {
                true
            }
        });

        let Some(candidate) = candidate else {
            return Ok(None);
        };

        for entry in &candidate.manifest.entries {
            let entry_key = candidate.key.entry_key(&entry.name);
            if self.store.head(&entry_key).await?.is_none() {
                info!(
                    manifest = %candidate.manifest.id,
                    missing = %entry_key,
                    "Data set not ready yet"
                );
                return Ok(None);
            }
        }

        Ok(Some(candidate))
    }

    /// Download and verify every entry, returning the ordered file group.
    ///
    /// Files already written are removed if a later download fails or the job
    /// is cancelled part way.
    pub async fn download(
        &self,
        ctx: &JobContext,
        pending: &PendingDataSet,
    ) -> Result<RifFilesEvent, JobError> {
        let dir = self.temp_dir.join(sanitize(&pending.key.timestamp_text));
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| JobError::Other(anyhow::Error::new(e).context(format!("Failed to create {}", dir.display()))))?;

        let mut files: Vec<Arc<dyn RifFile>> = Vec::with_capacity(pending.manifest.entries.len());
        for entry in &pending.manifest.entries {
            let fetched = match ctx.checkpoint() {
                Ok(()) => self.fetch_entry(&dir, pending, &entry.name).await,
                Err(e) => Err(e),
            };
            match fetched {
                Ok(path) => files.push(Arc::new(LocalRifFile::new(&entry.name, entry.file_type, path))),
                Err(e) => {
                    files.iter().for_each(|f| f.cleanup());
                    return Err(e);
                },
            }
        }

        Ok(RifFilesEvent::new(
            pending.manifest.id.timestamp,
            pending.manifest.synthetic || pending.key.is_synthetic(),
            files,
        ))
    }

    async fn fetch_entry(
        &self,
        dir: &Path,
        pending: &PendingDataSet,
        name: &str,
    ) -> Result<PathBuf, JobError> {
        let file_name = Path::new(name)
            .file_name()
            .ok_or_else(|| JobError::Unsupported(format!("invalid entry name in manifest: {name}")))?;
        let key = pending.key.entry_key(name);

        let data = download_verified(self.store.as_ref(), &key, &self.retry).await?;
        let path = dir.join(file_name);
        tokio::fs::write(&path, &data.bytes)
            .await
            .map_err(|e| JobError::Other(anyhow::Error::new(e).context(format!("Failed to write {}", path.display()))))?;

        debug!(%key, bytes = data.bytes.len(), path = %path.display(), "Downloaded data set entry");
        Ok(path)
    }

    /// Move a loaded data set to the done location.
    ///
    /// Best effort: the data is already loaded, so failures are only logged.
    pub async fn mark_done(&self, pending: &PendingDataSet) {
        let mut names: Vec<String> = pending.manifest.entries.iter().map(|e| e.name.clone()).collect();
        // manifest last, so a half-moved set is still listed
        names.push(pending.key.manifest_file_name());

        for name in names {
            let from = pending.key.entry_key(&name);
            let to = pending.key.done_key(&name);
            if let Err(e) = self.store.rename(&from, &to).await {
                warn!(%from, %to, error = %format!("{e:#}"), "Failed to move object to done location");
            }
        }
        info!(manifest = %pending.manifest.id, "Data set moved to done");
    }
}

fn sanitize(segment: &str) -> String {
    segment
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}
