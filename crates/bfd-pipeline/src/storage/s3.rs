use super::config::StorageConfig;
use super::{DownloadError, ObjectData, ObjectInfo, ObjectStore, MD5_METADATA_KEY};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use bfd_common::checksum::md5_hex;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, error::DisplayErrorContext, primitives::ByteStream, Client};
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument};

/// S3 (or S3-compatible) bucket
#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

fn to_chrono(dt: &aws_sdk_s3::primitives::DateTime) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())
}

impl S3ObjectStore {
    pub async fn new(config: StorageConfig) -> anyhow::Result<Self> {
        debug!(?config, "Initializing S3 object store");

        let mut builder = match config.static_credentials() {
            Some((access, secret)) => aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .credentials_provider(Credentials::new(access, secret, None, None, "bfd-pipeline"))
                .region(Region::new(config.region.clone())),
            None => {
                let shared = aws_config::defaults(BehaviorVersion::latest())
                    .region(Region::new(config.region.clone()))
                    .load()
                    .await;
                aws_sdk_s3::config::Builder::from(&shared)
            },
        };
        builder = builder.force_path_style(config.path_style);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());
        info!(bucket = %config.bucket, "S3 object store ready");

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, DownloadError> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| {
                    DownloadError::transient(prefix, anyhow!("{}", DisplayErrorContext(&e)))
                })?;

            for object in response.contents() {
                let Some(key) = object.key() else { continue };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    md5: None,
                    last_modified: object.last_modified().and_then(to_chrono),
                });
            }

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                },
                _ => break,
            }
        }

        objects.sort_by(|a, b| a.key.cmp(&b.key));
        debug!(count = objects.len(), "Listed objects");
        Ok(objects)
    }

    #[instrument(skip(self))]
    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, DownloadError> {
        let response = match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => {
                return Ok(None)
            },
            Err(e) => {
                return Err(DownloadError::transient(
                    key,
                    anyhow!("{}", DisplayErrorContext(&e)),
                ))
            },
        };

        Ok(Some(ObjectInfo {
            key: key.to_string(),
            size: response.content_length().unwrap_or(0).max(0) as u64,
            md5: response
                .metadata()
                .and_then(|m| m.get(MD5_METADATA_KEY))
                .cloned(),
            last_modified: response.last_modified().and_then(to_chrono),
        }))
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<ObjectData, DownloadError> {
        let response = match self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.as_service_error().is_some_and(|se| se.is_no_such_key()) => {
                return Err(DownloadError::NotFound {
                    key: key.to_string(),
                })
            },
            Err(e) => {
                return Err(DownloadError::transient(
                    key,
                    anyhow!("{}", DisplayErrorContext(&e)),
                ))
            },
        };

        let md5 = response
            .metadata()
            .and_then(|m| m.get(MD5_METADATA_KEY))
            .cloned();
        let last_modified = response.last_modified().and_then(to_chrono);

        let bytes = response
            .body
            .collect()
            .await
            .map_err(|e| DownloadError::transient(key, anyhow!(e).context("Failed to read S3 response body")))?
            .into_bytes()
            .to_vec();

        debug!(bytes = bytes.len(), "Downloaded object");
        Ok(ObjectData {
            info: ObjectInfo {
                key: key.to_string(),
                size: bytes.len() as u64,
                md5,
                last_modified,
            },
            bytes,
        })
    }

    #[instrument(skip(self, bytes))]
    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        let md5 = md5_hex(&bytes);
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .metadata(MD5_METADATA_KEY, md5)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(&e)))
            .with_context(|| format!("Failed to upload {key}"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn copy(&self, from: &str, to: &str) -> anyhow::Result<()> {
        self.client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, from))
            .key(to)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(&e)))
            .with_context(|| format!("Failed to copy {from} to {to}"))?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("{}", DisplayErrorContext(&e)))
            .with_context(|| format!("Failed to delete {key}"))?;
        Ok(())
    }
}
