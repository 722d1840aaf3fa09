use super::{BatchSink, ProcessingFailure, SinkFactory};
use anyhow::Context;
use async_trait::async_trait;
use serde::Serialize;
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::debug;

/// Appends each record as one JSON line, flushed before the write returns.
pub struct JsonLinesSink<T> {
    path: PathBuf,
    writer: Option<BufWriter<tokio::fs::File>>,
    _record: PhantomData<fn(&T)>,
}

impl<T> JsonLinesSink<T> {
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;

        Ok(Self {
            path,
            writer: Some(BufWriter::new(file)),
            _record: PhantomData,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl<T> BatchSink<T> for JsonLinesSink<T>
where
    T: Serialize + Send + Sync + 'static,
{
    async fn write_one(&mut self, record: &T) -> Result<u64, ProcessingFailure> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| ProcessingFailure::new(anyhow::anyhow!("sink is closed"), 0))?;

        let mut line = serde_json::to_vec(record).map_err(|e| ProcessingFailure::new(e, 0))?;
        line.push(b'\n');

        writer
            .write_all(&line)
            .await
            .map_err(|e| ProcessingFailure::new(e, 0))?;
        writer.flush().await.map_err(|e| ProcessingFailure::new(e, 0))?;
        Ok(1)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer
            .shutdown()
            .await
            .with_context(|| format!("Failed to close {}", self.path.display()))?;
        debug!(path = %self.path.display(), "Closed JSON lines sink");
        Ok(())
    }
}

/// Opens a [`JsonLinesSink`] on the same file for every run.
#[derive(Debug, Clone)]
pub struct JsonLinesTarget {
    path: PathBuf,
}

impl JsonLinesTarget {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl<T> SinkFactory<T> for JsonLinesTarget
where
    T: Serialize + Send + Sync + 'static,
{
    async fn open(&self) -> anyhow::Result<Box<dyn BatchSink<T>>> {
        Ok(Box::new(JsonLinesSink::<T>::open(&self.path).await?))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::{json, Value};

    #[tokio::test]
    async fn test_writes_one_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("claims.ndjson");

        let mut sink = JsonLinesSink::open(&path).await.unwrap();
        let count = sink
            .write_batch(&[json!({"id": 1}), json!({"id": 2})])
            .await
            .unwrap();
        assert_eq!(count, 2);
        sink.close().await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines, vec![json!({"id": 1}), json!({"id": 2})]);
    }

    #[tokio::test]
    async fn test_reopen_appends() {
        let dir = tempfile::tempdir().unwrap();
        let target = JsonLinesTarget::new(dir.path().join("claims.ndjson"));

        for id in 0..2 {
            let mut sink: Box<dyn BatchSink<Value>> = target.open().await.unwrap();
            sink.write_one(&json!({ "id": id })).await.unwrap();
            sink.close().await.unwrap();
        }

        let contents = std::fs::read_to_string(dir.path().join("claims.ndjson")).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_close_twice_and_write_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = JsonLinesSink::open(dir.path().join("c.ndjson")).await.unwrap();

        sink.close().await.unwrap();
        sink.close().await.unwrap();

        let failure = sink.write_one(&json!({"id": 1})).await.unwrap_err();
        assert_eq!(failure.processed_count, 0);
    }
}
