use super::{BatchSink, ProcessingFailure, SinkFactory};
use anyhow::anyhow;
use async_trait::async_trait;
use std::sync::{Arc, Mutex, PoisonError};

type FailWhen<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

/// Collects committed records in memory. Clones share the same contents.
pub struct MemorySink<T> {
    committed: Arc<Mutex<Vec<T>>>,
    fail_when: Option<FailWhen<T>>,
    closed: bool,
}

impl<T> Clone for MemorySink<T> {
    fn clone(&self) -> Self {
        Self {
            committed: Arc::clone(&self.committed),
            fail_when: self.fail_when.clone(),
            closed: false,
        }
    }
}

impl<T> Default for MemorySink<T> {
    fn default() -> Self {
        Self {
            committed: Arc::new(Mutex::new(Vec::new())),
            fail_when: None,
            closed: false,
        }
    }
}

impl<T: Clone> MemorySink<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject any record matching `predicate`.
    pub fn failing_when(predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            fail_when: Some(Arc::new(predicate)),
            ..Self::default()
        }
    }

    pub fn committed(&self) -> Vec<T> {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[async_trait]
impl<T> BatchSink<T> for MemorySink<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn write_one(&mut self, record: &T) -> Result<u64, ProcessingFailure> {
        if self.closed {
            return Err(ProcessingFailure::new(anyhow!("sink is closed"), 0));
        }
        if self.fail_when.as_ref().is_some_and(|f| f(record)) {
            return Err(ProcessingFailure::new(anyhow!("record rejected"), 0));
        }
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(record.clone());
        Ok(1)
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[async_trait]
impl<T> SinkFactory<T> for MemorySink<T>
where
    T: Clone + Send + Sync + 'static,
{
    async fn open(&self) -> anyhow::Result<Box<dyn BatchSink<T>>> {
        Ok(Box::new(self.clone()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fail_fast_in_batch() {
        let mut sink = MemorySink::failing_when(|r: &&str| *r == "r2");
        let failure = sink.write_batch(&["r1", "r2", "r3"]).await.unwrap_err();

        assert_eq!(failure.processed_count, 1);
        assert_eq!(sink.committed(), vec!["r1"]);
    }

    #[tokio::test]
    async fn test_clones_share_contents() {
        let target: MemorySink<u32> = MemorySink::new();
        let mut sink = target.open().await.unwrap();
        sink.write_batch(&[1, 2, 3]).await.unwrap();
        sink.close().await.unwrap();
        sink.close().await.unwrap();

        assert_eq!(target.committed(), vec![1, 2, 3]);
        assert!(!target.is_closed());
    }

    #[tokio::test]
    async fn test_closed_sink_rejects_writes() {
        let mut sink: MemorySink<u32> = MemorySink::new();
        sink.close().await.unwrap();
        assert!(sink.is_closed());
        assert!(sink.write_one(&1).await.is_err());
    }
}
