use super::{DownloadError, ObjectData, ObjectInfo, ObjectStore};
use anyhow::anyhow;
use async_trait::async_trait;
use bfd_common::checksum::md5_hex;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;

/// Failure to inject into the next `get` of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    /// Behave like a dropped connection
    Transient,
    /// Deliver the bytes with one byte flipped
    Corrupt,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, (ObjectInfo, Vec<u8>)>,
    faults: HashMap<String, VecDeque<Fault>>,
    gets: HashMap<String, usize>,
}

/// Bucket kept in memory, with optional fault injection on reads.
#[derive(Default)]
pub struct MemoryObjectStore {
    state: Mutex<State>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` under `key` with its correct MD5 in the metadata.
    pub async fn insert(&self, key: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        let bytes = bytes.into();
        let md5 = md5_hex(&bytes);
        self.insert_with_md5(key, bytes, Some(md5)).await;
    }

    pub async fn insert_with_md5(
        &self,
        key: impl Into<String>,
        bytes: impl Into<Vec<u8>>,
        md5: Option<String>,
    ) {
        let key = key.into();
        let bytes = bytes.into();
        let info = ObjectInfo {
            key: key.clone(),
            size: bytes.len() as u64,
            md5,
            last_modified: Some(Utc::now()),
        };
        self.state.lock().await.objects.insert(key, (info, bytes));
    }

    /// Queue faults for the next `get`s of `key`, consumed in order.
    pub async fn inject(&self, key: &str, faults: impl IntoIterator<Item = Fault>) {
        self.state
            .lock()
            .await
            .faults
            .entry(key.to_string())
            .or_default()
            .extend(faults);
    }

    /// How many times `get` was called for `key`.
    pub async fn get_count(&self, key: &str) -> usize {
        self.state.lock().await.gets.get(key).copied().unwrap_or(0)
    }

    pub async fn keys(&self) -> Vec<String> {
        self.state.lock().await.objects.keys().cloned().collect()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.state.lock().await.objects.contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>, DownloadError> {
        let state = self.state.lock().await;
        Ok(state
            .objects
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(_, (info, _))| ObjectInfo {
                md5: None,
                ..info.clone()
            })
            .collect())
    }

    async fn head(&self, key: &str) -> Result<Option<ObjectInfo>, DownloadError> {
        Ok(self
            .state
            .lock()
            .await
            .objects
            .get(key)
            .map(|(info, _)| info.clone()))
    }

    async fn get(&self, key: &str) -> Result<ObjectData, DownloadError> {
        let mut state = self.state.lock().await;
        *state.gets.entry(key.to_string()).or_default() += 1;
        let fault = state.faults.get_mut(key).and_then(VecDeque::pop_front);

        let (info, mut bytes) = state
            .objects
            .get(key)
            .cloned()
            .ok_or_else(|| DownloadError::NotFound {
                key: key.to_string(),
            })?;

        match fault {
            Some(Fault::Transient) => {
                return Err(DownloadError::transient(key, anyhow!("connection reset by peer")))
            },
            Some(Fault::Corrupt) => match bytes.first_mut() {
                Some(first) => *first ^= 0xff,
                None => bytes.push(0),
            },
            None => {},
        }
        Ok(ObjectData { info, bytes })
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> anyhow::Result<()> {
        self.insert(key, bytes).await;
        Ok(())
    }

    async fn copy(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().await;
        let (mut info, bytes) = state
            .objects
            .get(from)
            .cloned()
            .ok_or_else(|| anyhow!("no such object: {from}"))?;
        info.key = to.to_string();
        state.objects.insert(to.to_string(), (info, bytes));
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.state.lock().await.objects.remove(key);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_list_is_prefix_scoped_and_sorted() {
        let store = MemoryObjectStore::new();
        store.insert("Incoming/b", "2").await;
        store.insert("Incoming/a", "1").await;
        store.insert("Done/a", "1").await;

        let keys: Vec<_> = store
            .list("Incoming/")
            .await
            .unwrap()
            .into_iter()
            .map(|o| o.key)
            .collect();
        assert_eq!(keys, vec!["Incoming/a", "Incoming/b"]);
    }

    #[tokio::test]
    async fn test_faults_apply_in_order() {
        let store = MemoryObjectStore::new();
        store.insert("k", "payload").await;
        store.inject("k", [Fault::Transient, Fault::Corrupt]).await;

        assert!(store.get("k").await.unwrap_err().is_transient());
        assert_ne!(store.get("k").await.unwrap().bytes, b"payload");
        assert_eq!(store.get("k").await.unwrap().bytes, b"payload");
        assert_eq!(store.get_count("k").await, 3);
    }

    #[tokio::test]
    async fn test_rename_moves_object() {
        let store = MemoryObjectStore::new();
        store.insert("Incoming/x", "data").await;
        store.rename("Incoming/x", "Done/x").await.unwrap();

        assert!(!store.contains("Incoming/x").await);
        assert_eq!(store.get("Done/x").await.unwrap().bytes, b"data");
    }
}
