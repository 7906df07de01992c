pub mod ledger;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::{DownloadError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
    Metadata,
    Ledgers,
    State,
}

impl Partition {
    pub const ALL: [Partition; 3] = [Partition::Metadata, Partition::Ledgers, Partition::State];

    pub fn dir_name(&self) -> &'static str {
        match self {
            Partition::Metadata => "metadata",
            Partition::Ledgers => "ledgers",
            Partition::State => "state",
        }
    }

    /// Keys are routed by prefix; anything unprefixed is general state.
    pub fn for_key(key: &str) -> Self {
        if key.starts_with("meta_") {
            Partition::Metadata
        } else if key.starts_with("ledger_") {
            Partition::Ledgers
        } else {
            Partition::State
        }
    }
}

#[derive(Serialize, Deserialize)]
struct StoredEntry<T> {
    data: T,
    timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
    pub partition: Partition,
    pub key: String,
    pub size: u64,
}

/// Crash-safe JSON key/value store rooted at one directory.
///
/// Every write lands in `<key>.json.tmp` first and is renamed over the
/// entry, so readers see either the previous or the new value.
pub struct StateStore {
    root: PathBuf,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl StateStore {
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let store = Self { root: root.into(), locks: Mutex::new(HashMap::new()) };
        store.create_partitions().await?;
        Ok(store)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn create_partitions(&self) -> Result<()> {
        for partition in Partition::ALL {
            let dir = self.root.join(partition.dir_name());
            tokio::fs::create_dir_all(&dir)
                .await
                .map_err(|err| DownloadError::fs(&dir, err))?;
        }
        Ok(())
    }

    fn entry_path(&self, key: &str) -> PathBuf {
        self.root
            .join(Partition::for_key(key).dir_name())
            .join(format!("{}.json", encode_key(key)))
    }

    fn key_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = match self.locks.lock() {
            Ok(locks) => locks,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(locks.entry(key.to_string()).or_default())
    }

    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;
        self.commit(key, value).await
    }

    async fn commit<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let path = self.entry_path(key);
        let mut tmp = path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let entry = StoredEntry { data: value, timestamp: Utc::now() };
        let json = serde_json::to_vec_pretty(&entry)?;

        let mut file = tokio::fs::File::create(&tmp)
            .await
            .map_err(|err| DownloadError::fs(&tmp, err))?;
        file.write_all(&json).await.map_err(|err| DownloadError::fs(&tmp, err))?;
        file.sync_all().await.map_err(|err| DownloadError::fs(&tmp, err))?;
        drop(file);

        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|err| DownloadError::fs(&path, err))?;

        debug!(key, path = %path.display(), "state entry written");
        Ok(())
    }

    async fn read_entry<T: DeserializeOwned>(&self, key: &str) -> Result<Option<StoredEntry<T>>> {
        let path = self.entry_path(key);
        let bytes = match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(DownloadError::fs(&path, err)),
        };

        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|err| DownloadError::State(format!("corrupt entry {}: {}", path.display(), err)))
    }

    /// `Ok(None)` when the key has never been written.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        Ok(self.read_entry(key).await?.map(|entry| entry.data))
    }

    pub async fn written_at(&self, key: &str) -> Result<Option<DateTime<Utc>>> {
        Ok(self.read_entry::<IgnoredAny>(key).await?.map(|entry| entry.timestamp))
    }

    pub async fn is_stale(&self, key: &str, max_age: Duration) -> bool {
        self.is_stale_at(key, max_age, Utc::now()).await
    }

    /// Missing or unreadable entries are always stale.
    pub async fn is_stale_at(&self, key: &str, max_age: Duration, now: DateTime<Utc>) -> bool {
        match self.written_at(key).await {
            Ok(Some(written)) => {
                let age = (now - written).to_std().unwrap_or(Duration::ZERO);
                age > max_age
            }
            Ok(None) => true,
            Err(err) => {
                warn!(key, error = %err, "treating unreadable entry as stale");
                true
            }
        }
    }

    /// Read-modify-write of one key under that key's lock. A missing or
    /// corrupt entry starts from `T::default()`.
    pub async fn update<T, F>(&self, key: &str, mutate: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned + Default,
        F: FnOnce(&mut T),
    {
        let lock = self.key_lock(key);
        let _guard = lock.lock().await;

        let mut value = match self.get::<T>(key).await {
            Ok(Some(value)) => value,
            Ok(None) => T::default(),
            Err(err @ DownloadError::State(_)) => {
                warn!(key, error = %err, "replacing corrupt entry");
                T::default()
            }
            Err(err) => return Err(err),
        };
        mutate(&mut value);
        self.commit(key, &value).await?;
        Ok(value)
    }

    /// Removes every entry and recreates the empty partitions.
    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(DownloadError::fs(&self.root, err)),
        }
        self.create_partitions().await
    }

    pub async fn list(&self) -> Result<Vec<EntryInfo>> {
        let mut entries = Vec::new();
        for partition in Partition::ALL {
            let dir = self.root.join(partition.dir_name());
            let mut read_dir = match tokio::fs::read_dir(&dir).await {
                Ok(read_dir) => read_dir,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(DownloadError::fs(&dir, err)),
            };

            while let Some(entry) = read_dir.next_entry().await.map_err(|err| DownloadError::fs(&dir, err))? {
                let name = entry.file_name().to_string_lossy().into_owned();
                let Some(key) = name.strip_suffix(".json") else {
                    continue;
                };
                let size = entry.metadata().await.map(|metadata| metadata.len()).unwrap_or(0);
                entries.push(EntryInfo { partition, key: decode_key(key), size });
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(entries)
    }
}

/// File name for a key. Path separators and `%` are percent-escaped so distinct
/// keys never share a file.
fn encode_key(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for c in key.chars() {
        match c {
            '%' => name.push_str("%25"),
            '/' => name.push_str("%2F"),
            '\\' => name.push_str("%5C"),
            c => name.push(c),
        }
    }
    name
}

fn decode_key(name: &str) -> String {
    name.replace("%2F", "/").replace("%5C", "\\").replace("%25", "%")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    fn sample(name: &str, count: u32) -> Sample {
        Sample { name: name.to_string(), count }
    }

    #[tokio::test]
    async fn get_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();
        assert_eq!(store.get::<Sample>("nothing").await.unwrap(), None);
        assert!(store.is_stale("nothing", Duration::from_secs(60)).await);
    }

    #[tokio::test]
    async fn entries_are_routed_to_partitions() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();

        store.set("meta_course", &sample("m", 1)).await.unwrap();
        store.set("ledger_course", &sample("l", 2)).await.unwrap();
        store.set("last_run_course", &sample("s", 3)).await.unwrap();
        store.set("series/with/slashes", &sample("x", 4)).await.unwrap();

        assert!(dir.path().join("metadata/meta_course.json").exists());
        assert!(dir.path().join("ledgers/ledger_course.json").exists());
        assert!(dir.path().join("state/last_run_course.json").exists());
        assert!(dir.path().join("state/series%2Fwith%2Fslashes.json").exists());
        assert_eq!(store.get::<Sample>("series/with/slashes").await.unwrap(), Some(sample("x", 4)));

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(dir.path().join("ledgers/ledger_course.json")).unwrap()).unwrap();
        assert_eq!(raw["data"]["count"], 2);
        assert!(raw["timestamp"].is_string());

        let listed = store.list().await.unwrap();
        let keys = listed.iter().map(|entry| entry.key.as_str()).collect::<Vec<_>>();
        assert_eq!(keys, vec!["last_run_course", "ledger_course", "meta_course", "series/with/slashes"]);
        assert_eq!(listed[1].partition, Partition::Ledgers);
    }

    #[tokio::test]
    async fn keys_with_separators_keep_their_own_files() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();

        let keys = ["ledger_a/b", "ledger_a_b", "ledger_a\\b", "ledger_a%2Fb"];
        for (count, key) in keys.iter().enumerate() {
            store.set(key, &sample(key, count as u32)).await.unwrap();
        }

        for (count, key) in keys.iter().enumerate() {
            assert_eq!(store.get::<Sample>(key).await.unwrap(), Some(sample(key, count as u32)));
        }
        let mut listed = store.list().await.unwrap().into_iter().map(|entry| entry.key).collect::<Vec<_>>();
        listed.sort();
        let mut expected = keys.iter().map(|key| key.to_string()).collect::<Vec<_>>();
        expected.sort();
        assert_eq!(listed, expected);
    }

    #[tokio::test]
    async fn interrupted_write_keeps_previous_value() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();
        store.set("ledger_a", &sample("old", 1)).await.unwrap();

        // a crash after writing part of the temp file but before the rename
        let tmp = dir.path().join("ledgers/ledger_a.json.tmp");
        std::fs::write(&tmp, b"{\"data\": {\"name\": \"ne").unwrap();
        assert_eq!(store.get::<Sample>("ledger_a").await.unwrap(), Some(sample("old", 1)));

        std::fs::write(dir.path().join("ledgers/ledger_b.json.tmp"), b"{\"da").unwrap();
        assert_eq!(store.get::<Sample>("ledger_b").await.unwrap(), None);
        assert_eq!(store.list().await.unwrap().len(), 1);

        // the next commit replaces the stray temp file
        store.set("ledger_a", &sample("new", 2)).await.unwrap();
        assert_eq!(store.get::<Sample>("ledger_a").await.unwrap(), Some(sample("new", 2)));
        assert!(!tmp.exists());
    }

    #[tokio::test]
    async fn staleness_follows_write_time() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();
        store.set("meta_x", &sample("x", 1)).await.unwrap();

        let t0 = store.written_at("meta_x").await.unwrap().unwrap();
        let max_age = Duration::from_secs(1);
        assert!(!store.is_stale_at("meta_x", max_age, t0 + TimeDelta::milliseconds(500)).await);
        assert!(store.is_stale_at("meta_x", max_age, t0 + TimeDelta::milliseconds(1500)).await);
    }

    #[tokio::test]
    async fn corrupt_entry_is_an_error_and_stale() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::open(dir.path()).await.unwrap();
        std::fs::write(dir.path().join("state/broken.json"), b"not json").unwrap();

        assert!(matches!(store.get::<Sample>("broken").await, Err(DownloadError::State(_))));
        assert!(store.is_stale("broken", Duration::from_secs(3600)).await);

        let repaired = store.update("broken", |value: &mut Sample| value.count += 1).await.unwrap();
        assert_eq!(repaired, sample("", 1));
    }

    #[tokio::test]
    async fn concurrent_updates_of_one_key_are_serialized() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(StateStore::open(dir.path()).await.unwrap());

        let mut tasks = Vec::new();
        for _ in 0..25 {
            let store = Arc::clone(&store);
            tasks.push(tokio::spawn(async move {
                store.update("ledger_counter", |value: &mut Sample| value.count += 1).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let value = store.get::<Sample>("ledger_counter").await.unwrap().unwrap();
        assert_eq!(value.count, 25);
    }

    #[tokio::test]
    async fn clear_removes_everything() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(".cache");
        let store = StateStore::open(&root).await.unwrap();
        store.set("meta_a", &sample("a", 1)).await.unwrap();
        store.set("ledger_a", &sample("a", 1)).await.unwrap();

        store.clear().await.unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert_eq!(store.get::<Sample>("meta_a").await.unwrap(), None);
        for partition in Partition::ALL {
            assert!(root.join(partition.dir_name()).is_dir());
        }
    }
}
