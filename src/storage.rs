use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Map, Value};

/// Asynchronous, fallible key-value persistence.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>>;
    async fn set(&self, key: &str, value: Value) -> Result<()>;
}

/// In-process store; counts writes and can be told to fail them.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Value>>,
    writes: AtomicUsize,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entry(key: impl Into<String>, value: Value) -> Self {
        let store = Self::default();
        store.entries.lock().insert(key.into(), value);
        store
    }

    pub fn snapshot(&self, key: &str) -> Option<Value> {
        self.entries.lock().get(key).cloned()
    }

    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(anyhow!("memory store read failure for {key}"));
        }
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(anyhow!("memory store write failure for {key}"));
        }
        self.entries.lock().insert(key.to_string(), value);
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A single JSON object file mapping keys to values.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `<config dir>/gremlin/storage.json`, or a relative path when the
    /// platform has no config directory.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .map(|dir| dir.join("gremlin"))
            .unwrap_or_else(|| PathBuf::from(".gremlin"))
            .join("storage.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn read_map(&self) -> Result<Map<String, Value>> {
        let json = match tokio::fs::read_to_string(&self.path).await {
            Ok(json) => json,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed to read {}", self.path.display()))
            }
        };

        let value: Value = serde_json::from_str(&json)
            .with_context(|| format!("failed to parse {}", self.path.display()))?;
        match value {
            Value::Object(map) => Ok(map),
            _ => Err(anyhow!(
                "{} does not contain a JSON object",
                self.path.display()
            )),
        }
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>> {
        Ok(self.read_map().await?.remove(key))
    }

    async fn set(&self, key: &str, value: Value) -> Result<()> {
        // A corrupt file is replaced rather than blocking every later write.
        let mut map = self.read_map().await.unwrap_or_default();
        map.insert(key.to_string(), value);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("failed to create directory {}", parent.display()))?;
        }

        let json = serde_json::to_string_pretty(&Value::Object(map))
            .context("failed to serialize storage")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace {}", self.path.display()))
    }
}
