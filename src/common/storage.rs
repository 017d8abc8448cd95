//! Key-value storage abstraction backing the orchestrator records
//!
//! Supports an in-memory backend and, behind the `sled-backend` feature, sled.
//! Values are JSON documents; keys are `/`-separated paths.

use crate::common::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Trait for key-value storage backends
pub trait KVStore: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    /// Keys starting with `prefix`, in lexicographic order
    fn keys(&self, prefix: &str) -> Result<Vec<String>>;
}

/// In-memory store (default)
pub struct MemStore {
    map: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemStore {
    pub fn new() -> Self {
        Self {
            map: Mutex::new(BTreeMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>>> {
        self.map
            .lock()
            .map_err(|e| Error::Storage(format!("memory store poisoned: {}", e)))
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KVStore for MemStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.lock()?.get(key).cloned())
    }
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.lock()?.insert(key.to_string(), value);
        Ok(())
    }
    fn delete(&self, key: &str) -> Result<()> {
        self.lock()?.remove(key);
        Ok(())
    }
    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .lock()?
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }
}

/// Sled store
#[cfg(feature = "sled-backend")]
pub struct SledStore {
    db: sled::Db,
}

#[cfg(feature = "sled-backend")]
impl SledStore {
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        let db = sled::open(path).map_err(|e| Error::Storage(e.to_string()))?;
        Ok(Self { db })
    }
}

#[cfg(feature = "sled-backend")]
impl KVStore for SledStore {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db
            .get(key)
            .map(|v| v.map(|ivec| ivec.to_vec()))
            .map_err(|e| Error::Storage(e.to_string()))
    }
    fn put(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.db
            .insert(key, value)
            .map(|_| ())
            .map_err(|e| Error::Storage(e.to_string()))
    }
    fn delete(&self, key: &str) -> Result<()> {
        self.db
            .remove(key)
            .map(|_| ())
            .map_err(|e| Error::Storage(e.to_string()))
    }
    fn keys(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (k, _) = item.map_err(|e| Error::Storage(e.to_string()))?;
            let key = String::from_utf8(k.to_vec())
                .map_err(|_| Error::Storage("invalid UTF-8 key".into()))?;
            keys.push(key);
        }
        Ok(keys)
    }
}

/// Shared store handle with JSON helpers
#[derive(Clone)]
pub struct Storage {
    backend: Arc<dyn KVStore>,
}

impl Storage {
    pub fn new_memory() -> Self {
        Self {
            backend: Arc::new(MemStore::new()),
        }
    }
    #[cfg(feature = "sled-backend")]
    pub fn new_sled(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            backend: Arc::new(SledStore::open(path)?),
        })
    }
    pub fn with_backend(backend: Arc<dyn KVStore>) -> Self {
        Self { backend }
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.backend.get(key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn put_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        self.backend.put(key, serde_json::to_vec(value)?)
    }

    pub fn delete(&self, key: &str) -> Result<()> {
        self.backend.delete(key)
    }

    /// Every value stored under `prefix`
    pub fn list_json<T: DeserializeOwned>(&self, prefix: &str) -> Result<Vec<T>> {
        let mut values = Vec::new();
        for key in self.backend.keys(prefix)? {
            if let Some(value) = self.get_json(&key)? {
                values.push(value);
            }
        }
        Ok(values)
    }
}
