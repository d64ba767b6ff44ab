//! String-keyed persistence for service and function records.
//!
//! One namespace maps to one JSON file. Writes go through a temporary
//! file and an atomic rename so a crash never leaves a half-written
//! namespace behind.

use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::error::{BridgeError, Result};

/// A single persisted namespace of string-keyed records.
#[derive(Debug)]
pub struct KvStore {
    path: PathBuf,
    entries: Mutex<HashMap<String, Value>>,
}

impl KvStore {
    /// Opens (or creates) the namespace file at `path`. An unreadable or
    /// corrupt file is a persistence error; the caller decides whether
    /// that is fatal.
    pub fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let file = std::fs::File::open(&path).map_err(|e| {
                BridgeError::persistence(format!("cannot open store {}: {e}", path.display()))
            })?;
            serde_json::from_reader(std::io::BufReader::new(file)).map_err(|e| {
                BridgeError::persistence(format!("cannot parse store {}: {e}", path.display()))
            })?
        } else {
            HashMap::new()
        };
        Ok(KvStore {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|e| {
                BridgeError::persistence(format!("corrupt record for key {key}: {e}"))
            }),
            None => Ok(None),
        }
    }

    pub fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let encoded = serde_json::to_value(value)
            .map_err(|e| BridgeError::persistence(format!("cannot encode key {key}: {e}")))?;
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), encoded);
        self.flush(&entries)
    }

    /// Removes `key`; deleting an absent key is a no-op.
    pub fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        if entries.remove(key).is_some() {
            self.flush(&entries)?;
        }
        Ok(())
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        let entries = self.entries.lock().unwrap();
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }

    fn flush(&self, entries: &HashMap<String, Value>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BridgeError::persistence(format!("cannot create store directory: {e}"))
            })?;
        }
        let json = serde_json::to_string_pretty(entries)
            .map_err(|e| BridgeError::persistence(format!("cannot encode store: {e}")))?;
        let temp_path = self.path.with_extension("tmp");
        let mut temp = std::fs::File::create(&temp_path).map_err(|e| {
            BridgeError::persistence(format!("cannot create {}: {e}", temp_path.display()))
        })?;
        temp.write_all(json.as_bytes())
            .and_then(|_| temp.sync_all())
            .map_err(|e| BridgeError::persistence(format!("cannot write store: {e}")))?;
        std::fs::rename(&temp_path, &self.path)
            .map_err(|e| BridgeError::persistence(format!("cannot publish store: {e}")))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;
    use serde_json::json;

    #[test]
    fn test_set_get_delete_keys() {
        let dir = testutil::unique_dir("kv");
        let store = KvStore::open(dir.join("ns.json")).unwrap();
        store.set("b", &json!({"x": 1})).unwrap();
        store.set("a", &json!("hello")).unwrap();
        assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(store.get::<Value>("a").unwrap(), Some(json!("hello")));
        store.delete("a").unwrap();
        assert_eq!(store.get::<Value>("a").unwrap(), None);
        store.delete("a").unwrap(); // absent key is a no-op
    }

    #[test]
    fn test_survives_reopen() {
        let dir = testutil::unique_dir("kv");
        let path = dir.join("ns.json");
        {
            let store = KvStore::open(path.clone()).unwrap();
            store.set("k", &json!({"v": 42})).unwrap();
        }
        let store = KvStore::open(path).unwrap();
        assert_eq!(store.get::<Value>("k").unwrap(), Some(json!({"v": 42})));
    }

    #[test]
    fn test_corrupt_store_is_persistence_error() {
        let dir = testutil::unique_dir("kv");
        let path = dir.join("ns.json");
        std::fs::write(&path, "not json").unwrap();
        let err = KvStore::open(path).unwrap_err();
        assert!(matches!(err, BridgeError::Persistence(_)));
    }
}
