//! An in-memory `StorageBackend`, backed by a `DashMap`.
//!
//! This is the one concrete storage implementation the core ships: a
//! reference implementation of the storage contract used by tests, the
//! end-to-end scenarios in §8, and as a trivial local/dev backend. It is
//! not a stand-in for the SQL/object-store/vector-DB backends the spec
//! explicitly keeps out of scope (§1) — those are left to external crates
//! implementing `StorageBackend`.

use std::collections::HashMap;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::StorageError;
use crate::storage::StorageBackend;

#[derive(Default)]
pub struct MemoryStorage {
    name: String,
    documents: DashMap<String, Value>,
    /// When set, every `save` call fails — used to simulate a broken
    /// storage backend in tests (§8 scenario 4, "partial storage
    /// failure").
    pub always_fail: bool,
}

impl MemoryStorage {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: DashMap::new(),
            always_fail: false,
        }
    }

    pub fn failing(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            documents: DashMap::new(),
            always_fail: true,
        }
    }

    pub fn contains(&self, uuid: &str) -> bool {
        self.documents.contains_key(uuid)
    }

    pub fn len(&self) -> usize {
        self.documents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.documents.is_empty()
    }
}

#[async_trait]
impl StorageBackend for MemoryStorage {
    fn name(&self) -> &str {
        &self.name
    }

    async fn save(
        &self,
        uuid: &str,
        document: &Value,
        _options: &HashMap<String, Value>,
    ) -> Result<(), StorageError> {
        if self.always_fail {
            return Err(StorageError(format!(
                "storage '{}' is configured to always fail",
                self.name
            )));
        }
        self.documents.insert(uuid.to_string(), document.clone());
        Ok(())
    }

    async fn get(
        &self,
        uuid: &str,
        _options: &HashMap<String, Value>,
    ) -> Result<Option<Value>, StorageError> {
        if self.always_fail {
            return Err(StorageError(format!(
                "storage '{}' is configured to always fail",
                self.name
            )));
        }
        Ok(self.documents.get(uuid).map(|v| v.clone()))
    }

    async fn delete(
        &self,
        uuid: &str,
        _options: &HashMap<String, Value>,
    ) -> Result<(), StorageError> {
        if self.always_fail {
            return Err(StorageError(format!(
                "storage '{}' is configured to always fail",
                self.name
            )));
        }
        self.documents.remove(uuid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_then_get_round_trips() {
        let storage = MemoryStorage::new("test");
        let doc = serde_json::json!({"uuid": "U1"});
        storage.save("U1", &doc, &HashMap::new()).await.unwrap();
        let got = storage.get("U1", &HashMap::new()).await.unwrap();
        assert_eq!(got, Some(doc));
    }

    #[tokio::test]
    async fn failing_backend_errors_on_every_call() {
        let storage = MemoryStorage::failing("broken");
        let doc = serde_json::json!({});
        assert!(storage.save("U1", &doc, &HashMap::new()).await.is_err());
        assert!(storage.get("U1", &HashMap::new()).await.is_err());
    }

    #[tokio::test]
    async fn delete_removes_document() {
        let storage = MemoryStorage::new("test");
        let doc = serde_json::json!({});
        storage.save("U1", &doc, &HashMap::new()).await.unwrap();
        storage.delete("U1", &HashMap::new()).await.unwrap();
        assert!(!storage.contains("U1"));
    }
}
