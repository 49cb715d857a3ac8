//! vCon Cache (C2, §4.2).
//!
//! A pull-through cache fronting an ordered list of storage backends. Reads
//! that hit the primary cache never touch TTL; reads that miss probe every
//! configured backend (the first hit wins — probing is raced concurrently,
//! not serialized, since the contract permits parallel probing) and
//! populate the cache, the `vcons` sorted-set index, and the party
//! secondary indexes before returning.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::FuturesUnordered;
use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use crate::queue::QueueClient;
use crate::storage::StorageBackend;
use crate::vcon::VCon;

/// TTL policy (§4.2): three independent expirations.
#[derive(Debug, Clone, Copy)]
pub struct TtlPolicy {
    pub document_ttl: Duration,
    pub secondary_index_ttl: Duration,
    pub dlq_ttl: Duration,
}

impl Default for TtlPolicy {
    fn default() -> Self {
        Self {
            document_ttl: Duration::from_secs(3600),
            secondary_index_ttl: Duration::from_secs(86_400),
            dlq_ttl: Duration::from_secs(604_800),
        }
    }
}

pub struct VConCache {
    queue: QueueClient,
    storages: Vec<Arc<dyn StorageBackend>>,
    ttl: TtlPolicy,
    sorted_set_name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("vCon {0} not found in cache or any storage backend")]
    NotFound(String),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl VConCache {
    pub fn new(
        queue: QueueClient,
        storages: Vec<Arc<dyn StorageBackend>>,
        ttl: TtlPolicy,
        sorted_set_name: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            storages,
            ttl,
            sorted_set_name: sorted_set_name.into(),
        }
    }

    fn doc_key(uuid: &str) -> String {
        format!("vcon:{uuid}")
    }

    /// Read contract (§4.2). Cache hit: return without touching TTL. Cache
    /// miss: probe every storage backend concurrently, and on the first
    /// hit, write the document back into the cache and refresh indexes.
    pub async fn get(&self, uuid: &str) -> Result<Value, CacheError> {
        let key = Self::doc_key(uuid);
        if let Some(doc) = self.queue.get_json::<Value>(&key).await? {
            return Ok(doc);
        }

        let mut probes = FuturesUnordered::new();
        for storage in &self.storages {
            let storage = Arc::clone(storage);
            let uuid = uuid.to_string();
            probes.push(async move { storage.get(&uuid, &HashMap::new()).await });
        }

        let mut found: Option<Value> = None;
        while let Some(result) = probes.next().await {
            match result {
                Ok(Some(doc)) => {
                    found = Some(doc);
                    break;
                }
                Ok(None) => continue,
                Err(e) => {
                    warn!(uuid, err = %e, "storage probe failed during pull-through");
                    continue;
                }
            }
        }

        let doc = found.ok_or_else(|| CacheError::NotFound(uuid.to_string()))?;
        self.populate_from_storage(uuid, &doc).await?;
        Ok(doc)
    }

    /// Populate the cache, sorted-set index, and secondary indexes from a
    /// document just read from storage (pull-through side effect, §4.2 /
    /// §8 scenario 6).
    async fn populate_from_storage(&self, uuid: &str, doc: &Value) -> Result<(), CacheError> {
        self.queue
            .set_json_ex(&Self::doc_key(uuid), doc, self.ttl.document_ttl)
            .await?;

        if let Ok(vcon) = VCon::from_json(doc) {
            self.queue
                .zadd(&self.sorted_set_name, uuid, vcon.created_at_epoch())
                .await?;
            self.refresh_party_indexes(uuid, &vcon).await?;
        } else {
            debug!(uuid, "document did not parse as a typed vCon; skipping index refresh");
        }
        Ok(())
    }

    /// Write contract (§4.2): store the document, upsert the sorted-set
    /// entry, and rebuild party secondary indexes (stale entries removed,
    /// current ones added).
    pub async fn put(&self, uuid: &str, document: &Value) -> Result<(), CacheError> {
        // Remove stale index memberships first so a party change doesn't
        // leave the old key pointing at this UUID.
        if let Some(previous) = self.queue.get_json::<Value>(&Self::doc_key(uuid)).await? {
            if let Ok(prev_vcon) = VCon::from_json(&previous) {
                self.remove_party_indexes(uuid, &prev_vcon).await?;
            }
        }

        self.queue
            .set_json_ex(&Self::doc_key(uuid), document, self.ttl.document_ttl)
            .await?;

        if let Ok(vcon) = VCon::from_json(document) {
            self.queue
                .zadd(&self.sorted_set_name, uuid, vcon.created_at_epoch())
                .await?;
            self.refresh_party_indexes(uuid, &vcon).await?;
        }
        Ok(())
    }

    /// Delete contract (§4.2): remove primary key, sorted-set entry, and
    /// secondary-index memberships; best-effort fire-and-forget propagate
    /// to storage backends (failures logged, never block progress).
    pub async fn delete(&self, uuid: &str) -> Result<(), CacheError> {
        if let Some(doc) = self.queue.get_json::<Value>(&Self::doc_key(uuid)).await? {
            if let Ok(vcon) = VCon::from_json(&doc) {
                self.remove_party_indexes(uuid, &vcon).await?;
            }
        }
        self.queue.del(&Self::doc_key(uuid)).await?;
        self.queue.zrem(&self.sorted_set_name, uuid).await?;

        for storage in &self.storages {
            let storage = Arc::clone(storage);
            let uuid = uuid.to_string();
            tokio::spawn(async move {
                if let Err(e) = storage.delete(&uuid, &HashMap::new()).await {
                    warn!(uuid, storage = storage.name(), err = %e, "best-effort storage delete propagation failed");
                }
            });
        }
        Ok(())
    }

    async fn refresh_party_indexes(&self, uuid: &str, vcon: &VCon) -> Result<(), CacheError> {
        let keys = vcon.party_index_keys();
        for tel in &keys.tel {
            self.queue.sadd(&format!("tel:{tel}"), uuid).await?;
            self.queue
                .expire(&format!("tel:{tel}"), self.ttl.secondary_index_ttl)
                .await?;
        }
        for mailto in &keys.mailto {
            self.queue.sadd(&format!("mailto:{mailto}"), uuid).await?;
            self.queue
                .expire(&format!("mailto:{mailto}"), self.ttl.secondary_index_ttl)
                .await?;
        }
        for name in &keys.name {
            self.queue.sadd(&format!("name:{name}"), uuid).await?;
            self.queue
                .expire(&format!("name:{name}"), self.ttl.secondary_index_ttl)
                .await?;
        }
        Ok(())
    }

    async fn remove_party_indexes(&self, uuid: &str, vcon: &VCon) -> Result<(), CacheError> {
        let keys = vcon.party_index_keys();
        for tel in &keys.tel {
            self.queue.srem(&format!("tel:{tel}"), uuid).await?;
        }
        for mailto in &keys.mailto {
            self.queue.srem(&format!("mailto:{mailto}"), uuid).await?;
        }
        for name in &keys.name {
            self.queue.srem(&format!("name:{name}"), uuid).await?;
        }
        Ok(())
    }

    /// `search({tel?, mailto?, name?}) -> uuids[]` (§6.2): set-intersection
    /// across whichever filters were supplied.
    pub async fn search(
        &self,
        tel: Option<&str>,
        mailto: Option<&str>,
        name: Option<&str>,
    ) -> Result<Vec<String>, CacheError> {
        let mut sets: Vec<Vec<String>> = Vec::new();
        if let Some(tel) = tel {
            let digits: String = tel.chars().filter(|c| c.is_ascii_digit()).collect();
            sets.push(self.queue.smembers(&format!("tel:{digits}")).await?);
        }
        if let Some(mailto) = mailto {
            sets.push(
                self.queue
                    .smembers(&format!("mailto:{}", mailto.to_lowercase()))
                    .await?,
            );
        }
        if let Some(name) = name {
            sets.push(
                self.queue
                    .smembers(&format!("name:{}", name.trim().to_lowercase()))
                    .await?,
            );
        }

        if sets.is_empty() {
            return Ok(Vec::new());
        }

        let mut result: std::collections::HashSet<String> = sets[0].iter().cloned().collect();
        for set in &sets[1..] {
            let other: std::collections::HashSet<String> = set.iter().cloned().collect();
            result = result.intersection(&other).cloned().collect();
        }
        let mut out: Vec<String> = result.into_iter().collect();
        out.sort();
        Ok(out)
    }

    /// `list_by_time(start, end) -> uuids[]` (§6.2): `ZRANGEBYSCORE` on the
    /// `vcons` sorted set.
    pub async fn list_by_time(&self, start: i64, end: i64) -> Result<Vec<String>, CacheError> {
        Ok(self.queue.zrangebyscore(&self.sorted_set_name, start, end).await?)
    }

    /// Extend a document's cache TTL to the DLQ retention value, per §4.4 /
    /// the DLQ-placement invariant in §3: "DLQ entries carry TTL extended
    /// to the DLQ retention value on move." A configured `dlq_ttl` of zero
    /// disables DLQ expiry entirely (§4.2) — `QueueClient::expire` turns
    /// that into a `PERSIST` rather than an immediate-expiry clamp.
    pub async fn extend_ttl_for_dlq(&self, uuid: &str) -> Result<(), CacheError> {
        self.queue
            .expire(&Self::doc_key(uuid), self.ttl.dlq_ttl)
            .await?;
        Ok(())
    }

    /// Restore a document's TTL to the ordinary cache TTL (used when an
    /// item leaves the DLQ via `reprocess`, §4.8).
    pub async fn restore_normal_ttl(&self, uuid: &str) -> Result<(), CacheError> {
        self.queue
            .expire(&Self::doc_key(uuid), self.ttl.document_ttl)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_redis_url() -> Option<String> {
        std::env::var("VCON_PIPE_TEST_REDIS_URL").ok()
    }

    #[tokio::test]
    async fn pull_through_populates_cache_and_indexes() {
        let Some(url) = test_redis_url() else {
            return; // no Redis in this environment; skip the integration test
        };
        let queue = QueueClient::connect(&url).await.unwrap();
        let storage: Arc<dyn StorageBackend> =
            Arc::new(crate::storage::memory::MemoryStorage::new("pgA"));
        let doc = serde_json::json!({
            "uuid": "pullthrough-test-uuid",
            "vcon": "0.0.1",
            "created_at": "2024-01-01T00:00:00Z",
            "parties": [{"tel": "555-1234"}],
            "dialog": [],
            "analysis": [],
            "attachments": [],
        });
        storage
            .save("pullthrough-test-uuid", &doc, &HashMap::new())
            .await
            .unwrap();

        let cache = VConCache::new(
            queue.clone(),
            vec![storage],
            TtlPolicy::default(),
            "vcons_test",
        );
        let got = cache.get("pullthrough-test-uuid").await.unwrap();
        assert_eq!(got["uuid"], "pullthrough-test-uuid");

        let by_tel = cache.search(Some("555-1234"), None, None).await.unwrap();
        assert!(by_tel.contains(&"pullthrough-test-uuid".to_string()));

        // cleanup
        cache.delete("pullthrough-test-uuid").await.unwrap();
    }
}
