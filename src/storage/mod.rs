//! Storage backend contract (§4.3's storage contract) and the in-memory
//! reference implementation used by tests and local/dev deployments.

pub mod memory;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::StorageError;

/// `save(uuid, options) -> ok | error`; optional `get`/`delete`.
///
/// `save` reads the current document from the cache and persists it — the
/// registry passes the already-fetched document in, rather than having each
/// backend re-read the cache, so fan-out doesn't multiply cache reads.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn save(
        &self,
        uuid: &str,
        document: &Value,
        options: &std::collections::HashMap<String, Value>,
    ) -> Result<(), StorageError>;

    async fn get(
        &self,
        uuid: &str,
        options: &std::collections::HashMap<String, Value>,
    ) -> Result<Option<Value>, StorageError>;

    async fn delete(
        &self,
        uuid: &str,
        options: &std::collections::HashMap<String, Value>,
    ) -> Result<(), StorageError>;
}
