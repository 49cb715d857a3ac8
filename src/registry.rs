//! Stage Registry (C3, §4.3).
//!
//! Resolves symbolic stage names to executable handles. Two kinds — links
//! and storages — each with their own contract. Resolution is lazy at
//! first use and cached per process. A stage naming a `package_source` but
//! no known builtin module resolves to an out-of-process RPC endpoint
//! (§4.3's "install from external package source", realized per the Design
//! Notes as a static `{builtin | external}` tagged variant rather than a
//! dynamic loader); if neither a builtin module nor an endpoint can be
//! resolved, the stage is marked permanently-unresolved.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::error;

use crate::cache::VConCache;
use crate::config::RawStageDef;
use crate::error::StageError;
use crate::stages::{sampler::SamplerLink, tag::TagLink, Link};
use crate::storage::{memory::MemoryStorage, StorageBackend};

/// A resolved link: either a compiled-in implementation or an
/// out-of-process RPC endpoint speaking the link contract over HTTP+JSON.
#[derive(Clone)]
pub enum ResolvedLink {
    Builtin(Arc<dyn Link>),
    External(ExternalLink),
}

#[async_trait]
impl Link for ResolvedLink {
    async fn run(
        &self,
        uuid: &str,
        stage_name: &str,
        options: &HashMap<String, Value>,
    ) -> Result<Option<String>, StageError> {
        match self {
            ResolvedLink::Builtin(link) => link.run(uuid, stage_name, options).await,
            ResolvedLink::External(link) => link.run(uuid, stage_name, options).await,
        }
    }
}

/// An out-of-process link reached over HTTP+JSON: `POST {endpoint}` with
/// `{uuid, stage_name, options}`, response `{uuid} | {filtered: true} |
/// {error: {class, message}}` (§9's recommended RPC contract).
#[derive(Clone)]
pub struct ExternalLink {
    pub endpoint: String,
    client: reqwest::Client,
}

impl ExternalLink {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            client: reqwest::Client::new(),
        }
    }

    async fn run(
        &self,
        uuid: &str,
        stage_name: &str,
        options: &HashMap<String, Value>,
    ) -> Result<Option<String>, StageError> {
        #[derive(serde::Serialize)]
        struct Request<'a> {
            uuid: &'a str,
            stage_name: &'a str,
            options: &'a HashMap<String, Value>,
        }
        #[derive(serde::Deserialize)]
        struct ErrorBody {
            class: String,
            message: String,
        }
        #[derive(serde::Deserialize)]
        struct Response {
            uuid: Option<String>,
            filtered: Option<bool>,
            error: Option<ErrorBody>,
        }

        let resp = self
            .client
            .post(&self.endpoint)
            .json(&Request {
                uuid,
                stage_name,
                options,
            })
            .send()
            .await
            .map_err(|e| StageError::Recoverable(format!("external link unreachable: {e}")))?;

        let parsed: Response = resp
            .json()
            .await
            .map_err(|e| StageError::Permanent(format!("malformed external link response: {e}")))?;

        if let Some(err) = parsed.error {
            return match err.class.as_str() {
                "recoverable" => Err(StageError::Recoverable(err.message)),
                _ => Err(StageError::Permanent(err.message)),
            };
        }
        if parsed.filtered.unwrap_or(false) {
            return Ok(None);
        }
        Ok(parsed.uuid.or_else(|| Some(uuid.to_string())))
    }
}

#[derive(Clone)]
pub enum ResolvedStorage {
    Builtin(Arc<dyn StorageBackend>),
}

pub struct StageRegistry {
    stage_defs: HashMap<String, RawStageDef>,
    storage_defs: HashMap<String, RawStageDef>,
    resolved_links: RwLock<HashMap<String, Option<ResolvedLink>>>,
    resolved_storages: RwLock<HashMap<String, Option<ResolvedStorage>>>,
    cache: Arc<VConCache>,
    external_timeout: Duration,
}

impl StageRegistry {
    pub fn new(
        stage_defs: HashMap<String, RawStageDef>,
        storage_defs: HashMap<String, RawStageDef>,
        cache: Arc<VConCache>,
        external_timeout: Duration,
    ) -> Self {
        Self {
            stage_defs,
            storage_defs,
            resolved_links: RwLock::new(HashMap::new()),
            resolved_storages: RwLock::new(HashMap::new()),
            cache,
            external_timeout,
        }
    }

    /// Resolve a link by name, caching the result. Returns `None` if the
    /// stage is permanently unresolved (no builtin module, no package
    /// source).
    pub async fn resolve_link(&self, name: &str) -> Option<ResolvedLink> {
        if let Some(cached) = self.resolved_links.read().await.get(name) {
            return cached.clone();
        }

        let resolved = self.resolve_link_uncached(name).await;
        if resolved.is_none() {
            error!(stage = name, "stage permanently unresolved");
        }
        self.resolved_links
            .write()
            .await
            .insert(name.to_string(), resolved.clone());
        resolved
    }

    async fn resolve_link_uncached(&self, name: &str) -> Option<ResolvedLink> {
        let def = self.stage_defs.get(name)?;
        match def.module.as_str() {
            "tag" => Some(ResolvedLink::Builtin(Arc::new(TagLink::new(Arc::clone(
                &self.cache,
            ))))),
            "sampler" => Some(ResolvedLink::Builtin(Arc::new(SamplerLink))),
            _ => def
                .package_source
                .as_ref()
                .map(|endpoint| ResolvedLink::External(ExternalLink::new(endpoint))),
        }
    }

    pub async fn resolve_storage(&self, name: &str) -> Option<ResolvedStorage> {
        if let Some(cached) = self.resolved_storages.read().await.get(name) {
            return cached.clone();
        }

        let resolved = self.resolve_storage_uncached(name);
        if resolved.is_none() {
            error!(storage = name, "storage permanently unresolved");
        }
        self.resolved_storages
            .write()
            .await
            .insert(name.to_string(), resolved.clone());
        resolved
    }

    fn resolve_storage_uncached(&self, name: &str) -> Option<ResolvedStorage> {
        let def = self.storage_defs.get(name)?;
        match def.module.as_str() {
            "memory" => Some(ResolvedStorage::Builtin(Arc::new(MemoryStorage::new(
                name,
            )))),
            _ => None,
        }
    }

    pub fn external_timeout(&self) -> Duration {
        self.external_timeout
    }
}
