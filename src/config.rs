//! Config Loader (C7, §4.7, §6.3).
//!
//! Parses the declarative YAML configuration document into a raw,
//! `serde`-deserialized shape, then validates it into a resolved in-memory
//! model. Validation collects every problem it finds rather than
//! short-circuiting on the first, so a single load reports everything wrong
//! with the document at once; an enabled chain that references an
//! unresolvable stage is demoted to disabled (with a logged error) rather
//! than aborting the whole load.

use std::collections::{HashMap, HashSet};

use serde::Deserialize;
use tracing::warn;

use crate::error::ConfigError;

/// Storage fan-out mode (§6.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FanOutMode {
    #[default]
    Parallel,
    Sequential,
}

/// Process-creation model (§6.4, §9).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProcessModel {
    Fresh,
    #[default]
    Forked,
    Hybrid,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawStageDef {
    pub module: String,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
    /// External package source (URL or registry name). In this
    /// statically-linked implementation, a value here resolves to an
    /// out-of-process RPC endpoint rather than triggering a dynamic
    /// install (§4.3, §9).
    #[serde(default)]
    pub package_source: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawChainDef {
    #[serde(default)]
    pub stages: Vec<RawStageRef>,
    #[serde(default)]
    pub storages: Vec<RawStageRef>,
    pub ingress_queues: Vec<String>,
    #[serde(default)]
    pub egress_queues: Vec<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub fan_out: FanOutMode,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawStageRef {
    pub name: String,
    #[serde(default)]
    pub options: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    #[serde(default)]
    pub ingress_auth: HashMap<String, Vec<String>>,
    #[serde(default)]
    pub stages: HashMap<String, RawStageDef>,
    #[serde(default)]
    pub storages: HashMap<String, RawStageDef>,
    #[serde(default)]
    pub chains: HashMap<String, RawChainDef>,
    #[serde(default)]
    pub feature_flags: HashMap<String, bool>,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

/// §6.4 environment / runtime inputs, collected under one struct so they
/// can come from the config document and be overridden by CLI flags / env
/// vars (see `main.rs`).
#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    #[serde(default)]
    pub fan_out_mode: FanOutMode,
    #[serde(default)]
    pub process_model: ProcessModel,
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_secs: u64,
    #[serde(default = "default_index_ttl")]
    pub secondary_index_ttl_secs: u64,
    #[serde(default = "default_dlq_ttl")]
    pub dlq_ttl_secs: u64,
    #[serde(default = "default_sorted_set_name")]
    pub sorted_set_name: String,
    #[serde(default = "default_stage_timeout")]
    pub stage_timeout_secs: u64,
    #[serde(default = "default_pop_timeout")]
    pub pop_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/0".to_string()
}
fn default_worker_count() -> usize {
    1
}
fn default_cache_ttl() -> u64 {
    3600
}
fn default_index_ttl() -> u64 {
    86_400
}
fn default_dlq_ttl() -> u64 {
    604_800
}
fn default_sorted_set_name() -> String {
    "vcons".to_string()
}
fn default_stage_timeout() -> u64 {
    30
}
fn default_pop_timeout() -> u64 {
    5
}
fn default_shutdown_grace() -> u64 {
    60
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            redis_url: default_redis_url(),
            worker_count: default_worker_count(),
            fan_out_mode: FanOutMode::default(),
            process_model: ProcessModel::default(),
            cache_ttl_secs: default_cache_ttl(),
            secondary_index_ttl_secs: default_index_ttl(),
            dlq_ttl_secs: default_dlq_ttl(),
            sorted_set_name: default_sorted_set_name(),
            stage_timeout_secs: default_stage_timeout(),
            pop_timeout_secs: default_pop_timeout(),
            shutdown_grace_secs: default_shutdown_grace(),
        }
    }
}

/// Resolved, validated stage reference inside a chain.
#[derive(Debug, Clone)]
pub struct StageRef {
    pub name: String,
    pub options: HashMap<String, serde_json::Value>,
}

/// A resolved chain. `enabled` may be `false` even if the document set it
/// `true`, if validation demoted it (§4.7).
#[derive(Debug, Clone)]
pub struct Chain {
    pub name: String,
    pub stages: Vec<StageRef>,
    pub storages: Vec<StageRef>,
    pub ingress_queues: Vec<String>,
    pub egress_queues: Vec<String>,
    pub timeout_secs: Option<u64>,
    pub enabled: bool,
    pub fan_out: FanOutMode,
}

impl Chain {
    /// DLQ name for this chain, per §4.4: `DLQ:<first-ingress-queue>`.
    pub fn dlq_name(&self) -> String {
        format!(
            "DLQ:{}",
            self.ingress_queues
                .first()
                .map(String::as_str)
                .unwrap_or("")
        )
    }
}

/// The fully validated, in-memory configuration model.
#[derive(Debug, Clone)]
pub struct Config {
    pub ingress_auth: HashMap<String, Vec<String>>,
    pub stages: HashMap<String, RawStageDef>,
    pub storages: HashMap<String, RawStageDef>,
    pub chains: Vec<Chain>,
    pub feature_flags: HashMap<String, bool>,
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Parse and validate a YAML configuration document.
    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = serde_yaml::from_str(text)?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut chains = Vec::with_capacity(raw.chains.len());
        let mut seen_names: HashSet<String> = HashSet::new();

        for (name, def) in raw.chains {
            if !seen_names.insert(name.clone()) {
                return Err(ConfigError::DuplicateChain(name));
            }

            if def.ingress_queues.is_empty() {
                return Err(ConfigError::NoIngressQueues { chain: name });
            }

            let mut enabled = def.enabled;

            for stage_ref in &def.stages {
                if !raw.stages.contains_key(&stage_ref.name) {
                    warn!(
                        chain = %name,
                        stage = %stage_ref.name,
                        "chain references unresolvable stage; demoting to disabled"
                    );
                    enabled = false;
                }
            }
            for storage_ref in &def.storages {
                if !raw.storages.contains_key(&storage_ref.name) {
                    warn!(
                        chain = %name,
                        storage = %storage_ref.name,
                        "chain references unresolvable storage; demoting to disabled"
                    );
                    enabled = false;
                }
            }

            let stages = def
                .stages
                .into_iter()
                .map(|s| merge_stage_ref(s, &raw.stages))
                .collect();
            let storages = def
                .storages
                .into_iter()
                .map(|s| merge_stage_ref(s, &raw.storages))
                .collect();

            chains.push(Chain {
                name,
                stages,
                storages,
                ingress_queues: def.ingress_queues,
                egress_queues: def.egress_queues,
                timeout_secs: def.timeout_secs,
                enabled,
                fan_out: def.fan_out,
            });
        }

        Ok(Config {
            ingress_auth: raw.ingress_auth,
            stages: raw.stages,
            storages: raw.storages,
            chains,
            feature_flags: raw.feature_flags,
            runtime: raw.runtime,
        })
    }

    /// The union of ingress queues across all *enabled* chains — a
    /// worker's blocking-pop set (§4.5 step 1).
    pub fn active_ingress_queues(&self) -> Vec<String> {
        let mut set: HashSet<String> = HashSet::new();
        for chain in &self.chains {
            if chain.enabled {
                set.extend(chain.ingress_queues.iter().cloned());
            }
        }
        let mut queues: Vec<String> = set.into_iter().collect();
        queues.sort();
        queues
    }

    /// All enabled chains whose ingress set contains `queue` (§4.5 step
    /// 2(b): fan-out dispatch to every matching chain).
    pub fn chains_for_queue(&self, queue: &str) -> Vec<&Chain> {
        self.chains
            .iter()
            .filter(|c| c.enabled && c.ingress_queues.iter().any(|q| q == queue))
            .collect()
    }
}

/// Merge a chain-level stage reference's options over the registry-level
/// defaults (shallow key-wise merge, §4.4 step 1 / §9 "option merging").
fn merge_stage_ref(
    stage_ref: RawStageRef,
    defs: &HashMap<String, RawStageDef>,
) -> StageRef {
    let mut options = defs
        .get(&stage_ref.name)
        .map(|d| d.options.clone())
        .unwrap_or_default();
    for (k, v) in stage_ref.options {
        options.insert(k, v);
    }
    StageRef {
        name: stage_ref.name,
        options,
    }
}
