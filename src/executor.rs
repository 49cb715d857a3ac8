//! Chain Executor (C4, §4.4). The heart of the pipeline: runs one vCon
//! through a chain's stages in sequence, then fans out to storage, then
//! emits to egress queues or the DLQ.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{info, warn};

use crate::cache::VConCache;
use crate::config::{Chain, FanOutMode};
use crate::error::FailureClass;
use crate::queue::QueueClient;
use crate::registry::{ResolvedStorage, StageRegistry};
use crate::stages::Link;
use crate::storage::StorageBackend;
use crate::vcon::VCon;

const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(30);

/// The result of running one chain against one vCon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainOutcome {
    /// Every stage ran, storage fan-out persisted at least one copy (or
    /// there were zero configured storages), and the UUID was pushed to
    /// every egress queue.
    Success,
    /// A stage returned `nil`: the chain halted cleanly. No storage, no
    /// egress, no DLQ.
    Filtered,
    /// A stage failed/timed out, or every configured storage failed. The
    /// item was pushed to the chain's DLQ.
    Failed(FailureClass),
}

/// Per-stage and per-storage timing, recorded for observability. Emission
/// to a metrics sink is out of scope (§4.4); this struct is the in-process
/// capture a caller (the worker loop) can log or forward.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    pub chain_name: String,
    pub outcome_label: String,
    pub stage_durations: Vec<(String, Duration)>,
    pub storage_durations: Vec<(String, Duration, bool)>,
    pub total_duration: Duration,
}

pub struct ChainExecutor {
    queue: QueueClient,
    cache: Arc<VConCache>,
    registry: Arc<StageRegistry>,
}

impl ChainExecutor {
    pub fn new(queue: QueueClient, cache: Arc<VConCache>, registry: Arc<StageRegistry>) -> Self {
        Self {
            queue,
            cache,
            registry,
        }
    }

    /// Run `uuid` through `chain`. Returns the outcome and a timing report.
    pub async fn execute(
        &self,
        chain: &Chain,
        uuid: &str,
    ) -> anyhow::Result<(ChainOutcome, ExecutionReport)> {
        let chain_start = Instant::now();
        let stage_timeout = chain
            .timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(DEFAULT_STAGE_TIMEOUT);

        let mut report = ExecutionReport {
            chain_name: chain.name.clone(),
            ..Default::default()
        };

        let mut current_uuid = uuid.to_string();

        for stage_ref in &chain.stages {
            let link = match self.registry.resolve_link(&stage_ref.name).await {
                Some(link) => link,
                None => {
                    warn!(chain = %chain.name, stage = %stage_ref.name, "stage unresolved at execution time");
                    let outcome = ChainOutcome::Failed(FailureClass::Permanent);
                    self.place_on_dlq(
                        chain,
                        &current_uuid,
                        FailureClass::Permanent,
                        &stage_ref.name,
                        "stage could not be resolved",
                    )
                    .await?;
                    report.outcome_label = "failed".to_string();
                    report.total_duration = chain_start.elapsed();
                    return Ok((outcome, report));
                }
            };

            let stage_start = Instant::now();
            let result = tokio::time::timeout(
                stage_timeout,
                link.run(&current_uuid, &stage_ref.name, &stage_ref.options),
            )
            .await;
            let stage_duration = stage_start.elapsed();
            report
                .stage_durations
                .push((stage_ref.name.clone(), stage_duration));

            match result {
                Err(_elapsed) => {
                    // Stage timeout: always a recoverable classification (§4.4/§7).
                    warn!(chain = %chain.name, stage = %stage_ref.name, "stage timed out");
                    self.place_on_dlq(
                        chain,
                        &current_uuid,
                        FailureClass::Recoverable,
                        &stage_ref.name,
                        "stage timed out",
                    )
                    .await?;
                    report.outcome_label = "failed".to_string();
                    report.total_duration = chain_start.elapsed();
                    return Ok((ChainOutcome::Failed(FailureClass::Recoverable), report));
                }
                Ok(Ok(None)) => {
                    // Filter: halt cleanly, no DLQ, no egress, no storage.
                    report.outcome_label = "filtered".to_string();
                    report.total_duration = chain_start.elapsed();
                    return Ok((ChainOutcome::Filtered, report));
                }
                Ok(Ok(Some(next_uuid))) => {
                    current_uuid = next_uuid;
                }
                Ok(Err(stage_error)) => {
                    let class = stage_error.classification();
                    warn!(chain = %chain.name, stage = %stage_ref.name, err = %stage_error, "stage failed");
                    self.place_on_dlq(
                        chain,
                        &current_uuid,
                        class,
                        &stage_ref.name,
                        stage_error.message(),
                    )
                    .await?;
                    report.outcome_label = "failed".to_string();
                    report.total_duration = chain_start.elapsed();
                    return Ok((ChainOutcome::Failed(class), report));
                }
            }
        }

        // All stages ran; fan out to storage.
        let storage_outcomes = self
            .run_storage_fanout(chain, &current_uuid, stage_timeout)
            .await?;
        for (name, duration, ok) in &storage_outcomes {
            report
                .storage_durations
                .push((name.clone(), *duration, *ok));
        }

        let any_storage_configured = !chain.storages.is_empty();
        let all_failed = any_storage_configured && storage_outcomes.iter().all(|(_, _, ok)| !ok);

        if all_failed {
            warn!(chain = %chain.name, uuid = %current_uuid, "all configured storages failed");
            self.place_on_dlq(
                chain,
                &current_uuid,
                FailureClass::Recoverable,
                "storage_fanout",
                "all configured storages failed",
            )
            .await?;
            report.outcome_label = "failed".to_string();
            report.total_duration = chain_start.elapsed();
            return Ok((ChainOutcome::Failed(FailureClass::Recoverable), report));
        }

        // Success: emit to every egress queue.
        for egress in &chain.egress_queues {
            self.queue.push_right(egress, &current_uuid).await?;
        }

        report.outcome_label = "success".to_string();
        report.total_duration = chain_start.elapsed();
        info!(
            chain = %chain.name,
            uuid = %current_uuid,
            duration_ms = report.total_duration.as_millis(),
            "chain succeeded"
        );
        Ok((ChainOutcome::Success, report))
    }

    async fn run_storage_fanout(
        &self,
        chain: &Chain,
        uuid: &str,
        per_storage_timeout: Duration,
    ) -> anyhow::Result<Vec<(String, Duration, bool)>> {
        if chain.storages.is_empty() {
            return Ok(Vec::new());
        }

        let document = self.cache.get(uuid).await?;

        match chain.fan_out {
            FanOutMode::Parallel => {
                let mut join_set = tokio::task::JoinSet::new();
                for storage_ref in &chain.storages {
                    let Some(ResolvedStorage::Builtin(backend)) =
                        self.registry.resolve_storage(&storage_ref.name).await
                    else {
                        join_set.spawn(Self::missing_storage_result(storage_ref.name.clone()));
                        continue;
                    };
                    let uuid = uuid.to_string();
                    let document = document.clone();
                    let options = storage_ref.options.clone();
                    let name = storage_ref.name.clone();
                    join_set.spawn(Self::invoke_storage(
                        backend,
                        name,
                        uuid,
                        document,
                        options,
                        per_storage_timeout,
                    ));
                }
                let mut outcomes = Vec::new();
                while let Some(res) = join_set.join_next().await {
                    outcomes.push(res.unwrap_or_else(|e| {
                        ("join_error".to_string(), Duration::ZERO, {
                            warn!(err = %e, "storage task panicked");
                            false
                        })
                    }));
                }
                Ok(outcomes)
            }
            FanOutMode::Sequential => {
                let mut outcomes = Vec::with_capacity(chain.storages.len());
                for storage_ref in &chain.storages {
                    let Some(ResolvedStorage::Builtin(backend)) =
                        self.registry.resolve_storage(&storage_ref.name).await
                    else {
                        outcomes.push(Self::missing_storage_result(storage_ref.name.clone()).await);
                        continue;
                    };
                    outcomes.push(
                        Self::invoke_storage(
                            backend,
                            storage_ref.name.clone(),
                            uuid.to_string(),
                            document.clone(),
                            storage_ref.options.clone(),
                            per_storage_timeout,
                        )
                        .await,
                    );
                }
                Ok(outcomes)
            }
        }
    }

    async fn missing_storage_result(name: String) -> (String, Duration, bool) {
        warn!(storage = %name, "storage unresolved at execution time");
        (name, Duration::ZERO, false)
    }

    async fn invoke_storage(
        backend: Arc<dyn StorageBackend>,
        name: String,
        uuid: String,
        document: serde_json::Value,
        options: HashMap<String, serde_json::Value>,
        timeout: Duration,
    ) -> (String, Duration, bool) {
        let start = Instant::now();
        let result = tokio::time::timeout(timeout, backend.save(&uuid, &document, &options)).await;
        let duration = start.elapsed();
        let ok = matches!(result, Ok(Ok(())));
        if !ok {
            warn!(storage = %name, uuid = %uuid, "storage save failed or timed out");
        }
        (name, duration, ok)
    }

    /// Push `uuid` onto the chain's DLQ and extend its document TTL to the
    /// DLQ retention value, recording a structured failure marker on the
    /// document first (§4.4, §7, §3's DLQ TTL invariant).
    async fn place_on_dlq(
        &self,
        chain: &Chain,
        uuid: &str,
        class: FailureClass,
        stage: &str,
        message: &str,
    ) -> anyhow::Result<()> {
        if let Ok(doc) = self.cache.get(uuid).await {
            if let Ok(mut vcon) = VCon::from_json(&doc) {
                vcon.add_dlq_marker(class.as_str(), stage, message);
                if let Ok(updated) = vcon.to_json() {
                    let _ = self.cache.put(uuid, &updated).await;
                }
            }
        }
        self.cache.extend_ttl_for_dlq(uuid).await.ok();
        self.queue.push_right(&chain.dlq_name(), uuid).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::TtlPolicy;
    use crate::config::{Chain, FanOutMode, RawStageDef};
    use crate::registry::StageRegistry;
    use crate::storage::memory::MemoryStorage;

    async fn test_queue() -> Option<QueueClient> {
        let url = std::env::var("VCON_PIPE_TEST_REDIS_URL").ok()?;
        QueueClient::connect(&url).await.ok()
    }

    fn sample_doc(uuid: &str) -> serde_json::Value {
        serde_json::json!({
            "uuid": uuid,
            "vcon": "0.0.1",
            "created_at": "2024-01-01T00:00:00Z",
            "parties": [],
            "dialog": [],
            "analysis": [],
            "attachments": [],
        })
    }

    #[tokio::test]
    async fn happy_path_runs_tag_stage_and_both_storages_and_egress() {
        let Some(queue) = test_queue().await else {
            return;
        };
        let uuid = format!("happy-{}", uuid::Uuid::new_v4());
        queue
            .set_json_ex(&format!("vcon:{uuid}"), &sample_doc(&uuid), Duration::from_secs(60))
            .await
            .unwrap();

        let cache = Arc::new(VConCache::new(
            queue.clone(),
            vec![],
            TtlPolicy::default(),
            "vcons_test",
        ));

        let mut stages = HashMap::new();
        stages.insert(
            "tag".to_string(),
            RawStageDef {
                module: "tag".to_string(),
                options: HashMap::from([
                    ("name".to_string(), serde_json::json!("processed")),
                    ("value".to_string(), serde_json::json!("true")),
                ]),
                package_source: None,
            },
        );
        let mut storages = HashMap::new();
        storages.insert(
            "pgA".to_string(),
            RawStageDef {
                module: "memory".to_string(),
                ..Default::default()
            },
        );
        storages.insert(
            "objB".to_string(),
            RawStageDef {
                module: "memory".to_string(),
                ..Default::default()
            },
        );

        let registry = Arc::new(StageRegistry::new(
            stages,
            storages,
            Arc::clone(&cache),
            Duration::from_secs(30),
        ));

        let chain = Chain {
            name: "demo".to_string(),
            stages: vec![crate::config::StageRef {
                name: "tag".to_string(),
                options: HashMap::new(),
            }],
            storages: vec![
                crate::config::StageRef {
                    name: "pgA".to_string(),
                    options: HashMap::new(),
                },
                crate::config::StageRef {
                    name: "objB".to_string(),
                    options: HashMap::new(),
                },
            ],
            ingress_queues: vec!["q1".to_string()],
            egress_queues: vec!["eq1".to_string()],
            timeout_secs: Some(30),
            enabled: true,
            fan_out: FanOutMode::Parallel,
        };

        let executor = ChainExecutor::new(queue.clone(), cache, registry);
        let (outcome, _report) = executor.execute(&chain, &uuid).await.unwrap();
        assert_eq!(outcome, ChainOutcome::Success);

        let egress: Vec<String> = queue.list_range("eq1", 0, -1).await.unwrap();
        assert!(egress.contains(&uuid));

        let dlq_len = queue.list_len(&chain.dlq_name()).await.unwrap();
        assert_eq!(dlq_len, 0);
    }

    #[tokio::test]
    async fn zero_storages_still_succeeds_and_emits_egress() {
        let Some(queue) = test_queue().await else {
            return;
        };
        let uuid = format!("zero-storage-{}", uuid::Uuid::new_v4());
        queue
            .set_json_ex(&format!("vcon:{uuid}"), &sample_doc(&uuid), Duration::from_secs(60))
            .await
            .unwrap();
        let cache = Arc::new(VConCache::new(
            queue.clone(),
            vec![],
            TtlPolicy::default(),
            "vcons_test",
        ));
        let registry = Arc::new(StageRegistry::new(
            HashMap::new(),
            HashMap::new(),
            Arc::clone(&cache),
            Duration::from_secs(30),
        ));
        let chain = Chain {
            name: "noop".to_string(),
            stages: vec![],
            storages: vec![],
            ingress_queues: vec!["q1".to_string()],
            egress_queues: vec!["eq2".to_string()],
            timeout_secs: None,
            enabled: true,
            fan_out: FanOutMode::Parallel,
        };
        let executor = ChainExecutor::new(queue.clone(), cache, registry);
        let (outcome, _) = executor.execute(&chain, &uuid).await.unwrap();
        assert_eq!(outcome, ChainOutcome::Success);
    }

    #[test]
    fn memory_storage_can_be_constructed_failing_for_partial_failure_tests() {
        let storage = MemoryStorage::failing("broken");
        assert!(storage.always_fail);
    }
}
