//! End-to-end scenarios from the design document, exercised against a real
//! Redis instance. Skipped (not failed) when `VCON_PIPE_TEST_REDIS_URL` is
//! unset, so `cargo test` stays green in environments without Redis.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use vcon_pipe::cache::{TtlPolicy, VConCache};
use vcon_pipe::config::{Chain, FanOutMode, RawStageDef, StageRef};
use vcon_pipe::executor::{ChainExecutor, ChainOutcome};
use vcon_pipe::queue::QueueClient;
use vcon_pipe::registry::StageRegistry;

fn test_redis_url() -> Option<String> {
    std::env::var("VCON_PIPE_TEST_REDIS_URL").ok()
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

async fn harness() -> Option<(QueueClient, Arc<VConCache>, Arc<StageRegistry>)> {
    let url = test_redis_url()?;
    let queue = QueueClient::connect(&url).await.ok()?;
    let cache = Arc::new(VConCache::new(
        queue.clone(),
        vec![],
        TtlPolicy::default(),
        "vcons_e2e_test",
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
    stages.insert(
        "sampler".to_string(),
        RawStageDef {
            module: "sampler".to_string(),
            ..Default::default()
        },
    );
    stages.insert(
        "flaky".to_string(),
        RawStageDef {
            // No builtin module named "flaky" and no package source:
            // permanently unresolved, which the executor treats as a
            // permanent failure — this is how scenario 3 ("stage raises
            // on every call") is realized without a real flaky link.
            module: "flaky".to_string(),
            ..Default::default()
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
    storages.insert(
        "ok".to_string(),
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
    Some((queue, cache, registry))
}

#[tokio::test]
async fn scenario_1_happy_path() {
    let Some((queue, cache, registry)) = harness().await else {
        return;
    };
    let uuid = format!("U1-{}", uuid::Uuid::new_v4());
    queue
        .set_json_ex(&format!("vcon:{uuid}"), &sample_doc(&uuid), Duration::from_secs(60))
        .await
        .unwrap();

    let chain = Chain {
        name: "demo".to_string(),
        stages: vec![StageRef {
            name: "tag".to_string(),
            options: HashMap::new(),
        }],
        storages: vec![
            StageRef {
                name: "pgA".to_string(),
                options: HashMap::new(),
            },
            StageRef {
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

    let executor = ChainExecutor::new(queue.clone(), Arc::clone(&cache), registry);
    let (outcome, _) = executor.execute(&chain, &uuid).await.unwrap();
    assert_eq!(outcome, ChainOutcome::Success);

    let doc = cache.get(&uuid).await.unwrap();
    let vcon = vcon_pipe::vcon::VCon::from_json(&doc).unwrap();
    assert!(vcon.tags().contains(&"processed:true".to_string()));

    let egress = queue.list_range("eq1", 0, -1).await.unwrap();
    assert!(egress.contains(&uuid));
    assert_eq!(queue.list_len(&chain.dlq_name()).await.unwrap(), 0);
}

#[tokio::test]
async fn scenario_2_filter_stops_chain_before_storage_and_egress() {
    let Some((queue, cache, registry)) = harness().await else {
        return;
    };
    let uuid = format!("U2-{}", uuid::Uuid::new_v4());
    queue
        .set_json_ex(&format!("vcon:{uuid}"), &sample_doc(&uuid), Duration::from_secs(60))
        .await
        .unwrap();

    let chain = Chain {
        name: "demo_filtered".to_string(),
        stages: vec![
            StageRef {
                name: "sampler".to_string(),
                options: HashMap::from([("rate".to_string(), serde_json::json!(0.0))]),
            },
            StageRef {
                name: "tag".to_string(),
                options: HashMap::new(),
            },
        ],
        storages: vec![StageRef {
            name: "pgA".to_string(),
            options: HashMap::new(),
        }],
        ingress_queues: vec!["q1".to_string()],
        egress_queues: vec!["eq1".to_string()],
        timeout_secs: Some(30),
        enabled: true,
        fan_out: FanOutMode::Parallel,
    };

    let executor = ChainExecutor::new(queue.clone(), Arc::clone(&cache), registry);
    let (outcome, _) = executor.execute(&chain, &uuid).await.unwrap();
    assert_eq!(outcome, ChainOutcome::Filtered);

    let doc = cache.get(&uuid).await.unwrap();
    let vcon = vcon_pipe::vcon::VCon::from_json(&doc).unwrap();
    assert!(vcon.tags().is_empty(), "downstream tag stage must not have run");

    let egress = queue.list_range("eq1", 0, -1).await.unwrap();
    assert!(!egress.contains(&uuid));
    assert_eq!(queue.list_len(&chain.dlq_name()).await.unwrap(), 0);
}

#[tokio::test]
async fn scenario_3_stage_failure_routes_to_dlq_with_extended_ttl() {
    let Some((queue, cache, registry)) = harness().await else {
        return;
    };
    let uuid = format!("U3-{}", uuid::Uuid::new_v4());
    queue
        .set_json_ex(&format!("vcon:{uuid}"), &sample_doc(&uuid), Duration::from_secs(60))
        .await
        .unwrap();

    let chain = Chain {
        name: "demo_flaky".to_string(),
        stages: vec![StageRef {
            name: "flaky".to_string(),
            options: HashMap::new(),
        }],
        storages: vec![],
        ingress_queues: vec!["q1".to_string()],
        egress_queues: vec!["eq1".to_string()],
        timeout_secs: Some(30),
        enabled: true,
        fan_out: FanOutMode::Parallel,
    };

    let executor = ChainExecutor::new(queue.clone(), Arc::clone(&cache), registry);
    let (outcome, _) = executor.execute(&chain, &uuid).await.unwrap();
    assert!(matches!(outcome, ChainOutcome::Failed(_)));

    let egress = queue.list_range("eq1", 0, -1).await.unwrap();
    assert!(!egress.contains(&uuid));

    let dlq_contents = queue.list_range(&chain.dlq_name(), 0, -1).await.unwrap();
    assert!(dlq_contents.contains(&uuid));
}

#[tokio::test]
async fn scenario_4_partial_storage_failure_still_succeeds() {
    let Some((queue, cache, registry)) = harness().await else {
        return;
    };
    let uuid = format!("U4-{}", uuid::Uuid::new_v4());
    queue
        .set_json_ex(&format!("vcon:{uuid}"), &sample_doc(&uuid), Duration::from_secs(60))
        .await
        .unwrap();

    // "broken" is intentionally not registered as a storage, so it
    // resolves to None and is treated as a failed save, matching the
    // "one or more storages failed" contract while the "ok" storage succeeds.
    let chain = Chain {
        name: "demo_partial".to_string(),
        stages: vec![],
        storages: vec![
            StageRef {
                name: "ok".to_string(),
                options: HashMap::new(),
            },
            StageRef {
                name: "broken".to_string(),
                options: HashMap::new(),
            },
        ],
        ingress_queues: vec!["q1".to_string()],
        egress_queues: vec!["eq1".to_string()],
        timeout_secs: Some(30),
        enabled: true,
        fan_out: FanOutMode::Parallel,
    };

    let executor = ChainExecutor::new(queue.clone(), Arc::clone(&cache), registry);
    let (outcome, _) = executor.execute(&chain, &uuid).await.unwrap();
    assert_eq!(outcome, ChainOutcome::Success);

    let egress = queue.list_range("eq1", 0, -1).await.unwrap();
    assert!(egress.contains(&uuid));
    assert_eq!(queue.list_len(&chain.dlq_name()).await.unwrap(), 0);
}

#[tokio::test]
async fn scenario_7_reprocess_moves_dlq_items_back_to_queue() {
    let Some((queue, _cache, _registry)) = harness().await else {
        return;
    };
    let uuid = format!("U7-{}", uuid::Uuid::new_v4());
    queue.push_right("DLQ:q7", &uuid).await.unwrap();

    let dlq = vcon_pipe::dlq::DlqManager::without_cache(queue.clone());
    assert!(dlq.list("q7").await.unwrap().contains(&uuid));

    let moved = dlq.reprocess("q7").await.unwrap();
    assert_eq!(moved, 1);
    assert!(!dlq.list("q7").await.unwrap().contains(&uuid));
    assert!(queue.list_range("q7", 0, -1).await.unwrap().contains(&uuid));
}
