//! Worker Loop (C5, §4.5).
//!
//! One worker: multiplexed atomic pop across every enabled chain's ingress
//! queues, a per-item timeout, and graceful-shutdown signal handling. The
//! worker is otherwise single-threaded for stage execution — chains
//! dispatched from the same popped UUID run serially within this worker
//! (§5); the only concurrency is the storage fan-out inside the executor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::config::Config;
use crate::executor::ChainExecutor;
use crate::queue::QueueClient;

pub struct WorkerLoop {
    id: usize,
    queue: QueueClient,
    config: Arc<Config>,
    executor: Arc<ChainExecutor>,
    shutdown: Arc<AtomicBool>,
}

impl WorkerLoop {
    pub fn new(
        id: usize,
        queue: QueueClient,
        config: Arc<Config>,
        executor: Arc<ChainExecutor>,
    ) -> Self {
        Self {
            id,
            queue,
            config,
            executor,
            shutdown: Arc::new(AtomicBool::new(false)),
        }
    }

    /// A clone-able handle the supervisor (or a signal handler) can use to
    /// request this worker shut down.
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Run until shutdown is requested and the grace period (if any
    /// in-flight item needs it) has elapsed.
    pub async fn run(&self) -> anyhow::Result<()> {
        let ingress_queues = self.config.active_ingress_queues();
        let pop_timeout = Duration::from_secs(self.config.runtime.pop_timeout_secs);
        let grace_period = Duration::from_secs(self.config.runtime.shutdown_grace_secs);

        info!(worker = self.id, queues = ?ingress_queues, "worker started");

        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                info!(worker = self.id, "shutdown requested while idle; exiting");
                return Ok(());
            }

            let popped = self
                .queue
                .blocking_pop_multi(&ingress_queues, pop_timeout)
                .await?;

            let Some((queue_name, uuid)) = popped else {
                // Timeout, no item: re-check shutdown flag and loop (§4.5 step 2a).
                continue;
            };

            debug!(worker = self.id, queue = %queue_name, uuid = %uuid, "popped item");

            let matching_chains: Vec<_> = self
                .config
                .chains_for_queue(&queue_name)
                .into_iter()
                .cloned()
                .collect();

            let executor = Arc::clone(&self.executor);
            let uuid_for_task = uuid.clone();
            let run_chains = async move {
                for chain in &matching_chains {
                    match executor.execute(chain, &uuid_for_task).await {
                        Ok((outcome, report)) => {
                            info!(
                                worker = "chains",
                                chain = %chain.name,
                                uuid = %uuid_for_task,
                                outcome = ?outcome,
                                duration_ms = report.total_duration.as_millis(),
                                "chain execution complete"
                            );
                        }
                        Err(e) => {
                            warn!(chain = %chain.name, uuid = %uuid_for_task, err = %e, "chain execution errored");
                        }
                    }
                }
            };

            // The grace bound only applies once shutdown has been requested
            // (§4.5 step 3: "on receipt of termination signal ... allow to
            // complete"). During normal operation a chain runs unbounded
            // here — its per-stage timeouts already bound it (§5) — so a
            // legitimately slow multi-stage chain is never aborted and
            // spuriously re-enqueued.
            if self.shutdown.load(Ordering::SeqCst) {
                match tokio::time::timeout(grace_period, run_chains).await {
                    Ok(()) => {}
                    Err(_elapsed) => {
                        // Grace period elapsed mid-chain: re-push to the head
                        // of the originating queue and exit (§4.5 step 3,
                        // §4.4 "executor crash between stages" recovery path).
                        warn!(
                            worker = self.id,
                            queue = %queue_name,
                            uuid = %uuid,
                            "shutdown grace period elapsed mid-chain; re-enqueueing and exiting"
                        );
                        self.queue.push_left(&queue_name, &uuid).await?;
                        return Ok(());
                    }
                }
            } else {
                run_chains.await;
            }

            if self.shutdown.load(Ordering::SeqCst) {
                info!(worker = self.id, "shutdown requested after completing item; exiting");
                return Ok(());
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{TtlPolicy, VConCache};
    use crate::config::Config;
    use crate::registry::StageRegistry;
    use std::collections::HashMap;

    async fn test_queue() -> Option<QueueClient> {
        let url = std::env::var("VCON_PIPE_TEST_REDIS_URL").ok()?;
        QueueClient::connect(&url).await.ok()
    }

    #[tokio::test]
    async fn shutdown_flag_stops_worker_loop_promptly() {
        let Some(queue) = test_queue().await else {
            return;
        };
        let yaml = r#"
runtime:
  pop_timeout_secs: 1
  shutdown_grace_secs: 5
chains:
  empty_chain:
    ingress_queues: ["worker_test_q_empty"]
"#;
        let config = Arc::new(Config::from_yaml(yaml).unwrap());
        let cache = Arc::new(VConCache::new(
            queue.clone(),
            vec![],
            TtlPolicy::default(),
            "vcons_test",
        ));
        let registry = Arc::new(StageRegistry::new(
            HashMap::new(),
            HashMap::new(),
            cache.clone(),
            Duration::from_secs(30),
        ));
        let executor = Arc::new(ChainExecutor::new(queue.clone(), cache, registry));
        let worker = WorkerLoop::new(0, queue, config, executor);
        worker.request_shutdown();
        let result = tokio::time::timeout(Duration::from_secs(5), worker.run()).await;
        assert!(result.is_ok(), "worker should exit promptly once shutdown is requested and it is idle");
    }
}
