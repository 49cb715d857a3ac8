//! Supervisor (C6, §4.6).
//!
//! Spawns N worker slots and monitors their exits: clean (graceful)
//! shutdowns are not restarted; unexpected exits are restarted after a
//! short backoff, up to a cap, past which the slot is marked permanently
//! failed and a fatal signal is surfaced.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{error, info, warn};

use crate::config::{Config, ProcessModel};
use crate::executor::ChainExecutor;
use crate::queue::QueueClient;
use crate::worker::WorkerLoop;

const RESTART_CAP: usize = 5;
const RESTART_WINDOW: Duration = Duration::from_secs(300);
const RESTART_BACKOFF: Duration = Duration::from_secs(2);

/// Tracks the restart history for one worker slot, to enforce "up to N
/// restarts per window" (§4.6).
struct RestartBudget {
    history: VecDeque<Instant>,
}

impl RestartBudget {
    fn new() -> Self {
        Self {
            history: VecDeque::new(),
        }
    }

    /// Record a restart attempt now; return whether it's still within
    /// budget.
    fn record_and_check(&mut self) -> bool {
        let now = Instant::now();
        while let Some(front) = self.history.front() {
            if now.duration_since(*front) > RESTART_WINDOW {
                self.history.pop_front();
            } else {
                break;
            }
        }
        self.history.push_back(now);
        self.history.len() <= RESTART_CAP
    }
}

pub struct Supervisor {
    config: Arc<Config>,
    queue: QueueClient,
    executor: Arc<ChainExecutor>,
}

impl Supervisor {
    pub fn new(config: Arc<Config>, queue: QueueClient, executor: Arc<ChainExecutor>) -> Self {
        Self {
            config,
            queue,
            executor,
        }
    }

    /// Run the supervisor until every worker slot has exited (cleanly or
    /// permanently failed) or the process receives a termination signal.
    pub async fn run(&self) -> anyhow::Result<()> {
        let worker_count = self.config.runtime.worker_count.max(1);
        let shutdown = Arc::new(tokio::sync::Notify::new());
        let mut handles = Vec::with_capacity(worker_count);

        for slot in 0..worker_count {
            let handle = self.spawn_supervised_slot(slot, Arc::clone(&shutdown));
            handles.push(handle);
        }

        // Forward external termination signals to every worker.
        let shutdown_for_signal = Arc::clone(&shutdown);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("termination signal received; forwarding shutdown to all workers");
                shutdown_for_signal.notify_waiters();
            }
        });

        for handle in handles {
            let _ = handle.await;
        }
        Ok(())
    }

    fn spawn_supervised_slot(
        &self,
        slot: usize,
        shutdown: Arc<tokio::sync::Notify>,
    ) -> tokio::task::JoinHandle<()> {
        let config = Arc::clone(&self.config);
        let queue = self.queue.clone();
        let executor = Arc::clone(&self.executor);
        let process_model = config.runtime.process_model;

        tokio::spawn(async move {
            let budget = Arc::new(Mutex::new(RestartBudget::new()));
            loop {
                let worker = Arc::new(WorkerLoop::new(
                    slot,
                    queue.clone(),
                    Arc::clone(&config),
                    Arc::clone(&executor),
                ));
                let shutdown_flag = worker.shutdown_handle();

                let shutdown_notified = Arc::clone(&shutdown);
                let watcher = {
                    let shutdown_flag = Arc::clone(&shutdown_flag);
                    tokio::spawn(async move {
                        shutdown_notified.notified().await;
                        shutdown_flag.store(true, std::sync::atomic::Ordering::SeqCst);
                    })
                };

                info!(slot, ?process_model, "spawning worker");
                let result = worker.run().await;
                watcher.abort();

                let graceful = shutdown_flag.load(std::sync::atomic::Ordering::SeqCst);

                match result {
                    Ok(()) if graceful => {
                        info!(slot, "worker exited cleanly; not restarting");
                        return;
                    }
                    Ok(()) => {
                        warn!(slot, "worker exited unexpectedly without error; considering restart");
                    }
                    Err(e) => {
                        error!(slot, err = %e, "worker exited with error; considering restart");
                    }
                }

                let within_budget = budget.lock().await.record_and_check();
                if !within_budget {
                    error!(
                        slot,
                        "worker slot exceeded restart budget ({RESTART_CAP} restarts / {:?}); marking permanently failed",
                        RESTART_WINDOW
                    );
                    return;
                }

                tokio::time::sleep(RESTART_BACKOFF).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn restart_budget_allows_up_to_cap_within_window() {
        let mut budget = RestartBudget::new();
        for _ in 0..RESTART_CAP {
            assert!(budget.record_and_check());
        }
        assert!(!budget.record_and_check());
    }
}
