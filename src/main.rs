//! Process entry point for the vcon-pipe core: the supervisor binary.
//!
//! Recognized runtime inputs (§6.4) are read from the config document and
//! may be overridden by CLI flags, which in turn default from environment
//! variables — the same override path the teacher used for `REDIS_URL` /
//! `JOBS_STREAM`, widened into a discoverable `clap` surface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use vcon_pipe::cache::{TtlPolicy, VConCache};
use vcon_pipe::config::Config;
use vcon_pipe::dlq::DlqManager;
use vcon_pipe::executor::ChainExecutor;
use vcon_pipe::queue::QueueClient;
use vcon_pipe::registry::StageRegistry;
use vcon_pipe::storage::memory::MemoryStorage;
use vcon_pipe::storage::StorageBackend;
use vcon_pipe::supervisor::Supervisor;

#[derive(Parser)]
#[command(name = "vcon-pipe", about = "vCon processing pipeline core")]
struct Cli {
    /// Path to the declarative configuration document (§6.3).
    #[arg(long, env = "VCON_PIPE_CONFIG", default_value = "config.yaml")]
    config: PathBuf,

    /// Redis endpoint URL; overrides the value in the config document.
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Number of worker processes; overrides the value in the config document.
    #[arg(long, env = "VCON_PIPE_WORKERS")]
    workers: Option<usize>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the supervisor + worker pool (default).
    Run,
    /// Serve the illustrative HTTP boundary (§6.2).
    ServeHttp {
        #[arg(long, default_value = "0.0.0.0:8080")]
        listen: String,
    },
    /// List the contents of a chain's dead-letter queue.
    DlqList { queue: String },
    /// Move every item on a chain's dead-letter queue back to the queue.
    DlqReprocess { queue: String },
    /// Remove a single item from a chain's dead-letter queue.
    DlqPurge { queue: String, uuid: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config_text = std::fs::read_to_string(&cli.config)
        .map_err(|e| anyhow::anyhow!("failed to read config file {:?}: {e}", cli.config))?;
    let mut config = Config::from_yaml(&config_text)?;

    if let Some(redis_url) = cli.redis_url {
        config.runtime.redis_url = redis_url;
    }
    if let Some(workers) = cli.workers {
        config.runtime.worker_count = workers;
    }
    let config = Arc::new(config);

    let queue = QueueClient::connect(&config.runtime.redis_url).await?;

    let storages: Vec<Arc<dyn StorageBackend>> = config
        .storages
        .iter()
        .filter(|(_, def)| def.module == "memory")
        .map(|(name, _)| Arc::new(MemoryStorage::new(name.clone())) as Arc<dyn StorageBackend>)
        .collect();

    let ttl = TtlPolicy {
        document_ttl: std::time::Duration::from_secs(config.runtime.cache_ttl_secs),
        secondary_index_ttl: std::time::Duration::from_secs(
            config.runtime.secondary_index_ttl_secs,
        ),
        dlq_ttl: std::time::Duration::from_secs(config.runtime.dlq_ttl_secs),
    };
    let cache = Arc::new(VConCache::new(
        queue.clone(),
        storages,
        ttl,
        config.runtime.sorted_set_name.clone(),
    ));

    let registry = Arc::new(StageRegistry::new(
        config.stages.clone(),
        config.storages.clone(),
        Arc::clone(&cache),
        std::time::Duration::from_secs(config.runtime.stage_timeout_secs),
    ));

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            let executor = Arc::new(ChainExecutor::new(queue.clone(), cache, registry));
            let supervisor = Supervisor::new(config, queue, executor);
            supervisor.run().await?;
        }
        Command::ServeHttp { listen } => {
            let dlq = DlqManager::new(queue.clone(), Arc::clone(&cache));
            let state = Arc::new(vcon_pipe::http::AppState {
                cache,
                queue,
                dlq,
                config,
            });
            let app = vcon_pipe::http::router(state);
            let listener = tokio::net::TcpListener::bind(&listen).await?;
            tracing::info!(listen = %listen, "serving HTTP boundary");
            axum::serve(listener, app).await?;
        }
        Command::DlqList { queue: queue_name } => {
            let dlq = DlqManager::new(queue.clone(), cache);
            let items = dlq.list(&queue_name).await?;
            for uuid in items {
                println!("{uuid}");
            }
        }
        Command::DlqReprocess { queue: queue_name } => {
            let dlq = DlqManager::new(queue.clone(), cache);
            let count = dlq.reprocess(&queue_name).await?;
            println!("reprocessed {count} item(s)");
        }
        Command::DlqPurge {
            queue: queue_name,
            uuid,
        } => {
            let dlq = DlqManager::new(queue.clone(), cache);
            let count = dlq.purge(&queue_name, &uuid).await?;
            println!("purged {count} item(s)");
        }
    }

    Ok(())
}
