use std::path::Path;
use std::sync::Arc;

use tracing::{error, info};

use pipebft::config::NodeConfig;
use pipebft::consensus::ConsensusState;
use pipebft::metrics::{Metrics, MetricsServer};
use pipebft::privval::FilePrivValidator;
use pipebft::state::{BlockExecutor, MemoryEvidencePool, NoopApplication, NoopMempool};
use pipebft::storage::{BlockStore, StateStore};
use pipebft::types::Genesis;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -------------------------------------------------------
    // 0. Configuration + logging
    // -------------------------------------------------------
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "config/node.toml".to_string());
    let cfg = NodeConfig::load_or_default(Path::new(&config_path));

    init_logging(&cfg.logging);

    info!(config_path = %config_path, "Loading configuration");

    // -------------------------------------------------------
    // 1. Metrics
    // -------------------------------------------------------
    let metrics = Arc::new(Metrics::new());

    if cfg.observability.metrics_enabled {
        let metrics_server = MetricsServer::new(
            cfg.observability.metrics_listen_addr.clone(),
            metrics.clone(),
        );
        info!(addr = %cfg.observability.metrics_listen_addr, "Starting metrics exporter");
        tokio::spawn(async move {
            if let Err(e) = metrics_server.run().await {
                error!(error = %e, "Metrics server error");
            }
        });
    }

    // -------------------------------------------------------
    // 2. Storage
    // -------------------------------------------------------
    std::fs::create_dir_all(&cfg.node.data_dir)?;
    let blocks_path = format!("{}/blocks", cfg.node.data_dir);
    let state_path = format!("{}/state", cfg.node.data_dir);
    let block_store = Arc::new(BlockStore::open(Path::new(&blocks_path))?);
    let state_store = Arc::new(StateStore::open(Path::new(&state_path))?);

    info!(engine = "rocksdb", data_dir = %cfg.node.data_dir, "Initializing storage");

    // -------------------------------------------------------
    // 3. Chain state: resume, or bootstrap from genesis
    // -------------------------------------------------------
    let state = match state_store.load_state()? {
        Some(state) => {
            info!(height = state.last_block_height, "Loading last committed state");
            state
        }
        None => {
            let genesis = Genesis::load(Path::new(&cfg.node.genesis_file))?;
            info!(chain_id = %genesis.chain_id, "Bootstrapping from genesis");
            state_store.bootstrap(&genesis)?
        }
    };

    info!(
        validators = state.validators.len(),
        total_power = state.validators.total_power(),
        len_ulb = state.len_ulb(),
        "Loaded validator set"
    );

    // -------------------------------------------------------
    // 4. Private validator
    // -------------------------------------------------------
    let key_path = format!("{}/priv_validator_key.json", cfg.node.data_dir);
    let pv_state_path = format!("{}/priv_validator_state.json", cfg.node.data_dir);
    let priv_validator =
        FilePrivValidator::load_or_generate(Path::new(&key_path), Path::new(&pv_state_path))?;
    info!(address = %priv_validator.address(), "Loaded private validator");

    // -------------------------------------------------------
    // 5. Executor + coordinator
    // -------------------------------------------------------
    let executor = BlockExecutor::new(
        state_store.clone(),
        block_store.clone(),
        Arc::new(NoopApplication),
        Arc::new(NoopMempool),
        Arc::new(MemoryEvidencePool::new()),
    );

    let consensus = ConsensusState::new(cfg.consensus_config(), state, executor, metrics)?;
    consensus.set_priv_validator(priv_validator);

    let wal_path = format!("{}/cs.wal", cfg.node.data_dir);
    consensus.start(Some(Path::new(&wal_path)))?;

    info!(height = consensus.get_last_height() + 1, "Node started");

    // -------------------------------------------------------
    // 6. Graceful shutdown
    // -------------------------------------------------------
    tokio::signal::ctrl_c().await.ok();
    info!("Shutdown initiated");
    consensus.stop();

    let consensus_wait = consensus.clone();
    tokio::task::spawn_blocking(move || consensus_wait.wait()).await?;

    info!("Node stopped");
    Ok(())
}

fn init_logging(cfg: &pipebft::config::LoggingSection) {
    use tracing_subscriber::EnvFilter;

    let env_filter = if let Some(ref module_levels) = cfg.module_levels {
        EnvFilter::try_new(module_levels).unwrap_or_else(|_| EnvFilter::new(&cfg.level))
    } else {
        EnvFilter::try_from_env("RUST_LOG").unwrap_or_else(|_| EnvFilter::new(&cfg.level))
    };

    if cfg.format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .init();
    }
}
