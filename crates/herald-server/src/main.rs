use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use tracing::{info, warn};

use herald_cluster::{
    ClusterTransport, GossipConfig, GossipTransport, KeyStoreConfig, KeyStoreTransport,
    MemoryKeyStore, SingleNodeTransport,
};
use herald_core::{IntegrationFactory, TenantId};
use herald_server::config::{parse_cluster_mode, ClusterMode, HeraldConfig};
use herald_server::integrations::DefaultIntegrationFactory;
use herald_server::metrics::{self, HealthContext};
use herald_server::orchestrator::{
    LocalEngineFactory, Orchestrator, OrchestratorConfig, StaticTenantSource,
    DEFAULT_SHUTDOWN_TIMEOUT,
};
use herald_server::receivers::ReceiverTestSupervisor;
use herald_server::store::{FileConfigStorage, MemoryConfigStorage};
use herald_server::{ConfigStorage, ConfigStore};

#[derive(Parser)]
#[command(name = "herald-server", about = "herald notification routing server")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "HERALD_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind the metrics endpoint to
    #[arg(long, env = "HERALD_HOST")]
    host: Option<String>,

    /// port for prometheus metrics HTTP endpoint (0 = disabled)
    #[arg(long, env = "HERALD_METRICS_PORT")]
    metrics_port: Option<u16>,

    /// directory for persisted tenant configurations. default: in-memory
    #[arg(long, env = "HERALD_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// comma-separated tenant ids to serve
    #[arg(long, env = "HERALD_TENANTS", value_delimiter = ',')]
    tenants: Option<Vec<i64>>,

    /// cluster replication mode: single, gossip, or keystore
    #[arg(long, env = "HERALD_CLUSTER_MODE")]
    cluster_mode: Option<String>,

    /// UDP address for the gossip bus
    #[arg(long, env = "HERALD_GOSSIP_BIND")]
    gossip_bind: Option<String>,

    /// comma-separated seed peers to join through at startup
    #[arg(long, env = "HERALD_SEEDS", value_delimiter = ',')]
    seeds: Option<Vec<String>>,

    /// peers (including self) required before startup settles
    #[arg(long, env = "HERALD_QUORUM")]
    quorum: Option<usize>,

    /// seconds between tenant reconcile passes
    #[arg(long, env = "HERALD_RECONCILE_INTERVAL_SECS")]
    reconcile_interval_secs: Option<u64>,

    /// seconds startup waits for cluster quorum before degrading
    #[arg(long, env = "HERALD_SETTLE_TIMEOUT_SECS")]
    settle_timeout_secs: Option<u64>,

    /// concurrent receiver-test deliveries
    #[arg(long, env = "HERALD_MAX_TEST_WORKERS")]
    max_test_workers: Option<usize>,
}

/// Applies CLI overrides to a `HeraldConfig`. Only `Some` values from
/// the CLI args take effect — this preserves the resolution order:
/// defaults → TOML file → env vars → CLI flags.
fn apply_args(cfg: &mut HeraldConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.bind = host.clone();
    }
    if let Some(port) = args.metrics_port {
        cfg.metrics_port = port;
    }
    if let Some(ref dir) = args.data_dir {
        cfg.data_dir = dir.to_string_lossy().into_owned();
    }
    if let Some(ref tenants) = args.tenants {
        cfg.tenants = tenants.clone();
    }
    if let Some(ref mode) = args.cluster_mode {
        cfg.cluster.mode = mode.clone();
    }
    if let Some(ref bind) = args.gossip_bind {
        cfg.cluster.gossip_bind = bind.clone();
    }
    if let Some(ref seeds) = args.seeds {
        cfg.cluster.seeds = seeds.clone();
    }
    if let Some(quorum) = args.quorum {
        cfg.cluster.quorum = quorum;
    }
    if let Some(v) = args.reconcile_interval_secs {
        cfg.reconcile_interval_secs = v;
    }
    if let Some(v) = args.settle_timeout_secs {
        cfg.settle_timeout_secs = v;
    }
    if let Some(v) = args.max_test_workers {
        cfg.max_test_workers = v;
    }
}

/// Prints `msg` to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

fn parse_socket_addr(input: &str, label: &str) -> SocketAddr {
    match input.parse() {
        Ok(a) => a,
        Err(e) => exit_err(format!("invalid {label} address '{input}': {e}")),
    }
}

async fn build_transport(cfg: &HeraldConfig) -> Arc<dyn ClusterTransport> {
    let mode = parse_cluster_mode(&cfg.cluster.mode).unwrap_or_else(|e| exit_err(e));
    match mode {
        ClusterMode::Single => {
            info!("replication disabled (single-node mode)");
            Arc::new(SingleNodeTransport)
        }
        ClusterMode::Gossip => {
            let gossip_config = GossipConfig {
                bind_addr: parse_socket_addr(&cfg.cluster.gossip_bind, "gossip bind"),
                seeds: cfg
                    .cluster
                    .seeds
                    .iter()
                    .map(|s| parse_socket_addr(s, "seed"))
                    .collect(),
                quorum: cfg.cluster.quorum,
                ..GossipConfig::default()
            };
            match GossipTransport::spawn(gossip_config).await {
                Ok(transport) => transport,
                Err(e) => exit_err(format!("failed to start gossip transport: {e}")),
            }
        }
        ClusterMode::KeyStore => {
            let store_config = KeyStoreConfig {
                liveness_ttl: std::time::Duration::from_secs(cfg.cluster.liveness_ttl_secs.max(1)),
                quorum: cfg.cluster.quorum,
                ..KeyStoreConfig::default()
            };
            // TODO: wire a redis-backed KeyStore behind a feature flag
            let store = Arc::new(MemoryKeyStore::new());
            match KeyStoreTransport::spawn(store, store_config).await {
                Ok(transport) => transport,
                Err(e) => exit_err(format!("failed to start key-store transport: {e}")),
            }
        }
    }
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "herald=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        let cfg = HeraldConfig::default();
        match cfg.to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // build HeraldConfig: defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => HeraldConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => HeraldConfig::default(),
    };
    apply_args(&mut cfg, &args);

    if cfg.tenants.is_empty() {
        warn!("no tenants configured; the server will idle until given some");
    }

    let transport = build_transport(&cfg).await;

    let storage: Arc<dyn ConfigStorage> = match cfg.data_dir_path() {
        Some(dir) => {
            info!(data_dir = %dir.display(), "persisting tenant configurations to disk");
            Arc::new(FileConfigStorage::new(dir))
        }
        None => Arc::new(MemoryConfigStorage::new()),
    };
    let store = Arc::new(ConfigStore::new(storage));

    let integrations: Arc<dyn IntegrationFactory> = Arc::new(DefaultIntegrationFactory::new());
    let supervisor = ReceiverTestSupervisor::new(Arc::clone(&integrations))
        .with_limits(cfg.max_test_workers, cfg.test_timeout());

    let orchestrator = Arc::new(Orchestrator::new(
        transport,
        store,
        Arc::new(LocalEngineFactory::new(integrations)),
        Arc::new(StaticTenantSource::new(
            cfg.tenants.iter().copied().map(TenantId).collect(),
        )),
        supervisor,
        OrchestratorConfig {
            reconcile_interval: cfg.reconcile_interval(),
            settle_timeout: cfg.settle_timeout(),
            default_config: cfg.default_routing_config.clone(),
        },
    ));

    info!(
        tenants = cfg.tenants.len(),
        cluster_mode = %cfg.cluster.mode,
        "herald server starting..."
    );

    if let Err(e) = orchestrator.startup().await {
        exit_err(format!("startup failed: {e}"));
    }
    let reconcile_task = orchestrator.spawn_reconcile_loop();

    if let Some(metrics_port) = cfg.metrics_port() {
        let metrics_addr = parse_socket_addr(&format!("{}:{metrics_port}", cfg.bind), "metrics");
        let handle = match metrics::install_recorder() {
            Ok(h) => h,
            Err(e) => exit_err(format!("failed to install metrics recorder: {e}")),
        };
        metrics::spawn_http_server(
            metrics_addr,
            handle,
            Arc::new(HealthContext {
                orchestrator: Arc::clone(&orchestrator),
                version: env!("CARGO_PKG_VERSION"),
                start_time: Instant::now(),
            }),
        );
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!("failed to listen for shutdown signal: {e}"),
    }

    orchestrator.shutdown(DEFAULT_SHUTDOWN_TIMEOUT).await;
    reconcile_task.abort();
    info!("herald server stopped");
}
