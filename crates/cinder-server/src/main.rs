mod cluster;
mod commands;
mod config;
mod connection;
mod frame;
mod parse;
mod server;
mod store;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use cinder_cluster::{ClusterConfig, ClusterHandle, NodeId, NodeRole};
use clap::Parser;
use tracing::{info, warn};

use crate::cluster::ClusterCoordinator;
use crate::config::CinderConfig;
use crate::store::ConfigStore;

#[derive(Parser)]
#[command(name = "cinder-server", about = "cinder cluster node")]
struct Args {
    /// path to TOML configuration file
    #[arg(short = 'c', long, env = "CINDER_CONFIG")]
    config: Option<PathBuf>,

    /// print default configuration as TOML and exit
    #[arg(long)]
    config_template: bool,

    /// address to bind to and advertise to peers
    #[arg(long, env = "CINDER_HOST")]
    host: Option<String>,

    /// admin port
    #[arg(short, long, env = "CINDER_PORT")]
    port: Option<u16>,

    /// gossip runs over UDP on port + this offset
    #[arg(long, env = "CINDER_GOSSIP_PORT_OFFSET")]
    gossip_port_offset: Option<u16>,

    /// directory for the cluster config file
    #[arg(long, env = "CINDER_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// cluster config file name inside the data directory
    #[arg(long, env = "CINDER_CONFIG_FILE")]
    config_file: Option<String>,

    /// number of hash slots. only used when creating a new cluster config
    #[arg(long, env = "CINDER_SLOT_COUNT")]
    slot_count: Option<u16>,

    /// hostname announced to peers
    #[arg(long, env = "CINDER_HOSTNAME")]
    hostname: Option<String>,

    /// gossip endpoints to contact on startup (host:port, comma separated)
    #[arg(long = "seed", env = "CINDER_SEEDS", value_delimiter = ',')]
    seeds: Vec<SocketAddr>,

    /// milliseconds between gossip rounds
    #[arg(long, env = "CINDER_GOSSIP_INTERVAL_MS")]
    gossip_interval_ms: Option<u64>,

    /// default ban for CLUSTER FORGET, in seconds
    #[arg(long, env = "CINDER_FORGET_BAN_SECS")]
    forget_ban_secs: Option<u64>,

    /// maximum concurrent admin connections
    #[arg(long, env = "CINDER_MAX_CONNECTIONS")]
    max_connections: Option<usize>,
}

/// Applies CLI/env overrides on top of the file config. Only flags that
/// were actually given replace a value.
fn apply_args(cfg: &mut CinderConfig, args: &Args) {
    if let Some(ref host) = args.host {
        cfg.bind = host.clone();
    }
    if let Some(port) = args.port {
        cfg.port = port;
    }
    if let Some(offset) = args.gossip_port_offset {
        cfg.gossip_port_offset = offset;
    }
    if let Some(ref dir) = args.data_dir {
        cfg.data_dir = dir.clone();
    }
    if let Some(ref file) = args.config_file {
        cfg.config_file = file.clone();
    }
    if let Some(count) = args.slot_count {
        cfg.slot_count = count;
    }
    if let Some(ref hostname) = args.hostname {
        cfg.hostname = hostname.clone();
    }
    if !args.seeds.is_empty() {
        cfg.seeds = args.seeds.clone();
    }
    if let Some(ms) = args.gossip_interval_ms {
        cfg.gossip_interval_ms = ms;
    }
    if let Some(secs) = args.forget_ban_secs {
        cfg.forget_ban_secs = secs;
    }
    if let Some(max) = args.max_connections {
        cfg.max_connections = max;
    }
}

/// Prints an error message to stderr and exits with code 1.
fn exit_err(msg: impl std::fmt::Display) -> ! {
    eprintln!("{msg}");
    std::process::exit(1);
}

/// Parses a `host:port` pair into a `SocketAddr`. Exits with a message on failure.
fn parse_bind_addr(host: &str, port: u16) -> SocketAddr {
    match format!("{host}:{port}").parse() {
        Ok(a) => a,
        Err(e) => exit_err(format!("invalid bind address '{host}:{port}': {e}")),
    }
}

/// Loads the persisted cluster config, or creates and saves a fresh one.
///
/// A fresh node stamps its own record with a bumped epoch so peers that
/// already hold a stale record for the same id take the new one. A loaded
/// config whose advertised endpoint no longer matches the settings is
/// rebound the same way.
fn load_or_init(cfg: &CinderConfig, store: &ConfigStore) -> Result<ClusterConfig, String> {
    let path = store.path().display();
    let loaded = store
        .load()
        .map_err(|e| format!("failed to load cluster config '{path}': {e}"))?;

    let config = match loaded {
        Some(mut config) => {
            let me = config.my_id();
            info!(
                node = %me,
                epoch = config.epoch(),
                workers = config.worker_count(),
                "loaded cluster config"
            );
            if config.slot_count() != cfg.slot_count {
                warn!(
                    stored = config.slot_count(),
                    configured = cfg.slot_count,
                    "slot_count differs from the stored config, keeping the stored value"
                );
            }
            if config.myself().endpoint() == (cfg.bind.as_str(), cfg.port) {
                return Ok(config);
            }
            config
                .set_worker_address(me, &cfg.bind, cfg.port)
                .and_then(|()| config.bump_epoch(me))
                .map_err(|e| format!("failed to rebind local node: {e}"))?;
            info!(address = %cfg.bind, port = cfg.port, "advertised endpoint changed");
            config
        }
        None => {
            let me = NodeId::new();
            let config = ClusterConfig::initialize_local_worker(
                me,
                &cfg.bind,
                cfg.port,
                0,
                NodeRole::Primary,
                None,
                &cfg.hostname,
            )
            .and_then(|config| config.with_slot_count(cfg.slot_count))
            .and_then(|mut config| config.bump_epoch(me).map(|_| config))
            .map_err(|e| format!("failed to create cluster config: {e}"))?;
            info!(node = %me, slots = cfg.slot_count, "created new cluster config");
            config
        }
    };

    store
        .save(&config)
        .map_err(|e| format!("failed to save cluster config '{path}': {e}"))?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cinder=info".into()),
        )
        .init();

    let args = Args::parse();

    // --config-template: dump defaults and exit
    if args.config_template {
        match CinderConfig::default().to_toml() {
            Ok(toml) => {
                println!("{toml}");
                std::process::exit(0);
            }
            Err(e) => exit_err(format!("failed to generate config template: {e}")),
        }
    }

    // build CinderConfig: defaults → TOML file → CLI/env overrides
    let mut cfg = match &args.config {
        Some(path) => CinderConfig::from_file(path).unwrap_or_else(|e| exit_err(e)),
        None => CinderConfig::default(),
    };
    apply_args(&mut cfg, &args);
    if let Err(e) = cfg.validate() {
        exit_err(e);
    }

    let addr = parse_bind_addr(&cfg.bind, cfg.port);

    if let Err(e) = std::fs::create_dir_all(&cfg.data_dir) {
        exit_err(format!(
            "failed to create data dir '{}': {e}",
            cfg.data_dir.display()
        ));
    }
    let store = ConfigStore::new(cfg.config_path());
    let config = load_or_init(&cfg, &store).unwrap_or_else(|e| exit_err(e));
    let handle = Arc::new(ClusterHandle::new(config));
    let coordinator = Arc::new(ClusterCoordinator::new(
        handle,
        Some(store),
        cfg.forget_ban(),
        cfg.gossip_port_offset,
        cfg.seeds.clone(),
    ));

    let socket = cluster::bind_gossip(addr, cfg.gossip_port_offset)
        .await
        .unwrap_or_else(|e| exit_err(format!("failed to bind gossip socket: {e}")));
    let _gossip = coordinator.spawn_gossip(socket, cfg.gossip_interval());

    let my_id = coordinator.handle().read(|c| c.my_id());
    info!(node = %my_id, "cinder node starting");
    if let Err(e) = server::run(addr, coordinator, cfg.max_connections).await {
        exit_err(format!("server error: {e}"));
    }
}
