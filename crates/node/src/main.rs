#[macro_use]
mod logging;
mod coordinator;
mod p2p;
mod peers;
mod wallet;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use finch_chain::HeaderChain;
use finch_consensus::{ChainParams, Network};
use finch_primitives::bloom::BloomFilter;
use finch_storage::memory::MemoryStore;
use finch_storage::KeyValueStore;
use rand::seq::SliceRandom;
use serde::Deserialize;
use tokio::net::lookup_host;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

use crate::coordinator::{ClientRequest, SpvCoordinator, HEARTBEAT_INTERVAL};
use crate::p2p::PeerEvent;
use crate::wallet::LogWallet;

const DEFAULT_PEER_TARGET: usize = 4;
const PEER_RETRY_SECS: u64 = 5;
const EVENT_QUEUE: usize = 1024;
const REQUEST_QUEUE: usize = 64;
const BLOOM_FP_RATE: f64 = 0.0001;
const BLOOM_UPDATE_ALL: u8 = 1;

const USAGE: &str = "finchd - simplified payment verification node

USAGE:
    finchd [OPTIONS]

OPTIONS:
    --network <mainnet|testnet|regtest>   chain to follow (default mainnet)
    --datadir <path>                      data directory (default ./finchd-data)
    --backend <fjall|memory>              header store backend
    --connect <host[:port]>               peer to connect to; repeatable,
                                          replaces the built-in seed list
    --peers <n>                           outbound connection target (default 4)
    --fast-catchup <unixtime>             skip merkle blocks older than this
    --watch <hex>                         data pushed into the bloom filter;
                                          repeatable (pubkey hash, txid, ...)
    --conf <file>                         JSON config file
    --log-level <error|warn|info|debug>   log verbosity (default info)
";

#[derive(Clone, Copy, Debug)]
enum Backend {
    Memory,
    #[cfg(feature = "fjall")]
    Fjall,
}

impl Backend {
    fn parse(value: &str) -> Option<Self> {
        match value {
            "memory" => Some(Self::Memory),
            #[cfg(feature = "fjall")]
            "fjall" => Some(Self::Fjall),
            _ => None,
        }
    }

    fn default_backend() -> Self {
        #[cfg(feature = "fjall")]
        {
            Self::Fjall
        }
        #[cfg(not(feature = "fjall"))]
        {
            Self::Memory
        }
    }
}

struct Config {
    network: Network,
    data_dir: PathBuf,
    backend: Backend,
    fast_catchup: u32,
    connect: Vec<String>,
    peer_target: usize,
    watch: Vec<Vec<u8>>,
    log_level: u8,
}

/// Optional JSON config; command-line flags seen after `--conf` override it.
#[derive(Default, Deserialize)]
struct ConfigFile {
    network: Option<String>,
    fast_catchup: Option<u32>,
    seed_peers: Option<Vec<String>>,
    watch: Option<Vec<String>>,
}

fn parse_args() -> Result<Config, String> {
    let mut config = Config {
        network: Network::Mainnet,
        data_dir: PathBuf::from("./finchd-data"),
        backend: Backend::default_backend(),
        fast_catchup: 0,
        connect: Vec::new(),
        peer_target: DEFAULT_PEER_TARGET,
        watch: Vec::new(),
        log_level: logging::LEVEL_INFO,
    };
    if let Ok(value) = std::env::var("FINCHD_LOG") {
        if let Some(level) = logging::parse_level(&value) {
            config.log_level = level;
        }
    }

    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--network" => {
                let value = args.next().ok_or("--network requires a value")?;
                config.network =
                    Network::parse(&value).ok_or(format!("unknown network {value}"))?;
            }
            "--datadir" => {
                let value = args.next().ok_or("--datadir requires a value")?;
                config.data_dir = PathBuf::from(value);
            }
            "--backend" => {
                let value = args.next().ok_or("--backend requires a value")?;
                config.backend =
                    Backend::parse(&value).ok_or(format!("unknown backend {value}"))?;
            }
            "--connect" => {
                let value = args.next().ok_or("--connect requires a value")?;
                config.connect.push(value);
            }
            "--peers" => {
                let value = args.next().ok_or("--peers requires a value")?;
                config.peer_target = value
                    .parse()
                    .map_err(|_| format!("invalid peer count {value}"))?;
            }
            "--fast-catchup" => {
                let value = args.next().ok_or("--fast-catchup requires a value")?;
                config.fast_catchup = value
                    .parse()
                    .map_err(|_| format!("invalid timestamp {value}"))?;
            }
            "--watch" => {
                let value = args.next().ok_or("--watch requires a value")?;
                config.watch.push(decode_hex(&value)?);
            }
            "--conf" => {
                let path = args.next().ok_or("--conf requires a value")?;
                apply_config_file(&mut config, &path)?;
            }
            "--log-level" => {
                let value = args.next().ok_or("--log-level requires a value")?;
                config.log_level = logging::parse_level(&value)
                    .ok_or(format!("unknown log level {value}"))?;
            }
            "--help" | "-h" => {
                print!("{USAGE}");
                std::process::exit(0);
            }
            other => return Err(format!("unknown argument {other}; try --help")),
        }
    }
    Ok(config)
}

fn apply_config_file(config: &mut Config, path: &str) -> Result<(), String> {
    let contents =
        std::fs::read_to_string(path).map_err(|err| format!("failed to read {path}: {err}"))?;
    let file: ConfigFile = serde_json::from_str(&contents)
        .map_err(|err| format!("invalid config file {path}: {err}"))?;
    if let Some(network) = file.network {
        config.network = Network::parse(&network).ok_or(format!("unknown network {network}"))?;
    }
    if let Some(timestamp) = file.fast_catchup {
        config.fast_catchup = timestamp;
    }
    if let Some(peers) = file.seed_peers {
        config.connect.extend(peers);
    }
    if let Some(watch) = file.watch {
        for item in watch {
            config.watch.push(decode_hex(&item)?);
        }
    }
    Ok(())
}

fn decode_hex(input: &str) -> Result<Vec<u8>, String> {
    if input.len() % 2 != 0 {
        return Err(format!("hex string {input} has odd length"));
    }
    let mut bytes = Vec::with_capacity(input.len() / 2);
    let mut chars = input.chars();
    while let (Some(high), Some(low)) = (chars.next(), chars.next()) {
        let high = high
            .to_digit(16)
            .ok_or_else(|| format!("invalid hex in {input}"))?;
        let low = low
            .to_digit(16)
            .ok_or_else(|| format!("invalid hex in {input}"))?;
        bytes.push(((high << 4) | low) as u8);
    }
    Ok(bytes)
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("{err}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), String> {
    let config = parse_args()?;
    logging::set_log_level(config.log_level);
    let params = Arc::new(ChainParams::for_network(config.network));
    println!("finchd starting on {}", params.name);

    match config.backend {
        Backend::Memory => run_node(Arc::new(MemoryStore::new()), params, config).await,
        #[cfg(feature = "fjall")]
        Backend::Fjall => {
            let path = config.data_dir.join(params.name);
            let store = finch_storage::fjall::FjallStore::open(&path)
                .map_err(|err| format!("failed to open store at {}: {err}", path.display()))?;
            run_node(Arc::new(store), params, config).await
        }
    }
}

async fn run_node<S>(
    store: Arc<S>,
    params: Arc<ChainParams>,
    config: Config,
) -> Result<(), String>
where
    S: KeyValueStore + Send + Sync + 'static,
{
    let chain = HeaderChain::new(store, params.as_ref().clone());
    let coordinator = SpvCoordinator::new(chain, LogWallet, config.fast_catchup)?;
    let start_height = coordinator
        .chain()
        .best_tip()
        .map_err(|err| err.to_string())?
        .height;
    println!("Header chain at height {start_height}");

    let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE);
    let (request_tx, request_rx) = mpsc::channel(REQUEST_QUEUE);

    if config.watch.is_empty() {
        println!("No watch items; running header sync only");
    } else {
        let mut filter = BloomFilter::new(
            config.watch.len(),
            BLOOM_FP_RATE,
            rand::random(),
            BLOOM_UPDATE_ALL,
        );
        for item in &config.watch {
            filter.insert(item);
        }
        println!("Watching {} item(s)", config.watch.len());
        let _ = request_tx.send(ClientRequest::UpdateBloom(filter)).await;
    }

    tokio::spawn(coordinator.run(event_rx, request_rx));

    let heartbeat_tx = request_tx.clone();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if heartbeat_tx.send(ClientRequest::Heartbeat).await.is_err() {
                break;
            }
        }
    });

    let addrs = resolve_peer_addrs(params.as_ref(), &config).await?;
    if addrs.is_empty() {
        log_warn!("no peer addresses; use --connect or a network with seeds");
    } else {
        log_info!("{} candidate peer address(es)", addrs.len());
        tokio::spawn(maintain_peers(
            Arc::clone(&params),
            addrs,
            config.peer_target,
            start_height as i32,
            event_tx.clone(),
        ));
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|err| err.to_string())?;
    println!("Shutdown requested; exiting.");
    Ok(())
}

/// Keeps up to `target` outbound sessions alive, cycling through the
/// candidate list as sessions die.
async fn maintain_peers(
    params: Arc<ChainParams>,
    addrs: Vec<SocketAddr>,
    target: usize,
    start_height: i32,
    events: mpsc::Sender<PeerEvent>,
) {
    let mut sessions: JoinSet<()> = JoinSet::new();
    let mut cursor = 0usize;
    loop {
        while sessions.len() < target.max(1) {
            let addr = addrs[cursor % addrs.len()];
            cursor += 1;
            let peer = p2p::next_peer_id();
            let params = Arc::clone(&params);
            let events = events.clone();
            sessions.spawn(async move {
                log_debug!("peer {peer}: connecting to {addr}");
                if let Err(err) = p2p::run_peer(peer, addr, params, start_height, events).await {
                    log_debug!("peer {peer} ({addr}): session ended: {err}");
                }
            });
        }
        if sessions.join_next().await.is_none() {
            break;
        }
        if events.is_closed() {
            break;
        }
        tokio::time::sleep(Duration::from_secs(PEER_RETRY_SECS)).await;
    }
}

async fn resolve_peer_addrs(
    params: &ChainParams,
    config: &Config,
) -> Result<Vec<SocketAddr>, String> {
    let mut addrs: Vec<SocketAddr> = Vec::new();
    if config.connect.is_empty() {
        for seed in params.seeds {
            match lookup_host((*seed, params.default_port)).await {
                Ok(resolved) => addrs.extend(resolved),
                Err(err) => log_warn!("seed {seed} did not resolve: {err}"),
            }
        }
        addrs.shuffle(&mut rand::thread_rng());
    } else {
        for value in &config.connect {
            let target = if value.contains(':') {
                value.clone()
            } else {
                format!("{value}:{}", params.default_port)
            };
            let resolved = lookup_host(target.as_str())
                .await
                .map_err(|err| format!("failed to resolve {target}: {err}"))?;
            addrs.extend(resolved);
        }
    }
    let mut seen = std::collections::HashSet::new();
    addrs.retain(|addr| seen.insert(*addr));
    Ok(addrs)
}
