//! Trustweave CLI
//!
//! Thin wrapper around trustweave-core for command-line usage.
//!
//! ## Usage
//!
//! ```bash
//! # Show identity, data directory and config
//! trustweave info
//!
//! # Show the full account and device identity
//! trustweave identity
//!
//! # Privately block an account on this device
//! trustweave block <account_id>
//! trustweave unblock <account_id>
//! trustweave blocks
//!
//! # Propagate trust through a small in-memory network and rank its items
//! trustweave --depth 2 demo --count 3
//!
//! # Announce presence over iroh gossip
//! trustweave serve --peer <endpoint_id_hex>
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::{debug, info};
use trustweave_core::identity::{authorize_device, devices_store};
use trustweave_core::presence::GossipTransport;
use trustweave_core::{
    default_data_dir, publish_item, published_items, stored_quality, track_network, track_search,
    AccountId, Address, IrohTransport, Keypair, LocalIdentity, LocalStorage, MemoryBackend,
    NetworkView, NodeConfig, PresenceConfig, PresenceService, PrivateBlockList, RankedItem,
    SearchOptions, StoreOp, StoreRef, StoreRegistry, StoreReplicator, TrustContext, TrustStatus,
    TrustStore,
};

/// Trustweave - trust-weighted P2P data
#[derive(Parser)]
#[command(name = "trustweave")]
#[command(version = "0.1.0")]
#[command(about = "Trustweave - trust-weighted P2P data")]
struct Cli {
    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Data directory (default: ~/.trustweave/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    /// Network depth (default from config)
    #[arg(long, global = true)]
    depth: Option<usize>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show node information
    Info,

    /// Show the local account and device identity
    Identity,

    /// Privately block an account on this device
    Block {
        /// Account id (base58)
        account: String,
    },

    /// Remove an account from the private block list
    Unblock {
        /// Account id (base58)
        account: String,
    },

    /// List privately blocked accounts
    Blocks,

    /// Run trust propagation and search over a small in-memory network
    Demo {
        /// Number of ranked items to show
        #[arg(short, long, default_value_t = 3)]
        count: usize,
    },

    /// Announce presence over iroh gossip until interrupted
    Serve {
        /// Bootstrap peer endpoint id (hex), may be repeated
        #[arg(long)]
        peer: Vec<String>,
    },
}

fn setup_logging(verbosity: u8) {
    let filter = match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Parse an account id from base58
fn parse_account(s: &str) -> Result<AccountId> {
    AccountId::parse(s).map_err(|e| anyhow::anyhow!("Invalid account ID '{}': {}", s, e))
}

/// Parse a peer endpoint ID from hex string
fn parse_endpoint_id(s: &str) -> Result<iroh::PublicKey> {
    let bytes = hex::decode(s).map_err(|e| anyhow::anyhow!("Invalid hex format: {}", e))?;
    if bytes.len() != 32 {
        anyhow::bail!("Endpoint ID must be 32 bytes (got {})", bytes.len());
    }
    let mut array = [0u8; 32];
    array.copy_from_slice(&bytes);
    iroh::PublicKey::from_bytes(&array).map_err(|e| anyhow::anyhow!("Invalid public key: {}", e))
}

fn open_storage(data_dir: &std::path::Path) -> Result<LocalStorage> {
    Ok(LocalStorage::new(data_dir.join("trustweave.redb"))?)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    setup_logging(cli.verbose);

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);
    let config = NodeConfig::load(&data_dir)?;
    let depth = cli.depth.unwrap_or(config.default_depth);

    match cli.command {
        Commands::Info => {
            let storage = open_storage(&data_dir)?;
            let identity = LocalIdentity::load_or_create(&storage)?;
            let blocks = PrivateBlockList::open(storage)?;

            println!("Trustweave v0.1.0");
            println!();
            println!("Identity:");
            println!("  Account: {}", identity.account_id());
            println!("  Device: {}", identity.device_id());
            println!();
            println!("Config:");
            println!("  Presence interval: {}s", config.presence_interval().as_secs());
            println!("  Online window: {}s", config.online_window().as_secs());
            println!("  Search debounce: {}s", config.search_debounce().as_secs());
            println!("  Network depth: {}", depth);
            println!();
            println!("Private blocks: {}", blocks.list().len());
            println!("Data directory: {}", data_dir.display());
        }

        Commands::Identity => {
            let storage = open_storage(&data_dir)?;
            let identity = LocalIdentity::load_or_create(&storage)?;
            let device = identity.current_device();

            println!("Account ID: {}", device.account_id);
            println!("Device ID: {}", device.device_id);
            println!("Device key: {}", device.public_key.to_base58());
            println!("Verified: {}", device.verify());
        }

        Commands::Block { account } => {
            let account = parse_account(&account)?;
            let blocks = PrivateBlockList::open(open_storage(&data_dir)?)?;
            if blocks.block(&account)? {
                println!("Blocked {}", account);
            } else {
                println!("Already blocked: {}", account);
            }
        }

        Commands::Unblock { account } => {
            let account = parse_account(&account)?;
            let blocks = PrivateBlockList::open(open_storage(&data_dir)?)?;
            if blocks.unblock(&account)? {
                println!("Unblocked {}", account);
            } else {
                println!("Not blocked: {}", account);
            }
        }

        Commands::Blocks => {
            let blocks = PrivateBlockList::open(open_storage(&data_dir)?)?;
            let list = blocks.list();
            if list.is_empty() {
                println!("No private blocks");
            } else {
                println!("Private blocks ({}):", list.len());
                for account in list {
                    println!("  {}", account);
                }
            }
        }

        Commands::Demo { count } => run_demo(&config, depth, count).await?,

        Commands::Serve { peer } => run_serve(&data_dir, &config, peer).await?,
    }

    Ok(())
}

/// Wait until `rx` has been quiet for `quiet`, returning the last value
async fn settle<T>(rx: &mut mpsc::UnboundedReceiver<T>, quiet: Duration) -> Option<T> {
    let mut last = None;
    loop {
        match tokio::time::timeout(quiet, rx.recv()).await {
            Ok(Some(value)) => last = Some(value),
            Ok(None) => return last,
            Err(_) if last.is_some() => return last,
            Err(_) => {}
        }
    }
}

async fn run_demo(config: &NodeConfig, depth: usize, count: usize) -> Result<()> {
    let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
    let names = ["alice", "bob", "carol", "dave", "erin"];
    let accounts: Vec<AccountId> = (1u8..=5)
        .map(|seed| Keypair::from_seed(&[seed; 32]).account_id())
        .collect();
    let label: HashMap<AccountId, &str> = accounts.iter().cloned().zip(names).collect();
    let (alice, bob, carol, dave, erin) = (
        &accounts[0],
        &accounts[1],
        &accounts[2],
        &accounts[3],
        &accounts[4],
    );

    // alice -> bob -> carol -> dave, and bob vouches for erin whom alice blocks
    let edges = [
        (alice, bob, TrustStatus::Trusted),
        (alice, erin, TrustStatus::Blocked),
        (bob, carol, TrustStatus::Trusted),
        (bob, erin, TrustStatus::Trusted),
        (carol, dave, TrustStatus::Trusted),
    ];
    for (from, to, status) in edges {
        TrustStore::new(registry.clone(), from.clone()).set_trust(to, status).await?;
    }
    debug!(accounts = accounts.len(), edges = edges.len(), "Demo network seeded");

    let mut items: HashMap<Address, String> = HashMap::new();
    for (i, account) in accounts.iter().enumerate() {
        for n in 0..2 {
            let name = format!("{}-note-{}", names[i], n + 1);
            let item = StoreRef::key_value(Address::derive("demo-item", &name));
            let quality = 0.4 + 0.1 * (i as f64) + 0.2 * (n as f64);
            registry.write(item.address, item.shape, StoreOp::put("quality", quality.min(1.0))).await?;
            registry.write(item.address, item.shape, StoreOp::put("objective", 0.5)).await?;
            publish_item(&registry, account, item).await?;
            items.insert(item.address, name);
        }
    }

    let ctx = TrustContext::new(registry.clone(), alice.clone());
    let (view_tx, mut view_rx) = mpsc::unbounded_channel::<NetworkView>();
    let network = Arc::new(track_network(&ctx, alice, depth, move |view| {
        let _ = view_tx.send(view);
    }));

    let quiet = Duration::from_millis(300);
    let Some(view) = settle(&mut view_rx, quiet).await else {
        anyhow::bail!("network did not produce a view");
    };
    let name = |account: &AccountId| label.get(account).copied().unwrap_or("?");

    println!("Network of {} (depth {}):", name(alice), view.depth);
    for member in &view.members {
        println!(
            "  {:<6} depth {}  confidence {:>5.2}",
            name(&member.account),
            member.depth,
            member.confidence
        );
    }

    let (results_tx, mut results_rx) = mpsc::unbounded_channel::<Vec<RankedItem>>();
    // Pinned depth keeps the printed network and the results consistent
    let options = SearchOptions {
        count,
        min_depth: depth,
        max_depth: depth,
        ..SearchOptions::from(config)
    };
    let search = track_search(
        network.clone(),
        published_items(&registry),
        stored_quality(&registry),
        options,
        move |results| {
            let _ = results_tx.send(results);
        },
    );

    let results = settle(&mut results_rx, quiet).await.unwrap_or_default();
    println!();
    println!("Top {} items:", count);
    for item in &results {
        println!(
            "  {}. {:<14} by {:<6} score {:.2}",
            item.rank,
            items.get(&item.item.address).map(String::as_str).unwrap_or("?"),
            name(&item.account),
            item.score
        );
    }

    search.unsubscribe();
    Ok(())
}

async fn run_serve(data_dir: &std::path::Path, config: &NodeConfig, peers: Vec<String>) -> Result<()> {
    let storage = open_storage(data_dir)?;
    let identity = Arc::new(LocalIdentity::load_or_create(&storage)?);
    let registry = StoreRegistry::new(Arc::new(MemoryBackend::new()));
    authorize_device(&registry, &identity.account_id(), &identity.device_id()).await?;

    let transport = Arc::new(IrohTransport::bind(None).await?);
    for peer in &peers {
        transport.add_peer(parse_endpoint_id(peer)?);
    }
    info!(account = %identity.account_id().short(), peers = peers.len(), "Serving presence");
    println!("Account: {}", identity.account_id());
    println!("Device: {}", identity.device_id());
    println!("Endpoint ID: {}", hex::encode(transport.endpoint_id().as_bytes()));

    let presence_config = PresenceConfig::from(config);
    // Peers need our authorization store before they accept our presence
    let replicator = StoreReplicator::spawn(
        transport.clone() as Arc<dyn GossipTransport>,
        registry.clone(),
        vec![devices_store(&identity.account_id())],
        presence_config.interval,
    )
    .await?;
    let service = PresenceService::spawn(
        identity.clone(),
        transport.clone() as Arc<dyn GossipTransport>,
        registry,
        presence_config,
    )
    .await?;

    let mut ticker = tokio::time::interval(presence_config.interval);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = ticker.tick() => {
                let online = service.map().online_devices();
                println!("[{}] {} device(s) online", chrono::Local::now().format("%H:%M:%S"), online.len());
                for (device, account) in online {
                    println!("  {} ({})", device.short(), account.short());
                }
            }
        }
    }

    info!("Shutting down");
    service.shutdown().await;
    replicator.shutdown().await;
    if let Ok(transport) = Arc::try_unwrap(transport) {
        transport.shutdown().await?;
    }
    Ok(())
}
