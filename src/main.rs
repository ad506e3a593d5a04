// =============================================================================
// DRIFTBRIDGE v1.3 - Main Entry Point
// =============================================================================
//
// Standalone runner for the swap engine. The host daemon normally embeds
// the engine and supplies the packet transport and service-node registry;
// run standalone, outbound frames are logged and the node list is empty
// until a host wires in real collaborators.
//
// =============================================================================

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use log::info;

use driftbridge::app::{App, AppConfig};
use driftbridge::config::Settings;
use driftbridge::packet::PacketRelay;
use driftbridge::registry::{NullExchange, RpcFactory};
use driftbridge::rpc::{CoreRpc, RpcError, RpcTxInfo, RpcUnspent, WalletRpc};
use driftbridge::snode::{NodeRegistry, ServiceNodeEntry};

// =============================================================================
// CLI Definition
// =============================================================================

#[derive(Parser)]
#[command(name = "driftbridge")]
#[command(author = "KNKI")]
#[command(version = "1.3.0")]
#[command(about = "Driftbridge - cross-chain atomic swap engine", long_about = None)]
struct Cli {
    /// Path to bridge.conf
    #[arg(long, default_value = "bridge.conf")]
    conf: PathBuf,

    /// Show orders for wallets this node does not carry
    #[arg(long)]
    nowallets: bool,

    /// Parallel wallet probe threads
    #[arg(long, default_value_t = driftbridge::DEFAULT_RPC_THREADS)]
    rpcthreads: usize,

    /// Message de-dup budget in megabytes
    #[arg(long, default_value_t = driftbridge::DEFAULT_MAX_MEMPOOL_MB)]
    maxmempool: usize,
}

// =============================================================================
// Standalone Collaborators
// =============================================================================

/// Logs outbound frames instead of relaying them to peers.
struct LogRelay;

impl PacketRelay for LogRelay {
    fn relay(&self, message: Vec<u8>) {
        log::debug!(
            "relay {} bytes to {}",
            message.len(),
            hex::encode(&message[..20])
        );
    }
}

/// Empty registry; a host daemon replaces this with the live node list.
struct EmptyNodeRegistry;

impl NodeRegistry for EmptyNodeRegistry {
    fn list(&self) -> Vec<ServiceNodeEntry> {
        Vec::new()
    }
}

// =============================================================================
// Main
// =============================================================================

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    let settings = match Settings::read(&cli.conf) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    };
    info!("finished loading config {}", cli.conf.display());

    let config = AppConfig {
        settings,
        rpc_threads: cli.rpcthreads,
        max_mempool_mb: cli.maxmempool,
        no_wallets: cli.nowallets,
        ..Default::default()
    };

    let factory: RpcFactory = Arc::new(|wp| match CoreRpc::connect(wp) {
        Ok(rpc) => Arc::new(rpc) as Arc<dyn WalletRpc>,
        Err(e) => {
            log::warn!("{} rpc setup failed: {}", wp.currency, e);
            Arc::new(UnreachableRpc) as Arc<dyn WalletRpc>
        }
    });

    let app = App::new(
        config,
        Arc::new(EmptyNodeRegistry),
        Arc::new(LogRelay),
        Arc::new(NullExchange),
        factory,
    );

    app.start();
    info!(
        "swap engine running, wallets: {}",
        app.my_services().join(",")
    );

    // run until stdin closes, then shut down cleanly
    let mut line = String::new();
    while std::io::stdin().read_line(&mut line).unwrap_or(0) > 0 {
        line.clear();
    }

    app.cancel_all_orders();
    app.stop();
}

/// Placeholder for wallets whose transport could not even be constructed;
/// every call fails so the refresh quarantines them.
struct UnreachableRpc;

fn unreachable<T>() -> Result<T, RpcError> {
    Err(RpcError::transport("unreachable"))
}

impl WalletRpc for UnreachableRpc {
    fn get_block_count(&self) -> Result<u32, RpcError> {
        unreachable()
    }
    fn get_block_hash(&self, _h: u32) -> Result<String, RpcError> {
        unreachable()
    }
    fn get_raw_mempool(&self) -> Result<Vec<String>, RpcError> {
        unreachable()
    }
    fn get_block_transactions(&self, _b: &str) -> Result<Vec<String>, RpcError> {
        unreachable()
    }
    fn list_unspent(&self) -> Result<Vec<RpcUnspent>, RpcError> {
        unreachable()
    }
    fn get_transaction(&self, _t: &str) -> Result<RpcTxInfo, RpcError> {
        unreachable()
    }
    fn send_raw_transaction(&self, _r: &str) -> Result<String, RpcError> {
        unreachable()
    }
    fn sign_raw_transaction(&self, _r: &str) -> Result<(String, bool), RpcError> {
        unreachable()
    }
    fn decode_raw_transaction(&self, _r: &str) -> Result<String, RpcError> {
        unreachable()
    }
    fn sign_message(&self, _a: &str, _m: &str) -> Result<String, RpcError> {
        unreachable()
    }
}
