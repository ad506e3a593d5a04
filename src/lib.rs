// =============================================================================
// DRIFTBRIDGE v1.3 - Cross-Chain Atomic Swap Engine
// =============================================================================
//
// Trustless exchange of native coins between UTXO chains. Two traders lock
// funds in hash-time-locked deposits; the maker's on-chain redemption of
// the taker deposit reveals the secret that lets the taker redeem the
// maker deposit. Service nodes relay the handshake packets and backstop
// refunds, charging a small fee in BLOCK.
//
// =============================================================================

pub mod amount;
pub mod app;
pub mod config;
pub mod connector;
pub mod error;
pub mod keys;
pub mod order;
pub mod packet;
pub mod rawtx;
pub mod registry;
pub mod rpc;
pub mod scheduler;
pub mod script;
pub mod selection;
pub mod session;
pub mod sighash;
pub mod snode;
pub mod store;
pub mod txbuilder;
pub mod utxo;
pub mod watcher;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Wire protocol version; packets and service nodes must match.
pub const PROTOCOL_VERSION: u32 = 49;

/// Currency of the service-node fee payment.
pub const FEE_CURRENCY: &str = "BLOCK";

/// Seconds between timer ticks.
pub const TIMER_INTERVAL_SECS: u64 = 15;

// locktime windows
pub const MIN_LOCKTIME_BLOCKS: u32 = 6;
pub const MAKER_LOCKTIME_TARGET_SECONDS: u32 = 7200;
pub const TAKER_LOCKTIME_TARGET_SECONDS: u32 = 3600;
/// Chains at or above this block time count as slow.
pub const SLOW_BLOCKTIME_SECONDS: u32 = 600;
pub const SLOW_TAKER_LOCKTIME_TARGET_SECONDS: u32 = 7200;
pub const LOCKTIME_DRIFT_SECONDS: u32 = 1800;
pub const MAX_LOCKTIME_DRIFT_BLOCKS: u32 = 6;

// order aging (seconds)
pub const PENDING_TTL_SECS: u64 = 60;
pub const ORDER_TTL_SECS: u64 = 600;
pub const DEADLINE_TTL_SECS: u64 = 7200;

// stuck-order rebroadcast thresholds (seconds)
pub const NEW_ORDER_REBROADCAST_SECS: u64 = 15;
pub const PENDING_ORDER_REBROADCAST_SECS: u64 = 240;

/// Wallets failing their probe wait this long before the next attempt.
pub const WALLET_QUARANTINE_SECS: u64 = 300;

/// Largest OP_RETURN output accepted for the fee payload.
pub const MAX_OP_RETURN: usize = 223;

/// Fee-tx target rate, satoshis per byte per COIN.
pub const FEE_PER_BYTE_SATS: u64 = 40;

pub const DEFAULT_RPC_THREADS: usize = 4;
pub const DEFAULT_MAX_MEMPOOL_MB: usize = 128;

/// Service node refund watchdog gives up after the locktime has been
/// expired for this long.
pub const TRADER_REFUND_GIVEUP_SECS: u64 = 3600;
