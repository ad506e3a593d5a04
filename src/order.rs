// =============================================================================
// DRIFTBRIDGE v1.3 - Order Descriptor
// =============================================================================
//
// The central entity of the swap engine. An order is created locally by the
// maker, accepted remotely by a taker, and driven through its state machine
// by packets relayed over a service node. Terminal orders move to history.
//
// =============================================================================

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use crate::amount::{iso8601, now_micros, string_from_amount};
use crate::error::TxCancelReason;
use crate::keys::{sha256d, KeyPair};
use crate::rawtx::compact_size;
use crate::utxo::UtxoEntry;

// =============================================================================
// Order Identifier
// =============================================================================

/// 32-byte deterministic order fingerprint.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct OrderId(pub [u8; 32]);

impl OrderId {
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes = hex::decode(s).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(OrderId(arr))
    }

    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(OrderId(arr))
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Display for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for OrderId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // short form for logs
        write!(f, "{}", hex::encode(&self.0[..8]))
    }
}

/// Deterministic order id over the announce fields. Recomputing with the
/// same inputs must yield the same hash; ties on identical timestamps are
/// broken by the first utxo signature.
#[allow(clippy::too_many_arguments)]
pub fn make_order_id(
    from_addr: &str,
    from_currency: &str,
    from_amount: u64,
    to_addr: &str,
    to_currency: &str,
    to_amount: u64,
    timestamp_micros: u64,
    block_hash: &[u8; 32],
    first_utxo_sig: &[u8],
) -> OrderId {
    let mut data = Vec::new();
    let mut put_str = |data: &mut Vec<u8>, s: &str| {
        data.extend_from_slice(&compact_size(s.len() as u64));
        data.extend_from_slice(s.as_bytes());
    };
    put_str(&mut data, from_addr);
    put_str(&mut data, from_currency);
    data.extend_from_slice(&from_amount.to_le_bytes());
    put_str(&mut data, to_addr);
    put_str(&mut data, to_currency);
    data.extend_from_slice(&to_amount.to_le_bytes());
    data.extend_from_slice(&timestamp_micros.to_le_bytes());
    data.extend_from_slice(block_hash);
    data.extend_from_slice(&compact_size(first_utxo_sig.len() as u64));
    data.extend_from_slice(first_utxo_sig);
    OrderId(sha256d(&data))
}

// =============================================================================
// Role
// =============================================================================

/// Side of the swap this node plays for a given order.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OrderRole {
    /// 'A' - created the order, holds the secret X.
    Maker,
    /// 'B' - accepted the order, pays the service-node fee.
    Taker,
}

impl OrderRole {
    pub fn as_char(&self) -> char {
        match self {
            OrderRole::Maker => 'A',
            OrderRole::Taker => 'B',
        }
    }
}

// =============================================================================
// State
// =============================================================================

/// Order lifecycle states. The numeric rank is monotone along the normal
/// path; only the timer-driven Pending <-> Offline/Expired hops move
/// backwards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u32)]
pub enum OrderState {
    New = 0,
    Pending,
    Accepting,
    Hold,
    InitializedWait,
    Initialized,
    CreatedWait,
    Created,
    SignedWait,
    Signed,
    CommittedWait,
    Committed,
    Finished,
    RolledBack,
    DroppedByUser,
    Cancelled,
    Offline,
    Expired,
    Invalid,
}

impl Default for OrderState {
    fn default() -> Self {
        OrderState::New
    }
}

impl OrderState {
    /// Terminal states move the order to history.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Finished
                | OrderState::Cancelled
                | OrderState::RolledBack
                | OrderState::Invalid
        )
    }

    pub fn name(&self) -> &'static str {
        use OrderState::*;
        match self {
            New => "New",
            Pending => "Open",
            Accepting => "Accepting",
            Hold => "Hold",
            InitializedWait => "InitializedWait",
            Initialized => "Initialized",
            CreatedWait => "CreatedWait",
            Created => "Created",
            SignedWait => "SignedWait",
            Signed => "Signed",
            CommittedWait => "CommittedWait",
            Committed => "Committed",
            Finished => "Finished",
            RolledBack => "RolledBack",
            DroppedByUser => "Dropped",
            Cancelled => "Cancelled",
            Offline => "Offline",
            Expired => "Expired",
            Invalid => "Invalid",
        }
    }
}

// =============================================================================
// Watch State
// =============================================================================

/// Bookkeeping for the deposit watcher.
#[derive(Clone, Debug, Default)]
pub struct WatchState {
    /// Guard against overlapping watcher passes for one order.
    pub watching: bool,
    /// Chain height when the watch began.
    pub start_block: u32,
    /// Last block already scanned.
    pub current_block: u32,
    /// The counterparty pay tx has been found.
    pub done_watching: bool,
    /// Our own deposit was refunded (or the attempt concluded).
    pub redeemed_own_deposit: bool,
    /// The counterparty deposit was redeemed with the secret.
    pub redeemed_counterparty_deposit: bool,
}

// =============================================================================
// Order Descriptor
// =============================================================================

/// Shared handle to a live order. The expiry sweep uses try_lock on this
/// mutex so a busy order never stalls the timer.
pub type OrderPtr = Arc<Mutex<OrderDescr>>;

#[derive(Clone, Debug, Default)]
pub struct OrderDescr {
    pub id: OrderId,
    pub role: Option<OrderRole>,
    pub state: OrderState,
    pub reason: TxCancelReason,

    // addresses, both canonical and 20-byte raw form
    pub from_addr: String,
    pub from: Vec<u8>,
    pub from_currency: String,
    pub from_amount: u64,
    pub to_addr: String,
    pub to: Vec<u8>,
    pub to_currency: String,
    pub to_amount: u64,

    /// Creation time, microseconds UTC.
    pub created: u64,
    /// Last touch time, microseconds UTC.
    pub txtime: u64,
    /// Chain tip hash mixed into the order id.
    pub block_hash: [u8; 32],

    /// Service node relaying this order.
    pub hub_address: Vec<u8>,
    /// Service node compressed pubkey (33 bytes).
    pub s_pubkey: Vec<u8>,
    /// Service nodes that previously failed to relay this order.
    pub excluded_nodes: HashSet<Vec<u8>>,

    /// Outputs funding this order, with ownership signatures.
    pub used_coins: Vec<UtxoEntry>,
    /// Outputs funding the service-node fee (taker only).
    pub fee_utxos: HashSet<UtxoEntry>,
    pub raw_fee_tx: String,

    /// Deposit-leg signing key.
    pub m_keypair: Option<KeyPair>,
    /// Secret keypair; only the maker creates it. hash160(X.pub) is the
    /// hashlock of both deposits.
    pub x_keypair: Option<KeyPair>,
    /// Counterparty's deposit-leg pubkey, learned from the handshake.
    pub o_pubkey: Vec<u8>,
    /// hash160 of X.pub (takers learn it without the secret).
    pub x_pkh: Vec<u8>,
    /// X.pub once revealed on-chain (taker side).
    pub x_pubkey: Vec<u8>,

    /// Refund branch height of our own deposit.
    pub lock_time: u32,
    /// Refund branch height of the counterparty deposit.
    pub opponent_lock_time: u32,

    // own deposit leg
    pub bin_txid: String,
    pub bin_tx_vout: u32,
    pub inner_script: Vec<u8>,
    pub refund_tx: String,

    // counterparty deposit leg
    pub o_bin_txid: String,
    pub o_bin_tx_vout: u32,
    pub o_inner_script: Vec<u8>,

    /// Our pay tx spending the counterparty deposit.
    pub pay_txid: String,
    /// The counterparty's pay tx spending our deposit.
    pub other_pay_txid: String,

    pub watch: WatchState,
}

impl OrderDescr {
    /// Local orders carry a role; remote ones observed from the network do
    /// not.
    pub fn is_local(&self) -> bool {
        self.role.is_some()
    }

    pub fn update_timestamp(&mut self) {
        self.txtime = now_micros();
    }

    /// Adopt the newer timestamps of a re-announced copy of this order.
    pub fn merge_timestamp(&mut self, other: &OrderDescr) {
        if other.txtime > self.txtime {
            self.txtime = other.txtime;
        }
        if other.created > self.created {
            self.created = other.created;
        }
    }

    pub fn assign_servicenode(&mut self, pubkey: &[u8], key_id: &[u8]) {
        self.s_pubkey = pubkey.to_vec();
        self.hub_address = key_id.to_vec();
    }

    pub fn exclude_node(&mut self, pubkey: Vec<u8>) {
        self.excluded_nodes.insert(pubkey);
    }

    /// The maker holds the secret from creation; the taker learns it from
    /// the chain.
    pub fn has_secret(&self) -> bool {
        self.x_keypair.is_some() || !self.x_pubkey.is_empty()
    }

    /// Compact JSON-ish audit line for the order log.
    pub fn log_line(&self, msg: &str) -> String {
        format!(
            "{{\"orderid\":\"{}\",\"maker\":\"{}\",\"maker_size\":\"{}\",\"taker\":\"{}\",\"taker_size\":\"{}\",\"state\":\"{}\",\"updated_at\":\"{}\",\"created_at\":\"{}\",\"cancel_reason\":\"{}\",\"msg\":\"{}\"}}",
            self.id,
            self.from_currency,
            string_from_amount(self.from_amount),
            self.to_currency,
            string_from_amount(self.to_amount),
            self.state.name(),
            iso8601(self.txtime),
            iso8601(self.created),
            self.reason,
            msg
        )
    }
}

/// Build a shared order handle.
pub fn order_ptr(descr: OrderDescr) -> OrderPtr {
    Arc::new(Mutex::new(descr))
}

// =============================================================================
// Tests
// =============================================================================
