// =============================================================================
// DRIFTBRIDGE v1.3 - Swap Engine Core
// =============================================================================
//
// The App owns the order lifecycle: creating and accepting orders, locking
// their UTXOs, broadcasting the handshake packets, rebroadcasting stuck
// orders, expiring stale ones, and scheduling the chain watchers. External
// collaborators (network relay, service-node registry, exchange) come in
// as trait handles so tests can instantiate parallel universes.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::amount::{now_micros, value_from_amount, COIN};
use crate::config::Settings;
use crate::error::{TxCancelReason, XbError};
use crate::order::{
    make_order_id, order_ptr, OrderDescr, OrderId, OrderPtr, OrderRole, OrderState,
};
use crate::packet::{frame_message, message_hash, MessageFilter, Packet, PacketRelay, XbcCommand};
use crate::registry::{ConnectorRegistry, ExchangeNotify, RpcFactory};
use crate::scheduler::{Timer, WorkerPool};
use crate::selection::select_utxos;
use crate::session::SessionPool;
use crate::snode::{find_node_with_services, has_node_service, NodeRegistry, ServiceNodeEntry};
use crate::store::OrderStore;
use crate::txbuilder::{create_fee_transaction, make_fee_payload};
use crate::utxo::UtxoLockManager;
use crate::watcher::{check_deposit_spends, check_trader_refunds, TraderWatch};
use crate::{
    script, DEADLINE_TTL_SECS, FEE_CURRENCY, FEE_PER_BYTE_SATS, MAX_OP_RETURN,
    NEW_ORDER_REBROADCAST_SECS, ORDER_TTL_SECS, PENDING_ORDER_REBROADCAST_SECS, PENDING_TTL_SECS,
    PROTOCOL_VERSION, TIMER_INTERVAL_SECS,
};

// =============================================================================
// Configuration
// =============================================================================

pub struct AppConfig {
    pub settings: Settings,
    pub rpc_threads: usize,
    pub max_mempool_mb: usize,
    /// Show orders for wallets this node does not carry.
    pub no_wallets: bool,
    /// Seed of the service-node shuffle; mixed from process start time in
    /// production, fixed in tests.
    pub shuffle_seed: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        AppConfig {
            settings: Settings::default(),
            rpc_threads: crate::DEFAULT_RPC_THREADS,
            max_mempool_mb: crate::DEFAULT_MAX_MEMPOOL_MB,
            no_wallets: false,
            shuffle_seed: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.subsec_nanos() as u64 ^ d.as_secs())
                .unwrap_or(0),
        }
    }
}

struct Runtime {
    pool: Arc<WorkerPool>,
    timer: Timer,
}

#[derive(Default)]
struct TickCounters {
    wallets: AtomicU32,
    traders: AtomicU32,
    ping: AtomicU32,
    packets: AtomicU32,
}

// =============================================================================
// App
// =============================================================================

pub struct App {
    pub config: AppConfig,
    pub registry: ConnectorRegistry,
    pub store: OrderStore,
    pub locks: UtxoLockManager,
    pub sessions: SessionPool,

    filter: MessageFilter,
    pending_packets: Mutex<HashMap<OrderId, Packet>>,

    watch_deposits: Mutex<HashMap<OrderId, OrderPtr>>,
    watching: AtomicBool,
    watch_traders: Mutex<HashMap<OrderId, TraderWatch>>,
    watching_traders: AtomicBool,

    node_registry: Arc<dyn NodeRegistry>,
    relay: Arc<dyn PacketRelay>,
    exchange: Arc<dyn ExchangeNotify>,
    rpc_factory: RpcFactory,

    runtime: Mutex<Option<Runtime>>,
    counters: TickCounters,
    stopped: AtomicBool,
}

impl App {
    pub fn new(
        config: AppConfig,
        node_registry: Arc<dyn NodeRegistry>,
        relay: Arc<dyn PacketRelay>,
        exchange: Arc<dyn ExchangeNotify>,
        rpc_factory: RpcFactory,
    ) -> Arc<App> {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let max_mempool_mb = config.max_mempool_mb;
        Arc::new(App {
            config,
            registry: ConnectorRegistry::new(),
            store: OrderStore::new(),
            locks: UtxoLockManager::new(),
            sessions: SessionPool::new(workers),
            filter: MessageFilter::new(max_mempool_mb),
            pending_packets: Mutex::new(HashMap::new()),
            watch_deposits: Mutex::new(HashMap::new()),
            watching: AtomicBool::new(false),
            watch_traders: Mutex::new(HashMap::new()),
            watching_traders: AtomicBool::new(false),
            node_registry,
            relay,
            exchange,
            rpc_factory,
            runtime: Mutex::new(None),
            counters: TickCounters::default(),
            stopped: AtomicBool::new(false),
        })
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Start workers and the periodic timer, then bring the wallets up.
    pub fn start(self: &Arc<Self>) {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let pool = Arc::new(WorkerPool::new(workers));

        let weak = Arc::downgrade(self);
        let tick_pool = Arc::clone(&pool);
        let timer = Timer::start(Duration::from_secs(TIMER_INTERVAL_SECS), move || {
            if let Some(app) = weak.upgrade() {
                app.on_timer(&tick_pool);
            }
        });

        *self.runtime.lock().unwrap() = Some(Runtime { pool, timer });
        self.stopped.store(false, Ordering::Release);

        self.update_active_wallets();
        if self.exchange.is_started() {
            info!("exchange enabled, acting as service node");
        }
    }

    /// Cancel the timer, drain workers, join threads. Not re-entrant.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("stopping swap engine threads...");
        if let Some(mut runtime) = self.runtime.lock().unwrap().take() {
            runtime.timer.cancel();
            runtime.pool.stop();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// One timer tick: post the periodic checks to the worker pool. The
    /// timer thread itself never touches RPC.
    fn on_timer(self: &Arc<Self>, pool: &Arc<WorkerPool>) {
        let app = Arc::clone(self);
        pool.post(move || app.check_and_relay_pending_orders());

        let app = Arc::clone(self);
        pool.post(move || app.check_and_erase_expired_orders());

        // wallet refresh every other tick, in case a wallet went offline
        if self.counters.wallets.fetch_add(1, Ordering::Relaxed) % 2 == 1 {
            let app = Arc::clone(self);
            pool.post(move || app.update_active_wallets());
        }

        let is_servicenode = self.exchange.is_started();
        if !is_servicenode {
            let app = Arc::clone(self);
            pool.post(move || app.check_watches_on_deposit_spends());
        } else if self.counters.traders.fetch_add(1, Ordering::Relaxed) % 40 == 39 {
            let app = Arc::clone(self);
            pool.post(move || app.watch_trader_deposits());
        }

        if self.node_registry.active_node().is_some()
            && self.counters.ping.fetch_add(1, Ordering::Relaxed) % 12 == 11
        {
            self.node_registry.send_ping();
        }

        if self.counters.packets.fetch_add(1, Ordering::Relaxed) % 2 == 1 {
            let app = Arc::clone(self);
            pool.post(move || app.check_pending_packets());
        }
    }

    pub fn update_active_wallets(&self) {
        self.registry.update_active_wallets(
            &self.config.settings,
            &self.rpc_factory,
            self.config.rpc_threads,
            self.exchange.as_ref(),
        );
    }

    pub fn show_all_orders(&self) -> bool {
        self.config.no_wallets || self.config.settings.show_all_orders
    }

    // =========================================================================
    // Packet IO
    // =========================================================================

    fn on_send(&self, destination: &[u8], packet_body: &[u8]) {
        if destination.len() != 20 {
            error!("bad send address");
            return;
        }
        let message = frame_message(destination, packet_body);
        self.filter.add(message_hash(&message));
        self.relay.relay(message);
    }

    /// Broadcast to the whole network.
    pub fn send_packet(&self, packet: &Packet) {
        self.on_send(&[0u8; 20], &packet.body());
    }

    /// Send to one address (usually the order's service node).
    pub fn send_packet_to(&self, destination: &[u8], packet: &Packet) {
        self.on_send(destination, &packet.body());
    }

    /// Addressed packet from the network. De-dup, verify, then route by
    /// destination: session address, wallet address, or our own service
    /// node id.
    pub fn on_message_received(&self, destination: &[u8], message: &[u8]) {
        let hash = message_hash(message);
        if self.filter.known(&hash) {
            return;
        }
        self.filter.add(hash);

        if Packet::version_of(message) != Some(PROTOCOL_VERSION) {
            return;
        }
        let Some(packet) = Packet::copy_from(message) else {
            debug!("incorrect packet received");
            return;
        };
        if !packet.verify() {
            // unsigned or forged; dropped without a response
            return;
        }

        if let Some(session) = self.sessions.get_session_by_addr(destination) {
            session.process_packet(self, &packet);
            return;
        }

        if let Some(conn) = self.registry.connector_by_address(destination) {
            debug!(
                "handling message for connector currency {}",
                conn.currency()
            );
            self.sessions.get_session().process_packet(self, &packet);
            return;
        }

        if let Some(node) = self.node_registry.active_node() {
            if node.key_id() == destination {
                self.sessions.get_session().process_packet(self, &packet);
            }
        }
    }

    /// Broadcast packet from the network; always lands on a worker session.
    pub fn on_broadcast_received(&self, message: &[u8]) {
        let hash = message_hash(message);
        if self.filter.known(&hash) {
            return;
        }
        self.filter.add(hash);

        if Packet::version_of(message) != Some(PROTOCOL_VERSION) {
            return;
        }
        let Some(packet) = Packet::copy_from(message) else {
            debug!("incorrect packet received");
            return;
        };
        if !packet.verify() {
            return;
        }
        self.sessions.get_session().process_packet(self, &packet);
    }

    pub fn is_known_message(&self, message: &[u8]) -> bool {
        self.filter.known(&message_hash(message))
    }

    /// Park a packet that arrived before its order is ready; replayed every
    /// other tick.
    pub fn process_later(&self, id: &OrderId, packet: &Packet) {
        self.pending_packets
            .lock()
            .unwrap()
            .insert(*id, packet.clone());
    }

    pub fn remove_packets(&self, id: &OrderId) {
        self.pending_packets.lock().unwrap().remove(id);
    }

    /// Replay parked packets; runs every other tick.
    pub fn check_pending_packets(&self) {
        let parked: HashMap<OrderId, Packet> = {
            let mut pending = self.pending_packets.lock().unwrap();
            std::mem::take(&mut *pending)
        };
        for (_, packet) in parked {
            self.sessions.get_session().process_packet(self, &packet);
        }
    }

    // =========================================================================
    // Service Nodes
    // =========================================================================

    fn find_node_for(
        &self,
        currencies: &HashSet<String>,
        not_in: &HashSet<Vec<u8>>,
    ) -> Option<ServiceNodeEntry> {
        find_node_with_services(
            self.node_registry.as_ref(),
            currencies,
            PROTOCOL_VERSION,
            not_in,
            self.config.shuffle_seed,
        )
    }

    /// Wallet services this node advertises.
    pub fn my_services(&self) -> Vec<String> {
        let mut services = self.registry.available_currencies();
        services.sort();
        services
    }

    /// Unique wallets supported across running service nodes.
    pub fn network_currencies(&self) -> Vec<String> {
        let mut coins: Vec<String> = self
            .node_registry
            .list()
            .into_iter()
            .filter(|n| n.running)
            .flat_map(|n| n.services)
            .collect();
        coins.sort();
        coins.dedup();
        coins
    }

    // =========================================================================
    // Order Creation (maker)
    // =========================================================================

    fn check_amount(&self, currency: &str, amount: u64, address: &str) -> Result<(), XbError> {
        let conn = self
            .registry
            .connector_by_currency(currency)
            .ok_or_else(|| XbError::NoSession(currency.to_string()))?;
        let excluded = self.locks.all_locked_utxos(currency);
        let balance = conn
            .get_wallet_balance(&excluded, address)
            .unwrap_or_default();
        if balance < value_from_amount(amount) {
            return Err(XbError::InsufficientFunds(currency.to_string()));
        }
        Ok(())
    }

    /// Validate, fund, and broadcast a new order. Returns the order id and
    /// the chain-tip hash mixed into it.
    pub fn create_order(
        &self,
        from: &str,
        from_currency: &str,
        from_amount: u64,
        to: &str,
        to_currency: &str,
        to_amount: u64,
    ) -> Result<(OrderId, [u8; 32]), XbError> {
        if from_currency.len() > 8 || to_currency.len() > 8 {
            return Err(XbError::InvalidCurrency);
        }

        let currencies: HashSet<String> =
            [from_currency.to_string(), to_currency.to_string()].into();
        let snode = self
            .find_node_for(&currencies, &HashSet::new())
            .ok_or(XbError::NoServiceNode)?;

        self.check_amount(from_currency, from_amount, from)?;

        let conn_from = self
            .registry
            .connector_by_currency(from_currency)
            .ok_or_else(|| XbError::NoSession(from_currency.to_string()))?;
        let conn_to = self
            .registry
            .connector_by_currency(to_currency)
            .ok_or_else(|| XbError::NoSession(to_currency.to_string()))?;

        if conn_from.is_dust_amount(value_from_amount(from_amount))
            || conn_to.is_dust_amount(value_from_amount(to_amount))
        {
            return Err(XbError::Dust);
        }

        // fund the order
        let selected = {
            let excluded = self.locks.all_locked_utxos(from_currency);
            let outputs = conn_from.get_unspent(&excluded).unwrap_or_default();
            let fee1 = |ins: u32, outs: u32| conn_from.min_tx_fee1(ins, outs);
            let fee2 = |ins: u32, outs: u32| conn_from.min_tx_fee2(ins, outs);
            select_utxos(from, &outputs, &fee1, &fee2, from_amount, COIN)
                .ok_or_else(|| XbError::InsufficientFunds(from_currency.to_string()))?
        };

        debug!(
            "utxo selection for order: amount {} fee1 {} fee2 {}",
            selected.utxo_amount, selected.fee1, selected.fee2
        );

        let mut used_coins = selected.utxos;
        for entry in used_coins.iter_mut() {
            let signature = conn_from
                .sign_message(&entry.address, &entry.signing_string())
                .map_err(|_| XbError::FundsNotSigned)?;
            if signature.len() != 65 {
                return Err(XbError::InvalidSignature);
            }
            entry.signature = signature;
            entry.raw_address = conn_from.to_xaddr(&entry.address);
            if entry.raw_address.len() != 20 {
                return Err(XbError::InvalidAddress);
            }
        }

        if !self.locks.lock_coins(from_currency, &used_coins) {
            error!(
                "failed to create order, cannot reuse utxo inputs for {} across multiple orders",
                from_currency
            );
            return Err(XbError::InsufficientFunds(from_currency.to_string()));
        }

        // chain-tip hash keeps replayed announces from minting the same id
        let block_hash = match conn_from
            .get_block_count()
            .and_then(|h| conn_from.get_block_hash(h))
        {
            Ok(hash_hex) => {
                let bytes = hex::decode(&hash_hex).unwrap_or_default();
                <[u8; 32]>::try_from(bytes.as_slice()).unwrap_or_default()
            }
            Err(_) => {
                self.locks.unlock_coins(from_currency, &used_coins);
                return Err(XbError::NoSession(from_currency.to_string()));
            }
        };

        let timestamp = now_micros();
        let first_sig = used_coins[0].signature.clone();
        let id = make_order_id(
            from,
            from_currency,
            from_amount,
            to,
            to_currency,
            to_amount,
            timestamp,
            &block_hash,
            &first_sig,
        );

        let m_keypair = conn_to.new_key_pair();
        let x_keypair = conn_to.new_key_pair();

        let mut descr = OrderDescr {
            id,
            role: Some(OrderRole::Maker),
            state: OrderState::New,
            from_addr: from.to_string(),
            from: conn_from.to_xaddr(from),
            from_currency: from_currency.to_string(),
            from_amount,
            to_addr: to.to_string(),
            to: conn_to.to_xaddr(to),
            to_currency: to_currency.to_string(),
            to_amount,
            created: timestamp,
            txtime: timestamp,
            block_hash,
            used_coins,
            m_keypair: Some(m_keypair),
            x_keypair: Some(x_keypair),
            ..Default::default()
        };
        descr.assign_servicenode(&snode.pubkey, &snode.key_id());

        info!("{}", descr.log_line("order created"));

        // route inbound packets addressed to these wallets
        self.registry
            .update_connector(conn_from.clone(), descr.from.clone(), from_currency);
        self.registry
            .update_connector(conn_to.clone(), descr.to.clone(), to_currency);

        let ptr = order_ptr(descr);
        self.send_pending_order(&ptr);
        self.store.insert(ptr);

        Ok((id, block_hash))
    }

    /// Build, sign and send the announce packet to the order's service
    /// node. Relay failures are not errors; the timer rebroadcasts.
    pub fn send_pending_order(&self, ptr: &OrderPtr) -> bool {
        let o = ptr.lock().unwrap();
        if o.hub_address.len() != 20 {
            warn!("order {} has no service node assigned", o.id);
            return false;
        }
        if o.from.is_empty() || o.to.is_empty() {
            return false;
        }
        let Some(m) = o.m_keypair.clone() else {
            return false;
        };

        let mut packet = Packet::new(XbcCommand::Transaction);
        packet.put_bytes(o.id.as_bytes());
        packet.put_bytes(&o.from);
        packet.put_padded(&o.from_currency, 8);
        packet.put_u64(o.from_amount);
        packet.put_bytes(&o.to);
        packet.put_padded(&o.to_currency, 8);
        packet.put_u64(o.to_amount);
        packet.put_u64(o.created);
        packet.put_bytes(&o.block_hash);
        packet.put_u32(o.used_coins.len() as u32);
        for entry in &o.used_coins {
            packet.put_bytes(&crate::rawtx::txid_to_le_bytes(&entry.txid));
            packet.put_u32(entry.vout);
            packet.put_bytes(&entry.raw_address);
            packet.put_bytes(&entry.signature);
        }
        packet.sign(&m.public, &m.private);

        let hub = o.hub_address.clone();
        drop(o);
        self.send_packet_to(&hub, &packet);
        true
    }

    // =========================================================================
    // Order Acceptance (taker)
    // =========================================================================

    /// The accepted amount must be affordable on the chain the taker
    /// spends. Runs after the taker-side field swap, so the spend leg is
    /// `from`.
    fn check_accept_params(&self, ptr: &OrderPtr) -> Result<(), XbError> {
        let (currency, amount, addr) = {
            let o = ptr.lock().unwrap();
            (o.from_currency.clone(), o.from_amount, o.from_addr.clone())
        };
        self.check_amount(&currency, amount, &addr)
    }

    /// Accept a published order as taker: pay the service-node fee, fund
    /// the spend leg, and report acceptance to the relaying node.
    pub fn accept_order(&self, id: &OrderId, from: &str, to: &str) -> Result<(), XbError> {
        let ptr = self
            .store
            .get_live(id)
            .ok_or(XbError::TransactionNotFound)?;

        let prior_state;
        {
            let mut o = ptr.lock().unwrap();
            if o.state >= OrderState::Accepting {
                return Err(XbError::BadRequest(
                    "order already accepted".to_string(),
                ));
            }
            prior_state = o.state;
            o.state = OrderState::Accepting;

            // the published order is in maker orientation; flip it to ours
            let o = &mut *o;
            std::mem::swap(&mut o.from_currency, &mut o.to_currency);
            std::mem::swap(&mut o.from_amount, &mut o.to_amount);
            std::mem::swap(&mut o.from, &mut o.to);
            o.from_addr = from.to_string();
            o.to_addr = to.to_string();
        }

        let restore = |reason: Option<&str>| {
            let mut o = ptr.lock().unwrap();
            let o = &mut *o;
            std::mem::swap(&mut o.from_currency, &mut o.to_currency);
            std::mem::swap(&mut o.from_amount, &mut o.to_amount);
            std::mem::swap(&mut o.from, &mut o.to);
            o.from_addr.clear();
            o.to_addr.clear();
            o.state = prior_state;
            if let Some(msg) = reason {
                debug!("{}", o.log_line(msg));
            }
        };

        let result = self.accept_order_inner(&ptr, from, to);
        if result.is_err() {
            restore(Some("order not accepted"));
        }
        result
    }

    fn accept_order_inner(&self, ptr: &OrderPtr, from: &str, to: &str) -> Result<(), XbError> {
        let (id, from_currency, to_currency, from_amount, to_amount, s_pubkey) = {
            let o = ptr.lock().unwrap();
            (
                o.id,
                o.from_currency.clone(),
                o.to_currency.clone(),
                o.from_amount,
                o.to_amount,
                o.s_pubkey.clone(),
            )
        };

        let conn_from = self
            .registry
            .connector_by_currency(&from_currency)
            .ok_or_else(|| XbError::NoSession(from_currency.clone()))?;
        let conn_to = self
            .registry
            .connector_by_currency(&to_currency)
            .ok_or_else(|| XbError::NoSession(to_currency.clone()))?;

        if conn_from.is_dust_amount(value_from_amount(from_amount))
            || conn_to.is_dust_amount(value_from_amount(to_amount))
        {
            return Err(XbError::Dust);
        }

        self.check_accept_params(ptr)?;

        // resolve the relaying service node and its collateral address
        if s_pubkey.len() != 33 {
            return Err(XbError::NoServiceNode);
        }
        let snode = self
            .node_registry
            .get(&s_pubkey)
            .ok_or(XbError::NoServiceNode)?;

        let fee = conn_from.param.service_node_fee;
        let block_conn = self
            .registry
            .connector_by_currency(FEE_CURRENCY)
            .ok_or(XbError::InsufficientFundsDx)?;
        let fee_coins = block_conn
            .get_unspent(&self.locks.all_locked_utxos(FEE_CURRENCY))
            .unwrap_or_default();
        if !self.locks.can_afford_fee_payment(&fee_coins, fee) {
            return Err(XbError::InsufficientFundsDx);
        }

        // service-node fee transaction with the order details on-chain
        let payload = make_fee_payload(
            &id.to_hex(),
            &from_currency,
            from_amount,
            &to_currency,
            to_amount,
            MAX_OP_RETURN - 3,
        )
        .map_err(|_| XbError::InvalidOnchainHistory)?;

        let (_, collateral_pkh) = crate::keys::decode_base58check(&snode.payment_address)
            .ok_or(XbError::InvalidAddress)?;
        let dest_script = script::p2pkh_script(&collateral_pkh);

        let (fee_tx, fee_utxos) = create_fee_transaction(
            &block_conn,
            &dest_script,
            fee,
            FEE_PER_BYTE_SATS as f64 / COIN as f64,
            payload.as_bytes(),
            &fee_coins,
        )
        .map_err(|_| XbError::InsufficientFunds(FEE_CURRENCY.to_string()))?;

        self.locks.lock_fee_utxos(&fee_utxos);

        // fund the spend leg
        let selected = {
            let excluded = self.locks.all_locked_utxos(&from_currency);
            let outputs = conn_from.get_unspent(&excluded).unwrap_or_default();
            let fee1 = |ins: u32, outs: u32| conn_from.min_tx_fee1(ins, outs);
            let fee2 = |ins: u32, outs: u32| conn_from.min_tx_fee2(ins, outs);
            match select_utxos(from, &outputs, &fee1, &fee2, from_amount, COIN) {
                Some(sel) => sel,
                None => {
                    self.locks.unlock_fee_utxos(&fee_utxos);
                    return Err(XbError::InsufficientFunds(from_currency.clone()));
                }
            }
        };

        let mut used_coins = selected.utxos;
        for entry in used_coins.iter_mut() {
            let result = conn_from
                .sign_message(&entry.address, &entry.signing_string())
                .map_err(|_| XbError::FundsNotSigned)
                .and_then(|sig| {
                    if sig.len() != 65 {
                        return Err(XbError::InvalidSignature);
                    }
                    entry.signature = sig;
                    entry.raw_address = conn_from.to_xaddr(&entry.address);
                    if entry.raw_address.len() != 20 {
                        return Err(XbError::InvalidAddress);
                    }
                    Ok(())
                });
            if let Err(e) = result {
                self.locks.unlock_fee_utxos(&fee_utxos);
                return Err(e);
            }
        }

        if !self.locks.lock_coins(&from_currency, &used_coins) {
            self.locks.unlock_fee_utxos(&fee_utxos);
            error!(
                "not accepting order, cannot reuse utxo inputs for {} across multiple orders",
                from_currency
            );
            return Err(XbError::InsufficientFunds(from_currency.clone()));
        }

        // snapshot both chains for the accepting packet
        let heights = conn_from.get_block_count().and_then(|fh| {
            conn_from.get_block_hash(fh).and_then(|fhash| {
                conn_to.get_block_count().and_then(|th| {
                    conn_to.get_block_hash(th).map(|thash| (fh, fhash, th, thash))
                })
            })
        });
        let (from_height, from_hash, to_height, to_hash) = match heights {
            Ok(h) => h,
            Err(_) => {
                self.locks.unlock_coins(&from_currency, &used_coins);
                self.locks.unlock_fee_utxos(&fee_utxos);
                return Err(XbError::NoSession(from_currency.clone()));
            }
        };

        let m_keypair = conn_to.new_key_pair();
        {
            let mut o = ptr.lock().unwrap();
            o.role = Some(OrderRole::Taker);
            o.from = conn_from.to_xaddr(from);
            o.to = conn_to.to_xaddr(to);
            o.fee_utxos = fee_utxos;
            o.raw_fee_tx = fee_tx.raw;
            o.used_coins = used_coins;
            o.m_keypair = Some(m_keypair);
            o.update_timestamp();
            info!("{}", o.log_line("order accepted"));
        }

        self.registry
            .update_connector(conn_from.clone(), conn_from.to_xaddr(from), &from_currency);
        self.registry
            .update_connector(conn_to.clone(), conn_to.to_xaddr(to), &to_currency);

        self.send_accepting_order(ptr, from_height, &from_hash, to_height, &to_hash);
        Ok(())
    }

    fn send_accepting_order(
        &self,
        ptr: &OrderPtr,
        from_height: u32,
        from_hash: &str,
        to_height: u32,
        to_hash: &str,
    ) -> bool {
        let o = ptr.lock().unwrap();
        let Some(m) = o.m_keypair.clone() else {
            return false;
        };

        let hash8 = |s: &str| {
            let mut bytes = s.as_bytes().to_vec();
            bytes.resize(8, 0);
            bytes
        };

        let mut packet = Packet::new(XbcCommand::TransactionAccepting);
        packet.put_bytes(&o.hub_address);
        packet.put_bytes(o.id.as_bytes());
        packet.put_bytes(&o.from);
        packet.put_padded(&o.from_currency, 8);
        packet.put_u64(o.from_amount);
        packet.put_u32(from_height);
        packet.put_bytes(&hash8(from_hash));
        packet.put_bytes(&o.to);
        packet.put_padded(&o.to_currency, 8);
        packet.put_u64(o.to_amount);
        packet.put_u32(to_height);
        packet.put_bytes(&hash8(to_hash));
        packet.put_u32(o.used_coins.len() as u32);
        for entry in &o.used_coins {
            packet.put_bytes(&crate::rawtx::txid_to_le_bytes(&entry.txid));
            packet.put_u32(entry.vout);
            packet.put_bytes(&entry.raw_address);
            packet.put_bytes(&entry.signature);
        }
        packet.sign(&m.public, &m.private);

        let hub = o.hub_address.clone();
        drop(o);
        self.send_packet_to(&hub, &packet);
        true
    }

    // =========================================================================
    // Cancellation
    // =========================================================================

    /// Cancel a local order that has not yet committed funds on-chain.
    pub fn cancel_order(&self, id: &OrderId, reason: TxCancelReason) -> Result<(), XbError> {
        let ptr = self.store.get(id).ok_or(XbError::TransactionNotFound)?;
        {
            let o = ptr.lock().unwrap();
            if !o.is_local() {
                return Err(XbError::TransactionNotFound);
            }
            if o.state > OrderState::Created {
                return Err(XbError::InvalidState(
                    "order already in work".to_string(),
                ));
            }
        }
        self.send_cancel(&ptr, reason);
        self.local_cancel(id, reason);
        Ok(())
    }

    /// Cancel every local order (shutdown path).
    pub fn cancel_all_orders(&self) {
        for (id, ptr) in self.store.live() {
            let local = ptr.lock().unwrap().is_local();
            if local {
                let _ = self.cancel_order(&id, TxCancelReason::UserRequest);
            }
        }
    }

    fn send_cancel(&self, ptr: &OrderPtr, reason: TxCancelReason) {
        let o = ptr.lock().unwrap();
        let Some(m) = o.m_keypair.clone() else {
            return;
        };
        let mut packet = Packet::new(XbcCommand::TransactionCancel);
        packet.put_bytes(o.id.as_bytes());
        packet.put_u32(reason as u32);
        packet.sign(&m.public, &m.private);
        drop(o);
        self.send_packet(&packet);
    }

    /// Apply a cancellation locally: release funds, record the reason and
    /// archive the order.
    pub fn local_cancel(&self, id: &OrderId, reason: TxCancelReason) {
        let Some(ptr) = self.store.get_live(id) else {
            return;
        };
        {
            let mut o = ptr.lock().unwrap();
            if o.state.is_terminal() {
                return;
            }
            o.state = OrderState::Cancelled;
            o.reason = reason;
            o.update_timestamp();
            info!("{}", o.log_line("order cancelled"));
        }
        self.move_order_to_history(id);
        self.unwatch_spent_deposit(id);
    }

    /// Cancel triggered from inside packet handling, with a wire-visible
    /// reason.
    pub fn cancel_with_reason(&self, id: &OrderId, reason: TxCancelReason) {
        if let Some(ptr) = self.store.get_live(id) {
            self.send_cancel(&ptr, reason);
        }
        self.local_cancel(id, reason);
    }

    /// Archive a live order and release everything it held.
    pub fn move_order_to_history(&self, id: &OrderId) {
        let Some(ptr) = self.store.move_to_history(id) else {
            return;
        };
        let (from_currency, used_coins, fee_utxos) = {
            let o = ptr.lock().unwrap();
            (o.from_currency.clone(), o.used_coins.clone(), o.fee_utxos.clone())
        };
        self.locks.unlock_coins(&from_currency, &used_coins);
        if !fee_utxos.is_empty() {
            self.locks.unlock_fee_utxos(&fee_utxos);
        }
        self.remove_packets(id);
    }

    pub fn flush_cancelled_orders(&self, min_age: Duration) -> usize {
        self.store
            .flush_cancelled_orders(min_age.as_micros() as u64)
            .len()
    }

    /// Drop book entries whose currencies this node no longer services.
    pub fn clear_non_local_orders(&self) {
        self.store.clear_non_local_orders(|o| {
            self.registry.has_currency(&o.from_currency)
                && self.registry.has_currency(&o.to_currency)
        });
    }

    // =========================================================================
    // Stuck Orders
    // =========================================================================

    /// Rebroadcast orders the network has not picked up. New orders retry
    /// quickly on a different service node; pending orders retry slowly and
    /// only re-select when their node stopped servicing the pair.
    pub fn check_and_relay_pending_orders(&self) {
        let now = now_micros();
        for (_, ptr) in self.store.live() {
            let (is_local, state, txtime, s_pubkey, from_currency, to_currency, excluded) = {
                let o = ptr.lock().unwrap();
                (
                    o.is_local(),
                    o.state,
                    o.txtime,
                    o.s_pubkey.clone(),
                    o.from_currency.clone(),
                    o.to_currency.clone(),
                    o.excluded_nodes.clone(),
                )
            };
            if !is_local {
                continue;
            }

            let age_secs = now.saturating_sub(txtime) / 1_000_000;
            let new_stuck =
                state == OrderState::New && age_secs >= NEW_ORDER_REBROADCAST_SECS;
            let pending_stuck =
                state == OrderState::Pending && age_secs >= PENDING_ORDER_REBROADCAST_SECS;

            if new_stuck {
                // try a different service node for the retry
                let currencies: HashSet<String> =
                    [from_currency.clone(), to_currency.clone()].into();
                let mut not_in = excluded.clone();
                not_in.insert(s_pubkey.clone());
                match self.find_node_for(&currencies, &not_in) {
                    Some(snode) => {
                        let mut o = ptr.lock().unwrap();
                        o.exclude_node(s_pubkey);
                        o.assign_servicenode(&snode.pubkey, &snode.key_id());
                        debug!("{}", o.log_line("order may be stuck, rebroadcasting to new service node"));
                    }
                    None => {
                        debug!("order may be stuck, retrying previous service node");
                    }
                }
                ptr.lock().unwrap().update_timestamp();
                self.send_pending_order(&ptr);
            } else if pending_stuck {
                ptr.lock().unwrap().update_timestamp();

                // re-select only when the assigned node dropped a wallet
                let still_good = has_node_service(
                    self.node_registry.as_ref(),
                    &s_pubkey,
                    &from_currency,
                ) && has_node_service(
                    self.node_registry.as_ref(),
                    &s_pubkey,
                    &to_currency,
                );
                if !still_good {
                    let currencies: HashSet<String> =
                        [from_currency.clone(), to_currency.clone()].into();
                    let mut not_in = excluded;
                    not_in.insert(s_pubkey.clone());
                    if let Some(snode) = self.find_node_for(&currencies, &not_in) {
                        let mut o = ptr.lock().unwrap();
                        o.exclude_node(s_pubkey);
                        o.assign_servicenode(&snode.pubkey, &snode.key_id());
                    }
                }
                self.send_pending_order(&ptr);
            }
        }
    }

    // =========================================================================
    // Expiry
    // =========================================================================

    /// Age out idle orders. Uses try_lock so a busy order never stalls the
    /// timer; it will be reconsidered next tick.
    pub fn check_and_erase_expired_orders(&self) {
        let now = now_micros();
        let mut for_erase: Vec<OrderId> = Vec::new();

        for (id, ptr) in self.store.live() {
            let Ok(mut o) = ptr.try_lock() else {
                continue;
            };
            let td_secs = now.saturating_sub(o.txtime) / 1_000_000;
            let tc_secs = now.saturating_sub(o.created) / 1_000_000;

            if o.state == OrderState::New && td_secs > PENDING_TTL_SECS {
                o.state = OrderState::Offline;
            } else if o.state == OrderState::Pending && td_secs > PENDING_TTL_SECS {
                o.state = OrderState::Expired;
            } else if matches!(o.state, OrderState::Expired | OrderState::Offline)
                && td_secs < PENDING_TTL_SECS
            {
                // timestamp moved forward again; resurrect
                o.state = OrderState::Pending;
            } else if matches!(o.state, OrderState::Expired | OrderState::Offline)
                && td_secs > ORDER_TTL_SECS
            {
                for_erase.push(id);
            } else if o.state == OrderState::Pending && tc_secs > DEADLINE_TTL_SECS {
                for_erase.push(id);
            }
        }

        for id in for_erase {
            self.store.erase(&id);
        }
    }

    // =========================================================================
    // Watches
    // =========================================================================

    pub fn watch_for_spent_deposit(&self, ptr: OrderPtr) {
        let id = ptr.lock().unwrap().id;
        self.watch_deposits.lock().unwrap().insert(id, ptr);
    }

    pub fn unwatch_spent_deposit(&self, id: &OrderId) {
        self.watch_deposits.lock().unwrap().remove(id);
    }

    pub fn watched_deposit_count(&self) -> usize {
        self.watch_deposits.lock().unwrap().len()
    }

    /// Deposit-watch pass; single-flight across ticks.
    pub fn check_watches_on_deposit_spends(&self) {
        if self.watching.swap(true, Ordering::AcqRel) {
            return;
        }
        let watches: Vec<OrderPtr> =
            self.watch_deposits.lock().unwrap().values().cloned().collect();
        check_deposit_spends(self, watches);
        self.watching.store(false, Ordering::Release);
    }

    pub fn watch_trader_deposit(&self, watch: TraderWatch) {
        self.watch_traders.lock().unwrap().insert(watch.id, watch);
    }

    pub fn unwatch_trader_deposit(&self, id: &OrderId) {
        self.watch_traders.lock().unwrap().remove(id);
    }

    pub fn trader_watch(&self, id: &OrderId) -> Option<TraderWatch> {
        self.watch_traders.lock().unwrap().get(id).cloned()
    }

    /// Service-node refund pass; single-flight across ticks.
    pub fn watch_trader_deposits(&self) {
        if self.watching_traders.swap(true, Ordering::AcqRel) {
            return;
        }
        let watches: Vec<TraderWatch> =
            self.watch_traders.lock().unwrap().values().cloned().collect();
        let updated = check_trader_refunds(self, watches);
        {
            let mut table = self.watch_traders.lock().unwrap();
            for watch in updated {
                if watch.settled() {
                    table.remove(&watch.id);
                } else {
                    table.insert(watch.id, watch);
                }
            }
        }
        self.watching_traders.store(false, Ordering::Release);
    }
}

// =============================================================================
// Test Environment
// =============================================================================

#[cfg(test)]
pub mod testing {
    use super::*;
    use crate::config::{CreateTxMethod, WalletParam};
    use crate::connector::WalletConnector;
    use crate::keys;
    use crate::registry::NullExchange;
    use crate::rpc::testing::MockRpc;
    use crate::rpc::{RpcUnspent, WalletRpc};
    use crate::snode::{NodeRegistry, ServiceNodeEntry};

    pub struct FixedNodes(pub Mutex<Vec<ServiceNodeEntry>>);

    impl NodeRegistry for FixedNodes {
        fn list(&self) -> Vec<ServiceNodeEntry> {
            self.0.lock().unwrap().clone()
        }
    }

    pub struct CollectRelay(pub Mutex<Vec<Vec<u8>>>);

    impl PacketRelay for CollectRelay {
        fn relay(&self, message: Vec<u8>) {
            self.0.lock().unwrap().push(message);
        }
    }

    impl CollectRelay {
        pub fn count(&self) -> usize {
            self.0.lock().unwrap().len()
        }

        /// Packet portion of the most recent frame.
        pub fn last_packet(&self) -> Packet {
            let frames = self.0.lock().unwrap();
            let frame = frames.last().expect("no relayed messages");
            Packet::copy_from(&frame[28..]).expect("bad relayed packet")
        }
    }

    pub fn test_addr(tag: u8) -> String {
        keys::encode_base58check(0, &[tag; 20])
    }

    pub fn snode_entry(tag: u8, services: &[&str]) -> ServiceNodeEntry {
        ServiceNodeEntry {
            pubkey: vec![tag; 33],
            payment_address: test_addr(0xF0 ^ tag),
            protocol_version: PROTOCOL_VERSION,
            running: true,
            services: services.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn wallet_param(currency: &str, block_time: u32) -> WalletParam {
        WalletParam {
            currency: currency.into(),
            title: currency.into(),
            ip: "127.0.0.1".into(),
            port: "1".into(),
            username: "u".into(),
            password: "p".into(),
            coin: COIN,
            block_time,
            fee_per_byte: 20,
            dust_amount: 546,
            required_confirmations: 1,
            method: CreateTxMethod::Btc,
            ..Default::default()
        }
    }

    fn coins(address: &str, amounts: &[f64]) -> Vec<RpcUnspent> {
        amounts
            .iter()
            .enumerate()
            .map(|(i, &amount)| RpcUnspent {
                txid: format!("{:02x}", i + 1).repeat(32),
                vout: 0,
                address: address.to_string(),
                amount,
                confirmations: 3,
                spendable: true,
            })
            .collect()
    }

    pub struct TestEnv {
        pub app: Arc<App>,
        pub relay: Arc<CollectRelay>,
        pub nodes: Arc<FixedNodes>,
        pub btc: Arc<MockRpc>,
        pub dgb: Arc<MockRpc>,
        pub block: Arc<MockRpc>,
    }

    impl TestEnv {
        /// BTC wallet holds 1.2 at addr(1), DGB holds 11.0 at addr(2),
        /// BLOCK holds 2 x 0.01 at addr(3). One service node covers the
        /// pair.
        pub fn new() -> TestEnv {
            let nodes = Arc::new(FixedNodes(Mutex::new(vec![snode_entry(
                7,
                &["BTC", "DGB"],
            )])));
            let relay = Arc::new(CollectRelay(Mutex::new(Vec::new())));
            let factory: RpcFactory = Arc::new(|_wp| Arc::new(MockRpc::new()));

            let config = AppConfig {
                shuffle_seed: 1,
                ..Default::default()
            };
            let app = App::new(
                config,
                nodes.clone(),
                relay.clone(),
                Arc::new(NullExchange),
                factory,
            );

            let btc = Arc::new(MockRpc::with_unspent(coins(&test_addr(1), &[1.2])));
            let dgb = Arc::new(MockRpc::with_unspent(coins(&test_addr(2), &[11.0])));
            let block = Arc::new(MockRpc::with_unspent(coins(&test_addr(3), &[0.01, 0.01])));

            let add = |cur: &str, bt: u32, rpc: Arc<MockRpc>| {
                let conn = Arc::new(WalletConnector::new(
                    wallet_param(cur, bt),
                    rpc as Arc<dyn WalletRpc>,
                ));
                app.registry.add_connector(conn);
            };
            add("BTC", 600, btc.clone());
            add("DGB", 15, dgb.clone());
            add(FEE_CURRENCY, 60, block.clone());

            TestEnv {
                app,
                relay,
                nodes,
                btc,
                dgb,
                block,
            }
        }

        pub fn create_maker_order(&self) -> OrderId {
            let (id, _) = self
                .app
                .create_order(
                    &test_addr(1),
                    "BTC",
                    COIN,
                    &test_addr(2),
                    "DGB",
                    10 * COIN,
                )
                .expect("create_order failed");
            id
        }

        /// A remote maker announce (BTC -> DGB) entered into the book.
        pub fn insert_remote_order(&self) -> OrderId {
            let id = OrderId([0x33; 32]);
            let mut descr = OrderDescr {
                id,
                from_currency: "BTC".into(),
                from_amount: COIN,
                from: vec![0x11; 20],
                to_currency: "DGB".into(),
                to_amount: 10 * COIN,
                to: vec![0x22; 20],
                state: OrderState::Pending,
                s_pubkey: vec![7; 33],
                hub_address: crate::keys::hash160(&[7; 33]).to_vec(),
                ..Default::default()
            };
            descr.created = now_micros();
            descr.txtime = descr.created;
            self.app.store.insert(order_ptr(descr));
            id
        }

        pub fn backdate(&self, id: &OrderId, secs: u64) {
            let ptr = self.app.store.get(id).unwrap();
            let mut o = ptr.lock().unwrap();
            o.txtime = o.txtime.saturating_sub(secs * 1_000_000);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
