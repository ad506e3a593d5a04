// =============================================================================
// DRIFTBRIDGE v1.3 - Sessions and Packet Handlers
// =============================================================================
//
// Inbound packets are handled by a bounded round-robin pool of sessions.
// A session with an exact address match gets its packets directly; packets
// addressed to a wallet or to this service node land on any free session.
//
// Handler payloads (all after the common 32-byte order id):
//
//   Hold      <- hub: (hub address precedes the order id)
//   Init      <- hub: role(1) | counterpartyPubkey(33)
//                     taker also gets: xPkh(20) | counterLockTime(4) |
//                     counterDepositTxid(var) | counterInnerScript(var)
//   Created   <- hub: depositTxid(var) | innerScript(var) | lockTime(4)
//   ConfirmA  <- hub: payTxid(var)
//   ConfirmB  <- hub: payTxid(var)
//   Cancel    <- any: reason(4)
//   Finished  <- hub
//
// =============================================================================

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use log::{debug, warn};

use crate::amount::value_from_amount;
use crate::app::App;
use crate::error::TxCancelReason;
use crate::keys::hash160;
use crate::order::{OrderDescr, OrderId, OrderRole, OrderState};
use crate::packet::{Packet, PacketReader, XbcCommand};
use crate::script::{deposit_script, extract_secret_pubkey, Script};
use crate::txbuilder::{
    create_deposit_transaction, create_payment_transaction, create_refund_transaction,
    deposit_output_script, XTxIn,
};
use crate::utxo::UtxoEntry;
use crate::MAX_LOCKTIME_DRIFT_BLOCKS;

// =============================================================================
// Session
// =============================================================================

pub struct Session {
    addr: Vec<u8>,
    working: AtomicBool,
}

impl Session {
    pub fn new() -> Self {
        let mut addr = vec![0u8; 20];
        addr.copy_from_slice(&hash160(&rand::random::<[u8; 32]>()));
        Session {
            addr,
            working: AtomicBool::new(false),
        }
    }

    pub fn session_addr(&self) -> &[u8] {
        &self.addr
    }

    pub fn is_working(&self) -> bool {
        self.working.load(Ordering::Acquire)
    }

    /// Handle one packet on this session.
    pub fn process_packet(&self, app: &App, packet: &Packet) {
        self.working.store(true, Ordering::Release);
        dispatch(app, packet);
        self.working.store(false, Ordering::Release);
    }
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Session Pool
// =============================================================================

#[derive(Default)]
pub struct SessionPool {
    queue: Mutex<VecDeque<Arc<Session>>>,
    by_addr: Mutex<HashMap<Vec<u8>, Arc<Session>>>,
}

impl SessionPool {
    pub fn new(size: usize) -> Self {
        let pool = SessionPool::default();
        {
            let mut queue = pool.queue.lock().unwrap();
            let mut by_addr = pool.by_addr.lock().unwrap();
            for _ in 0..size.max(1) {
                let s = Arc::new(Session::new());
                by_addr.insert(s.session_addr().to_vec(), s.clone());
                queue.push_back(s);
            }
        }
        pool
    }

    /// Round-robin: the head rotates to the back; a busy head is replaced
    /// by a freshly constructed session.
    pub fn get_session(&self) -> Arc<Session> {
        let mut queue = self.queue.lock().unwrap();
        let front = queue.pop_front().expect("session pool is never empty");
        queue.push_back(front.clone());

        if front.is_working() {
            let fresh = Arc::new(Session::new());
            self.by_addr
                .lock()
                .unwrap()
                .insert(fresh.session_addr().to_vec(), fresh.clone());
            queue.push_back(fresh.clone());
            return fresh;
        }
        front
    }

    pub fn get_session_by_addr(&self, addr: &[u8]) -> Option<Arc<Session>> {
        self.by_addr.lock().unwrap().get(addr).cloned()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().unwrap().is_empty()
    }
}

// =============================================================================
// Dispatch
// =============================================================================

fn dispatch(app: &App, packet: &Packet) {
    let handled = match packet.command {
        XbcCommand::Transaction => on_transaction(app, packet),
        XbcCommand::TransactionHold => on_transaction_hold(app, packet),
        XbcCommand::TransactionInit => on_transaction_init(app, packet),
        XbcCommand::TransactionCreated => on_transaction_created(app, packet),
        XbcCommand::TransactionConfirmA => on_transaction_confirm_a(app, packet),
        XbcCommand::TransactionConfirmB => on_transaction_confirm_b(app, packet),
        XbcCommand::TransactionCancel => on_transaction_cancel(app, packet),
        XbcCommand::TransactionFinished => on_transaction_finished(app, packet),
        // accepting packets are mediated by the exchange on service nodes
        XbcCommand::TransactionAccepting => true,
        XbcCommand::Invalid => false,
    };
    if !handled {
        debug!("dropped {:?} packet", packet.command);
    }
}

fn read_order_id(reader: &mut PacketReader) -> Option<OrderId> {
    OrderId::from_slice(reader.read_bytes(32)?)
}

// =============================================================================
// Announce
// =============================================================================

/// A relayed order announce. For our own order this is the service node
/// echoing the broadcast, which promotes New to Pending. Unknown orders
/// enter the local book when both wallets are serviced (or the node shows
/// all orders).
fn on_transaction(app: &App, packet: &Packet) -> bool {
    let mut r = PacketReader::new(&packet.data);
    let Some(id) = read_order_id(&mut r) else {
        return false;
    };
    let Some(from) = r.read_bytes(20).map(<[u8]>::to_vec) else {
        return false;
    };
    let Some(from_currency) = r.read_padded(8) else {
        return false;
    };
    let Some(from_amount) = r.read_u64() else {
        return false;
    };
    let Some(to) = r.read_bytes(20).map(<[u8]>::to_vec) else {
        return false;
    };
    let Some(to_currency) = r.read_padded(8) else {
        return false;
    };
    let Some(to_amount) = r.read_u64() else {
        return false;
    };
    let Some(created) = r.read_u64() else {
        return false;
    };
    let Some(block_hash) = r.read_bytes(32) else {
        return false;
    };
    let block_hash: [u8; 32] = block_hash.try_into().unwrap_or_default();

    if let Some(ptr) = app.store.get_live(&id) {
        let mut o = ptr.lock().unwrap();
        if o.is_local() {
            if o.state == OrderState::New {
                o.state = OrderState::Pending;
                o.update_timestamp();
                debug!("{}", o.log_line("order acknowledged by service node"));
            }
        } else {
            o.update_timestamp();
        }
        return true;
    }

    // not ours: track it as a book entry when we can service the pair
    if !app.show_all_orders()
        && (!app.registry.has_currency(&from_currency) || !app.registry.has_currency(&to_currency))
    {
        return true;
    }

    let mut descr = OrderDescr {
        id,
        from,
        from_currency,
        from_amount,
        to,
        to_currency,
        to_amount,
        created,
        block_hash,
        state: OrderState::Pending,
        s_pubkey: packet.pubkey.clone(),
        ..Default::default()
    };
    descr.update_timestamp();
    app.store.append(crate::order::order_ptr(descr));
    true
}

// =============================================================================
// Hold
// =============================================================================

fn on_transaction_hold(app: &App, packet: &Packet) -> bool {
    let mut r = PacketReader::new(&packet.data);
    let Some(_hub) = r.read_bytes(20) else {
        return false;
    };
    let Some(id) = read_order_id(&mut r) else {
        return false;
    };

    let Some(ptr) = app.store.get_live(&id) else {
        return true;
    };
    let mut o = ptr.lock().unwrap();
    if o.is_local() {
        if matches!(o.state, OrderState::New | OrderState::Pending) {
            o.state = OrderState::Hold;
            o.update_timestamp();
            debug!("{}", o.log_line("order on hold"));
        }
    } else {
        // somebody is taking it; drop it from the open book
        drop(o);
        app.store.erase(&id);
    }
    true
}

// =============================================================================
// Init
// =============================================================================

fn on_transaction_init(app: &App, packet: &Packet) -> bool {
    let mut r = PacketReader::new(&packet.data);
    let Some(id) = read_order_id(&mut r) else {
        return false;
    };
    let Some(role) = r.read_bytes(1) else {
        return false;
    };
    let Some(o_pubkey) = r.read_bytes(33).map(<[u8]>::to_vec) else {
        return false;
    };

    let Some(ptr) = app.store.get_live(&id) else {
        return false;
    };

    match role[0] {
        b'A' => {
            {
                let mut o = ptr.lock().unwrap();
                if o.role != Some(OrderRole::Maker) || o.state > OrderState::Hold {
                    return false;
                }
                o.o_pubkey = o_pubkey;
                o.state = OrderState::Initialized;
                o.update_timestamp();
            }
            match build_own_deposit(app, &ptr) {
                Ok(()) => true,
                Err(reason) => {
                    app.cancel_with_reason(&id, reason);
                    true
                }
            }
        }
        b'B' => {
            let Some(x_pkh) = r.read_bytes(20).map(<[u8]>::to_vec) else {
                return false;
            };
            let Some(o_lock_time) = r.read_u32() else {
                return false;
            };
            let Some(o_bin_txid) = r.read_var() else {
                return false;
            };
            let Some(o_inner) = r.read_var() else {
                return false;
            };
            let o_bin_txid = String::from_utf8(o_bin_txid).unwrap_or_default();

            {
                let mut o = ptr.lock().unwrap();
                // Initialized is re-entered when a parked init replays
                if o.role != Some(OrderRole::Taker)
                    || !matches!(o.state, OrderState::Accepting | OrderState::Initialized)
                {
                    return false;
                }
                o.o_pubkey = o_pubkey;
                o.x_pkh = x_pkh;
                o.opponent_lock_time = o_lock_time;
                o.o_bin_txid = o_bin_txid;
                o.o_bin_tx_vout = 0;
                o.o_inner_script = o_inner;
                o.state = OrderState::Initialized;
                o.update_timestamp();
            }

            match verify_counterparty_deposit(app, &ptr) {
                Ok(true) => {}
                Ok(false) => {
                    // deposit not confirmed yet; retry on a later tick
                    app.process_later(&id, packet);
                    return true;
                }
                Err(reason) => {
                    app.cancel_with_reason(&id, reason);
                    return true;
                }
            }

            match build_own_deposit(app, &ptr) {
                Ok(()) => true,
                Err(reason) => {
                    app.cancel_with_reason(&id, reason);
                    true
                }
            }
        }
        _ => false,
    }
}

/// Check the counterparty deposit on the to-chain: script, amount,
/// locktime and confirmations. Ok(false) means "not yet confirmed".
fn verify_counterparty_deposit(app: &App, ptr: &crate::order::OrderPtr) -> Result<bool, TxCancelReason> {
    let (to_currency, to_amount, o_bin_txid, o_vout, o_inner, o_lock_time, is_maker) = {
        let o = ptr.lock().unwrap();
        (
            o.to_currency.clone(),
            o.to_amount,
            o.o_bin_txid.clone(),
            o.o_bin_tx_vout as usize,
            o.o_inner_script.clone(),
            o.opponent_lock_time,
            o.role == Some(OrderRole::Maker),
        )
    };
    let bad_deposit = if is_maker {
        TxCancelReason::BadBDepositTx
    } else {
        TxCancelReason::BadADepositTx
    };
    let bad_lock_time = if is_maker {
        TxCancelReason::BadBLockTime
    } else {
        TxCancelReason::BadALockTime
    };

    let conn_to = app
        .registry
        .connector_by_currency(&to_currency)
        .ok_or(TxCancelReason::RpcError)?;

    let info = match conn_to.rpc().get_transaction(&o_bin_txid) {
        Ok(info) => info,
        Err(_) => return Ok(false), // not visible yet
    };
    if info.confirmations < conn_to.param.required_confirmations {
        return Ok(false);
    }

    let expected = deposit_output_script(&Script::from_bytes(o_inner));
    let vout = info.vout.get(o_vout).ok_or(bad_deposit)?;
    if hex::decode(&vout.script_pubkey).unwrap_or_default() != expected.to_bytes() {
        return Err(bad_deposit);
    }
    let expected_amount = value_from_amount(to_amount);
    if (vout.amount - expected_amount).abs() > 1.0 / conn_to.coin() as f64 {
        return Err(bad_deposit);
    }

    let height = conn_to.get_block_count().map_err(|_| TxCancelReason::RpcError)?;
    if o_lock_time <= height {
        return Err(bad_lock_time);
    }
    if !is_maker {
        // a maker locktime beyond its target window starves our refund path
        let ceiling = conn_to.maker_lock_time(height) + MAX_LOCKTIME_DRIFT_BLOCKS;
        if o_lock_time > ceiling {
            return Err(bad_lock_time);
        }
    } else {
        let ceiling = conn_to.taker_lock_time(height) + MAX_LOCKTIME_DRIFT_BLOCKS;
        if o_lock_time > ceiling {
            return Err(bad_lock_time);
        }
    }

    Ok(true)
}

/// Build, sign and broadcast our deposit, pre-build its refund, then report
/// it to the service node.
fn build_own_deposit(app: &App, ptr: &crate::order::OrderPtr) -> Result<(), TxCancelReason> {
    let (
        id,
        role,
        from_currency,
        from_addr,
        from_amount,
        used_coins,
        m_keypair,
        x_pkh,
        o_pubkey,
        hub,
    ) = {
        let o = ptr.lock().unwrap();
        let x_pkh: Vec<u8> = if let Some(x) = &o.x_keypair {
            hash160(&x.public).to_vec()
        } else {
            o.x_pkh.clone()
        };
        (
            o.id,
            o.role,
            o.from_currency.clone(),
            o.from_addr.clone(),
            o.from_amount,
            o.used_coins.clone(),
            o.m_keypair.clone().ok_or(TxCancelReason::Unknown)?,
            x_pkh,
            o.o_pubkey.clone(),
            o.hub_address.clone(),
        )
    };
    if x_pkh.len() != 20 || o_pubkey.len() != 33 {
        return Err(TxCancelReason::Unknown);
    }

    let conn_from = app
        .registry
        .connector_by_currency(&from_currency)
        .ok_or(TxCancelReason::RpcError)?;

    let height = conn_from
        .get_block_count()
        .map_err(|_| TxCancelReason::RpcError)?;
    let lock_time = match role {
        Some(OrderRole::Maker) => conn_from.maker_lock_time(height),
        _ => conn_from.taker_lock_time(height),
    };

    let my_pkh = hash160(&m_keypair.public);
    let other_pkh = hash160(&o_pubkey);
    let x_pkh_arr: [u8; 20] = x_pkh.clone().try_into().map_err(|_| TxCancelReason::Unknown)?;
    let inner = deposit_script(lock_time, &my_pkh, &other_pkh, &x_pkh_arr);

    let inputs: Vec<XTxIn> = used_coins
        .iter()
        .map(|u: &UtxoEntry| XTxIn::new(&u.txid, u.vout, u.amount))
        .collect();
    let deposit_amount = value_from_amount(from_amount);

    let deposit =
        create_deposit_transaction(&conn_from, &inputs, &inner, deposit_amount, &from_addr)
            .map_err(|_| TxCancelReason::NoMoney)?;

    // refund is prepared up front so a wallet outage later cannot strand
    // the deposit
    let refund_input = XTxIn::new(&deposit.txid, 0, deposit_amount);
    let refund_out = deposit_amount - conn_from.min_tx_fee2(1, 1);
    let refund = create_refund_transaction(
        &conn_from,
        &refund_input,
        &[(from_addr.clone(), refund_out)],
        &m_keypair.public,
        &m_keypair.private,
        &inner,
        lock_time,
    )
    .map_err(|_| TxCancelReason::NotSigned)?;

    conn_from
        .send_raw_transaction(&deposit.raw)
        .map_err(|_| TxCancelReason::RpcError)?;

    {
        let mut o = ptr.lock().unwrap();
        o.bin_txid = deposit.txid.clone();
        o.bin_tx_vout = 0;
        o.inner_script = inner.to_bytes();
        o.lock_time = lock_time;
        o.refund_tx = refund.raw;
        o.state = OrderState::Created;
        o.watch.start_block = height;
        o.watch.current_block = height;
        o.update_timestamp();
        log::info!("{}", o.log_line("deposit created"));
    }
    app.watch_for_spent_deposit(ptr.clone());

    let mut packet = Packet::new(XbcCommand::TransactionCreated);
    packet.put_bytes(id.as_bytes());
    packet.put_var(deposit.txid.as_bytes());
    packet.put_var(inner.as_slice());
    packet.put_u32(lock_time);
    packet.sign(&m_keypair.public, &m_keypair.private);
    app.send_packet_to(&hub, &packet);

    Ok(())
}

// =============================================================================
// Created (maker receives the taker deposit)
// =============================================================================

fn on_transaction_created(app: &App, packet: &Packet) -> bool {
    let mut r = PacketReader::new(&packet.data);
    let Some(id) = read_order_id(&mut r) else {
        return false;
    };
    let Some(deposit_txid) = r.read_var() else {
        return false;
    };
    let Some(inner) = r.read_var() else {
        return false;
    };
    let Some(lock_time) = r.read_u32() else {
        return false;
    };

    let Some(ptr) = app.store.get_live(&id) else {
        return false;
    };
    {
        let mut o = ptr.lock().unwrap();
        if o.role != Some(OrderRole::Maker) || o.state != OrderState::Created {
            return false;
        }
        o.o_bin_txid = String::from_utf8(deposit_txid).unwrap_or_default();
        o.o_bin_tx_vout = 0;
        o.o_inner_script = inner;
        o.opponent_lock_time = lock_time;
        o.update_timestamp();
    }

    match verify_counterparty_deposit(app, &ptr) {
        Ok(true) => {}
        Ok(false) => {
            app.process_later(&id, packet);
            return true;
        }
        Err(reason) => {
            app.cancel_with_reason(&id, reason);
            return true;
        }
    }

    // redeem the taker deposit; spending it reveals X.pub on-chain
    match pay_counterparty_deposit(app, &ptr) {
        Ok(()) => true,
        Err(reason) => {
            app.cancel_with_reason(&id, reason);
            true
        }
    }
}

/// Maker: spend the taker deposit through the ELSE branch with the secret.
fn pay_counterparty_deposit(app: &App, ptr: &crate::order::OrderPtr) -> Result<(), TxCancelReason> {
    let (id, to_currency, to_addr, to_amount, m_keypair, x_keypair, o_bin_txid, o_inner, hub) = {
        let o = ptr.lock().unwrap();
        (
            o.id,
            o.to_currency.clone(),
            o.to_addr.clone(),
            o.to_amount,
            o.m_keypair.clone().ok_or(TxCancelReason::Unknown)?,
            o.x_keypair.clone().ok_or(TxCancelReason::Unknown)?,
            o.o_bin_txid.clone(),
            o.o_inner_script.clone(),
            o.hub_address.clone(),
        )
    };

    let conn_to = app
        .registry
        .connector_by_currency(&to_currency)
        .ok_or(TxCancelReason::RpcError)?;

    let amount = value_from_amount(to_amount);
    let input = XTxIn::new(&o_bin_txid, 0, amount);
    let outputs = vec![(to_addr, amount - conn_to.min_tx_fee2(1, 1))];
    let inner = Script::from_bytes(o_inner);

    let pay = create_payment_transaction(
        &conn_to,
        &input,
        &outputs,
        &m_keypair.public,
        &m_keypair.private,
        &x_keypair.public,
        &inner,
    )
    .map_err(|_| TxCancelReason::NotSigned)?;

    conn_to
        .send_raw_transaction(&pay.raw)
        .map_err(|_| TxCancelReason::RpcError)?;

    {
        let mut o = ptr.lock().unwrap();
        o.pay_txid = pay.txid.clone();
        o.watch.redeemed_counterparty_deposit = true;
        o.state = OrderState::Committed;
        o.update_timestamp();
        log::info!("{}", o.log_line("counterparty deposit redeemed, secret revealed"));
    }

    let mut packet = Packet::new(XbcCommand::TransactionConfirmA);
    packet.put_bytes(id.as_bytes());
    packet.put_var(pay.txid.as_bytes());
    packet.sign(&m_keypair.public, &m_keypair.private);
    app.send_packet_to(&hub, &packet);
    Ok(())
}

// =============================================================================
// Confirms
// =============================================================================

/// Taker learns the maker pay txid early instead of waiting for the block
/// walk to find it.
fn on_transaction_confirm_a(app: &App, packet: &Packet) -> bool {
    let mut r = PacketReader::new(&packet.data);
    let Some(id) = read_order_id(&mut r) else {
        return false;
    };
    let Some(pay_txid) = r.read_var() else {
        return false;
    };

    let Some(ptr) = app.store.get_live(&id) else {
        return false;
    };
    let mut o = ptr.lock().unwrap();
    if o.role != Some(OrderRole::Taker) || o.state < OrderState::Created {
        return false;
    }
    o.other_pay_txid = String::from_utf8(pay_txid).unwrap_or_default();
    o.watch.done_watching = true;
    o.update_timestamp();
    true
}

/// Maker learns the taker finished; the swap is complete on both chains.
fn on_transaction_confirm_b(app: &App, packet: &Packet) -> bool {
    let mut r = PacketReader::new(&packet.data);
    let Some(id) = read_order_id(&mut r) else {
        return false;
    };

    let Some(ptr) = app.store.get_live(&id) else {
        return false;
    };
    {
        let mut o = ptr.lock().unwrap();
        if o.role != Some(OrderRole::Maker) || o.state < OrderState::Committed {
            return false;
        }
        o.state = OrderState::Finished;
        o.update_timestamp();
        log::info!("{}", o.log_line("swap finished"));
    }
    app.move_order_to_history(&id);
    app.unwatch_spent_deposit(&id);
    true
}

// =============================================================================
// Cancel / Finished
// =============================================================================

fn on_transaction_cancel(app: &App, packet: &Packet) -> bool {
    let mut r = PacketReader::new(&packet.data);
    let Some(id) = read_order_id(&mut r) else {
        return false;
    };
    let Some(reason) = r.read_u32() else {
        return false;
    };

    let Some(ptr) = app.store.get_live(&id) else {
        return true;
    };
    let is_local = ptr.lock().unwrap().is_local();
    if !is_local {
        app.store.erase(&id);
        return true;
    }
    app.local_cancel(&id, TxCancelReason::from_u32(reason));
    true
}

fn on_transaction_finished(app: &App, packet: &Packet) -> bool {
    let mut r = PacketReader::new(&packet.data);
    let Some(id) = read_order_id(&mut r) else {
        return false;
    };

    let Some(ptr) = app.store.get_live(&id) else {
        return true;
    };
    let is_local = ptr.lock().unwrap().is_local();
    if !is_local {
        // the pair completed elsewhere; remove from the open book
        app.store.erase(&id);
        return true;
    }
    {
        let mut o = ptr.lock().unwrap();
        o.state = OrderState::Finished;
        o.update_timestamp();
    }
    app.move_order_to_history(&id);
    true
}

// =============================================================================
// Redemptions (driven by the deposit watcher)
// =============================================================================

/// Submit the pre-built refund of our own deposit. Returns true when the
/// refund settled (including benign "already spent/known" rejections).
pub fn redeem_order_deposit(app: &App, ptr: &crate::order::OrderPtr) -> bool {
    let (from_currency, refund_tx, already) = {
        let o = ptr.lock().unwrap();
        (
            o.from_currency.clone(),
            o.refund_tx.clone(),
            o.watch.redeemed_own_deposit,
        )
    };
    if already {
        return true;
    }
    if refund_tx.is_empty() {
        return false;
    }
    let Some(conn_from) = app.registry.connector_by_currency(&from_currency) else {
        return false;
    };

    let settled = match conn_from.send_raw_transaction(&refund_tx) {
        Ok(_) => true,
        Err(e) if e.is_benign_refund_failure() => true,
        Err(e) => {
            warn!("refund submission failed: {}", e);
            false
        }
    };
    if settled {
        let mut o = ptr.lock().unwrap();
        o.watch.redeemed_own_deposit = true;
        if o.state < OrderState::Finished {
            o.state = OrderState::RolledBack;
            o.reason = TxCancelReason::Rollback;
            log::info!("{}", o.log_line("deposit refunded"));
        }
    }
    settled
}

/// Taker: extract X.pub from the maker's pay tx and redeem the maker
/// deposit with it.
pub fn redeem_order_counterparty_deposit(app: &App, ptr: &crate::order::OrderPtr) -> bool {
    let (
        id,
        from_currency,
        to_currency,
        to_addr,
        to_amount,
        m_keypair,
        mut x_pubkey,
        other_pay_txid,
        bin_txid,
        bin_tx_vout,
        o_bin_txid,
        o_inner,
        hub,
    ) = {
        let o = ptr.lock().unwrap();
        let Some(m) = o.m_keypair.clone() else {
            return false;
        };
        (
            o.id,
            o.from_currency.clone(),
            o.to_currency.clone(),
            o.to_addr.clone(),
            o.to_amount,
            m,
            o.x_pubkey.clone(),
            o.other_pay_txid.clone(),
            o.bin_txid.clone(),
            o.bin_tx_vout,
            o.o_bin_txid.clone(),
            o.o_inner_script.clone(),
            o.hub_address.clone(),
        )
    };

    let Some(conn_from) = app.registry.connector_by_currency(&from_currency) else {
        return false;
    };
    let Some(conn_to) = app.registry.connector_by_currency(&to_currency) else {
        return false;
    };

    // learn the secret from the input that spent our deposit
    if x_pubkey.is_empty() {
        let script_sig =
            match conn_from.spender_script_sig(&other_pay_txid, &bin_txid, bin_tx_vout) {
                Ok(Some(s)) => s,
                _ => return false,
            };
        match extract_secret_pubkey(&script_sig) {
            Some(pk) => x_pubkey = pk,
            None => {
                warn!("pay tx for order {} does not reveal a secret", id);
                return false;
            }
        }
        ptr.lock().unwrap().x_pubkey = x_pubkey.clone();
    }

    let amount = value_from_amount(to_amount);
    let input = XTxIn::new(&o_bin_txid, 0, amount);
    let outputs = vec![(to_addr, amount - conn_to.min_tx_fee2(1, 1))];
    let inner = Script::from_bytes(o_inner);

    let Ok(pay) = create_payment_transaction(
        &conn_to,
        &input,
        &outputs,
        &m_keypair.public,
        &m_keypair.private,
        &x_pubkey,
        &inner,
    ) else {
        return false;
    };

    let settled = match conn_to.send_raw_transaction(&pay.raw) {
        Ok(_) => true,
        Err(e) if e.is_benign_refund_failure() => true,
        Err(e) => {
            warn!("redeem submission failed: {}", e);
            false
        }
    };
    if !settled {
        return false;
    }

    {
        let mut o = ptr.lock().unwrap();
        o.pay_txid = pay.txid.clone();
        o.watch.redeemed_counterparty_deposit = true;
        o.state = OrderState::Finished;
        o.update_timestamp();
        log::info!("{}", o.log_line("counterparty deposit redeemed"));
    }

    let mut packet = Packet::new(XbcCommand::TransactionConfirmB);
    packet.put_bytes(id.as_bytes());
    packet.put_var(pay.txid.as_bytes());
    packet.sign(&m_keypair.public, &m_keypair.private);
    app.send_packet_to(&hub, &packet);

    app.move_order_to_history(&id);
    true
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::COIN;
    use crate::app::testing::{test_addr, TestEnv};
    use crate::keys::{self, KeyPair};
    use crate::rpc::{RpcTxInfo, RpcTxVout};
    use crate::txbuilder::deposit_output_script;

    fn send(env: &TestEnv, packet: &Packet) {
        env.app.on_broadcast_received(&packet.body());
    }

    fn hold_packet(id: &OrderId, kp: &KeyPair) -> Packet {
        let mut p = Packet::new(XbcCommand::TransactionHold);
        p.put_bytes(&[0u8; 20]);
        p.put_bytes(id.as_bytes());
        p.sign(&kp.public, &kp.private);
        p
    }

    /// scriptSig of a single-input transaction serialized without a time
    /// field.
    fn script_sig_of(raw_hex: &str) -> Vec<u8> {
        let raw = hex::decode(raw_hex).unwrap();
        let len = raw[41] as usize;
        raw[42..42 + len].to_vec()
    }

    #[test]
    fn test_announce_enters_open_book() {
        let env = TestEnv::new();
        let kp = KeyPair::generate();
        let id = OrderId([0x77; 32]);

        let mut p = Packet::new(XbcCommand::Transaction);
        p.put_bytes(id.as_bytes());
        p.put_bytes(&[0x11; 20]);
        p.put_padded("BTC", 8);
        p.put_u64(COIN);
        p.put_bytes(&[0x22; 20]);
        p.put_padded("DGB", 8);
        p.put_u64(10 * COIN);
        p.put_u64(crate::amount::now_micros());
        p.put_bytes(&[0xAA; 32]);
        p.put_u32(0);
        p.sign(&kp.public, &kp.private);
        send(&env, &p);

        let ptr = env.app.store.get_live(&id).expect("book entry missing");
        let o = ptr.lock().unwrap();
        assert!(!o.is_local());
        assert_eq!(o.state, OrderState::Pending);
        assert_eq!(o.from_currency, "BTC");
        assert_eq!(o.to_amount, 10 * COIN);
    }

    #[test]
    fn test_announce_for_unserviced_pair_ignored() {
        let env = TestEnv::new();
        let kp = KeyPair::generate();
        let id = OrderId([0x78; 32]);

        let mut p = Packet::new(XbcCommand::Transaction);
        p.put_bytes(id.as_bytes());
        p.put_bytes(&[0x11; 20]);
        p.put_padded("LTC", 8); // not serviced locally
        p.put_u64(COIN);
        p.put_bytes(&[0x22; 20]);
        p.put_padded("DGB", 8);
        p.put_u64(10 * COIN);
        p.put_u64(crate::amount::now_micros());
        p.put_bytes(&[0xAA; 32]);
        p.put_u32(0);
        p.sign(&kp.public, &kp.private);
        send(&env, &p);

        assert!(env.app.store.get_live(&id).is_none());
    }

    #[test]
    fn test_hold_drops_remote_order_from_book() {
        let env = TestEnv::new();
        let id = env.insert_remote_order();
        let kp = KeyPair::generate();
        send(&env, &hold_packet(&id, &kp));
        assert!(env.app.store.get_live(&id).is_none());
    }

    #[test]
    fn test_maker_full_handshake() {
        let env = TestEnv::new();
        let id = env.create_maker_order();
        let snode_kp = KeyPair::generate();
        let taker_kp = KeyPair::generate();

        // the service node echoes our announce back to the network
        let frame = env.relay.0.lock().unwrap().last().unwrap().clone();
        env.app.on_broadcast_received(&frame[28..]);
        {
            let ptr = env.app.store.get_live(&id).unwrap();
            assert_eq!(ptr.lock().unwrap().state, OrderState::Pending);
        }

        // a taker shows up; the node puts the order on hold
        send(&env, &hold_packet(&id, &snode_kp));
        {
            let ptr = env.app.store.get_live(&id).unwrap();
            assert_eq!(ptr.lock().unwrap().state, OrderState::Hold);
        }

        // init delivers the taker's deposit-leg pubkey; we deposit BTC
        let mut init = Packet::new(XbcCommand::TransactionInit);
        init.put_bytes(id.as_bytes());
        init.put_bytes(b"A");
        init.put_bytes(&taker_kp.public);
        init.sign(&snode_kp.public, &snode_kp.private);
        send(&env, &init);

        let (m_kp, x_kp, lock_time) = {
            let ptr = env.app.store.get_live(&id).unwrap();
            let o = ptr.lock().unwrap();
            assert_eq!(o.state, OrderState::Created);
            assert!(!o.bin_txid.is_empty());
            assert!(!o.refund_tx.is_empty());
            // maker window on a 600s chain: 7200/600 = 12 blocks above tip
            assert_eq!(o.lock_time, 112);
            (
                o.m_keypair.clone().unwrap(),
                o.x_keypair.clone().unwrap(),
                o.lock_time,
            )
        };
        assert!(lock_time > 100);
        assert_eq!(env.app.watched_deposit_count(), 1);
        assert_eq!(env.btc.chain.lock().unwrap().sent.len(), 1, "deposit broadcast");
        assert_eq!(env.relay.last_packet().command, XbcCommand::TransactionCreated);

        // the taker deposits DGB; its deposit pays P2SH of a script whose
        // hashlock is our X key
        let x_pkh = keys::hash160(&x_kp.public);
        let taker_inner = deposit_script(
            300,
            &keys::hash160(&taker_kp.public),
            &keys::hash160(&m_kp.public),
            &x_pkh,
        );
        let taker_dep_txid = "ab".repeat(32);
        env.dgb.chain.lock().unwrap().transactions.insert(
            taker_dep_txid.clone(),
            RpcTxInfo {
                txid: taker_dep_txid.clone(),
                confirmations: 2,
                vin: vec![],
                vout: vec![RpcTxVout {
                    amount: 10.0,
                    script_pubkey: hex::encode(deposit_output_script(&taker_inner).to_bytes()),
                }],
            },
        );

        let mut created = Packet::new(XbcCommand::TransactionCreated);
        created.put_bytes(id.as_bytes());
        created.put_var(taker_dep_txid.as_bytes());
        created.put_var(taker_inner.as_slice());
        created.put_u32(300);
        created.sign(&snode_kp.public, &snode_kp.private);
        send(&env, &created);

        {
            let ptr = env.app.store.get_live(&id).unwrap();
            let o = ptr.lock().unwrap();
            assert_eq!(o.state, OrderState::Committed);
            assert!(!o.pay_txid.is_empty());
            assert!(o.watch.redeemed_counterparty_deposit);
        }
        assert_eq!(env.relay.last_packet().command, XbcCommand::TransactionConfirmA);

        // spending the taker deposit revealed X.pub on the DGB chain
        let pay_raw = env.dgb.chain.lock().unwrap().sent.last().unwrap().clone();
        let revealed = extract_secret_pubkey(&script_sig_of(&pay_raw)).expect("no secret");
        assert_eq!(revealed, x_kp.public);

        // the taker redeemed on our chain; swap done
        let mut confirm_b = Packet::new(XbcCommand::TransactionConfirmB);
        confirm_b.put_bytes(id.as_bytes());
        confirm_b.put_var(b"taker-pay");
        confirm_b.sign(&snode_kp.public, &snode_kp.private);
        send(&env, &confirm_b);

        assert!(env.app.store.get_live(&id).is_none());
        let ptr = env.app.store.get(&id).expect("not archived");
        assert_eq!(ptr.lock().unwrap().state, OrderState::Finished);
    }

    #[test]
    fn test_maker_rejects_bad_taker_locktime() {
        let env = TestEnv::new();
        let id = env.create_maker_order();
        let snode_kp = KeyPair::generate();
        let taker_kp = KeyPair::generate();

        let mut init = Packet::new(XbcCommand::TransactionInit);
        init.put_bytes(id.as_bytes());
        init.put_bytes(b"A");
        init.put_bytes(&taker_kp.public);
        init.sign(&snode_kp.public, &snode_kp.private);
        send(&env, &init);

        let (m_kp, x_kp) = {
            let ptr = env.app.store.get_live(&id).unwrap();
            let o = ptr.lock().unwrap();
            (o.m_keypair.clone().unwrap(), o.x_keypair.clone().unwrap())
        };

        let taker_inner = deposit_script(
            90, // at or below the current height: refund already spendable
            &keys::hash160(&taker_kp.public),
            &keys::hash160(&m_kp.public),
            &keys::hash160(&x_kp.public),
        );
        let txid = "cd".repeat(32);
        env.dgb.chain.lock().unwrap().transactions.insert(
            txid.clone(),
            RpcTxInfo {
                txid: txid.clone(),
                confirmations: 2,
                vin: vec![],
                vout: vec![RpcTxVout {
                    amount: 10.0,
                    script_pubkey: hex::encode(deposit_output_script(&taker_inner).to_bytes()),
                }],
            },
        );

        let mut created = Packet::new(XbcCommand::TransactionCreated);
        created.put_bytes(id.as_bytes());
        created.put_var(txid.as_bytes());
        created.put_var(taker_inner.as_slice());
        created.put_u32(90);
        created.sign(&snode_kp.public, &snode_kp.private);
        send(&env, &created);

        assert!(env.app.store.get_live(&id).is_none());
        let ptr = env.app.store.get(&id).unwrap();
        let o = ptr.lock().unwrap();
        assert_eq!(o.state, OrderState::Cancelled);
        assert_eq!(o.reason, TxCancelReason::BadBLockTime);
    }

    #[test]
    fn test_taker_init_builds_deposit() {
        let env = TestEnv::new();
        let id = env.insert_remote_order();
        env.app
            .accept_order(&id, &test_addr(2), &test_addr(1))
            .unwrap();

        let snode_kp = KeyPair::generate();
        let maker_kp = KeyPair::generate();
        let maker_x = KeyPair::generate();
        let x_pkh = keys::hash160(&maker_x.public);

        let taker_m = {
            let ptr = env.app.store.get_live(&id).unwrap();
            let v = ptr.lock().unwrap().m_keypair.clone().unwrap();
            v
        };

        // maker deposited 1 BTC, refundable at height 115
        let maker_inner = deposit_script(
            115,
            &keys::hash160(&maker_kp.public),
            &keys::hash160(&taker_m.public),
            &x_pkh,
        );
        let maker_dep_txid = "ef".repeat(32);
        env.btc.chain.lock().unwrap().transactions.insert(
            maker_dep_txid.clone(),
            RpcTxInfo {
                txid: maker_dep_txid.clone(),
                confirmations: 2,
                vin: vec![],
                vout: vec![RpcTxVout {
                    amount: 1.0,
                    script_pubkey: hex::encode(deposit_output_script(&maker_inner).to_bytes()),
                }],
            },
        );

        let mut init = Packet::new(XbcCommand::TransactionInit);
        init.put_bytes(id.as_bytes());
        init.put_bytes(b"B");
        init.put_bytes(&maker_kp.public);
        init.put_bytes(&x_pkh);
        init.put_u32(115);
        init.put_var(maker_dep_txid.as_bytes());
        init.put_var(maker_inner.as_slice());
        init.sign(&snode_kp.public, &snode_kp.private);
        send(&env, &init);

        let ptr = env.app.store.get_live(&id).unwrap();
        let o = ptr.lock().unwrap();
        assert_eq!(o.state, OrderState::Created);
        assert_eq!(o.x_pkh, x_pkh.to_vec());
        assert_eq!(o.o_bin_txid, maker_dep_txid);
        assert!(!o.bin_txid.is_empty());
        // taker window on a 15s chain: 3600/15 = 240 blocks above tip
        assert_eq!(o.lock_time, 340);
        drop(o);

        assert_eq!(env.dgb.chain.lock().unwrap().sent.len(), 1, "taker deposit broadcast");
        assert_eq!(env.relay.last_packet().command, XbcCommand::TransactionCreated);
        assert_eq!(env.app.watched_deposit_count(), 1);
    }

    #[test]
    fn test_taker_init_waits_for_confirmations() {
        let env = TestEnv::new();
        let id = env.insert_remote_order();
        env.app
            .accept_order(&id, &test_addr(2), &test_addr(1))
            .unwrap();

        let snode_kp = KeyPair::generate();
        let maker_kp = KeyPair::generate();
        let x_pkh = [0x42u8; 20];
        let taker_m = {
            let ptr = env.app.store.get_live(&id).unwrap();
            let v = ptr.lock().unwrap().m_keypair.clone().unwrap();
            v
        };
        let maker_inner = deposit_script(
            115,
            &keys::hash160(&maker_kp.public),
            &keys::hash160(&taker_m.public),
            &x_pkh,
        );
        let maker_dep_txid = "0a".repeat(32);
        env.btc.chain.lock().unwrap().transactions.insert(
            maker_dep_txid.clone(),
            RpcTxInfo {
                txid: maker_dep_txid.clone(),
                confirmations: 0, // still in the mempool
                vin: vec![],
                vout: vec![RpcTxVout {
                    amount: 1.0,
                    script_pubkey: hex::encode(deposit_output_script(&maker_inner).to_bytes()),
                }],
            },
        );

        let mut init = Packet::new(XbcCommand::TransactionInit);
        init.put_bytes(id.as_bytes());
        init.put_bytes(b"B");
        init.put_bytes(&maker_kp.public);
        init.put_bytes(&x_pkh);
        init.put_u32(115);
        init.put_var(maker_dep_txid.as_bytes());
        init.put_var(maker_inner.as_slice());
        init.sign(&snode_kp.public, &snode_kp.private);
        send(&env, &init);

        // parked, not progressed
        {
            let ptr = env.app.store.get_live(&id).unwrap();
            assert_eq!(ptr.lock().unwrap().state, OrderState::Initialized);
        }
        assert!(env.dgb.chain.lock().unwrap().sent.is_empty());

        // deposit confirms; the replay tick finishes the leg
        env.btc
            .chain
            .lock()
            .unwrap()
            .transactions
            .get_mut(&maker_dep_txid)
            .unwrap()
            .confirmations = 2;
        env.app.check_pending_packets();

        let ptr = env.app.store.get_live(&id).unwrap();
        assert_eq!(ptr.lock().unwrap().state, OrderState::Created);
        assert_eq!(env.dgb.chain.lock().unwrap().sent.len(), 1);
    }

    #[test]
    fn test_confirm_a_marks_taker_done_watching() {
        let env = TestEnv::new();
        let id = env.insert_remote_order();
        {
            let ptr = env.app.store.get_live(&id).unwrap();
            let mut o = ptr.lock().unwrap();
            o.role = Some(OrderRole::Taker);
            o.state = OrderState::Created;
        }
        let kp = KeyPair::generate();
        let mut p = Packet::new(XbcCommand::TransactionConfirmA);
        p.put_bytes(id.as_bytes());
        p.put_var(b"maker-pay-txid");
        p.sign(&kp.public, &kp.private);
        send(&env, &p);

        let ptr = env.app.store.get_live(&id).unwrap();
        let o = ptr.lock().unwrap();
        assert_eq!(o.other_pay_txid, "maker-pay-txid");
        assert!(o.watch.done_watching);
    }

    #[test]
    fn test_cancel_packet_releases_local_order() {
        let env = TestEnv::new();
        let id = env.create_maker_order();
        let kp = KeyPair::generate();

        let mut p = Packet::new(XbcCommand::TransactionCancel);
        p.put_bytes(id.as_bytes());
        p.put_u32(TxCancelReason::BridgeRejected as u32);
        p.sign(&kp.public, &kp.private);
        send(&env, &p);

        assert!(env.app.store.get_live(&id).is_none());
        let ptr = env.app.store.get(&id).unwrap();
        let o = ptr.lock().unwrap();
        assert_eq!(o.state, OrderState::Cancelled);
        assert_eq!(o.reason, TxCancelReason::BridgeRejected);
        drop(o);
        assert!(env.app.locks.locked_utxos("BTC").is_empty());
    }

    #[test]
    fn test_session_pool_round_robin() {
        let pool = SessionPool::new(3);
        assert_eq!(pool.len(), 3);
        let a = pool.get_session();
        let b = pool.get_session();
        assert_ne!(a.session_addr(), b.session_addr());
        assert!(pool.get_session_by_addr(a.session_addr()).is_some());
        assert!(pool.get_session_by_addr(&[0u8; 20]).is_none());
    }

    #[test]
    fn test_busy_session_replaced() {
        let pool = SessionPool::new(1);
        let head = pool.get_session();
        head.working.store(true, Ordering::SeqCst);
        let fresh = pool.get_session();
        assert_ne!(head.session_addr(), fresh.session_addr());
        assert_eq!(pool.len(), 2);
    }
}
