// =============================================================================
// DRIFTBRIDGE v1.3 - Chain Watchers
// =============================================================================
//
// Two periodic passes over chain state:
//
// - Deposit watcher (traders): scans the from-chain for the counterparty
//   pay tx that spends our deposit and reveals the secret, refunds our own
//   deposit once its locktime expires, and drives the final redemption.
//
// - Trader watchdog (service nodes): once a trader's deposit locktime
//   expires, submits that trader's refund tx on their behalf in case the
//   trader went offline mid-swap.
//
// =============================================================================

use log::debug;

use crate::app::App;
use crate::connector::WalletConnector;
use crate::order::{OrderId, OrderPtr};
use crate::session::{redeem_order_counterparty_deposit, redeem_order_deposit};
use crate::TRADER_REFUND_GIVEUP_SECS;

// =============================================================================
// Deposit Watcher
// =============================================================================

/// One pass over every watched order. Single-flight is enforced by the
/// caller (`App::check_watches_on_deposit_spends`).
pub fn check_deposit_spends(app: &App, watches: Vec<OrderPtr>) {
    for ptr in watches {
        // per-order guard against overlapping passes
        {
            let mut o = ptr.lock().unwrap();
            if o.watch.watching {
                continue;
            }
            o.watch.watching = true;
        }
        let result = watch_one(app, &ptr);
        {
            let mut o = ptr.lock().unwrap();
            o.watch.watching = false;
        }
        if result {
            let id = {
                let mut o = ptr.lock().unwrap();
                o.watch.done_watching = true;
                o.id
            };
            app.unwatch_spent_deposit(&id);
        }
    }
}

/// Returns true when this order needs no further watching.
fn watch_one(app: &App, ptr: &OrderPtr) -> bool {
    let (from_currency, has_secret, start_block, mut current_block, bin_txid, bin_tx_vout, lock_time) = {
        let o = ptr.lock().unwrap();
        (
            o.from_currency.clone(),
            o.has_secret(),
            o.watch.start_block,
            o.watch.current_block,
            o.bin_txid.clone(),
            o.bin_tx_vout,
            o.lock_time,
        )
    };

    let Some(conn_from) = app.registry.connector_by_currency(&from_currency) else {
        return false; // wallet may be offline; retry next tick
    };
    let Ok(block_count) = conn_from.get_block_count() else {
        return false;
    };

    // hunt for the counterparty pay tx while the secret is unknown
    if !has_secret {
        let mut txids: Vec<String> = Vec::new();
        if start_block == block_count {
            match conn_from.get_raw_mempool() {
                Ok(mempool) => txids = mempool,
                Err(_) => return false,
            }
        } else {
            let mut failure = false;
            while current_block <= block_count {
                let Ok(block_hash) = conn_from.get_block_hash(current_block) else {
                    failure = true;
                    break;
                };
                let Ok(mut txs) = conn_from.get_transactions_in_block(&block_hash) else {
                    failure = true;
                    break;
                };
                txids.append(&mut txs);
                current_block += 1;
                ptr.lock().unwrap().watch.current_block = current_block;
            }
            if failure {
                return false;
            }
        }

        for txid in &txids {
            if let Ok(true) = conn_from.is_utxo_spent_in_tx(txid, &bin_txid, bin_tx_vout) {
                let mut o = ptr.lock().unwrap();
                o.other_pay_txid = txid.clone();
                o.watch.done_watching = true;
                debug!("{}", o.log_line("counterparty pay tx found"));
                break;
            }
        }
    }

    let mut done = false;

    // locktime expired: take our own deposit back
    if lock_time <= block_count && redeem_order_deposit(app, ptr) {
        done = true;
    }

    // pay tx known and the counterparty deposit not yet redeemed: redeem it
    let (found, redeemed) = {
        let o = ptr.lock().unwrap();
        (o.watch.done_watching, o.watch.redeemed_counterparty_deposit)
    };
    if found && !redeemed && redeem_order_counterparty_deposit(app, ptr) {
        done = true;
    }

    done
}

// =============================================================================
// Trader Watchdog
// =============================================================================

/// One side of a completed exchange watched for refund on behalf of the
/// trader.
#[derive(Clone, Debug, Default)]
pub struct TraderSide {
    pub currency: String,
    pub lock_time: u32,
    pub refund_tx: String,
    pub refunded: bool,
}

/// Service-node record of both traders' refund transactions.
#[derive(Clone, Debug, Default)]
pub struct TraderWatch {
    pub id: OrderId,
    pub a: TraderSide,
    pub b: TraderSide,
    pub finished: bool,
}

impl TraderWatch {
    pub fn settled(&self) -> bool {
        (self.a.refunded && self.b.refunded) || self.finished
    }
}

/// Submit one trader's refund once their locktime passed. Benign daemon
/// rejections mean the trader (or the counterparty pay tx) got there
/// first. A locktime expired for over an hour stops the watch regardless.
fn check_trader_side(conn: &WalletConnector, side: &TraderSide) -> bool {
    let Ok(block_count) = conn.get_block_count() else {
        return false;
    };
    if side.lock_time > block_count {
        return false;
    }

    let done = match conn.send_raw_transaction(&side.refund_tx) {
        Ok(_) => true,
        Err(e) => e.is_benign_refund_failure(),
    };
    if done {
        return true;
    }

    let expired_secs = (block_count - side.lock_time) as u64 * conn.param.block_time as u64;
    expired_secs > TRADER_REFUND_GIVEUP_SECS
}

/// One pass over the trader-watch table. Single-flight is enforced by the
/// caller (`App::watch_trader_deposits`).
pub fn check_trader_refunds(app: &App, mut watches: Vec<TraderWatch>) -> Vec<TraderWatch> {
    for watch in watches.iter_mut() {
        if !watch.a.refunded && !watch.a.refund_tx.is_empty() && !watch.finished {
            if let Some(conn) = app.registry.connector_by_currency(&watch.a.currency) {
                if check_trader_side(&conn, &watch.a) {
                    watch.a.refunded = true;
                }
            }
        }
        if !watch.b.refunded && !watch.b.refund_tx.is_empty() && !watch.finished {
            if let Some(conn) = app.registry.connector_by_currency(&watch.b.currency) {
                if check_trader_side(&conn, &watch.b) {
                    watch.b.refunded = true;
                }
            }
        }
    }
    watches
}

// =============================================================================
// Tests
// =============================================================================
