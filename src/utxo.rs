// =============================================================================
// DRIFTBRIDGE v1.3 - UTXO Entries and the Lock Manager
// =============================================================================
//
// Orders spend wallet UTXOs that must not be shared across concurrent
// orders. The lock manager is the process-wide ledger of outputs reserved
// by live orders ("order locks") and by service-node fee payments
// ("fee locks", BLOCK only).
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::hash::{Hash, Hasher};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

// =============================================================================
// UTXO Entry
// =============================================================================

/// A wallet output referenced by an order.
///
/// Equality and hashing use (txid, vout) only; the remaining fields are
/// carried data.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct UtxoEntry {
    /// Funding transaction id (hex).
    pub txid: String,
    /// Output index.
    pub vout: u32,
    /// Owning address in canonical form.
    pub address: String,
    /// Amount in coin units.
    pub amount: f64,
    /// 65-byte recoverable signature over `signing_string()`, proving
    /// ownership of the output to the counterparty.
    pub signature: Vec<u8>,
    /// hash160 of the owning address (20 bytes).
    pub raw_address: Vec<u8>,
    /// Confirmations at listing time.
    pub confirmations: u32,
}

impl UtxoEntry {
    pub fn new(txid: &str, vout: u32, address: &str, amount: f64) -> Self {
        UtxoEntry {
            txid: txid.to_string(),
            vout,
            address: address.to_string(),
            amount,
            ..Default::default()
        }
    }

    /// Canonical string signed by the owning wallet.
    pub fn signing_string(&self) -> String {
        format!("{}:{}:{}:{}", self.txid, self.vout, self.address, self.amount)
    }

    pub fn has_signature(&self) -> bool {
        self.signature.len() == 65
    }
}

impl PartialEq for UtxoEntry {
    fn eq(&self, other: &Self) -> bool {
        self.txid == other.txid && self.vout == other.vout
    }
}

impl Eq for UtxoEntry {}

impl Hash for UtxoEntry {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.txid.hash(state);
        self.vout.hash(state);
    }
}

// =============================================================================
// Lock Manager
// =============================================================================

#[derive(Default)]
struct LockTables {
    /// currency -> outputs reserved by live orders
    order_locks: HashMap<String, HashSet<UtxoEntry>>,
    /// outputs reserved by pending fee payments (BLOCK only)
    fee_locks: HashSet<UtxoEntry>,
}

/// Process-wide ledger of reserved outputs.
#[derive(Default)]
pub struct UtxoLockManager {
    tables: Mutex<LockTables>,
}

impl UtxoLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve `utxos` for an order. Fails without inserting anything if any
    /// of them is already reserved for this currency.
    pub fn lock_coins(&self, currency: &str, utxos: &[UtxoEntry]) -> bool {
        let mut t = self.tables.lock().unwrap();
        let locked = t.order_locks.entry(currency.to_string()).or_default();
        for u in utxos {
            if locked.contains(u) {
                return false;
            }
        }
        for u in utxos {
            locked.insert(u.clone());
        }
        true
    }

    /// Release order reservations by (txid, vout).
    pub fn unlock_coins(&self, currency: &str, utxos: &[UtxoEntry]) {
        let mut t = self.tables.lock().unwrap();
        if let Some(locked) = t.order_locks.get_mut(currency) {
            for u in utxos {
                locked.remove(u);
            }
        }
    }

    /// Reserve fee outputs. Fee locks do not conflict-check against each
    /// other: the caller excludes already-locked outputs when selecting.
    pub fn lock_fee_utxos(&self, utxos: &HashSet<UtxoEntry>) {
        let mut t = self.tables.lock().unwrap();
        t.fee_locks.extend(utxos.iter().cloned());
    }

    pub fn unlock_fee_utxos(&self, utxos: &HashSet<UtxoEntry>) {
        let mut t = self.tables.lock().unwrap();
        for u in utxos {
            t.fee_locks.remove(u);
        }
    }

    pub fn fee_utxos(&self) -> HashSet<UtxoEntry> {
        self.tables.lock().unwrap().fee_locks.clone()
    }

    pub fn locked_utxos(&self, currency: &str) -> HashSet<UtxoEntry> {
        let t = self.tables.lock().unwrap();
        t.order_locks.get(currency).cloned().unwrap_or_default()
    }

    /// Union of fee locks and the currency's order locks. This is the
    /// exclusion set handed to `getUnspent` and the selector.
    pub fn all_locked_utxos(&self, currency: &str) -> HashSet<UtxoEntry> {
        let t = self.tables.lock().unwrap();
        let mut all = t.fee_locks.clone();
        if let Some(locked) = t.order_locks.get(currency) {
            all.extend(locked.iter().cloned());
        }
        all
    }

    /// True if the non-locked portion of `coins` (spendable BLOCK outputs
    /// with at least one confirmation) covers `fee` coin units.
    pub fn can_afford_fee_payment(&self, coins: &[UtxoEntry], fee: f64) -> bool {
        let locked = self.all_locked_utxos(crate::FEE_CURRENCY);
        let mut running = 0.0;
        for c in coins {
            if c.confirmations < 1 || locked.contains(c) {
                continue;
            }
            running += c.amount;
            if running >= fee {
                return true;
            }
        }
        false
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn utxo(txid: &str, vout: u32, amount: f64) -> UtxoEntry {
        UtxoEntry::new(txid, vout, "DBaddr1", amount)
    }

    #[test]
    fn test_equality_ignores_carried_fields() {
        let mut a = utxo("aa", 0, 1.0);
        let b = utxo("aa", 0, 2.0);
        a.address = "other".into();
        assert_eq!(a, b);

        let c = utxo("aa", 1, 1.0);
        assert_ne!(a, c);
    }

    #[test]
    fn test_signing_string() {
        let u = utxo("deadbeef", 3, 1.5);
        assert_eq!(u.signing_string(), "deadbeef:3:DBaddr1:1.5");
    }

    #[test]
    fn test_lock_rejects_overlap() {
        let mgr = UtxoLockManager::new();
        let first = vec![utxo("aa", 0, 1.0), utxo("bb", 1, 2.0)];
        let overlap = vec![utxo("bb", 1, 2.0), utxo("cc", 0, 3.0)];

        assert!(mgr.lock_coins("BTC", &first));
        assert!(!mgr.lock_coins("BTC", &overlap));
        // failed lock must not leave partial state
        assert!(!mgr.locked_utxos("BTC").contains(&utxo("cc", 0, 3.0)));

        // same outpoint is free on another chain
        assert!(mgr.lock_coins("DGB", &overlap));
    }

    #[test]
    fn test_unlock() {
        let mgr = UtxoLockManager::new();
        let coins = vec![utxo("aa", 0, 1.0)];
        assert!(mgr.lock_coins("BTC", &coins));
        mgr.unlock_coins("BTC", &coins);
        assert!(mgr.lock_coins("BTC", &coins));
    }

    #[test]
    fn test_all_locked_includes_fee_locks() {
        let mgr = UtxoLockManager::new();
        let fee: HashSet<UtxoEntry> = [utxo("fe", 0, 0.015)].into_iter().collect();
        mgr.lock_fee_utxos(&fee);
        assert!(mgr.lock_coins("BLOCK", &[utxo("aa", 0, 1.0)]));

        let all = mgr.all_locked_utxos("BLOCK");
        assert!(all.contains(&utxo("fe", 0, 0.0)));
        assert!(all.contains(&utxo("aa", 0, 0.0)));

        // fee locks show up for every currency
        assert!(mgr.all_locked_utxos("BTC").contains(&utxo("fe", 0, 0.0)));
    }

    #[test]
    fn test_can_afford_fee_payment() {
        let mgr = UtxoLockManager::new();
        let mut c1 = utxo("aa", 0, 0.01);
        c1.confirmations = 3;
        let mut c2 = utxo("bb", 0, 0.01);
        c2.confirmations = 0; // unconfirmed, not counted
        let coins = vec![c1.clone(), c2];

        assert!(mgr.can_afford_fee_payment(&coins, 0.01));
        assert!(!mgr.can_afford_fee_payment(&coins, 0.02));

        mgr.lock_coins(crate::FEE_CURRENCY, &[c1]);
        assert!(!mgr.can_afford_fee_payment(&coins, 0.01));
    }
}
