// =============================================================================
// DRIFTBRIDGE v1.3 - Order Store
// =============================================================================
//
// Live and historical order maps under one lock. An order is in exactly one
// of the two maps; terminal orders move to history and are eventually
// garbage collected.
//
// =============================================================================

use std::collections::HashMap;
use std::sync::Mutex;

use crate::amount::now_micros;
use crate::order::{OrderDescr, OrderId, OrderPtr, OrderState};

// =============================================================================
// Store
// =============================================================================

#[derive(Default)]
struct Maps {
    transactions: HashMap<OrderId, OrderPtr>,
    history: HashMap<OrderId, OrderPtr>,
}

#[derive(Default)]
pub struct OrderStore {
    maps: Mutex<Maps>,
}

/// Record of a garbage-collected order.
#[derive(Clone, Debug)]
pub struct FlushedOrder {
    pub id: OrderId,
    pub txtime: u64,
    pub use_count: usize,
}

impl OrderStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a live order, replacing nothing: a re-announced known order
    /// only widens its timestamps, and historical ids are ignored.
    pub fn append(&self, ptr: OrderPtr) {
        let id = ptr.lock().unwrap().id;
        let mut maps = self.maps.lock().unwrap();
        if maps.history.contains_key(&id) {
            return;
        }
        match maps.transactions.get(&id) {
            Some(existing) => {
                if !std::sync::Arc::ptr_eq(existing, &ptr) {
                    let incoming = ptr.lock().unwrap();
                    existing.lock().unwrap().merge_timestamp(&incoming);
                }
            }
            None => {
                maps.transactions.insert(id, ptr);
            }
        }
    }

    /// Insert or overwrite a live order unconditionally (local creation).
    pub fn insert(&self, ptr: OrderPtr) {
        let id = ptr.lock().unwrap().id;
        self.maps.lock().unwrap().transactions.insert(id, ptr);
    }

    /// Look up a live or historical order.
    pub fn get(&self, id: &OrderId) -> Option<OrderPtr> {
        let maps = self.maps.lock().unwrap();
        maps.transactions
            .get(id)
            .or_else(|| maps.history.get(id))
            .cloned()
    }

    pub fn get_live(&self, id: &OrderId) -> Option<OrderPtr> {
        self.maps.lock().unwrap().transactions.get(id).cloned()
    }

    /// Snapshot of the live map.
    pub fn live(&self) -> HashMap<OrderId, OrderPtr> {
        self.maps.lock().unwrap().transactions.clone()
    }

    /// Snapshot of the history map.
    pub fn history(&self) -> HashMap<OrderId, OrderPtr> {
        self.maps.lock().unwrap().history.clone()
    }

    pub fn erase(&self, id: &OrderId) {
        self.maps.lock().unwrap().transactions.remove(id);
    }

    /// Move a live order to history. Returns the handle so the caller can
    /// release its coin locks; None when the id is unknown or already
    /// historical.
    pub fn move_to_history(&self, id: &OrderId) -> Option<OrderPtr> {
        let mut maps = self.maps.lock().unwrap();
        let ptr = maps.transactions.remove(id)?;
        if maps.history.contains_key(id) {
            log::error!("duplicate order {} in history", id);
            return None;
        }
        maps.history.insert(*id, ptr.clone());
        Some(ptr)
    }

    /// Drop cancelled orders older than `min_age_micros` from both maps.
    pub fn flush_cancelled_orders(&self, min_age_micros: u64) -> Vec<FlushedOrder> {
        let keep_time = now_micros().saturating_sub(min_age_micros);
        let mut flushed = Vec::new();
        let mut maps = self.maps.lock().unwrap();
        let maps = &mut *maps;

        for map in [&mut maps.transactions, &mut maps.history] {
            map.retain(|id, ptr| {
                let (state, txtime) = {
                    let o = ptr.lock().unwrap();
                    (o.state, o.txtime)
                };
                if state == OrderState::Cancelled && txtime < keep_time {
                    flushed.push(FlushedOrder {
                        id: *id,
                        txtime,
                        use_count: std::sync::Arc::strong_count(ptr),
                    });
                    false
                } else {
                    true
                }
            });
        }
        flushed
    }

    /// Drop non-local orders whose currencies are no longer serviced.
    pub fn clear_non_local_orders<F: Fn(&OrderDescr) -> bool>(&self, has_wallets: F) {
        let mut maps = self.maps.lock().unwrap();
        maps.transactions.retain(|_, ptr| {
            let o = ptr.lock().unwrap();
            o.is_local() || has_wallets(&o)
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::order::order_ptr;

    fn order(id_byte: u8) -> OrderPtr {
        let mut o = OrderDescr::default();
        o.id = OrderId([id_byte; 32]);
        o.txtime = now_micros();
        order_ptr(o)
    }

    #[test]
    fn test_append_and_get() {
        let store = OrderStore::new();
        store.append(order(1));
        assert!(store.get(&OrderId([1; 32])).is_some());
        assert!(store.get(&OrderId([2; 32])).is_none());
    }

    #[test]
    fn test_append_existing_widens_timestamp() {
        let store = OrderStore::new();
        let a = order(1);
        a.lock().unwrap().txtime = 100;
        a.lock().unwrap().created = 100;
        store.append(a.clone());

        let b = order(1);
        b.lock().unwrap().txtime = 500;
        b.lock().unwrap().created = 50;
        store.append(b);

        let got = store.get(&OrderId([1; 32])).unwrap();
        assert_eq!(got.lock().unwrap().txtime, 500);
        assert_eq!(got.lock().unwrap().created, 100);
    }

    #[test]
    fn test_live_xor_history() {
        let store = OrderStore::new();
        store.append(order(1));
        let id = OrderId([1; 32]);

        assert!(store.move_to_history(&id).is_some());
        assert!(store.live().is_empty());
        assert_eq!(store.history().len(), 1);
        // still findable
        assert!(store.get(&id).is_some());
        assert!(store.get_live(&id).is_none());

        // second move is a no-op
        assert!(store.move_to_history(&id).is_none());

        // appending a known historical id does not resurrect it
        store.append(order(1));
        assert!(store.live().is_empty());
    }

    #[test]
    fn test_flush_cancelled() {
        let store = OrderStore::new();
        let stale = order(1);
        stale.lock().unwrap().state = OrderState::Cancelled;
        stale.lock().unwrap().txtime = 1; // ancient
        store.append(stale);

        let fresh = order(2);
        fresh.lock().unwrap().state = OrderState::Cancelled;
        store.append(fresh);

        let live = order(3);
        store.append(live);

        let flushed = store.flush_cancelled_orders(60 * 1_000_000);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].id, OrderId([1; 32]));
        assert_eq!(store.live().len(), 2);
    }

    #[test]
    fn test_clear_non_local() {
        let store = OrderStore::new();
        let local = order(1);
        local.lock().unwrap().role = Some(crate::order::OrderRole::Maker);
        local.lock().unwrap().from_currency = "GONE".into();
        store.append(local);

        let remote = order(2);
        remote.lock().unwrap().from_currency = "GONE".into();
        store.append(remote);

        store.clear_non_local_orders(|o| o.from_currency != "GONE");
        assert!(store.get_live(&OrderId([1; 32])).is_some());
        assert!(store.get_live(&OrderId([2; 32])).is_none());
    }
}
