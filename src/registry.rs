// =============================================================================
// DRIFTBRIDGE v1.3 - Connector Registry
// =============================================================================
//
// Process-wide table of wallet connectors, indexed by currency and by the
// raw addresses seen in packets. The periodic wallet refresh probes every
// configured wallet with bounded parallelism; wallets that fail the probe
// are quarantined for five minutes and their connectors removed.
//
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use log::{error, warn};

use crate::config::{Settings, WalletParam};
use crate::connector::{ConnectorPtr, WalletConnector};
use crate::rpc::WalletRpc;
use crate::{
    LOCKTIME_DRIFT_SECONDS, MAKER_LOCKTIME_TARGET_SECONDS, MAX_LOCKTIME_DRIFT_BLOCKS,
    MIN_LOCKTIME_BLOCKS, SLOW_BLOCKTIME_SECONDS, SLOW_TAKER_LOCKTIME_TARGET_SECONDS,
    TAKER_LOCKTIME_TARGET_SECONDS, WALLET_QUARANTINE_SECS,
};

/// Produces the RPC transport for a wallet; tests inject mocks here.
pub type RpcFactory = Arc<dyn Fn(&WalletParam) -> Arc<dyn WalletRpc> + Send + Sync>;

/// Exchange collaborator notified of the valid wallet set after a refresh.
pub trait ExchangeNotify: Send + Sync {
    fn load_wallets(&self, wallets: HashSet<String>);

    /// True when this node runs the exchange (service node mode).
    fn is_started(&self) -> bool {
        false
    }
}

/// Default no-op collaborator for trader nodes.
pub struct NullExchange;

impl ExchangeNotify for NullExchange {
    fn load_wallets(&self, _wallets: HashSet<String>) {}
}

// =============================================================================
// Parameter Validation
// =============================================================================

/// Locktime-drift and confirmation compatibility gates a wallet must pass
/// before being probed.
pub fn check_wallet_param(wp: &WalletParam) -> Result<(), String> {
    if wp.ip.is_empty() || wp.port.is_empty() || wp.coin == 0 || wp.block_time == 0 {
        return Err("failed to connect, check the config".to_string());
    }
    if wp.block_time * MIN_LOCKTIME_BLOCKS > MAKER_LOCKTIME_TARGET_SECONDS {
        return Err("failed maker locktime requirements".to_string());
    }
    if wp.block_time < SLOW_BLOCKTIME_SECONDS
        && wp.block_time * MIN_LOCKTIME_BLOCKS > TAKER_LOCKTIME_TARGET_SECONDS
    {
        return Err("failed taker locktime requirements".to_string());
    }
    if wp.block_time >= SLOW_BLOCKTIME_SECONDS
        && wp.block_time * MIN_LOCKTIME_BLOCKS > SLOW_TAKER_LOCKTIME_TARGET_SECONDS
    {
        return Err("failed taker locktime requirements".to_string());
    }
    let max_confirmations =
        std::cmp::max(LOCKTIME_DRIFT_SECONDS / wp.block_time, MAX_LOCKTIME_DRIFT_BLOCKS);
    if wp.required_confirmations > max_confirmations {
        return Err(format!(
            "failed confirmation check, max allowed for this token is {}",
            max_confirmations
        ));
    }
    Ok(())
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct Tables {
    connectors: Vec<ConnectorPtr>,
    by_currency: HashMap<String, ConnectorPtr>,
    by_address: HashMap<Vec<u8>, ConnectorPtr>,
}

struct RefreshState {
    updating: bool,
    /// currency -> quarantine start, seconds since epoch
    bad_wallets: HashMap<String, u64>,
}

pub struct ConnectorRegistry {
    tables: Mutex<Tables>,
    refresh: Mutex<RefreshState>,
    quarantine_secs: u64,
}

impl Default for ConnectorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectorRegistry {
    pub fn new() -> Self {
        Self::with_quarantine(WALLET_QUARANTINE_SECS)
    }

    pub fn with_quarantine(quarantine_secs: u64) -> Self {
        ConnectorRegistry {
            tables: Mutex::new(Tables::default()),
            refresh: Mutex::new(RefreshState {
                updating: false,
                bad_wallets: HashMap::new(),
            }),
            quarantine_secs,
        }
    }

    /// Add or replace the connector for its currency; address entries tied
    /// to the currency are repointed atomically.
    pub fn add_connector(&self, conn: ConnectorPtr) {
        let mut t = self.tables.lock().unwrap();
        let currency = conn.currency().to_string();
        t.connectors.retain(|c| c.currency() != currency);
        t.connectors.push(conn.clone());
        t.by_currency.insert(currency.clone(), conn.clone());
        for (_, entry) in t.by_address.iter_mut() {
            if entry.currency() == currency {
                *entry = conn.clone();
            }
        }
    }

    pub fn remove_connector(&self, currency: &str) {
        let mut t = self.tables.lock().unwrap();
        t.connectors.retain(|c| c.currency() != currency);
        t.by_currency.remove(currency);
        t.by_address.retain(|_, c| c.currency() != currency);
    }

    /// Bind a raw address to a connector so inbound packets route by
    /// destination.
    pub fn update_connector(&self, conn: ConnectorPtr, address: Vec<u8>, currency: &str) {
        let mut t = self.tables.lock().unwrap();
        t.by_address.insert(address, conn.clone());
        t.by_currency.insert(currency.to_string(), conn);
    }

    pub fn connector_by_currency(&self, currency: &str) -> Option<ConnectorPtr> {
        self.tables.lock().unwrap().by_currency.get(currency).cloned()
    }

    pub fn connector_by_address(&self, address: &[u8]) -> Option<ConnectorPtr> {
        self.tables.lock().unwrap().by_address.get(address).cloned()
    }

    pub fn has_currency(&self, currency: &str) -> bool {
        self.tables.lock().unwrap().by_currency.contains_key(currency)
    }

    pub fn available_currencies(&self) -> Vec<String> {
        self.tables.lock().unwrap().by_currency.keys().cloned().collect()
    }

    pub fn connectors(&self) -> Vec<ConnectorPtr> {
        self.tables.lock().unwrap().connectors.clone()
    }

    // =========================================================================
    // Wallet Refresh
    // =========================================================================

    /// Probe every configured wallet and rebuild the connector table.
    /// Single-flight; concurrent calls return immediately.
    pub fn update_active_wallets(
        &self,
        settings: &Settings,
        rpc_factory: &RpcFactory,
        rpc_threads: usize,
        exchange: &dyn ExchangeNotify,
    ) {
        {
            let mut r = self.refresh.lock().unwrap();
            if r.updating {
                return;
            }
            r.updating = true;
        }

        let wallets = settings.exchange_wallets.clone();

        // drop connectors no longer configured
        let to_remove: Vec<String> = self
            .available_currencies()
            .into_iter()
            .filter(|c| !wallets.contains(c))
            .collect();
        for currency in to_remove {
            self.remove_connector(&currency);
        }

        let now = crate::amount::now_micros() / 1_000_000;
        let bad_wallets = self.refresh.lock().unwrap().bad_wallets.clone();

        let mut conns: Vec<WalletConnector> = Vec::new();
        for currency in &wallets {
            // quarantined wallets wait out their window before a re-probe
            if let Some(since) = bad_wallets.get(currency) {
                if now.saturating_sub(*since) < self.quarantine_secs {
                    continue;
                }
                self.refresh.lock().unwrap().bad_wallets.remove(currency);
            }

            let wp = settings.wallet_param(currency);
            if wp.username.is_empty() || wp.password.is_empty() {
                warn!("{} \"{}\" has empty credentials", wp.currency, wp.title);
            }
            if let Err(msg) = check_wallet_param(&wp) {
                error!("{} \"{}\" {}", wp.currency, wp.title, msg);
                self.remove_connector(currency);
                continue;
            }

            let rpc = rpc_factory(&wp);
            conns.push(WalletConnector::new(wp, rpc));
        }

        // probe connections with bounded parallelism
        let mut valid: Vec<ConnectorPtr> = Vec::new();
        let mut bad: Vec<ConnectorPtr> = Vec::new();
        for batch in conns.chunks(rpc_threads.max(1)) {
            let results: Vec<(usize, bool)> = std::thread::scope(|scope| {
                let handles: Vec<_> = batch
                    .iter()
                    .enumerate()
                    .map(|(i, conn)| scope.spawn(move || (i, conn.init().is_ok())))
                    .collect();
                handles.into_iter().filter_map(|h| h.join().ok()).collect()
            });
            for (i, ok) in results {
                let conn = Arc::new(WalletConnector::new(
                    batch[i].param.clone(),
                    batch[i].rpc().clone(),
                ));
                if ok {
                    valid.push(conn);
                } else {
                    bad.push(conn);
                }
            }
        }

        let mut valid_wallets = HashSet::new();
        for conn in valid {
            valid_wallets.insert(conn.currency().to_string());
            self.add_connector(conn);
        }
        for conn in bad {
            warn!(
                "{} \"{}\" failed to connect, check the config",
                conn.currency(),
                conn.param.title
            );
            self.remove_connector(conn.currency());
            self.refresh
                .lock()
                .unwrap()
                .bad_wallets
                .insert(conn.currency().to_string(), now);
        }

        exchange.load_wallets(valid_wallets);

        self.refresh.lock().unwrap().updating = false;
    }

    /// Test hook: age a quarantine entry so the next refresh re-probes.
    #[cfg(test)]
    fn backdate_quarantine(&self, currency: &str, secs: u64) {
        if let Some(t) = self.refresh.lock().unwrap().bad_wallets.get_mut(currency) {
            *t = t.saturating_sub(secs);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::COIN;
    use crate::config::CreateTxMethod;
    use crate::rpc::testing::MockRpc;
    use std::sync::Mutex as StdMutex;

    fn param(currency: &str, block_time: u32) -> WalletParam {
        WalletParam {
            currency: currency.into(),
            ip: "127.0.0.1".into(),
            port: "1234".into(),
            username: "u".into(),
            password: "p".into(),
            coin: COIN,
            block_time,
            required_confirmations: 1,
            method: CreateTxMethod::Btc,
            ..Default::default()
        }
    }

    fn connector(currency: &str) -> ConnectorPtr {
        Arc::new(WalletConnector::new(
            param(currency, 600),
            Arc::new(MockRpc::new()),
        ))
    }

    #[test]
    fn test_add_replace_remove() {
        let reg = ConnectorRegistry::new();
        reg.add_connector(connector("BTC"));
        assert!(reg.has_currency("BTC"));

        // address binding follows currency replacement
        let addr = vec![0x55u8; 20];
        reg.update_connector(connector("BTC"), addr.clone(), "BTC");
        let replacement = connector("BTC");
        reg.add_connector(replacement.clone());
        let via_addr = reg.connector_by_address(&addr).unwrap();
        assert!(Arc::ptr_eq(&via_addr, &replacement));

        reg.remove_connector("BTC");
        assert!(!reg.has_currency("BTC"));
        assert!(reg.connector_by_address(&addr).is_none());
    }

    #[test]
    fn test_check_wallet_param() {
        assert!(check_wallet_param(&param("OK", 600)).is_ok());

        let mut no_ip = param("X", 600);
        no_ip.ip.clear();
        assert!(check_wallet_param(&no_ip).is_err());

        // 6 blocks of 1300s exceed the 7200s maker target
        assert!(check_wallet_param(&param("SLOW", 1300)).is_err());

        // fast chain passing maker but confirmation-incompatible
        let mut many_confs = param("Y", 60);
        many_confs.required_confirmations = 300;
        assert!(check_wallet_param(&many_confs).is_err());
    }

    #[test]
    fn test_refresh_quarantines_bad_wallets() {
        let settings = Settings::parse(
            "[Main]\nExchangeWallets=BAD\n[BAD]\nIp=1.2.3.4\nPort=1\nUsername=u\nPassword=p\nCOIN=100000000\nBlockTime=600\nConfirmations=1\nCreateTxMethod=BTC\n",
        );
        let reg = ConnectorRegistry::new();

        let probes = Arc::new(StdMutex::new(0usize));
        let probes2 = Arc::clone(&probes);
        let factory: RpcFactory = Arc::new(move |_wp| {
            *probes2.lock().unwrap() += 1;
            let rpc = MockRpc::new();
            rpc.chain.lock().unwrap().fail_all = true;
            Arc::new(rpc)
        });

        reg.update_active_wallets(&settings, &factory, 4, &NullExchange);
        assert!(!reg.has_currency("BAD"));
        assert_eq!(*probes.lock().unwrap(), 1);

        // still quarantined: no new probe
        reg.update_active_wallets(&settings, &factory, 4, &NullExchange);
        assert_eq!(*probes.lock().unwrap(), 1);

        // after the window expires the wallet is probed again
        reg.backdate_quarantine("BAD", WALLET_QUARANTINE_SECS + 1);
        reg.update_active_wallets(&settings, &factory, 4, &NullExchange);
        assert_eq!(*probes.lock().unwrap(), 2);
    }

    #[test]
    fn test_refresh_adds_valid_wallets() {
        let settings = Settings::parse(
            "[Main]\nExchangeWallets=GOOD\n[GOOD]\nIp=1.2.3.4\nPort=1\nUsername=u\nPassword=p\nCOIN=100000000\nBlockTime=600\nConfirmations=1\nCreateTxMethod=BTC\n",
        );
        let reg = ConnectorRegistry::new();
        let factory: RpcFactory = Arc::new(|_wp| Arc::new(MockRpc::new()));

        struct Capture(StdMutex<HashSet<String>>);
        impl ExchangeNotify for Capture {
            fn load_wallets(&self, wallets: HashSet<String>) {
                *self.0.lock().unwrap() = wallets;
            }
        }
        let capture = Capture(StdMutex::new(HashSet::new()));

        reg.update_active_wallets(&settings, &factory, 4, &capture);
        assert!(reg.has_currency("GOOD"));
        assert!(capture.0.lock().unwrap().contains("GOOD"));

        // dropping the wallet from config removes its connector
        let empty = Settings::parse("[Main]\nExchangeWallets=\n");
        reg.update_active_wallets(&empty, &factory, 4, &capture);
        assert!(!reg.has_currency("GOOD"));
    }
}
