// =============================================================================
// DRIFTBRIDGE v1.3 - Configuration
// =============================================================================
//
// bridge.conf is INI-style: a [Main] section plus one section per currency
// ticker describing that wallet's RPC endpoint and chain parameters.
//
// [Main]
// ExchangeWallets=BTC,DGB
// FullLog=true
// ShowAllOrders=false
//
// [BTC]
// Title=Bitcoin
// Ip=127.0.0.1
// Port=8332
// Username=user
// Password=pass
// AddressPrefix=0
// ScriptPrefix=5
// SecretPrefix=128
// COIN=100000000
// MinimumAmount=0
// TxVersion=1
// DustAmount=546
// CreateTxMethod=BTC
// MinTxFee=10000
// BlockTime=600
// FeePerByte=20
// Confirmations=2
// TxWithTimeField=false
//
// =============================================================================

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;

// =============================================================================
// Transaction Method
// =============================================================================

/// Chain family selecting the HTLC and sighash routines.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CreateTxMethod {
    Btc,
    Bch,
    Dgb,
    Sys,
}

impl CreateTxMethod {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "BTC" => Some(CreateTxMethod::Btc),
            "BCH" => Some(CreateTxMethod::Bch),
            "DGB" => Some(CreateTxMethod::Dgb),
            "SYS" => Some(CreateTxMethod::Sys),
            _ => None,
        }
    }

    /// True for chains signing with the FORKID algorithm.
    pub fn uses_fork_id(&self) -> bool {
        matches!(self, CreateTxMethod::Bch)
    }
}

impl fmt::Display for CreateTxMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CreateTxMethod::Btc => "BTC",
            CreateTxMethod::Bch => "BCH",
            CreateTxMethod::Dgb => "DGB",
            CreateTxMethod::Sys => "SYS",
        };
        write!(f, "{}", s)
    }
}

// =============================================================================
// Wallet Parameters
// =============================================================================

/// Per-currency wallet configuration.
#[derive(Clone, Debug)]
pub struct WalletParam {
    pub currency: String,
    pub title: String,
    pub address: String,
    pub ip: String,
    pub port: String,
    pub username: String,
    pub password: String,
    pub addr_prefix: u8,
    pub script_prefix: u8,
    pub secret_prefix: u8,
    pub coin: u64,
    pub minimum_amount: u64,
    pub tx_version: u32,
    pub dust_amount: u64,
    pub method: CreateTxMethod,
    pub get_new_key_supported: bool,
    pub import_with_no_scan_supported: bool,
    pub min_tx_fee: u64,
    pub block_time: u32,
    pub fee_per_byte: u64,
    pub required_confirmations: u32,
    pub tx_with_time_field: bool,
    pub lock_coins_supported: bool,
    pub json_version: String,
    pub content_type: String,
    /// Fee charged by service nodes for taking an order, in BLOCK.
    pub service_node_fee: f64,
}

impl Default for WalletParam {
    fn default() -> Self {
        WalletParam {
            currency: String::new(),
            title: String::new(),
            address: String::new(),
            ip: String::new(),
            port: String::new(),
            username: String::new(),
            password: String::new(),
            addr_prefix: 0,
            script_prefix: 5,
            secret_prefix: 128,
            coin: 0,
            minimum_amount: 0,
            tx_version: 1,
            dust_amount: 546,
            method: CreateTxMethod::Btc,
            get_new_key_supported: false,
            import_with_no_scan_supported: false,
            min_tx_fee: 0,
            block_time: 0,
            fee_per_byte: 200,
            required_confirmations: 0,
            tx_with_time_field: false,
            lock_coins_supported: false,
            json_version: String::new(),
            content_type: String::new(),
            service_node_fee: 0.015,
        }
    }
}

// =============================================================================
// Settings
// =============================================================================

/// Parsed bridge.conf.
#[derive(Clone, Debug, Default)]
pub struct Settings {
    pub exchange_wallets: Vec<String>,
    pub full_log: bool,
    pub show_all_orders: bool,
    sections: HashMap<String, HashMap<String, String>>,
}

impl Settings {
    /// Parse from a file on disk.
    pub fn read(path: &Path) -> Result<Self, String> {
        let text = fs::read_to_string(path)
            .map_err(|e| format!("cannot read {}: {}", path.display(), e))?;
        Ok(Self::parse(&text))
    }

    /// Parse from INI text.
    pub fn parse(text: &str) -> Self {
        let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
        let mut current = String::new();

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                current = line[1..line.len() - 1].trim().to_string();
                sections.entry(current.clone()).or_default();
                continue;
            }
            if let Some(eq) = line.find('=') {
                let key = line[..eq].trim().to_string();
                let value = line[eq + 1..].trim().to_string();
                sections.entry(current.clone()).or_default().insert(key, value);
            }
        }

        let mut s = Settings {
            sections,
            ..Default::default()
        };
        s.exchange_wallets = s
            .get_str("Main", "ExchangeWallets")
            .split(',')
            .map(|w| w.trim().to_string())
            .filter(|w| !w.is_empty())
            .collect();
        s.full_log = s.get_bool("Main", "FullLog", false);
        s.show_all_orders = s.get_bool("Main", "ShowAllOrders", false);
        s
    }

    fn get_str(&self, section: &str, key: &str) -> String {
        self.sections
            .get(section)
            .and_then(|s| s.get(key))
            .cloned()
            .unwrap_or_default()
    }

    fn get_bool(&self, section: &str, key: &str, default: bool) -> bool {
        match self.get_str(section, key).to_ascii_lowercase().as_str() {
            "true" | "1" => true,
            "false" | "0" => false,
            _ => default,
        }
    }

    fn get_num<T: std::str::FromStr>(&self, section: &str, key: &str, default: T) -> T {
        self.get_str(section, key).parse().unwrap_or(default)
    }

    /// Wallet parameters for one configured currency section.
    pub fn wallet_param(&self, currency: &str) -> WalletParam {
        let d = WalletParam::default();
        WalletParam {
            currency: currency.to_string(),
            title: self.get_str(currency, "Title"),
            address: self.get_str(currency, "Address"),
            ip: self.get_str(currency, "Ip"),
            port: self.get_str(currency, "Port"),
            username: self.get_str(currency, "Username"),
            password: self.get_str(currency, "Password"),
            addr_prefix: self.get_num(currency, "AddressPrefix", d.addr_prefix),
            script_prefix: self.get_num(currency, "ScriptPrefix", d.script_prefix),
            secret_prefix: self.get_num(currency, "SecretPrefix", d.secret_prefix),
            coin: self.get_num(currency, "COIN", 0),
            minimum_amount: self.get_num(currency, "MinimumAmount", 0),
            tx_version: self.get_num(currency, "TxVersion", 1),
            dust_amount: self.get_num(currency, "DustAmount", d.dust_amount),
            method: CreateTxMethod::parse(&self.get_str(currency, "CreateTxMethod"))
                .unwrap_or(CreateTxMethod::Btc),
            get_new_key_supported: self.get_bool(currency, "GetNewKeySupported", false),
            import_with_no_scan_supported: self
                .get_bool(currency, "ImportWithNoScanSupported", false),
            min_tx_fee: self.get_num(currency, "MinTxFee", 0),
            block_time: self.get_num(currency, "BlockTime", 0),
            fee_per_byte: self.get_num(currency, "FeePerByte", d.fee_per_byte),
            required_confirmations: self.get_num(currency, "Confirmations", 0),
            tx_with_time_field: self.get_bool(currency, "TxWithTimeField", false),
            lock_coins_supported: self.get_bool(currency, "LockCoinsSupported", false),
            json_version: self.get_str(currency, "JSONVersion"),
            content_type: self.get_str(currency, "ContentType"),
            service_node_fee: self.get_num(currency, "ServiceNodeFee", d.service_node_fee),
        }
    }

    pub fn has_section(&self, name: &str) -> bool {
        self.sections.contains_key(name)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# sample config
[Main]
ExchangeWallets=BTC, DGB
FullLog=true
ShowAllOrders=false

[BTC]
Title=Bitcoin
Ip=127.0.0.1
Port=8332
Username=user
Password=pass
COIN=100000000
BlockTime=600
Confirmations=1
CreateTxMethod=BTC
FeePerByte=20
MinTxFee=10000

[DGB]
Title=DigiByte
Ip=127.0.0.1
Port=14022
Username=user
Password=pass
AddressPrefix=30
COIN=100000000
BlockTime=15
Confirmations=2
CreateTxMethod=DGB
TxWithTimeField=false
";

    #[test]
    fn test_parse_main_section() {
        let s = Settings::parse(SAMPLE);
        assert_eq!(s.exchange_wallets, vec!["BTC", "DGB"]);
        assert!(s.full_log);
        assert!(!s.show_all_orders);
    }

    #[test]
    fn test_wallet_param() {
        let s = Settings::parse(SAMPLE);
        let btc = s.wallet_param("BTC");
        assert_eq!(btc.title, "Bitcoin");
        assert_eq!(btc.coin, 100_000_000);
        assert_eq!(btc.block_time, 600);
        assert_eq!(btc.method, CreateTxMethod::Btc);
        assert_eq!(btc.min_tx_fee, 10_000);

        let dgb = s.wallet_param("DGB");
        assert_eq!(dgb.addr_prefix, 30);
        assert_eq!(dgb.method, CreateTxMethod::Dgb);
        // defaults fill unset keys
        assert_eq!(dgb.dust_amount, 546);
        assert!((dgb.service_node_fee - 0.015).abs() < f64::EPSILON);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(CreateTxMethod::parse("bch"), Some(CreateTxMethod::Bch));
        assert_eq!(CreateTxMethod::parse("SYS"), Some(CreateTxMethod::Sys));
        assert_eq!(CreateTxMethod::parse("ETH"), None);
        assert!(CreateTxMethod::Bch.uses_fork_id());
        assert!(!CreateTxMethod::Dgb.uses_fork_id());
    }

    #[test]
    fn test_missing_section_defaults() {
        let s = Settings::parse("[Main]\nExchangeWallets=\n");
        assert!(s.exchange_wallets.is_empty());
        let wp = s.wallet_param("NOPE");
        assert_eq!(wp.coin, 0);
        assert!(!s.has_section("NOPE"));
    }
}
