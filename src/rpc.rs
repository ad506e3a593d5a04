// =============================================================================
// DRIFTBRIDGE v1.3 - Wallet RPC
// =============================================================================
//
// Every connector talks to its chain daemon over JSON-RPC. The trait below
// is the minimum contract the swap core needs; the production transport is
// a blocking bitcoincore-compatible client, tests plug in mocks.
//
// =============================================================================

use bitcoincore_rpc::{Auth, Client, RpcApi};
use serde_json::{json, Value};

use crate::config::WalletParam;

// =============================================================================
// RPC Errors
// =============================================================================

/// Daemon error codes the refund watchdog treats as benign: the refund was
/// already mined, already known, or superseded.
pub const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
pub const RPC_VERIFY_REJECTED: i32 = -26;
pub const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
}

impl RpcError {
    pub fn transport(msg: impl Into<String>) -> Self {
        RpcError {
            code: 0,
            message: msg.into(),
        }
    }

    /// True when a rejected refund submission still means the funds are
    /// settled.
    pub fn is_benign_refund_failure(&self) -> bool {
        matches!(
            self.code,
            RPC_VERIFY_ALREADY_IN_CHAIN | RPC_INVALID_ADDRESS_OR_KEY | RPC_VERIFY_REJECTED
        )
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "rpc error {}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

impl From<bitcoincore_rpc::Error> for RpcError {
    fn from(e: bitcoincore_rpc::Error) -> Self {
        if let bitcoincore_rpc::Error::JsonRpc(bitcoincore_rpc::jsonrpc::Error::Rpc(r)) = &e {
            return RpcError {
                code: r.code,
                message: r.message.clone(),
            };
        }
        RpcError::transport(e.to_string())
    }
}

// =============================================================================
// RPC Data
// =============================================================================

/// One entry from listunspent.
#[derive(Clone, Debug, Default)]
pub struct RpcUnspent {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    pub amount: f64,
    pub confirmations: u32,
    pub spendable: bool,
}

/// An input of a decoded transaction.
#[derive(Clone, Debug, Default)]
pub struct RpcTxVin {
    pub txid: String,
    pub vout: u32,
    /// scriptSig hex.
    pub script_sig: String,
}

/// An output of a decoded transaction.
#[derive(Clone, Debug, Default)]
pub struct RpcTxVout {
    pub amount: f64,
    /// scriptPubKey hex.
    pub script_pubkey: String,
}

/// Decoded transaction, trimmed to what the swap handlers need.
#[derive(Clone, Debug, Default)]
pub struct RpcTxInfo {
    pub txid: String,
    pub confirmations: u32,
    pub vin: Vec<RpcTxVin>,
    pub vout: Vec<RpcTxVout>,
}

// =============================================================================
// Wallet RPC Contract
// =============================================================================

pub trait WalletRpc: Send + Sync {
    /// Reachability probe used by the wallet refresh.
    fn init(&self) -> Result<u32, RpcError> {
        self.get_block_count()
    }

    fn get_block_count(&self) -> Result<u32, RpcError>;
    fn get_block_hash(&self, height: u32) -> Result<String, RpcError>;
    fn get_raw_mempool(&self) -> Result<Vec<String>, RpcError>;
    fn get_block_transactions(&self, block_hash: &str) -> Result<Vec<String>, RpcError>;
    fn list_unspent(&self) -> Result<Vec<RpcUnspent>, RpcError>;
    fn get_transaction(&self, txid: &str) -> Result<RpcTxInfo, RpcError>;
    fn send_raw_transaction(&self, raw: &str) -> Result<String, RpcError>;
    /// Returns (signed hex, complete).
    fn sign_raw_transaction(&self, raw: &str) -> Result<(String, bool), RpcError>;
    /// Returns the txid of the decoded transaction.
    fn decode_raw_transaction(&self, raw: &str) -> Result<String, RpcError>;
    /// Returns the base64 signature produced by the wallet.
    fn sign_message(&self, address: &str, message: &str) -> Result<String, RpcError>;
}

// =============================================================================
// Bitcoind-compatible Transport
// =============================================================================

/// Blocking JSON-RPC client for bitcoind-compatible daemons.
pub struct CoreRpc {
    client: Client,
}

impl CoreRpc {
    pub fn connect(param: &WalletParam) -> Result<Self, RpcError> {
        let url = format!("http://{}:{}", param.ip, param.port);
        let auth = Auth::UserPass(param.username.clone(), param.password.clone());
        let client = Client::new(&url, auth).map_err(RpcError::from)?;
        Ok(CoreRpc { client })
    }

    fn call<T: for<'a> serde::Deserialize<'a>>(
        &self,
        method: &str,
        params: &[Value],
    ) -> Result<T, RpcError> {
        self.client.call(method, params).map_err(RpcError::from)
    }
}

impl WalletRpc for CoreRpc {
    fn get_block_count(&self) -> Result<u32, RpcError> {
        self.call("getblockcount", &[])
    }

    fn get_block_hash(&self, height: u32) -> Result<String, RpcError> {
        self.call("getblockhash", &[json!(height)])
    }

    fn get_raw_mempool(&self) -> Result<Vec<String>, RpcError> {
        self.call("getrawmempool", &[])
    }

    fn get_block_transactions(&self, block_hash: &str) -> Result<Vec<String>, RpcError> {
        let block: Value = self.call("getblock", &[json!(block_hash)])?;
        let txs = block
            .get("tx")
            .and_then(Value::as_array)
            .ok_or_else(|| RpcError::transport("getblock: missing tx list"))?;
        Ok(txs
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect())
    }

    fn list_unspent(&self) -> Result<Vec<RpcUnspent>, RpcError> {
        let entries: Vec<Value> = self.call("listunspent", &[])?;
        Ok(entries
            .iter()
            .map(|e| RpcUnspent {
                txid: e["txid"].as_str().unwrap_or_default().to_string(),
                vout: e["vout"].as_u64().unwrap_or_default() as u32,
                address: e["address"].as_str().unwrap_or_default().to_string(),
                amount: e["amount"].as_f64().unwrap_or_default(),
                confirmations: e["confirmations"].as_u64().unwrap_or_default() as u32,
                spendable: e["spendable"].as_bool().unwrap_or(true),
            })
            .collect())
    }

    fn get_transaction(&self, txid: &str) -> Result<RpcTxInfo, RpcError> {
        let decoded: Value = self.call("getrawtransaction", &[json!(txid), json!(true)])?;
        Ok(parse_tx_info(&decoded))
    }

    fn send_raw_transaction(&self, raw: &str) -> Result<String, RpcError> {
        self.call("sendrawtransaction", &[json!(raw)])
    }

    fn sign_raw_transaction(&self, raw: &str) -> Result<(String, bool), RpcError> {
        let signed: Value = self.call("signrawtransactionwithwallet", &[json!(raw)])?;
        let hex = signed["hex"].as_str().unwrap_or_default().to_string();
        let complete = signed["complete"].as_bool().unwrap_or(false);
        Ok((hex, complete))
    }

    fn decode_raw_transaction(&self, raw: &str) -> Result<String, RpcError> {
        let decoded: Value = self.call("decoderawtransaction", &[json!(raw)])?;
        decoded["txid"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| RpcError::transport("decoderawtransaction: missing txid"))
    }

    fn sign_message(&self, address: &str, message: &str) -> Result<String, RpcError> {
        self.call("signmessage", &[json!(address), json!(message)])
    }
}

fn parse_tx_info(decoded: &Value) -> RpcTxInfo {
    let vin = decoded
        .get("vin")
        .and_then(Value::as_array)
        .map(|vins| {
            vins.iter()
                .map(|v| RpcTxVin {
                    txid: v["txid"].as_str().unwrap_or_default().to_string(),
                    vout: v["vout"].as_u64().unwrap_or_default() as u32,
                    script_sig: v["scriptSig"]["hex"].as_str().unwrap_or_default().to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    let vout = decoded
        .get("vout")
        .and_then(Value::as_array)
        .map(|vouts| {
            vouts.iter()
                .map(|v| RpcTxVout {
                    amount: v["value"].as_f64().unwrap_or_default(),
                    script_pubkey: v["scriptPubKey"]["hex"]
                        .as_str()
                        .unwrap_or_default()
                        .to_string(),
                })
                .collect()
        })
        .unwrap_or_default();
    RpcTxInfo {
        txid: decoded["txid"].as_str().unwrap_or_default().to_string(),
        confirmations: decoded["confirmations"].as_u64().unwrap_or_default() as u32,
        vin,
        vout,
    }
}

// =============================================================================
// Test Double
// =============================================================================


// =============================================================================
// Tests
// =============================================================================
