// =============================================================================
// DRIFTBRIDGE v1.3 - Wallet Connector
// =============================================================================
//
// One connector per configured currency: chain parameters plus the RPC
// handle of the backing wallet. Chain-family variance (legacy vs FORKID
// sighash, the optional nTime field) is dispatched through CreateTxMethod
// rather than an inheritance chain.
//
// =============================================================================

use std::collections::HashSet;
use std::sync::Arc;

use base64::Engine;
use log::info;

use crate::amount::COIN;
use crate::config::{CreateTxMethod, WalletParam};
use crate::keys::{self, KeyPair};
use crate::rawtx::RawTransaction;
use crate::rpc::{RpcError, WalletRpc};
use crate::script::Script;
use crate::sighash::{forkid_sighash, legacy_sighash, SigHashType};
use crate::utxo::UtxoEntry;
use crate::{
    MAKER_LOCKTIME_TARGET_SECONDS, MIN_LOCKTIME_BLOCKS, SLOW_BLOCKTIME_SECONDS,
    SLOW_TAKER_LOCKTIME_TARGET_SECONDS, TAKER_LOCKTIME_TARGET_SECONDS,
};

// =============================================================================
// Connector
// =============================================================================

pub type ConnectorPtr = Arc<WalletConnector>;

pub struct WalletConnector {
    pub param: WalletParam,
    rpc: Arc<dyn WalletRpc>,
}

impl WalletConnector {
    pub fn new(param: WalletParam, rpc: Arc<dyn WalletRpc>) -> Self {
        WalletConnector { param, rpc }
    }

    pub fn currency(&self) -> &str {
        &self.param.currency
    }

    pub fn rpc(&self) -> &Arc<dyn WalletRpc> {
        &self.rpc
    }

    /// Denomination used for fee math on this chain.
    pub fn coin(&self) -> u64 {
        if self.param.coin > 0 {
            self.param.coin
        } else {
            COIN
        }
    }

    /// Probe the wallet daemon. A failure quarantines the wallet.
    pub fn init(&self) -> Result<(), RpcError> {
        let height = self.rpc.init()?;
        info!(
            "{} \"{}\" connected {}:{} height {}",
            self.param.currency, self.param.title, self.param.ip, self.param.port, height
        );
        Ok(())
    }

    // =========================================================================
    // Chain Queries
    // =========================================================================

    pub fn get_block_count(&self) -> Result<u32, RpcError> {
        self.rpc.get_block_count()
    }

    pub fn get_block_hash(&self, height: u32) -> Result<String, RpcError> {
        self.rpc.get_block_hash(height)
    }

    pub fn get_raw_mempool(&self) -> Result<Vec<String>, RpcError> {
        self.rpc.get_raw_mempool()
    }

    pub fn get_transactions_in_block(&self, block_hash: &str) -> Result<Vec<String>, RpcError> {
        self.rpc.get_block_transactions(block_hash)
    }

    /// Spendable outputs excluding locked entries, with raw addresses
    /// resolved.
    pub fn get_unspent(&self, excluded: &HashSet<UtxoEntry>) -> Result<Vec<UtxoEntry>, RpcError> {
        let unspent = self.rpc.list_unspent()?;
        let mut out = Vec::new();
        for u in unspent {
            if !u.spendable {
                continue;
            }
            let mut entry = UtxoEntry::new(&u.txid, u.vout, &u.address, u.amount);
            entry.confirmations = u.confirmations;
            if excluded.contains(&entry) {
                continue;
            }
            entry.raw_address = self.to_xaddr(&u.address);
            out.push(entry);
        }
        Ok(out)
    }

    /// Wallet balance in coin units across non-excluded outputs, optionally
    /// narrowed to one address.
    pub fn get_wallet_balance(
        &self,
        excluded: &HashSet<UtxoEntry>,
        addr: &str,
    ) -> Result<f64, RpcError> {
        let unspent = self.get_unspent(excluded)?;
        Ok(unspent
            .iter()
            .filter(|u| addr.is_empty() || u.address == addr)
            .map(|u| u.amount)
            .sum())
    }

    /// True when `spender_txid` spends the given deposit outpoint.
    pub fn is_utxo_spent_in_tx(
        &self,
        spender_txid: &str,
        deposit_txid: &str,
        deposit_vout: u32,
    ) -> Result<bool, RpcError> {
        let info = self.rpc.get_transaction(spender_txid)?;
        Ok(info
            .vin
            .iter()
            .any(|vin| vin.txid == deposit_txid && vin.vout == deposit_vout))
    }

    /// scriptSig of the input spending the deposit outpoint, if present.
    pub fn spender_script_sig(
        &self,
        spender_txid: &str,
        deposit_txid: &str,
        deposit_vout: u32,
    ) -> Result<Option<Vec<u8>>, RpcError> {
        let info = self.rpc.get_transaction(spender_txid)?;
        for vin in &info.vin {
            if vin.txid == deposit_txid && vin.vout == deposit_vout {
                return Ok(Some(hex::decode(&vin.script_sig).unwrap_or_default()));
            }
        }
        Ok(None)
    }

    pub fn send_raw_transaction(&self, raw: &str) -> Result<String, RpcError> {
        self.rpc.send_raw_transaction(raw)
    }

    pub fn sign_raw_transaction(&self, raw: &str) -> Result<(String, bool), RpcError> {
        self.rpc.sign_raw_transaction(raw)
    }

    pub fn decode_raw_transaction(&self, raw: &str) -> Result<String, RpcError> {
        self.rpc.decode_raw_transaction(raw)
    }

    /// Wallet-signed proof of output ownership (65 bytes).
    pub fn sign_message(&self, address: &str, message: &str) -> Result<Vec<u8>, RpcError> {
        let b64 = self.rpc.sign_message(address, message)?;
        let sig = base64::engine::general_purpose::STANDARD
            .decode(b64.as_bytes())
            .map_err(|e| RpcError::transport(format!("bad signature encoding: {}", e)))?;
        Ok(sig)
    }

    // =========================================================================
    // Keys and Addresses
    // =========================================================================

    pub fn new_key_pair(&self) -> KeyPair {
        KeyPair::generate()
    }

    pub fn get_key_id(&self, pubkey: &[u8]) -> [u8; 20] {
        keys::hash160(pubkey)
    }

    /// 20-byte raw form of a base58check address; empty on bad input.
    pub fn to_xaddr(&self, address: &str) -> Vec<u8> {
        match keys::decode_base58check(address) {
            Some((_, hash)) => hash.to_vec(),
            None => Vec::new(),
        }
    }

    /// Canonical address for a 20-byte raw form.
    pub fn from_xaddr(&self, raw: &[u8]) -> String {
        let Ok(hash) = <[u8; 20]>::try_from(raw) else {
            return String::new();
        };
        keys::encode_base58check(self.param.addr_prefix, &hash)
    }

    pub fn is_valid_address(&self, address: &str) -> bool {
        keys::decode_base58check(address).is_some()
    }

    /// P2SH address of a redeem script.
    pub fn script_address(&self, script: &Script) -> String {
        keys::encode_base58check(self.param.script_prefix, &crate::script::script_hash(script))
    }

    // =========================================================================
    // Amounts and Fees
    // =========================================================================

    pub fn is_dust_amount(&self, amount: f64) -> bool {
        (amount * self.coin() as f64).round() as u64 <= self.param.dust_amount
    }

    /// Fee for the deposit-side transaction in coin units.
    pub fn min_tx_fee1(&self, inputs: u32, outputs: u32) -> f64 {
        self.fee_for(inputs, outputs)
    }

    /// Fee for the redeem/refund transaction in coin units.
    pub fn min_tx_fee2(&self, inputs: u32, outputs: u32) -> f64 {
        self.fee_for(inputs, outputs)
    }

    fn fee_for(&self, inputs: u32, outputs: u32) -> f64 {
        let mut fee = (192 * inputs as u64 + 34 * outputs as u64) * self.param.fee_per_byte;
        if fee < self.param.min_tx_fee {
            fee = self.param.min_tx_fee;
        }
        fee as f64 / self.coin() as f64
    }

    // =========================================================================
    // Lock Times
    // =========================================================================

    /// Absolute refund height for the maker deposit.
    pub fn maker_lock_time(&self, current_height: u32) -> u32 {
        current_height + self.lock_blocks(MAKER_LOCKTIME_TARGET_SECONDS)
    }

    /// Absolute refund height for the taker deposit. Slow chains get the
    /// longer target so confirmations fit inside the window.
    pub fn taker_lock_time(&self, current_height: u32) -> u32 {
        let target = if self.param.block_time >= SLOW_BLOCKTIME_SECONDS {
            SLOW_TAKER_LOCKTIME_TARGET_SECONDS
        } else {
            TAKER_LOCKTIME_TARGET_SECONDS
        };
        current_height + self.lock_blocks(target)
    }

    fn lock_blocks(&self, target_seconds: u32) -> u32 {
        let mut blocks = if self.param.block_time > 0 {
            target_seconds / self.param.block_time
        } else {
            0
        };
        if blocks < MIN_LOCKTIME_BLOCKS {
            blocks = MIN_LOCKTIME_BLOCKS;
        }
        blocks
    }

    // =========================================================================
    // Sighash
    // =========================================================================

    /// Sighash type this chain signs with.
    pub fn sighash_type(&self) -> SigHashType {
        if self.param.method.uses_fork_id() {
            SigHashType::all().with_fork_id()
        } else {
            SigHashType::all()
        }
    }

    /// Digest to sign for one input. `amount` (satoshis) is only committed
    /// on FORKID chains.
    pub fn sighash(
        &self,
        tx: &RawTransaction,
        input_index: usize,
        script_code: &[u8],
        amount: u64,
    ) -> [u8; 32] {
        match self.param.method {
            CreateTxMethod::Bch => forkid_sighash(
                tx,
                input_index,
                script_code,
                amount,
                self.sighash_type(),
            ),
            CreateTxMethod::Btc | CreateTxMethod::Dgb | CreateTxMethod::Sys => {
                legacy_sighash(tx, input_index, script_code, self.sighash_type())
            }
        }
    }

    /// nTime value for chains carrying a timestamp in the tx header.
    pub fn tx_time(&self) -> Option<u32> {
        if self.param.tx_with_time_field {
            Some((crate::amount::now_micros() / 1_000_000) as u32)
        } else {
            None
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
