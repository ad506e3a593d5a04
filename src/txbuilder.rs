// =============================================================================
// DRIFTBRIDGE v1.3 - Swap Transaction Builder
// =============================================================================
//
// Builds the four transactions of a swap leg:
//
// - deposit: wallet inputs -> P2SH(deposit script) + change, signed by the
//   backing wallet over RPC
// - refund:  deposit -> depositor, IF branch, locktime set, signed locally
//   with the M key
// - payment: deposit -> counterparty, ELSE branch, reveals X.pub, signed
//   locally with the M key
// - fee:     BLOCK inputs -> service node collateral + OP_RETURN payload
//
// =============================================================================

use std::collections::HashSet;
use std::fmt;

use serde_json::json;

use crate::connector::WalletConnector;
use crate::keys;
use crate::rawtx::{RawTransaction, TxIn, TxOut, SEQUENCE_FINAL};
use crate::rpc::RpcError;
use crate::script::{
    op_return_script, p2pkh_script, p2sh_script, payment_sig_script, refund_sig_script, script_hash,
    Script,
};
use crate::utxo::UtxoEntry;

// =============================================================================
// Errors
// =============================================================================

#[derive(Clone, Debug, PartialEq)]
pub enum TxBuildError {
    Rpc(RpcError),
    NotSigned,
    BadAddress(String),
    InsufficientFunds,
    PayloadTooLarge,
}

impl fmt::Display for TxBuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxBuildError::Rpc(e) => write!(f, "{}", e),
            TxBuildError::NotSigned => write!(f, "transaction not fully signed"),
            TxBuildError::BadAddress(a) => write!(f, "cannot decode address {}", a),
            TxBuildError::InsufficientFunds => write!(f, "insufficient funds"),
            TxBuildError::PayloadTooLarge => write!(f, "fee payload exceeds data carrier size"),
        }
    }
}

impl std::error::Error for TxBuildError {}

impl From<RpcError> for TxBuildError {
    fn from(e: RpcError) -> Self {
        TxBuildError::Rpc(e)
    }
}

// =============================================================================
// Inputs / Results
// =============================================================================

/// Outpoint plus its amount in coin units.
#[derive(Clone, Debug)]
pub struct XTxIn {
    pub txid: String,
    pub vout: u32,
    pub amount: f64,
}

impl XTxIn {
    pub fn new(txid: &str, vout: u32, amount: f64) -> Self {
        XTxIn {
            txid: txid.to_string(),
            vout,
            amount,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct BuiltTx {
    pub txid: String,
    pub raw: String,
}

// =============================================================================
// Common
// =============================================================================

fn to_sats(conn: &WalletConnector, amount: f64) -> u64 {
    (amount * conn.coin() as f64).round() as u64
}

/// Output script for a canonical address; P2SH when the version byte is the
/// chain's script prefix, P2PKH otherwise.
fn address_script(conn: &WalletConnector, address: &str) -> Result<Script, TxBuildError> {
    let (version, hash) = keys::decode_base58check(address)
        .ok_or_else(|| TxBuildError::BadAddress(address.to_string()))?;
    if version == conn.param.script_prefix {
        Ok(p2sh_script(&hash))
    } else {
        Ok(p2pkh_script(&hash))
    }
}

/// Unsigned transaction over explicit inputs and (address, coin amount)
/// outputs.
pub fn create_unsigned_transaction(
    conn: &WalletConnector,
    inputs: &[XTxIn],
    outputs: &[(String, f64)],
    lock_time: u32,
) -> Result<RawTransaction, TxBuildError> {
    let mut tx = RawTransaction::new(conn.param.tx_version, conn.tx_time());
    for input in inputs {
        tx.vin.push(TxIn::new(&input.txid, input.vout));
    }
    for (address, amount) in outputs {
        let script = address_script(conn, address)?;
        tx.vout.push(TxOut::new(to_sats(conn, *amount), &script));
    }
    tx.lock_time = lock_time;
    Ok(tx)
}

// =============================================================================
// Deposit
// =============================================================================

/// Build and wallet-sign the deposit transaction. The deposit output is
/// always vout 0; change below the dust bound is dropped into the fee.
pub fn create_deposit_transaction(
    conn: &WalletConnector,
    inputs: &[XTxIn],
    deposit_script: &Script,
    deposit_amount: f64,
    change_address: &str,
) -> Result<BuiltTx, TxBuildError> {
    let total: f64 = inputs.iter().map(|i| i.amount).sum();
    let fee = conn.min_tx_fee1(inputs.len() as u32, 3);
    let change = total - deposit_amount - fee;
    if change < 0.0 {
        return Err(TxBuildError::InsufficientFunds);
    }

    let p2sh_addr = conn.script_address(deposit_script);
    let mut outputs = vec![(p2sh_addr, deposit_amount)];
    if !conn.is_dust_amount(change) {
        outputs.push((change_address.to_string(), change));
    }

    let unsigned = create_unsigned_transaction(conn, inputs, &outputs, 0)?;
    let (signed, complete) = conn.sign_raw_transaction(&unsigned.to_hex())?;
    if !complete {
        return Err(TxBuildError::NotSigned);
    }
    let txid = conn.decode_raw_transaction(&signed)?;
    Ok(BuiltTx { txid, raw: signed })
}

// =============================================================================
// Refund
// =============================================================================

/// Refund transaction spending the deposit through the IF branch. With a
/// non-zero lockTime the input sequence must be 2^32-2 so the locktime is
/// enforced.
pub fn create_refund_transaction(
    conn: &WalletConnector,
    input: &XTxIn,
    outputs: &[(String, f64)],
    m_pubkey: &[u8],
    m_privkey: &[u8],
    inner_script: &Script,
    lock_time: u32,
) -> Result<BuiltTx, TxBuildError> {
    let sequence = if lock_time > 0 {
        SEQUENCE_FINAL - 1
    } else {
        SEQUENCE_FINAL
    };

    let mut tx = create_unsigned_transaction(conn, &[input.clone()], outputs, lock_time)?;
    tx.vin[0].sequence = sequence;

    let digest = conn.sighash(&tx, 0, inner_script.as_slice(), to_sats(conn, input.amount));
    let mut signature = keys::sign_hash(m_privkey, &digest).ok_or(TxBuildError::NotSigned)?;
    signature.push(conn.sighash_type().sig_byte());

    tx.vin[0].script_sig = refund_sig_script(&signature, m_pubkey, inner_script).to_bytes();

    Ok(BuiltTx {
        txid: tx.txid(),
        raw: tx.to_hex(),
    })
}

// =============================================================================
// Payment
// =============================================================================

/// Payment transaction spending the counterparty deposit through the ELSE
/// branch, revealing X.pub in the scriptSig.
pub fn create_payment_transaction(
    conn: &WalletConnector,
    input: &XTxIn,
    outputs: &[(String, f64)],
    m_pubkey: &[u8],
    m_privkey: &[u8],
    x_pubkey: &[u8],
    inner_script: &Script,
) -> Result<BuiltTx, TxBuildError> {
    let mut tx = create_unsigned_transaction(conn, &[input.clone()], outputs, 0)?;

    let digest = conn.sighash(&tx, 0, inner_script.as_slice(), to_sats(conn, input.amount));
    let mut signature = keys::sign_hash(m_privkey, &digest).ok_or(TxBuildError::NotSigned)?;
    signature.push(conn.sighash_type().sig_byte());

    tx.vin[0].script_sig =
        payment_sig_script(x_pubkey, &signature, m_pubkey, inner_script).to_bytes();

    Ok(BuiltTx {
        txid: tx.txid(),
        raw: tx.to_hex(),
    })
}

// =============================================================================
// Service-Node Fee
// =============================================================================

/// OP_RETURN payload of the fee tx: a JSON array of order id and the traded
/// pair. The order id is truncated when the encoded form would exceed
/// `max_bytes`.
pub fn make_fee_payload(
    order_id_hex: &str,
    from_currency: &str,
    from_amount: u64,
    to_currency: &str,
    to_amount: u64,
    max_bytes: usize,
) -> Result<String, TxBuildError> {
    let skeleton = json!(["", from_currency, from_amount, to_currency, to_amount]);
    let overhead = serde_json::to_string(&skeleton)
        .map_err(|_| TxBuildError::PayloadTooLarge)?
        .len();

    let mut order_id = order_id_hex.to_string();
    if overhead + order_id.len() > max_bytes {
        order_id.truncate(max_bytes.saturating_sub(overhead));
    }

    let full = json!([order_id, from_currency, from_amount, to_currency, to_amount]);
    let payload = serde_json::to_string(&full).map_err(|_| TxBuildError::PayloadTooLarge)?;
    if payload.len() > max_bytes {
        return Err(TxBuildError::PayloadTooLarge);
    }
    Ok(payload)
}

/// Decode a fee payload back into its five fields.
pub fn parse_fee_payload(payload: &str) -> Option<(String, String, u64, String, u64)> {
    let v: serde_json::Value = serde_json::from_str(payload).ok()?;
    let arr = v.as_array()?;
    if arr.len() != 5 {
        return None;
    }
    Some((
        arr[0].as_str()?.to_string(),
        arr[1].as_str()?.to_string(),
        arr[2].as_u64()?,
        arr[3].as_str()?.to_string(),
        arr[4].as_u64()?,
    ))
}

/// Build and wallet-sign the service-node fee transaction from local BLOCK
/// outputs. Returns the signed tx and the outputs it consumed.
pub fn create_fee_transaction(
    conn: &WalletConnector,
    dest_script: &Script,
    fee_amount: f64,
    fee_per_byte: f64,
    data: &[u8],
    available: &[UtxoEntry],
) -> Result<(BuiltTx, HashSet<UtxoEntry>), TxBuildError> {
    let mut selected: Vec<UtxoEntry> = Vec::new();
    let mut total = 0.0;
    let mut tx_fee = 0.0;

    for utxo in available {
        selected.push(utxo.clone());
        total += utxo.amount;
        // estimated size: inputs + op_return + payment + change
        let bytes = 192 * selected.len() + 34 * 2 + (11 + data.len());
        tx_fee = bytes as f64 * fee_per_byte;
        if total >= fee_amount + tx_fee {
            break;
        }
    }
    if total < fee_amount + tx_fee {
        return Err(TxBuildError::InsufficientFunds);
    }

    let mut tx = RawTransaction::new(conn.param.tx_version, conn.tx_time());
    for utxo in &selected {
        tx.vin.push(TxIn::new(&utxo.txid, utxo.vout));
    }
    // data carrier first, then the service-node payment, then change
    tx.vout.push(TxOut {
        amount: 0,
        script_pubkey: op_return_script(data).to_bytes(),
    });
    tx.vout.push(TxOut {
        amount: to_sats(conn, fee_amount),
        script_pubkey: dest_script.to_bytes(),
    });
    let change = total - fee_amount - tx_fee;
    if !conn.is_dust_amount(change) {
        let change_addr = &selected[0].address;
        let script = address_script(conn, change_addr)?;
        tx.vout.push(TxOut::new(to_sats(conn, change), &script));
    }

    let (signed, complete) = conn.sign_raw_transaction(&tx.to_hex())?;
    if !complete {
        return Err(TxBuildError::NotSigned);
    }
    let txid = conn.decode_raw_transaction(&signed)?;

    Ok((
        BuiltTx { txid, raw: signed },
        selected.into_iter().collect(),
    ))
}

/// Deposit P2SH output script, used when verifying a counterparty deposit.
pub fn deposit_output_script(inner: &Script) -> Script {
    p2sh_script(&script_hash(inner))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::amount::COIN;
    use crate::config::{CreateTxMethod, WalletParam};
    use crate::keys::KeyPair;
    use crate::rpc::testing::MockRpc;
    use crate::script::{deposit_script, extract_secret_pubkey};
    use std::sync::Arc;

    fn connector() -> WalletConnector {
        WalletConnector::new(
            WalletParam {
                currency: "TST".into(),
                coin: COIN,
                fee_per_byte: 20,
                block_time: 600,
                dust_amount: 546,
                method: CreateTxMethod::Btc,
                ..Default::default()
            },
            Arc::new(MockRpc::new()),
        )
    }

    fn inner() -> Script {
        deposit_script(600_000, &[1; 20], &[2; 20], &[3; 20])
    }

    fn addr() -> String {
        keys::encode_base58check(0, &[0x22; 20])
    }

    #[test]
    fn test_deposit_builds_p2sh_and_change() {
        let conn = connector();
        let inputs = vec![XTxIn::new(&"aa".repeat(32), 0, 2.0)];
        let built =
            create_deposit_transaction(&conn, &inputs, &inner(), 1.0, &addr()).unwrap();
        assert!(!built.txid.is_empty());

        let raw = hex::decode(&built.raw).unwrap();
        // p2sh marker for the deposit output appears in the serialization
        let p2sh = deposit_output_script(&inner()).to_bytes();
        assert!(raw.windows(p2sh.len()).any(|w| w == &p2sh[..]));
    }

    #[test]
    fn test_deposit_insufficient_funds() {
        let conn = connector();
        let inputs = vec![XTxIn::new(&"aa".repeat(32), 0, 0.5)];
        let err = create_deposit_transaction(&conn, &inputs, &inner(), 1.0, &addr());
        assert_eq!(err.unwrap_err(), TxBuildError::InsufficientFunds);
    }

    #[test]
    fn test_refund_sequence_and_locktime() {
        let conn = connector();
        let kp = KeyPair::generate();
        let input = XTxIn::new(&"bb".repeat(32), 0, 1.0);
        let outputs = vec![(addr(), 1.0 - conn.min_tx_fee2(1, 1))];

        let built = create_refund_transaction(
            &conn, &input, &outputs, &kp.public, &kp.private, &inner(), 654_321,
        )
        .unwrap();

        let raw = hex::decode(&built.raw).unwrap();
        // nLockTime is the trailing 4 bytes
        assert_eq!(&raw[raw.len() - 4..], &654_321u32.to_le_bytes());
        // sequence final-1 sits just before the outputs; check it occurs
        assert!(raw
            .windows(4)
            .any(|w| w == (SEQUENCE_FINAL - 1).to_le_bytes()));
    }

    #[test]
    fn test_payment_reveals_secret() {
        let conn = connector();
        let m = KeyPair::generate();
        let x = KeyPair::generate();
        let input = XTxIn::new(&"cc".repeat(32), 0, 1.0);
        let outputs = vec![(addr(), 1.0 - conn.min_tx_fee2(1, 1))];

        let built = create_payment_transaction(
            &conn, &input, &outputs, &m.public, &m.private, &x.public, &inner(),
        )
        .unwrap();

        // parse the scriptSig back out of the serialized input
        let raw = hex::decode(&built.raw).unwrap();
        // version(4) + vin count(1) + outpoint(36), then compact size
        let sig_len = raw[41] as usize;
        let script_sig = &raw[42..42 + sig_len];
        assert_eq!(extract_secret_pubkey(script_sig).unwrap(), x.public);
    }

    #[test]
    fn test_fee_payload_truncation() {
        // 70-char order id against a payload whose overhead exceeds the
        // small cap: the id is truncated, the pair fields survive
        let oid = "f".repeat(70);
        let payload = make_fee_payload(&oid, "BTC", 100_000_000, "DGB", 1_000_000_000, 100).unwrap();
        assert!(payload.len() <= 100);

        let (got_id, fc, fa, tc, ta) = parse_fee_payload(&payload).unwrap();
        assert!(got_id.len() < 70);
        assert!(oid.starts_with(&got_id));
        assert_eq!(fc, "BTC");
        assert_eq!(fa, 100_000_000);
        assert_eq!(tc, "DGB");
        assert_eq!(ta, 1_000_000_000);
    }

    #[test]
    fn test_fee_payload_fits_untouched() {
        let oid = "a".repeat(64);
        let payload =
            make_fee_payload(&oid, "BTC", 1, "DGB", 1, crate::MAX_OP_RETURN - 3).unwrap();
        let (got_id, ..) = parse_fee_payload(&payload).unwrap();
        assert_eq!(got_id, oid);
    }

    #[test]
    fn test_fee_payload_overhead_too_large() {
        let err = make_fee_payload("ab", "VERYLONG", u64::MAX, "CURRENCY", u64::MAX, 20);
        assert_eq!(err.unwrap_err(), TxBuildError::PayloadTooLarge);
    }

    #[test]
    fn test_fee_transaction() {
        let conn = connector();
        let mut coins = Vec::new();
        for i in 0..3 {
            coins.push(UtxoEntry::new(&format!("{:064}", i), 0, &addr(), 0.01));
        }
        let dest = p2pkh_script(&[9; 20]);
        let payload = make_fee_payload(&"e".repeat(64), "BTC", 1, "DGB", 1, 220).unwrap();

        let (built, used) = create_fee_transaction(
            &conn,
            &dest,
            0.015,
            40.0 / COIN as f64,
            payload.as_bytes(),
            &coins,
        )
        .unwrap();
        assert!(!built.txid.is_empty());
        assert_eq!(used.len(), 2); // 0.02 covers fee + tx fee

        let raw = hex::decode(&built.raw).unwrap();
        assert!(raw
            .windows(payload.len())
            .any(|w| w == payload.as_bytes()));
    }

    #[test]
    fn test_fee_transaction_insufficient() {
        let conn = connector();
        let coins = vec![UtxoEntry::new(&"0".repeat(64), 0, &addr(), 0.001)];
        let dest = p2pkh_script(&[9; 20]);
        let err = create_fee_transaction(&conn, &dest, 0.015, 40.0 / COIN as f64, b"x", &coins);
        assert_eq!(err.unwrap_err(), TxBuildError::InsufficientFunds);
    }
}
