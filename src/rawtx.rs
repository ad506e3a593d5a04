// =============================================================================
// DRIFTBRIDGE v1.3 - Raw Transactions
// =============================================================================
//
// Wire-format transaction model shared by all connectors. Some chains carry
// an extra 32-bit timestamp after the version (TxWithTimeField); everything
// else follows the common UTXO layout.
//
// =============================================================================

use crate::keys::sha256d;
use crate::script::Script;

/// nSequence marking an input final.
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;

// =============================================================================
// Inputs / Outputs
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TxIn {
    /// Previous transaction id in display (big-endian hex) order.
    pub txid: String,
    pub vout: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxIn {
    pub fn new(txid: &str, vout: u32) -> Self {
        TxIn {
            txid: txid.to_string(),
            vout,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }
    }

    /// Outpoint bytes as serialized on the wire (txid little-endian).
    pub fn outpoint_bytes(&self) -> Vec<u8> {
        let mut out = txid_to_le_bytes(&self.txid);
        out.extend_from_slice(&self.vout.to_le_bytes());
        out
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct TxOut {
    /// Amount in satoshis of the output chain.
    pub amount: u64,
    pub script_pubkey: Vec<u8>,
}

impl TxOut {
    pub fn new(amount: u64, script_pubkey: &Script) -> Self {
        TxOut {
            amount,
            script_pubkey: script_pubkey.to_bytes(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = self.amount.to_le_bytes().to_vec();
        out.extend_from_slice(&compact_size(self.script_pubkey.len() as u64));
        out.extend_from_slice(&self.script_pubkey);
        out
    }
}

// =============================================================================
// Transaction
// =============================================================================

#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawTransaction {
    pub version: u32,
    /// Present only on chains with TxWithTimeField.
    pub time: Option<u32>,
    pub vin: Vec<TxIn>,
    pub vout: Vec<TxOut>,
    pub lock_time: u32,
}

impl RawTransaction {
    pub fn new(version: u32, time: Option<u32>) -> Self {
        RawTransaction {
            version,
            time,
            ..Default::default()
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.version.to_le_bytes());
        if let Some(t) = self.time {
            out.extend_from_slice(&t.to_le_bytes());
        }
        out.extend_from_slice(&compact_size(self.vin.len() as u64));
        for input in &self.vin {
            out.extend_from_slice(&input.outpoint_bytes());
            out.extend_from_slice(&compact_size(input.script_sig.len() as u64));
            out.extend_from_slice(&input.script_sig);
            out.extend_from_slice(&input.sequence.to_le_bytes());
        }
        out.extend_from_slice(&compact_size(self.vout.len() as u64));
        for output in &self.vout {
            out.extend_from_slice(&output.serialize());
        }
        out.extend_from_slice(&self.lock_time.to_le_bytes());
        out
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.serialize())
    }

    /// Transaction id in display order.
    pub fn txid(&self) -> String {
        let mut hash = sha256d(&self.serialize()).to_vec();
        hash.reverse();
        hex::encode(hash)
    }

    pub fn size(&self) -> usize {
        self.serialize().len()
    }
}

// =============================================================================
// Helpers
// =============================================================================

/// Bitcoin compact-size (varint) encoding.
pub fn compact_size(n: u64) -> Vec<u8> {
    if n < 0xfd {
        vec![n as u8]
    } else if n <= 0xffff {
        let mut v = vec![0xfd];
        v.extend_from_slice(&(n as u16).to_le_bytes());
        v
    } else if n <= 0xffff_ffff {
        let mut v = vec![0xfe];
        v.extend_from_slice(&(n as u32).to_le_bytes());
        v
    } else {
        let mut v = vec![0xff];
        v.extend_from_slice(&n.to_le_bytes());
        v
    }
}

/// Decode a display-order txid into wire (little-endian) bytes. A malformed
/// id yields 32 zero bytes rather than corrupting the stream length.
pub fn txid_to_le_bytes(txid: &str) -> Vec<u8> {
    let mut bytes = hex::decode(txid).unwrap_or_default();
    if bytes.len() != 32 {
        return vec![0u8; 32];
    }
    bytes.reverse();
    bytes
}

// =============================================================================
// Tests
// =============================================================================
