// =============================================================================
// DRIFTBRIDGE v1.3 - Signature Hashing
// =============================================================================
//
// Two sighash algorithms cover every supported chain:
//
// - Legacy: the serialized transaction with the signed input's scriptSig
//   replaced by the script code, all other scriptSigs blanked, and the
//   hash type appended.
//
// - FORKID (Bitcoin Cash): BIP143-style digest over
//   nVersion | hashPrevouts | hashSequence | outpoint | scriptCode |
//   amount | nSequence | hashOutputs | nLockTime | sighashType,
//   with replay protection folded into the fork value. BCH connectors use
//   this and only this; asking them for a legacy hash is a programming
//   error.
//
// =============================================================================

use crate::keys::sha256d;
use crate::rawtx::{compact_size, RawTransaction};

pub const SIGHASH_ALL: u32 = 0x01;
pub const SIGHASH_NONE: u32 = 0x02;
pub const SIGHASH_SINGLE: u32 = 0x03;
pub const SIGHASH_FORKID: u32 = 0x40;
pub const SIGHASH_ANYONECANPAY: u32 = 0x80;

// =============================================================================
// Sighash Type
// =============================================================================

/// 32-bit sighash type carrying base type, flags and the fork value.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SigHashType(u32);

impl SigHashType {
    pub fn all() -> Self {
        SigHashType(SIGHASH_ALL)
    }

    pub fn from_raw(raw: u32) -> Self {
        SigHashType(raw)
    }

    pub fn with_fork_id(self) -> Self {
        SigHashType(self.0 | SIGHASH_FORKID)
    }

    pub fn with_fork_value(self, fork_value: u32) -> Self {
        SigHashType((fork_value << 8) | (self.0 & 0xff))
    }

    pub fn base_type(&self) -> u32 {
        self.0 & 0x1f
    }

    pub fn fork_value(&self) -> u32 {
        self.0 >> 8
    }

    pub fn has_fork_id(&self) -> bool {
        self.0 & SIGHASH_FORKID != 0
    }

    pub fn has_anyone_can_pay(&self) -> bool {
        self.0 & SIGHASH_ANYONECANPAY != 0
    }

    pub fn raw(&self) -> u32 {
        self.0
    }

    /// The byte appended to a DER signature.
    pub fn sig_byte(&self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

// =============================================================================
// Legacy
// =============================================================================

/// Legacy sighash over the serialized transaction.
///
/// Only SIGHASH_ALL is used by the swap transactions.
pub fn legacy_sighash(
    tx: &RawTransaction,
    input_index: usize,
    script_code: &[u8],
    hash_type: SigHashType,
) -> [u8; 32] {
    debug_assert_eq!(hash_type.base_type(), SIGHASH_ALL);
    debug_assert!(
        !hash_type.has_fork_id(),
        "FORKID chains must hash with forkid_sighash"
    );

    let mut copy = tx.clone();
    for (i, input) in copy.vin.iter_mut().enumerate() {
        input.script_sig = if i == input_index {
            script_code.to_vec()
        } else {
            Vec::new()
        };
    }

    let mut data = copy.serialize();
    data.extend_from_slice(&hash_type.raw().to_le_bytes());
    sha256d(&data)
}

// =============================================================================
// FORKID
// =============================================================================

/// Fork value xor for replay protection. A legacy chain's fork id takes the
/// form 0xffxxxx, guaranteed different from the pre-fork value.
const REPLAY_PROTECTION_XOR: u32 = 0xdead;

/// BIP143-style FORKID sighash with replay protection applied.
pub fn forkid_sighash(
    tx: &RawTransaction,
    input_index: usize,
    script_code: &[u8],
    amount: u64,
    hash_type: SigHashType,
) -> [u8; 32] {
    debug_assert!(hash_type.has_fork_id(), "FORKID flag required for BCH sighash");

    let fork_value = hash_type.fork_value() ^ REPLAY_PROTECTION_XOR;
    let hash_type = hash_type.with_fork_value(0xff0000 | fork_value);

    let hash_prevouts = if !hash_type.has_anyone_can_pay() {
        let mut data = Vec::new();
        for input in &tx.vin {
            data.extend_from_slice(&input.outpoint_bytes());
        }
        sha256d(&data)
    } else {
        [0u8; 32]
    };

    let base = hash_type.base_type();
    let hash_sequence = if !hash_type.has_anyone_can_pay()
        && base != SIGHASH_SINGLE
        && base != SIGHASH_NONE
    {
        let mut data = Vec::new();
        for input in &tx.vin {
            data.extend_from_slice(&input.sequence.to_le_bytes());
        }
        sha256d(&data)
    } else {
        [0u8; 32]
    };

    let hash_outputs = if base != SIGHASH_SINGLE && base != SIGHASH_NONE {
        let mut data = Vec::new();
        for output in &tx.vout {
            data.extend_from_slice(&output.serialize());
        }
        sha256d(&data)
    } else if base == SIGHASH_SINGLE && input_index < tx.vout.len() {
        sha256d(&tx.vout[input_index].serialize())
    } else {
        [0u8; 32]
    };

    let mut preimage = Vec::new();
    preimage.extend_from_slice(&tx.version.to_le_bytes());
    preimage.extend_from_slice(&hash_prevouts);
    preimage.extend_from_slice(&hash_sequence);
    preimage.extend_from_slice(&tx.vin[input_index].outpoint_bytes());
    preimage.extend_from_slice(&compact_size(script_code.len() as u64));
    preimage.extend_from_slice(script_code);
    preimage.extend_from_slice(&amount.to_le_bytes());
    preimage.extend_from_slice(&tx.vin[input_index].sequence.to_le_bytes());
    preimage.extend_from_slice(&hash_outputs);
    preimage.extend_from_slice(&tx.lock_time.to_le_bytes());
    preimage.extend_from_slice(&hash_type.raw().to_le_bytes());

    sha256d(&preimage)
}

// =============================================================================
// Tests
// =============================================================================
