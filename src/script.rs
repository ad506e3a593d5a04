// =============================================================================
// DRIFTBRIDGE v1.3 - Swap Scripts
// =============================================================================
//
// Bitcoin Script templates for the swap deposit contracts.
//
// Deposit redeem script:
// OP_IF
//     <lockTime> OP_CHECKLOCKTIMEVERIFY OP_DROP
//     OP_DUP OP_HASH160 <depositorPkh> OP_EQUALVERIFY OP_CHECKSIG
// OP_ELSE
//     OP_DUP OP_HASH160 <counterpartyPkh> OP_EQUALVERIFY OP_CHECKSIGVERIFY
//     OP_SIZE <33> OP_EQUALVERIFY OP_HASH160 <hash160(X.pub)> OP_EQUAL
// OP_ENDIF
//
// The IF branch is the refund path: after lockTime the depositor takes the
// coins back. The ELSE branch is the redeem path: the counterparty spends
// by presenting the 33-byte secret public key X.pub whose hash160 matches.
//
// To refund: <sig> <pubkeyM> OP_TRUE <redeemScript>
// To redeem: <X.pub> <sig> <pubkeyM> OP_FALSE <redeemScript>
//
// =============================================================================

use crate::keys::hash160;

// =============================================================================
// Script Opcodes
// =============================================================================

pub mod opcodes {
    pub const OP_FALSE: u8 = 0x00;
    pub const OP_PUSHDATA1: u8 = 0x4c;
    pub const OP_PUSHDATA2: u8 = 0x4d;
    pub const OP_TRUE: u8 = 0x51;
    pub const OP_IF: u8 = 0x63;
    pub const OP_ELSE: u8 = 0x67;
    pub const OP_ENDIF: u8 = 0x68;
    pub const OP_RETURN: u8 = 0x6a;
    pub const OP_DROP: u8 = 0x75;
    pub const OP_DUP: u8 = 0x76;
    pub const OP_SIZE: u8 = 0x82;
    pub const OP_EQUAL: u8 = 0x87;
    pub const OP_EQUALVERIFY: u8 = 0x88;
    pub const OP_HASH160: u8 = 0xa9;
    pub const OP_CHECKSIG: u8 = 0xac;
    pub const OP_CHECKSIGVERIFY: u8 = 0xad;
    pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;
}

// =============================================================================
// Script Builder
// =============================================================================

/// Thin byte-vector builder for scripts.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Script {
    bytes: Vec<u8>,
}

impl Script {
    pub fn new() -> Self {
        Script { bytes: Vec::new() }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Script { bytes }
    }

    pub fn op(mut self, opcode: u8) -> Self {
        self.bytes.push(opcode);
        self
    }

    /// Push raw data with the shortest pushdata encoding.
    pub fn push(mut self, data: &[u8]) -> Self {
        let len = data.len();
        if len < opcodes::OP_PUSHDATA1 as usize {
            self.bytes.push(len as u8);
        } else if len <= 0xff {
            self.bytes.push(opcodes::OP_PUSHDATA1);
            self.bytes.push(len as u8);
        } else {
            self.bytes.push(opcodes::OP_PUSHDATA2);
            self.bytes.extend_from_slice(&(len as u16).to_le_bytes());
        }
        self.bytes.extend_from_slice(data);
        self
    }

    /// Push a number in minimal script-number encoding.
    pub fn push_int(self, n: i64) -> Self {
        self.push(&encode_script_num(n))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

// =============================================================================
// Script Numbers
// =============================================================================

/// Minimal little-endian script-number encoding with a sign byte when the
/// high bit of the last byte is set.
pub fn encode_script_num(n: i64) -> Vec<u8> {
    if n == 0 {
        return vec![];
    }
    let negative = n < 0;
    let mut abs = n.unsigned_abs();
    let mut out = Vec::new();
    while abs > 0 {
        out.push((abs & 0xff) as u8);
        abs >>= 8;
    }
    if out.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
        out.push(if negative { 0x80 } else { 0x00 });
    } else if negative {
        let last = out.last_mut().unwrap();
        *last |= 0x80;
    }
    out
}

pub fn decode_script_num(bytes: &[u8]) -> i64 {
    if bytes.is_empty() {
        return 0;
    }
    let mut value: i64 = 0;
    for (i, &b) in bytes.iter().enumerate().take(8) {
        value |= (b as i64) << (i * 8);
    }
    let last = bytes[bytes.len() - 1];
    if last & 0x80 != 0 {
        let sign_bit = 1i64 << (bytes.len() * 8 - 1);
        value &= !sign_bit;
        value = -value;
    }
    value
}

// =============================================================================
// Deposit Script
// =============================================================================

/// Build the deposit redeem script. Both sides of a swap build the same
/// bytes for the same (lockTime, depositorPkh, counterpartyPkh, xPkh).
pub fn deposit_script(
    lock_time: u32,
    depositor_pkh: &[u8; 20],
    counterparty_pkh: &[u8; 20],
    x_pkh: &[u8; 20],
) -> Script {
    use opcodes::*;
    Script::new()
        .op(OP_IF)
        .push_int(lock_time as i64)
        .op(OP_CHECKLOCKTIMEVERIFY)
        .op(OP_DROP)
        .op(OP_DUP)
        .op(OP_HASH160)
        .push(depositor_pkh)
        .op(OP_EQUALVERIFY)
        .op(OP_CHECKSIG)
        .op(OP_ELSE)
        .op(OP_DUP)
        .op(OP_HASH160)
        .push(counterparty_pkh)
        .op(OP_EQUALVERIFY)
        .op(OP_CHECKSIGVERIFY)
        .op(OP_SIZE)
        .push_int(33)
        .op(OP_EQUALVERIFY)
        .op(OP_HASH160)
        .push(x_pkh)
        .op(OP_EQUAL)
        .op(OP_ENDIF)
}

/// scriptSig for the refund path (IF branch).
pub fn refund_sig_script(signature: &[u8], pubkey: &[u8], redeem: &Script) -> Script {
    use opcodes::*;
    Script::new()
        .push(signature)
        .push(pubkey)
        .op(OP_TRUE)
        .push(redeem.as_slice())
}

/// scriptSig for the redeem path (ELSE branch), revealing X.pub.
pub fn payment_sig_script(
    x_pubkey: &[u8],
    signature: &[u8],
    pubkey: &[u8],
    redeem: &Script,
) -> Script {
    use opcodes::*;
    Script::new()
        .push(x_pubkey)
        .push(signature)
        .push(pubkey)
        .op(OP_FALSE)
        .push(redeem.as_slice())
}

/// Extract the 33-byte secret public key from a redeem-path scriptSig.
///
/// Returns None when the input does not spend through the ELSE branch.
pub fn extract_secret_pubkey(script_sig: &[u8]) -> Option<Vec<u8>> {
    let pushes = parse_pushes(script_sig)?;
    // <X.pub> <sig> <pubkeyM> OP_FALSE <redeemScript>
    if pushes.len() == 5
        && pushes[0].len() == 33
        && pushes[2].len() == 33
        && pushes[3].is_empty()
    {
        return Some(pushes[0].clone());
    }
    None
}

/// Split a script into its pushed elements. OP_FALSE counts as an empty
/// push; any non-push opcode other than OP_FALSE fails the parse.
fn parse_pushes(script: &[u8]) -> Option<Vec<Vec<u8>>> {
    use opcodes::*;
    let mut out = Vec::new();
    let mut i = 0usize;
    while i < script.len() {
        let op = script[i];
        i += 1;
        let len = match op {
            OP_FALSE => 0,
            1..=0x4b => op as usize,
            OP_PUSHDATA1 => {
                let l = *script.get(i)? as usize;
                i += 1;
                l
            }
            OP_PUSHDATA2 => {
                let l = u16::from_le_bytes([*script.get(i)?, *script.get(i + 1)?]) as usize;
                i += 2;
                l
            }
            _ => return None,
        };
        if i + len > script.len() {
            return None;
        }
        out.push(script[i..i + len].to_vec());
        i += len;
    }
    Some(out)
}

// =============================================================================
// Standard Outputs
// =============================================================================

pub fn p2pkh_script(pkh: &[u8; 20]) -> Script {
    use opcodes::*;
    Script::new()
        .op(OP_DUP)
        .op(OP_HASH160)
        .push(pkh)
        .op(OP_EQUALVERIFY)
        .op(OP_CHECKSIG)
}

pub fn p2sh_script(script_hash: &[u8; 20]) -> Script {
    use opcodes::*;
    Script::new().op(OP_HASH160).push(script_hash).op(OP_EQUAL)
}

pub fn op_return_script(data: &[u8]) -> Script {
    Script::new().op(opcodes::OP_RETURN).push(data)
}

/// hash160 of a redeem script, the payload of its P2SH address.
pub fn script_hash(script: &Script) -> [u8; 20] {
    hash160(script.as_slice())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_script() -> Script {
        deposit_script(600_000, &[0xAA; 20], &[0xBB; 20], &[0xCC; 20])
    }

    #[test]
    fn test_deposit_script_shape() {
        use opcodes::*;
        let s = sample_script();
        let b = s.as_slice();
        assert_eq!(b[0], OP_IF);
        assert_eq!(*b.last().unwrap(), OP_ENDIF);
        assert!(b.contains(&OP_CHECKLOCKTIMEVERIFY));
        assert!(b.contains(&OP_CHECKSIGVERIFY));
    }

    #[test]
    fn test_deposit_script_parity() {
        // both sides must produce identical bytes for the same parameters
        let a = deposit_script(424_242, &[1; 20], &[2; 20], &[3; 20]);
        let b = deposit_script(424_242, &[1; 20], &[2; 20], &[3; 20]);
        assert_eq!(a.to_bytes(), b.to_bytes());

        let c = deposit_script(424_243, &[1; 20], &[2; 20], &[3; 20]);
        assert_ne!(a.to_bytes(), c.to_bytes());
    }

    #[test]
    fn test_deposit_script_known_bytes() {
        // fixed vector with a single pkh in all three slots
        let pkh: [u8; 20] = hex::decode("8abbcbe0a89bade388d7ae825aef73758b18cbbd")
            .unwrap()
            .try_into()
            .unwrap();
        let s = deposit_script(600_000, &pkh, &pkh, &pkh);
        assert_eq!(
            hex::encode(s.as_slice()),
            "6303c02709b17576a9148abbcbe0a89bade388d7ae825aef73758b18cbbd88ac\
             6776a9148abbcbe0a89bade388d7ae825aef73758b18cbbd88ad82012188a914\
             8abbcbe0a89bade388d7ae825aef73758b18cbbd8768"
        );
    }

    #[test]
    fn test_script_num_roundtrip() {
        for n in [0i64, 1, 127, 128, 255, 600_000, 0x7fffffff, -1, -255] {
            assert_eq!(decode_script_num(&encode_script_num(n)), n, "n={}", n);
        }
        // minimality: 600000 = 0x0927c0 -> 3 bytes
        assert_eq!(encode_script_num(600_000), vec![0xc0, 0x27, 0x09]);
        assert_eq!(encode_script_num(128), vec![0x80, 0x00]);
    }

    #[test]
    fn test_extract_secret_pubkey() {
        let redeem = sample_script();
        let xpub = vec![0x02; 33];
        let sig = vec![0x30; 71];
        let mpub = vec![0x03; 33];

        let pay = payment_sig_script(&xpub, &sig, &mpub, &redeem);
        assert_eq!(extract_secret_pubkey(pay.as_slice()).unwrap(), xpub);

        // refund path carries no secret
        let refund = refund_sig_script(&sig, &mpub, &redeem);
        assert!(extract_secret_pubkey(refund.as_slice()).is_none());
    }

    #[test]
    fn test_pushdata_encodings() {
        let small = Script::new().push(&[0u8; 75]);
        assert_eq!(small.as_slice()[0], 75);

        let med = Script::new().push(&[0u8; 76]);
        assert_eq!(med.as_slice()[0], opcodes::OP_PUSHDATA1);
        assert_eq!(med.as_slice()[1], 76);

        let large = Script::new().push(&[0u8; 300]);
        assert_eq!(large.as_slice()[0], opcodes::OP_PUSHDATA2);
    }

    #[test]
    fn test_standard_outputs() {
        let pkh = [5u8; 20];
        assert_eq!(p2pkh_script(&pkh).len(), 25);
        assert_eq!(p2sh_script(&pkh).len(), 23);
        let ret = op_return_script(b"hello");
        assert_eq!(ret.as_slice()[0], opcodes::OP_RETURN);
    }
}
