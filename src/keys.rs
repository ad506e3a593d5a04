// =============================================================================
// DRIFTBRIDGE v1.3 - Keys and Hashing
// =============================================================================
//
// secp256k1 key handling shared by every connector: keypair generation for
// the M and X legs, ECDSA over sighash digests, recoverable message
// signatures, and base58check addresses.
//
// =============================================================================

use ripemd::Ripemd160;
use secp256k1::ecdsa::{RecoverableSignature, RecoveryId, Signature};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

// =============================================================================
// Hashing
// =============================================================================

/// Double SHA-256.
pub fn sha256d(data: &[u8]) -> [u8; 32] {
    let first = Sha256::digest(data);
    let second = Sha256::digest(first);
    let mut out = [0u8; 32];
    out.copy_from_slice(&second);
    out
}

/// RIPEMD160(SHA256(data)).
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let h = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&h);
    out
}

// =============================================================================
// Key Pairs
// =============================================================================

/// A compressed secp256k1 keypair.
#[derive(Clone)]
pub struct KeyPair {
    /// 33-byte compressed public key.
    pub public: Vec<u8>,
    /// 32-byte private key.
    pub private: Vec<u8>,
}

impl KeyPair {
    /// Generate a fresh random keypair.
    pub fn generate() -> Self {
        let secp = Secp256k1::new();
        let (sk, pk) = secp.generate_keypair(&mut rand::thread_rng());
        KeyPair {
            public: pk.serialize().to_vec(),
            private: sk.secret_bytes().to_vec(),
        }
    }

    pub fn from_private(private: &[u8]) -> Option<Self> {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(private).ok()?;
        let pk = PublicKey::from_secret_key(&secp, &sk);
        Some(KeyPair {
            public: pk.serialize().to_vec(),
            private: private.to_vec(),
        })
    }

    /// hash160 of the compressed public key.
    pub fn key_id(&self) -> [u8; 20] {
        hash160(&self.public)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never log private material
        write!(f, "KeyPair({})", hex::encode(&self.public))
    }
}

// =============================================================================
// Signing
// =============================================================================

/// Sign a 32-byte digest, returning a DER signature.
pub fn sign_hash(private: &[u8], digest: &[u8; 32]) -> Option<Vec<u8>> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(private).ok()?;
    let msg = Message::from_digest_slice(digest).ok()?;
    let sig = secp.sign_ecdsa(&msg, &sk);
    Some(sig.serialize_der().to_vec())
}

/// Verify a DER signature over a 32-byte digest.
pub fn verify_hash(public: &[u8], digest: &[u8; 32], der: &[u8]) -> bool {
    let secp = Secp256k1::new();
    let (Ok(pk), Ok(msg), Ok(sig)) = (
        PublicKey::from_slice(public),
        Message::from_digest_slice(digest),
        Signature::from_der(der),
    ) else {
        return false;
    };
    secp.verify_ecdsa(&msg, &sig, &pk).is_ok()
}

/// Sign a digest with a fixed-width 64-byte compact signature.
pub fn sign_compact(private: &[u8], digest: &[u8; 32]) -> Option<[u8; 64]> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(private).ok()?;
    let msg = Message::from_digest_slice(digest).ok()?;
    Some(secp.sign_ecdsa(&msg, &sk).serialize_compact())
}

pub fn verify_compact(public: &[u8], digest: &[u8; 32], sig: &[u8]) -> bool {
    let secp = Secp256k1::new();
    let (Ok(pk), Ok(msg), Ok(s)) = (
        PublicKey::from_slice(public),
        Message::from_digest_slice(digest),
        Signature::from_compact(sig),
    ) else {
        return false;
    };
    secp.verify_ecdsa(&msg, &s, &pk).is_ok()
}

// =============================================================================
// Signed Messages
// =============================================================================

const MESSAGE_MAGIC: &str = "Bitcoin Signed Message:\n";

fn message_digest(msg: &str) -> [u8; 32] {
    let mut data = Vec::with_capacity(MESSAGE_MAGIC.len() + msg.len() + 2);
    data.push(MESSAGE_MAGIC.len() as u8);
    data.extend_from_slice(MESSAGE_MAGIC.as_bytes());
    // utxo signing strings are far below the compact-size threshold
    data.push(msg.len() as u8);
    data.extend_from_slice(msg.as_bytes());
    sha256d(&data)
}

/// Produce a 65-byte recoverable message signature in wallet `signmessage`
/// format: header byte (27 + recid + 4 for compressed keys) followed by the
/// 64-byte compact signature.
pub fn sign_message(private: &[u8], msg: &str) -> Option<Vec<u8>> {
    let secp = Secp256k1::new();
    let sk = SecretKey::from_slice(private).ok()?;
    let m = Message::from_digest_slice(&message_digest(msg)).ok()?;
    let sig: RecoverableSignature = secp.sign_ecdsa_recoverable(&m, &sk);
    let (recid, compact) = sig.serialize_compact();
    let mut out = Vec::with_capacity(65);
    out.push(27 + recid.to_i32() as u8 + 4);
    out.extend_from_slice(&compact);
    Some(out)
}

/// Recover the compressed public key from a 65-byte message signature.
pub fn recover_message_pubkey(msg: &str, sig: &[u8]) -> Option<Vec<u8>> {
    if sig.len() != 65 {
        return None;
    }
    let secp = Secp256k1::new();
    let recid = RecoveryId::from_i32(((sig[0] as i32) - 27) & 0x03).ok()?;
    let rsig = RecoverableSignature::from_compact(&sig[1..], recid).ok()?;
    let m = Message::from_digest_slice(&message_digest(msg)).ok()?;
    let pk = secp.recover_ecdsa(&m, &rsig).ok()?;
    Some(pk.serialize().to_vec())
}

// =============================================================================
// Addresses
// =============================================================================

/// base58check-encode a 20-byte hash with a one-byte version prefix.
pub fn encode_base58check(prefix: u8, hash: &[u8; 20]) -> String {
    let mut data = Vec::with_capacity(25);
    data.push(prefix);
    data.extend_from_slice(hash);
    let checksum = sha256d(&data);
    data.extend_from_slice(&checksum[..4]);
    bs58::encode(data).into_string()
}

/// Decode a base58check address into (version, hash160). Fails on bad
/// checksum or length.
pub fn decode_base58check(addr: &str) -> Option<(u8, [u8; 20])> {
    let data = bs58::decode(addr).into_vec().ok()?;
    if data.len() != 25 {
        return None;
    }
    let checksum = sha256d(&data[..21]);
    if checksum[..4] != data[21..] {
        return None;
    }
    let mut hash = [0u8; 20];
    hash.copy_from_slice(&data[1..21]);
    Some((data[0], hash))
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const PRIV: &str = "2a369b62ff5ba6ba2d0977a69bd1ffabf590ea0f99d6394a38402741b4a1d796";

    #[test]
    fn test_keypair_from_private() {
        let kp = KeyPair::from_private(&hex::decode(PRIV).unwrap()).unwrap();
        assert_eq!(
            hex::encode(&kp.public),
            "02355803a552f7c7a9a8b89c7f19df6f0afde799510d0edeae92fe548d3e505058"
        );
        assert_eq!(
            hex::encode(kp.key_id()),
            "8abbcbe0a89bade388d7ae825aef73758b18cbbd"
        );
    }

    #[test]
    fn test_generate_distinct() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.public, b.public);
        assert_eq!(a.public.len(), 33);
        assert_eq!(a.private.len(), 32);
    }

    #[test]
    fn test_sign_verify_roundtrip() {
        let kp = KeyPair::generate();
        let digest = sha256d(b"driftbridge");
        let der = sign_hash(&kp.private, &digest).unwrap();
        assert!(verify_hash(&kp.public, &digest, &der));

        let other = sha256d(b"tampered");
        assert!(!verify_hash(&kp.public, &other, &der));
    }

    #[test]
    fn test_compact_sign_verify() {
        let kp = KeyPair::generate();
        let digest = sha256d(b"packet header");
        let sig = sign_compact(&kp.private, &digest).unwrap();
        assert!(verify_compact(&kp.public, &digest, &sig));
        assert!(!verify_compact(&KeyPair::generate().public, &digest, &sig));
    }

    #[test]
    fn test_message_signature_recovers_signer() {
        let kp = KeyPair::generate();
        let msg = "txid:0:addr:1.5";
        let sig = sign_message(&kp.private, msg).unwrap();
        assert_eq!(sig.len(), 65);
        assert_eq!(recover_message_pubkey(msg, &sig).unwrap(), kp.public);
        assert_ne!(
            recover_message_pubkey("txid:1:addr:1.5", &sig).unwrap_or_default(),
            kp.public
        );
    }

    #[test]
    fn test_base58check_roundtrip() {
        let hash = [0x11u8; 20];
        let addr = encode_base58check(26, &hash);
        let (ver, decoded) = decode_base58check(&addr).unwrap();
        assert_eq!(ver, 26);
        assert_eq!(decoded, hash);
        // corrupt a character
        let mut bad = addr.clone().into_bytes();
        bad[5] = if bad[5] == b'2' { b'3' } else { b'2' };
        assert!(decode_base58check(std::str::from_utf8(&bad).unwrap()).is_none());
    }

    #[test]
    fn test_known_p2pkh_address() {
        let (ver, hash) = decode_base58check("1PwwMpUEoiVf9uJfqYapWxDgoC8coR6Afe").unwrap();
        assert_eq!(ver, 0);
        assert_eq!(
            hex::encode(hash),
            "fbb69b118d36d0f94fac283ad8073041bdc64f3b"
        );
    }
}
