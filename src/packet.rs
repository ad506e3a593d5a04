// =============================================================================
// DRIFTBRIDGE v1.3 - Wire Packets
// =============================================================================
//
// Swap messages travel over the host network as opaque blobs:
//
//   destination(20) | micros-since-epoch(8 LE) | packet
//
// where a packet is
//
//   version(4 LE) | command(4 LE) | timestamp(4 LE) | bodyLen(4 LE) |
//   body | pubkey(33) | signature(64)
//
// The signature is a compact ECDSA signature over sha256d(header | body)
// with the embedded sender pubkey. A de-dup filter over sha256d of the full
// framed bytes drops packets already seen; when the filter exceeds its byte
// budget it is cleared wholesale.
//
// =============================================================================

use std::collections::HashSet;
use std::sync::Mutex;

use crate::amount::now_micros;
use crate::keys::{sha256d, sign_compact, verify_compact};
use crate::PROTOCOL_VERSION;

pub const PACKET_HEADER_SIZE: usize = 16;
pub const PACKET_PUBKEY_SIZE: usize = 33;
pub const PACKET_SIGNATURE_SIZE: usize = 64;

// =============================================================================
// Commands
// =============================================================================

/// Swap protocol commands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u32)]
pub enum XbcCommand {
    Invalid = 0,
    Transaction = 1,
    TransactionAccepting = 2,
    TransactionHold = 3,
    TransactionInit = 4,
    TransactionCreated = 5,
    TransactionConfirmA = 6,
    TransactionConfirmB = 7,
    TransactionCancel = 8,
    TransactionFinished = 9,
}

impl XbcCommand {
    pub fn from_u32(v: u32) -> Self {
        use XbcCommand::*;
        match v {
            1 => Transaction,
            2 => TransactionAccepting,
            3 => TransactionHold,
            4 => TransactionInit,
            5 => TransactionCreated,
            6 => TransactionConfirmA,
            7 => TransactionConfirmB,
            8 => TransactionCancel,
            9 => TransactionFinished,
            _ => Invalid,
        }
    }
}

// =============================================================================
// Packet
// =============================================================================

#[derive(Clone, Debug)]
pub struct Packet {
    pub version: u32,
    pub command: XbcCommand,
    pub timestamp: u32,
    pub data: Vec<u8>,
    pub pubkey: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Packet {
    pub fn new(command: XbcCommand) -> Self {
        Packet {
            version: PROTOCOL_VERSION,
            command,
            timestamp: (now_micros() / 1_000_000) as u32,
            data: Vec::new(),
            pubkey: Vec::new(),
            signature: Vec::new(),
        }
    }

    // =========================================================================
    // Field Appenders
    // =========================================================================

    pub fn put_u32(&mut self, v: u32) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.data.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Append a string NUL-padded to a fixed width.
    pub fn put_padded(&mut self, s: &str, width: usize) {
        let mut field = vec![0u8; width];
        let bytes = s.as_bytes();
        let n = bytes.len().min(width);
        field[..n].copy_from_slice(&bytes[..n]);
        self.data.extend_from_slice(&field);
    }

    /// Append variable-length bytes with a u32 length prefix.
    pub fn put_var(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_bytes(bytes);
    }

    // =========================================================================
    // Codec
    // =========================================================================

    fn header(&self) -> [u8; PACKET_HEADER_SIZE] {
        let mut h = [0u8; PACKET_HEADER_SIZE];
        h[0..4].copy_from_slice(&self.version.to_le_bytes());
        h[4..8].copy_from_slice(&(self.command as u32).to_le_bytes());
        h[8..12].copy_from_slice(&self.timestamp.to_le_bytes());
        h[12..16].copy_from_slice(&(self.data.len() as u32).to_le_bytes());
        h
    }

    fn signing_digest(&self) -> [u8; 32] {
        let mut buf = self.header().to_vec();
        buf.extend_from_slice(&self.data);
        sha256d(&buf)
    }

    /// Full serialized packet.
    pub fn body(&self) -> Vec<u8> {
        let mut out = self.header().to_vec();
        out.extend_from_slice(&self.data);
        out.extend_from_slice(&self.pubkey);
        out.extend_from_slice(&self.signature);
        out
    }

    /// Parse a packet; length and version are checked, the signature is not.
    pub fn copy_from(bytes: &[u8]) -> Option<Packet> {
        if bytes.len() < PACKET_HEADER_SIZE + PACKET_PUBKEY_SIZE + PACKET_SIGNATURE_SIZE {
            return None;
        }
        let version = u32::from_le_bytes(bytes[0..4].try_into().ok()?);
        let command = XbcCommand::from_u32(u32::from_le_bytes(bytes[4..8].try_into().ok()?));
        let timestamp = u32::from_le_bytes(bytes[8..12].try_into().ok()?);
        let body_len = u32::from_le_bytes(bytes[12..16].try_into().ok()?) as usize;

        let expected =
            PACKET_HEADER_SIZE + body_len + PACKET_PUBKEY_SIZE + PACKET_SIGNATURE_SIZE;
        if bytes.len() != expected || command == XbcCommand::Invalid {
            return None;
        }

        let data = bytes[PACKET_HEADER_SIZE..PACKET_HEADER_SIZE + body_len].to_vec();
        let pk_at = PACKET_HEADER_SIZE + body_len;
        Some(Packet {
            version,
            command,
            timestamp,
            data,
            pubkey: bytes[pk_at..pk_at + PACKET_PUBKEY_SIZE].to_vec(),
            signature: bytes[pk_at + PACKET_PUBKEY_SIZE..].to_vec(),
        })
    }

    /// Protocol version of a serialized packet, if parseable.
    pub fn version_of(bytes: &[u8]) -> Option<u32> {
        Some(u32::from_le_bytes(bytes.get(0..4)?.try_into().ok()?))
    }

    // =========================================================================
    // Signatures
    // =========================================================================

    pub fn sign(&mut self, pubkey: &[u8], privkey: &[u8]) -> bool {
        self.pubkey = pubkey.to_vec();
        match sign_compact(privkey, &self.signing_digest()) {
            Some(sig) => {
                self.signature = sig.to_vec();
                true
            }
            None => false,
        }
    }

    pub fn verify(&self) -> bool {
        self.pubkey.len() == PACKET_PUBKEY_SIZE
            && self.signature.len() == PACKET_SIGNATURE_SIZE
            && verify_compact(&self.pubkey, &self.signing_digest(), &self.signature)
    }
}

// =============================================================================
// Reader
// =============================================================================

/// Cursor over a packet body. Reads fail soft (None) on truncation so
/// malformed packets are dropped, never panicked on.
pub struct PacketReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> PacketReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        PacketReader { data, pos: 0 }
    }

    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(n)?;
        if end > self.data.len() {
            return None;
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Some(slice)
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        Some(u32::from_le_bytes(self.read_bytes(4)?.try_into().ok()?))
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        Some(u64::from_le_bytes(self.read_bytes(8)?.try_into().ok()?))
    }

    /// Fixed-width NUL-padded string field.
    pub fn read_padded(&mut self, width: usize) -> Option<String> {
        let raw = self.read_bytes(width)?;
        let end = raw.iter().position(|&b| b == 0).unwrap_or(width);
        String::from_utf8(raw[..end].to_vec()).ok()
    }

    /// u32 length-prefixed bytes.
    pub fn read_var(&mut self) -> Option<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Some(self.read_bytes(len)?.to_vec())
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

// =============================================================================
// Framing
// =============================================================================

/// Outbound frame: 20-byte destination (all-zero for broadcast), 8-byte
/// little-endian microsecond timestamp, packet bytes.
pub fn frame_message(destination: &[u8], packet_body: &[u8]) -> Vec<u8> {
    debug_assert_eq!(destination.len(), 20, "bad send address");
    let mut msg = destination.to_vec();
    msg.extend_from_slice(&now_micros().to_le_bytes());
    msg.extend_from_slice(packet_body);
    msg
}

pub fn message_hash(message: &[u8]) -> [u8; 32] {
    sha256d(message)
}

/// Host-network broadcast primitive carrying framed messages to peers.
pub trait PacketRelay: Send + Sync {
    fn relay(&self, message: Vec<u8>);
}

// =============================================================================
// De-dup Filter
// =============================================================================

/// Bounded set of already-processed message hashes. Hashes are accounted at
/// an estimated 64 bytes apiece; exceeding the budget clears the whole set.
pub struct MessageFilter {
    seen: Mutex<HashSet<[u8; 32]>>,
    max_bytes: usize,
}

impl MessageFilter {
    pub fn new(max_mbytes: usize) -> Self {
        MessageFilter {
            seen: Mutex::new(HashSet::new()),
            max_bytes: max_mbytes * 1_000_000,
        }
    }

    pub fn known(&self, hash: &[u8; 32]) -> bool {
        self.seen.lock().unwrap().contains(hash)
    }

    pub fn add(&self, hash: [u8; 32]) {
        let mut seen = self.seen.lock().unwrap();
        if seen.len() * 64 > self.max_bytes {
            seen.clear();
        }
        seen.insert(hash);
    }

    pub fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.lock().unwrap().is_empty()
    }
}

// =============================================================================
// Tests
// =============================================================================
