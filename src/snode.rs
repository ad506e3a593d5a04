// =============================================================================
// DRIFTBRIDGE v1.3 - Service Node Selection
// =============================================================================
//
// Service nodes relay swap packets and backstop trader refunds. The node
// list itself comes from an external registry; the selector filters it by
// protocol version and advertised wallet services, then returns a shuffled
// candidate list so load spreads across eligible nodes.
//
// =============================================================================

use std::collections::HashSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use crate::keys::hash160;

// =============================================================================
// Node Records
// =============================================================================

/// A registered service node as advertised on the network.
#[derive(Clone, Debug, Default)]
pub struct ServiceNodeEntry {
    /// Compressed pubkey (33 bytes).
    pub pubkey: Vec<u8>,
    /// Collateral address receiving taker fees.
    pub payment_address: String,
    pub protocol_version: u32,
    pub running: bool,
    /// Advertised wallet tickers.
    pub services: Vec<String>,
}

impl ServiceNodeEntry {
    /// 20-byte key id used as the node's packet address.
    pub fn key_id(&self) -> [u8; 20] {
        hash160(&self.pubkey)
    }

    pub fn has_service(&self, service: &str) -> bool {
        self.services.iter().any(|s| s == service)
    }
}

/// External registry of known service nodes.
pub trait NodeRegistry: Send + Sync {
    fn list(&self) -> Vec<ServiceNodeEntry>;

    fn get(&self, pubkey: &[u8]) -> Option<ServiceNodeEntry> {
        self.list().into_iter().find(|n| n.pubkey == pubkey)
    }

    /// The locally-running service node, when this node is one.
    fn active_node(&self) -> Option<ServiceNodeEntry> {
        None
    }

    /// Re-announce this node's services to the network.
    fn send_ping(&self) {}
}

// =============================================================================
// Selection
// =============================================================================

/// Running nodes at the requested protocol version, not excluded, whose
/// service list covers every requested currency, shuffled with `seed`.
pub fn find_shuffled_nodes_with_services(
    registry: &dyn NodeRegistry,
    requested: &HashSet<String>,
    version: u32,
    not_in: &HashSet<Vec<u8>>,
    seed: u64,
) -> Vec<ServiceNodeEntry> {
    let mut list: Vec<ServiceNodeEntry> = registry
        .list()
        .into_iter()
        .filter(|n| {
            n.running
                && n.protocol_version == version
                && !not_in.contains(&n.pubkey)
                && requested.iter().all(|s| n.has_service(s))
        })
        .collect();

    let mut rng = StdRng::seed_from_u64(seed);
    list.shuffle(&mut rng);
    list
}

/// First eligible node, or None.
pub fn find_node_with_services(
    registry: &dyn NodeRegistry,
    requested: &HashSet<String>,
    version: u32,
    not_in: &HashSet<Vec<u8>>,
    seed: u64,
) -> Option<ServiceNodeEntry> {
    find_shuffled_nodes_with_services(registry, requested, version, not_in, seed)
        .into_iter()
        .next()
}

/// Does the node advertise the service?
pub fn has_node_service(registry: &dyn NodeRegistry, pubkey: &[u8], service: &str) -> bool {
    registry
        .get(pubkey)
        .map(|n| n.has_service(service))
        .unwrap_or(false)
}

// =============================================================================
// Tests
// =============================================================================
