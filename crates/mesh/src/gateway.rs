//! Gateway tracking and local gateway role.
//!
//! A gateway is a node with upstream internet reach that bridges mesh
//! traffic to the cloud relay. Neighbors announce themselves with
//! GATEWAY_AVAILABLE; this node becomes one when connectivity is reported
//! and stealth mode is off.
//!
//! While acting as a gateway the node also proxies presence for up to
//! [`MAX_PROXIED_NEIGHBORS`] local neighbors by broadcasting NEIGHBOR_LIST
//! whenever that set changes.

use crate::error::MeshResult;
use crate::handler::ProfileUpdate;
use crate::packet::{Packet, PacketType, BROADCAST};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError, RwLock};
use tracing::{debug, info};

/// Gateway records older than this are dropped.
pub const GATEWAY_TTL_MS: u64 = 300_000;

/// Payload of a gateway announcement.
pub const GATEWAY_ANNOUNCEMENT: &str = "ACTIVE";

/// Most neighbors a gateway proxies presence for.
pub const MAX_PROXIED_NEIGHBORS: usize = 10;

/// One entry of a NEIGHBOR_LIST payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NeighborInfo {
    pub id: String,
    pub name: String,
    pub battery_level: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
}

impl From<&ProfileUpdate> for NeighborInfo {
    fn from(profile: &ProfileUpdate) -> Self {
        Self {
            id: profile.node_id.clone(),
            name: profile.name.clone(),
            battery_level: profile.battery,
            color: profile.color.clone(),
        }
    }
}

/// What the runtime must do after a connectivity or stealth change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayTransition {
    /// Start the cloud transport and announce.
    Activate,
    /// Stop the cloud transport.
    Deactivate,
    Unchanged,
}

#[derive(Debug, Default, Clone, Copy)]
struct LinkState {
    reachable: bool,
    stealth: bool,
}

impl LinkState {
    fn is_gateway(self) -> bool {
        self.reachable && !self.stealth
    }
}

/// Known gateways plus this node's own gateway role.
#[derive(Debug)]
pub struct GatewayCoordinator {
    /// gateway node id -> last announcement (ms)
    records: RwLock<HashMap<String, u64>>,
    state: Mutex<LinkState>,
    /// Ids in the last NEIGHBOR_LIST sent
    proxied: Mutex<BTreeSet<String>>,
    ttl_ms: u64,
}

impl Default for GatewayCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl GatewayCoordinator {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            state: Mutex::new(LinkState::default()),
            proxied: Mutex::new(BTreeSet::new()),
            ttl_ms: GATEWAY_TTL_MS,
        }
    }

    /// Note an announcement from `gateway_id`.
    pub fn record(&self, gateway_id: &str, now_ms: u64) {
        let previous = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(gateway_id.to_string(), now_ms);
        if previous.is_none() {
            info!(gateway_id = %gateway_id, "Gateway discovered");
        }
    }

    /// Drop records older than the TTL. Returns how many were removed.
    pub fn prune(&self, now_ms: u64) -> usize {
        let mut records = self.records.write().unwrap_or_else(PoisonError::into_inner);
        let before = records.len();
        records.retain(|_, seen| now_ms.saturating_sub(*seen) <= self.ttl_ms);
        let pruned = before - records.len();
        if pruned > 0 {
            debug!(pruned, remaining = records.len(), "Pruned gateway records");
        }
        pruned
    }

    /// Gateways heard within the TTL as of `now_ms`.
    pub fn fresh_gateways(&self, now_ms: u64) -> Vec<String> {
        let mut gateways: Vec<String> = self
            .records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, seen)| now_ms.saturating_sub(**seen) <= self.ttl_ms)
            .map(|(id, _)| id.clone())
            .collect();
        gateways.sort();
        gateways
    }

    pub fn has_fresh_gateway(&self, now_ms: u64) -> bool {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .any(|seen| now_ms.saturating_sub(*seen) <= self.ttl_ms)
    }

    pub fn last_seen(&self, gateway_id: &str) -> Option<u64> {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(gateway_id)
            .copied()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Report upstream connectivity. Repeated identical reports are no-ops.
    pub fn set_internet_reachable(&self, reachable: bool) -> GatewayTransition {
        self.transition(|state| state.reachable = reachable)
    }

    pub fn set_stealth(&self, stealth: bool) -> GatewayTransition {
        self.transition(|state| state.stealth = stealth)
    }

    fn transition(&self, apply: impl FnOnce(&mut LinkState)) -> GatewayTransition {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let was_gateway = state.is_gateway();
        apply(&mut state);

        match (was_gateway, state.is_gateway()) {
            (false, true) => {
                info!("Internet reachable, acting as gateway");
                GatewayTransition::Activate
            }
            (true, false) => {
                info!(reachable = state.reachable, stealth = state.stealth, "Gateway role dropped");
                self.proxied.lock().unwrap_or_else(PoisonError::into_inner).clear();
                GatewayTransition::Deactivate
            }
            _ => GatewayTransition::Unchanged,
        }
    }

    pub fn is_gateway(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).is_gateway()
    }

    pub fn is_reachable(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).reachable
    }

    pub fn is_stealth(&self) -> bool {
        self.state.lock().unwrap_or_else(PoisonError::into_inner).stealth
    }

    /// Neighbors to proxy, given the local neighbor list in priority order.
    ///
    /// `Some` only while this node is a gateway and the selected ids differ
    /// from the previous selection.
    pub fn select_proxied(&self, neighbors: &[NeighborInfo]) -> Option<Vec<NeighborInfo>> {
        if !self.is_gateway() {
            return None;
        }
        let selected: Vec<NeighborInfo> = neighbors.iter().take(MAX_PROXIED_NEIGHBORS).cloned().collect();
        let ids: BTreeSet<String> = selected.iter().map(|n| n.id.clone()).collect();

        let mut proxied = self.proxied.lock().unwrap_or_else(PoisonError::into_inner);
        if *proxied == ids {
            return None;
        }
        *proxied = ids;
        debug!(neighbors = selected.len(), "Proxied neighbor set changed");
        Some(selected)
    }
}

/// Neighbor-only broadcast advertising this node as a gateway.
pub fn gateway_announcement(node_id: &str, node_name: &str) -> Packet {
    Packet::new(
        node_id,
        node_name,
        BROADCAST,
        PacketType::GatewayAvailable,
        GATEWAY_ANNOUNCEMENT,
    )
    .with_hop_count(1)
}

/// Neighbor-only broadcast listing the neighbors a gateway proxies.
pub fn neighbor_list(node_id: &str, node_name: &str, neighbors: &[NeighborInfo]) -> MeshResult<Packet> {
    Ok(Packet::new(
        node_id,
        node_name,
        BROADCAST,
        PacketType::NeighborList,
        serde_json::to_string(neighbors)?,
    )
    .with_hop_count(1))
}
