//! Cost-based routing table.
//!
//! Each destination maps to the transport-qualified endpoint that offered
//! the cheapest recent path. Routes are learned passively from every packet
//! that arrives and are never deleted, only superseded.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

/// Routes older than this are replaced by any candidate.
pub const MAX_ROUTE_AGE_MS: u64 = 30_000;

/// Route entry in the routing table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination node ID
    pub destination: String,
    /// Qualified endpoint of the neighbor to forward through
    pub next_hop: String,
    /// Cost metric (lower is better)
    pub cost: f32,
    /// Last reported battery of the neighbor
    pub battery: u8,
    /// Last update timestamp
    pub last_update: u64,
}

impl RouteEntry {
    pub fn is_stale(&self, now_ms: u64, max_age_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_update) > max_age_ms
    }
}

/// Transport classes, cheapest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportClass {
    Lan,
    WifiDirect,
    Nearby,
    Bluetooth,
    Cloud,
    Unknown,
}

impl TransportClass {
    /// Class of a transport by its registered name.
    pub fn from_name(name: &str) -> Self {
        match name {
            "LAN" => Self::Lan,
            "WiFiDirect" => Self::WifiDirect,
            "Nearby" => Self::Nearby,
            "Bluetooth" => Self::Bluetooth,
            "Cloud" => Self::Cloud,
            _ => Self::Unknown,
        }
    }

    /// Class of the transport a qualified endpoint belongs to.
    pub fn from_endpoint(endpoint: &str) -> Self {
        let name = endpoint.split_once(':').map(|(name, _)| name).unwrap_or("");
        Self::from_name(name)
    }

    pub fn base_cost(self) -> f32 {
        match self {
            Self::Lan => 1.0,
            Self::WifiDirect => 2.0,
            Self::Nearby => 5.0,
            Self::Bluetooth => 10.0,
            Self::Cloud => 50.0,
            Self::Unknown => 15.0,
        }
    }
}

/// Cost of the link a packet arrived on, penalized for a weak sender battery.
pub fn link_cost(origin_endpoint: &str, sender_battery: u8) -> f32 {
    let base = TransportClass::from_endpoint(origin_endpoint).base_cost();
    if sender_battery < 15 {
        base * 5.0
    } else if sender_battery < 30 {
        base * 2.0
    } else {
        base
    }
}

/// Result of route update
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RouteUpdateResult {
    /// New route added
    NewRoute,
    /// Existing route updated
    UpdatedRoute,
    /// Route ignored (not better than existing)
    Ignored,
    /// Route rejected (invalid)
    Rejected(String),
}

/// Routing table shared by every ingress worker.
#[derive(Debug)]
pub struct RoutingTable {
    /// Local node ID
    node_id: String,
    /// Routes: destination -> RouteEntry
    routes: RwLock<HashMap<String, RouteEntry>>,
    /// Maximum route age before considered stale (milliseconds)
    max_route_age_ms: u64,
}

impl RoutingTable {
    /// Create a new routing table
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: node_id.into(),
            routes: RwLock::new(HashMap::new()),
            max_route_age_ms: MAX_ROUTE_AGE_MS,
        }
    }

    pub fn with_max_route_age(mut self, max_route_age_ms: u64) -> Self {
        self.max_route_age_ms = max_route_age_ms;
        self
    }

    /// Offer a path to `destination` through `next_hop`.
    ///
    /// Accepted when no route exists, the cost is strictly lower, or the
    /// current route is stale.
    pub fn update_route(
        &self,
        destination: &str,
        next_hop: &str,
        cost: f32,
        battery: u8,
        now_ms: u64,
    ) -> RouteUpdateResult {
        if destination == self.node_id {
            return RouteUpdateResult::Rejected("Route to self".to_string());
        }
        if !cost.is_finite() || cost < 0.0 {
            return RouteUpdateResult::Rejected(format!("Invalid cost {}", cost));
        }

        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);

        let result = match routes.get(destination) {
            None => RouteUpdateResult::NewRoute,
            Some(existing)
                if cost < existing.cost || existing.is_stale(now_ms, self.max_route_age_ms) =>
            {
                RouteUpdateResult::UpdatedRoute
            }
            Some(_) => return RouteUpdateResult::Ignored,
        };

        routes.insert(
            destination.to_string(),
            RouteEntry {
                destination: destination.to_string(),
                next_hop: next_hop.to_string(),
                cost,
                battery,
                last_update: now_ms,
            },
        );
        result
    }

    /// Mark the route to `destination` as heard again, provided it still
    /// goes through `next_hop`. Cost and next hop are left alone.
    pub fn refresh(&self, destination: &str, next_hop: &str, now_ms: u64) -> bool {
        let mut routes = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        match routes.get_mut(destination) {
            Some(route) if route.next_hop == next_hop => {
                route.last_update = route.last_update.max(now_ms);
                true
            }
            _ => false,
        }
    }

    /// Current route to `destination`, stale or not.
    pub fn route_to(&self, destination: &str) -> Option<RouteEntry> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
            .cloned()
    }

    /// Next hop for `destination` if the route is still fresh.
    pub fn find_next_hop(&self, destination: &str, now_ms: u64) -> Option<String> {
        self.routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(destination)
            .filter(|route| !route.is_stale(now_ms, self.max_route_age_ms))
            .map(|route| route.next_hop.clone())
    }

    /// Copy of every route, cheapest first.
    pub fn snapshot(&self) -> Vec<RouteEntry> {
        let mut routes: Vec<RouteEntry> = self
            .routes
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        routes.sort_by(|a, b| a.cost.total_cmp(&b.cost));
        routes
    }

    pub fn len(&self) -> usize {
        self.routes.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }
}
