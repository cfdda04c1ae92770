//! GhostMesh Mesh - multi-hop relay for offline-first messaging
//!
//! Moves packets across heterogeneous, intermittently connected links
//! (LAN, Wi-Fi Direct, Bluetooth, a cloud relay) without central
//! coordination.
//!
//! # Core Components
//!
//! - **Packet Model**: JSON wire packet and its validity predicate
//! - **Deduplication**: bounded FIFO seen-set over hashed packet ids
//! - **Routing**: per-destination cheapest next hop, learned passively and
//!   from neighbors' topology gossip
//! - **Gateways**: neighbors with internet reach, and this node's own role
//! - **Relay Engine**: ingest, dispatch, relay, tunnel, broadcast fallback
//! - **Transports**: adapter trait, aggregator, in-process channel transport
//! - **Node Runtime**: background tasks with cooperative cancellation
//!
//! # Example Usage
//!
//! ```rust,no_run
//! use ghostmesh_core::Config;
//! use ghostmesh_mesh::{ChannelHub, ChannelTransport, MeshNode};
//! use std::sync::Arc;
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let hub = ChannelHub::new();
//! let node = MeshNode::builder(Config::default_config())
//!     .transport(Arc::new(ChannelTransport::new("LAN", "node-1", hub.clone())))
//!     .build()?;
//!
//! node.start().await?;
//! node.send_text("ALL", "anyone out there?")?;
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod dedup;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod node;
pub mod packet;
pub mod relay;
pub mod routing;
pub mod transport;

// Re-export main types
pub use dedup::DeduplicationCache;
pub use error::{MeshError, MeshResult};
pub use gateway::{GatewayCoordinator, GatewayTransition, NeighborInfo};
pub use handler::{LocationUpdate, PacketHandler, ProfileSink, ProfileUpdate};
pub use node::{MeshNode, MeshNodeBuilder, MeshStats};
pub use packet::{Packet, PacketType, BROADCAST, PROTOCOL_VERSION};
pub use relay::{EngineStats, IngestReport, RelayEngine, RelayOutcome};
pub use routing::{link_cost, RouteEntry, RouteUpdateResult, RoutingTable, TransportClass};
pub use transport::{ChannelHub, ChannelTransport, Transport, TransportAggregator, TransportCallback};
