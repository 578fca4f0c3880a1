//! peerlan Core
//!
//! Bridges the peers of one rendezvous room into a single virtual IPv4
//! subnet:
//! - Address allocation on the host peer
//! - Routing table mapping virtual IPs to overlay connections
//! - The bridge engine with its TUN pipelines and lifecycle hooks

pub mod allocator;
pub mod bridge;
pub mod config;
pub mod error;
pub mod routing;

pub use allocator::AddressAllocator;
pub use bridge::{BridgeState, BridgeStats, Role, VpnBridge};
pub use config::BridgeConfig;
pub use error::{CoreError, CoreResult};
pub use routing::{RouteEntry, RoutingTable};
