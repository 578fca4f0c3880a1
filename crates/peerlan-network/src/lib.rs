//! peerlan Network Layer
//!
//! Provides the network primitives of the virtual LAN bridge:
//! - TUN device abstraction with Linux/macOS/Windows backends
//! - VPN wire codec (data packets, IP assignments, routing updates)
//! - Overlay transport contract and the per-peer session layer
//! - Framing for the parallel TCP tunnel multiplexer

pub mod codec;
pub mod error;
pub mod mux;
pub mod overlay;
pub mod session;
pub mod tun;

pub use codec::{RouteRecord, VpnMessage};
pub use error::{NetworkError, NetworkResult};
pub use overlay::{
    ConnectionEvent, ConnectionHandle, LinkState, LobbyEvent, OverlayTransport, PeerId,
};
pub use session::{SessionHandler, SessionManager};
pub use tun::{open_tun, TunConfig, TunDevice};

/// Default MTU for the virtual interface. Leaves headroom for the overlay's
/// own framing on a 1500-byte path.
pub const DEFAULT_MTU: u16 = 1400;

/// Messages drained per connection per poll turn.
pub const RECV_BATCH: usize = 10;
