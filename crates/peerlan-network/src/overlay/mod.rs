//! Overlay transport contract
//!
//! The NAT-traversing message fabric that carries all peer traffic is an
//! external service. This module pins down the slice of it the bridge
//! relies on: reliable in-order message delivery per connection, state
//! change callbacks, and the rendezvous room's membership events.

use bytes::Bytes;

use crate::error::NetworkResult;

pub mod loopback;

pub use loopback::LoopbackHub;

/// Stable identity of a peer, as minted by the overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One live overlay connection to one peer. Valid between accept and close;
/// the overlay may reuse the integer across sessions, never within one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionHandle(pub u32);

impl std::fmt::Display for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Connection states the overlay reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    /// Inbound connection waiting for our accept
    Connecting,
    /// Link established (our outbound attempt completed)
    Connected,
    /// Remote side closed
    ClosedByPeer,
    /// Overlay gave up on the link locally
    ProblemDetectedLocally,
}

/// A state change callback drained via [`OverlayTransport::poll_events`]
#[derive(Debug, Clone, Copy)]
pub struct ConnectionEvent {
    pub conn: ConnectionHandle,
    pub peer: PeerId,
    pub state: LinkState,
}

/// Membership callbacks from the rendezvous room
#[derive(Debug, Clone)]
pub enum LobbyEvent {
    /// We entered the room; carries the current member list, self included
    Entered { members: Vec<PeerId> },
    /// Another peer entered the room
    PeerEntered(PeerId),
    /// A peer left the room
    PeerLeft(PeerId),
}

/// The overlay transport capability.
///
/// Delivery on one connection is reliable and in-order; nothing is promised
/// across connections. [`poll_events`](Self::poll_events) and
/// [`receive`](Self::receive) must only ever be called from the session
/// layer's poll task.
pub trait OverlayTransport: Send + Sync {
    /// Our own overlay identity.
    fn local_peer(&self) -> PeerId;

    /// Display name the rendezvous service knows the peer by.
    fn peer_name(&self, peer: PeerId) -> Option<String>;

    /// Initiate an outbound connection. Completion is reported as a
    /// `Connected` event.
    fn connect(&self, peer: PeerId) -> NetworkResult<ConnectionHandle>;

    /// Accept an inbound connection reported as `Connecting`.
    fn accept(&self, conn: ConnectionHandle) -> NetworkResult<()>;

    /// Close a connection. No further events fire for it locally.
    fn close(&self, conn: ConnectionHandle);

    /// Send one message, reliable and ordered relative to prior sends on
    /// the same connection.
    fn send(&self, conn: ConnectionHandle, data: &[u8]) -> NetworkResult<()>;

    /// Drain up to `max` pending inbound messages on a connection.
    fn receive(&self, conn: ConnectionHandle, max: usize) -> Vec<Bytes>;

    /// Drain pending connection state changes.
    fn poll_events(&self) -> Vec<ConnectionEvent>;
}
