//! In-process overlay transport
//!
//! A hub of paired message queues implementing [`OverlayTransport`] with the
//! same observable contract as the real fabric: accept-gated connections,
//! reliable in-order delivery per connection, and drained state events.
//! Used by the test suites and the demo binary; it is not a production
//! transport.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use super::{ConnectionEvent, ConnectionHandle, LinkState, OverlayTransport, PeerId};
use crate::error::{NetworkError, NetworkResult};

#[derive(Debug)]
struct Link {
    owner: PeerId,
    peer: PeerId,
    twin: ConnectionHandle,
    live: bool,
}

#[derive(Default)]
struct Endpoint {
    name: String,
    events: VecDeque<ConnectionEvent>,
    inboxes: HashMap<ConnectionHandle, VecDeque<Bytes>>,
}

#[derive(Default)]
struct HubState {
    next_conn: u32,
    endpoints: HashMap<PeerId, Endpoint>,
    links: HashMap<ConnectionHandle, Link>,
}

/// Registry of in-process peers sharing one fabric.
#[derive(Clone, Default)]
pub struct LoopbackHub {
    state: Arc<Mutex<HubState>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a peer and hand back its transport endpoint.
    pub fn endpoint(&self, peer: PeerId, name: &str) -> Arc<LoopbackOverlay> {
        let mut state = self.state.lock().unwrap();
        state.endpoints.insert(
            peer,
            Endpoint {
                name: name.to_string(),
                ..Default::default()
            },
        );
        Arc::new(LoopbackOverlay {
            state: self.state.clone(),
            local: peer,
        })
    }

    /// Simulate the overlay giving up on a link: the owner of `conn` sees
    /// `ProblemDetectedLocally`, the other side sees `ClosedByPeer`.
    pub fn break_link(&self, conn: ConnectionHandle) {
        let mut state = self.state.lock().unwrap();
        let Some(link) = state.links.remove(&conn) else {
            return;
        };
        let twin = state.links.remove(&link.twin);
        if let Some(endpoint) = state.endpoints.get_mut(&link.owner) {
            endpoint.events.push_back(ConnectionEvent {
                conn,
                peer: link.peer,
                state: LinkState::ProblemDetectedLocally,
            });
        }
        if let Some(twin) = twin {
            if let Some(endpoint) = state.endpoints.get_mut(&twin.owner) {
                endpoint.events.push_back(ConnectionEvent {
                    conn: link.twin,
                    peer: twin.peer,
                    state: LinkState::ClosedByPeer,
                });
            }
        }
    }
}

/// One peer's view of the hub.
pub struct LoopbackOverlay {
    state: Arc<Mutex<HubState>>,
    local: PeerId,
}

impl OverlayTransport for LoopbackOverlay {
    fn local_peer(&self) -> PeerId {
        self.local
    }

    fn peer_name(&self, peer: PeerId) -> Option<String> {
        let state = self.state.lock().unwrap();
        state.endpoints.get(&peer).map(|e| e.name.clone())
    }

    fn connect(&self, peer: PeerId) -> NetworkResult<ConnectionHandle> {
        if peer == self.local {
            return Err(NetworkError::Refused("self-connect".into()));
        }

        let mut state = self.state.lock().unwrap();
        if !state.endpoints.contains_key(&peer) {
            return Err(NetworkError::Transport(format!("unknown peer {}", peer)));
        }

        let local_conn = ConnectionHandle(state.next_conn);
        let remote_conn = ConnectionHandle(state.next_conn + 1);
        state.next_conn += 2;

        state.links.insert(
            local_conn,
            Link {
                owner: self.local,
                peer,
                twin: remote_conn,
                live: false,
            },
        );
        state.links.insert(
            remote_conn,
            Link {
                owner: peer,
                peer: self.local,
                twin: local_conn,
                live: false,
            },
        );

        let initiator = self.local;
        if let Some(endpoint) = state.endpoints.get_mut(&peer) {
            endpoint.events.push_back(ConnectionEvent {
                conn: remote_conn,
                peer: initiator,
                state: LinkState::Connecting,
            });
        }

        Ok(local_conn)
    }

    fn accept(&self, conn: ConnectionHandle) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        let (twin, initiator) = match state.links.get_mut(&conn) {
            Some(link) if link.owner == self.local => {
                link.live = true;
                (link.twin, link.peer)
            }
            _ => return Err(NetworkError::UnknownConnection(conn.0)),
        };

        let accepter = self.local;
        if let Some(link) = state.links.get_mut(&twin) {
            link.live = true;
        }
        if let Some(endpoint) = state.endpoints.get_mut(&initiator) {
            endpoint.events.push_back(ConnectionEvent {
                conn: twin,
                peer: accepter,
                state: LinkState::Connected,
            });
        }
        Ok(())
    }

    fn close(&self, conn: ConnectionHandle) {
        let mut state = self.state.lock().unwrap();
        let Some(link) = state.links.remove(&conn) else {
            return;
        };
        let twin = state.links.remove(&link.twin);
        if let Some(endpoint) = state.endpoints.get_mut(&self.local) {
            endpoint.inboxes.remove(&conn);
        }
        if let Some(twin) = twin {
            if let Some(endpoint) = state.endpoints.get_mut(&twin.owner) {
                endpoint.events.push_back(ConnectionEvent {
                    conn: link.twin,
                    peer: twin.peer,
                    state: LinkState::ClosedByPeer,
                });
            }
        }
    }

    fn send(&self, conn: ConnectionHandle, data: &[u8]) -> NetworkResult<()> {
        let mut state = self.state.lock().unwrap();
        let (twin, peer, live) = match state.links.get(&conn) {
            Some(link) if link.owner == self.local => (link.twin, link.peer, link.live),
            _ => {
                return Err(NetworkError::Transport(format!(
                    "send on dead connection {}",
                    conn
                )))
            }
        };
        if !live {
            return Err(NetworkError::Transport(format!(
                "send on unaccepted connection {}",
                conn
            )));
        }
        if let Some(endpoint) = state.endpoints.get_mut(&peer) {
            endpoint
                .inboxes
                .entry(twin)
                .or_default()
                .push_back(Bytes::copy_from_slice(data));
        }
        Ok(())
    }

    fn receive(&self, conn: ConnectionHandle, max: usize) -> Vec<Bytes> {
        let mut state = self.state.lock().unwrap();
        let Some(endpoint) = state.endpoints.get_mut(&self.local) else {
            return Vec::new();
        };
        let Some(inbox) = endpoint.inboxes.get_mut(&conn) else {
            return Vec::new();
        };
        let take = inbox.len().min(max);
        inbox.drain(..take).collect()
    }

    fn poll_events(&self) -> Vec<ConnectionEvent> {
        let mut state = self.state.lock().unwrap();
        match state.endpoints.get_mut(&self.local) {
            Some(endpoint) => endpoint.events.drain(..).collect(),
            None => Vec::new(),
        }
    }
}
