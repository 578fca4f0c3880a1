//! Overlay session layer
//!
//! Owns the set of live peer connections and the poll task that drains the
//! overlay's callbacks and inbound messages. The bridge registers itself as
//! the [`SessionHandler`]; nothing here is process-global.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

use crate::error::NetworkResult;
use crate::overlay::{
    ConnectionEvent, ConnectionHandle, LinkState, LobbyEvent, OverlayTransport, PeerId,
};
use crate::RECV_BATCH;

/// Upper bound for the adaptive poll delay.
pub const MAX_POLL_DELAY: Duration = Duration::from_millis(10);

/// Back-off curve for the poll task: an idle turn stretches the delay by
/// 1 ms up to [`MAX_POLL_DELAY`]; any received message snaps it back to 0.
pub fn next_poll_delay(previous: Duration, had_messages: bool) -> Duration {
    if had_messages {
        Duration::ZERO
    } else {
        (previous + Duration::from_millis(1)).min(MAX_POLL_DELAY)
    }
}

/// Callbacks the session layer dispatches into. Implemented by the bridge.
pub trait SessionHandler: Send + Sync {
    fn on_peer_joined(&self, peer: PeerId, conn: ConnectionHandle);
    fn on_peer_left(&self, peer: PeerId);
    fn on_message(&self, data: Bytes, from: ConnectionHandle);
}

struct LinkEntry {
    peer: PeerId,
    /// False between our outbound connect and the overlay's `Connected`.
    live: bool,
}

/// Per-peer connection manager and overlay poll loop.
///
/// The connection set is one map keyed by [`ConnectionHandle`]; peer lookups
/// are derived by scan (the room holds tens of peers at most).
pub struct SessionManager {
    transport: Arc<dyn OverlayTransport>,
    links: Mutex<HashMap<ConnectionHandle, LinkEntry>>,
    handler: RwLock<Option<Weak<dyn SessionHandler>>>,
    running: AtomicBool,
    shutdown: Notify,
    poll_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SessionManager {
    pub fn new(transport: Arc<dyn OverlayTransport>) -> Arc<Self> {
        Arc::new(Self {
            transport,
            links: Mutex::new(HashMap::new()),
            handler: RwLock::new(None),
            running: AtomicBool::new(false),
            shutdown: Notify::new(),
            poll_task: Mutex::new(None),
        })
    }

    /// Install the message/lifecycle sink for the lifetime of the bridge.
    pub fn register_handler(&self, handler: Weak<dyn SessionHandler>) {
        *self.handler.write().unwrap() = Some(handler);
    }

    pub fn transport(&self) -> &Arc<dyn OverlayTransport> {
        &self.transport
    }

    pub fn local_peer(&self) -> PeerId {
        self.transport.local_peer()
    }

    /// Spawn the poll task. The task is the sole caller of the overlay's
    /// callback pump and message receive.
    pub fn start(self: &Arc<Self>) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let session = Arc::clone(self);
        let task = tokio::spawn(async move {
            debug!("overlay poll task started");
            let mut delay = Duration::ZERO;

            while session.running.load(Ordering::Relaxed) {
                let received = session.poll_once();
                delay = next_poll_delay(delay, received > 0);

                if delay.is_zero() {
                    tokio::task::yield_now().await;
                } else {
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = session.shutdown.notified() => break,
                    }
                }
            }

            debug!("overlay poll task stopped");
        });

        *self.poll_task.lock().unwrap() = Some(task);
    }

    /// Stop the poll task and wait for it to exit.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.shutdown.notify_waiters();

        let task = self.poll_task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// One poll turn: drain state events, then up to [`RECV_BATCH`] messages
    /// per connection. Returns how many messages were dispatched.
    pub fn poll_once(&self) -> usize {
        for event in self.transport.poll_events() {
            self.handle_event(event);
        }

        let conns: Vec<ConnectionHandle> = {
            let links = self.links.lock().unwrap();
            links
                .iter()
                .filter(|(_, entry)| entry.live)
                .map(|(conn, _)| *conn)
                .collect()
        };

        let mut received = 0;
        for conn in conns {
            for message in self.transport.receive(conn, RECV_BATCH) {
                received += 1;
                if let Some(handler) = self.handler() {
                    handler.on_message(message, conn);
                }
            }
        }
        received
    }

    /// React to room membership changes.
    pub fn handle_lobby_event(&self, event: LobbyEvent) {
        match event {
            LobbyEvent::Entered { members } => {
                let local = self.local_peer();
                for member in members {
                    if member == local {
                        continue;
                    }
                    if let Err(e) = self.connect_to_peer(member) {
                        warn!("failed to connect to room member {}: {}", member, e);
                    }
                }
            }
            // The newcomer iterates the member list on entry and dials us.
            LobbyEvent::PeerEntered(peer) => {
                trace!("peer {} entered the room", peer);
            }
            LobbyEvent::PeerLeft(peer) => {
                let conn = self.connection_handle(peer, false);
                if let Some(conn) = conn {
                    self.drop_link(conn, peer);
                }
            }
        }
    }

    /// Initiate an outbound connection, deduped by peer identity.
    pub fn connect_to_peer(&self, peer: PeerId) -> NetworkResult<()> {
        if peer == self.local_peer() {
            debug!("ignoring self-connect");
            return Ok(());
        }
        if self.connection_handle(peer, false).is_some() {
            debug!("already connected to peer {}", peer);
            return Ok(());
        }

        let conn = self.transport.connect(peer)?;
        debug!("connecting to peer {} on {}", peer, conn);
        self.links
            .lock()
            .unwrap()
            .insert(conn, LinkEntry { peer, live: false });
        Ok(())
    }

    /// Send one message on a specific connection.
    pub fn send_to(&self, conn: ConnectionHandle, data: &[u8]) -> NetworkResult<()> {
        self.transport.send(conn, data)
    }

    /// Send a buffer to every live connection.
    pub fn broadcast(&self, data: &[u8]) {
        for (conn, peer) in self.connections() {
            if let Err(e) = self.transport.send(conn, data) {
                warn!("broadcast to {} ({}) failed: {}", peer, conn, e);
            }
        }
    }

    /// All live connections with their remote identities.
    pub fn connections(&self) -> Vec<(ConnectionHandle, PeerId)> {
        let links = self.links.lock().unwrap();
        links
            .iter()
            .filter(|(_, entry)| entry.live)
            .map(|(conn, entry)| (*conn, entry.peer))
            .collect()
    }

    /// The live connection to a peer, if the overlay has delivered one.
    pub fn connection_for(&self, peer: PeerId) -> Option<ConnectionHandle> {
        self.connection_handle(peer, true)
    }

    fn connection_handle(&self, peer: PeerId, live_only: bool) -> Option<ConnectionHandle> {
        let links = self.links.lock().unwrap();
        links
            .iter()
            .find(|(_, entry)| entry.peer == peer && (entry.live || !live_only))
            .map(|(conn, _)| *conn)
    }

    fn handle_event(&self, event: ConnectionEvent) {
        match event.state {
            LinkState::Connecting => {
                if let Err(e) = self.transport.accept(event.conn) {
                    warn!("failed to accept {} from {}: {}", event.conn, event.peer, e);
                    return;
                }
                debug!("accepted connection {} from peer {}", event.conn, event.peer);
                self.links.lock().unwrap().insert(
                    event.conn,
                    LinkEntry {
                        peer: event.peer,
                        live: true,
                    },
                );
                if let Some(handler) = self.handler() {
                    handler.on_peer_joined(event.peer, event.conn);
                }
            }
            LinkState::Connected => {
                debug!("connected to peer {} on {}", event.peer, event.conn);
                self.links.lock().unwrap().insert(
                    event.conn,
                    LinkEntry {
                        peer: event.peer,
                        live: true,
                    },
                );
                if let Some(handler) = self.handler() {
                    handler.on_peer_joined(event.peer, event.conn);
                }
            }
            LinkState::ClosedByPeer | LinkState::ProblemDetectedLocally => {
                debug!(
                    "connection {} to peer {} closed ({:?})",
                    event.conn, event.peer, event.state
                );
                self.drop_link(event.conn, event.peer);
            }
        }
    }

    fn drop_link(&self, conn: ConnectionHandle, peer: PeerId) {
        let removed = self.links.lock().unwrap().remove(&conn).is_some();
        self.transport.close(conn);
        if removed {
            if let Some(handler) = self.handler() {
                handler.on_peer_left(peer);
            }
        }
    }

    fn handler(&self) -> Option<Arc<dyn SessionHandler>> {
        self.handler.read().unwrap().as_ref()?.upgrade()
    }
}
