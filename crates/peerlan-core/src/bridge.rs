//! VPN bridge engine
//!
//! Ties the TUN device, codec, routing table, and allocator to the overlay
//! session layer. Two pipelines move traffic: the reader task forwards TUN
//! frames to the owning peer's connection, the writer task drains inbound
//! payloads into the TUN. Peer lifecycle hooks keep the mesh consistent as
//! the room changes.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use peerlan_network::tun::ipv4;
use peerlan_network::{
    open_tun, ConnectionHandle, PeerId, RouteRecord, SessionHandler, SessionManager, TunConfig,
    TunDevice, VpnMessage,
};

use crate::allocator::AddressAllocator;
use crate::config::BridgeConfig;
use crate::error::{CoreError, CoreResult};
use crate::routing::{RouteEntry, RoutingTable};

/// Which side of the room this peer plays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Owns the allocator; sole source of assignments and route updates
    Host,
    /// Adopts its address and routes from the host
    Member,
}

/// Bridge lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Datapath counters; monotonic while running, reset on stop
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_dropped: u64,
}

/// One inbound payload waiting for the TUN writer. The origin tag is
/// informational.
struct InboundPacket {
    data: Bytes,
    from: ConnectionHandle,
}

/// The VPN bridge
pub struct VpnBridge {
    config: BridgeConfig,
    role: Role,
    session: Arc<SessionManager>,
    self_ref: Weak<VpnBridge>,

    state: Mutex<BridgeState>,
    degraded: AtomicBool,

    tun: Mutex<Option<Arc<dyn TunDevice>>>,
    local_ip: Mutex<Option<Ipv4Addr>>,
    routes: RoutingTable,
    allocator: Mutex<Option<AddressAllocator>>,

    write_queue: Mutex<Option<mpsc::UnboundedSender<InboundPacket>>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,

    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_dropped: AtomicU64,
}

impl VpnBridge {
    /// Create a stopped bridge and register it as the session's handler.
    pub fn new(session: Arc<SessionManager>, config: BridgeConfig, role: Role) -> Arc<Self> {
        let bridge = Arc::new_cyclic(|self_ref| Self {
            config,
            role,
            session,
            self_ref: self_ref.clone(),
            state: Mutex::new(BridgeState::Stopped),
            degraded: AtomicBool::new(false),
            tun: Mutex::new(None),
            local_ip: Mutex::new(None),
            routes: RoutingTable::new(),
            allocator: Mutex::new(None),
            write_queue: Mutex::new(None),
            shutdown: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            packets_dropped: AtomicU64::new(0),
        });

        let handler: Arc<dyn SessionHandler> = bridge.clone();
        bridge.session.register_handler(Arc::downgrade(&handler));
        bridge
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> BridgeState {
        *self.state.lock().unwrap()
    }

    /// True after a fatal TUN failure while running; overlay dispatch
    /// continues
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    pub fn local_ip(&self) -> Option<Ipv4Addr> {
        *self.local_ip.lock().unwrap()
    }

    pub fn routes(&self) -> &RoutingTable {
        &self.routes
    }

    pub fn stats(&self) -> BridgeStats {
        BridgeStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
        }
    }

    /// Open the platform TUN device and start the pipelines.
    pub async fn start(self: &Arc<Self>) -> CoreResult<()> {
        self.begin_start()?;

        let tun_config = TunConfig {
            name: self.config.tun_name.clone(),
            mtu: self.config.mtu,
        };
        let tun: Arc<dyn TunDevice> = match open_tun(tun_config).await {
            Ok(device) => Arc::from(device),
            Err(e) => {
                *self.state.lock().unwrap() = BridgeState::Stopped;
                return Err(e.into());
            }
        };

        self.finish_start(tun).await
    }

    /// Start on an already-open device. Used by tests and the demo binary;
    /// `start` is this plus the platform open.
    pub async fn start_with_device(self: &Arc<Self>, tun: Arc<dyn TunDevice>) -> CoreResult<()> {
        self.begin_start()?;
        self.finish_start(tun).await
    }

    fn begin_start(&self) -> CoreResult<()> {
        self.config.validate()?;

        let mut state = self.state.lock().unwrap();
        if *state != BridgeState::Stopped {
            return Err(CoreError::AlreadyRunning);
        }
        *state = BridgeState::Starting;
        Ok(())
    }

    async fn finish_start(self: &Arc<Self>, tun: Arc<dyn TunDevice>) -> CoreResult<()> {
        self.degraded.store(false, Ordering::Relaxed);

        if self.role == Role::Host {
            let allocator = AddressAllocator::new(self.config.subnet, self.config.netmask);
            let host_ip = allocator.host_addr();

            let configured = match tun.configure(host_ip, self.config.netmask).await {
                Ok(()) => tun.set_up().await,
                Err(e) => Err(e),
            };
            if let Err(e) = configured {
                let _ = tun.close().await;
                *self.state.lock().unwrap() = BridgeState::Stopped;
                return Err(e.into());
            }

            let peer = self.session.local_peer();
            self.routes.insert(RouteEntry {
                peer,
                conn: None,
                addr: host_ip,
                display_name: self.display_name(peer),
                is_local: true,
            });
            *self.local_ip.lock().unwrap() = Some(host_ip);
            *self.allocator.lock().unwrap() = Some(allocator);
            info!("hosting virtual subnet, local IP {}", host_ip);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();

        let reader = self.spawn_tun_reader(tun.clone(), shutdown_rx);
        let writer = self.spawn_tun_writer(tun.clone(), queue_rx);

        *self.tun.lock().unwrap() = Some(tun);
        *self.write_queue.lock().unwrap() = Some(queue_tx);
        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        self.tasks.lock().unwrap().extend([reader, writer]);

        *self.state.lock().unwrap() = BridgeState::Running;
        info!("VPN bridge started ({:?})", self.role);
        Ok(())
    }

    /// Stop the pipelines, close the device, and clear all bridge state.
    /// A stopped bridge can be started again.
    pub async fn stop(&self) -> CoreResult<()> {
        {
            let mut state = self.state.lock().unwrap();
            if *state != BridgeState::Running {
                debug!("stop requested while {:?}, nothing to do", *state);
                return Ok(());
            }
            *state = BridgeState::Stopping;
        }
        info!("stopping VPN bridge");

        if let Some(shutdown) = self.shutdown.lock().unwrap().take() {
            let _ = shutdown.send(true);
        }
        // Dropping the sender lets the writer drain the queue and exit.
        self.write_queue.lock().unwrap().take();

        let tasks: Vec<_> = self.tasks.lock().unwrap().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }

        let tun = self.tun.lock().unwrap().take();
        if let Some(tun) = tun {
            if let Err(e) = tun.close().await {
                warn!("error closing TUN device: {}", e);
            }
        }

        self.routes.clear();
        *self.allocator.lock().unwrap() = None;
        *self.local_ip.lock().unwrap() = None;
        self.degraded.store(false, Ordering::Relaxed);
        for counter in [
            &self.packets_sent,
            &self.packets_received,
            &self.bytes_sent,
            &self.bytes_received,
            &self.packets_dropped,
        ] {
            counter.store(0, Ordering::Relaxed);
        }

        *self.state.lock().unwrap() = BridgeState::Stopped;
        info!("VPN bridge stopped");
        Ok(())
    }

    // =====================
    // Pipelines
    // =====================

    fn spawn_tun_reader(
        self: &Arc<Self>,
        tun: Arc<dyn TunDevice>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);

        tokio::spawn(async move {
            debug!("TUN reader task started");

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let result = tokio::select! {
                    _ = shutdown.changed() => continue,
                    result = tun.read() => result,
                };

                match result {
                    Ok(frame) if frame.is_empty() => {
                        // Nothing available; brief yield before retrying.
                        tokio::time::sleep(Duration::from_millis(1)).await;
                    }
                    Ok(frame) => bridge.forward_frame(&frame),
                    Err(e) => {
                        if *shutdown.borrow() {
                            break;
                        }
                        warn!("TUN read failed, bridge degraded: {}", e);
                        bridge.degraded.store(true, Ordering::Relaxed);
                        break;
                    }
                }
            }

            debug!("TUN reader task stopped");
        })
    }

    fn spawn_tun_writer(
        self: &Arc<Self>,
        tun: Arc<dyn TunDevice>,
        mut queue: mpsc::UnboundedReceiver<InboundPacket>,
    ) -> tokio::task::JoinHandle<()> {
        let bridge = Arc::clone(self);

        tokio::spawn(async move {
            debug!("TUN writer task started");

            while let Some(packet) = queue.recv().await {
                bridge.write_packet(tun.as_ref(), packet).await;
                // Drain whatever else queued up this turn.
                while let Ok(packet) = queue.try_recv() {
                    bridge.write_packet(tun.as_ref(), packet).await;
                }
            }

            debug!("TUN writer task stopped");
        })
    }

    /// One TUN frame outbound: resolve the route and hand the payload to
    /// the session layer.
    fn forward_frame(&self, frame: &[u8]) {
        let Some(dest) = ipv4::destination(frame) else {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let Some(route) = self.routes.lookup(dest) else {
            trace!("no route for {}, dropping", dest);
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        if route.is_local {
            // Self-destined traffic never crosses the overlay.
            return;
        }

        let Some(conn) = route.conn else {
            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        };

        let message = VpnMessage::Data(Bytes::copy_from_slice(frame)).encode();
        match self.session.send_to(conn, &message) {
            Ok(()) => {
                self.packets_sent.fetch_add(1, Ordering::Relaxed);
                self.bytes_sent.fetch_add(frame.len() as u64, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("overlay send to {} failed: {}", route.display_name, e);
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    async fn write_packet(&self, tun: &dyn TunDevice, packet: InboundPacket) {
        trace!("writing {} bytes from {}", packet.data.len(), packet.from);
        match tun.write(&packet.data).await {
            Ok(n) if n > 0 => {
                self.packets_received.fetch_add(1, Ordering::Relaxed);
                self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
            }
            Ok(_) => {
                // Device buffer full; the frame is lost.
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                debug!("TUN write failed: {}", e);
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    // =====================
    // Inbound control messages
    // =====================

    fn handle_ip_assignment(&self, addr: Ipv4Addr) {
        if self.role == Role::Host {
            debug!("ignoring IP assignment on the host");
            return;
        }

        info!("received virtual IP assignment {}", addr);
        *self.local_ip.lock().unwrap() = Some(addr);

        let peer = self.session.local_peer();
        self.routes.insert(RouteEntry {
            peer,
            conn: None,
            addr,
            display_name: self.display_name(peer),
            is_local: true,
        });

        let tun = self.tun.lock().unwrap().clone();
        let netmask = self.config.netmask;
        if let (Some(tun), Some(bridge)) = (tun, self.self_ref.upgrade()) {
            tokio::spawn(async move {
                let configured = match tun.configure(addr, netmask).await {
                    Ok(()) => tun.set_up().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = configured {
                    warn!("failed to configure TUN with {}: {}", addr, e);
                    bridge.degraded.store(true, Ordering::Relaxed);
                }
            });
        }
    }

    fn handle_route_update(&self, records: &[RouteRecord]) {
        let local = self.session.local_peer();
        for record in records {
            if record.peer == local {
                continue;
            }
            // Bind the route to the peer's current connection; entries for
            // peers the overlay has not delivered yet show up in a later
            // snapshot.
            let Some(conn) = self.session.connection_for(record.peer) else {
                trace!("no connection yet for {} ({})", record.peer, record.addr);
                continue;
            };
            let name = self.display_name(record.peer);
            debug!("route updated: {} -> {}", record.addr, name);
            self.routes.insert(RouteEntry {
                peer: record.peer,
                conn: Some(conn),
                addr: record.addr,
                display_name: name,
                is_local: false,
            });
        }
    }

    fn broadcast_route_update(&self) {
        let records: Vec<RouteRecord> = self
            .routes
            .snapshot()
            .into_iter()
            .map(|entry| RouteRecord {
                peer: entry.peer,
                addr: entry.addr,
            })
            .collect();
        debug!("broadcasting routing table with {} entries", records.len());
        self.session
            .broadcast(&VpnMessage::RouteUpdate(records).encode());
    }

    fn display_name(&self, peer: PeerId) -> String {
        self.session
            .transport()
            .peer_name(peer)
            .unwrap_or_else(|| peer.to_string())
    }
}

impl SessionHandler for VpnBridge {
    fn on_peer_joined(&self, peer: PeerId, conn: ConnectionHandle) {
        if self.role != Role::Host {
            // Members learn their routes from the host's broadcasts.
            return;
        }

        let addr = {
            let allocator = self.allocator.lock().unwrap();
            let Some(allocator) = allocator.as_ref() else {
                return;
            };
            match allocator.allocate() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!("no address for joining peer {}: {}", peer, e);
                    return;
                }
            }
        };

        let assignment = VpnMessage::IpAssignment(addr).encode();
        if let Err(e) = self.session.send_to(conn, &assignment) {
            warn!("failed to send IP assignment to {}: {}", peer, e);
        }

        let name = self.display_name(peer);
        info!("assigned {} to {} ({})", addr, name, peer);
        self.routes.insert(RouteEntry {
            peer,
            conn: Some(conn),
            addr,
            display_name: name,
            is_local: false,
        });

        self.broadcast_route_update();
    }

    fn on_peer_left(&self, peer: PeerId) {
        let Some(addr) = self.routes.remove_by_peer(peer) else {
            return;
        };
        info!("removed route {} for departed peer {}", addr, peer);

        if self.role == Role::Host {
            if let Some(allocator) = self.allocator.lock().unwrap().as_ref() {
                allocator.release(addr);
            }
            self.broadcast_route_update();
        }
    }

    fn on_message(&self, data: Bytes, from: ConnectionHandle) {
        let message = match VpnMessage::decode(&data) {
            Ok(Some(message)) => message,
            Ok(None) => {
                trace!("ignoring unknown message type from {}", from);
                return;
            }
            Err(e) => {
                trace!("dropping malformed message from {}: {}", from, e);
                self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                return;
            }
        };

        match message {
            VpnMessage::Data(payload) => {
                let queue = self.write_queue.lock().unwrap().clone();
                match queue {
                    Some(queue) => {
                        let packet = InboundPacket {
                            data: payload,
                            from,
                        };
                        if queue.send(packet).is_err() {
                            self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                    None => {
                        // Not running; nowhere to put the payload.
                        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
            VpnMessage::IpAssignment(addr) => self.handle_ip_assignment(addr),
            VpnMessage::RouteUpdate(records) => self.handle_route_update(&records),
            VpnMessage::Ping | VpnMessage::Pong => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerlan_network::overlay::LoopbackHub;
    use peerlan_network::tun::{memory_tun, MemoryTunHandle};

    struct Peer {
        session: Arc<SessionManager>,
        bridge: Arc<VpnBridge>,
        tun: MemoryTunHandle,
    }

    fn test_config() -> BridgeConfig {
        BridgeConfig {
            tun_name: "test0".to_string(),
            subnet: Ipv4Addr::new(10, 0, 0, 0),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: 1400,
        }
    }

    async fn spawn_peer(
        hub: &LoopbackHub,
        id: u64,
        name: &str,
        role: Role,
        config: &BridgeConfig,
    ) -> Peer {
        let session = SessionManager::new(hub.endpoint(PeerId(id), name));
        let bridge = VpnBridge::new(session.clone(), config.clone(), role);
        let (device, tun) = memory_tun(TunConfig {
            name: format!("tun-{}", name),
            mtu: config.mtu,
        });
        bridge.start_with_device(Arc::new(device)).await.unwrap();
        Peer {
            session,
            bridge,
            tun,
        }
    }

    /// Drive every session's poll turn a few times, yielding so spawned
    /// bridge tasks get to run in between.
    async fn pump(peers: &[&Peer]) {
        for _ in 0..20 {
            for peer in peers {
                peer.session.poll_once();
            }
            tokio::task::yield_now().await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }

    fn ipv4_frame(src: [u8; 4], dst: [u8; 4], total_len: usize) -> Vec<u8> {
        let mut frame = vec![0u8; total_len.max(20)];
        frame[0] = 0x45;
        frame[12..16].copy_from_slice(&src);
        frame[16..20].copy_from_slice(&dst);
        frame
    }

    async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", what));
    }

    #[tokio::test]
    async fn two_peer_bring_up() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;

        // Before any join: only the host's own reservation.
        assert_eq!(host.bridge.local_ip(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(host.bridge.routes().len(), 1);
        assert_eq!(
            host.tun.address(),
            Some((Ipv4Addr::new(10, 0, 0, 1), config.netmask))
        );
        assert!(host.tun.is_up());

        let member = spawn_peer(&hub, 2, "member", Role::Member, &config).await;
        assert_eq!(member.bridge.local_ip(), None);
        assert!(member.tun.address().is_none());

        member.session.connect_to_peer(PeerId(1)).unwrap();
        pump(&[&host, &member]).await;

        // Host assigned .2, recorded the member, and broadcast the table.
        assert_eq!(member.bridge.local_ip(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        let host_route = host.bridge.routes().lookup(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        assert_eq!(host_route.peer, PeerId(2));
        assert_eq!(host_route.display_name, "member");
        assert!(!host_route.is_local);

        // Member configured its device and learned both routes.
        wait_for("member TUN configured", || member.tun.address().is_some()).await;
        assert_eq!(
            member.tun.address(),
            Some((Ipv4Addr::new(10, 0, 0, 2), config.netmask))
        );
        assert!(member.tun.is_up());

        assert_eq!(member.bridge.routes().len(), 2);
        let to_host = member.bridge.routes().lookup(Ipv4Addr::new(10, 0, 0, 1)).unwrap();
        assert_eq!(to_host.peer, PeerId(1));
        assert!(to_host.conn.is_some());
        let local = member.bridge.routes().lookup(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        assert!(local.is_local);
        assert!(local.conn.is_none());
    }

    #[tokio::test]
    async fn data_flows_both_ways() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;
        let member = spawn_peer(&hub, 2, "member", Role::Member, &config).await;
        member.session.connect_to_peer(PeerId(1)).unwrap();
        pump(&[&host, &member]).await;

        // Member pings the host: an 84-byte echo-request-sized frame.
        let request = ipv4_frame([10, 0, 0, 2], [10, 0, 0, 1], 84);
        member.tun.inject(&request);

        let mut delivered = None;
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                host.session.poll_once();
                if let Some(frame) = host.tun.try_written() {
                    delivered = Some(frame);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("frame should reach the host TUN");
        assert_eq!(&delivered.unwrap()[..], &request[..]);

        assert_eq!(member.bridge.stats().packets_sent, 1);
        assert_eq!(member.bridge.stats().bytes_sent, 84);
        assert_eq!(host.bridge.stats().packets_received, 1);
        assert_eq!(host.bridge.stats().bytes_received, 84);

        // And the reply comes back.
        let reply = ipv4_frame([10, 0, 0, 1], [10, 0, 0, 2], 84);
        host.tun.inject(&reply);

        let mut returned = None;
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                member.session.poll_once();
                if let Some(frame) = member.tun.try_written() {
                    returned = Some(frame);
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reply should reach the member TUN");
        assert_eq!(&returned.unwrap()[..], &reply[..]);
    }

    #[tokio::test]
    async fn frames_arrive_in_order() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;
        let member = spawn_peer(&hub, 2, "member", Role::Member, &config).await;
        member.session.connect_to_peer(PeerId(1)).unwrap();
        pump(&[&host, &member]).await;

        const COUNT: usize = 32;
        for i in 0..COUNT {
            let mut frame = ipv4_frame([10, 0, 0, 2], [10, 0, 0, 1], 40);
            frame[20] = i as u8;
            member.tun.inject(&frame);
        }

        let mut received = Vec::new();
        tokio::time::timeout(Duration::from_secs(3), async {
            while received.len() < COUNT {
                host.session.poll_once();
                while let Some(frame) = host.tun.try_written() {
                    received.push(frame);
                }
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("all frames should arrive");

        for (i, frame) in received.iter().enumerate() {
            assert_eq!(frame[20], i as u8, "frame {} out of order", i);
        }
    }

    #[tokio::test]
    async fn unknown_destination_is_dropped() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;
        let member = spawn_peer(&hub, 2, "member", Role::Member, &config).await;
        member.session.connect_to_peer(PeerId(1)).unwrap();
        pump(&[&host, &member]).await;

        member
            .tun
            .inject(&ipv4_frame([10, 0, 0, 2], [10, 0, 0, 99], 40));
        wait_for("drop counter", || {
            member.bridge.stats().packets_dropped == 1
        })
        .await;
        assert_eq!(member.bridge.stats().packets_sent, 0);

        pump(&[&host, &member]).await;
        assert!(host.tun.try_written().is_none());
    }

    #[tokio::test]
    async fn self_destined_frame_is_ignored_without_counting() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;

        host.tun
            .inject(&ipv4_frame([10, 0, 0, 1], [10, 0, 0, 1], 40));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(host.bridge.stats(), BridgeStats::default());
    }

    #[tokio::test]
    async fn empty_read_yields_without_counting() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;

        // A zero-length read means "nothing available"; the reader yields
        // and keeps going rather than treating it as traffic or an error.
        host.tun.inject(&[]);
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(host.bridge.stats(), BridgeStats::default());
        assert!(!host.bridge.is_degraded());
        assert_eq!(host.bridge.state(), BridgeState::Running);
    }

    #[tokio::test]
    async fn malformed_message_counts_one_drop() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;

        let routes_before = host.bridge.routes().len();
        // Declared length 16, payload empty.
        host.bridge
            .on_message(Bytes::from_static(&[0x01, 0x00, 0x10]), ConnectionHandle(7));

        assert_eq!(host.bridge.stats().packets_dropped, 1);
        assert_eq!(host.bridge.routes().len(), routes_before);
    }

    #[tokio::test]
    async fn unknown_message_type_is_ignored_silently() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;

        host.bridge
            .on_message(Bytes::from_static(&[0x09, 0x00, 0x00]), ConnectionHandle(7));
        assert_eq!(host.bridge.stats().packets_dropped, 0);
    }

    #[tokio::test]
    async fn ping_and_pong_are_ignored() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;

        host.bridge
            .on_message(VpnMessage::Ping.encode(), ConnectionHandle(7));
        host.bridge
            .on_message(VpnMessage::Pong.encode(), ConnectionHandle(7));
        assert_eq!(host.bridge.stats(), BridgeStats::default());
        assert_eq!(host.bridge.routes().len(), 1);
    }

    #[tokio::test]
    async fn member_ignores_join_callbacks() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let member = spawn_peer(&hub, 2, "member", Role::Member, &config).await;

        member.bridge.on_peer_joined(PeerId(9), ConnectionHandle(99));
        assert!(member.bridge.routes().is_empty());
    }

    #[tokio::test]
    async fn host_ignores_ip_assignment() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;

        host.bridge.on_message(
            VpnMessage::IpAssignment(Ipv4Addr::new(10, 0, 0, 50)).encode(),
            ConnectionHandle(7),
        );
        assert_eq!(host.bridge.local_ip(), Some(Ipv4Addr::new(10, 0, 0, 1)));
    }

    #[tokio::test]
    async fn departure_releases_the_address() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;
        let member = spawn_peer(&hub, 2, "member", Role::Member, &config).await;
        member.session.connect_to_peer(PeerId(1)).unwrap();
        pump(&[&host, &member]).await;
        assert_eq!(host.bridge.routes().len(), 2);

        let conn = member.session.connection_for(PeerId(1)).unwrap();
        hub.break_link(conn);
        pump(&[&host, &member]).await;

        // Both sides dropped the departed peer's route.
        assert_eq!(host.bridge.routes().len(), 1);
        assert_eq!(member.bridge.routes().len(), 1);

        // A later joiner is served from the cursor, not the released slot.
        let late = spawn_peer(&hub, 3, "late", Role::Member, &config).await;
        late.session.connect_to_peer(PeerId(1)).unwrap();
        pump(&[&host, &late]).await;
        assert_eq!(late.bridge.local_ip(), Some(Ipv4Addr::new(10, 0, 0, 3)));
    }

    #[tokio::test]
    async fn routes_converge_across_three_peers() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;
        let m1 = spawn_peer(&hub, 2, "m1", Role::Member, &config).await;
        let m2 = spawn_peer(&hub, 3, "m2", Role::Member, &config).await;

        // m1 enters the room and dials the host.
        m1.session.connect_to_peer(PeerId(1)).unwrap();
        pump(&[&host, &m1, &m2]).await;

        // m2 enters and, per the lobby contract, dials everyone already in.
        m2.session.handle_lobby_event(peerlan_network::LobbyEvent::Entered {
            members: vec![PeerId(1), PeerId(2), PeerId(3)],
        });
        pump(&[&host, &m1, &m2]).await;
        pump(&[&host, &m1, &m2]).await;

        // Everyone ends up with all three routes.
        for (peer, label) in [(&host, "host"), (&m1, "m1"), (&m2, "m2")] {
            assert_eq!(peer.bridge.routes().len(), 3, "{} table incomplete", label);
        }
        // m1 reaches m2 through the mesh link the lobby produced.
        let route = m1.bridge.routes().lookup(Ipv4Addr::new(10, 0, 0, 3)).unwrap();
        assert_eq!(route.peer, PeerId(3));
        assert!(route.conn.is_some());
    }

    #[tokio::test]
    async fn capacity_exhaustion_leaves_joiner_unserved() {
        let hub = LoopbackHub::new();
        let config = BridgeConfig {
            subnet: Ipv4Addr::new(10, 0, 0, 0),
            netmask: Ipv4Addr::new(255, 255, 255, 252),
            ..test_config()
        };
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;
        let m1 = spawn_peer(&hub, 2, "m1", Role::Member, &config).await;
        let m2 = spawn_peer(&hub, 3, "m2", Role::Member, &config).await;

        m1.session.connect_to_peer(PeerId(1)).unwrap();
        pump(&[&host, &m1, &m2]).await;
        m2.session.connect_to_peer(PeerId(1)).unwrap();
        pump(&[&host, &m1, &m2]).await;

        // The /30 had one spare address; m2 got nothing.
        assert_eq!(m1.bridge.local_ip(), Some(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(m2.bridge.local_ip(), None);
        assert_eq!(host.bridge.routes().len(), 2);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_restart_works() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;
        assert_eq!(host.bridge.state(), BridgeState::Running);

        // Starting a running bridge is reported.
        let (device, _handle) = memory_tun(TunConfig::default());
        assert!(matches!(
            host.bridge.start_with_device(Arc::new(device)).await,
            Err(CoreError::AlreadyRunning)
        ));

        host.bridge.stop().await.unwrap();
        assert_eq!(host.bridge.state(), BridgeState::Stopped);
        assert!(host.bridge.routes().is_empty());
        assert_eq!(host.bridge.local_ip(), None);
        assert_eq!(host.bridge.stats(), BridgeStats::default());

        // stop() again is a no-op.
        host.bridge.stop().await.unwrap();

        // And a fresh start succeeds.
        let (device, handle) = memory_tun(TunConfig::default());
        host.bridge.start_with_device(Arc::new(device)).await.unwrap();
        assert_eq!(host.bridge.state(), BridgeState::Running);
        assert_eq!(host.bridge.local_ip(), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert!(handle.is_up());
        host.bridge.stop().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_fails_start_and_stays_stopped() {
        let hub = LoopbackHub::new();
        let config = BridgeConfig {
            subnet: Ipv4Addr::new(10, 0, 0, 5),
            ..test_config()
        };
        let session = SessionManager::new(hub.endpoint(PeerId(1), "host"));
        let bridge = VpnBridge::new(session, config, Role::Host);

        let (device, _handle) = memory_tun(TunConfig::default());
        assert!(matches!(
            bridge.start_with_device(Arc::new(device)).await,
            Err(CoreError::Config(_))
        ));
        assert_eq!(bridge.state(), BridgeState::Stopped);
    }

    #[tokio::test]
    async fn fatal_tun_error_degrades_but_keeps_running() {
        let hub = LoopbackHub::new();
        let config = test_config();
        let host = spawn_peer(&hub, 1, "host", Role::Host, &config).await;

        // Closing the device out from under the reader is a fatal read error.
        let tun = host.bridge.tun.lock().unwrap().clone().unwrap();
        tun.close().await.unwrap();
        host.tun.inject(&[0u8; 4]); // wake the pending read

        wait_for("degraded flag", || host.bridge.is_degraded()).await;
        assert_eq!(host.bridge.state(), BridgeState::Running);

        host.bridge.stop().await.unwrap();
        assert!(!host.bridge.is_degraded());
    }
}
