//! In-process TUN device
//!
//! A channel-backed [`TunDevice`] with the same contract as the platform
//! backends. The paired [`MemoryTunHandle`] plays the host OS: it injects
//! frames for the bridge to read and observes frames the bridge writes.
//! Used by the test suites and the demo binary.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::debug;

use super::{TunConfig, TunDevice};
use crate::error::{NetworkError, NetworkResult};

#[derive(Default)]
struct Shared {
    address: Mutex<Option<(Ipv4Addr, Ipv4Addr)>>,
    up: AtomicBool,
    closed: AtomicBool,
}

/// Create a memory TUN plus its OS-side handle.
pub fn memory_tun(config: TunConfig) -> (MemoryTun, MemoryTunHandle) {
    let (inject_tx, inject_rx) = mpsc::unbounded_channel();
    let (written_tx, written_rx) = mpsc::unbounded_channel();
    let shared = Arc::new(Shared::default());

    let device = MemoryTun {
        name: config.name,
        mtu: config.mtu,
        inbound: tokio::sync::Mutex::new(inject_rx),
        outbound: written_tx,
        shared: shared.clone(),
    };
    let handle = MemoryTunHandle {
        inject_tx,
        written_rx: tokio::sync::Mutex::new(written_rx),
        shared,
    };
    (device, handle)
}

/// The device side handed to the bridge.
pub struct MemoryTun {
    name: String,
    mtu: u16,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
}

#[async_trait]
impl TunDevice for MemoryTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn configure(&self, addr: Ipv4Addr, netmask: Ipv4Addr) -> NetworkResult<()> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(NetworkError::Tun("device closed".into()));
        }
        *self.shared.address.lock().unwrap() = Some((addr, netmask));
        Ok(())
    }

    async fn set_up(&self) -> NetworkResult<()> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(NetworkError::Tun("device closed".into()));
        }
        self.shared.up.store(true, Ordering::Relaxed);
        Ok(())
    }

    async fn read(&self) -> NetworkResult<Bytes> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(NetworkError::Tun("device closed".into()));
        }
        let mut inbound = self.inbound.lock().await;
        match inbound.recv().await {
            Some(frame) => Ok(frame),
            None => Err(NetworkError::Tun("device closed".into())),
        }
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<usize> {
        if self.shared.closed.load(Ordering::Relaxed) {
            return Err(NetworkError::Tun("device closed".into()));
        }
        self.outbound
            .send(Bytes::copy_from_slice(packet))
            .map_err(|_| NetworkError::Tun("device closed".into()))?;
        Ok(packet.len())
    }

    async fn close(&self) -> NetworkResult<()> {
        debug!("closing memory TUN {}", self.name);
        self.shared.closed.store(true, Ordering::Relaxed);
        self.shared.up.store(false, Ordering::Relaxed);
        Ok(())
    }
}

/// The OS side of a memory TUN.
pub struct MemoryTunHandle {
    inject_tx: mpsc::UnboundedSender<Bytes>,
    written_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Bytes>>,
    shared: Arc<Shared>,
}

impl MemoryTunHandle {
    /// Queue a frame for the device's next `read`.
    pub fn inject(&self, frame: &[u8]) {
        let _ = self.inject_tx.send(Bytes::copy_from_slice(frame));
    }

    /// Await the next frame the bridge wrote to the device.
    pub async fn written(&self) -> Option<Bytes> {
        self.written_rx.lock().await.recv().await
    }

    /// Non-blocking look at the next written frame.
    pub fn try_written(&self) -> Option<Bytes> {
        self.written_rx.try_lock().ok()?.try_recv().ok()
    }

    /// Address and netmask applied via `configure`, if any.
    pub fn address(&self) -> Option<(Ipv4Addr, Ipv4Addr)> {
        *self.shared.address.lock().unwrap()
    }

    pub fn is_up(&self) -> bool {
        self.shared.up.load(Ordering::Relaxed)
    }
}
