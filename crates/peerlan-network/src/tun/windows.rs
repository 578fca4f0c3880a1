//! Windows TUN device implementation using WinTun
//!
//! WinTun is the ring-buffer TUN driver used by WireGuard on Windows. It
//! requires wintun.dll next to the executable and administrator rights.
//!
//! Download wintun.dll from: https://www.wintun.net/

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{netmask_to_prefix, TunConfig, TunDevice};
use crate::error::{NetworkError, NetworkResult};

/// Ring buffer size for WinTun (4MB, must be a power of 2)
const RING_CAPACITY: u32 = 0x400000;

/// Windows TUN device using WinTun
pub struct WindowsTun {
    session: Arc<wintun::Session>,
    _adapter: Arc<wintun::Adapter>,
    name: String,
    mtu: u16,
    running: Arc<AtomicBool>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Bytes>>,
    recv_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WindowsTun {
    /// Create the adapter and start the ring-buffer session, unconfigured
    ///
    /// **Requirements:** administrator privileges and wintun.dll in the
    /// application directory or PATH.
    pub async fn open(config: TunConfig) -> NetworkResult<Self> {
        if !is_admin() {
            return Err(NetworkError::Tun(
                "administrator privileges required, run as Administrator".into(),
            ));
        }

        let wintun = unsafe { wintun::load() }.map_err(|e| {
            NetworkError::Tun(format!(
                "failed to load wintun.dll: {}. \
                 Download from https://www.wintun.net/ and place next to the executable.",
                e
            ))
        })?;

        // Drop any stale adapter with the same name
        let _ = wintun::Adapter::open(&wintun, &config.name);

        let adapter = wintun::Adapter::create(&wintun, &config.name, "peerlan", None)
            .map_err(|e| NetworkError::Tun(format!("failed to create adapter: {}", e)))?;

        let session = adapter
            .start_session(RING_CAPACITY)
            .map_err(|e| NetworkError::Tun(format!("failed to start session: {}", e)))?;
        let session = Arc::new(session);

        let running = Arc::new(AtomicBool::new(true));
        let (tx, rx) = mpsc::channel::<Bytes>(1000);
        let recv_task = spawn_receive_task(session.clone(), running.clone(), tx);

        info!("created WinTun adapter {} (mtu {})", config.name, config.mtu);

        Ok(Self {
            session,
            _adapter: adapter,
            name: config.name,
            mtu: config.mtu,
            running,
            rx: tokio::sync::Mutex::new(rx),
            recv_task: std::sync::Mutex::new(Some(recv_task)),
        })
    }
}

#[async_trait]
impl TunDevice for WindowsTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn configure(&self, addr: Ipv4Addr, netmask: Ipv4Addr) -> NetworkResult<()> {
        let output = Command::new("netsh")
            .args([
                "interface",
                "ip",
                "set",
                "address",
                &self.name,
                "static",
                &addr.to_string(),
                &netmask.to_string(),
            ])
            .output()
            .await?;

        if !output.status.success() {
            // netsh can race freshly created adapters; retry via PowerShell.
            let prefix = netmask_to_prefix(netmask);
            let ps_result = Command::new("powershell")
                .args([
                    "-Command",
                    &format!(
                        "New-NetIPAddress -InterfaceAlias '{}' -IPAddress {} -PrefixLength {} -ErrorAction SilentlyContinue",
                        self.name, addr, prefix
                    ),
                ])
                .output()
                .await?;

            if !ps_result.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(NetworkError::Tun(format!(
                    "failed to configure adapter address: {}",
                    stderr
                )));
            }
        }

        let _ = Command::new("netsh")
            .args([
                "interface",
                "ipv4",
                "set",
                "subinterface",
                &self.name,
                &format!("mtu={}", self.mtu),
                "store=persistent",
            ])
            .output()
            .await;

        info!("configured {} with {}/{}", self.name, addr, netmask);
        Ok(())
    }

    async fn set_up(&self) -> NetworkResult<()> {
        // The adapter is live once the WinTun session is started.
        debug!("adapter {} is up with the active session", self.name);
        Ok(())
    }

    async fn read(&self) -> NetworkResult<Bytes> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some(packet) => Ok(packet),
            None => Err(NetworkError::Tun("receive channel closed".into())),
        }
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<usize> {
        if !self.running.load(Ordering::Relaxed) {
            return Err(NetworkError::Tun("adapter is closed".into()));
        }

        let session = self.session.clone();
        let data = packet.to_vec();
        let len = packet.len();

        tokio::task::spawn_blocking(move || {
            let mut send_packet = session
                .allocate_send_packet(data.len() as u16)
                .map_err(|e| NetworkError::Tun(format!("failed to allocate packet: {}", e)))?;
            send_packet.bytes_mut().copy_from_slice(&data);
            session.send_packet(send_packet);
            Ok::<(), NetworkError>(())
        })
        .await
        .map_err(|e| NetworkError::Tun(format!("task join error: {}", e)))??;

        Ok(len)
    }

    async fn close(&self) -> NetworkResult<()> {
        debug!("closing WinTun adapter {}", self.name);
        self.running.store(false, Ordering::SeqCst);
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
        Ok(())
    }
}

impl Drop for WindowsTun {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Blocking thread parking on the driver's event handle, feeding frames
/// into the async side
fn spawn_receive_task(
    session: Arc<wintun::Session>,
    running: Arc<AtomicBool>,
    tx: mpsc::Sender<Bytes>,
) -> tokio::task::JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while running.load(Ordering::Relaxed) {
            match session.receive_blocking() {
                Ok(packet) => {
                    let bytes = Bytes::copy_from_slice(packet.bytes());
                    if tx.blocking_send(bytes).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    if running.load(Ordering::Relaxed) {
                        warn!("WinTun receive error: {}", e);
                    }
                    break;
                }
            }
        }
        debug!("WinTun receive task stopped");
    })
}

/// Check for Administrator privileges ('net session' requires them)
fn is_admin() -> bool {
    match std::process::Command::new("net").arg("session").output() {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}
