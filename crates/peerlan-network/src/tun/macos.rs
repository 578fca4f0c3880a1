//! macOS TUN device implementation

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::process::Command;
use tracing::{debug, info};

use super::{TunConfig, TunDevice};
use crate::error::{NetworkError, NetworkResult};

/// macOS TUN device (utun)
pub struct MacOsTun {
    reader: tokio::sync::Mutex<Option<ReadHalf<tun::AsyncDevice>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<tun::AsyncDevice>>>,
    name: String,
    mtu: u16,
}

impl MacOsTun {
    /// Create the device, unconfigured and administratively down
    pub async fn open(config: TunConfig) -> NetworkResult<Self> {
        let mut tun_config = tun::Configuration::default();

        if !config.name.is_empty() {
            tun_config.name(&config.name);
        }
        tun_config.mtu(config.mtu as i32);

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| NetworkError::Tun(format!("failed to create TUN device: {}", e)))?;

        let name = if config.name.is_empty() {
            "utun7".to_string()
        } else {
            config.name.clone()
        };
        info!("created TUN device {} (mtu {})", name, config.mtu);

        let (reader, writer) = tokio::io::split(device);
        Ok(Self {
            reader: tokio::sync::Mutex::new(Some(reader)),
            writer: tokio::sync::Mutex::new(Some(writer)),
            name,
            mtu: config.mtu,
        })
    }
}

#[async_trait]
impl TunDevice for MacOsTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn configure(&self, addr: Ipv4Addr, netmask: Ipv4Addr) -> NetworkResult<()> {
        // utun is point-to-point; use our own address as the peer.
        let output = Command::new("ifconfig")
            .args([
                &self.name,
                &addr.to_string(),
                &addr.to_string(),
                "netmask",
                &netmask.to_string(),
                "mtu",
                &self.mtu.to_string(),
            ])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::Tun(format!(
                "failed to configure {}: {}",
                self.name, stderr
            )));
        }

        info!("configured {} with {}/{}", self.name, addr, netmask);
        Ok(())
    }

    async fn set_up(&self) -> NetworkResult<()> {
        let output = Command::new("ifconfig")
            .args([&self.name, "up"])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::Tun(format!(
                "failed to bring up {}: {}",
                self.name, stderr
            )));
        }
        Ok(())
    }

    async fn read(&self) -> NetworkResult<Bytes> {
        let mut guard = self.reader.lock().await;
        let reader = guard
            .as_mut()
            .ok_or_else(|| NetworkError::Tun("device closed".into()))?;

        let mut buf = vec![0u8; self.mtu as usize + 4];
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| NetworkError::Tun(format!("failed to read from TUN: {}", e)))?;

        // utun prefixes every frame with a 4-byte address family; strip it.
        if n > 4 {
            Ok(Bytes::copy_from_slice(&buf[4..n]))
        } else {
            Ok(Bytes::new())
        }
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<usize> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| NetworkError::Tun("device closed".into()))?;

        // Prepend the 4-byte address family (AF_INET = 2).
        let mut buf = vec![0u8; packet.len() + 4];
        buf[3] = 2;
        buf[4..].copy_from_slice(packet);

        writer
            .write_all(&buf)
            .await
            .map_err(|e| NetworkError::Tun(format!("failed to write to TUN: {}", e)))?;
        Ok(packet.len())
    }

    async fn close(&self) -> NetworkResult<()> {
        debug!("closing TUN device {}", self.name);
        self.reader.lock().await.take();
        self.writer.lock().await.take();
        Ok(())
    }
}
