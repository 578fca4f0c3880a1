//! Linux TUN device implementation

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::process::Command;
use tracing::{debug, info};

use super::{netmask_to_prefix, TunConfig, TunDevice};
use crate::error::{NetworkError, NetworkResult};

/// Linux TUN device
pub struct LinuxTun {
    reader: tokio::sync::Mutex<Option<ReadHalf<tun::AsyncDevice>>>,
    writer: tokio::sync::Mutex<Option<WriteHalf<tun::AsyncDevice>>>,
    name: String,
    mtu: u16,
}

impl LinuxTun {
    /// Create the device, unconfigured and administratively down
    pub async fn open(config: TunConfig) -> NetworkResult<Self> {
        let mut tun_config = tun::Configuration::default();

        if !config.name.is_empty() {
            tun_config.name(&config.name);
        }
        tun_config.mtu(config.mtu as i32);

        // Raw IPv4 frames, no packet-info header
        tun_config.platform(|platform| {
            platform.packet_information(false);
        });

        let device = tun::create_as_async(&tun_config)
            .map_err(|e| NetworkError::Tun(format!("failed to create TUN device: {}", e)))?;

        let name = if config.name.is_empty() {
            "tun0".to_string()
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
impl TunDevice for LinuxTun {
    fn name(&self) -> &str {
        &self.name
    }

    fn mtu(&self) -> u16 {
        self.mtu
    }

    async fn configure(&self, addr: Ipv4Addr, netmask: Ipv4Addr) -> NetworkResult<()> {
        let prefix = netmask_to_prefix(netmask);

        let output = Command::new("ip")
            .args([
                "addr",
                "add",
                &format!("{}/{}", addr, prefix),
                "dev",
                &self.name,
            ])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::Tun(format!(
                "failed to set address on {}: {}",
                self.name, stderr
            )));
        }

        let output = Command::new("ip")
            .args(["link", "set", &self.name, "mtu", &self.mtu.to_string()])
            .output()
            .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetworkError::Tun(format!(
                "failed to set MTU on {}: {}",
                self.name, stderr
            )));
        }

        info!("configured {} with {}/{}", self.name, addr, prefix);
        Ok(())
    }

    async fn set_up(&self) -> NetworkResult<()> {
        let output = Command::new("ip")
            .args(["link", "set", &self.name, "up"])
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

        buf.truncate(n);
        Ok(Bytes::from(buf))
    }

    async fn write(&self, packet: &[u8]) -> NetworkResult<usize> {
        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| NetworkError::Tun("device closed".into()))?;

        let n = writer
            .write(packet)
            .await
            .map_err(|e| NetworkError::Tun(format!("failed to write to TUN: {}", e)))?;
        Ok(n)
    }

    async fn close(&self) -> NetworkResult<()> {
        debug!("closing TUN device {}", self.name);
        self.reader.lock().await.take();
        self.writer.lock().await.take();
        Ok(())
    }
}
