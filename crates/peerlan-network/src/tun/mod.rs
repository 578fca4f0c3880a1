//! TUN Device Abstraction
//!
//! Platform-agnostic TUN device interface with implementations for:
//! - Linux (using tun crate)
//! - Windows (using wintun)
//! - macOS (using tun crate, utun)
//!
//! Devices are opened unconfigured: address and netmask are applied with
//! [`TunDevice::configure`] once known (non-host peers learn their virtual
//! IP mid-session). Every backend exchanges bare IPv4 frames; the macOS
//! address-family prefix never leaves the backend.

use std::net::Ipv4Addr;

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::NetworkResult;

#[cfg(target_os = "linux")]
mod linux;
#[cfg(target_os = "linux")]
pub use linux::LinuxTun;

#[cfg(target_os = "windows")]
mod windows;
#[cfg(target_os = "windows")]
pub use windows::WindowsTun;

#[cfg(target_os = "macos")]
mod macos;
#[cfg(target_os = "macos")]
pub use macos::MacOsTun;

pub mod memory;
pub use memory::{memory_tun, MemoryTun, MemoryTunHandle};

/// TUN device configuration
#[derive(Clone, Debug)]
pub struct TunConfig {
    /// Device name. On macOS this must be of the form `utunN`; platforms
    /// that assign names may ignore it.
    pub name: String,

    /// Maximum transmission unit, applied together with the address
    pub mtu: u16,
}

impl Default for TunConfig {
    fn default() -> Self {
        Self {
            name: "peerlan0".to_string(),
            mtu: crate::DEFAULT_MTU,
        }
    }
}

/// Platform-agnostic TUN device trait
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Get device name (non-empty once the device is open)
    fn name(&self) -> &str;

    /// Get device MTU
    fn mtu(&self) -> u16;

    /// Apply the interface address and netmask, plus the MTU captured at
    /// open time
    async fn configure(&self, addr: Ipv4Addr, netmask: Ipv4Addr) -> NetworkResult<()>;

    /// Bring the interface administratively up
    async fn set_up(&self) -> NetworkResult<()>;

    /// Read one IPv4 frame from the device
    async fn read(&self) -> NetworkResult<Bytes>;

    /// Write one IPv4 frame; returns the payload bytes accepted (0 on a
    /// transient buffer-full condition)
    async fn write(&self, packet: &[u8]) -> NetworkResult<usize>;

    /// Close the device. Idempotent; reads and writes fail afterwards.
    async fn close(&self) -> NetworkResult<()>;
}

/// Create a TUN device for the current platform
pub async fn open_tun(config: TunConfig) -> NetworkResult<Box<dyn TunDevice>> {
    #[cfg(target_os = "linux")]
    {
        let tun = LinuxTun::open(config).await?;
        Ok(Box::new(tun))
    }

    #[cfg(target_os = "windows")]
    {
        let tun = WindowsTun::open(config).await?;
        Ok(Box::new(tun))
    }

    #[cfg(target_os = "macos")]
    {
        let tun = MacOsTun::open(config).await?;
        Ok(Box::new(tun))
    }

    #[cfg(not(any(target_os = "linux", target_os = "windows", target_os = "macos")))]
    {
        let _ = config;
        Err(crate::error::NetworkError::PlatformNotSupported)
    }
}

/// Count the leading ones of a contiguous netmask
#[allow(dead_code)]
pub(crate) fn netmask_to_prefix(netmask: Ipv4Addr) -> u8 {
    u32::from(netmask).count_ones() as u8
}

/// IPv4 header utilities
pub mod ipv4 {
    use std::net::Ipv4Addr;

    /// Minimum IPv4 header length
    pub const MIN_HEADER_LEN: usize = 20;

    fn is_ipv4(packet: &[u8]) -> bool {
        packet.len() >= MIN_HEADER_LEN && packet[0] >> 4 == 4
    }

    /// Destination address of an IPv4 packet (bytes 16..19, network order).
    /// `None` for short or non-IPv4 inputs.
    pub fn destination(packet: &[u8]) -> Option<Ipv4Addr> {
        if !is_ipv4(packet) {
            return None;
        }
        Some(Ipv4Addr::new(
            packet[16], packet[17], packet[18], packet[19],
        ))
    }

    /// Source address of an IPv4 packet (bytes 12..15, network order).
    /// `None` for short or non-IPv4 inputs.
    pub fn source(packet: &[u8]) -> Option<Ipv4Addr> {
        if !is_ipv4(packet) {
            return None;
        }
        Some(Ipv4Addr::new(
            packet[12], packet[13], packet[14], packet[15],
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ipv4_frame(src: [u8; 4], dst: [u8; 4]) -> Vec<u8> {
        let mut frame = vec![0u8; 28];
        frame[0] = 0x45; // version 4, IHL 5
        frame[12..16].copy_from_slice(&src);
        frame[16..20].copy_from_slice(&dst);
        frame
    }

    #[test]
    fn destination_extraction() {
        let frame = ipv4_frame([10, 0, 0, 2], [10, 0, 0, 1]);
        assert_eq!(ipv4::destination(&frame), Some(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(ipv4::source(&frame), Some(Ipv4Addr::new(10, 0, 0, 2)));
    }

    #[test]
    fn short_frame_has_no_destination() {
        assert_eq!(ipv4::destination(&[0x45; 19]), None);
        assert_eq!(ipv4::destination(&[]), None);
    }

    #[test]
    fn non_ipv4_has_no_destination() {
        let mut frame = ipv4_frame([1, 1, 1, 1], [2, 2, 2, 2]);
        frame[0] = 0x60; // IPv6 version nibble
        assert_eq!(ipv4::destination(&frame), None);
        assert_eq!(ipv4::source(&frame), None);
    }

    #[test]
    fn netmask_prefix() {
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 255, 0)), 24);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 255, 0, 0)), 16);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(255, 0, 0, 0)), 8);
        assert_eq!(netmask_to_prefix(Ipv4Addr::new(0, 0, 0, 0)), 0);
    }
}
