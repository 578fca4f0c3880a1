//! Bridge configuration

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Configuration of the virtual subnet and its TUN device
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// TUN device name; empty lets the platform choose
    pub tun_name: String,

    /// Network address of the virtual subnet (host bits zero)
    pub subnet: Ipv4Addr,

    /// Subnet mask (contiguous prefix)
    pub netmask: Ipv4Addr,

    /// MTU for the virtual interface
    pub mtu: u16,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            tun_name: "peerlan0".to_string(),
            subnet: Ipv4Addr::new(10, 77, 0, 0),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            mtu: peerlan_network::DEFAULT_MTU,
        }
    }
}

impl BridgeConfig {
    /// Validate the arguments before the bridge touches the system.
    pub fn validate(&self) -> CoreResult<()> {
        let mask = u32::from(self.netmask);
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(CoreError::Config(format!(
                "netmask {} is not a contiguous prefix",
                self.netmask
            )));
        }

        let subnet = u32::from(self.subnet);
        if subnet & !mask != 0 {
            return Err(CoreError::Config(format!(
                "subnet {} has host bits set for mask {}",
                self.subnet, self.netmask
            )));
        }

        // Room for network, broadcast, the host, and at least one member.
        if !mask < 3 {
            return Err(CoreError::Config(format!(
                "subnet {}/{} holds fewer than two usable addresses",
                self.subnet, self.netmask
            )));
        }

        if !(576..=9000).contains(&self.mtu) {
            return Err(CoreError::Config(format!("MTU {} out of range", self.mtu)));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(BridgeConfig::default().validate().is_ok());
    }

    #[test]
    fn non_contiguous_mask_rejected() {
        let config = BridgeConfig {
            netmask: Ipv4Addr::new(255, 0, 255, 0),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn host_bits_in_subnet_rejected() {
        let config = BridgeConfig {
            subnet: Ipv4Addr::new(10, 77, 0, 5),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn tiny_subnet_rejected() {
        let config = BridgeConfig {
            subnet: Ipv4Addr::new(10, 77, 0, 0),
            netmask: Ipv4Addr::new(255, 255, 255, 254),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn slash_30_is_enough() {
        let config = BridgeConfig {
            subnet: Ipv4Addr::new(10, 77, 0, 0),
            netmask: Ipv4Addr::new(255, 255, 255, 252),
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn mtu_bounds() {
        let low = BridgeConfig {
            mtu: 100,
            ..Default::default()
        };
        assert!(low.validate().is_err());
        let high = BridgeConfig {
            mtu: 9500,
            ..Default::default()
        };
        assert!(high.validate().is_err());
    }
}
