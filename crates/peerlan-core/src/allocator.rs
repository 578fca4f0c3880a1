//! Virtual address allocator
//!
//! Lives on the host peer only. Hands out unique addresses from the
//! configured subnet in numerical order, skipping the network and broadcast
//! addresses. The cursor never wraps: once it passes the top of the range,
//! allocation fails even if released addresses exist below it.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use crate::error::{CoreError, CoreResult};

struct AllocatorState {
    next: u32,
    in_use: HashSet<u32>,
}

/// Sequential allocator over one IPv4 subnet
pub struct AddressAllocator {
    base: u32,
    mask: u32,
    state: Mutex<AllocatorState>,
}

impl AddressAllocator {
    /// Set up the pool for `subnet`/`netmask`, reserving the first usable
    /// address for the host itself.
    pub fn new(subnet: Ipv4Addr, netmask: Ipv4Addr) -> Self {
        let base = u32::from(subnet);
        let host = base + 1;
        Self {
            base,
            mask: u32::from(netmask),
            state: Mutex::new(AllocatorState {
                next: host,
                in_use: HashSet::from([host]),
            }),
        }
    }

    /// The host's own reserved address (network + 1).
    pub fn host_addr(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.base + 1)
    }

    /// Hand out the lowest acceptable address at or above the cursor.
    pub fn allocate(&self) -> CoreResult<Ipv4Addr> {
        let mut state = self.state.lock().unwrap();
        let broadcast = self.base | !self.mask;

        while state.next < broadcast {
            let candidate = state.next;
            state.next += 1;

            let host_bits = candidate & !self.mask;
            if host_bits == 0 || host_bits == !self.mask {
                continue;
            }
            if state.in_use.contains(&candidate) {
                continue;
            }

            state.in_use.insert(candidate);
            return Ok(Ipv4Addr::from(candidate));
        }

        Err(CoreError::AddressPoolExhausted)
    }

    /// Return an address to the pool. The cursor is not rewound.
    pub fn release(&self, addr: Ipv4Addr) {
        let mut state = self.state.lock().unwrap();
        state.in_use.remove(&u32::from(addr));
    }

    /// Number of addresses currently handed out (the host's included).
    pub fn in_use(&self) -> usize {
        self.state.lock().unwrap().in_use.len()
    }
}
