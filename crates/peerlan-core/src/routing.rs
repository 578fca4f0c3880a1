//! Routing table
//!
//! Maps virtual addresses to the peers that own them. One mutex guards the
//! map; lookups and mutations are short and the lock is never held across
//! overlay sends or TUN I/O.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;

use peerlan_network::{ConnectionHandle, PeerId};

/// One row of the routing table
#[derive(Debug, Clone)]
pub struct RouteEntry {
    /// Owning peer
    pub peer: PeerId,

    /// Live overlay connection to the peer; unset for the local entry
    pub conn: Option<ConnectionHandle>,

    /// The peer's virtual address
    pub addr: Ipv4Addr,

    /// Display name from the rendezvous service
    pub display_name: String,

    /// True for the single entry describing this machine
    pub is_local: bool,
}

/// Virtual address -> route entry, one per participating peer
#[derive(Default)]
pub struct RoutingTable {
    entries: Mutex<HashMap<Ipv4Addr, RouteEntry>>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an entry, replacing any prior route for the same address.
    pub fn insert(&self, entry: RouteEntry) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(entry.addr, entry);
    }

    /// Route for a destination address.
    pub fn lookup(&self, addr: Ipv4Addr) -> Option<RouteEntry> {
        let entries = self.entries.lock().unwrap();
        entries.get(&addr).cloned()
    }

    /// Remove the entry owned by `peer`, returning its address.
    pub fn remove_by_peer(&self, peer: PeerId) -> Option<Ipv4Addr> {
        let mut entries = self.entries.lock().unwrap();
        let addr = entries
            .values()
            .find(|entry| entry.peer == peer)
            .map(|entry| entry.addr)?;
        entries.remove(&addr);
        Some(addr)
    }

    /// Copy of every entry, in no particular order.
    pub fn snapshot(&self) -> Vec<RouteEntry> {
        let entries = self.entries.lock().unwrap();
        entries.values().cloned().collect()
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().unwrap().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(peer: u64, addr: [u8; 4], is_local: bool) -> RouteEntry {
        RouteEntry {
            peer: PeerId(peer),
            conn: (!is_local).then_some(ConnectionHandle(peer as u32)),
            addr: Ipv4Addr::from(addr),
            display_name: format!("peer-{}", peer),
            is_local,
        }
    }

    #[test]
    fn insert_and_lookup() {
        let table = RoutingTable::new();
        table.insert(entry(1, [10, 0, 0, 1], true));
        table.insert(entry(2, [10, 0, 0, 2], false));

        let found = table.lookup(Ipv4Addr::new(10, 0, 0, 2)).unwrap();
        assert_eq!(found.peer, PeerId(2));
        assert!(!found.is_local);
        assert!(table.lookup(Ipv4Addr::new(10, 0, 0, 9)).is_none());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn insert_overwrites_same_address() {
        let table = RoutingTable::new();
        table.insert(entry(2, [10, 0, 0, 2], false));
        table.insert(entry(3, [10, 0, 0, 2], false));

        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup(Ipv4Addr::new(10, 0, 0, 2)).unwrap().peer, PeerId(3));
    }

    #[test]
    fn remove_by_peer() {
        let table = RoutingTable::new();
        table.insert(entry(1, [10, 0, 0, 1], true));
        table.insert(entry(2, [10, 0, 0, 2], false));

        assert_eq!(
            table.remove_by_peer(PeerId(2)),
            Some(Ipv4Addr::new(10, 0, 0, 2))
        );
        assert_eq!(table.remove_by_peer(PeerId(2)), None);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn snapshot_and_clear() {
        let table = RoutingTable::new();
        table.insert(entry(1, [10, 0, 0, 1], true));
        table.insert(entry(2, [10, 0, 0, 2], false));

        let snapshot = table.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot.iter().filter(|e| e.is_local).count(), 1);

        table.clear();
        assert!(table.is_empty());
    }
}
