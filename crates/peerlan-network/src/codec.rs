//! VPN message codec
//!
//! Wire format (multi-byte integers big-endian unless noted):
//! [Type: 1 byte][Length: 2 bytes][Payload: Length bytes]
//!
//! The length field covers the payload only, never the 3-byte header.

use std::net::Ipv4Addr;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NetworkError, NetworkResult};
use crate::overlay::PeerId;

/// Message type identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Raw IPv4 datagram for the receiver's TUN device
    Data = 1,

    /// Host assigns a virtual address to the receiving peer
    IpAssignment = 2,

    /// Full routing snapshot, host to everyone
    RouteUpdate = 3,

    /// Keep-alive probe (reserved)
    Ping = 4,

    /// Keep-alive reply (reserved)
    Pong = 5,
}

impl MessageType {
    /// Returns `None` for tags this version does not know. Unknown tags are
    /// tolerated so older peers can talk to newer ones.
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(Self::Data),
            2 => Some(Self::IpAssignment),
            3 => Some(Self::RouteUpdate),
            4 => Some(Self::Ping),
            5 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// One row of a `RouteUpdate` payload.
///
/// On the wire each record is 12 bytes: the 8-byte peer identity in
/// little-endian (as the overlay hands it over) followed by the 4-byte
/// address in network order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteRecord {
    pub peer: PeerId,
    pub addr: Ipv4Addr,
}

/// Size of one encoded `RouteRecord`
pub const ROUTE_RECORD_SIZE: usize = 12;

/// Size of the message header
pub const HEADER_SIZE: usize = 3;

/// A message carried over one overlay connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VpnMessage {
    /// An opaque IPv4 datagram destined for the receiver's TUN
    Data(Bytes),

    /// Host -> joining peer, unicast
    IpAssignment(Ipv4Addr),

    /// Host -> all, full snapshot of the routing table
    RouteUpdate(Vec<RouteRecord>),

    Ping,
    Pong,
}

impl VpnMessage {
    /// Serialize into a single overlay message.
    pub fn encode(&self) -> Bytes {
        let (tag, payload_len) = match self {
            Self::Data(payload) => (MessageType::Data, payload.len()),
            Self::IpAssignment(_) => (MessageType::IpAssignment, 4),
            Self::RouteUpdate(records) => {
                (MessageType::RouteUpdate, records.len() * ROUTE_RECORD_SIZE)
            }
            Self::Ping => (MessageType::Ping, 0),
            Self::Pong => (MessageType::Pong, 0),
        };

        let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload_len);
        buf.put_u8(tag as u8);
        buf.put_u16(payload_len as u16);

        match self {
            Self::Data(payload) => buf.put_slice(payload),
            Self::IpAssignment(addr) => buf.put_slice(&addr.octets()),
            Self::RouteUpdate(records) => {
                for record in records {
                    buf.put_u64_le(record.peer.0);
                    buf.put_slice(&record.addr.octets());
                }
            }
            Self::Ping | Self::Pong => {}
        }

        buf.freeze()
    }

    /// Parse one overlay message.
    ///
    /// Returns `Ok(None)` for an unknown type tag (accepted and ignored).
    /// Bytes past the declared length are tolerated; a declared length that
    /// overruns the buffer is a protocol error.
    pub fn decode(data: &[u8]) -> NetworkResult<Option<Self>> {
        if data.len() < HEADER_SIZE {
            return Err(NetworkError::Protocol(format!(
                "message too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let tag = buf.get_u8();
        let declared = buf.get_u16() as usize;

        if declared > buf.remaining() {
            return Err(NetworkError::Protocol(format!(
                "declared payload {} exceeds received {}",
                declared,
                buf.remaining()
            )));
        }

        let payload = &buf[..declared];

        let message = match MessageType::from_tag(tag) {
            None => return Ok(None),
            Some(MessageType::Data) => Self::Data(Bytes::copy_from_slice(payload)),
            Some(MessageType::IpAssignment) => {
                if payload.len() < 4 {
                    return Err(NetworkError::Protocol(format!(
                        "IP assignment payload too short: {} bytes",
                        payload.len()
                    )));
                }
                Self::IpAssignment(Ipv4Addr::new(payload[0], payload[1], payload[2], payload[3]))
            }
            Some(MessageType::RouteUpdate) => {
                let mut records = Vec::with_capacity(payload.len() / ROUTE_RECORD_SIZE);
                let mut cursor = payload;
                while cursor.len() >= ROUTE_RECORD_SIZE {
                    let peer = PeerId(cursor.get_u64_le());
                    let addr = Ipv4Addr::new(cursor[0], cursor[1], cursor[2], cursor[3]);
                    cursor.advance(4);
                    records.push(RouteRecord { peer, addr });
                }
                Self::RouteUpdate(records)
            }
            Some(MessageType::Ping) => Self::Ping,
            Some(MessageType::Pong) => Self::Pong,
        };

        Ok(Some(message))
    }
}
