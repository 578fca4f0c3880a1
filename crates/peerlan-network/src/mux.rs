//! TCP tunnel multiplex framing
//!
//! The TCP relay shares overlay connections with the VPN datapath but never
//! enters it; only its wire format lives here.
//!
//! Wire format (little-endian):
//! [Client ID: 4 bytes][Kind: 4 bytes][Payload: rest, data frames only]

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{NetworkError, NetworkResult};

/// Size of the frame header
pub const FRAME_HEADER_SIZE: usize = 8;

const KIND_DATA: u32 = 0;
const KIND_DISCONNECT: u32 = 1;

/// One frame of a multiplexed TCP stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelFrame {
    /// A slice of stream payload for one relayed client
    Data { client_id: u32, payload: Bytes },

    /// The relayed client hung up
    Disconnect { client_id: u32 },
}

impl TunnelFrame {
    pub fn client_id(&self) -> u32 {
        match self {
            Self::Data { client_id, .. } | Self::Disconnect { client_id } => *client_id,
        }
    }

    /// Serialize into a single overlay message.
    pub fn encode(&self) -> Bytes {
        match self {
            Self::Data { client_id, payload } => {
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE + payload.len());
                buf.put_u32_le(*client_id);
                buf.put_u32_le(KIND_DATA);
                buf.put_slice(payload);
                buf.freeze()
            }
            Self::Disconnect { client_id } => {
                let mut buf = BytesMut::with_capacity(FRAME_HEADER_SIZE);
                buf.put_u32_le(*client_id);
                buf.put_u32_le(KIND_DISCONNECT);
                buf.freeze()
            }
        }
    }

    /// Parse one overlay message.
    pub fn decode(data: &[u8]) -> NetworkResult<Self> {
        if data.len() < FRAME_HEADER_SIZE {
            return Err(NetworkError::Protocol(format!(
                "tunnel frame too short: {} bytes",
                data.len()
            )));
        }

        let mut buf = data;
        let client_id = buf.get_u32_le();
        let kind = buf.get_u32_le();

        match kind {
            KIND_DATA => Ok(Self::Data {
                client_id,
                payload: Bytes::copy_from_slice(buf),
            }),
            KIND_DISCONNECT => Ok(Self::Disconnect { client_id }),
            other => Err(NetworkError::Protocol(format!(
                "unknown tunnel frame kind {}",
                other
            ))),
        }
    }
}

/// Hands out relayed-client ids.
///
/// The low byte is the first byte on the wire; ids whose low byte falls in
/// the VPN message tag range 1..=5 are skipped so the two frame families
/// stay distinguishable on a shared connection.
#[derive(Debug)]
pub struct ClientIdAllocator {
    next: u32,
}

impl ClientIdAllocator {
    pub fn new() -> Self {
        Self { next: 6 }
    }

    pub fn next_id(&mut self) -> u32 {
        loop {
            let id = self.next;
            self.next = self.next.wrapping_add(1);
            if !(1..=5).contains(&(id & 0xFF)) && id != 0 {
                return id;
            }
        }
    }
}

impl Default for ClientIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}
