//! Core type definitions and protocol constants for the weft overlay.

use crate::frame::FrameError;

/// A 20-byte identifier of a peer endpoint in the overlay.
pub type DeviceId = [u8; 20];

/// A 20-byte on-chain address (fleet contracts and the like).
pub type Address = [u8; 20];

/// RPC method names understood by relay nodes.
pub mod method {
    /// Latest block height known to the node.
    pub const GET_BLOCK_PEAK: &str = "getblockpeak";
    /// Block header by number, unverified by the node.
    pub const GET_BLOCK_HEADER: &str = "getblockheader";
    /// On-chain access predicate for a fleet/device pair.
    pub const IS_ACCESS_WHITELISTED: &str = "isaccesswhitelisted";
    /// Open a logical stream to a remote device's port.
    pub const PORT_OPEN: &str = "portopen";
    /// Resolve an overlay name to device tickets.
    pub const RESOLVE_BNS: &str = "resolvebns";
    /// Submit a traffic accounting ticket.
    pub const TICKET: &str = "ticket";
}

/// A block header as exchanged with relay nodes.
///
/// The ledger store only accepts a header whose `parent` equals the hash
/// of the previous stored header, which is what keeps the local chain a
/// contiguous prefix of the canonical one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block height.
    pub number: u64,
    /// Hash of this block.
    pub hash: [u8; 32],
    /// Hash of the parent block.
    pub parent: [u8; 32],
}

/// Encoded size of a [`BlockHeader`] in RPC bodies.
pub const BLOCK_HEADER_LEN: usize = 8 + 32 + 32;

impl BlockHeader {
    /// Serializes the header for an RPC body.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut v = Vec::with_capacity(BLOCK_HEADER_LEN);
        v.extend_from_slice(&self.number.to_be_bytes());
        v.extend_from_slice(&self.hash);
        v.extend_from_slice(&self.parent);
        v
    }

    /// Parses a header from an RPC body.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooShort`] if the body is not exactly
    /// [`BLOCK_HEADER_LEN`] bytes.
    pub fn parse(data: &[u8]) -> Result<Self, FrameError> {
        if data.len() != BLOCK_HEADER_LEN {
            return Err(FrameError::TooShort {
                expected: BLOCK_HEADER_LEN,
                actual: data.len(),
            });
        }
        Ok(Self {
            number: u64::from_be_bytes(data[..8].try_into().expect("length checked")),
            hash: data[8..40].try_into().expect("length checked"),
            parent: data[40..72].try_into().expect("length checked"),
        })
    }
}

/// A resolved name entry: a device and the relay node it is connected to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceTicket {
    /// The device the name resolves to.
    pub device_id: DeviceId,
    /// Address of the relay node currently serving the device.
    pub node: String,
}

impl DeviceTicket {
    /// Appends the wire encoding of this ticket to `out`.
    pub fn encode_into(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.device_id);
        let node = self.node.as_bytes();
        let len = node.len().min(u8::MAX as usize);
        out.push(len as u8);
        out.extend_from_slice(&node[..len]);
    }

    /// Parses a `resolvebns` response body into a list of tickets.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::TooShort`] when the body is truncated.
    pub fn parse_list(data: &[u8]) -> Result<Vec<Self>, FrameError> {
        let too_short = |expected| FrameError::TooShort {
            expected,
            actual: data.len(),
        };
        if data.len() < 2 {
            return Err(too_short(2));
        }
        let count = u16::from_be_bytes([data[0], data[1]]) as usize;
        let mut tickets = Vec::with_capacity(count);
        let mut at = 2;
        for _ in 0..count {
            if data.len() < at + 21 {
                return Err(too_short(at + 21));
            }
            let device_id: DeviceId = data[at..at + 20].try_into().expect("length checked");
            let node_len = data[at + 20] as usize;
            at += 21;
            if data.len() < at + node_len {
                return Err(too_short(at + node_len));
            }
            let node = String::from_utf8_lossy(&data[at..at + node_len]).into_owned();
            at += node_len;
            tickets.push(Self { device_id, node });
        }
        Ok(tickets)
    }

    /// Encodes a list of tickets as a `resolvebns` response body.
    #[must_use]
    pub fn encode_list(tickets: &[Self]) -> Vec<u8> {
        let mut out = Vec::new();
        let count = tickets.len().min(u16::MAX as usize);
        out.extend_from_slice(&(count as u16).to_be_bytes());
        for ticket in &tickets[..count] {
            ticket.encode_into(&mut out);
        }
        out
    }
}
