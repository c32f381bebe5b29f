//! Scanner protocol: message model, wire constants, default ports.

use std::net::Ipv4Addr;

/// Every control datagram is exactly this long.
pub const MESSAGE_LEN: usize = 90;

/// Leading signature bytes. Datagrams without it are dropped silently.
pub const SIGNATURE: [u8; 3] = [0x55, 0x00, 0x00];

/// Request-type bytes for a discovery request.
pub const DISCOVERY_REQUEST: [u8; 3] = [0x5A, 0x00, 0x00];

/// Request-type bytes for a file-transfer request.
pub const TRANSFER_REQUEST: [u8; 3] = [0x5A, 0x54, 0x00];

/// Width of the originator name field.
pub const SRC_NAME_LEN: usize = 20;

/// Width of the target name field.
pub const DST_NAME_LEN: usize = 40;

/// Control plane (discovery + transfer negotiation).
pub const DEFAULT_UDP_PORT: u16 = 706;

/// Data plane (raw file bytes).
pub const DEFAULT_TCP_PORT: u16 = 708;

/// The two request types the protocol defines. Anything else is dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestKind {
    Discovery,
    Transfer,
}

impl RequestKind {
    pub fn wire_bytes(self) -> [u8; 3] {
        match self {
            RequestKind::Discovery => DISCOVERY_REQUEST,
            RequestKind::Transfer => TRANSFER_REQUEST,
        }
    }

    /// Map request-type bytes back to a kind. `None` for unknown types.
    pub fn from_wire(bytes: &[u8]) -> Option<RequestKind> {
        if bytes == DISCOVERY_REQUEST {
            Some(RequestKind::Discovery)
        } else if bytes == TRANSFER_REQUEST {
            Some(RequestKind::Transfer)
        } else {
            None
        }
    }
}

/// A parsed control message. Reserved fields are not represented: they are
/// zeroed on encode and ignored on decode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlMessage {
    pub request: RequestKind,
    /// IPv4 address of the originator, as claimed inside the message.
    pub initiator_ip: Ipv4Addr,
    /// Originator's logical name. Truncated to [`SRC_NAME_LEN`] on encode.
    pub src_name: String,
    /// Target's logical name. Truncated to [`DST_NAME_LEN`] on encode.
    pub dst_name: String,
}

impl ControlMessage {
    pub fn new(
        request: RequestKind,
        initiator_ip: Ipv4Addr,
        src_name: impl Into<String>,
        dst_name: impl Into<String>,
    ) -> Self {
        Self {
            request,
            initiator_ip,
            src_name: src_name.into(),
            dst_name: dst_name.into(),
        }
    }
}
