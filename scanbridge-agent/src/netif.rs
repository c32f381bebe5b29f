//! Network interface probe: which local IPv4 address this agent answers with.

use std::net::{Ipv4Addr, SocketAddr, UdpSocket};

/// What the probe resolves at startup. Tests construct this directly.
#[derive(Debug, Clone)]
pub struct InterfaceInfo {
    pub local_ip: Ipv4Addr,
    pub broadcast_ip: Ipv4Addr,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("no usable network interface: {0}")]
    Io(#[from] std::io::Error),
    #[error("default route is not IPv4")]
    NotIpv4,
}

/// Resolve the local address of the default route. Connecting a UDP socket
/// performs the routing lookup only; no packet leaves the host. The
/// broadcast address falls back to the limited broadcast since the netmask
/// is not recoverable this way.
pub fn probe() -> Result<InterfaceInfo, ProbeError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))?;
    socket.connect((Ipv4Addr::new(192, 0, 2, 1), 53))?;
    let local_ip = match socket.local_addr()? {
        SocketAddr::V4(addr) => *addr.ip(),
        SocketAddr::V6(_) => return Err(ProbeError::NotIpv4),
    };
    Ok(InterfaceInfo {
        local_ip,
        broadcast_ip: Ipv4Addr::BROADCAST,
        name: "default".to_string(),
    })
}

impl InterfaceInfo {
    /// Loopback identity, used by tests and single-host setups.
    pub fn loopback() -> Self {
        Self {
            local_ip: Ipv4Addr::LOCALHOST,
            broadcast_ip: Ipv4Addr::new(127, 255, 255, 255),
            name: "lo".to_string(),
        }
    }
}
