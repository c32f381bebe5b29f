//! UDP control endpoint: classify inbound datagrams, answer discovery,
//! arm transfers.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use scanbridge_core::{wire, AgentIdentity, RequestKind};
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info};

use crate::agent::AgentEvent;
use crate::pending::PendingTransfers;

/// Receive buffer. Control datagrams are exactly 90 bytes; anything that
/// does not fit gets truncated by the kernel and rejected by the decoder.
const RECV_BUF: usize = 1024;

/// Bind the control socket with SO_REUSEADDR and SO_BROADCAST set.
pub fn bind_control_socket(port: u16) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_broadcast(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    UdpSocket::from_std(socket.into())
}

/// Control-plane read loop. Exits when `shutdown` flips or the socket dies.
pub async fn run_control(
    socket: UdpSocket,
    identity: Arc<AgentIdentity>,
    pending: Arc<PendingTransfers>,
    events: mpsc::Sender<AgentEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = [0u8; RECV_BUF];
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, from)) => {
                    handle_datagram(&socket, &identity, &pending, &events, &buf[..n], from).await;
                }
                Err(e) => {
                    error!("control socket read failed: {}", e);
                    break;
                }
            },
        }
    }
    debug!("control loop stopped");
}

async fn handle_datagram(
    socket: &UdpSocket,
    identity: &AgentIdentity,
    pending: &PendingTransfers,
    events: &mpsc::Sender<AgentEvent>,
    payload: &[u8],
    from: SocketAddr,
) {
    let msg = match wire::decode(payload) {
        Ok(msg) => msg,
        Err(e) => {
            debug!("dropping datagram from {}: {}", from, e);
            return;
        }
    };
    let SocketAddr::V4(from_v4) = from else {
        debug!("dropping datagram from non-IPv4 source {}", from);
        return;
    };
    let sender_ip = *from_v4.ip();

    let reply = wire::encode(&identity.reply_to(&msg));
    match msg.request {
        RequestKind::Discovery => {
            info!("discovery from {:?} at {}", msg.src_name, from);
            debug!("reply {}", wire::describe(&reply));
            if let Err(e) = socket.send_to(&reply, from).await {
                debug!("could not answer discovery from {}: {}", from, e);
            }
        }
        RequestKind::Transfer => {
            info!("transfer announced by {:?} at {}", msg.src_name, from);
            pending
                .arm(sender_ip, msg.src_name.clone(), msg.dst_name.clone())
                .await;
            if let Err(e) = socket.send_to(&reply, from).await {
                debug!("could not acknowledge transfer from {}: {}", from, e);
            }
            let _ = events
                .send(AgentEvent::TransferExpected {
                    sender_ip,
                    src_name: msg.src_name,
                })
                .await;
        }
    }
}
