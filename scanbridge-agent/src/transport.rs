//! TCP data endpoint: one raw payload per connection, streamed into the
//! transfer store.
//!
//! There is no framing on the data plane. The sender writes file bytes and
//! closes its write half; clean EOF commits the sink, anything else aborts
//! it.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::agent::AgentEvent;
use crate::pending::PendingTransfers;
use crate::store::TransferStore;

/// Lifetime of one payload reception, from accept to commit-or-abort.
#[derive(Debug, Clone)]
pub struct TransferSession {
    pub sender_ip: Ipv4Addr,
    pub src_name: String,
    pub dst_name: String,
    pub started_at: NaiveDateTime,
    pub bytes_received: u64,
    pub path: Option<std::path::PathBuf>,
    pub state: SessionState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Pending,
    Receiving,
    Completed,
    Failed,
}

impl TransferSession {
    fn new(sender_ip: Ipv4Addr, src_name: String, dst_name: String) -> Self {
        Self {
            sender_ip,
            src_name,
            dst_name,
            started_at: chrono::Local::now().naive_local(),
            bytes_received: 0,
            path: None,
            state: SessionState::Pending,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DataPlaneConfig {
    pub chunk_size: usize,
    pub connection_timeout: Duration,
    pub shutdown_grace: Duration,
}

/// Bind the data listener with SO_REUSEADDR set.
pub fn bind_data_listener(port: u16) -> std::io::Result<TcpListener> {
    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    socket.bind(&addr.into())?;
    socket.listen(128)?;
    TcpListener::from_std(socket.into())
}

/// Accept loop. Each connection gets its own task; on shutdown, in-flight
/// sessions get the grace period before they are aborted.
pub async fn run_data(
    listener: TcpListener,
    store: Arc<TransferStore>,
    pending: Arc<PendingTransfers>,
    events: mpsc::Sender<AgentEvent>,
    cfg: DataPlaneConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut sessions: JoinSet<()> = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let store = store.clone();
                    let pending = pending.clone();
                    let events = events.clone();
                    sessions.spawn(async move {
                        handle_connection(stream, peer, store, pending, events, cfg).await;
                    });
                }
                Err(e) => {
                    error!("data listener accept failed: {}", e);
                    break;
                }
            },
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }
    drop(listener);
    if sessions.is_empty() {
        return;
    }
    debug!(
        "waiting up to {:?} for {} in-flight sessions",
        cfg.shutdown_grace,
        sessions.len()
    );
    let drained = tokio::time::timeout(cfg.shutdown_grace, async {
        while sessions.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("grace period expired, aborting remaining sessions");
        sessions.shutdown().await;
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    store: Arc<TransferStore>,
    pending: Arc<PendingTransfers>,
    events: mpsc::Sender<AgentEvent>,
    cfg: DataPlaneConfig,
) {
    let sender_ip = match peer {
        SocketAddr::V4(addr) => *addr.ip(),
        SocketAddr::V6(_) => {
            warn!("closing non-IPv4 connection from {}", peer);
            return;
        }
    };

    // Associate by source IP; a connection nobody announced still gets a
    // session, the protocol has no way to authenticate it anyway.
    let mut session = match pending.claim(sender_ip).await {
        Some(entry) => TransferSession::new(sender_ip, entry.src_name, entry.dst_name),
        None => {
            warn!("connection from {} with no pending transfer", peer);
            TransferSession::new(sender_ip, String::new(), String::new())
        }
    };
    session.state = SessionState::Receiving;
    info!("receiving from {}", peer);

    let mut sink = match store.create_sink(sender_ip).await {
        Ok(sink) => sink,
        Err(e) => {
            warn!("cannot open sink for {}: {}", peer, e);
            session.state = SessionState::Failed;
            let _ = events
                .send(AgentEvent::TransferFailed {
                    session,
                    reason: e.to_string(),
                })
                .await;
            return;
        }
    };

    let mut buf = vec![0u8; cfg.chunk_size];
    loop {
        let read = tokio::time::timeout(cfg.connection_timeout, stream.read(&mut buf)).await;
        match read {
            Err(_) => {
                return fail(sink, session, events, format!("no data from {} within timeout", peer))
                    .await;
            }
            Ok(Err(e)) => {
                return fail(sink, session, events, format!("read from {} failed: {}", peer, e))
                    .await;
            }
            Ok(Ok(0)) => break,
            Ok(Ok(n)) => {
                if let Err(e) = sink.write(&buf[..n]).await {
                    return fail(sink, session, events, format!("write failed: {}", e)).await;
                }
                session.bytes_received += n as u64;
            }
        }
    }

    match sink.commit().await {
        Ok(artifact) => {
            session.state = SessionState::Completed;
            session.path = Some(artifact.path.clone());
            info!(
                "stored {} bytes from {} at {}",
                artifact.size,
                peer,
                artifact.path.display()
            );
            let _ = events
                .send(AgentEvent::TransferCompleted { artifact, session })
                .await;
        }
        Err(e) => {
            warn!("commit for {} failed: {}", peer, e);
            session.state = SessionState::Failed;
            let _ = events
                .send(AgentEvent::TransferFailed {
                    session,
                    reason: e.to_string(),
                })
                .await;
        }
    }
}

async fn fail(
    sink: crate::store::Sink,
    mut session: TransferSession,
    events: mpsc::Sender<AgentEvent>,
    reason: String,
) {
    warn!("{}", reason);
    sink.abort().await;
    session.state = SessionState::Failed;
    let _ = events
        .send(AgentEvent::TransferFailed { session, reason })
        .await;
}
