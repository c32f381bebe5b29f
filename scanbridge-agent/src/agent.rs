//! Agent supervisor: component lifecycles, event wiring, graceful shutdown.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use scanbridge_core::AgentIdentity;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::discovery;
use crate::forwarder::{ForwardJob, ForwardQueue, Forwarder};
use crate::netif::InterfaceInfo;
use crate::pending::PendingTransfers;
use crate::store::{StoreError, StoredArtifact, TransferStore};
use crate::transport::{self, DataPlaneConfig, TransferSession};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const FORWARD_QUEUE_CAPACITY: usize = 32;
const FORWARDER_FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

/// What the endpoints report to the supervisor. Endpoints hold a sender
/// handle, never a reference to the supervisor itself.
#[derive(Debug)]
pub enum AgentEvent {
    TransferExpected {
        sender_ip: Ipv4Addr,
        src_name: String,
    },
    TransferCompleted {
        artifact: StoredArtifact,
        session: TransferSession,
    },
    TransferFailed {
        session: TransferSession,
        reason: String,
    },
}

/// Fatal startup failures. Everything past startup is per-session and
/// never aborts the process.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error("cannot bind control socket: {0}")]
    BindControl(std::io::Error),
    #[error("cannot bind data listener: {0}")]
    BindData(std::io::Error),
    #[error("transfer store unavailable: {0}")]
    Store(#[from] StoreError),
    #[error("proxy mode enabled but proxy.agent_ip_address is not set")]
    MissingProxyTarget,
}

/// A running agent. Dropping it detaches the tasks; call [`Agent::shutdown`]
/// for an orderly stop.
pub struct Agent {
    identity: Arc<AgentIdentity>,
    store: Arc<TransferStore>,
    udp_addr: SocketAddr,
    tcp_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    control_task: JoinHandle<()>,
    data_task: JoinHandle<()>,
    event_task: JoinHandle<()>,
    forward_task: Option<JoinHandle<()>>,
}

impl Agent {
    /// Start all components in dependency order: identity, store (with one
    /// retention pass over existing contents), data endpoint, control
    /// endpoint, forwarder.
    pub async fn start(cfg: Config, iface: InterfaceInfo) -> Result<Agent, StartError> {
        let identity = Arc::new(AgentIdentity::new(
            iface.local_ip,
            iface.broadcast_ip,
            iface.name,
            &cfg.scanner.default_src_name,
        ));
        info!(
            "agent {:?} on {} ({}), broadcast {}",
            identity.agent_name, identity.local_ip, identity.interface_name, identity.broadcast_ip
        );

        let store =
            TransferStore::open(&cfg.scanner.files_directory, cfg.scanner.max_files_retention)
                .await?;
        let pending = Arc::new(PendingTransfers::new(cfg.network.idle_window()));

        let listener =
            transport::bind_data_listener(cfg.network.tcp_port).map_err(StartError::BindData)?;
        let tcp_addr = listener.local_addr().map_err(StartError::BindData)?;
        let socket =
            discovery::bind_control_socket(cfg.network.udp_port).map_err(StartError::BindControl)?;
        let udp_addr = socket.local_addr().map_err(StartError::BindControl)?;

        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let forwarding = if cfg.proxy.enabled {
            let target_ip = cfg
                .proxy
                .agent_ip_address
                .ok_or(StartError::MissingProxyTarget)?;
            let forwarder = Arc::new(Forwarder::new(
                identity.clone(),
                target_ip,
                cfg.network.udp_port,
                cfg.network.tcp_port,
                cfg.network.ack_timeout(),
                cfg.network.tcp_chunk_size,
                cfg.scanner.max_retry_attempts,
            ));
            let queue = Arc::new(ForwardQueue::new(FORWARD_QUEUE_CAPACITY));
            let task = tokio::spawn(forwarder.run(queue.clone(), shutdown_rx.clone()));
            info!("proxy mode: forwarding to {}", target_ip);
            Some((queue, target_ip, task))
        } else {
            None
        };

        let data_task = tokio::spawn(transport::run_data(
            listener,
            store.clone(),
            pending.clone(),
            event_tx.clone(),
            DataPlaneConfig {
                chunk_size: cfg.network.tcp_chunk_size,
                connection_timeout: cfg.network.connection_timeout(),
                shutdown_grace: cfg.network.grace(),
            },
            shutdown_rx.clone(),
        ));
        let control_task = tokio::spawn(discovery::run_control(
            socket,
            identity.clone(),
            pending,
            event_tx,
            shutdown_rx,
        ));

        let (forward_wiring, forward_task) = match forwarding {
            Some((queue, target_ip, task)) => (Some((queue, target_ip)), Some(task)),
            None => (None, None),
        };
        let event_task = tokio::spawn(event_loop(event_rx, forward_wiring));

        info!("control on udp {}, data on tcp {}", udp_addr, tcp_addr);
        Ok(Agent {
            identity,
            store,
            udp_addr,
            tcp_addr,
            shutdown_tx,
            control_task,
            data_task,
            event_task,
            forward_task,
        })
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn store(&self) -> &Arc<TransferStore> {
        &self.store
    }

    /// Bound control address (useful when configured with port 0).
    pub fn udp_addr(&self) -> SocketAddr {
        self.udp_addr
    }

    /// Bound data address.
    pub fn tcp_addr(&self) -> SocketAddr {
        self.tcp_addr
    }

    /// Orderly stop: control plane first, then the data plane (which grants
    /// in-flight sessions their grace period), then the event loop, then a
    /// best-effort forwarder flush.
    pub async fn shutdown(self) {
        info!("shutting down");
        let _ = self.shutdown_tx.send(true);
        let _ = self.control_task.await;
        let _ = self.data_task.await;
        let _ = self.event_task.await;
        if let Some(task) = self.forward_task {
            if tokio::time::timeout(FORWARDER_FLUSH_TIMEOUT, task).await.is_err() {
                warn!("forwarder flush did not finish in time");
            }
        }
        info!("stopped");
    }
}

/// Central event loop: log state transitions, hand completions to the
/// forwarder when proxying. Exits once every endpoint sender is gone.
async fn event_loop(
    mut events: mpsc::Receiver<AgentEvent>,
    forwarding: Option<(Arc<ForwardQueue>, Ipv4Addr)>,
) {
    while let Some(event) = events.recv().await {
        match event {
            AgentEvent::TransferExpected {
                sender_ip,
                src_name,
            } => {
                info!("expecting transfer from {:?} at {}", src_name, sender_ip);
            }
            AgentEvent::TransferCompleted { artifact, session } => {
                info!(
                    "transfer from {} complete: {} bytes in {}",
                    session.sender_ip,
                    artifact.size,
                    artifact.path.display()
                );
                if let Some((queue, target_ip)) = &forwarding {
                    queue
                        .push(ForwardJob {
                            source_path: artifact.path.clone(),
                            target_ip: *target_ip,
                            attempt_count: 0,
                        })
                        .await;
                }
            }
            AgentEvent::TransferFailed { session, reason } => {
                warn!(
                    "transfer from {} failed after {} bytes: {}",
                    session.sender_ip, session.bytes_received, reason
                );
            }
        }
    }
}
