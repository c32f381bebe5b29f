//! Proxy-mode forwarder: replay each stored file against a downstream agent
//! with the same two-leg protocol (UDP transfer request + ack, then raw TCP).

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use scanbridge_core::{wire, AgentIdentity, MESSAGE_LEN, SIGNATURE};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{watch, Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// One file to replay downstream. Not persisted across restarts.
#[derive(Debug, Clone)]
pub struct ForwardJob {
    pub source_path: PathBuf,
    pub target_ip: Ipv4Addr,
    pub attempt_count: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum ForwardError {
    #[error("no acknowledgement from downstream")]
    AckTimeout,
    #[error("cannot connect to downstream: {0}")]
    Connect(std::io::Error),
    #[error("send to downstream failed: {0}")]
    Send(std::io::Error),
    #[error("forward i/o: {0}")]
    Io(#[from] std::io::Error),
}

/// Bounded in-memory job queue. When full, the oldest unprocessed job is
/// dropped so completions keep flowing.
pub struct ForwardQueue {
    capacity: usize,
    jobs: Mutex<VecDeque<ForwardJob>>,
    notify: Notify,
}

impl ForwardQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            jobs: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub async fn push(&self, job: ForwardJob) {
        let mut jobs = self.jobs.lock().await;
        if jobs.len() == self.capacity {
            if let Some(dropped) = jobs.pop_front() {
                warn!(
                    "forward queue full, dropping {}",
                    dropped.source_path.display()
                );
            }
        }
        jobs.push_back(job);
        drop(jobs);
        self.notify.notify_one();
    }

    /// Wait for the next job.
    pub async fn pop(&self) -> ForwardJob {
        loop {
            if let Some(job) = self.try_pop().await {
                return job;
            }
            self.notify.notified().await;
        }
    }

    pub async fn try_pop(&self) -> Option<ForwardJob> {
        self.jobs.lock().await.pop_front()
    }
}

pub struct Forwarder {
    identity: Arc<AgentIdentity>,
    udp_target: SocketAddr,
    tcp_target: SocketAddr,
    ack_timeout: Duration,
    chunk_size: usize,
    max_attempts: u32,
    retry_backoff: Duration,
}

impl Forwarder {
    pub fn new(
        identity: Arc<AgentIdentity>,
        target_ip: Ipv4Addr,
        udp_port: u16,
        tcp_port: u16,
        ack_timeout: Duration,
        chunk_size: usize,
        max_attempts: u32,
    ) -> Self {
        Self {
            identity,
            udp_target: SocketAddr::from((target_ip, udp_port)),
            tcp_target: SocketAddr::from((target_ip, tcp_port)),
            ack_timeout,
            chunk_size,
            max_attempts,
            retry_backoff: Duration::from_secs(1),
        }
    }

    /// Override the fixed back-off between attempts.
    pub fn set_retry_backoff(&mut self, backoff: Duration) {
        self.retry_backoff = backoff;
    }

    /// Consume jobs until shutdown, then flush what is left with one
    /// attempt each.
    pub async fn run(
        self: Arc<Self>,
        queue: Arc<ForwardQueue>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                job = queue.pop() => self.forward(job).await,
            }
        }
        while let Some(job) = queue.try_pop().await {
            debug!("flushing {} at shutdown", job.source_path.display());
            if let Err(e) = self.forward_once(&job.source_path).await {
                warn!("flush of {} failed: {}", job.source_path.display(), e);
            }
        }
    }

    /// Forward one artifact with retries. The source file is never deleted
    /// here; retention owns deletion.
    pub async fn forward(&self, mut job: ForwardJob) {
        while job.attempt_count < self.max_attempts {
            job.attempt_count += 1;
            match self.forward_once(&job.source_path).await {
                Ok(()) => {
                    info!(
                        "forwarded {} to {} (attempt {})",
                        job.source_path.display(),
                        job.target_ip,
                        job.attempt_count
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "forward attempt {}/{} for {} failed: {}",
                        job.attempt_count,
                        self.max_attempts,
                        job.source_path.display(),
                        e
                    );
                    if job.attempt_count < self.max_attempts {
                        tokio::time::sleep(self.retry_backoff).await;
                    }
                }
            }
        }
        warn!(
            "giving up on {} after {} attempts",
            job.source_path.display(),
            self.max_attempts
        );
    }

    /// One full protocol exchange: transfer request, ack wait, TCP stream.
    async fn forward_once(&self, path: &Path) -> Result<(), ForwardError> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
        let request = wire::encode(&self.identity.transfer_request(""));
        socket.send_to(&request, self.udp_target).await?;
        self.await_ack(&socket).await?;

        let mut stream = TcpStream::connect(self.tcp_target)
            .await
            .map_err(ForwardError::Connect)?;
        let mut file = tokio::fs::File::open(path).await?;
        let mut buf = vec![0u8; self.chunk_size];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            stream.write_all(&buf[..n]).await.map_err(ForwardError::Send)?;
        }
        stream.shutdown().await.map_err(ForwardError::Send)?;
        Ok(())
    }

    /// Any well-formed 90-byte datagram with a valid signature from the
    /// downstream IP counts as acknowledgement; the payload is not
    /// inspected further.
    async fn await_ack(&self, socket: &UdpSocket) -> Result<(), ForwardError> {
        let deadline = Instant::now() + self.ack_timeout;
        let mut buf = [0u8; 256];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(ForwardError::AckTimeout);
            }
            match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
                Err(_) => return Err(ForwardError::AckTimeout),
                Ok(Err(e)) => return Err(ForwardError::Io(e)),
                Ok(Ok((n, from))) => {
                    if from.ip() != self.udp_target.ip() {
                        debug!("ignoring datagram from unexpected peer {}", from);
                        continue;
                    }
                    if n == MESSAGE_LEN && buf[0..3] == SIGNATURE {
                        return Ok(());
                    }
                    debug!("ignoring non-ack datagram ({} bytes) from {}", n, from);
                }
            }
        }
    }
}
