//! Pending-transfer table: the UDP → TCP handoff.
//!
//! A transfer-request datagram arms an entry for its sender IP; the next TCP
//! connection from that IP claims the oldest entry. Entries expire after the
//! idle window and are swept on every access.

use std::collections::{HashMap, VecDeque};
use std::net::Ipv4Addr;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// One announced transfer, waiting for its TCP connection.
#[derive(Debug, Clone)]
pub struct PendingTransfer {
    pub src_name: String,
    pub dst_name: String,
    pub armed_at: Instant,
}

pub struct PendingTransfers {
    idle_window: Duration,
    entries: Mutex<HashMap<Ipv4Addr, VecDeque<PendingTransfer>>>,
}

impl PendingTransfers {
    pub fn new(idle_window: Duration) -> Self {
        Self {
            idle_window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record that `sender_ip` announced an imminent transfer.
    pub async fn arm(&self, sender_ip: Ipv4Addr, src_name: String, dst_name: String) {
        let mut entries = self.entries.lock().await;
        Self::sweep(&mut entries, self.idle_window);
        entries.entry(sender_ip).or_default().push_back(PendingTransfer {
            src_name,
            dst_name,
            armed_at: Instant::now(),
        });
    }

    /// Claim the oldest live entry for `sender_ip`, first come first served.
    pub async fn claim(&self, sender_ip: Ipv4Addr) -> Option<PendingTransfer> {
        let mut entries = self.entries.lock().await;
        Self::sweep(&mut entries, self.idle_window);
        let queue = entries.get_mut(&sender_ip)?;
        let entry = queue.pop_front();
        if queue.is_empty() {
            entries.remove(&sender_ip);
        }
        entry
    }

    fn sweep(entries: &mut HashMap<Ipv4Addr, VecDeque<PendingTransfer>>, window: Duration) {
        let now = Instant::now();
        entries.retain(|_, queue| {
            queue.retain(|e| now.duration_since(e.armed_at) < window);
            !queue.is_empty()
        });
    }
}
