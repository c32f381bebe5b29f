//! Transfer store: received payloads on disk, retention, stable filenames.
//!
//! An artifact becomes visible only when its sink commits: bytes stream into
//! an `incoming_*.part` file that is renamed to its final
//! `received_file_<YYYYMMDD_HHMMSS>_<ip>.raw` name on commit. Commit and
//! retention serialize on the store mutex; chunk writes do not take it.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{Local, NaiveDateTime};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

const ARTIFACT_PREFIX: &str = "received_file_";
const ARTIFACT_EXT: &str = ".raw";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

static SINK_SEQ: AtomicU64 = AtomicU64::new(0);

/// A committed file in the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub path: PathBuf,
    pub sender_ip: Ipv4Addr,
    pub received_at: NaiveDateTime,
    pub size: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store i/o: {0}")]
    Io(#[from] std::io::Error),
}

pub struct TransferStore {
    dir: PathBuf,
    max_files: usize,
    /// Guards commit (rename into place) and retention (delete). Bulk sink
    /// writes never take it.
    meta: Mutex<()>,
}

impl TransferStore {
    /// Open the store: create the directory if missing, sweep stale partial
    /// files, and enforce retention once against pre-existing contents.
    pub async fn open(dir: impl Into<PathBuf>, max_files: usize) -> Result<Arc<Self>, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;
        let store = Arc::new(Self {
            dir,
            max_files,
            meta: Mutex::new(()),
        });
        store.sweep_partials().await;
        store.enforce_retention().await;
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start receiving a payload. Bytes go to a partial file that is not
    /// visible to [`list_artifacts`] until `commit`.
    pub async fn create_sink(self: &Arc<Self>, sender_ip: Ipv4Addr) -> Result<Sink, StoreError> {
        let seq = SINK_SEQ.fetch_add(1, Ordering::Relaxed);
        let part_path = self
            .dir
            .join(format!("incoming_{}_{}.part", underscored(sender_ip), seq));
        let file = File::create(&part_path).await?;
        Ok(Sink {
            store: self.clone(),
            part_path,
            file: Some(file),
            sender_ip,
            bytes: 0,
        })
    }

    /// Committed artifacts, oldest first. Ties on the one-second timestamp
    /// resolution break by lexicographic filename order.
    pub async fn list_artifacts(&self) -> Vec<StoredArtifact> {
        let mut out = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("cannot scan store directory {}: {}", self.dir.display(), e);
                return out;
            }
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some((received_at, sender_ip)) = parse_artifact_name(name) else {
                continue;
            };
            let size = match entry.metadata().await {
                Ok(m) => m.len(),
                Err(_) => 0,
            };
            out.push(StoredArtifact {
                path: entry.path(),
                sender_ip,
                received_at,
                size,
            });
        }
        out.sort_by(|a, b| {
            (a.received_at, a.path.file_name())
                .cmp(&(b.received_at, b.path.file_name()))
        });
        out
    }

    /// Delete oldest artifacts until at most `max_files` remain. Deletion
    /// failures are logged and skipped; retention is never fatal.
    pub async fn enforce_retention(&self) {
        let _guard = self.meta.lock().await;
        self.retention_pass().await;
    }

    async fn retention_pass(&self) {
        let artifacts = self.list_artifacts().await;
        if artifacts.len() <= self.max_files {
            return;
        }
        let excess = artifacts.len() - self.max_files;
        for artifact in artifacts.into_iter().take(excess) {
            match tokio::fs::remove_file(&artifact.path).await {
                Ok(()) => debug!("retention deleted {}", artifact.path.display()),
                Err(e) => warn!(
                    "retention could not delete {}: {}",
                    artifact.path.display(),
                    e
                ),
            }
        }
    }

    /// Remove leftover partial files from interrupted sessions.
    async fn sweep_partials(&self) {
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.starts_with("incoming_") && name.ends_with(".part") {
                if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                    warn!("cannot remove stale partial {}: {}", name, e);
                }
            }
        }
    }

    /// First free artifact path for this timestamp/sender. Collisions within
    /// the same second get a monotonic `-1`, `-2`, … suffix. Caller holds
    /// the store mutex.
    async fn unique_path(&self, received_at: NaiveDateTime, sender_ip: Ipv4Addr) -> PathBuf {
        let stem = format!(
            "{}{}_{}",
            ARTIFACT_PREFIX,
            received_at.format(TIMESTAMP_FORMAT),
            underscored(sender_ip)
        );
        let base = self.dir.join(format!("{}{}", stem, ARTIFACT_EXT));
        if !path_exists(&base).await {
            return base;
        }
        let mut n = 1u32;
        loop {
            let candidate = self.dir.join(format!("{}-{}{}", stem, n, ARTIFACT_EXT));
            if !path_exists(&candidate).await {
                return candidate;
            }
            n += 1;
        }
    }
}

/// Write handle for one incoming payload.
pub struct Sink {
    store: Arc<TransferStore>,
    part_path: PathBuf,
    file: Option<File>,
    sender_ip: Ipv4Addr,
    bytes: u64,
}

impl Sink {
    pub async fn write(&mut self, chunk: &[u8]) -> Result<(), StoreError> {
        if let Some(file) = self.file.as_mut() {
            file.write_all(chunk).await?;
            self.bytes += chunk.len() as u64;
        }
        Ok(())
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Flush and rename the partial into its final timestamped name, then
    /// run a retention pass. An empty payload commits an empty artifact.
    pub async fn commit(mut self) -> Result<StoredArtifact, StoreError> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let _guard = self.store.meta.lock().await;
        let received_at = Local::now().naive_local();
        let path = self.store.unique_path(received_at, self.sender_ip).await;
        tokio::fs::rename(&self.part_path, &path).await?;
        self.store.retention_pass().await;
        Ok(StoredArtifact {
            path,
            sender_ip: self.sender_ip,
            received_at,
            size: self.bytes,
        })
    }

    /// Discard the payload; the partial file is removed.
    pub async fn abort(mut self) {
        self.file.take();
        if let Err(e) = tokio::fs::remove_file(&self.part_path).await {
            debug!(
                "could not remove partial {}: {}",
                self.part_path.display(),
                e
            );
        }
    }
}

fn underscored(ip: Ipv4Addr) -> String {
    ip.to_string().replace('.', "_")
}

async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Parse `received_file_<YYYYMMDD_HHMMSS>_<a_b_c_d>[-n].raw` back into its
/// timestamp and sender. `None` for anything else in the directory.
fn parse_artifact_name(name: &str) -> Option<(NaiveDateTime, Ipv4Addr)> {
    let rest = name
        .strip_prefix(ARTIFACT_PREFIX)?
        .strip_suffix(ARTIFACT_EXT)?;
    let rest = match rest.rsplit_once('-') {
        Some((head, tail)) if !tail.is_empty() && tail.bytes().all(|b| b.is_ascii_digit()) => head,
        _ => rest,
    };
    // "YYYYMMDD_HHMMSS" is 15 bytes, then "_", then the underscored IP.
    if rest.len() < 16 {
        return None;
    }
    let (timestamp, tail) = rest.split_at(15);
    let received_at = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT).ok()?;
    let sender_ip: Ipv4Addr = tail.strip_prefix('_')?.replace('_', ".").parse().ok()?;
    Some((received_at, sender_ip))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const SENDER: Ipv4Addr = Ipv4Addr::new(10, 0, 0, 9);

    async fn open(dir: &TempDir, max: usize) -> Arc<TransferStore> {
        TransferStore::open(dir.path(), max).await.unwrap()
    }

    async fn commit_bytes(store: &Arc<TransferStore>, bytes: &[u8]) -> StoredArtifact {
        let mut sink = store.create_sink(SENDER).await.unwrap();
        sink.write(bytes).await.unwrap();
        sink.commit().await.unwrap()
    }

    #[test]
    fn artifact_name_parsing() {
        let (ts, ip) = parse_artifact_name("received_file_20250101_120000_10_0_0_9.raw").unwrap();
        assert_eq!(ts.format(TIMESTAMP_FORMAT).to_string(), "20250101_120000");
        assert_eq!(ip, SENDER);

        let (ts2, _) =
            parse_artifact_name("received_file_20250101_120000_10_0_0_9-2.raw").unwrap();
        assert_eq!(ts2, ts);

        assert!(parse_artifact_name("incoming_10_0_0_9_0.part").is_none());
        assert!(parse_artifact_name("received_file_garbage.raw").is_none());
        assert!(parse_artifact_name("received_file_20250101_120000_not_an_ip.raw").is_none());
        assert!(parse_artifact_name("unrelated.txt").is_none());
    }

    #[tokio::test]
    async fn commit_makes_artifact_visible() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 10).await;
        assert!(store.list_artifacts().await.is_empty());

        let artifact = commit_bytes(&store, b"HELLOWORLD").await;
        assert_eq!(artifact.size, 10);
        assert_eq!(artifact.sender_ip, SENDER);

        let listed = store.list_artifacts().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, artifact.path);
        let contents = tokio::fs::read(&artifact.path).await.unwrap();
        assert_eq!(contents, b"HELLOWORLD");
        let name = artifact.path.file_name().unwrap().to_str().unwrap();
        assert!(name.starts_with(ARTIFACT_PREFIX));
        assert!(name.ends_with("_10_0_0_9.raw"));
    }

    #[tokio::test]
    async fn partial_never_visible_and_abort_removes_it() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 10).await;
        let mut sink = store.create_sink(SENDER).await.unwrap();
        sink.write(b"half").await.unwrap();
        assert!(store.list_artifacts().await.is_empty());
        sink.abort().await;
        assert!(store.list_artifacts().await.is_empty());
        let mut entries = std::fs::read_dir(dir.path()).unwrap();
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn empty_payload_commits_empty_artifact() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 10).await;
        let sink = store.create_sink(SENDER).await.unwrap();
        let artifact = sink.commit().await.unwrap();
        assert_eq!(artifact.size, 0);
        assert_eq!(store.list_artifacts().await.len(), 1);
        assert_eq!(
            std::fs::metadata(&artifact.path).unwrap().len(),
            0
        );
    }

    #[tokio::test]
    async fn same_second_commits_get_suffixes() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 10).await;
        let a = commit_bytes(&store, b"one").await;
        let b = commit_bytes(&store, b"two").await;
        let c = commit_bytes(&store, b"three").await;
        assert_ne!(a.path, b.path);
        assert_ne!(b.path, c.path);
        assert_eq!(store.list_artifacts().await.len(), 3);
    }

    #[tokio::test]
    async fn retention_keeps_newest() {
        let dir = TempDir::new().unwrap();
        // Seed artifacts with known timestamps, oldest first.
        for ts in ["20250101_120000", "20250101_120001", "20250101_120002"] {
            std::fs::write(
                dir.path().join(format!("received_file_{}_10_0_0_9.raw", ts)),
                b"x",
            )
            .unwrap();
        }
        let store = open(&dir, 2).await;
        // open() already ran one retention pass against existing contents.
        let listed = store.list_artifacts().await;
        assert_eq!(listed.len(), 2);
        let names: Vec<_> = listed
            .iter()
            .map(|a| a.path.file_name().unwrap().to_str().unwrap().to_string())
            .collect();
        assert!(names[0].contains("20250101_120001"));
        assert!(names[1].contains("20250101_120002"));
    }

    #[tokio::test]
    async fn retention_zero_keeps_nothing() {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, 0).await;
        commit_bytes(&store, b"gone").await;
        assert!(store.list_artifacts().await.is_empty());
    }

    #[tokio::test]
    async fn list_orders_by_timestamp() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("received_file_20250101_120005_10_0_0_2.raw"),
            b"later",
        )
        .unwrap();
        std::fs::write(
            dir.path().join("received_file_20250101_120001_10_0_0_1.raw"),
            b"earlier",
        )
        .unwrap();
        let store = open(&dir, 10).await;
        let listed = store.list_artifacts().await;
        assert_eq!(listed.len(), 2);
        assert!(listed[0].received_at < listed[1].received_at);
        assert_eq!(listed[0].sender_ip, Ipv4Addr::new(10, 0, 0, 1));
    }

    #[tokio::test]
    async fn open_sweeps_stale_partials() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("incoming_10_0_0_9_7.part"), b"junk").unwrap();
        let store = open(&dir, 10).await;
        assert!(store.list_artifacts().await.is_empty());
        assert!(!dir.path().join("incoming_10_0_0_9_7.part").exists());
    }
}
