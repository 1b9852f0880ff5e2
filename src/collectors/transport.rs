use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TransportKey {
    pub user: String,
    pub host: String,
    pub port: u16,
}

impl TransportKey {
    pub fn new(user: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            user: user.into(),
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for TransportKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.user, self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportLease {
    pub key: TransportKey,
    pub control_path: PathBuf,
    /// Whether the key was already known to the pool.
    pub reused: bool,
}

#[derive(Debug)]
struct PoolEntry {
    control_path: PathBuf,
    last_used: Instant,
}

#[derive(Debug)]
pub struct TransportPool {
    control_dir: PathBuf,
    idle_window: Duration,
    entries: Mutex<HashMap<TransportKey, PoolEntry>>,
}

impl TransportPool {
    pub fn new(control_dir: impl Into<PathBuf>, idle_window: Duration) -> Self {
        Self {
            control_dir: control_dir.into(),
            idle_window,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn control_dir(&self) -> &Path {
        &self.control_dir
    }

    pub fn control_path_for(&self, key: &TransportKey) -> PathBuf {
        self.control_dir.join(key.to_string())
    }

    pub async fn checkout(&self, key: &TransportKey, now: Instant) -> TransportLease {
        let mut entries = self.entries.lock().await;
        let reused = entries.contains_key(key);
        let control_path = self.control_path_for(key);
        let entry = entries.entry(key.clone()).or_insert_with(|| PoolEntry {
            control_path: control_path.clone(),
            last_used: now,
        });
        entry.last_used = now;
        TransportLease {
            key: key.clone(),
            control_path: entry.control_path.clone(),
            reused,
        }
    }

    /// Drops entries unused for longer than the idle window and returns them
    /// so the caller can close their master connections.
    pub async fn evict_idle(&self, now: Instant) -> Vec<TransportLease> {
        let mut entries = self.entries.lock().await;
        let expired: Vec<TransportKey> = entries
            .iter()
            .filter(|(_, entry)| now.saturating_duration_since(entry.last_used) > self.idle_window)
            .map(|(key, _)| key.clone())
            .collect();

        expired
            .into_iter()
            .filter_map(|key| {
                entries.remove(&key).map(|entry| TransportLease {
                    key,
                    control_path: entry.control_path,
                    reused: true,
                })
            })
            .collect()
    }

    pub async fn release(&self, key: &TransportKey) -> Option<TransportLease> {
        let mut entries = self.entries.lock().await;
        entries.remove(key).map(|entry| TransportLease {
            key: key.clone(),
            control_path: entry.control_path,
            reused: true,
        })
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }
}
