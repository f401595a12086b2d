//! On-disk hand-off of pending lookups between hook processes
//!
//! The pre hook and the post hook for one tool call run as separate
//! processes, so a miss recorded by the former is written under
//! `{root}/pending/` and picked up by the latter. Hosts that send a session
//! id get their own directory under `{root}/pending/sessions/`, so
//! correlation ids from concurrent sessions never meet.

use crate::cache::{correlator::PendingLookup, keys::digest};
use crate::error::Result;
use chrono::Utc;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;

const PENDING_DIR: &str = "pending";
const SESSIONS_DIR: &str = "sessions";

#[derive(Debug, Clone)]
pub struct PendingSpool {
    dir: PathBuf,
}

impl PendingSpool {
    /// Spool shared by callers without a session
    pub async fn open(root: impl AsRef<Path>) -> Result<Self> {
        Self::open_dir(root.as_ref().join(PENDING_DIR)).await
    }

    /// Spool private to `session_id`; the shared spool when there is none
    pub async fn for_session(root: impl AsRef<Path>, session_id: Option<&str>) -> Result<Self> {
        match session_id.filter(|id| !id.is_empty()) {
            Some(id) => {
                let dir = root
                    .as_ref()
                    .join(PENDING_DIR)
                    .join(SESSIONS_DIR)
                    .join(digest(id));
                Self::open_dir(dir).await
            }
            None => Self::open(root).await,
        }
    }

    async fn open_dir(dir: PathBuf) -> Result<Self> {
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, correlation_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", digest(correlation_id)))
    }

    /// Persist a lookup; a reused id overwrites the earlier one
    pub async fn save(&self, correlation_id: &str, lookup: &PendingLookup) -> Result<()> {
        let body = serde_json::to_vec(lookup)?;
        let tmp = self.dir.join(format!(".{}.tmp", Uuid::new_v4()));

        fs::write(&tmp, &body).await?;
        if let Err(e) = fs::rename(&tmp, self.path_for(correlation_id)).await {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }
        debug!("Spooled pending lookup for {}", correlation_id);
        Ok(())
    }

    /// Remove and return the lookup for `correlation_id`
    pub async fn take(&self, correlation_id: &str) -> Result<Option<PendingLookup>> {
        let path = self.path_for(correlation_id);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match fs::remove_file(&path).await {
            Ok(()) => {}
            // Another process took it first
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        }

        match serde_json::from_slice(&bytes) {
            Ok(lookup) => Ok(Some(lookup)),
            Err(e) => {
                warn!("Discarding unreadable pending lookup {}: {}", path.display(), e);
                Ok(None)
            }
        }
    }

    /// Remove lookups older than `max_age` and unparseable leftovers,
    /// including those of every session below this spool. Session
    /// directories left empty are removed.
    pub async fn sweep(&self, max_age: Duration) -> Result<usize> {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or_else(|_| chrono::Duration::weeks(52));
        let mut removed = sweep_dir(&self.dir, max_age).await?;

        let sessions = self.dir.join(SESSIONS_DIR);
        match fs::read_dir(&sessions).await {
            Ok(mut dir) => {
                while let Some(item) = dir.next_entry().await? {
                    let path = item.path();
                    if !item.file_type().await?.is_dir() {
                        continue;
                    }
                    removed += sweep_dir(&path, max_age).await?;
                    // Fails while the session still has lookups
                    let _ = fs::remove_dir(&path).await;
                }
            }
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        if removed > 0 {
            debug!("Swept {} stale pending lookups", removed);
        }
        Ok(removed)
    }
}

async fn sweep_dir(dir: &Path, max_age: chrono::Duration) -> Result<usize> {
    let now = Utc::now();
    let mut removed = 0;

    let mut entries = fs::read_dir(dir).await?;
    while let Some(item) = entries.next_entry().await? {
        let path = item.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let stale = match fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<PendingLookup>(&bytes)
                .map_or(true, |lookup| now - lookup.started_at > max_age),
            Err(_) => false,
        };
        if stale && fs::remove_file(&path).await.is_ok() {
            removed += 1;
        }
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_save_then_take_once() {
        let dir = TempDir::new().unwrap();
        let spool = PendingSpool::open(dir.path()).await.unwrap();

        let lookup = PendingLookup::new("Read:0011", "Read");
        spool.save("toolu_1", &lookup).await.unwrap();

        assert_eq!(spool.take("toolu_1").await.unwrap(), Some(lookup));
        assert_eq!(spool.take("toolu_1").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_sweep_removes_old_lookups() {
        let dir = TempDir::new().unwrap();
        let spool = PendingSpool::open(dir.path()).await.unwrap();

        let mut old = PendingLookup::new("Read:1", "Read");
        old.started_at = Utc::now() - chrono::Duration::hours(2);
        spool.save("old", &old).await.unwrap();
        spool.save("new", &PendingLookup::new("Read:2", "Read")).await.unwrap();

        assert_eq!(spool.sweep(Duration::from_secs(600)).await.unwrap(), 1);
        assert!(spool.take("new").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_sessions_do_not_share_ids() {
        let dir = TempDir::new().unwrap();
        let first = PendingSpool::for_session(dir.path(), Some("session-a")).await.unwrap();
        let second = PendingSpool::for_session(dir.path(), Some("session-b")).await.unwrap();
        let shared = PendingSpool::for_session(dir.path(), None).await.unwrap();
        assert_ne!(first.dir(), second.dir());
        assert_eq!(shared.dir(), PendingSpool::open(dir.path()).await.unwrap().dir());

        first.save("toolu_1", &PendingLookup::new("Read:a", "Read")).await.unwrap();
        second.save("toolu_1", &PendingLookup::new("Glob:b", "Glob")).await.unwrap();

        assert!(shared.take("toolu_1").await.unwrap().is_none());
        assert_eq!(first.take("toolu_1").await.unwrap().unwrap().key, "Read:a");
        assert_eq!(second.take("toolu_1").await.unwrap().unwrap().key, "Glob:b");
    }

    #[tokio::test]
    async fn test_root_sweep_reaches_sessions() {
        let dir = TempDir::new().unwrap();
        let root = PendingSpool::open(dir.path()).await.unwrap();
        let idle = PendingSpool::for_session(dir.path(), Some("idle")).await.unwrap();
        let live = PendingSpool::for_session(dir.path(), Some("live")).await.unwrap();

        let mut old = PendingLookup::new("Read:1", "Read");
        old.started_at = Utc::now() - chrono::Duration::hours(2);
        idle.save("t1", &old).await.unwrap();
        live.save("t2", &PendingLookup::new("Read:2", "Read")).await.unwrap();

        assert_eq!(root.sweep(Duration::from_secs(600)).await.unwrap(), 1);
        assert!(!idle.dir().exists());
        assert!(live.take("t2").await.unwrap().is_some());
    }
}
