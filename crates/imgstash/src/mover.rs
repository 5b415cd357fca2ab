//! Bidirectional image transfer between the daemon and the store.
//!
//! The store is synchronous; the daemon is not. `push` bridges the
//! daemon's async export stream into the blocking store write with
//! [`SyncIoBridge`], and `pull` hands the store's recomposed tar file to
//! the daemon's async load endpoint. Streams are closed on every path by
//! drop.

use std::sync::Arc;

use tokio_util::io::SyncIoBridge;
use tracing::info;

use crate::daemon::ContainerDaemon;
use crate::error::{CacheError, Result};
use crate::storage::Storage;

/// Moves images daemon ↔ store.
#[derive(Clone)]
pub struct Mover {
    storage: Arc<Storage>,
    daemon: Arc<dyn ContainerDaemon>,
}

impl Mover {
    pub fn new(storage: Arc<Storage>, daemon: Arc<dyn ContainerDaemon>) -> Self {
        Self { storage, daemon }
    }

    /// Daemon → store: export the image and ingest it.
    ///
    /// The store write is the commit point; metadata lands after the blob,
    /// so a crash in between leaves an orphan blob for the next startup
    /// reconciliation.
    pub async fn push(&self, image_name: &str) -> Result<()> {
        let image_id = self
            .daemon
            .inspect(image_name)
            .await?
            .ok_or_else(|| CacheError::ImageGoneFromDaemon(image_name.to_string()))?;

        let dump = self.daemon.save_dump(image_name).await?;

        let storage = Arc::clone(&self.storage);
        let name = image_name.to_string();
        tokio::task::spawn_blocking(move || {
            let reader = SyncIoBridge::new(dump);
            storage.save(&name, &image_id, reader)
        })
        .await
        .map_err(CacheError::from_join)?
    }

    /// Store → daemon: reload the image unless the daemon already holds
    /// the stored version.
    pub async fn pull(&self, image_name: &str) -> Result<()> {
        let meta = {
            let storage = Arc::clone(&self.storage);
            let name = image_name.to_string();
            tokio::task::spawn_blocking(move || storage.get_meta(&name))
                .await
                .map_err(CacheError::from_join)??
        };

        if self
            .daemon
            .contains_same_version(&meta.image_name, &meta.image_id)
            .await?
        {
            info!("image '{}' is already up to date", meta.image_name);
            return Ok(());
        }

        let dump = {
            let storage = Arc::clone(&self.storage);
            let name = meta.image_name.clone();
            tokio::task::spawn_blocking(move || storage.load(&name))
                .await
                .map_err(CacheError::from_join)??
        };
        self.daemon.load_dump(dump).await?;
        info!("image '{}' has been loaded", meta.image_name);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::mock::{image_tar, MockDaemon};
    use std::io::Read;
    use tempfile::TempDir;

    fn setup() -> (TempDir, Arc<Storage>, Arc<MockDaemon>, Mover) {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(Storage::open(dir.path()));
        let daemon = Arc::new(MockDaemon::new());
        let mover = Mover::new(storage.clone(), daemon.clone());
        (dir, storage, daemon, mover)
    }

    #[tokio::test]
    async fn test_push_ingests_daemon_export() {
        let (_dir, storage, daemon, mover) = setup();
        daemon.add_image("repo/app:1", "sha256:aa", image_tar("l1"));

        mover.push("repo/app:1").await.unwrap();

        assert!(storage.is_exist("repo/app:1").unwrap());
        let meta = storage.get_meta("repo/app:1").unwrap();
        assert_eq!(meta.image_id, "sha256:aa");
        assert_eq!(
            daemon.calls(),
            vec!["inspect repo/app:1", "save repo/app:1"]
        );
    }

    #[tokio::test]
    async fn test_push_fails_when_image_gone_from_daemon() {
        let (_dir, storage, _daemon, mover) = setup();

        let err = mover.push("ghost").await.unwrap_err();
        assert!(matches!(err, CacheError::ImageGoneFromDaemon(name) if name == "ghost"));
        assert!(!storage.is_exist("ghost").unwrap());
    }

    #[tokio::test]
    async fn test_pull_skips_when_daemon_has_same_version() {
        let (_dir, storage, daemon, mover) = setup();
        storage
            .save("repo/app:1", "sha256:aa", image_tar("l1").as_slice())
            .unwrap();
        daemon.add_image("repo/app:1", "sha256:aa", Vec::new());

        mover.pull("repo/app:1").await.unwrap();

        // The blob stream was never opened or fed to the daemon.
        assert!(daemon.loaded().is_empty());
        assert_eq!(daemon.calls(), vec!["inspect repo/app:1"]);
    }

    #[tokio::test]
    async fn test_pull_loads_when_version_differs() {
        let (_dir, storage, daemon, mover) = setup();
        storage
            .save("repo/app:1", "sha256:aa", image_tar("l1").as_slice())
            .unwrap();
        daemon.add_image("repo/app:1", "sha256:other", Vec::new());

        mover.pull("repo/app:1").await.unwrap();

        let loaded = daemon.loaded();
        assert_eq!(loaded.len(), 1);
        // The uploaded stream is a tar containing the image manifest.
        let mut archive = tar::Archive::new(loaded[0].as_slice());
        let names: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|entry| {
                String::from_utf8_lossy(&entry.unwrap().path_bytes()).into_owned()
            })
            .collect();
        assert!(names.contains(&"manifest.json".to_string()));
    }

    #[tokio::test]
    async fn test_pull_unknown_image_is_not_found() {
        let (_dir, _storage, _daemon, mover) = setup();
        let err = mover.pull("never-saved").await.unwrap_err();
        assert!(matches!(err, CacheError::NotFound));
    }

    #[tokio::test]
    async fn test_push_round_trips_through_pull() {
        let (_dir, _storage, daemon, mover) = setup();
        daemon.add_image("repo/app:1", "sha256:aa", image_tar("l1"));

        mover.push("repo/app:1").await.unwrap();

        // Daemon forgets the image; pull must feed it back.
        daemon.set_image_id("repo/app:1", "sha256:stale");
        mover.pull("repo/app:1").await.unwrap();

        let loaded = daemon.loaded();
        assert_eq!(loaded.len(), 1);
        let mut archive = tar::Archive::new(loaded[0].as_slice());
        let mut restored = None;
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            if path == "l1/layer.tar" {
                let mut buf = Vec::new();
                entry.read_to_end(&mut buf).unwrap();
                restored = Some(buf);
            }
        }
        assert_eq!(restored.as_deref(), Some(&b"layer-bytes"[..]));
    }
}
