//! Pairing facade over the metadata index and the blob store.
//!
//! `Storage` is the single entry point the rest of the cache uses. It keeps
//! the two halves consistent by ordering writes asymmetrically:
//!
//! - [`save`] writes the blob first and the metadata entry second, so a
//!   crash in between leaves an orphan blob (swept by the next
//!   reconciliation), never a metadata entry pointing at missing bytes;
//! - [`remove`] deletes the metadata entry first and the blob second, for
//!   the same reason.
//!
//! [`clean_up`] is the startup reconciliation pass restoring the pairing
//! invariant in both directions.
//!
//! [`save`]: Storage::save
//! [`remove`]: Storage::remove
//! [`clean_up`]: Storage::clean_up

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::blob_store::BlobStore;
use crate::error::{CacheError, Result};
use crate::meta_index::{MetaEntry, MetaIndex};
use crate::scratch::ScratchFile;

/// Combined image storage: blob store plus metadata index, both rooted at
/// the cache directory.
#[derive(Debug)]
pub struct Storage {
    meta: MetaIndex,
    blobs: BlobStore,
}

impl Storage {
    /// Create a storage rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Self {
        Self {
            meta: MetaIndex::new(dir.as_ref()),
            blobs: BlobStore::new(dir.as_ref()),
        }
    }

    /// Assemble a storage from its two halves.
    pub fn new(meta: MetaIndex, blobs: BlobStore) -> Self {
        Self { meta, blobs }
    }

    /// Ingest an image dump and record its metadata.
    ///
    /// The blob write is the commit point; the metadata entry is written
    /// only after the blob is durable.
    pub fn save(&self, image_name: &str, image_id: &str, dump: impl Read) -> Result<()> {
        self.blobs.save(image_name, dump)?;
        self.meta.set(MetaEntry {
            image_name: image_name.to_string(),
            image_id: image_id.to_string(),
            updated_at: Utc::now(),
        })
    }

    /// Recompose the stored image into a self-deleting tar stream.
    pub fn load(&self, image_name: &str) -> Result<ScratchFile> {
        self.blobs.load(image_name)
    }

    /// Forget an image: metadata first, then the blob.
    pub fn remove(&self, image_name: &str) -> Result<()> {
        self.meta.remove(image_name)?;
        self.blobs.remove(image_name)
    }

    /// Metadata for one image; [`CacheError::NotFound`] when absent.
    pub fn get_meta(&self, image_name: &str) -> Result<MetaEntry> {
        self.meta.get(image_name)
    }

    /// Metadata for every cached image, in no particular order.
    pub fn get_all_meta(&self) -> Result<Vec<MetaEntry>> {
        self.meta.get_all()
    }

    /// Whether the image's blob is present.
    pub fn is_exist(&self, image_name: &str) -> Result<bool> {
        self.blobs.is_exist(image_name)
    }

    /// Readiness probe for both halves.
    pub fn ready(&self) -> Result<()> {
        self.blobs.ready()?;
        self.meta.ready()
    }

    /// Poll [`ready`](Storage::ready) at 1 Hz until it succeeds, the
    /// timeout elapses, or the token is cancelled.
    pub async fn wait_ready(&self, timeout: Duration, cancel: &CancellationToken) -> Result<()> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.ready().is_ok() {
                info!("storage is ready");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(CacheError::StorageNotReady(timeout));
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(CacheError::Cancelled),
                _ = tokio::time::sleep(Duration::from_secs(1)) => {}
            }
        }
    }

    /// Remove unpaired state in both directions: blobs with no metadata
    /// entry, then metadata entries with no blob.
    pub fn clean_up(&self) -> Result<()> {
        let metas = self.meta.get_all()?;
        let names: Vec<String> = metas.iter().map(|m| m.image_name.clone()).collect();
        self.blobs.remove_not_in(&names)?;

        for meta in &metas {
            if self.blobs.is_exist(&meta.image_name)? {
                continue;
            }
            self.meta.remove(&meta.image_name)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use tempfile::TempDir;

    fn image_tar(layer_id: &str) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        builder
            .append_data(&mut header, format!("{layer_id}/"), io::empty())
            .unwrap();

        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(4);
        builder
            .append_data(&mut header, format!("{layer_id}/layer.tar"), &b"data"[..])
            .unwrap();

        let manifest = format!("[{{\"Layers\":[\"{layer_id}/layer.tar\"]}}]");
        let mut header = tar::Header::new_gnu();
        header.set_mode(0o644);
        header.set_size(manifest.len() as u64);
        builder
            .append_data(&mut header, "manifest.json", manifest.as_bytes())
            .unwrap();

        builder.into_inner().unwrap()
    }

    #[test]
    fn test_save_pairs_blob_and_meta() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path());

        storage
            .save("repo/app:1", "sha256:aa", image_tar("l1").as_slice())
            .unwrap();

        assert!(storage.is_exist("repo/app:1").unwrap());
        let meta = storage.get_meta("repo/app:1").unwrap();
        assert_eq!(meta.image_id, "sha256:aa");
    }

    #[test]
    fn test_resave_updates_meta() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path());

        storage
            .save("repo/app:1", "sha256:old", image_tar("l1").as_slice())
            .unwrap();
        let first = storage.get_meta("repo/app:1").unwrap();

        storage
            .save("repo/app:1", "sha256:new", image_tar("l1").as_slice())
            .unwrap();
        let second = storage.get_meta("repo/app:1").unwrap();

        assert_eq!(second.image_id, "sha256:new");
        assert!(second.updated_at >= first.updated_at);
        assert_eq!(storage.get_all_meta().unwrap().len(), 1);
    }

    #[test]
    fn test_remove_clears_both_halves() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path());

        storage
            .save("repo/app:1", "sha256:aa", image_tar("l1").as_slice())
            .unwrap();
        storage.remove("repo/app:1").unwrap();

        assert!(!storage.is_exist("repo/app:1").unwrap());
        assert!(matches!(
            storage.get_meta("repo/app:1"),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn test_clean_up_drops_orphan_meta() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path());

        storage
            .save("kept", "sha256:aa", image_tar("l1").as_slice())
            .unwrap();
        // Orphan entry: metadata present, blob directory missing.
        storage.meta.set(MetaEntry {
            image_name: "ghost".to_string(),
            image_id: "sha256:bb".to_string(),
            updated_at: Utc::now(),
        })
        .unwrap();

        storage.clean_up().unwrap();

        assert!(storage.get_meta("kept").is_ok());
        assert!(matches!(
            storage.get_meta("ghost"),
            Err(CacheError::NotFound)
        ));
    }

    #[test]
    fn test_clean_up_drops_orphan_blob() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path());

        storage
            .save("kept", "sha256:aa", image_tar("l1").as_slice())
            .unwrap();
        // Orphan blob: saved but stripped from the index afterwards.
        storage
            .save("stray", "sha256:bb", image_tar("l2").as_slice())
            .unwrap();
        storage.meta.remove("stray").unwrap();

        storage.clean_up().unwrap();

        assert!(storage.is_exist("kept").unwrap());
        assert!(!storage.is_exist("stray").unwrap());
        assert!(!dir.path().join("layers/l2").exists());
    }

    #[tokio::test]
    async fn test_wait_ready_times_out() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("missing"));
        let cancel = CancellationToken::new();

        let err = storage
            .wait_ready(Duration::from_millis(10), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::StorageNotReady(_)));
    }

    #[tokio::test]
    async fn test_wait_ready_cancellation() {
        let dir = TempDir::new().unwrap();
        let storage = Storage::open(dir.path().join("missing"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = storage
            .wait_ready(Duration::from_secs(5), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Cancelled));
    }
}
