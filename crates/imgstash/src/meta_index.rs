//! Persistent metadata index for cached images.
//!
//! The index is a single `meta.json` document in the cache directory,
//! mapping image names to [`MetaEntry`] records. Every operation is a full
//! read-modify-write under an in-process mutex, so concurrent callers
//! observe serialised reads and writes; the document itself is replaced
//! atomically (write a temp sibling, then rename).
//!
//! # Read contract
//!
//! - a missing file reads as the empty map;
//! - a zero-length file reads as the empty map;
//! - a present, non-empty file that is not valid JSON fails with
//!   [`CacheError::MetadataCorrupt`].
//!
//! # Write contract
//!
//! The document is pretty-printed JSON with 4-space indentation, keyed by
//! image name:
//!
//! ```json
//! {
//!     "registry.local/app:1.4": {
//!         "ImageName": "registry.local/app:1.4",
//!         "ImageID": "sha256:9f3c…",
//!         "UpdatedAt": "2024-06-15T12:30:00Z"
//!     }
//! }
//! ```

use std::collections::HashMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};
use crate::scratch::unique_suffix;

/// Name of the index document inside the cache directory.
pub const META_FILE: &str = "meta.json";

/// Record describing one cached image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaEntry {
    /// Canonical reference string used by the daemon, e.g. `repo/path:tag`.
    #[serde(rename = "ImageName")]
    pub image_name: String,

    /// Identifier assigned by the daemon at inspect time; changes whenever
    /// the underlying content changes.
    #[serde(rename = "ImageID")]
    pub image_id: String,

    /// Instant of the most recent successful store write for this entry.
    #[serde(rename = "UpdatedAt")]
    pub updated_at: DateTime<Utc>,
}

/// File-backed index of [`MetaEntry`] records keyed by image name.
#[derive(Debug)]
pub struct MetaIndex {
    path: PathBuf,
    lock: Mutex<()>,
}

impl MetaIndex {
    /// Create an index stored as `meta.json` under `dir`.
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            path: dir.as_ref().join(META_FILE),
            lock: Mutex::new(()),
        }
    }

    /// Look up a single entry. A missing key is [`CacheError::NotFound`].
    pub fn get(&self, image_name: &str) -> Result<MetaEntry> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let data = self.read()?;
        data.get(image_name).cloned().ok_or(CacheError::NotFound)
    }

    /// Return every entry, in no particular order.
    pub fn get_all(&self) -> Result<Vec<MetaEntry>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.read()?.into_values().collect())
    }

    /// Insert or replace the entry keyed by its `image_name`.
    pub fn set(&self, entry: MetaEntry) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut data = self.read()?;
        data.insert(entry.image_name.clone(), entry);
        self.write(&data)
    }

    /// Remove an entry. Removing an absent key is a successful no-op.
    pub fn remove(&self, image_name: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut data = self.read()?;
        data.remove(image_name);
        self.write(&data)
    }

    /// Succeeds iff the directory holding the index exists and is a
    /// directory.
    pub fn ready(&self) -> Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        let stat = fs::metadata(dir)?;
        if !stat.is_dir() {
            return Err(CacheError::Io(std::io::Error::new(
                ErrorKind::NotADirectory,
                format!("'{}' is a file, directory is expected", dir.display()),
            )));
        }
        Ok(())
    }

    fn read(&self) -> Result<HashMap<String, MetaEntry>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(HashMap::new()),
            Err(err) => return Err(err.into()),
        };
        if content.trim().is_empty() {
            return Ok(HashMap::new());
        }
        serde_json::from_str(&content).map_err(CacheError::MetadataCorrupt)
    }

    fn write(&self, data: &HashMap<String, MetaEntry>) -> Result<()> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut ser = serde_json::Serializer::with_formatter(&mut buf, formatter);
        data.serialize(&mut ser)
            .map_err(|err| CacheError::Io(err.into()))?;

        // Atomic replace: write a temp sibling, then rename over the index.
        let tmp = self
            .path
            .with_file_name(format!("{}.{}.tmp", META_FILE, unique_suffix()));
        fs::write(&tmp, &buf)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(name: &str, id: &str) -> MetaEntry {
        MetaEntry {
            image_name: name.to_string(),
            image_id: id.to_string(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_missing_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        let index = MetaIndex::new(dir.path());

        assert!(index.get_all().unwrap().is_empty());
        assert!(matches!(index.get("a"), Err(CacheError::NotFound)));
    }

    #[test]
    fn test_zero_length_file_reads_as_empty() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(META_FILE), b"").unwrap();

        let index = MetaIndex::new(dir.path());
        assert!(index.get_all().unwrap().is_empty());
    }

    #[test]
    fn test_invalid_json_is_metadata_corrupt() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join(META_FILE), b"{not json").unwrap();

        let index = MetaIndex::new(dir.path());
        assert!(matches!(
            index.get_all(),
            Err(CacheError::MetadataCorrupt(_))
        ));
    }

    #[test]
    fn test_set_get_roundtrip() {
        let dir = TempDir::new().unwrap();
        let index = MetaIndex::new(dir.path());

        index.set(entry("repo/app:1", "sha256:aa")).unwrap();
        index.set(entry("repo/app:2", "sha256:bb")).unwrap();

        let got = index.get("repo/app:1").unwrap();
        assert_eq!(got.image_name, "repo/app:1");
        assert_eq!(got.image_id, "sha256:aa");
        assert_eq!(index.get_all().unwrap().len(), 2);
    }

    #[test]
    fn test_set_replaces_by_name() {
        let dir = TempDir::new().unwrap();
        let index = MetaIndex::new(dir.path());

        index.set(entry("repo/app:1", "sha256:old")).unwrap();
        index.set(entry("repo/app:1", "sha256:new")).unwrap();

        assert_eq!(index.get_all().unwrap().len(), 1);
        assert_eq!(index.get("repo/app:1").unwrap().image_id, "sha256:new");
    }

    #[test]
    fn test_remove_absent_key_is_ok() {
        let dir = TempDir::new().unwrap();
        let index = MetaIndex::new(dir.path());

        index.remove("never-there").unwrap();

        index.set(entry("a", "1")).unwrap();
        index.remove("a").unwrap();
        assert!(matches!(index.get("a"), Err(CacheError::NotFound)));
    }

    #[test]
    fn test_output_is_pretty_printed_with_field_names() {
        let dir = TempDir::new().unwrap();
        let index = MetaIndex::new(dir.path());
        index.set(entry("repo/app:1", "sha256:aa")).unwrap();

        let raw = std::fs::read_to_string(dir.path().join(META_FILE)).unwrap();
        assert!(raw.contains("    \"repo/app:1\""));
        assert!(raw.contains("\"ImageName\""));
        assert!(raw.contains("\"ImageID\""));
        assert!(raw.contains("\"UpdatedAt\""));
    }

    #[test]
    fn test_ready_requires_directory() {
        let dir = TempDir::new().unwrap();
        let index = MetaIndex::new(dir.path());
        index.ready().unwrap();

        let index = MetaIndex::new(dir.path().join("nope"));
        assert!(index.ready().is_err());
    }
}
