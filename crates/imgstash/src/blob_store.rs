//! Tar-aware, layer-deduplicating image blob store.
//!
//! An image export tar is split on ingest into two kinds of state under the
//! cache directory:
//!
//! - `meta/<slug(image-name)>/` holds every non-layer file from the tar
//!   (`manifest.json`, the image config JSON, `repositories`, …);
//! - `layers/<layer-id>/` holds the layer payloads, shared between all
//!   images that reference the same layer id.
//!
//! `layer.tar` payloads are stored zstd-compressed at the fastest level; a
//! sidecar `layer.taroriginalSize` records the uncompressed byte length so
//! the original tar header can be reconstructed on load. A layer file that
//! already exists with the same byte size is not rewritten — deduplication
//! is by name and size, not content, trading a cryptographic check for I/O
//! savings.
//!
//! All file access is relative to a [`cap_std::fs::Dir`] handle on the
//! cache directory, and individual files are created atomically
//! (write-temp-sibling-then-rename). There is no rollback on failure:
//! partial state is repaired by the garbage-collection sweep that runs
//! after every mutating operation, which deletes any `layers/` entry no
//! stored manifest references.
//!
//! All public operations hold an in-process exclusive lock for their whole
//! duration, including the chained GC sweep. The lock is intra-process
//! only; the cache directory is owned by a single controller instance.

use std::collections::HashSet;
use std::io::{self, ErrorKind, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use cap_std::ambient_authority;
use cap_std::fs::{Dir, MetadataExt, Permissions};
use serde::Deserialize;
use tracing::warn;

use crate::error::{CacheError, Result};
use crate::scratch::{unique_suffix, ScratchFile};

/// Basename of the per-layer payload inside an image tar.
const LAYER_TAR: &str = "layer.tar";

/// Suffix appended to the payload name for the uncompressed-size sidecar.
const ORIGINAL_SIZE_SUFFIX: &str = "originalSize";

/// zstd "fastest" level; layer payloads favour speed over ratio.
const ZSTD_LEVEL: i32 = 1;

/// One image record inside `manifest.json` (a JSON array).
#[derive(Debug, Deserialize)]
struct ManifestImage {
    /// Tar-relative layer payload paths, e.g. `<layer-id>/layer.tar`.
    #[serde(rename = "Layers")]
    layers: Vec<String>,
}

/// A file or directory scheduled for inclusion in a recomposed tar.
struct TarSource {
    /// Path relative to the cache directory root.
    src: PathBuf,
    /// Path the entry gets inside the tar.
    tar_path: String,
}

/// On-disk image store rooted at the cache directory.
#[derive(Debug)]
pub struct BlobStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl BlobStore {
    /// Create a store rooted at `dir`. The directory is not touched until
    /// the first operation.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            root: dir.into(),
            lock: Mutex::new(()),
        }
    }

    /// Split an image export tar into metadata and shared layers.
    ///
    /// The stream is consumed entry by entry without buffering the whole
    /// archive. On error the operation aborts leaving partial state for the
    /// chained GC sweep (and the next save) to repair.
    pub fn save(&self, image_name: &str, dump: impl Read) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.save_locked(image_name, dump);
        self.clean_up_locked();
        result
    }

    /// Recompose the stored image into a tar stream.
    ///
    /// The returned file deletes itself once the consumer drops or closes
    /// it. Fails with [`CacheError::ImageMissing`] when the image was never
    /// saved (or has been removed).
    pub fn load(&self, image_name: &str) -> Result<ScratchFile> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.load_locked(image_name)
    }

    /// Delete the image's metadata directory, then sweep unreferenced
    /// layers.
    pub fn remove(&self, image_name: &str) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.remove_locked(image_name);
        self.clean_up_locked();
        result
    }

    /// Whether the image's metadata directory exists.
    pub fn is_exist(&self, image_name: &str) -> Result<bool> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let root = self.root_dir()?;
        match root.metadata(meta_rel(image_name)) {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err.into()),
        }
    }

    /// Delete every stored image whose name is not in `image_names`, then
    /// sweep unreferenced layers. Used during startup reconciliation.
    pub fn remove_not_in(&self, image_names: &[String]) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let result = self.remove_not_in_locked(image_names);
        self.clean_up_locked();
        result
    }

    /// Succeeds iff the cache directory exists and is a directory.
    pub fn ready(&self) -> Result<()> {
        let stat = std::fs::metadata(&self.root)?;
        if !stat.is_dir() {
            return Err(CacheError::Io(io::Error::new(
                ErrorKind::NotADirectory,
                format!("'{}' is a file, directory is expected", self.root.display()),
            )));
        }
        Ok(())
    }

    fn root_dir(&self) -> Result<Dir> {
        Ok(Dir::open_ambient_dir(&self.root, ambient_authority())?)
    }

    fn save_locked(&self, image_name: &str, dump: impl Read) -> Result<()> {
        let root = self.root_dir()?;
        let meta_dir = meta_rel(image_name);
        root.create_dir_all(&meta_dir)?;

        let mut archive = tar::Archive::new(dump);
        // Name of the most recent directory entry, trailing slash included.
        // Image tars place every layer file directly after its directory.
        let mut current_layer: Option<String> = None;

        for entry in archive.entries()? {
            let mut entry = entry?;
            let raw_path = String::from_utf8_lossy(&entry.path_bytes()).into_owned();
            let mode = entry.header().mode()?;
            let size = entry.size();

            // Every directory entry is treated as a layer root.
            if entry.header().entry_type().is_dir() {
                let dst = Path::new("layers").join(&raw_path);
                root.create_dir_all(&dst)?;
                set_mode(&root, &dst, mode)?;
                current_layer = Some(raw_path);
                continue;
            }

            // A file under the current layer directory is a layer file.
            if let Some(layer) = &current_layer {
                if raw_path.starts_with(layer.as_str()) {
                    self.save_layer_file(&root, &raw_path, mode, size, &mut entry)?;
                    continue;
                }
            }

            // Everything else is image metadata.
            let dst = meta_dir.join(&raw_path);
            atomic_copy(&root, &dst, mode, false, &mut entry)?;
        }

        Ok(())
    }

    fn save_layer_file(
        &self,
        root: &Dir,
        raw_path: &str,
        mode: u32,
        size: u64,
        entry: &mut impl Read,
    ) -> Result<()> {
        let dst = Path::new("layers").join(raw_path);
        let compress = file_name(raw_path) == LAYER_TAR;
        let sidecar = PathBuf::from(format!("{}{}", dst.display(), ORIGINAL_SIZE_SUFFIX));

        // Skip-existing rule: a file with the same name and declared size
        // is assumed identical and never rewritten. A compressed payload is
        // stored with a different byte length, so its declared size is
        // compared against the recorded original size instead.
        match root.metadata(&dst) {
            Ok(stat) => {
                let stored_size = if compress {
                    read_original_size(root, &sidecar.to_string_lossy()).ok()
                } else {
                    Some(stat.len())
                };
                if stored_size == Some(size) {
                    return Ok(());
                }
            }
            Err(err) if err.kind() == ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }

        if compress {
            atomic_write(root, &sidecar, size.to_string().as_bytes())?;
        }
        atomic_copy(root, &dst, mode, compress, entry)
    }

    fn load_locked(&self, image_name: &str) -> Result<ScratchFile> {
        let root = self.root_dir()?;
        let meta_path = meta_rel(image_name);
        let meta_dir = match root.open_dir(&meta_path) {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return Err(CacheError::ImageMissing(image_name.to_string()))
            }
            Err(err) => return Err(err.into()),
        };

        let mut schedule = Vec::new();
        for name in sorted_entry_names(&meta_dir)? {
            schedule.push(TarSource {
                src: meta_path.join(&name),
                tar_path: name,
            });
        }

        let manifest_raw = meta_dir.read_to_string("manifest.json")?;
        let manifest: Vec<ManifestImage> =
            serde_json::from_str(&manifest_raw).map_err(CacheError::MetadataCorrupt)?;

        for image in &manifest {
            for layer_file in &image.layers {
                let layer_id = match Path::new(layer_file).parent() {
                    Some(parent) if parent != Path::new("") => parent.to_path_buf(),
                    _ => continue,
                };
                let layer_rel = Path::new("layers").join(&layer_id);
                let layer_dir = root.open_dir(&layer_rel)?;

                schedule.push(TarSource {
                    src: layer_rel.clone(),
                    tar_path: format!("{}/", layer_id.display()),
                });
                for name in sorted_entry_names(&layer_dir)? {
                    schedule.push(TarSource {
                        src: layer_rel.join(&name),
                        tar_path: format!("{}/{}", layer_id.display(), name),
                    });
                }
            }
        }

        let mut out = ScratchFile::new()?;
        compose_tar(&root, &schedule, &mut out)?;
        out.rewind()?;
        Ok(out)
    }

    fn remove_locked(&self, image_name: &str) -> Result<()> {
        let root = self.root_dir()?;
        match root.remove_dir_all(meta_rel(image_name)) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    fn remove_not_in_locked(&self, image_names: &[String]) -> Result<()> {
        let root = self.root_dir()?;
        let allowed: HashSet<String> = image_names.iter().map(|name| slug(name)).collect();

        let meta_dir = match root.open_dir("meta") {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in meta_dir.entries()? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if allowed.contains(&name) {
                continue;
            }
            if entry.file_type()?.is_dir() {
                meta_dir.remove_dir_all(&name)?;
            } else {
                meta_dir.remove_file(&name)?;
            }
        }
        Ok(())
    }

    /// Sweep `layers/` entries no stored manifest references.
    ///
    /// Runs after every mutating operation, under the operation's lock.
    /// Failures are logged and swallowed; the next mutation retries. If the
    /// reference set cannot be collected in full, the sweep is skipped
    /// entirely so that referenced layers are never deleted against a
    /// partial set.
    fn clean_up_locked(&self) {
        let root = match self.root_dir() {
            Ok(root) => root,
            Err(err) => {
                warn!("layer sweep skipped: {err}");
                return;
            }
        };

        let referenced = match collect_referenced_layers(&root) {
            Ok(referenced) => referenced,
            Err(err) => {
                warn!("layer sweep skipped: {err}");
                return;
            }
        };

        let layers_dir = match root.open_dir("layers") {
            Ok(dir) => dir,
            Err(err) if err.kind() == ErrorKind::NotFound => return,
            Err(err) => {
                warn!("layer sweep skipped: {err}");
                return;
            }
        };

        let entries = match layers_dir.entries() {
            Ok(entries) => entries,
            Err(err) => {
                warn!("layer sweep skipped: {err}");
                return;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    warn!("layer sweep: {err}");
                    continue;
                }
            };
            let name = entry.file_name().to_string_lossy().into_owned();
            if referenced.contains(&name) {
                continue;
            }
            let removed = match entry.file_type() {
                Ok(file_type) if file_type.is_dir() => layers_dir.remove_dir_all(&name),
                Ok(_) => layers_dir.remove_file(&name),
                Err(err) => Err(err),
            };
            if let Err(err) = removed {
                warn!("layer sweep: removing '{name}': {err}");
            }
        }
    }
}

/// Write the scheduled entries as a tar archive, reversing the on-disk
/// transforms: `layer.tar` payloads stream through a zstd decoder with the
/// header size taken from the sidecar, everything else copies verbatim
/// with its on-disk size and mode.
fn compose_tar<W: Write>(root: &Dir, schedule: &[TarSource], out: W) -> Result<()> {
    let mut builder = tar::Builder::new(out);

    for item in schedule {
        let stat = root.metadata(&item.src)?;
        let mut header = tar::Header::new_gnu();
        header.set_mode(stat.mode() & 0o7777);
        header.set_mtime(stat.mtime().max(0) as u64);

        if stat.is_dir() {
            header.set_entry_type(tar::EntryType::Directory);
            header.set_size(0);
            builder.append_data(&mut header, &item.tar_path, io::empty())?;
        } else if file_name(&item.tar_path) == LAYER_TAR {
            let sidecar = format!("{}{}", item.src.display(), ORIGINAL_SIZE_SUFFIX);
            let original_size = read_original_size(root, &sidecar)?;
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(original_size);
            let file = root.open(&item.src)?;
            let decoder = zstd::stream::read::Decoder::new(file)?;
            builder.append_data(&mut header, &item.tar_path, decoder)?;
        } else {
            header.set_entry_type(tar::EntryType::Regular);
            header.set_size(stat.len());
            let file = root.open(&item.src)?;
            builder.append_data(&mut header, &item.tar_path, file)?;
        }
    }

    builder.finish()?;
    Ok(())
}

/// Collect the set of layer ids referenced by any stored manifest.
fn collect_referenced_layers(root: &Dir) -> Result<HashSet<String>> {
    let mut referenced = HashSet::new();
    let meta_dir = match root.open_dir("meta") {
        Ok(dir) => dir,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(referenced),
        Err(err) => return Err(err.into()),
    };

    for entry in meta_dir.entries()? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let image_dir = entry.open_dir()?;
        let raw = match image_dir.read_to_string("manifest.json") {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => continue,
            Err(err) => return Err(err.into()),
        };
        let manifest: Vec<ManifestImage> =
            serde_json::from_str(&raw).map_err(CacheError::MetadataCorrupt)?;
        for image in &manifest {
            for layer_file in &image.layers {
                if let Some(parent) = Path::new(layer_file).parent() {
                    if parent != Path::new("") {
                        referenced.insert(parent.to_string_lossy().into_owned());
                    }
                }
            }
        }
    }
    Ok(referenced)
}

/// Metadata directory for an image, relative to the cache root.
fn meta_rel(image_name: &str) -> PathBuf {
    Path::new("meta").join(slug(image_name))
}

/// Filesystem-safe encoding of an image name: every run of characters
/// outside `[0-9A-Za-z_]` becomes a single underscore. Lossy — distinct
/// names can collide, in which case the later save owns the directory.
fn slug(image_name: &str) -> String {
    let mut out = String::with_capacity(image_name.len());
    let mut in_run = false;
    for c in image_name.chars() {
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
            in_run = false;
        } else if !in_run {
            out.push('_');
            in_run = true;
        }
    }
    out
}

/// Final path component of a tar-internal name.
fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Entry names of a directory, lexicographically sorted.
fn sorted_entry_names(dir: &Dir) -> Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in dir.entries()? {
        names.push(entry?.file_name().to_string_lossy().into_owned());
    }
    names.sort();
    Ok(names)
}

fn read_original_size(root: &Dir, sidecar: &str) -> Result<u64> {
    let raw = root.read_to_string(sidecar)?;
    raw.trim().parse::<u64>().map_err(|err| {
        CacheError::Io(io::Error::new(
            ErrorKind::InvalidData,
            format!("sidecar '{sidecar}': {err}"),
        ))
    })
}

fn set_mode(root: &Dir, path: &Path, mode: u32) -> Result<()> {
    let perms = Permissions::from_std(std::fs::Permissions::from_mode(mode));
    root.set_permissions(path, perms)?;
    Ok(())
}

/// Temp-sibling name used for atomic creation next to `dest`.
fn tmp_sibling(dest: &Path) -> PathBuf {
    let base = dest
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();
    dest.with_file_name(format!(".{}.{}.tmp", base, unique_suffix()))
}

/// Atomically create `dest` with the given content.
fn atomic_write(root: &Dir, dest: &Path, content: &[u8]) -> Result<()> {
    let tmp = tmp_sibling(dest);
    root.write(&tmp, content)?;
    root.rename(&tmp, root, dest)?;
    Ok(())
}

/// Atomically create `dest` by streaming from `src`, optionally through a
/// zstd encoder. The temp sibling is cleaned up on copy failure.
fn atomic_copy(root: &Dir, dest: &Path, mode: u32, compress: bool, src: &mut impl Read) -> Result<()> {
    let tmp = tmp_sibling(dest);
    let mut file = root.create(&tmp)?;

    let copied = if compress {
        zstd::stream::write::Encoder::new(&mut file, ZSTD_LEVEL)
            .and_then(|mut encoder| {
                io::copy(src, &mut encoder)?;
                encoder.finish().map(|_| ())
            })
    } else {
        io::copy(src, &mut file).map(|_| ())
    };
    drop(file);
    if let Err(err) = copied {
        let _ = root.remove_file(&tmp);
        return Err(err.into());
    }

    set_mode(root, &tmp, mode)?;
    root.rename(&tmp, root, dest)?;
    Ok(())
}
