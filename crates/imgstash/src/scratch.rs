//! Self-deleting scratch file backing recomposed image tars.
//!
//! [`crate::blob_store::BlobStore::load`] materialises the recomposed tar
//! into a temporary file and hands it to the caller as a read-once stream.
//! The file must disappear once the consumer is done with it, on every exit
//! path, so the backing file is unlinked on drop. An explicit [`close`]
//! reports the close outcome and swallows a failed unlink — the file is
//! already condemned and a later temp-dir sweep will catch it.
//!
//! [`close`]: ScratchFile::close

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};

use tempfile::{NamedTempFile, TempPath};
use tracing::debug;

/// Generate a short unique suffix for temp-sibling file names.
///
/// Uniqueness only needs to hold within this process, which owns the cache
/// directory exclusively; timestamp plus pid is enough.
pub(crate) fn unique_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};

    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{:x}-{:x}", std::process::id(), nanos)
}

/// A temporary file that removes itself when dropped or closed.
#[derive(Debug)]
pub struct ScratchFile {
    file: File,
    path: TempPath,
}

impl ScratchFile {
    /// Create an empty scratch file under the system temporary directory.
    pub fn new() -> io::Result<Self> {
        let (file, path) = NamedTempFile::new()?.into_parts();
        Ok(Self { file, path })
    }

    /// Rewind to the start so the written content can be read back.
    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).map(|_| ())
    }

    /// Split into the open file handle and the deletion guard.
    ///
    /// The file stays readable through the returned handle; the file is
    /// unlinked when the [`TempPath`] is dropped, so the guard must be kept
    /// alive for as long as the handle is in use.
    pub fn into_parts(self) -> (File, TempPath) {
        (self.file, self.path)
    }

    /// Close the file and remove it.
    ///
    /// Returns the outcome of the close; a failure to unlink afterwards is
    /// logged and ignored.
    pub fn close(self) -> io::Result<()> {
        let Self { file, path } = self;
        drop(file);
        if let Err(err) = path.close() {
            debug!("removing scratch file: {err}");
        }
        Ok(())
    }
}

impl Read for ScratchFile {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

impl Write for ScratchFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for ScratchFile {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}
