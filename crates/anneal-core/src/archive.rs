//! Firmware archive access
//!
//! The restore pipeline reads everything it sends to the device out of a
//! single zip archive: boot chain components, the baseband firmware bundle,
//! metadata plists and the bootability tree. Entries are addressed by their
//! archive-relative path.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use thiserror::Error;
use tracing::debug;
use zip::ZipArchive;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("failed to open archive {}", .0.display())]
    Open(PathBuf, #[source] io::Error),
    #[error("archive is not readable: {0}")]
    Malformed(#[from] zip::result::ZipError),
    #[error("no entry named '{0}' in archive")]
    EntryNotFound(String),
    #[error("io error on archive entry '{0}'")]
    EntryIo(String, #[source] io::Error),
    #[error("aborted while listing entries: {0}")]
    VisitorAborted(String),
}

/// POSIX-like metadata for one archive entry, handed to `list` visitors.
#[derive(Debug, Clone)]
pub struct EntryStat {
    pub name: String,
    pub size: u64,
    /// Unix mode bits; defaults to a plain file/directory mode when the
    /// archive carries none.
    pub mode: u32,
    pub mtime: u64,
}

impl EntryStat {
    pub fn is_regular(&self) -> bool {
        self.mode & 0o170000 == 0o100000
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & 0o170000 == 0o120000
    }
}

/// Read access to the firmware archive.
///
/// The underlying zip handle is shared behind a mutex; the restore loop is
/// cooperative so contention is limited to the data-port side channels.
pub struct FirmwareArchive {
    path: PathBuf,
    inner: Mutex<ZipArchive<File>>,
}

impl FirmwareArchive {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, ArchiveError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| ArchiveError::Open(path.clone(), e))?;
        let archive = ZipArchive::new(file)?;
        debug!(path = %path.display(), entries = archive.len(), "Opened firmware archive");
        Ok(Self {
            path,
            inner: Mutex::new(archive),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `entry` names a file inside the archive.
    pub fn exists(&self, entry: &str) -> bool {
        let mut archive = self.inner.lock().unwrap();
        let result = archive.by_name(entry).is_ok();
        result
    }

    /// Read an entire entry into memory.
    pub fn extract_to_memory(&self, entry: &str) -> Result<Vec<u8>, ArchiveError> {
        let mut archive = self.inner.lock().unwrap();
        let mut file = match archive.by_name(entry) {
            Ok(f) => f,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(ArchiveError::EntryNotFound(entry.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut buf = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut buf)
            .map_err(|e| ArchiveError::EntryIo(entry.to_string(), e))?;
        Ok(buf)
    }

    /// Stream an entry into a file on disk.
    pub fn extract_to_file(&self, entry: &str, dest: &Path) -> Result<(), ArchiveError> {
        let mut archive = self.inner.lock().unwrap();
        let mut file = match archive.by_name(entry) {
            Ok(f) => f,
            Err(zip::result::ZipError::FileNotFound) => {
                return Err(ArchiveError::EntryNotFound(entry.to_string()))
            }
            Err(e) => return Err(e.into()),
        };
        let mut out = File::create(dest).map_err(|e| ArchiveError::EntryIo(entry.to_string(), e))?;
        io::copy(&mut file, &mut out).map_err(|e| ArchiveError::EntryIo(entry.to_string(), e))?;
        Ok(())
    }

    /// Walk every entry, calling `visitor` with its stat. A visitor error
    /// aborts the walk and is returned to the caller.
    pub fn list<F>(&self, mut visitor: F) -> Result<(), ArchiveError>
    where
        F: FnMut(&EntryStat) -> Result<(), ArchiveError>,
    {
        let mut archive = self.inner.lock().unwrap();
        for i in 0..archive.len() {
            let file = archive.by_index(i)?;
            let default_mode = if file.is_dir() { 0o040755 } else { 0o100644 };
            let stat = EntryStat {
                name: file.name().to_string(),
                size: file.size(),
                mode: file.unix_mode().unwrap_or(default_mode),
                mtime: 0,
            };
            visitor(&stat)?;
        }
        Ok(())
    }
}
