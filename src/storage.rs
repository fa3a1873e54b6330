//! File-backed shared log.
//!
//! Every packet and timestamp record ends up in one append-only file.
//! Appends and full reads are serialized by a single mutex, so a reader
//! never observes a partial write and each read reflects exactly the
//! appends admitted before it.

use bytes::Bytes;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinError;
use tracing::{debug, info, trace, warn};

/// Shared log I/O failures.
#[derive(Debug)]
pub enum LogError {
    Open(PathBuf, io::Error),
    Write(PathBuf, io::Error),
    Read(PathBuf, io::Error),
    Remove(PathBuf, io::Error),
    /// The blocking-pool task running the operation did not complete.
    Blocking(PathBuf, JoinError),
}

impl std::fmt::Display for LogError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogError::Open(path, e) => {
                write!(f, "failed to open data file '{}': {}", path.display(), e)
            }
            LogError::Write(path, e) => {
                write!(f, "failed to write data file '{}': {}", path.display(), e)
            }
            LogError::Read(path, e) => {
                write!(f, "failed to stream data file '{}': {}", path.display(), e)
            }
            LogError::Remove(path, e) => {
                write!(f, "failed to remove data file '{}': {}", path.display(), e)
            }
            LogError::Blocking(path, e) => {
                write!(f, "data file task for '{}' failed: {}", path.display(), e)
            }
        }
    }
}

impl std::error::Error for LogError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LogError::Open(_, e)
            | LogError::Write(_, e)
            | LogError::Read(_, e)
            | LogError::Remove(_, e) => Some(e),
            LogError::Blocking(_, e) => Some(e),
        }
    }
}

/// Append/read-all access to one persistent byte sequence.
pub struct SharedLog {
    path: PathBuf,
    /// Guards every file operation on `path`.
    lock: Mutex<()>,
}

impl SharedLog {
    /// Create a handle for the log at `path`. The file itself is created
    /// lazily on the first append.
    pub fn new(path: impl Into<PathBuf>) -> Arc<Self> {
        let path = path.into();
        info!(path = %path.display(), "Initializing shared log");
        Arc::new(Self {
            path,
            lock: Mutex::new(()),
        })
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    // A poisoned lock only means another holder panicked between file
    // operations; the file is still consistent at that point.
    fn lock(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Append `data` in full, creating the file if needed.
    pub fn append(&self, data: &[u8]) -> Result<(), LogError> {
        let _guard = self.lock();

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|e| LogError::Open(self.path.clone(), e))?;

        // write_all retries short writes and Interrupted.
        file.write_all(data)
            .map_err(|e| LogError::Write(self.path.clone(), e))?;

        trace!(bytes = data.len(), "Appended to shared log");
        Ok(())
    }

    /// Stream the entire log into `sink`.
    ///
    /// A missing file means nothing has been written yet: the call succeeds
    /// and writes zero bytes. Returns the number of bytes streamed.
    pub fn read_all<W: Write + ?Sized>(&self, sink: &mut W) -> Result<u64, LogError> {
        let _guard = self.lock();

        let mut file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(LogError::Open(self.path.clone(), e)),
        };

        io::copy(&mut file, sink).map_err(|e| LogError::Read(self.path.clone(), e))
    }

    /// Copy the whole log into memory.
    pub fn snapshot(&self) -> Result<Vec<u8>, LogError> {
        let mut contents = Vec::new();
        self.read_all(&mut contents)?;
        Ok(contents)
    }

    /// Delete the backing file. Absence is not an error.
    ///
    /// Returns whether a file was actually removed.
    pub fn remove(&self) -> Result<bool, LogError> {
        let _guard = self.lock();

        match fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Removed data file");
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove data file");
                Err(LogError::Remove(self.path.clone(), e))
            }
        }
    }

    /// [`append`](Self::append) on the blocking pool, for async callers.
    pub async fn append_async(self: &Arc<Self>, data: Bytes) -> Result<(), LogError> {
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || log.append(&data))
            .await
            .map_err(|e| LogError::Blocking(self.path.clone(), e))?
    }

    /// [`snapshot`](Self::snapshot) on the blocking pool, for async callers.
    pub async fn snapshot_async(self: &Arc<Self>) -> Result<Vec<u8>, LogError> {
        let log = Arc::clone(self);
        tokio::task::spawn_blocking(move || log.snapshot())
            .await
            .map_err(|e| LogError::Blocking(self.path.clone(), e))?
    }
}
