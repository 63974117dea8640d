use fs2::FileExt;
use std::fs::File;
use std::path::{Path, PathBuf};

/// Manages the agent's data directory (default `.agent/`).
///
/// The shutdown record and the singleton lock live here. Keeping them under
/// one root means the record has exactly one writer: whoever holds the lock.
#[derive(Debug, Clone)]
pub struct DataDir {
    root: PathBuf,
}

impl DataDir {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory (e.g. `.agent/`).
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to the singleton lock file.
    pub fn lock(&self) -> PathBuf {
        self.root.join("lock")
    }

    /// Create the directory if it doesn't exist.
    /// Returns Ok(true) if it was created, Ok(false) if it already existed.
    pub fn init(&self) -> std::io::Result<bool> {
        let created = !self.root.exists();
        std::fs::create_dir_all(&self.root)?;
        Ok(created)
    }

    /// Take the exclusive process lock on this directory.
    ///
    /// Fails immediately if another process holds it. The lock is released
    /// when the returned guard is dropped or the process dies.
    pub fn acquire_lock(&self) -> Result<InstanceLock, LockError> {
        let path = self.lock();
        let file = File::create(&path).map_err(|e| LockError::Open {
            path: path.clone(),
            source: e,
        })?;
        FileExt::try_lock_exclusive(&file).map_err(|e| LockError::Held {
            path: path.clone(),
            source: e,
        })?;
        tracing::debug!(path = %path.display(), "acquired data dir lock");
        Ok(InstanceLock { file, path })
    }
}

/// Exclusive lock on a data directory, held for the life of the process.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            tracing::warn!(error = %e, path = %self.path.display(), "failed to release data dir lock");
        }
    }
}

#[derive(Debug)]
pub enum LockError {
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Another process owns this data directory.
    Held {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for LockError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LockError::Open { path, source } => {
                write!(f, "failed to open lock file {}: {source}", path.display())
            }
            LockError::Held { path, source } => write!(
                f,
                "data directory is in use by another process ({}): {source}",
                path.display()
            ),
        }
    }
}

impl std::error::Error for LockError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            LockError::Open { source, .. } => Some(source),
            LockError::Held { source, .. } => Some(source),
        }
    }
}
