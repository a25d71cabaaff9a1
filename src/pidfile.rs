/// PID file: the decimal process id written on start, removed on graceful stop.
use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

/// Owner read/write, group and other read.
const PID_FILE_MODE: u32 = 0o644;

/// Errors that can occur while managing the PID file.
#[derive(Debug)]
pub enum PidFileError {
    /// Failed to open or create the file.
    Create {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to write the process id.
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    /// Failed to stat the file before removal (including "not found").
    Stat {
        path: PathBuf,
        source: std::io::Error,
    },
    /// The configured path names a directory.
    IsDirectory { path: PathBuf },
    /// Failed to unlink the file.
    Remove {
        path: PathBuf,
        source: std::io::Error,
    },
}

impl std::fmt::Display for PidFileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PidFileError::Create { path, source } => {
                write!(f, "could not open pid file {}: {}", path.display(), source)
            }
            PidFileError::Write { path, source } => {
                write!(f, "could not write pid file {}: {}", path.display(), source)
            }
            PidFileError::Stat { path, source } => {
                write!(f, "could not stat pid file {}: {}", path.display(), source)
            }
            PidFileError::IsDirectory { path } => {
                write!(f, "pid file path {} is a directory", path.display())
            }
            PidFileError::Remove { path, source } => {
                write!(f, "could not remove pid file {}: {}", path.display(), source)
            }
        }
    }
}

impl std::error::Error for PidFileError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PidFileError::Create { source, .. } => Some(source),
            PidFileError::Write { source, .. } => Some(source),
            PidFileError::Stat { source, .. } => Some(source),
            PidFileError::IsDirectory { .. } => None,
            PidFileError::Remove { source, .. } => Some(source),
        }
    }
}

/// A PID file at a fixed path.
#[derive(Debug, Clone)]
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Create (or truncate) the file and write the current process id.
    pub fn create(&self) -> Result<(), PidFileError> {
        tracing::info!(path = %self.path.display(), "creating pid file");

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(PID_FILE_MODE)
            .open(&self.path)
            .map_err(|e| PidFileError::Create {
                path: self.path.clone(),
                source: e,
            })?;

        write!(file, "{}", std::process::id()).map_err(|e| PidFileError::Write {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Remove the file. Refuses to remove a directory.
    pub fn remove(&self) -> Result<(), PidFileError> {
        tracing::debug!(path = %self.path.display(), "removing pid file");

        let metadata = std::fs::metadata(&self.path).map_err(|e| PidFileError::Stat {
            path: self.path.clone(),
            source: e,
        })?;
        if metadata.is_dir() {
            return Err(PidFileError::IsDirectory {
                path: self.path.clone(),
            });
        }

        std::fs::remove_file(&self.path).map_err(|e| PidFileError::Remove {
            path: self.path.clone(),
            source: e,
        })
    }
}
