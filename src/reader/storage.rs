//! Storage collaborator: path policy, metadata and byte streams

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::warn;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("file not found: {0}")]
    NotFound(String),

    #[error("not a regular file: {0}")]
    NotAFile(String),

    #[error("access denied: {0}")]
    Denied(String),

    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl StorageError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        let path = path.display().to_string();
        match source.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path),
            std::io::ErrorKind::PermissionDenied => Self::Denied(path),
            _ => Self::Io { path, source },
        }
    }
}

/// A validated, readable file
#[derive(Debug, Clone)]
pub struct FileStat {
    /// Resolved path that later reads use
    pub path: PathBuf,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
}

pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// Where file bytes come from
#[async_trait]
pub trait FileStorage: Send + Sync {
    /// Validate a requested path and describe the file
    async fn stat(&self, path: &str) -> Result<FileStat, StorageError>;

    /// Stream the file's bytes
    async fn open(&self, file: &FileStat) -> Result<ByteStream, StorageError>;

    /// Read the whole file
    async fn read(&self, file: &FileStat) -> Result<Vec<u8>, StorageError>;
}

/// Local filesystem with an optional directory allow-list
#[derive(Debug, Clone)]
pub struct LocalFileStorage {
    allowed_dirs: Vec<PathBuf>,
    allow_relative: bool,
}

impl LocalFileStorage {
    /// Empty `allowed_dirs` means no directory restriction
    pub fn new(allowed_dirs: Vec<PathBuf>, allow_relative: bool) -> Self {
        let allowed_dirs = allowed_dirs
            .into_iter()
            .map(|dir| match std::fs::canonicalize(&dir) {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(dir = %dir.display(), error = %e, "Allowed directory cannot be resolved");
                    dir
                }
            })
            .collect();
        Self {
            allowed_dirs,
            allow_relative,
        }
    }

    pub fn unrestricted() -> Self {
        Self::new(Vec::new(), false)
    }

    fn is_allowed(&self, resolved: &Path) -> bool {
        self.allowed_dirs.is_empty() || self.allowed_dirs.iter().any(|dir| resolved.starts_with(dir))
    }
}

#[async_trait]
impl FileStorage for LocalFileStorage {
    async fn stat(&self, path: &str) -> Result<FileStat, StorageError> {
        let requested = Path::new(path);
        if requested.is_relative() && !self.allow_relative {
            return Err(StorageError::Denied(format!("relative paths are not allowed: {path}")));
        }

        // Symlinks and `..` are resolved before the allow-list check
        let resolved = tokio::fs::canonicalize(requested)
            .await
            .map_err(|e| StorageError::io(requested, e))?;
        if !self.is_allowed(&resolved) {
            return Err(StorageError::Denied(format!("{path} is outside the allowed directories")));
        }

        let metadata = tokio::fs::metadata(&resolved)
            .await
            .map_err(|e| StorageError::io(&resolved, e))?;
        if !metadata.is_file() {
            return Err(StorageError::NotAFile(path.to_string()));
        }

        Ok(FileStat {
            path: resolved,
            size: metadata.len(),
            modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        })
    }

    async fn open(&self, file: &FileStat) -> Result<ByteStream, StorageError> {
        let handle = tokio::fs::File::open(&file.path)
            .await
            .map_err(|e| StorageError::io(&file.path, e))?;
        Ok(Box::new(handle))
    }

    async fn read(&self, file: &FileStat) -> Result<Vec<u8>, StorageError> {
        tokio::fs::read(&file.path)
            .await
            .map_err(|e| StorageError::io(&file.path, e))
    }
}
