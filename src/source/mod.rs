//! Object Fetch Abstraction
//!
//! The archiver reads every object through `ObjectSource::open_stream`,
//! which hands back a byte stream rather than a buffer so that large objects
//! never sit in memory whole.
//!
//! Implementations:
//! - `InMemoryObjectSource`: unit tests and simulation
//! - `LocalFsObjectSource`: development against a directory tree
//! - `S3ObjectSource`: production (feature `s3`)

#[cfg(feature = "s3")]
pub mod s3;

#[cfg(feature = "s3")]
pub use s3::{S3Config, S3ObjectSource};

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::future::Future;
use std::io::{Error as IoError, ErrorKind};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

/// Readable handle for one object version
pub type ObjectReader = Box<dyn AsyncRead + Send + Unpin>;

/// Error type for object fetches
#[derive(Debug)]
pub enum SourceError {
    /// Object (or that version of it) does not exist
    NotFound(String),
    /// Fetch exceeded its timeout
    TimedOut(String),
    /// I/O error
    Io(IoError),
}

impl SourceError {
    /// Short reason recorded in the manifest
    pub fn reason(&self) -> String {
        match self {
            SourceError::NotFound(_) => "not found".to_string(),
            SourceError::TimedOut(_) => "timed out".to_string(),
            SourceError::Io(e) => format!("io: {}", e),
        }
    }
}

impl std::fmt::Display for SourceError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SourceError::NotFound(key) => write!(f, "Object not found: {}", key),
            SourceError::TimedOut(key) => write!(f, "Fetch timed out: {}", key),
            SourceError::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for SourceError {}

impl From<IoError> for SourceError {
    fn from(e: IoError) -> Self {
        match e.kind() {
            ErrorKind::NotFound => SourceError::NotFound(e.to_string()),
            ErrorKind::TimedOut => SourceError::TimedOut(e.to_string()),
            _ => SourceError::Io(e),
        }
    }
}

/// Object storage read interface
pub trait ObjectSource: Send + Sync + 'static {
    /// Open a readable stream for one version of an object
    fn open_stream<'a>(
        &'a self,
        object_key: &'a str,
        version_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectReader, SourceError>> + Send + 'a>>;
}

// ============================================================================
// InMemoryObjectSource - For tests and simulation
// ============================================================================

/// In-memory object source keyed by (object_key, version_token)
///
/// Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectSource {
    objects: Arc<RwLock<HashMap<(String, String), Bytes>>>,
}

impl InMemoryObjectSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, object_key: &str, version_token: &str, data: impl Into<Bytes>) {
        self.objects
            .write()
            .insert((object_key.to_string(), version_token.to_string()), data.into());
    }

    /// Remove an object version; returns true if it existed
    pub fn delete(&self, object_key: &str, version_token: &str) -> bool {
        self.objects
            .write()
            .remove(&(object_key.to_string(), version_token.to_string()))
            .is_some()
    }

    pub fn get(&self, object_key: &str, version_token: &str) -> Option<Bytes> {
        self.objects
            .read()
            .get(&(object_key.to_string(), version_token.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }
}

impl ObjectSource for InMemoryObjectSource {
    fn open_stream<'a>(
        &'a self,
        object_key: &'a str,
        version_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectReader, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let data = self.get(object_key, version_token).ok_or_else(|| {
                SourceError::NotFound(format!("{}@{}", object_key, version_token))
            })?;
            Ok(Box::new(std::io::Cursor::new(data)) as ObjectReader)
        })
    }
}

// ============================================================================
// LocalFsObjectSource - For development
// ============================================================================

/// Object source over a local directory
///
/// Keys are paths relative to `base_path`. A plain filesystem keeps a single
/// version per key, so `version_token` is not used to pick the content.
#[derive(Debug, Clone)]
pub struct LocalFsObjectSource {
    base_path: PathBuf,
}

impl LocalFsObjectSource {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsObjectSource {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Resolve a key below `base_path`, rejecting keys that would escape it
    fn full_path(&self, key: &str) -> Result<PathBuf, SourceError> {
        let relative = Path::new(key);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || key.is_empty() {
            return Err(SourceError::Io(IoError::new(
                ErrorKind::InvalidInput,
                format!("Object key outside source root: {}", key),
            )));
        }
        Ok(self.base_path.join(relative))
    }
}

impl ObjectSource for LocalFsObjectSource {
    fn open_stream<'a>(
        &'a self,
        object_key: &'a str,
        _version_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectReader, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(object_key)?;
            let file = tokio::fs::File::open(&path).await?;
            Ok(Box::new(file) as ObjectReader)
        })
    }
}
