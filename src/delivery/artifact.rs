//! Artifact Store Abstraction
//!
//! Every archive is persisted as an artifact before it is sent to the sink.
//! The upload is streamed through the Integrity Hasher, and the resulting
//! digest is attached afterwards with `update_metadata`, a write that only
//! touches metadata and never re-sends the archive bytes.
//!
//! Implementations:
//! - `InMemoryArtifactStore`: unit tests and simulation
//! - `LocalFsArtifactStore`: metadata in a `{key}.meta.json` sidecar
//! - `S3ArtifactStore`: production (feature `s3`), sidecar object for metadata

use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};

/// Metadata attached to an artifact
pub type ArtifactMetadata = BTreeMap<String, String>;

/// Metadata key holding the hex SHA-256 of the artifact
pub const META_SHA256: &str = "sha256";
pub const META_INVOCATION: &str = "invocation-id";
pub const META_ENTRIES: &str = "entries";

/// Stream handed to `put_stream`
pub type ArtifactBody<'a> = Box<dyn AsyncRead + Send + Unpin + 'a>;

/// Stored artifact description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactInfo {
    pub key: String,
    pub size_bytes: u64,
    pub metadata: ArtifactMetadata,
}

/// Persistent storage for finished archives
pub trait ArtifactStore: Send + Sync + 'static {
    /// Store the stream under `key`, replacing any previous artifact.
    /// Returns the number of bytes stored.
    fn put_stream<'a>(
        &'a self,
        key: &'a str,
        body: ArtifactBody<'a>,
    ) -> Pin<Box<dyn Future<Output = IoResult<u64>> + Send + 'a>>;

    /// Merge `metadata` into the artifact's metadata. NotFound if the
    /// artifact does not exist.
    fn update_metadata<'a>(
        &'a self,
        key: &'a str,
        metadata: &'a ArtifactMetadata,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>>;

    /// Size and metadata without reading the content
    fn head<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = IoResult<ArtifactInfo>> + Send + 'a>>;
}

// ============================================================================
// InMemoryArtifactStore - For tests and simulation
// ============================================================================

#[derive(Debug, Clone)]
struct StoredArtifact {
    data: Bytes,
    metadata: ArtifactMetadata,
}

/// In-memory artifact store; clones share state
#[derive(Debug, Clone, Default)]
pub struct InMemoryArtifactStore {
    artifacts: Arc<RwLock<HashMap<String, StoredArtifact>>>,
    fail_puts: Arc<AtomicBool>,
}

impl InMemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following `put_stream` fail with an I/O error
    pub fn set_fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.artifacts.read().get(key).map(|a| a.data.clone())
    }

    pub fn metadata(&self, key: &str) -> Option<ArtifactMetadata> {
        self.artifacts.read().get(key).map(|a| a.metadata.clone())
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.artifacts.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.artifacts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.read().is_empty()
    }
}

impl ArtifactStore for InMemoryArtifactStore {
    fn put_stream<'a>(
        &'a self,
        key: &'a str,
        mut body: ArtifactBody<'a>,
    ) -> Pin<Box<dyn Future<Output = IoResult<u64>> + Send + 'a>> {
        Box::pin(async move {
            if self.fail_puts.load(Ordering::SeqCst) {
                return Err(IoError::new(ErrorKind::Other, "injected artifact put failure"));
            }
            let mut data = Vec::new();
            body.read_to_end(&mut data).await?;
            let len = data.len() as u64;
            self.artifacts.write().insert(
                key.to_string(),
                StoredArtifact {
                    data: Bytes::from(data),
                    metadata: ArtifactMetadata::new(),
                },
            );
            Ok(len)
        })
    }

    fn update_metadata<'a>(
        &'a self,
        key: &'a str,
        metadata: &'a ArtifactMetadata,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            let mut artifacts = self.artifacts.write();
            let stored = artifacts.get_mut(key).ok_or_else(|| {
                IoError::new(ErrorKind::NotFound, format!("Artifact not found: {}", key))
            })?;
            stored
                .metadata
                .extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            Ok(())
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = IoResult<ArtifactInfo>> + Send + 'a>> {
        Box::pin(async move {
            self.artifacts
                .read()
                .get(key)
                .map(|a| ArtifactInfo {
                    key: key.to_string(),
                    size_bytes: a.data.len() as u64,
                    metadata: a.metadata.clone(),
                })
                .ok_or_else(|| IoError::new(ErrorKind::NotFound, format!("Artifact not found: {}", key)))
        })
    }
}

// ============================================================================
// LocalFsArtifactStore - For development
// ============================================================================

/// Artifact store over a local directory
#[derive(Debug, Clone)]
pub struct LocalFsArtifactStore {
    base_path: PathBuf,
}

impl LocalFsArtifactStore {
    pub fn new(base_path: impl Into<PathBuf>) -> Self {
        LocalFsArtifactStore {
            base_path: base_path.into(),
        }
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn full_path(&self, key: &str) -> PathBuf {
        self.base_path.join(key)
    }

    fn sidecar_path(&self, key: &str) -> PathBuf {
        self.base_path.join(format!("{}.meta.json", key))
    }

    async fn ensure_parent(path: &Path) -> IoResult<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(())
    }

    async fn read_sidecar(&self, key: &str) -> IoResult<ArtifactMetadata> {
        match tokio::fs::read(self.sidecar_path(key)).await {
            Ok(raw) => serde_json::from_slice(&raw).map_err(|e| IoError::new(ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(ArtifactMetadata::new()),
            Err(e) => Err(e),
        }
    }

    /// Write through a temp name and rename so readers never see a torn file
    async fn write_atomic(path: &Path, data: &[u8]) -> IoResult<()> {
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await
    }
}

impl ArtifactStore for LocalFsArtifactStore {
    fn put_stream<'a>(
        &'a self,
        key: &'a str,
        mut body: ArtifactBody<'a>,
    ) -> Pin<Box<dyn Future<Output = IoResult<u64>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.full_path(key);
            Self::ensure_parent(&path).await?;

            let partial = path.with_extension("partial");
            let mut file = tokio::fs::File::create(&partial).await?;
            let copied = async {
                let written = tokio::io::copy(&mut body, &mut file).await?;
                file.flush().await?;
                file.sync_all().await?;
                Ok::<_, IoError>(written)
            }
            .await;
            drop(file);
            let written = match copied {
                Ok(written) => written,
                Err(e) => {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(e);
                }
            };

            tokio::fs::rename(&partial, &path).await?;
            // A replaced artifact starts with fresh metadata
            match tokio::fs::remove_file(self.sidecar_path(key)).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            Ok(written)
        })
    }

    fn update_metadata<'a>(
        &'a self,
        key: &'a str,
        metadata: &'a ArtifactMetadata,
    ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
        Box::pin(async move {
            if !tokio::fs::try_exists(self.full_path(key)).await? {
                return Err(IoError::new(
                    ErrorKind::NotFound,
                    format!("Artifact not found: {}", key),
                ));
            }
            let mut merged = self.read_sidecar(key).await?;
            merged.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
            let encoded =
                serde_json::to_vec_pretty(&merged).map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
            Self::write_atomic(&self.sidecar_path(key), &encoded).await
        })
    }

    fn head<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = IoResult<ArtifactInfo>> + Send + 'a>> {
        Box::pin(async move {
            let meta = tokio::fs::metadata(self.full_path(key)).await?;
            Ok(ArtifactInfo {
                key: key.to_string(),
                size_bytes: meta.len(),
                metadata: self.read_sidecar(key).await?,
            })
        })
    }
}

// ============================================================================
// S3ArtifactStore - For production
// ============================================================================

#[cfg(feature = "s3")]
pub use s3_artifact::S3ArtifactStore;

#[cfg(feature = "s3")]
mod s3_artifact {
    use super::*;
    use crate::source::s3::{map_error, S3Config};
    use object_store::buffered::BufWriter;
    use object_store::{ObjectStore, PutPayload};

    /// Artifact store writing to S3 via multipart upload
    #[derive(Clone)]
    pub struct S3ArtifactStore {
        store: Arc<dyn ObjectStore>,
        config: S3Config,
    }

    impl S3ArtifactStore {
        pub fn new(config: S3Config) -> IoResult<Self> {
            let store = config.build_store()?;
            Ok(S3ArtifactStore { store, config })
        }

        pub fn from_store(store: Arc<dyn ObjectStore>, config: S3Config) -> Self {
            S3ArtifactStore { store, config }
        }

        async fn read_sidecar(&self, key: &str) -> IoResult<ArtifactMetadata> {
            let path = self.config.full_path(&format!("{}.meta.json", key));
            match self.store.get(&path).await {
                Ok(result) => {
                    let raw = result.bytes().await.map_err(map_error)?;
                    serde_json::from_slice(&raw).map_err(|e| IoError::new(ErrorKind::InvalidData, e))
                }
                Err(object_store::Error::NotFound { .. }) => Ok(ArtifactMetadata::new()),
                Err(e) => Err(map_error(e)),
            }
        }
    }

    impl std::fmt::Debug for S3ArtifactStore {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("S3ArtifactStore")
                .field("bucket", &self.config.bucket)
                .field("prefix", &self.config.prefix)
                .finish()
        }
    }

    impl ArtifactStore for S3ArtifactStore {
        fn put_stream<'a>(
            &'a self,
            key: &'a str,
            mut body: ArtifactBody<'a>,
        ) -> Pin<Box<dyn Future<Output = IoResult<u64>> + Send + 'a>> {
            Box::pin(async move {
                let path = self.config.full_path(key);
                let mut writer = BufWriter::new(self.store.clone(), path);
                let written = match tokio::io::copy(&mut body, &mut writer).await {
                    Ok(n) => n,
                    Err(e) => {
                        let _ = writer.abort().await;
                        return Err(e);
                    }
                };
                writer.shutdown().await?;
                Ok(written)
            })
        }

        fn update_metadata<'a>(
            &'a self,
            key: &'a str,
            metadata: &'a ArtifactMetadata,
        ) -> Pin<Box<dyn Future<Output = IoResult<()>> + Send + 'a>> {
            Box::pin(async move {
                self.store
                    .head(&self.config.full_path(key))
                    .await
                    .map_err(map_error)?;
                let mut merged = self.read_sidecar(key).await?;
                merged.extend(metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
                let encoded =
                    serde_json::to_vec(&merged).map_err(|e| IoError::new(ErrorKind::InvalidData, e))?;
                let sidecar = self.config.full_path(&format!("{}.meta.json", key));
                self.store
                    .put(&sidecar, PutPayload::from(encoded))
                    .await
                    .map_err(map_error)?;
                Ok(())
            })
        }

        fn head<'a>(&'a self, key: &'a str) -> Pin<Box<dyn Future<Output = IoResult<ArtifactInfo>> + Send + 'a>> {
            Box::pin(async move {
                let meta = self
                    .store
                    .head(&self.config.full_path(key))
                    .await
                    .map_err(map_error)?;
                Ok(ArtifactInfo {
                    key: key.to_string(),
                    size_bytes: meta.size as u64,
                    metadata: self.read_sidecar(key).await?,
                })
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(pairs: &[(&str, &str)]) -> ArtifactMetadata {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn test_in_memory_put_then_metadata() {
        let store = InMemoryArtifactStore::new();
        let n = store
            .put_stream("archives/a.zip", Box::new(&b"zipbytes"[..]))
            .await
            .unwrap();
        assert_eq!(n, 8);

        store
            .update_metadata("archives/a.zip", &meta(&[(META_SHA256, "abc")]))
            .await
            .unwrap();
        store
            .update_metadata("archives/a.zip", &meta(&[(META_ENTRIES, "3")]))
            .await
            .unwrap();

        let info = store.head("archives/a.zip").await.unwrap();
        assert_eq!(info.size_bytes, 8);
        assert_eq!(info.metadata, meta(&[(META_SHA256, "abc"), (META_ENTRIES, "3")]));
    }

    #[tokio::test]
    async fn test_metadata_on_missing_artifact_is_not_found() {
        let store = InMemoryArtifactStore::new();
        let err = store
            .update_metadata("nope.zip", &meta(&[(META_SHA256, "abc")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn test_injected_put_failure() {
        let store = InMemoryArtifactStore::new();
        store.set_fail_puts(true);
        assert!(store.put_stream("a.zip", Box::new(&b"x"[..])).await.is_err());
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_local_fs_sidecar_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsArtifactStore::new(dir.path());

        store
            .put_stream("archives/inv-1.zip", Box::new(&b"PK\x03\x04data"[..]))
            .await
            .unwrap();
        store
            .update_metadata("archives/inv-1.zip", &meta(&[(META_SHA256, "feed")]))
            .await
            .unwrap();

        assert!(dir.path().join("archives/inv-1.zip.meta.json").exists());
        assert!(!dir.path().join("archives/inv-1.partial").exists());
        let info = store.head("archives/inv-1.zip").await.unwrap();
        assert_eq!(info.size_bytes, 8);
        assert_eq!(info.metadata.get(META_SHA256).map(String::as_str), Some("feed"));

        // Replacing the artifact drops stale metadata
        store
            .put_stream("archives/inv-1.zip", Box::new(&b"other"[..]))
            .await
            .unwrap();
        assert!(store.head("archives/inv-1.zip").await.unwrap().metadata.is_empty());
    }

    /// Yields a few bytes, then fails
    struct BrokenBody {
        sent: bool,
    }

    impl AsyncRead for BrokenBody {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<IoResult<()>> {
            if self.sent {
                return std::task::Poll::Ready(Err(IoError::new(ErrorKind::BrokenPipe, "upstream gone")));
            }
            self.sent = true;
            buf.put_slice(b"PK\x03\x04");
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_local_fs_failed_upload_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsArtifactStore::new(dir.path());

        let err = store
            .put_stream("archives/inv-2.zip", Box::new(BrokenBody { sent: false }))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::BrokenPipe);

        assert!(!dir.path().join("archives/inv-2.partial").exists());
        assert!(!dir.path().join("archives/inv-2.zip").exists());
        assert!(store.head("archives/inv-2.zip").await.is_err());
    }

    #[tokio::test]
    async fn test_local_fs_metadata_requires_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let store = LocalFsArtifactStore::new(dir.path());
        let err = store
            .update_metadata("missing.zip", &meta(&[(META_SHA256, "x")]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
