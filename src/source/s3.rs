//! S3 Object Source
//!
//! Streams object versions from S3 (or an S3-compatible service) using the
//! `object_store` crate. The same `S3Config` also backs
//! `delivery::artifact::S3ArtifactStore`.

use super::{ObjectReader, ObjectSource, SourceError};
use futures::TryStreamExt;
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{GetOptions, ObjectStore};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::io::{Error as IoError, ErrorKind, Result as IoResult};
use std::pin::Pin;
use std::sync::Arc;
use tokio_util::io::StreamReader;

/// S3 connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    /// Key prefix within the bucket
    #[serde(default)]
    pub prefix: String,
    pub region: String,
    /// Custom endpoint (MinIO, LocalStack)
    #[serde(default)]
    pub endpoint: Option<String>,
    /// Pass `version_token` to S3 as the object version id. Disable for
    /// unversioned buckets where the token is a sequence number.
    #[serde(default = "default_versioned")]
    pub versioned: bool,
}

fn default_versioned() -> bool {
    true
}

impl S3Config {
    /// Build a client. Credentials come from the usual `AWS_*` environment
    /// variables; explicit settings here win over them.
    pub(crate) fn build_store(&self) -> IoResult<Arc<dyn ObjectStore>> {
        let mut builder = AmazonS3Builder::from_env()
            .with_bucket_name(&self.bucket)
            .with_region(&self.region);

        if let Some(endpoint) = &self.endpoint {
            builder = builder
                .with_endpoint(endpoint)
                .with_allow_http(endpoint.starts_with("http://"));
        }

        let store = builder.build().map_err(|e| {
            IoError::new(
                ErrorKind::InvalidInput,
                format!("Failed to create S3 store: {}", e),
            )
        })?;
        Ok(Arc::new(store))
    }

    pub(crate) fn full_path(&self, key: &str) -> ObjectPath {
        if self.prefix.is_empty() {
            ObjectPath::from(key)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, key))
        }
    }
}

/// Convert object_store errors to IoError
pub(crate) fn map_error(err: object_store::Error) -> IoError {
    match &err {
        object_store::Error::NotFound { .. } => IoError::new(ErrorKind::NotFound, err.to_string()),
        object_store::Error::AlreadyExists { .. } => {
            IoError::new(ErrorKind::AlreadyExists, err.to_string())
        }
        object_store::Error::Precondition { .. } => {
            IoError::new(ErrorKind::InvalidInput, err.to_string())
        }
        _ => IoError::new(ErrorKind::Other, err.to_string()),
    }
}

/// Object source reading from an S3 bucket
#[derive(Clone)]
pub struct S3ObjectSource {
    store: Arc<dyn ObjectStore>,
    config: S3Config,
}

impl S3ObjectSource {
    pub fn new(config: S3Config) -> IoResult<Self> {
        let store = config.build_store()?;
        Ok(S3ObjectSource { store, config })
    }

    /// Wrap an existing client (tests use `object_store::memory::InMemory`)
    pub fn from_store(store: Arc<dyn ObjectStore>, config: S3Config) -> Self {
        S3ObjectSource { store, config }
    }
}

impl std::fmt::Debug for S3ObjectSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3ObjectSource")
            .field("bucket", &self.config.bucket)
            .field("prefix", &self.config.prefix)
            .finish()
    }
}

impl ObjectSource for S3ObjectSource {
    fn open_stream<'a>(
        &'a self,
        object_key: &'a str,
        version_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<ObjectReader, SourceError>> + Send + 'a>> {
        Box::pin(async move {
            let path = self.config.full_path(object_key);
            let options = GetOptions {
                version: (self.config.versioned && !version_token.is_empty())
                    .then(|| version_token.to_string()),
                ..Default::default()
            };

            let result = self
                .store
                .get_opts(&path, options)
                .await
                .map_err(map_error)?;
            let stream = result.into_stream().map_err(map_error);
            Ok(Box::new(StreamReader::new(stream)) as ObjectReader)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use object_store::memory::InMemory;
    use tokio::io::AsyncReadExt;

    fn config(prefix: &str) -> S3Config {
        S3Config {
            bucket: "ingest".into(),
            prefix: prefix.into(),
            region: "us-east-1".into(),
            endpoint: None,
            versioned: false,
        }
    }

    #[test]
    fn test_full_path_with_and_without_prefix() {
        assert_eq!(config("raw").full_path("in/a.json").to_string(), "raw/in/a.json");
        assert_eq!(config("").full_path("in/a.json").to_string(), "in/a.json");
    }

    #[tokio::test]
    async fn test_streams_object_and_maps_not_found() {
        let backing: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        backing
            .put(&ObjectPath::from("raw/in/a.json"), bytes::Bytes::from_static(b"payload").into())
            .await
            .unwrap();

        let source = S3ObjectSource::from_store(backing, config("raw"));
        let mut reader = source.open_stream("in/a.json", "7").await.unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await.unwrap();
        assert_eq!(buf, b"payload");

        let err = source.open_stream("in/missing.json", "7").await.err().unwrap();
        assert!(matches!(err, SourceError::NotFound(_)));
    }
}
