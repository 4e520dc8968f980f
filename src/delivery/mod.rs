//! Delivery Client
//!
//! One HTTP transfer of a finished archive to the downstream sink. The body
//! is streamed from the archive, the digest travels in a header, and the
//! bytes actually sent are hashed again on the way out so a body that does
//! not match the advertised digest is reported as a failed delivery.
//!
//! The client never retries: a failed delivery is fed to the circuit breaker
//! and the batch items are redelivered by the transport.

pub mod artifact;

pub use artifact::{
    ArtifactInfo, ArtifactMetadata, ArtifactStore, InMemoryArtifactStore, LocalFsArtifactStore,
};
#[cfg(feature = "s3")]
pub use artifact::S3ArtifactStore;

use crate::archiver::ArchiveReader;
use crate::config::{DeliveryConfig, DeliveryMethod};
use crate::integrity::{ContentDigest, HashingReader};
use reqwest::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE};
use std::future::Future;
use std::io::Error as IoError;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};

pub const ARCHIVE_ID_HEADER: &str = "x-archive-id";

/// Longest response body excerpt kept in errors
const MAX_ERROR_BODY: usize = 512;

/// One archive ready for transfer
pub struct ArchivePayload {
    /// Invocation id; sent as `x-archive-id`
    pub archive_id: String,
    pub digest: ContentDigest,
    pub content_length: u64,
    pub body: ArchiveReader,
}

impl std::fmt::Debug for ArchivePayload {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchivePayload")
            .field("archive_id", &self.archive_id)
            .field("digest", &self.digest)
            .field("content_length", &self.content_length)
            .finish()
    }
}

/// Successful transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryReceipt {
    pub status: u16,
    pub bytes_sent: u64,
    pub elapsed: Duration,
}

/// Error type for a delivery attempt
#[derive(Debug)]
pub enum DeliveryError {
    /// Connect or request timeout
    Timeout(String),
    /// Sink answered with a non-2xx status
    Status { status: u16, body: String },
    /// Connection or protocol failure
    Transport(String),
    /// Bytes sent do not hash to the advertised digest
    DigestMismatch { expected: String, actual: String },
    /// The sink answered before the whole body was sent
    Incomplete { sent: u64, expected: u64 },
    /// Reading the archive failed
    Io(IoError),
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Timeout(msg) => write!(f, "Delivery timed out: {}", msg),
            DeliveryError::Status { status, body } => {
                write!(f, "Sink returned {}: {}", status, body)
            }
            DeliveryError::Transport(msg) => write!(f, "Delivery transport error: {}", msg),
            DeliveryError::DigestMismatch { expected, actual } => {
                write!(f, "Digest mismatch: advertised {}, sent {}", expected, actual)
            }
            DeliveryError::Incomplete { sent, expected } => {
                write!(f, "Body incomplete: sent {} of {} bytes", sent, expected)
            }
            DeliveryError::Io(e) => write!(f, "Delivery I/O error: {}", e),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl From<IoError> for DeliveryError {
    fn from(e: IoError) -> Self {
        DeliveryError::Io(e)
    }
}

impl From<reqwest::Error> for DeliveryError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            DeliveryError::Timeout(e.to_string())
        } else {
            DeliveryError::Transport(e.to_string())
        }
    }
}

/// Downstream sink interface
pub trait DeliverySink: Send + Sync + 'static {
    /// Transfer the payload once
    fn deliver<'a>(
        &'a self,
        payload: ArchivePayload,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt, DeliveryError>> + Send + 'a>>;
}

/// reqwest-backed sink client
#[derive(Debug, Clone)]
pub struct HttpDeliveryClient {
    client: reqwest::Client,
    config: DeliveryConfig,
    digest_header: HeaderName,
}

impl HttpDeliveryClient {
    pub fn new(config: DeliveryConfig) -> Result<Self, DeliveryError> {
        let digest_header = HeaderName::from_bytes(config.digest_header.as_bytes())
            .map_err(|e| DeliveryError::Transport(format!("invalid digest header name: {}", e)))?;
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.request_timeout)
            .build()?;
        Ok(HttpDeliveryClient {
            client,
            config,
            digest_header,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.config.endpoint
    }

    fn method(&self) -> reqwest::Method {
        match self.config.method {
            DeliveryMethod::Put => reqwest::Method::PUT,
            DeliveryMethod::Post => reqwest::Method::POST,
        }
    }

    async fn send(&self, payload: ArchivePayload) -> Result<DeliveryReceipt, DeliveryError> {
        let started = Instant::now();
        let (reader, sent) = HashingReader::new(payload.body);
        let body = reqwest::Body::wrap_stream(ReaderStream::new(reader));

        let digest_value = HeaderValue::from_str(payload.digest.hex())
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        let archive_id = HeaderValue::from_str(&payload.archive_id)
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;

        let response = self
            .client
            .request(self.method(), &self.config.endpoint)
            .header(CONTENT_TYPE, "application/zip")
            .header(CONTENT_LENGTH, payload.content_length)
            .header(self.digest_header.clone(), digest_value)
            .header(ARCHIVE_ID_HEADER, archive_id)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let mut text = response.text().await.unwrap_or_default();
            text.truncate(MAX_ERROR_BODY);
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        // Content-Length framing: the client stops after the last byte and
        // never polls the body for EOF
        let Some(actual) = sent.finalize_if_len(payload.content_length) else {
            return Err(DeliveryError::Incomplete {
                sent: sent.bytes_hashed(),
                expected: payload.content_length,
            });
        };
        if !actual.matches_hex(payload.digest.hex()) {
            return Err(DeliveryError::DigestMismatch {
                expected: payload.digest.hex().to_string(),
                actual: actual.hex().to_string(),
            });
        }

        Ok(DeliveryReceipt {
            status: status.as_u16(),
            bytes_sent: actual.byte_count(),
            elapsed: started.elapsed(),
        })
    }
}

impl DeliverySink for HttpDeliveryClient {
    fn deliver<'a>(
        &'a self,
        payload: ArchivePayload,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryReceipt, DeliveryError>> + Send + 'a>> {
        Box::pin(async move {
            let archive_id = payload.archive_id.clone();
            let result = self.send(payload).await;
            match &result {
                Ok(receipt) => debug!(
                    archive_id = %archive_id,
                    status = receipt.status,
                    bytes = receipt.bytes_sent,
                    elapsed_ms = receipt.elapsed.as_millis() as u64,
                    "Archive delivered"
                ),
                Err(e) => warn!(archive_id = %archive_id, endpoint = %self.config.endpoint, error = %e, "Delivery failed"),
            }
            result
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn payload(data: &'static [u8]) -> ArchivePayload {
        ArchivePayload {
            archive_id: "inv-1".into(),
            digest: ContentDigest::of(data),
            content_length: data.len() as u64,
            body: Box::new(std::io::Cursor::new(Bytes::from_static(data))),
        }
    }

    #[test]
    fn test_rejects_invalid_header_name() {
        let config = DeliveryConfig {
            digest_header: "bad header".into(),
            ..DeliveryConfig::test()
        };
        assert!(matches!(
            HttpDeliveryClient::new(config),
            Err(DeliveryError::Transport(_))
        ));
    }

    #[tokio::test]
    async fn test_connection_refused_is_failure() {
        // Port 9 (discard) is closed on test hosts
        let client = HttpDeliveryClient::new(DeliveryConfig::test()).unwrap();
        let err = client.deliver(payload(b"archive")).await.unwrap_err();
        assert!(matches!(
            err,
            DeliveryError::Transport(_) | DeliveryError::Timeout(_)
        ));
    }

    #[test]
    fn test_error_display() {
        let err = DeliveryError::Status {
            status: 503,
            body: "busy".into(),
        };
        assert_eq!(err.to_string(), "Sink returned 503: busy");
    }
}
