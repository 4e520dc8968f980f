//! Integrity Hasher
//!
//! `HashingReader` sits between an archive and whatever transmits it and
//! feeds every byte the transport actually pulls into SHA-256. The digest is
//! only available through its `DigestHandle` once the reader has seen EOF
//! (or, for length-framed transports, the full expected length), so a
//! partially consumed stream can never produce a digest that looks complete.

use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, ReadBuf};

/// Hex SHA-256 of a byte stream plus its length
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContentDigest {
    hex: String,
    byte_count: u64,
}

impl ContentDigest {
    pub fn new(hex: impl Into<String>, byte_count: u64) -> Self {
        ContentDigest {
            hex: hex.into(),
            byte_count,
        }
    }

    /// Digest of an in-memory buffer
    pub fn of(data: &[u8]) -> Self {
        ContentDigest {
            hex: hex::encode(Sha256::digest(data)),
            byte_count: data.len() as u64,
        }
    }

    /// Lowercase hex, 64 characters
    pub fn hex(&self) -> &str {
        &self.hex
    }

    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    /// Compare against a hex digest received out of band (case-insensitive)
    pub fn matches_hex(&self, other: &str) -> bool {
        self.hex.eq_ignore_ascii_case(other.trim())
    }
}

impl std::fmt::Display for ContentDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", self.hex)
    }
}

#[derive(Default)]
struct HashState {
    hasher: Sha256,
    byte_count: u64,
    eof: bool,
}

/// Read side of a hashed stream; see `DigestHandle` for the result
pub struct HashingReader<R> {
    inner: R,
    state: Arc<Mutex<HashState>>,
}

/// Retrieves the digest of a `HashingReader` once it reached EOF
#[derive(Clone)]
pub struct DigestHandle {
    state: Arc<Mutex<HashState>>,
}

impl<R> HashingReader<R> {
    pub fn new(inner: R) -> (Self, DigestHandle) {
        let state = Arc::new(Mutex::new(HashState::default()));
        (
            HashingReader {
                inner,
                state: state.clone(),
            },
            DigestHandle { state },
        )
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for HashingReader<R> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let wanted = buf.remaining() > 0;
        let this = &mut *self;

        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let fresh = &buf.filled()[before..];
                let mut state = this.state.lock();
                if fresh.is_empty() {
                    if wanted {
                        state.eof = true;
                    }
                } else {
                    state.hasher.update(fresh);
                    state.byte_count += fresh.len() as u64;
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

impl DigestHandle {
    /// Bytes hashed so far
    pub fn bytes_hashed(&self) -> u64 {
        self.state.lock().byte_count
    }

    pub fn is_complete(&self) -> bool {
        self.state.lock().eof
    }

    /// The digest, or None if the stream was not read to EOF
    pub fn finalize(&self) -> Option<ContentDigest> {
        let state = self.state.lock();
        if !state.eof {
            return None;
        }
        Some(Self::digest_of(&state))
    }

    /// The digest once at least `expected` bytes were hashed
    ///
    /// A transport that frames the body by length stops reading after the
    /// last byte and never issues the final empty read, so EOF alone cannot
    /// mark such a stream complete.
    pub fn finalize_if_len(&self, expected: u64) -> Option<ContentDigest> {
        let state = self.state.lock();
        if state.byte_count < expected {
            return None;
        }
        Some(Self::digest_of(&state))
    }

    fn digest_of(state: &HashState) -> ContentDigest {
        ContentDigest {
            hex: hex::encode(state.hasher.clone().finalize()),
            byte_count: state.byte_count,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_digest_matches_known_vector() {
        let (mut reader, handle) = HashingReader::new(&b"abc"[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        let digest = handle.finalize().unwrap();
        assert_eq!(
            digest.hex(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(digest.byte_count(), 3);
        assert_eq!(digest, ContentDigest::of(b"abc"));
    }

    #[tokio::test]
    async fn test_no_digest_before_eof() {
        let data = vec![7u8; 10_000];
        let (mut reader, handle) = HashingReader::new(&data[..]);

        let mut chunk = [0u8; 1024];
        reader.read_exact(&mut chunk).await.unwrap();
        assert_eq!(handle.bytes_hashed(), 1024);
        assert!(handle.finalize().is_none());

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(handle.finalize().unwrap(), ContentDigest::of(&data));
    }

    #[tokio::test]
    async fn test_length_framed_read_completes_without_eof() {
        let data = vec![3u8; 4096];
        let (mut reader, handle) = HashingReader::new(&data[..]);

        // Read exactly the body length, never the trailing empty read
        let mut body = vec![0u8; data.len()];
        reader.read_exact(&mut body).await.unwrap();

        assert!(!handle.is_complete());
        assert!(handle.finalize().is_none());
        assert!(handle.finalize_if_len(4097).is_none());
        assert_eq!(handle.finalize_if_len(4096).unwrap(), ContentDigest::of(&data));
    }

    #[tokio::test]
    async fn test_finalize_if_len_rejects_short_stream() {
        let (mut reader, handle) = HashingReader::new(&b"short"[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();

        assert!(handle.finalize_if_len(10).is_none());
        // A longer stream still yields its digest so the caller can report the mismatch
        assert_eq!(handle.finalize_if_len(3).unwrap().byte_count(), 5);
    }

    #[tokio::test]
    async fn test_empty_stream_has_digest_of_nothing() {
        let (mut reader, handle) = HashingReader::new(&b""[..]);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(handle.finalize().unwrap(), ContentDigest::of(b""));
    }

    #[test]
    fn test_matches_hex_ignores_case() {
        let digest = ContentDigest::of(b"abc");
        assert!(digest.matches_hex(&digest.hex().to_uppercase()));
        assert!(!digest.matches_hex("00"));
        assert_eq!(digest.to_string(), format!("sha256:{}", digest.hex()));
    }
}
