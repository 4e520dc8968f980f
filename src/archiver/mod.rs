//! Streaming Archiver - Parallel Fetch, Serial Compression
//!
//! Fetch workers open object streams concurrently and hand them to a single
//! writer through a bounded channel whose capacity equals the worker count.
//! The writer copies each stream into the zip container chunk by chunk, so
//! no object is ever held in memory whole and no more than `worker_count`
//! opened streams wait at any time.
//!
//! ```text
//!              ┌─ worker 1 ─┐
//! work list ───┼─ worker 2 ─┼──► mpsc(worker_count) ──► writer ──► ZipWriter<SpoolBuffer>
//!              └─ worker N ─┘                                          │
//!                                                     memory ──(threshold)──► temp file
//! ```
//!
//! A fetch that fails to open (missing object, timeout) or breaks mid-read is
//! recorded as `FetchFailed` and left out of the container. Deadline expiry
//! or a write error cancels every worker through a shared
//! `CancellationToken` and the partial archive is dropped.

pub mod container;
pub mod spool;

pub use container::{ContainerWriter, WrittenEntry, MANIFEST_ENTRY_NAME};
pub use spool::{Archive, ArchiveReader, SpoolBuffer};

use crate::config::ArchiverConfig;
use crate::model::{ArchiveEntry, ArchiveManifestEntry};
use crate::source::{ObjectReader, ObjectSource};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io::Error as IoError;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Error type for a whole archive run
#[derive(Debug)]
pub enum ArchiveError {
    /// Container or spool I/O failed
    Io(IoError),
    /// Zip encoding error
    Container(String),
    /// The deadline passed before the archive was finished
    DeadlineExceeded,
}

impl std::fmt::Display for ArchiveError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ArchiveError::Io(e) => write!(f, "Archive I/O error: {}", e),
            ArchiveError::Container(msg) => write!(f, "Archive container error: {}", msg),
            ArchiveError::DeadlineExceeded => write!(f, "Archive deadline exceeded"),
        }
    }
}

impl std::error::Error for ArchiveError {}

impl From<IoError> for ArchiveError {
    fn from(e: IoError) -> Self {
        ArchiveError::Io(e)
    }
}

impl From<zip::result::ZipError> for ArchiveError {
    fn from(e: zip::result::ZipError) -> Self {
        match e {
            zip::result::ZipError::Io(io) => ArchiveError::Io(io),
            other => ArchiveError::Container(other.to_string()),
        }
    }
}

/// Counters for one archive run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArchiveStats {
    pub entries_archived: usize,
    pub entries_failed: usize,
    /// Uncompressed bytes copied into the container
    pub bytes_in: u64,
    /// Size of the finished container
    pub archive_bytes: u64,
    /// Highest number of opened streams waiting for the writer
    pub peak_queue_depth: usize,
    pub spilled: bool,
}

/// Output of a successful archive run
#[derive(Debug)]
pub struct ArchiveResult {
    pub archive: Archive,
    /// One entry per input, in input order
    pub manifest: Vec<ArchiveManifestEntry>,
    pub stats: ArchiveStats,
}

impl ArchiveResult {
    pub fn archived(&self) -> impl Iterator<Item = &ArchiveManifestEntry> {
        self.manifest.iter().filter(|e| e.fetch_outcome.is_archived())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ArchiveManifestEntry> {
        self.manifest.iter().filter(|e| !e.fetch_outcome.is_archived())
    }
}

/// What a worker hands to the writer
enum Fetched {
    Opened {
        index: usize,
        entry: ArchiveEntry,
        reader: ObjectReader,
    },
    Failed {
        index: usize,
        entry: ArchiveEntry,
        reason: String,
    },
}

/// Builds one archive from a set of accepted entries
pub struct StreamingArchiver {
    source: Arc<dyn ObjectSource>,
    config: ArchiverConfig,
}

impl StreamingArchiver {
    pub fn new(source: Arc<dyn ObjectSource>, config: ArchiverConfig) -> Self {
        StreamingArchiver { source, config }
    }

    pub fn config(&self) -> &ArchiverConfig {
        &self.config
    }

    /// Fetch every entry and write the surviving ones into one container
    pub async fn archive(
        &self,
        entries: Vec<ArchiveEntry>,
        deadline: Instant,
    ) -> Result<ArchiveResult, ArchiveError> {
        let worker_count = self.config.worker_count.max(1);
        let total = entries.len();
        let cancel = CancellationToken::new();
        // Stops any worker still running when this call returns, including on error
        let _cancel_on_exit = cancel.clone().drop_guard();

        let work: Arc<Mutex<VecDeque<(usize, ArchiveEntry)>>> =
            Arc::new(Mutex::new(entries.into_iter().enumerate().collect()));
        let peak = Arc::new(AtomicUsize::new(0));
        let (tx, mut rx) = mpsc::channel::<Fetched>(worker_count);

        let mut workers = JoinSet::new();
        for worker_id in 0..worker_count.min(total.max(1)) {
            workers.spawn(fetch_worker(
                worker_id,
                self.source.clone(),
                self.config.clone(),
                work.clone(),
                tx.clone(),
                cancel.clone(),
                peak.clone(),
                deadline,
            ));
        }
        drop(tx);

        let spool = SpoolBuffer::new(self.config.spill_threshold_bytes, self.config.spool_dir.clone());
        let mut writer = ContainerWriter::new(spool, self.config.compression);
        let mut manifest: Vec<Option<ArchiveManifestEntry>> = vec![None; total];
        let mut chunk = vec![0u8; self.config.chunk_size.clamp(1, crate::config::MAX_CHUNK_SIZE)];
        let mut stats = ArchiveStats::default();

        loop {
            let next = tokio::select! {
                biased;
                _ = tokio::time::sleep_until(deadline) => {
                    warn!(entries = total, "Archive deadline exceeded, discarding partial archive");
                    cancel.cancel();
                    return Err(ArchiveError::DeadlineExceeded);
                }
                next = rx.recv() => next,
            };

            let Some(fetched) = next else {
                break;
            };

            match fetched {
                Fetched::Failed { index, entry, reason } => {
                    debug!(item_id = %entry.item_id, key = %entry.object_key, %reason, "Fetch failed");
                    manifest[index] = Some(ArchiveManifestEntry::fetch_failed(&entry, reason));
                }
                Fetched::Opened { index, entry, reader } => {
                    let record = match self
                        .copy_entry(&mut writer, &entry, reader, &mut chunk, deadline, &cancel)
                        .await
                    {
                        Ok(record) => record,
                        Err(e) => {
                            if !matches!(e, ArchiveError::DeadlineExceeded) {
                                error!(error = %e, item_id = %entry.item_id, "Archive write failed");
                            }
                            cancel.cancel();
                            return Err(e);
                        }
                    };
                    if record.fetch_outcome.is_archived() {
                        stats.bytes_in += record.byte_count;
                    }
                    manifest[index] = Some(record);
                }
            }
        }

        // Workers only cancel when they find the deadline already passed
        if cancel.is_cancelled() {
            return Err(ArchiveError::DeadlineExceeded);
        }

        // All senders are gone, so every worker has returned
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                return Err(ArchiveError::Container(format!("fetch worker failed: {}", e)));
            }
        }

        let manifest: Vec<ArchiveManifestEntry> = manifest
            .into_iter()
            .enumerate()
            .map(|(i, m)| {
                m.ok_or_else(|| ArchiveError::Container(format!("entry {} was never processed", i)))
            })
            .collect::<Result<_, _>>()?;

        let archive = writer.finish(&manifest)?;

        stats.entries_archived = manifest.iter().filter(|e| e.fetch_outcome.is_archived()).count();
        stats.entries_failed = total - stats.entries_archived;
        stats.archive_bytes = archive.len();
        stats.peak_queue_depth = peak.load(Ordering::Relaxed);
        stats.spilled = archive.is_spilled();

        info!(
            archived = stats.entries_archived,
            failed = stats.entries_failed,
            bytes_in = stats.bytes_in,
            archive_bytes = stats.archive_bytes,
            peak_queue_depth = stats.peak_queue_depth,
            spilled = stats.spilled,
            "Archive finished"
        );

        Ok(ArchiveResult {
            archive,
            manifest,
            stats,
        })
    }

    /// Copy one opened stream into the container
    ///
    /// Read failures abort just this entry. Write failures and deadline
    /// expiry are returned as errors and end the whole run.
    async fn copy_entry(
        &self,
        writer: &mut ContainerWriter,
        entry: &ArchiveEntry,
        mut reader: ObjectReader,
        chunk: &mut [u8],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<ArchiveManifestEntry, ArchiveError> {
        writer.start_entry(&entry.object_key, &entry.version_token, &entry.item_id, entry.size_hint)?;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || cancel.is_cancelled() {
                return Err(ArchiveError::DeadlineExceeded);
            }
            let chunk_timeout = self.config.fetch_timeout(remaining);

            let read = tokio::select! {
                _ = cancel.cancelled() => return Err(ArchiveError::DeadlineExceeded),
                read = tokio::time::timeout(chunk_timeout, reader.read(chunk)) => read,
            };

            let reason = match read {
                Ok(Ok(0)) => {
                    let written = writer.finish_entry()?;
                    debug!(
                        item_id = %entry.item_id,
                        entry_name = %written.name,
                        bytes = written.byte_count,
                        "Entry archived"
                    );
                    return Ok(ArchiveManifestEntry::archived(
                        entry,
                        written.name,
                        written.byte_count,
                        written.sha256,
                    ));
                }
                Ok(Ok(n)) => {
                    writer.write_chunk(&chunk[..n])?;
                    continue;
                }
                Ok(Err(e)) => format!("read failed: {}", e),
                Err(_) => "read timed out".to_string(),
            };

            warn!(item_id = %entry.item_id, key = %entry.object_key, %reason, "Entry aborted mid-read");
            writer.abort_entry()?;
            return Ok(ArchiveManifestEntry::fetch_failed(entry, reason));
        }
    }
}

/// Pull entries from the shared work list until it is empty or the run is cancelled
async fn fetch_worker(
    worker_id: usize,
    source: Arc<dyn ObjectSource>,
    config: ArchiverConfig,
    work: Arc<Mutex<VecDeque<(usize, ArchiveEntry)>>>,
    tx: mpsc::Sender<Fetched>,
    cancel: CancellationToken,
    peak: Arc<AtomicUsize>,
    deadline: Instant,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        let Some((index, entry)) = work.lock().pop_front() else {
            break;
        };

        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            cancel.cancel();
            break;
        }
        let timeout = config.fetch_timeout(remaining);

        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = tokio::time::timeout(
                timeout,
                source.open_stream(&entry.object_key, &entry.version_token),
            ) => opened,
        };

        let fetched = match opened {
            Ok(Ok(reader)) => Fetched::Opened { index, entry, reader },
            Ok(Err(e)) => Fetched::Failed {
                index,
                reason: e.reason(),
                entry,
            },
            Err(_) => Fetched::Failed {
                index,
                reason: format!("timed out after {}ms", timeout.as_millis()),
                entry,
            },
        };

        // Blocks while the channel is full
        let sent = tokio::select! {
            _ = cancel.cancelled() => break,
            sent = tx.send(fetched) => sent,
        };
        if sent.is_err() {
            break;
        }
        let depth = tx.max_capacity() - tx.capacity();
        peak.fetch_max(depth, Ordering::Relaxed);
    }
    debug!(worker_id, "Fetch worker done");
}
