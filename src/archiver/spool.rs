//! Spooled archive buffer
//!
//! The zip container is written into a `SpoolBuffer`, which keeps bytes in
//! memory until `threshold` is crossed and then moves everything to a named
//! temporary file. Small batches never touch the disk; large ones never hold
//! the whole archive in memory.

use bytes::Bytes;
use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;
use tempfile::NamedTempFile;
use tokio::io::AsyncRead;
use tracing::debug;

/// Independent reader over a finished archive
pub type ArchiveReader = Box<dyn AsyncRead + Send + Sync + Unpin>;

enum Spool {
    Memory(Cursor<Vec<u8>>),
    Disk(NamedTempFile),
}

/// Seekable write target that spills to disk past a size threshold
pub struct SpoolBuffer {
    spool: Spool,
    threshold: u64,
    spool_dir: Option<PathBuf>,
}

impl SpoolBuffer {
    pub fn new(threshold: usize, spool_dir: Option<PathBuf>) -> Self {
        SpoolBuffer {
            spool: Spool::Memory(Cursor::new(Vec::new())),
            threshold: threshold as u64,
            spool_dir,
        }
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self.spool, Spool::Disk(_))
    }

    fn spill(&mut self) -> io::Result<()> {
        let Spool::Memory(cursor) = &self.spool else {
            return Ok(());
        };

        let mut file = match &self.spool_dir {
            Some(dir) => NamedTempFile::new_in(dir)?,
            None => NamedTempFile::new()?,
        };
        file.write_all(cursor.get_ref())?;
        file.seek(SeekFrom::Start(cursor.position()))?;

        debug!(
            bytes = cursor.get_ref().len(),
            path = %file.path().display(),
            "Archive spilled to disk"
        );
        self.spool = Spool::Disk(file);
        Ok(())
    }

    /// Freeze the written bytes into a readable archive
    pub fn into_archive(self) -> io::Result<Archive> {
        match self.spool {
            Spool::Memory(cursor) => Ok(Archive::Memory(Bytes::from(cursor.into_inner()))),
            Spool::Disk(mut file) => {
                file.flush()?;
                let len = file.as_file().metadata()?.len();
                Ok(Archive::Disk { file, len })
            }
        }
    }
}

impl Write for SpoolBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if let Spool::Memory(cursor) = &self.spool {
            let end = cursor.position() + buf.len() as u64;
            if end > self.threshold {
                self.spill()?;
            }
        }
        match &mut self.spool {
            Spool::Memory(cursor) => cursor.write(buf),
            Spool::Disk(file) => file.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.spool {
            Spool::Memory(_) => Ok(()),
            Spool::Disk(file) => file.flush(),
        }
    }
}

impl Read for SpoolBuffer {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match &mut self.spool {
            Spool::Memory(cursor) => cursor.read(buf),
            Spool::Disk(file) => file.read(buf),
        }
    }
}

impl Seek for SpoolBuffer {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        match &mut self.spool {
            Spool::Memory(cursor) => cursor.seek(pos),
            Spool::Disk(file) => file.seek(pos),
        }
    }
}

/// A finished archive container
///
/// Disk-backed archives delete their temp file when dropped.
pub enum Archive {
    Memory(Bytes),
    Disk { file: NamedTempFile, len: u64 },
}

impl Archive {
    pub fn len(&self) -> u64 {
        match self {
            Archive::Memory(bytes) => bytes.len() as u64,
            Archive::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_spilled(&self) -> bool {
        matches!(self, Archive::Disk { .. })
    }

    /// Fresh reader positioned at the first byte; readers are independent
    pub fn reader(&self) -> io::Result<ArchiveReader> {
        match self {
            Archive::Memory(bytes) => Ok(Box::new(Cursor::new(bytes.clone()))),
            Archive::Disk { file, .. } => {
                let handle = file.reopen()?;
                Ok(Box::new(tokio::fs::File::from_std(handle)))
            }
        }
    }

    /// Whole archive in memory; tests and small-archive callers only
    pub async fn to_bytes(&self) -> io::Result<Bytes> {
        match self {
            Archive::Memory(bytes) => Ok(bytes.clone()),
            Archive::Disk { .. } => {
                use tokio::io::AsyncReadExt;
                let mut out = Vec::with_capacity(self.len() as usize);
                self.reader()?.read_to_end(&mut out).await?;
                Ok(Bytes::from(out))
            }
        }
    }
}

impl std::fmt::Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Archive::Memory(bytes) => f.debug_tuple("Memory").field(&bytes.len()).finish(),
            Archive::Disk { file, len } => f
                .debug_struct("Disk")
                .field("path", &file.path())
                .field("len", len)
                .finish(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stays_in_memory_below_threshold() {
        let mut spool = SpoolBuffer::new(1024, None);
        spool.write_all(&[1u8; 1000]).unwrap();
        assert!(!spool.is_spilled());

        let archive = spool.into_archive().unwrap();
        assert!(!archive.is_spilled());
        assert_eq!(archive.len(), 1000);
    }

    #[tokio::test]
    async fn test_spills_and_preserves_content() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = SpoolBuffer::new(1024, Some(dir.path().to_path_buf()));

        spool.write_all(&[1u8; 800]).unwrap();
        spool.write_all(&[2u8; 800]).unwrap();
        assert!(spool.is_spilled());

        // Seek back and patch, as the zip writer does for local headers
        spool.seek(SeekFrom::Start(10)).unwrap();
        spool.write_all(&[9u8; 4]).unwrap();
        spool.seek(SeekFrom::End(0)).unwrap();

        let archive = spool.into_archive().unwrap();
        assert!(archive.is_spilled());
        assert_eq!(archive.len(), 1600);

        let bytes = archive.to_bytes().await.unwrap();
        assert_eq!(&bytes[..10], &[1u8; 10]);
        assert_eq!(&bytes[10..14], &[9u8; 4]);
        assert_eq!(&bytes[800..], &[2u8; 800][..]);

        // Two readers see the same bytes independently
        assert_eq!(archive.to_bytes().await.unwrap(), bytes);
    }

    #[test]
    fn test_spilled_file_removed_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let mut spool = SpoolBuffer::new(8, Some(dir.path().to_path_buf()));
        spool.write_all(&[0u8; 64]).unwrap();
        let archive = spool.into_archive().unwrap();
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);

        drop(archive);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
