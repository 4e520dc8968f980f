//! Zip container writer
//!
//! Wraps `zip::ZipWriter` over a `SpoolBuffer` with the bookkeeping the
//! archiver needs per entry: unique entry names, uncompressed byte counts and
//! a running SHA-256 of each entry's content. A trailing `MANIFEST.json`
//! records the outcome of every accepted item.

use super::spool::{Archive, SpoolBuffer};
use super::ArchiveError;
use crate::config::ArchiveCompression;
use crate::model::ArchiveManifestEntry;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::io::Write;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

pub const MANIFEST_ENTRY_NAME: &str = "MANIFEST.json";

/// Files larger than this need zip64 headers
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

#[derive(Serialize)]
struct ManifestDocument<'a> {
    entries: &'a [ArchiveManifestEntry],
}

struct OpenEntry {
    name: String,
    hasher: Sha256,
    byte_count: u64,
}

/// A completed entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrittenEntry {
    pub name: String,
    pub byte_count: u64,
    pub sha256: String,
}

pub struct ContainerWriter {
    zip: ZipWriter<SpoolBuffer>,
    method: CompressionMethod,
    names: HashSet<String>,
    open: Option<OpenEntry>,
}

fn compression_method(compression: ArchiveCompression) -> CompressionMethod {
    match compression {
        ArchiveCompression::Stored => CompressionMethod::Stored,
        ArchiveCompression::Deflated => CompressionMethod::Deflated,
        #[cfg(feature = "compression")]
        ArchiveCompression::Zstd => CompressionMethod::Zstd,
    }
}

impl ContainerWriter {
    pub fn new(spool: SpoolBuffer, compression: ArchiveCompression) -> Self {
        let mut names = HashSet::new();
        names.insert(MANIFEST_ENTRY_NAME.to_string());
        ContainerWriter {
            zip: ZipWriter::new(spool),
            method: compression_method(compression),
            names,
            open: None,
        }
    }

    /// Name for an object inside the container
    ///
    /// The object key without leading slashes; a second version of the same
    /// key (or a key shadowing the manifest) gets `@version` appended.
    fn unique_name(&mut self, object_key: &str, version_token: &str, item_id: &str) -> String {
        let base = object_key.trim_start_matches('/');
        let base = if base.is_empty() { item_id } else { base };

        let mut candidate = base.to_string();
        if self.names.contains(&candidate) {
            candidate = format!("{}@{}", base, version_token);
        }
        let mut n = 1;
        while self.names.contains(&candidate) {
            candidate = format!("{}@{}.{}", base, version_token, n);
            n += 1;
        }
        self.names.insert(candidate.clone());
        candidate
    }

    pub fn start_entry(
        &mut self,
        object_key: &str,
        version_token: &str,
        item_id: &str,
        size_hint: u64,
    ) -> Result<(), ArchiveError> {
        debug_assert!(self.open.is_none(), "previous entry still open");
        let name = self.unique_name(object_key, version_token, item_id);
        let options = SimpleFileOptions::default()
            .compression_method(self.method)
            .large_file(size_hint >= ZIP64_THRESHOLD);
        self.zip.start_file(name.clone(), options)?;
        self.open = Some(OpenEntry {
            name,
            hasher: Sha256::new(),
            byte_count: 0,
        });
        Ok(())
    }

    pub fn write_chunk(&mut self, chunk: &[u8]) -> Result<(), ArchiveError> {
        let Some(open) = self.open.as_mut() else {
            return Err(ArchiveError::Container("write without an open entry".into()));
        };
        self.zip.write_all(chunk)?;
        open.hasher.update(chunk);
        open.byte_count += chunk.len() as u64;
        Ok(())
    }

    /// Close the open entry; the zip writer finalizes it when the next one
    /// starts or the container finishes
    pub fn finish_entry(&mut self) -> Result<WrittenEntry, ArchiveError> {
        let open = self
            .open
            .take()
            .ok_or_else(|| ArchiveError::Container("no open entry".into()))?;
        Ok(WrittenEntry {
            name: open.name,
            byte_count: open.byte_count,
            sha256: hex::encode(open.hasher.finalize()),
        })
    }

    /// Drop the open entry's bytes from the container
    pub fn abort_entry(&mut self) -> Result<(), ArchiveError> {
        if let Some(open) = self.open.take() {
            self.names.remove(&open.name);
            self.zip.abort_file()?;
        }
        Ok(())
    }

    /// Append the manifest and write the central directory
    pub fn finish(mut self, manifest: &[ArchiveManifestEntry]) -> Result<Archive, ArchiveError> {
        self.abort_entry()?;
        let document = serde_json::to_vec_pretty(&ManifestDocument { entries: manifest })
            .map_err(|e| ArchiveError::Container(format!("manifest encode: {}", e)))?;
        let options = SimpleFileOptions::default().compression_method(self.method);
        self.zip.start_file(MANIFEST_ENTRY_NAME, options)?;
        self.zip.write_all(&document)?;

        let spool = self.zip.finish()?;
        Ok(spool.into_archive()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ArchiveEntry;
    use std::io::{Cursor, Read};

    fn writer() -> ContainerWriter {
        ContainerWriter::new(SpoolBuffer::new(1 << 20, None), ArchiveCompression::Deflated)
    }

    fn read_zip(bytes: bytes::Bytes) -> zip::ZipArchive<Cursor<bytes::Bytes>> {
        zip::ZipArchive::new(Cursor::new(bytes)).unwrap()
    }

    #[tokio::test]
    async fn test_entries_and_manifest_round_trip() {
        let mut w = writer();
        w.start_entry("in/a.json", "v1", "m-1", 5).unwrap();
        w.write_chunk(b"hel").unwrap();
        w.write_chunk(b"lo").unwrap();
        let written = w.finish_entry().unwrap();
        assert_eq!(written.name, "in/a.json");
        assert_eq!(written.byte_count, 5);
        assert_eq!(written.sha256, hex::encode(Sha256::digest(b"hello")));

        let entry = ArchiveEntry {
            item_id: "m-1".into(),
            object_key: "in/a.json".into(),
            version_token: "v1".into(),
            size_hint: 5,
        };
        let manifest = vec![ArchiveManifestEntry::archived(
            &entry,
            written.name,
            written.byte_count,
            written.sha256,
        )];
        let archive = w.finish(&manifest).unwrap();

        let mut zip = read_zip(archive.to_bytes().await.unwrap());
        assert_eq!(zip.len(), 2);
        let mut content = String::new();
        zip.by_name("in/a.json").unwrap().read_to_string(&mut content).unwrap();
        assert_eq!(content, "hello");

        let mut doc = String::new();
        zip.by_name(MANIFEST_ENTRY_NAME).unwrap().read_to_string(&mut doc).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&doc).unwrap();
        assert_eq!(parsed["entries"][0]["entry_name"], "in/a.json");
        assert_eq!(parsed["entries"][0]["outcome"], "archived");
    }

    #[tokio::test]
    async fn test_aborted_entry_is_absent() {
        let mut w = writer();
        w.start_entry("broken.bin", "v1", "m-1", 0).unwrap();
        w.write_chunk(&[0u8; 100]).unwrap();
        w.abort_entry().unwrap();

        w.start_entry("ok.bin", "v1", "m-2", 0).unwrap();
        w.write_chunk(b"fine").unwrap();
        w.finish_entry().unwrap();

        let archive = w.finish(&[]).unwrap();
        let zip = read_zip(archive.to_bytes().await.unwrap());
        let names: Vec<&str> = zip.file_names().collect();
        assert!(names.contains(&"ok.bin"));
        assert!(!names.contains(&"broken.bin"));
    }

    #[test]
    fn test_name_collisions_get_version_suffix() {
        let mut w = writer();
        assert_eq!(w.unique_name("a.json", "v1", "m-1"), "a.json");
        assert_eq!(w.unique_name("a.json", "v2", "m-2"), "a.json@v2");
        assert_eq!(w.unique_name("a.json", "v2", "m-3"), "a.json@v2.1");
        assert_eq!(w.unique_name("/rooted", "v1", "m-4"), "rooted");
        assert_eq!(w.unique_name("MANIFEST.json", "v9", "m-5"), "MANIFEST.json@v9");
        assert_eq!(w.unique_name("", "v1", "m-6"), "m-6");
    }
}
