//! Cache entry files.
//!
//! An entry is one file named after its fingerprint:
//!
//! ```text
//! [magic "SETL"][version] [frame: EntryHeader] [frame: payload]
//! ```
//!
//! Entries are written to a temporary file and renamed into place, so a
//! reader sees either a complete entry or none.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Result as IoResult, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use uuid::Uuid;

use super::codec;
use super::fingerprint::Fingerprint;
use super::CACHE_FORMAT_VERSION;

/// Extension of committed entry files.
pub const ENTRY_EXTENSION: &str = "entry";

/// Marker inside temporary file names.
pub const TEMP_MARKER: &str = ".tmp.";

/// Entry file header.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EntryHeader {
    /// Cache format version the entry was written with.
    pub format_version: u32,
    /// Fingerprint the entry is keyed by.
    pub fingerprint: Fingerprint,
    /// Human-readable scope, for inspection.
    pub scope: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
}

/// Path of the entry for `fingerprint` inside `dir`.
#[must_use]
pub fn entry_path(dir: &Path, fingerprint: &Fingerprint) -> PathBuf {
    dir.join(format!("{fingerprint}.{ENTRY_EXTENSION}"))
}

/// Reads and validates an entry.
///
/// # Errors
/// Any I/O error, codec error, or a header that does not match the expected
/// fingerprint or format version.
pub fn read_entry<T: DeserializeOwned>(path: &Path, expected: &Fingerprint) -> IoResult<(EntryHeader, T)> {
    let file = File::open(path)?;
    let mut reader = BufReader::new(file);

    codec::read_header(&mut reader)?;
    let header: EntryHeader = codec::decode(&mut reader)?;
    if header.format_version != CACHE_FORMAT_VERSION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!(
                "entry format version {} (expected {CACHE_FORMAT_VERSION})",
                header.format_version
            ),
        ));
    }
    if &header.fingerprint != expected {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("entry is keyed by {}, expected {expected}", header.fingerprint),
        ));
    }
    let payload: T = codec::decode(&mut reader)?;
    Ok((header, payload))
}

/// Writes an entry atomically.
///
/// Uses the write-to-temp-then-rename pattern for crash safety.
pub struct EntryWriter {
    temp_path: Option<PathBuf>,
    final_path: PathBuf,
    writer: Option<BufWriter<File>>,
    sync: bool,
}

impl EntryWriter {
    /// Creates a writer for the entry of `fingerprint` in `dir`.
    pub fn new(dir: &Path, fingerprint: &Fingerprint, sync: bool) -> IoResult<Self> {
        let final_path = entry_path(dir, fingerprint);
        let temp_path = dir.join(format!("{fingerprint}{TEMP_MARKER}{}", Uuid::new_v4()));

        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        let mut writer = BufWriter::new(file);
        codec::write_header(&mut writer)?;

        Ok(Self {
            temp_path: Some(temp_path),
            final_path,
            writer: Some(writer),
            sync,
        })
    }

    /// Writes the header and payload frames.
    pub fn write<T: Serialize>(&mut self, header: &EntryHeader, payload: &T) -> IoResult<()> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer already consumed"))?;
        writer.write_all(&codec::encode(header)?)?;
        writer.write_all(&codec::encode(payload)?)?;
        Ok(())
    }

    /// Flushes, optionally fsyncs, and renames the entry into place.
    ///
    /// This is the commit point.
    pub fn finalize(mut self) -> IoResult<PathBuf> {
        let mut writer = self
            .writer
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "writer already consumed"))?;
        let temp_path = self
            .temp_path
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "temp_path already consumed"))?;

        writer.flush()?;
        if self.sync {
            writer.get_ref().sync_all()?;
        }
        drop(writer);

        if let Err(e) = fs::rename(&temp_path, &self.final_path) {
            let _ = fs::remove_file(&temp_path);
            return Err(e);
        }
        Ok(self.final_path.clone())
    }

    #[cfg(test)]
    fn temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }
}

impl Drop for EntryWriter {
    fn drop(&mut self) {
        // Best-effort cleanup if never finalized
        self.writer.take();
        if let Some(ref temp_path) = self.temp_path {
            let _ = fs::remove_file(temp_path);
        }
    }
}

/// Returns true for leftover temporary files.
pub(crate) fn is_temp_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.contains(TEMP_MARKER))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn header(fp: &Fingerprint) -> EntryHeader {
        EntryHeader {
            format_version: CACHE_FORMAT_VERSION,
            fingerprint: fp.clone(),
            scope: "test".to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_write_read_entry() {
        let dir = tempdir().unwrap();
        let fp = Fingerprint::of_json(&serde_json::json!({"a": 1}));

        let mut writer = EntryWriter::new(dir.path(), &fp, true).unwrap();
        writer.write(&header(&fp), &vec![1, 2, 3]).unwrap();
        let path = writer.finalize().unwrap();
        assert_eq!(path, entry_path(dir.path(), &fp));

        let (read_header, payload): (EntryHeader, Vec<i32>) = read_entry(&path, &fp).unwrap();
        assert_eq!(read_header.scope, "test");
        assert_eq!(payload, vec![1, 2, 3]);
    }

    #[test]
    fn test_unfinalized_writer_leaves_nothing() {
        let dir = tempdir().unwrap();
        let fp = Fingerprint::of_json(&serde_json::json!("x"));

        let mut writer = EntryWriter::new(dir.path(), &fp, false).unwrap();
        let temp = writer.temp_path().unwrap().to_path_buf();
        assert!(is_temp_file(&temp));
        writer.write(&header(&fp), &"payload").unwrap();
        drop(writer);

        assert!(!temp.exists());
        assert!(!entry_path(dir.path(), &fp).exists());
    }

    #[test]
    fn test_fingerprint_mismatch_rejected() {
        let dir = tempdir().unwrap();
        let fp = Fingerprint::of_json(&serde_json::json!(1));
        let other = Fingerprint::of_json(&serde_json::json!(2));

        let mut writer = EntryWriter::new(dir.path(), &fp, false).unwrap();
        writer.write(&header(&fp), &0u8).unwrap();
        let path = writer.finalize().unwrap();

        let err = read_entry::<u8>(&path, &other).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}
