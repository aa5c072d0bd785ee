//! Read-only access to the tables of a GTFS zip archive.
//!
//! A [`FeedArchive`] parses the zip central directory on open and streams
//! individual `*.txt` entries through the CSV reader on demand; nothing is
//! extracted to disk. The file handle is released when the archive is dropped.

use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, StringRecord, Trim};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;
use zip::ZipArchive;

use crate::error::{FeedError, Result};

/// One table row keyed by column name. Values are left as raw strings.
pub type Row = HashMap<String, String>;

/// Order-independent fingerprint of a table's rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableDigest {
    pub row_count: usize,
    pub checksum: String,
}

pub struct FeedArchive {
    path: PathBuf,
    zip: ZipArchive<BufReader<File>>,
    /// table name (`calendar`) -> zip entry name (`gtfs/calendar.txt`)
    tables: BTreeMap<String, String>,
}

impl FeedArchive {
    /// Opens `path` read-only and indexes its tables.
    ///
    /// # Errors
    ///
    /// [`FeedError::NotFound`] if the path is missing and
    /// [`FeedError::CorruptArchive`] if it is not a readable zip.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FeedError::NotFound(path.to_path_buf()),
            _ => FeedError::Io(e),
        })?;

        let zip = ZipArchive::new(BufReader::new(file)).map_err(|e| FeedError::corrupt(path, e))?;

        let mut tables = BTreeMap::new();
        for entry in zip.file_names() {
            if let Some(table) = table_name(entry) {
                tables.entry(table).or_insert_with(|| entry.to_string());
            }
        }

        debug!(path = %path.display(), tables = tables.len(), "Opened feed archive");

        Ok(Self {
            path: path.to_path_buf(),
            zip,
            tables,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Table names in sorted order.
    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.keys().map(String::as_str)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.tables.contains_key(name)
    }

    /// Reads every row of `name`.
    ///
    /// Returns [`FeedError::TableMissing`] when the archive has no such table.
    pub fn read_table(&mut self, name: &str) -> Result<Vec<Row>> {
        let mut rows = Vec::new();
        self.for_each_record(name, |headers, record| {
            let row = headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.to_string(), v.to_string()))
                .collect();
            rows.push(row);
        })?;
        Ok(rows)
    }

    /// Like [`read_table`](Self::read_table) but maps a missing table to `None`.
    pub fn read_optional_table(&mut self, name: &str) -> Result<Option<Vec<Row>>> {
        match self.read_table(name) {
            Ok(rows) => Ok(Some(rows)),
            Err(FeedError::TableMissing(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Computes the row count and a checksum over the multiset of rows.
    ///
    /// Each row is hashed from its sorted `(column, value)` pairs with empty
    /// values dropped, so neither row order nor column order nor an added
    /// all-empty column changes the result.
    pub fn table_digest(&mut self, name: &str) -> Result<TableDigest> {
        let mut row_hashes: Vec<[u8; 32]> = Vec::new();
        self.for_each_record(name, |headers, record| {
            let mut pairs: Vec<(&str, &str)> = headers
                .iter()
                .zip(record.iter())
                .filter(|(_, v)| !v.is_empty())
                .map(|(h, v)| (h.as_str(), v))
                .collect();
            pairs.sort_unstable();

            let mut hasher = Sha256::new();
            for (column, value) in pairs {
                hasher.update(column.as_bytes());
                hasher.update([0x1f]);
                hasher.update(value.as_bytes());
                hasher.update([0x1e]);
            }
            row_hashes.push(hasher.finalize().into());
        })?;

        row_hashes.sort_unstable();
        let mut hasher = Sha256::new();
        for hash in &row_hashes {
            hasher.update(hash);
        }

        Ok(TableDigest {
            row_count: row_hashes.len(),
            checksum: hex::encode(hasher.finalize()),
        })
    }

    fn for_each_record<F>(&mut self, name: &str, mut f: F) -> Result<()>
    where
        F: FnMut(&[String], &StringRecord),
    {
        let entry = self
            .tables
            .get(name)
            .ok_or_else(|| FeedError::TableMissing(name.to_string()))?;

        let path = &self.path;
        let file = self
            .zip
            .by_name(entry)
            .map_err(|e| FeedError::corrupt(path, e))?;

        let mut reader = csv_reader(file);
        let headers: Vec<String> = reader
            .headers()
            .map_err(|e| FeedError::corrupt(path, format!("{entry}: {e}")))?
            .iter()
            .map(|h| h.trim_start_matches('\u{feff}').to_string())
            .collect();

        let mut record = StringRecord::new();
        loop {
            match reader.read_record(&mut record) {
                Ok(true) => f(&headers, &record),
                Ok(false) => break,
                Err(e) => return Err(FeedError::corrupt(path, format!("{entry}: {e}"))),
            }
        }
        Ok(())
    }
}

fn csv_reader<R: Read>(rdr: R) -> csv::Reader<R> {
    ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::All)
        .from_reader(rdr)
}

/// Maps a zip entry name to a table name, ignoring directories and non-`.txt` files.
fn table_name(entry: &str) -> Option<String> {
    if entry.ends_with('/') {
        return None;
    }
    let base = entry.rsplit('/').next()?;
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || !ext.eq_ignore_ascii_case("txt") {
        return None;
    }
    Some(stem.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{trimet_tables, write_trimet, write_zip};

    #[test]
    fn test_table_name_mapping() {
        assert_eq!(table_name("calendar.txt").as_deref(), Some("calendar"));
        assert_eq!(table_name("gtfs/stops.TXT").as_deref(), Some("stops"));
        assert_eq!(table_name("gtfs/"), None);
        assert_eq!(table_name("README.md"), None);
        assert_eq!(table_name(".txt"), None);
    }

    #[test]
    fn test_open_missing_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = FeedArchive::open(dir.path().join("missing.zip")).err().unwrap();
        assert!(matches!(err, FeedError::NotFound(_)));
    }

    #[test]
    fn test_open_garbage_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.zip");
        std::fs::write(&path, b"<html>503 Service Unavailable</html>").unwrap();

        let err = FeedArchive::open(&path).err().unwrap();
        assert!(matches!(err, FeedError::CorruptArchive { .. }));
    }

    #[test]
    fn test_read_table_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_trimet(dir.path(), "trimet.zip");
        let mut archive = FeedArchive::open(&path).unwrap();

        let names: Vec<_> = archive.table_names().collect();
        assert_eq!(
            names,
            vec!["calendar", "calendar_dates", "feed_info", "stops", "trips"]
        );

        let rows = archive.read_table("feed_info").unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["feed_publisher_name"], "TriMet");
        assert_eq!(rows[0]["feed_version"], "20150927-20151006-0140");
    }

    #[test]
    fn test_missing_table() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_trimet(dir.path(), "trimet.zip");
        let mut archive = FeedArchive::open(&path).unwrap();

        assert!(matches!(
            archive.read_table("shapes"),
            Err(FeedError::TableMissing(t)) if t == "shapes"
        ));
        assert!(archive.read_optional_table("shapes").unwrap().is_none());
    }

    #[test]
    fn test_bom_and_nested_folder() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            "nested.zip",
            &[("gtfs/feed_info.txt", "\u{feff}feed_publisher_name, feed_version\nTriMet, v1\n")],
        );
        let mut archive = FeedArchive::open(&path).unwrap();
        let rows = archive.read_table("feed_info").unwrap();
        assert_eq!(rows[0]["feed_publisher_name"], "TriMet");
        assert_eq!(rows[0]["feed_version"], "v1");
    }

    #[test]
    fn test_digest_ignores_row_and_column_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_zip(
            dir.path(),
            "a.zip",
            &[("stops.txt", "stop_id,stop_name\n1,Alpha\n2,Beta\n")],
        );
        let b = write_zip(
            dir.path(),
            "b.zip",
            &[("stops.txt", "stop_name,stop_id\nBeta,2\nAlpha,1\n")],
        );

        let da = FeedArchive::open(&a).unwrap().table_digest("stops").unwrap();
        let db = FeedArchive::open(&b).unwrap().table_digest("stops").unwrap();
        assert_eq!(da, db);
        assert_eq!(da.row_count, 2);
    }

    #[test]
    fn test_digest_detects_value_change() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_zip(dir.path(), "a.zip", &trimet_tables());
        let b = write_zip(
            dir.path(),
            "b.zip",
            &[("stops.txt", "stop_id,stop_name\n2,A Ave & Chandler\n")],
        );

        let da = FeedArchive::open(&a).unwrap().table_digest("stops").unwrap();
        let db = FeedArchive::open(&b).unwrap().table_digest("stops").unwrap();
        assert_ne!(da.checksum, db.checksum);
    }
}
