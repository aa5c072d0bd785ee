//! Table-by-table comparison of two feed archives.
//!
//! Cheap signals first: identical size and whole-file checksum short-circuit
//! to "not different". Otherwise every table in either archive is compared by
//! row count and an order-independent row-set checksum, and the resolved
//! calendar range and version are compared through [`FeedInfo`].

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::archive::FeedArchive;
use crate::clock::{Clock, SystemClock};
use crate::digest::digest_file;
use crate::error::{FeedError, Result};
use crate::info::{DateRange, FeedInfo};

/// How a single table differs between baseline and candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "change", rename_all = "snake_case")]
pub enum TableChange {
    Added { rows: usize },
    Removed { rows: usize },
    Modified {
        rows_before: usize,
        rows_after: usize,
        checksum_mismatch: bool,
    },
}

impl TableChange {
    /// Candidate row count minus baseline row count.
    pub fn row_delta(&self) -> i64 {
        match self {
            TableChange::Added { rows } => *rows as i64,
            TableChange::Removed { rows } => -(*rows as i64),
            TableChange::Modified {
                rows_before,
                rows_after,
                ..
            } => *rows_after as i64 - *rows_before as i64,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiffResult {
    pub changed: bool,
    pub changed_tables: BTreeSet<String>,
    pub details: BTreeMap<String, TableChange>,
    /// Resolved calendar range or version differs.
    pub calendar_changed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Semantics {
    range: Option<DateRange>,
    version: String,
}

/// Compares baseline `a` against candidate `b`.
#[derive(Debug, Clone)]
pub struct FeedDiff {
    baseline: PathBuf,
    candidate: PathBuf,
    result: DiffResult,
}

impl FeedDiff {
    /// Opens both archives and computes the comparison.
    ///
    /// Open failures propagate unchanged; an unreadable archive is never
    /// reported as same or different.
    #[tracing::instrument(skip_all, fields(a = %a.as_ref().display(), b = %b.as_ref().display()))]
    pub fn new(a: impl AsRef<Path>, b: impl AsRef<Path>) -> Result<Self> {
        Self::with_clock(a, b, Arc::new(SystemClock))
    }

    pub fn with_clock(a: impl AsRef<Path>, b: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let (a, b) = (a.as_ref(), b.as_ref());
        let mut archive_a = FeedArchive::open(a)?;
        let mut archive_b = FeedArchive::open(b)?;

        let result = if digest_file(a)? == digest_file(b)? {
            debug!("Archives are byte-identical");
            DiffResult::default()
        } else {
            compare(&mut archive_a, &mut archive_b, clock)?
        };

        info!(
            changed = result.changed,
            tables = ?result.changed_tables,
            "Feed diff complete"
        );

        Ok(Self {
            baseline: a.to_path_buf(),
            candidate: b.to_path_buf(),
            result,
        })
    }

    pub fn is_different(&self) -> bool {
        self.result.changed
    }

    /// Tables contributing to the verdict; empty when not different.
    pub fn changed_tables(&self) -> &BTreeSet<String> {
        &self.result.changed_tables
    }

    pub fn result(&self) -> &DiffResult {
        &self.result
    }

    pub fn baseline(&self) -> &Path {
        &self.baseline
    }

    pub fn candidate(&self) -> &Path {
        &self.candidate
    }
}

fn compare(a: &mut FeedArchive, b: &mut FeedArchive, clock: Arc<dyn Clock>) -> Result<DiffResult> {
    let names: BTreeSet<String> = a
        .table_names()
        .chain(b.table_names())
        .map(str::to_string)
        .collect();

    let mut details = BTreeMap::new();
    for name in &names {
        let change = match (a.has_table(name), b.has_table(name)) {
            (true, false) => Some(TableChange::Removed {
                rows: a.table_digest(name)?.row_count,
            }),
            (false, true) => Some(TableChange::Added {
                rows: b.table_digest(name)?.row_count,
            }),
            _ => {
                let da = a.table_digest(name)?;
                let db = b.table_digest(name)?;
                (da != db).then(|| TableChange::Modified {
                    rows_before: da.row_count,
                    rows_after: db.row_count,
                    checksum_mismatch: da.checksum != db.checksum,
                })
            }
        };
        if let Some(change) = change {
            debug!(table = %name, ?change, "Table differs");
            details.insert(name.clone(), change);
        }
    }

    let calendar_changed = semantics(a, clock.clone())? != semantics(b, clock)?;

    let mut changed_tables: BTreeSet<String> = details.keys().cloned().collect();
    if calendar_changed && changed_tables.is_empty() {
        changed_tables.insert("calendar".to_string());
    }

    Ok(DiffResult {
        changed: !changed_tables.is_empty(),
        changed_tables,
        details,
        calendar_changed,
    })
}

fn semantics(archive: &mut FeedArchive, clock: Arc<dyn Clock>) -> Result<Semantics> {
    let info = FeedInfo::new(archive, clock)?;
    let range = match info.get_feed_date_range() {
        Ok(range) => Some(range),
        Err(FeedError::EmptyCalendar) => None,
        Err(e) => return Err(e),
    };
    // A synthetic version embeds the file checksum, so only published
    // versions take part in the comparison.
    let version = published_version(archive)?;
    Ok(Semantics { range, version })
}

fn published_version(archive: &mut FeedArchive) -> Result<String> {
    Ok(archive
        .read_optional_table("feed_info")?
        .and_then(|rows| rows.into_iter().next())
        .and_then(|row| row.get("feed_version").cloned())
        .unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{CALENDAR_DATES, trimet_tables, trimet_with, write_trimet, write_zip};

    #[test]
    fn test_same_file_is_not_different() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_trimet(dir.path(), "a.zip");

        let diff = FeedDiff::new(&a, &a).unwrap();
        assert!(!diff.is_different());
        assert!(diff.changed_tables().is_empty());
    }

    #[test]
    fn test_identical_copy_is_not_different() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_trimet(dir.path(), "a.zip");
        let b = dir.path().join("b.zip");
        std::fs::copy(&a, &b).unwrap();

        assert!(!FeedDiff::new(&a, &b).unwrap().is_different());
    }

    #[test]
    fn test_added_calendar_dates_row() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_trimet(dir.path(), "a.zip");
        let extra = format!("{CALENDAR_DATES}S,20151225,2\n");
        let c = write_zip(dir.path(), "c.zip", &trimet_with("calendar_dates.txt", &extra));

        let diff = FeedDiff::new(&a, &c).unwrap();
        assert!(diff.is_different());
        assert!(diff.changed_tables().contains("calendar_dates"));
        assert_eq!(diff.changed_tables().len(), 1);
        assert_eq!(diff.result().details["calendar_dates"].row_delta(), 1);
        // removed service days leave the resolved range alone
        assert!(!diff.result().calendar_changed);
    }

    #[test]
    fn test_reordered_rows_are_not_different() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_trimet(dir.path(), "a.zip");
        let mut tables = trimet_tables();
        tables.reverse();
        let reordered = "route_id,service_id,trip_id\n90,S,5002\n90,W,5001\n";
        for (name, body) in tables.iter_mut() {
            if *name == "trips.txt" {
                *body = reordered.to_string();
            }
        }
        let b = write_zip(dir.path(), "b.zip", &tables);

        assert_ne!(std::fs::read(&a).unwrap(), std::fs::read(&b).unwrap());
        let diff = FeedDiff::new(&a, &b).unwrap();
        assert!(!diff.is_different());
    }

    #[test]
    fn test_table_set_difference_is_symmetric() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_trimet(dir.path(), "a.zip");
        let mut tables = trimet_tables();
        tables.push(("shapes.txt", "shape_id,shape_pt_lat,shape_pt_lon,shape_pt_sequence\n1,45.5,-122.6,1\n".into()));
        let b = write_zip(dir.path(), "b.zip", &tables);

        let ab = FeedDiff::new(&a, &b).unwrap();
        let ba = FeedDiff::new(&b, &a).unwrap();
        assert!(ab.is_different());
        assert_eq!(ab.is_different(), ba.is_different());
        assert_eq!(ab.result().details["shapes"], TableChange::Added { rows: 1 });
        assert_eq!(ba.result().details["shapes"], TableChange::Removed { rows: 1 });
    }

    #[test]
    fn test_feed_info_version_change() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_trimet(dir.path(), "a.zip");
        let fi = "feed_publisher_name,feed_publisher_url,feed_lang,feed_start_date,feed_end_date,feed_version\n\
TriMet,http://trimet.org,en,20150927,20160305,20151010-20151020-0001\n";
        let b = write_zip(dir.path(), "b.zip", &trimet_with("feed_info.txt", fi));

        let diff = FeedDiff::new(&a, &b).unwrap();
        assert!(diff.is_different());
        assert!(diff.changed_tables().contains("feed_info"));
        assert!(diff.result().calendar_changed);
    }

    #[test]
    fn test_corrupt_candidate_propagates() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_trimet(dir.path(), "a.zip");
        let bad = dir.path().join("bad.zip");
        std::fs::write(&bad, b"not a zip").unwrap();

        assert!(matches!(
            FeedDiff::new(&a, &bad),
            Err(FeedError::CorruptArchive { .. })
        ));
        assert!(matches!(
            FeedDiff::new(&bad, &a),
            Err(FeedError::CorruptArchive { .. })
        ));
    }
}
