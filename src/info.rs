//! Feed metadata needed for freshness decisions: service date range,
//! publisher, version and staleness relative to an injected clock.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::archive::{FeedArchive, Row};
use crate::clock::Clock;
use crate::digest::digest_file;
use crate::error::{FeedError, Result};

/// A GTFS `YYYYMMDD` date.
///
/// Ordering is on the 8-digit integer, which matches calendar order without
/// involving any timezone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceDate {
    value: u32,
    date: NaiveDate,
}

impl ServiceDate {
    /// Parses an 8-digit `YYYYMMDD` string. Returns `None` for anything else,
    /// including impossible dates such as `20150230`.
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        if s.len() != 8 || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let date = NaiveDate::parse_from_str(s, "%Y%m%d").ok()?;
        Some(Self {
            value: s.parse().ok()?,
            date,
        })
    }

    pub fn as_u32(self) -> u32 {
        self.value
    }

    pub fn to_naive(self) -> NaiveDate {
        self.date
    }
}

impl fmt::Display for ServiceDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08}", self.value)
    }
}

impl Serialize for ServiceDate {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DateRange {
    pub start: ServiceDate,
    pub end: ServiceDate,
}

impl DateRange {
    fn include(range: Option<Self>, start: ServiceDate, end: ServiceDate) -> Self {
        match range {
            None => Self { start, end },
            Some(r) => Self {
                start: r.start.min(start),
                end: r.end.max(end),
            },
        }
    }
}

/// `(start_date, end_date, publisher, version)` as reported by the feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedSummary {
    pub start_date: String,
    pub end_date: String,
    pub publisher: String,
    pub version: String,
}

/// Everything the freshness report needs from one archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedInfoRecord {
    pub start_date: String,
    pub end_date: String,
    pub feed_publisher: Option<String>,
    pub feed_version: String,
    pub days_since_start: i64,
    pub days_until_end: i64,
}

#[derive(Debug, Clone, Default)]
struct FeedInfoRow {
    publisher: Option<String>,
    version: Option<String>,
    start: Option<ServiceDate>,
    end: Option<ServiceDate>,
}

impl FeedInfoRow {
    fn from_row(row: &Row) -> Self {
        let text = |col: &str| {
            row.get(col)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };
        Self {
            publisher: text("feed_publisher_name"),
            version: text("feed_version"),
            start: row.get("feed_start_date").and_then(|v| ServiceDate::parse(v)),
            end: row.get("feed_end_date").and_then(|v| ServiceDate::parse(v)),
        }
    }
}

/// Metadata read once from a [`FeedArchive`].
#[derive(Debug, Clone)]
pub struct FeedInfo {
    checksum: String,
    feed_info: Option<FeedInfoRow>,
    calendar_range: Option<DateRange>,
    clock: Arc<dyn Clock>,
}

impl FeedInfo {
    /// Reads `feed_info`, `calendar` and `calendar_dates` from `archive`.
    pub fn new(archive: &mut FeedArchive, clock: Arc<dyn Clock>) -> Result<Self> {
        let checksum = digest_file(archive.path())?.sha256;

        let feed_info = archive
            .read_optional_table("feed_info")?
            .and_then(|rows| rows.first().map(FeedInfoRow::from_row));

        let calendar_range = scan_calendar(archive)?;

        debug!(
            path = %archive.path().display(),
            has_feed_info = feed_info.is_some(),
            calendar_range = ?calendar_range,
            "Read feed info"
        );

        Ok(Self {
            checksum,
            feed_info,
            calendar_range,
            clock,
        })
    }

    /// Opens `path` and reads its metadata; the archive is closed on return.
    pub fn open(path: impl AsRef<Path>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut archive = FeedArchive::open(path)?;
        Self::new(&mut archive, clock)
    }

    /// Publisher dates and version from `feed_info`, falling back to the
    /// calendar range and a synthetic version when the table or its fields
    /// are absent.
    pub fn get_feed_info(&self) -> Result<FeedSummary> {
        let row = self.feed_info.clone().unwrap_or_default();
        let range = match (row.start, row.end) {
            (Some(start), Some(end)) if start <= end => DateRange { start, end },
            _ => self.get_feed_date_range()?,
        };

        Ok(FeedSummary {
            start_date: range.start.to_string(),
            end_date: range.end.to_string(),
            publisher: row.publisher.unwrap_or_default(),
            version: self.get_feed_version(),
        })
    }

    /// Earliest start and latest end across `calendar` rows and the added
    /// service days of `calendar_dates`.
    pub fn get_feed_date_range(&self) -> Result<DateRange> {
        self.calendar_range.ok_or(FeedError::EmptyCalendar)
    }

    /// `feed_info.feed_version`, or `<start>-<end>-<checksum prefix>` when the
    /// feed does not publish one.
    pub fn get_feed_version(&self) -> String {
        if let Some(version) = self.feed_info.as_ref().and_then(|r| r.version.clone()) {
            return version;
        }
        let prefix = &self.checksum[..self.checksum.len().min(12)];
        match self.calendar_range {
            Some(range) => format!("{}-{}-{}", range.start, range.end, prefix),
            None => prefix.to_string(),
        }
    }

    pub fn publisher(&self) -> Option<&str> {
        self.feed_info.as_ref().and_then(|r| r.publisher.as_deref())
    }

    /// `(today - start, end - today)` in whole days. Either may be negative.
    pub fn get_days_since_stats(&self) -> Result<(i64, i64)> {
        let range = self.get_feed_date_range()?;
        let today = self.clock.today();
        let since = (today - range.start.to_naive()).num_days();
        let until = (range.end.to_naive() - today).num_days();
        Ok((since, until))
    }

    /// `true` once the calendar ends within `threshold_days` of today (or has
    /// already ended).
    pub fn is_out_of_date(&self, threshold_days: i64) -> Result<bool> {
        let (_, until) = self.get_days_since_stats()?;
        Ok(until <= threshold_days)
    }

    pub fn record(&self) -> Result<FeedInfoRecord> {
        let range = self.get_feed_date_range()?;
        let (days_since_start, days_until_end) = self.get_days_since_stats()?;
        Ok(FeedInfoRecord {
            start_date: range.start.to_string(),
            end_date: range.end.to_string(),
            feed_publisher: self.publisher().map(str::to_string),
            feed_version: self.get_feed_version(),
            days_since_start,
            days_until_end,
        })
    }
}

fn scan_calendar(archive: &mut FeedArchive) -> Result<Option<DateRange>> {
    let mut range = None;

    if let Some(rows) = archive.read_optional_table("calendar")? {
        for row in &rows {
            let start = row.get("start_date").and_then(|v| ServiceDate::parse(v));
            let end = row.get("end_date").and_then(|v| ServiceDate::parse(v));
            match (start, end) {
                (Some(start), Some(end)) if start <= end => {
                    range = Some(DateRange::include(range, start, end));
                }
                _ => warn!(
                    service_id = row.get("service_id").map(String::as_str).unwrap_or(""),
                    "Skipping calendar row with an unusable date span"
                ),
            }
        }
    }

    if let Some(rows) = archive.read_optional_table("calendar_dates")? {
        for row in &rows {
            if row.get("exception_type").map(|v| v.trim()) != Some("1") {
                continue;
            }
            if let Some(date) = row.get("date").and_then(|v| ServiceDate::parse(v)) {
                range = Some(DateRange::include(range, date, date));
            }
        }
    }

    Ok(range)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::test_support::{trimet_with, write_trimet, write_zip};

    fn clock(y: i32, m: u32, d: u32) -> Arc<dyn Clock> {
        Arc::new(FixedClock(NaiveDate::from_ymd_opt(y, m, d).unwrap()))
    }

    #[test]
    fn test_service_date_parse() {
        assert_eq!(ServiceDate::parse("20150927").unwrap().as_u32(), 20150927);
        assert_eq!(ServiceDate::parse(" 20160305 ").unwrap().to_string(), "20160305");
        assert!(ServiceDate::parse("2015-09-27").is_none());
        assert!(ServiceDate::parse("20150230").is_none());
        assert!(ServiceDate::parse("").is_none());
    }

    #[test]
    fn test_get_feed_info_trimet() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_trimet(dir.path(), "trimet.zip");
        let info = FeedInfo::open(&path, clock(2015, 10, 1)).unwrap();

        let summary = info.get_feed_info().unwrap();
        assert_eq!(
            summary,
            FeedSummary {
                start_date: "20150927".into(),
                end_date: "20160305".into(),
                publisher: "TriMet".into(),
                version: "20150927-20151006-0140".into(),
            }
        );
        assert_eq!(info.get_feed_version(), "20150927-20151006-0140");
    }

    #[test]
    fn test_date_range_uses_added_calendar_dates() {
        let dir = tempfile::tempdir().unwrap();
        let tables = trimet_with(
            "calendar_dates.txt",
            "service_id,date,exception_type\nW,20150920,1\nW,20160401,2\n",
        );
        let path = write_zip(dir.path(), "extra.zip", &tables);
        let info = FeedInfo::open(&path, clock(2015, 10, 1)).unwrap();

        let range = info.get_feed_date_range().unwrap();
        assert_eq!(range.start.to_string(), "20150920");
        // a removed service day never extends the range
        assert_eq!(range.end.to_string(), "20160305");
        assert!(range.start <= range.end);
    }

    #[test]
    fn test_empty_calendar() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            "empty.zip",
            &[
                ("calendar.txt", "service_id,start_date,end_date\n"),
                ("stops.txt", "stop_id\n1\n"),
            ],
        );
        let info = FeedInfo::open(&path, clock(2015, 10, 1)).unwrap();

        assert!(matches!(info.get_feed_date_range(), Err(FeedError::EmptyCalendar)));
        assert!(matches!(info.get_days_since_stats(), Err(FeedError::EmptyCalendar)));
        // version still resolves, from the content hash alone
        assert_eq!(info.get_feed_version().len(), 12);
    }

    #[test]
    fn test_synthetic_version_without_feed_info() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_zip(
            dir.path(),
            "nofi.zip",
            &[("calendar.txt", "service_id,start_date,end_date\nW,20200101,20201231\n")],
        );
        let info = FeedInfo::open(&path, clock(2020, 6, 1)).unwrap();

        let version = info.get_feed_version();
        assert!(version.starts_with("20200101-20201231-"));
        assert_eq!(version, FeedInfo::open(&path, clock(2021, 1, 1)).unwrap().get_feed_version());

        let summary = info.get_feed_info().unwrap();
        assert_eq!(summary.start_date, "20200101");
        assert_eq!(summary.publisher, "");
    }

    #[test]
    fn test_days_since_stats_and_staleness() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_trimet(dir.path(), "trimet.zip");

        let info = FeedInfo::open(&path, clock(2015, 10, 1)).unwrap();
        assert_eq!(info.get_days_since_stats().unwrap(), (4, 156));
        assert!(!info.is_out_of_date(0).unwrap());
        assert!(info.is_out_of_date(200).unwrap());

        // clock fixed one day after the calendar ends
        let info = FeedInfo::open(&path, clock(2016, 3, 6)).unwrap();
        let (since, until) = info.get_days_since_stats().unwrap();
        assert_eq!(until, -1);
        assert!(since > 0);
        assert!(info.is_out_of_date(0).unwrap());
    }

    #[test]
    fn test_record_before_start_is_negative() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_trimet(dir.path(), "trimet.zip");
        let info = FeedInfo::open(&path, clock(2015, 9, 20)).unwrap();

        let record = info.record().unwrap();
        assert_eq!(record.days_since_start, -7);
        assert_eq!(record.feed_publisher.as_deref(), Some("TriMet"));
        assert_eq!(record.start_date, "20150927");
    }
}
