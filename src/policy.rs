//! Decides whether the downstream graph needs rebuilding.
//!
//! For each configured source: fetch through the [`CacheManager`], diff the
//! replaced snapshot against the new one when the bytes changed, and read the
//! new snapshot's [`FeedInfo`]. The resulting [`FreshnessReport`] keeps the
//! configured feed order and is saved as `freshness.json` in the cache
//! directory so the next run can tell which feeds went out of date since.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::cache::{CacheManager, FetchOutcome, atomic_write};
use crate::config::{Config, FeedKind, FeedSource};
use crate::diff::FeedDiff;
use crate::error::{FeedError, Result};
use crate::info::FeedInfo;

pub const REPORT_FILE: &str = "freshness.json";

/// One row of the freshness report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedReport {
    pub name: String,
    pub url: String,
    pub changed: bool,
    pub start: Option<String>,
    pub end: Option<String>,
    pub version: Option<String>,
    pub publisher: Option<String>,
    pub days_since: Option<i64>,
    pub days_until: Option<i64>,
    pub out_of_date: bool,
    pub newly_out_of_date: bool,
    /// `;`-separated, so the row stays flat in CSV.
    pub changed_tables: String,

    // error tracking
    pub error_type: Option<String>,
    pub error_message: Option<String>,
}

impl FeedReport {
    pub fn new(source: &FeedSource) -> Self {
        Self {
            name: source.name.clone(),
            url: source.url.clone(),
            ..Default::default()
        }
    }

    /// Report for a source whose fetch failed.
    pub fn from_error(source: &FeedSource, error: &FeedError) -> Self {
        Self::new(source).with_error(error)
    }

    pub fn with_error(mut self, error: &FeedError) -> Self {
        self.error_type = Some(error.kind().to_string());
        self.error_message = Some(error.to_string());
        self
    }

    pub fn is_error(&self) -> bool {
        self.error_type.is_some()
    }

    /// `true` when the report carries feed details (dates and version).
    pub fn has_details(&self) -> bool {
        self.start.is_some() && self.version.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FreshnessReport {
    pub generated_at: DateTime<Utc>,
    pub feeds: Vec<FeedReport>,
}

impl FreshnessReport {
    /// Any feed changed, or any feed went out of date since the last report.
    pub fn should_rebuild(&self) -> bool {
        self.feeds.iter().any(|f| f.changed || f.newly_out_of_date)
    }

    pub fn feed(&self, name: &str) -> Option<&FeedReport> {
        self.feeds.iter().find(|f| f.name == name)
    }
}

pub struct FreshnessPolicy {
    config: Config,
    cache: Arc<CacheManager>,
}

impl FreshnessPolicy {
    pub fn new(config: Config, cache: Arc<CacheManager>) -> Self {
        Self { config, cache }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &Arc<CacheManager> {
        &self.cache
    }

    fn report_path(&self) -> PathBuf {
        self.cache.cache_dir().join(REPORT_FILE)
    }

    /// The report saved by the previous [`evaluate`](Self::evaluate), if any.
    pub fn load_previous(&self) -> Result<Option<FreshnessReport>> {
        match std::fs::read(self.report_path()) {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)
                .inspect_err(|e| warn!(error = %e, "Ignoring unreadable previous report"))
                .ok()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Fetches every configured feed and builds the report.
    ///
    /// Per-feed failures end up in that feed's row; only failing to read or
    /// write the saved report is an error here.
    #[tracing::instrument(skip(self), fields(feeds = self.config.feeds.len()))]
    pub async fn evaluate(&self, force: bool) -> Result<FreshnessReport> {
        let previous = self.load_previous()?;
        let checks = self
            .cache
            .check_all(&self.config.feeds, force, self.config.concurrency)
            .await;

        let feeds: Vec<FeedReport> = checks
            .checks
            .into_iter()
            .map(|check| {
                let prior = previous.as_ref().and_then(|p| p.feed(&check.source.name));
                let mut report = match check.outcome {
                    Ok(outcome) => self.describe(&check.source, &outcome, prior),
                    Err(e) => FeedReport::from_error(&check.source, &e),
                };
                // A failed source keeps its last known staleness so the next
                // good run does not report it as newly out of date again.
                if report.is_error() && report.days_until.is_none() {
                    report.out_of_date = prior.is_some_and(|p| p.out_of_date);
                }
                report
            })
            .collect();

        let report = FreshnessReport {
            generated_at: Utc::now(),
            feeds,
        };
        info!(
            should_rebuild = report.should_rebuild(),
            failed = report.feeds.iter().filter(|f| f.is_error()).count(),
            "Freshness evaluated"
        );

        let bytes = serde_json::to_vec_pretty(&report)?;
        atomic_write(self.cache.cache_dir(), &self.report_path(), &bytes)?;
        Ok(report)
    }

    fn describe(&self, source: &FeedSource, outcome: &FetchOutcome, prior: Option<&FeedReport>) -> FeedReport {
        let mut report = FeedReport::new(source);
        report.changed = outcome.changed;
        if source.kind == FeedKind::Raw {
            return report;
        }

        let clock = self.config.clock.clone();

        if let Some(previous) = outcome.previous.as_ref().filter(|_| outcome.changed) {
            match FeedDiff::with_clock(&previous.path, &outcome.snapshot.path, clock.clone()) {
                Ok(diff) => {
                    report.changed = diff.is_different();
                    report.changed_tables = diff
                        .changed_tables()
                        .iter()
                        .map(String::as_str)
                        .collect::<Vec<_>>()
                        .join(";");
                    if !report.changed {
                        info!(feed = %source.name, "New download is equivalent to the previous feed");
                    }
                }
                Err(e) => {
                    warn!(feed = %source.name, error = %e, "Diff against previous snapshot failed");
                    return report.with_error(&e);
                }
            }
        }

        let info = match FeedInfo::open(&outcome.snapshot.path, clock) {
            Ok(info) => info,
            Err(e) => return report.with_error(&e),
        };
        report.version = Some(info.get_feed_version());
        report.publisher = info.publisher().map(str::to_string);

        match info.record() {
            Ok(record) => {
                report.start = Some(record.start_date);
                report.end = Some(record.end_date);
                report.days_since = Some(record.days_since_start);
                report.days_until = Some(record.days_until_end);
                report.out_of_date = record.days_until_end <= self.config.out_of_date_threshold_days;
                report.newly_out_of_date = report.out_of_date && !prior.is_some_and(|p| p.out_of_date);
                if report.out_of_date {
                    warn!(
                        feed = %source.name,
                        days_until = record.days_until_end,
                        "Feed calendar is out of date"
                    );
                }
                report
            }
            Err(e) => report.with_error(&e),
        }
    }
}
