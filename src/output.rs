//! Output formatting and persistence for freshness reports.
//!
//! Supports pretty-printing, JSON serialization, CSV append and the
//! human-readable changelog kept next to the built graph.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

use chrono::{DateTime, TimeZone};
use csv::WriterBuilder;
use tracing::{debug, info};

use crate::error::Result;
use crate::policy::{FeedReport, FreshnessReport};

/// Logs a report using Rust's debug pretty-print format.
pub fn print_pretty(report: &FreshnessReport) {
    debug!("{:#?}", report);
}

/// Logs a report as pretty-printed JSON.
pub fn print_json(report: &FreshnessReport) -> Result<()> {
    info!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

/// Appends a [`FeedReport`] as a row to a CSV file.
///
/// Creates the file with headers if it does not already exist.
pub fn append_record(path: &Path, feed: &FeedReport) -> Result<()> {
    let file_exists = path.exists();
    debug!(path = %path.display(), file_exists, "Appending CSV record");

    let file = OpenOptions::new().append(true).create(true).open(path)?;

    let mut writer = WriterBuilder::new()
        .has_headers(!file_exists) // IMPORTANT when appending
        .from_writer(file);

    writer.serialize(feed)?;
    writer.flush()?;

    Ok(())
}

/// One changelog line: `  name - date range start to end (until more calendar days), version v`.
pub fn changelog_line(feed: &FeedReport) -> String {
    format!(
        "  {} - date range {} to {} ({:>3} more calendar days), version {}\n",
        feed.name,
        feed.start.as_deref().unwrap_or("?"),
        feed.end.as_deref().unwrap_or("?"),
        feed.days_until.map(|d| d.to_string()).unwrap_or_else(|| "?".into()),
        feed.version.as_deref().unwrap_or("?"),
    )
}

/// Appends a dated block listing every feed with details to the changelog.
/// Does nothing when no feed has details.
pub fn append_changelog<Tz>(path: &Path, feeds: &[FeedReport], at: DateTime<Tz>) -> Result<()>
where
    Tz: TimeZone,
    Tz::Offset: std::fmt::Display,
{
    let lines: Vec<String> = feeds
        .iter()
        .filter(|f| f.has_details())
        .map(changelog_line)
        .collect();
    if lines.is_empty() {
        return Ok(());
    }

    let mut msg = format!(
        "\nUpdated graph on {} with GTFS feed(s):\n",
        at.format("%B %d, %Y @ %I:%M %p")
    );
    for line in lines {
        msg.push_str(&line);
    }

    let mut file = OpenOptions::new().append(true).create(true).open(path)?;
    file.write_all(msg.as_bytes())?;
    file.flush()?;
    Ok(())
}
