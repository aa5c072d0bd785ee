//! Feed freshness and change detection for GTFS and other transit data feeds.
//!
//! [`cache::CacheManager`] keeps one file per configured source and only
//! transfers bodies that changed; [`diff::FeedDiff`] and [`info::FeedInfo`]
//! read the cached archives; [`policy::FreshnessPolicy`] combines them into
//! a per-feed report and a rebuild verdict.

pub mod archive;
pub mod cache;
pub mod clock;
pub mod config;
pub mod diff;
pub mod digest;
pub mod error;
pub mod fetch;
pub mod info;
pub mod output;
pub mod policy;
pub mod rebuild;

#[cfg(test)]
pub(crate) mod test_support;

pub use error::{FeedError, Result};
