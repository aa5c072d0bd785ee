//! Typed configuration for the feed cache, loaded from TOML.
//!
//! ```toml
//! cache_dir = "cache"
//! out_of_date_threshold_days = 7
//!
//! [[feeds]]
//! name = "trimet.zip"
//! url = "https://developer.trimet.org/schedule/gtfs.zip"
//!
//! [[feeds]]
//! name = "or-wa.osm.pbf"
//! url = "https://example.org/extracts/or-wa.osm.pbf"
//! kind = "raw"
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tracing::info;

use crate::clock::{Clock, SystemClock};
use crate::error::{FeedError, Result};
use crate::policy::REPORT_FILE;
use crate::rebuild::{CHANGELOG_NAME, PENDING_MARKER};

/// What a cached file is expected to contain.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FeedKind {
    /// GTFS zip, validated by opening it as an archive.
    #[default]
    Gtfs,
    /// Any other download (OSM extract, JSON), validated for non-emptiness only.
    Raw,
}

/// How to attach an API key to requests for one feed. The key itself is read
/// from the environment variable `env`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FeedAuthConfig {
    UrlParam { param_name: String, env: String },
    Header { header_name: String, env: String },
    Bearer { env: String },
}

impl FeedAuthConfig {
    fn env(&self) -> &str {
        match self {
            FeedAuthConfig::UrlParam { env, .. }
            | FeedAuthConfig::Header { env, .. }
            | FeedAuthConfig::Bearer { env } => env,
        }
    }

    /// Reads the key from the environment.
    pub fn resolve_key(&self) -> Result<String> {
        std::env::var(self.env())
            .map_err(|_| FeedError::config(format!("environment variable {} must be set", self.env())))
    }
}

/// One remote source and the cache file it lands in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FeedSource {
    /// Cache file name, e.g. `trimet.zip`.
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub kind: FeedKind,
    #[serde(default)]
    pub auth: Option<FeedAuthConfig>,
}

impl FeedSource {
    pub fn new(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            kind: FeedKind::Gtfs,
            auth: None,
        }
    }

    pub fn raw(name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            kind: FeedKind::Raw,
            ..Self::new(name, url)
        }
    }
}

/// Downstream graph artifact whose age and size gate a rebuild.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct GraphConfig {
    #[serde(default = "default_graph_name")]
    pub name: String,
    #[serde(default = "default_graph_min_size")]
    pub min_size: u64,
    #[serde(default = "default_graph_expire_days")]
    pub expire_days: u64,
    /// Builder command, run with the cache directory as working directory.
    #[serde(default)]
    pub command: Vec<String>,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            name: default_graph_name(),
            min_size: default_graph_min_size(),
            expire_days: default_graph_expire_days(),
            command: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub feeds: Vec<FeedSource>,
    /// Target for the (external) database loader.
    #[serde(default)]
    pub db_url: Option<String>,
    #[serde(default)]
    pub is_geospatial: bool,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
    #[serde(default)]
    pub out_of_date_threshold_days: i64,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    /// Sources fetched at once; 1 keeps processing sequential.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub graph: Option<GraphConfig>,
    #[serde(skip, default = "default_clock")]
    pub clock: Arc<dyn Clock>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            feeds: Vec::new(),
            db_url: None,
            is_geospatial: false,
            cache_dir: default_cache_dir(),
            out_of_date_threshold_days: 0,
            fetch_timeout_secs: default_fetch_timeout_secs(),
            concurrency: default_concurrency(),
            graph: None,
            clock: default_clock(),
        }
    }
}

impl Config {
    /// Loads and validates a TOML config file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| FeedError::config(format!("cannot read {}: {e}", path.display())))?;
        let config = Self::from_toml(&text)?;
        info!(path = %path.display(), feeds = config.feeds.len(), "Loaded config");
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| FeedError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    /// Feed names must be unique plain file names that do not collide with
    /// the cache's own files, and URLs must parse.
    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for feed in &self.feeds {
            if feed.name.is_empty() || feed.name.starts_with('.') || feed.name.contains(['/', '\\']) {
                return Err(FeedError::config(format!("invalid feed name '{}'", feed.name)));
            }
            if self.is_reserved_name(&feed.name) {
                return Err(FeedError::config(format!(
                    "feed name '{}' is reserved by the cache",
                    feed.name
                )));
            }
            if !seen.insert(feed.name.as_str()) {
                return Err(FeedError::config(format!("duplicate feed name '{}'", feed.name)));
            }
            reqwest::Url::parse(&feed.url)
                .map_err(|e| FeedError::config(format!("feed '{}' has bad url: {e}", feed.name)))?;
        }
        if self.concurrency == 0 {
            return Err(FeedError::config("concurrency must be at least 1"));
        }
        Ok(())
    }
}

impl Config {
    fn is_reserved_name(&self, name: &str) -> bool {
        const RESERVED_SUFFIXES: [&str; 3] = [".prev", ".meta.json", ".part"];
        [REPORT_FILE, CHANGELOG_NAME, PENDING_MARKER].contains(&name)
            || self.graph.as_ref().is_some_and(|g| {
                name == g.name || name == format!("{}-failed-tests", g.name)
            })
            || RESERVED_SUFFIXES.iter().any(|s| name.ends_with(s))
    }
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

fn default_fetch_timeout_secs() -> u64 {
    300
}

fn default_concurrency() -> usize {
    1
}

fn default_clock() -> Arc<dyn Clock> {
    Arc::new(SystemClock)
}

fn default_graph_name() -> String {
    "Graph.obj".to_string()
}

fn default_graph_min_size() -> u64 {
    50_000_000
}

fn default_graph_expire_days() -> u64 {
    45
}
