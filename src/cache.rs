//! Name-addressed cache of remote feed files.
//!
//! ## Layout
//!
//! ```text
//! {cache_dir}/
//! ├── trimet.zip              # current snapshot, replaced only by rename
//! ├── trimet.zip.prev         # snapshot the last changed download replaced
//! └── trimet.zip.meta.json    # CacheEntry: url, validators, checksum, size
//! ```
//!
//! Downloads stream into a temporary file in the cache directory and are
//! renamed over the canonical name only after validation, so the canonical
//! file is never partially written. Every operation on one name holds that
//! name's async lock.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::sync::Semaphore;
use tracing::{Instrument, debug, error, info, warn};

use crate::archive::FeedArchive;
use crate::config::{Config, FeedKind, FeedSource};
use crate::digest::{FileDigest, digest_file};
use crate::error::{FeedError, Result};
use crate::fetch::{HttpClient, Validators, client_for, conditional_get};

/// One fetched copy of a feed. Superseded, never mutated, by the next fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedSnapshot {
    pub path: PathBuf,
    pub retrieved_at: DateTime<Utc>,
    pub size: u64,
    pub checksum: String,
}

/// Sidecar metadata persisted next to each cached file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub name: String,
    pub url: String,
    pub local_path: PathBuf,
    #[serde(flatten)]
    pub validators: Validators,
    pub checksum: String,
    pub size: u64,
    pub fetched_at: DateTime<Utc>,
    pub checked_at: DateTime<Utc>,
}

impl CacheEntry {
    pub fn snapshot(&self) -> FeedSnapshot {
        FeedSnapshot {
            path: self.local_path.clone(),
            retrieved_at: self.fetched_at,
            size: self.size,
            checksum: self.checksum.clone(),
        }
    }
}

/// Result of one [`CacheManager::fetch`].
#[derive(Debug, Clone)]
pub struct FetchOutcome {
    pub name: String,
    pub snapshot: FeedSnapshot,
    /// The snapshot this fetch replaced; only set when `changed`.
    pub previous: Option<FeedSnapshot>,
    /// Cached bytes differ from before (or there was no cached copy).
    pub changed: bool,
    /// A response body was transferred.
    pub transferred: bool,
}

/// Per-source result of [`CacheManager::check_all`].
#[derive(Debug)]
pub struct SourceCheck {
    pub source: FeedSource,
    pub outcome: Result<FetchOutcome>,
}

#[derive(Debug, Default)]
pub struct CheckAll {
    /// In configured order.
    pub checks: Vec<SourceCheck>,
}

impl CheckAll {
    /// `true` if any source's cached file changed; failed sources count as unchanged.
    pub fn any_changed(&self) -> bool {
        self.checks
            .iter()
            .any(|c| matches!(&c.outcome, Ok(o) if o.changed))
    }

    pub fn failed(&self) -> impl Iterator<Item = &SourceCheck> {
        self.checks.iter().filter(|c| c.outcome.is_err())
    }
}

enum Download {
    NotModified,
    Body {
        temp: NamedTempFile,
        digest: FileDigest,
        validators: Validators,
    },
}

pub struct CacheManager {
    cache_dir: PathBuf,
    client: Arc<dyn HttpClient>,
    timeout: Duration,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CacheManager {
    /// Creates the cache directory if needed.
    pub fn new(cache_dir: impl Into<PathBuf>, client: Arc<dyn HttpClient>) -> Result<Self> {
        let cache_dir = cache_dir.into();
        fs::create_dir_all(&cache_dir)?;
        Ok(Self {
            cache_dir,
            client,
            timeout: Duration::from_secs(300),
            locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_config(config: &Config, client: Arc<dyn HttpClient>) -> Result<Self> {
        Ok(Self::new(&config.cache_dir, client)?
            .with_timeout(Duration::from_secs(config.fetch_timeout_secs)))
    }

    /// Deadline for one fetch, request and body included.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.cache_dir.join(name)
    }

    pub fn previous_path_for(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{name}.prev"))
    }

    fn meta_path_for(&self, name: &str) -> PathBuf {
        self.cache_dir.join(format!("{name}.meta.json"))
    }

    fn lock_for(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.entry(name.to_string()).or_default().clone()
    }

    /// The cache entry for `name`, or `None` when nothing is cached.
    ///
    /// A cached file without usable sidecar metadata is re-digested and gets
    /// no validators, which forces the next fetch to transfer the body.
    pub fn entry(&self, name: &str) -> Result<Option<CacheEntry>> {
        let path = self.path_for(name);
        let file_meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let stored: Option<CacheEntry> = match fs::read(self.meta_path_for(name)) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .inspect_err(|e| warn!(feed = name, error = %e, "Ignoring unreadable cache metadata"))
                .ok(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => return Err(e.into()),
        };

        if let Some(entry) = stored.filter(|e| e.size == file_meta.len()) {
            return Ok(Some(entry));
        }

        let digest = digest_file(&path)?;
        let modified: DateTime<Utc> = file_meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now());
        Ok(Some(CacheEntry {
            name: name.to_string(),
            url: String::new(),
            local_path: path,
            validators: Validators::default(),
            checksum: digest.sha256,
            size: digest.size,
            fetched_at: modified,
            checked_at: modified,
        }))
    }

    pub fn snapshot(&self, name: &str) -> Result<Option<FeedSnapshot>> {
        Ok(self.entry(name)?.map(|e| e.snapshot()))
    }

    /// The retained copy from before the last changed download.
    fn previous_snapshot(&self, name: &str) -> Result<Option<FeedSnapshot>> {
        let path = self.previous_path_for(name);
        let file_meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let digest = digest_file(&path)?;
        Ok(Some(FeedSnapshot {
            path,
            retrieved_at: file_meta.modified().map(Into::into).unwrap_or_else(|_| Utc::now()),
            size: digest.size,
            checksum: digest.sha256,
        }))
    }

    /// Fetches a GTFS archive from `url` into `local_name`.
    pub async fn fetch(&self, url: &str, local_name: &str, force: bool) -> Result<FetchOutcome> {
        self.fetch_source(&FeedSource::new(local_name, url), force).await
    }

    /// Refreshes the cached copy of `source`.
    ///
    /// Without `force`, a cached copy with validators is revalidated with a
    /// conditional request and a 304 returns it untouched. A downloaded body
    /// identical to the cached bytes leaves the cached file alone. On any
    /// error the previous cache entry is left as it was.
    #[tracing::instrument(skip(self, source), fields(feed = %source.name, url = %source.url))]
    pub async fn fetch_source(&self, source: &FeedSource, force: bool) -> Result<FetchOutcome> {
        let lock = self.lock_for(&source.name);
        let _guard = lock.lock().await;

        let existing = self.entry(&source.name)?;
        let client = client_for(self.client.clone(), source)?;
        let validators = existing
            .as_ref()
            .map(|e| &e.validators)
            .filter(|v| !force && !v.is_empty());

        let download = tokio::time::timeout(
            self.timeout,
            self.download(client.as_ref(), source, validators),
        )
        .await
        .map_err(|_| FeedError::download(&source.url, format!("timed out after {:?}", self.timeout)))??;

        let now = Utc::now();
        match download {
            Download::NotModified => {
                let Some(mut entry) = existing else {
                    return Err(FeedError::download(&source.url, "304 Not Modified without a cached copy"));
                };
                info!("Remote not modified");
                entry.checked_at = now;
                self.write_entry(&entry)?;
                Ok(FetchOutcome {
                    name: source.name.clone(),
                    snapshot: entry.snapshot(),
                    previous: None,
                    changed: false,
                    transferred: false,
                })
            }
            Download::Body {
                temp,
                digest,
                validators,
            } => {
                validate(source, temp.path(), digest.size)?;

                if let Some(mut entry) = existing.filter(|e| e.checksum == digest.sha256) {
                    info!(size = digest.size, "Downloaded body matches cached copy");
                    entry.url = source.url.clone();
                    entry.validators = validators;
                    entry.checked_at = now;
                    self.write_entry(&entry)?;
                    return Ok(FetchOutcome {
                        name: source.name.clone(),
                        snapshot: entry.snapshot(),
                        previous: None,
                        changed: false,
                        transferred: true,
                    });
                }

                let previous = self.promote(&source.name, temp)?;
                let entry = CacheEntry {
                    name: source.name.clone(),
                    url: source.url.clone(),
                    local_path: self.path_for(&source.name),
                    validators,
                    checksum: digest.sha256,
                    size: digest.size,
                    fetched_at: now,
                    checked_at: now,
                };
                self.write_entry(&entry)?;
                info!(size = entry.size, checksum = %entry.checksum, "Cached new feed snapshot");

                Ok(FetchOutcome {
                    name: source.name.clone(),
                    snapshot: entry.snapshot(),
                    previous,
                    changed: true,
                    transferred: true,
                })
            }
        }
    }

    /// Fetches every source, at most `concurrency` at a time.
    ///
    /// Results keep the order of `sources`. A failing source is logged and
    /// recorded in its [`SourceCheck`]; the others still run.
    pub async fn check_all(self: &Arc<Self>, sources: &[FeedSource], force: bool, concurrency: usize) -> CheckAll {
        let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
        let mut tasks = Vec::with_capacity(sources.len());

        for source in sources {
            let sem = semaphore.clone();
            let cache = Arc::clone(self);
            let source = source.clone();
            let span = tracing::info_span!("check_feed", feed = %source.name);

            tasks.push(tokio::spawn(
                async move {
                    let _permit = sem
                        .acquire()
                        .await
                        .map_err(|e| FeedError::Io(io::Error::other(e)))?;
                    cache.fetch_source(&source, force).await
                }
                .instrument(span),
            ));
        }

        let mut checks = Vec::with_capacity(sources.len());
        for (source, task) in sources.iter().zip(tasks) {
            let outcome = task
                .await
                .unwrap_or_else(|e| Err(FeedError::Io(io::Error::other(e))));
            match &outcome {
                Ok(o) => info!(feed = %source.name, changed = o.changed, "Feed checked"),
                Err(e) if e.is_recoverable() => warn!(feed = %source.name, error = %e, "Feed check failed"),
                Err(e) => error!(feed = %source.name, error = %e, kind = e.kind(), "Feed check failed"),
            }
            checks.push(SourceCheck {
                source: source.clone(),
                outcome,
            });
        }

        CheckAll { checks }
    }

    async fn download(
        &self,
        client: &dyn HttpClient,
        source: &FeedSource,
        validators: Option<&Validators>,
    ) -> Result<Download> {
        let mut resp = conditional_get(client, &source.url, validators).await?;
        let status = resp.status();
        debug!(%status, conditional = validators.is_some(), "Response received");

        if status == StatusCode::NOT_MODIFIED && validators.is_some() {
            return Ok(Download::NotModified);
        }
        if !status.is_success() {
            return Err(FeedError::download(&source.url, format!("HTTP {status}")));
        }

        let validators = Validators::from_response(&resp);
        let mut temp = tempfile::Builder::new()
            .prefix(&format!(".{}.", source.name))
            .suffix(".part")
            .tempfile_in(&self.cache_dir)?;

        let mut hasher = Sha256::new();
        let mut size = 0u64;
        while let Some(chunk) = resp
            .chunk()
            .await
            .map_err(|e| FeedError::download(&source.url, e))?
        {
            hasher.update(&chunk);
            temp.write_all(&chunk)?;
            size += chunk.len() as u64;
        }
        temp.flush()?;
        temp.as_file().sync_all()?;

        Ok(Download::Body {
            temp,
            digest: FileDigest {
                size,
                sha256: hex::encode(hasher.finalize()),
            },
            validators,
        })
    }

    /// Keeps the current file as `<name>.prev` and renames `temp` over `<name>`.
    fn promote(&self, name: &str, temp: NamedTempFile) -> Result<Option<FeedSnapshot>> {
        let current = self.path_for(name);
        let prev = self.previous_path_for(name);

        let had_current = current.exists();
        if had_current {
            match fs::remove_file(&prev) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            if fs::hard_link(&current, &prev).is_err() {
                fs::copy(&current, &prev)?;
            }
        }

        temp.persist(&current).map_err(|e| FeedError::Io(e.error))?;

        if had_current {
            self.previous_snapshot(name)
        } else {
            Ok(None)
        }
    }

    fn write_entry(&self, entry: &CacheEntry) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(entry)?;
        atomic_write(&self.cache_dir, &self.meta_path_for(&entry.name), &bytes)
    }
}

/// Writes `data` to a temporary file in `dir`, then renames it onto `path`.
pub(crate) fn atomic_write(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(data)?;
    temp.flush()?;
    temp.persist(path).map_err(|e| FeedError::Io(e.error))?;
    Ok(())
}

fn validate(source: &FeedSource, path: &Path, size: u64) -> Result<()> {
    if size == 0 {
        return Err(FeedError::validation(&source.name, "empty response body"));
    }
    if source.kind == FeedKind::Gtfs {
        let archive = FeedArchive::open(path).map_err(|e| FeedError::validation(&source.name, e))?;
        if archive.table_names().next().is_none() {
            return Err(FeedError::validation(&source.name, "archive contains no tables"));
        }
    }
    Ok(())
}
