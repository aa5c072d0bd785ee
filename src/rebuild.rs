//! Downstream rebuild trigger.
//!
//! The graph builder itself is external; it is reached through the
//! [`Builder`] trait so the decision logic can run without it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use chrono::Local;
use serde::Serialize;
use tracing::{info, warn};

use crate::cache::atomic_write;
use crate::config::GraphConfig;
use crate::error::{FeedError, Result};
use crate::output::append_changelog;
use crate::policy::{FreshnessPolicy, FreshnessReport};

pub const CHANGELOG_NAME: &str = "otp.v";

/// Present in the cache directory while a started rebuild has not succeeded.
pub const PENDING_MARKER: &str = "rebuild.pending";

/// Builds the downstream artifact from the files in the cache directory.
#[async_trait]
pub trait Builder: Send + Sync {
    async fn build(&self, cache_dir: &Path) -> Result<()>;
}

/// Runs an external command with the cache directory as working directory.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: String,
    args: Vec<String>,
}

impl CommandBuilder {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
        }
    }

    /// From `graph.command`; the first element is the program.
    pub fn from_config(graph: &GraphConfig) -> Result<Self> {
        let (program, args) = graph
            .command
            .split_first()
            .ok_or_else(|| FeedError::config("graph.command is empty"))?;
        Ok(Self::new(program.clone(), args.to_vec()))
    }
}

#[async_trait]
impl Builder for CommandBuilder {
    #[tracing::instrument(skip(self), fields(program = %self.program))]
    async fn build(&self, cache_dir: &Path) -> Result<()> {
        let status = tokio::process::Command::new(&self.program)
            .args(&self.args)
            .current_dir(cache_dir)
            .status()
            .await
            .map_err(|e| FeedError::Build(format!("cannot run {}: {e}", self.program)))?;

        if status.success() {
            Ok(())
        } else {
            Err(FeedError::Build(format!("{} exited with {status}", self.program)))
        }
    }
}

/// The built graph file and the rules that make it stale.
#[derive(Debug, Clone)]
pub struct GraphArtifact {
    pub path: PathBuf,
    pub failed_path: PathBuf,
    pub min_size: u64,
    pub max_age: Duration,
}

impl GraphArtifact {
    pub fn new(cache_dir: &Path, graph: &GraphConfig) -> Self {
        Self {
            path: cache_dir.join(&graph.name),
            failed_path: cache_dir.join(format!("{}-failed-tests", graph.name)),
            min_size: graph.min_size,
            max_age: Duration::from_secs(graph.expire_days * 24 * 60 * 60),
        }
    }

    /// Exists, is at least `min_size` bytes and younger than `max_age` at `now`.
    pub fn is_fresh(&self, now: SystemTime) -> bool {
        let Ok(meta) = std::fs::metadata(&self.path) else {
            return false;
        };
        if meta.len() < self.min_size {
            return false;
        }
        match meta.modified() {
            Ok(modified) => now
                .duration_since(modified)
                .map(|age| age < self.max_age)
                .unwrap_or(true),
            Err(_) => false,
        }
    }

    /// Moves a graph that failed its tests into place when no graph exists.
    /// Returns whether a move happened.
    pub fn promote_failed(&self) -> Result<bool> {
        if self.path.exists() || !self.failed_path.exists() {
            return Ok(false);
        }
        std::fs::rename(&self.failed_path, &self.path)?;
        info!(path = %self.path.display(), "Promoted failed graph");
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RebuildReason {
    Forced,
    /// An earlier rebuild was started but did not finish.
    Pending,
    GraphStale,
    FeedsChanged,
}

#[derive(Debug, Clone)]
pub struct RebuildOutcome {
    pub report: FreshnessReport,
    /// `None` when no rebuild was attempted.
    pub reason: Option<RebuildReason>,
}

impl RebuildOutcome {
    pub fn rebuilt(&self) -> bool {
        self.reason.is_some()
    }
}

pub struct RebuildOrchestrator {
    policy: FreshnessPolicy,
    builder: Arc<dyn Builder>,
    artifact: Option<GraphArtifact>,
}

impl RebuildOrchestrator {
    pub fn new(policy: FreshnessPolicy, builder: Arc<dyn Builder>) -> Self {
        let artifact = policy
            .config()
            .graph
            .as_ref()
            .map(|g| GraphArtifact::new(policy.cache().cache_dir(), g));
        Self {
            policy,
            builder,
            artifact,
        }
    }

    pub fn changelog_path(&self) -> PathBuf {
        self.policy.cache().cache_dir().join(CHANGELOG_NAME)
    }

    pub fn pending_path(&self) -> PathBuf {
        self.policy.cache().cache_dir().join(PENDING_MARKER)
    }

    /// Evaluates freshness and, when warranted, runs the builder and appends
    /// the changelog. Nothing is built when no feed produced details.
    ///
    /// The fetch already consumed the change, so a marker file carries the
    /// rebuild over to later runs until a build succeeds.
    #[tracing::instrument(skip(self))]
    pub async fn run(&self, force_rebuild: bool) -> Result<RebuildOutcome> {
        let report = self.policy.evaluate(false).await?;

        let graph_fresh = self
            .artifact
            .as_ref()
            .is_none_or(|a| a.is_fresh(SystemTime::now()));

        let reason = if force_rebuild {
            Some(RebuildReason::Forced)
        } else if self.pending_path().exists() {
            Some(RebuildReason::Pending)
        } else if !graph_fresh {
            Some(RebuildReason::GraphStale)
        } else if report.should_rebuild() {
            Some(RebuildReason::FeedsChanged)
        } else {
            None
        };

        let Some(reason) = reason else {
            info!("Graph is up to date, nothing to rebuild");
            return Ok(RebuildOutcome { report, reason: None });
        };

        let cache_dir = self.policy.cache().cache_dir();
        if !report.feeds.iter().any(|f| f.has_details()) {
            if report.should_rebuild() {
                atomic_write(cache_dir, &self.pending_path(), format!("{reason:?}\n").as_bytes())?;
            }
            warn!(?reason, "Rebuild wanted but no feed has usable details");
            return Ok(RebuildOutcome { report, reason: None });
        }

        info!(?reason, "Rebuilding graph");
        atomic_write(cache_dir, &self.pending_path(), format!("{reason:?}\n").as_bytes())?;
        self.builder.build(cache_dir).await?;
        append_changelog(&self.changelog_path(), &report.feeds, Local::now())?;
        match std::fs::remove_file(self.pending_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(RebuildOutcome {
            report,
            reason: Some(reason),
        })
    }
}
