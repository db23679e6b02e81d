//! Engine configuration with documented defaults.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::errors::{ConvertError, ConvertResult};
use crate::models::Timestamp;

pub const DEFAULT_COMMIT_WINDOW_SECS: i64 = 300;
pub const DEFAULT_PREFETCH_WORKERS: usize = 4;

/// Bounded retry for transient source failures.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Upper bound for a single collaborator call; enforced by the collaborator.
    pub timeout_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            max_backoff_ms: 10_000,
            timeout_secs: 600,
        }
    }
}

impl RetryPolicy {
    pub fn no_backoff(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            ..Self::default()
        }
    }

    /// Delay before attempt `attempt + 1` (attempts are 1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(factor)
            .min(self.max_backoff_ms.max(self.initial_backoff_ms));
        Duration::from_millis(millis)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Full conversion or incremental continuation after a cutoff.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConversionMode {
    Full,
    Incremental { since: Timestamp },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root paths handed to the history source.
    pub roots: Vec<String>,
    /// Sliding commit-grouping window in seconds.
    pub commit_window_secs: i64,
    /// Emit the `branches`/`tags` container revision in full mode.
    pub create_containers: bool,
    /// Treat a branch whose parent is unavailable as fatal.
    pub strict_orphans: bool,
    /// Re-fetch zero-size cache entries once before trusting them.
    pub verify_zero_size: bool,
    pub prefetch_workers: usize,
    pub checkpoint_every: u64,
    pub branches_dir: String,
    pub tags_dir: String,
    /// Put every symbolic link into this branch.
    pub links_branch: Option<String>,
    /// Incremental cutoff, `YYYYMMDD.HHMMSS`.
    #[serde(
        serialize_with = "serialize_since",
        deserialize_with = "deserialize_since"
    )]
    pub dump_since: Option<Timestamp>,
    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            roots: vec![".".to_string()],
            commit_window_secs: DEFAULT_COMMIT_WINDOW_SECS,
            create_containers: true,
            strict_orphans: false,
            verify_zero_size: true,
            prefetch_workers: DEFAULT_PREFETCH_WORKERS,
            checkpoint_every: 1,
            branches_dir: "branches".to_string(),
            tags_dir: "tags".to_string(),
            links_branch: None,
            dump_since: None,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn mode(&self) -> ConversionMode {
        match self.dump_since {
            Some(since) => ConversionMode::Incremental { since },
            None => ConversionMode::Full,
        }
    }

    pub fn validate(&self) -> ConvertResult<()> {
        if self.roots.is_empty() {
            return Err(ConvertError::Config("at least one root path is required".into()));
        }
        if self.commit_window_secs < 0 {
            return Err(ConvertError::Config(format!(
                "commit_window_secs must be >= 0, got {}",
                self.commit_window_secs
            )));
        }
        if self.checkpoint_every == 0 {
            return Err(ConvertError::Config("checkpoint_every must be >= 1".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConvertError::Config("retry.max_attempts must be >= 1".into()));
        }
        for (name, value) in [("branches_dir", &self.branches_dir), ("tags_dir", &self.tags_dir)] {
            if value.trim().is_empty() || value.contains('/') {
                return Err(ConvertError::Config(format!(
                    "{name} must be a single non-empty path component, got {value:?}"
                )));
            }
        }
        if self.branches_dir == self.tags_dir {
            return Err(ConvertError::Config(
                "branches_dir and tags_dir must differ".into(),
            ));
        }
        Ok(())
    }

    pub fn branch_root(&self, branch: &str) -> String {
        format!("{}/{branch}", self.branches_dir)
    }

    pub fn tag_root(&self, label: &str) -> String {
        format!("{}/{label}", self.tags_dir)
    }
}

fn serialize_since<S: Serializer>(value: &Option<Timestamp>, serializer: S) -> Result<S::Ok, S::Error> {
    match value {
        Some(ts) => {
            let text = ts.to_clearcase().map_err(serde::ser::Error::custom)?;
            serializer.serialize_some(&text)
        }
        None => serializer.serialize_none(),
    }
}

fn deserialize_since<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Timestamp>, D::Error> {
    let text: Option<String> = Option::deserialize(deserializer)?;
    match text {
        Some(text) if !text.trim().is_empty() => Timestamp::parse_clearcase(&text)
            .map(Some)
            .map_err(serde::de::Error::custom),
        _ => Ok(None),
    }
}
