//! Bounded parallel cache population ahead of assembly.
//!
//! Prefetch only warms the cache: failures are counted and left for the
//! assembly thread to hit again and classify.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use rayon::prelude::*;
use serde::Serialize;
use tracing::debug;

use crate::cache::{BlobSource, ContentCache};
use crate::config::RetryPolicy;
use crate::models::ElementVersion;

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct PrefetchStats {
    pub requested: u64,
    pub fetched: u64,
    pub already_cached: u64,
    pub failed: u64,
    pub cancelled: u64,
}

#[derive(Default)]
struct Tally {
    fetched: AtomicU64,
    already_cached: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
}

fn prefetch_one(
    cache: &ContentCache,
    source: &dyn BlobSource,
    policy: &RetryPolicy,
    version: &ElementVersion,
    stop: &AtomicBool,
    tally: &Tally,
) {
    if stop.load(Ordering::Relaxed) {
        tally.cancelled.fetch_add(1, Ordering::Relaxed);
        return;
    }
    // Suspect and corrupted entries are left to the assembly thread so the
    // single verification re-fetch happens exactly once.
    if cache.is_cached(version) {
        tally.already_cached.fetch_add(1, Ordering::Relaxed);
        return;
    }
    match cache.fetch_through(source, policy, version) {
        Ok(_) => {
            tally.fetched.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            debug!(key = %version.key(), error = %e, "prefetch failed");
            tally.failed.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Populate the cache for `versions` on a pool of `workers` threads.  Keys
/// are de-duplicated; `stop` aborts the remaining work.
pub fn prefetch(
    cache: &ContentCache,
    source: &dyn BlobSource,
    policy: &RetryPolicy,
    versions: &[ElementVersion],
    workers: usize,
    stop: &AtomicBool,
) -> PrefetchStats {
    let mut seen = HashSet::new();
    let jobs: Vec<&ElementVersion> = versions
        .iter()
        .filter(|v| seen.insert(v.key()))
        .collect();
    let tally = Tally::default();
    if jobs.is_empty() || workers == 0 {
        return PrefetchStats::default();
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(workers.max(1))
        .thread_name(|i| format!("cc2svn-prefetch-{i}"))
        .build();

    match pool {
        Ok(pool) => pool.install(|| {
            jobs.par_iter()
                .for_each(|v| prefetch_one(cache, source, policy, v, stop, &tally))
        }),
        Err(_) => {
            // Fallback to sequential
            jobs.iter()
                .for_each(|v| prefetch_one(cache, source, policy, v, stop, &tally))
        }
    }

    let stats = PrefetchStats {
        requested: jobs.len() as u64,
        fetched: tally.fetched.load(Ordering::Relaxed),
        already_cached: tally.already_cached.load(Ordering::Relaxed),
        failed: tally.failed.load(Ordering::Relaxed),
        cancelled: tally.cancelled.load(Ordering::Relaxed),
    };
    debug!(?stats, "prefetch finished");
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBlobs;
    use crate::errors::SourceError;
    use crate::models::VersionId;

    fn ev(element: &str) -> ElementVersion {
        ElementVersion::new(element, VersionId::parse("/main/1").unwrap())
    }

    #[test]
    fn populates_cache_and_dedupes() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), true).unwrap();
        let mut source = MemoryBlobs::new();
        for name in ["a", "b", "c"] {
            source.insert(name, "/main/1", format!("content {name}"));
        }
        let stop = AtomicBool::new(false);
        let versions = vec![ev("a"), ev("b"), ev("a"), ev("c")];
        let stats = prefetch(&cache, &source, &RetryPolicy::no_backoff(1), &versions, 2, &stop);
        assert_eq!(stats.requested, 3);
        assert_eq!(stats.fetched, 3);
        assert_eq!(source.total_fetches(), 3);
        assert!(cache.is_cached(&ev("b")));

        let again = prefetch(&cache, &source, &RetryPolicy::no_backoff(1), &versions, 2, &stop);
        assert_eq!(again.already_cached, 3);
        assert_eq!(source.total_fetches(), 3);
    }

    #[test]
    fn failures_are_counted_not_raised() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), true).unwrap();
        let source = MemoryBlobs::new();
        source.fail("x", "/main/1", SourceError::AccessDenied("x".into()));
        let stop = AtomicBool::new(false);
        let stats = prefetch(&cache, &source, &RetryPolicy::no_backoff(1), &[ev("x")], 1, &stop);
        assert_eq!(stats.failed, 1);
        assert!(!cache.is_cached(&ev("x")));
    }

    #[test]
    fn stop_flag_cancels_remaining_work() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), true).unwrap();
        let source = MemoryBlobs::new();
        let stop = AtomicBool::new(true);
        let stats = prefetch(&cache, &source, &RetryPolicy::no_backoff(1), &[ev("a"), ev("b")], 2, &stop);
        assert_eq!(stats.cancelled, 2);
        assert_eq!(source.total_fetches(), 0);
    }
}
