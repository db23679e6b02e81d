//! Conversion pipeline: history retrieval, filtering, planning, assembly,
//! dump writing and checkpointing over one globally ordered pass.
//!
//! Only the assembly thread mutates the conversion state.  Cache prefetch
//! runs on a bounded worker pool alongside it and never touches the state.

use std::collections::{BTreeMap, HashSet};
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::assembler::{
    plan_groups, Assembled, Assembler, CommitGroup, ContentResolver, ConversionState,
    SkippedElement,
};
use crate::autoprops::AutoProps;
use crate::cache::prefetch::{prefetch, PrefetchStats};
use crate::cache::{BlobSource, CacheStats, ContentCache};
use crate::checkpoint::{Checkpoint, CheckpointStore, Restored};
use crate::config::{ConversionMode, EngineConfig, RetryPolicy};
use crate::dump::DumpWriter;
use crate::errors::{ConvertError, ConvertResult};
use crate::filters::Filters;
use crate::history::{retry, HistorySource};
use crate::models::{ChangeEvent, ElementVersion, EventKind, NodeContent, Timestamp};
use crate::topology::BranchTopology;

const PROGRESS_EVERY: u64 = 1000;

/// Where the dump stream handed to [`Converter::run`] starts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OutputPlacement {
    /// An empty stream; requires that no checkpoint exists.
    Fresh,
    /// A stream already holding `offset` bytes, matching the checkpoint.
    Append { offset: u64 },
}

/// Summary of one run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConversionReport {
    pub revisions_written: u64,
    pub revisions_suppressed: u64,
    pub first_revision: Option<u64>,
    pub last_revision: u64,
    pub groups_planned: usize,
    pub branches_materialized: usize,
    pub orphan_branches: Vec<String>,
    pub dropped_symlinks: usize,
    pub skipped_elements: Vec<SkippedElement>,
    pub cache: CacheStats,
    pub prefetch: PrefetchStats,
    pub cancelled: bool,
    pub resumed: bool,
}

/// Content resolution through the cache, fetching misses from the source.
struct CacheResolver<'c> {
    cache: &'c ContentCache,
    source: &'c dyn BlobSource,
    policy: &'c RetryPolicy,
}

impl ContentResolver for CacheResolver<'_> {
    fn resolve(&mut self, version: &ElementVersion) -> ConvertResult<NodeContent> {
        self.cache
            .fetch_through(self.source, self.policy, version)
            .map(NodeContent::Cached)
    }
}

/// Resolution for records that are assembled but never written.  A version
/// is present when the cache holds it or the source delivers it.
struct PresenceResolver<'c>(CacheResolver<'c>);

impl ContentResolver for PresenceResolver<'_> {
    fn resolve(&mut self, version: &ElementVersion) -> ConvertResult<NodeContent> {
        if !self.0.cache.is_cached(version) {
            self.0.resolve(version)?;
        }
        Ok(NodeContent::Inline(Vec::new()))
    }
}

/// Run-scoped progress that is persisted with every checkpoint.
#[derive(Default)]
struct Progress {
    processed: BTreeMap<String, Timestamp>,
    containers_created: bool,
    latest: Option<Timestamp>,
}

impl Progress {
    fn absorb(&mut self, group: &CommitGroup) {
        for (ts, id) in group.event_ids() {
            self.latest = self.latest.max(Some(ts));
            self.processed.insert(id, ts);
        }
    }
}

pub struct Converter<'a> {
    config: EngineConfig,
    filters: Filters,
    autoprops: AutoProps,
    history: &'a dyn HistorySource,
    blobs: &'a dyn BlobSource,
    cache: &'a ContentCache,
    checkpoints: Option<CheckpointStore>,
    cancel: Arc<AtomicBool>,
}

impl<'a> Converter<'a> {
    pub fn new(
        config: EngineConfig,
        history: &'a dyn HistorySource,
        blobs: &'a dyn BlobSource,
        cache: &'a ContentCache,
    ) -> Self {
        Self {
            config,
            filters: Filters::default(),
            autoprops: AutoProps::default(),
            history,
            blobs,
            cache,
            checkpoints: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_filters(mut self, filters: Filters) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_autoprops(mut self, autoprops: AutoProps) -> Self {
        self.autoprops = autoprops;
        self
    }

    pub fn with_checkpoints(mut self, store: CheckpointStore) -> Self {
        self.checkpoints = Some(store);
        self
    }

    /// Share a cancellation flag; it is checked between groups.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = flag;
        self
    }

    pub fn cancel_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -----------------------------------------------------------------------
    // 1. History
    // -----------------------------------------------------------------------

    fn collect_events(
        &self,
        since: Option<Timestamp>,
        processed: &BTreeMap<String, Timestamp>,
    ) -> ConvertResult<Vec<ChangeEvent>> {
        let mut seen = HashSet::new();
        let mut events = Vec::new();
        let mut filtered = 0usize;
        for root in &self.config.roots {
            let batch = retry::run(&self.config.retry, "lshistory", || {
                let stream = self.history.events(root, since)?;
                stream.collect::<ConvertResult<Vec<_>>>()
            })?;
            for mut event in batch {
                if let (Some(links), EventKind::SymlinkCreate { target_branch, .. }) =
                    (&self.config.links_branch, &mut event.kind)
                {
                    target_branch.clone_from(links);
                }
                if !self.filters.accepts(&event) {
                    filtered += 1;
                    continue;
                }
                let id = event.id();
                if processed.contains_key(&id) || !seen.insert(id) {
                    continue;
                }
                events.push(event);
            }
        }
        debug!(events = events.len(), filtered, "history collected");
        Ok(events)
    }

    // -----------------------------------------------------------------------
    // 2. Checkpoints
    // -----------------------------------------------------------------------

    fn save(
        &mut self,
        state: &mut ConversionState,
        progress: &mut Progress,
        dump_offset: u64,
        watermark: Option<Timestamp>,
    ) -> ConvertResult<()> {
        if let Some(mark) = watermark {
            progress.processed.retain(|_, ts| *ts >= mark);
        }
        let changes = state.tree.take_journal();
        let new_elements = state.topology.take_new_elements();
        let Some(store) = self.checkpoints.as_mut() else {
            return Ok(());
        };
        let checkpoint = Checkpoint {
            last_revision: state.head,
            dump_offset,
            watermark,
            containers_created: progress.containers_created,
            processed: progress.processed.clone(),
            branches: state.topology.branches().cloned().collect(),
            pending_links: state.topology.pending_links().to_vec(),
        };
        store.save(&checkpoint, &changes, &new_elements)
    }

    fn restore(&self, placement: OutputPlacement) -> ConvertResult<Option<Restored>> {
        let restored = match &self.checkpoints {
            Some(store) => store.load()?,
            None => None,
        };
        match (placement, &restored) {
            (OutputPlacement::Fresh, Some(_)) => Err(ConvertError::Config(
                "a checkpoint exists; resume by appending to the dump or clear it first".into(),
            )),
            (OutputPlacement::Append { .. }, None) => Err(ConvertError::Config(
                "appending to a dump requires a checkpoint".into(),
            )),
            (OutputPlacement::Append { offset }, Some(r)) if r.checkpoint.dump_offset != offset => {
                Err(ConvertError::Config(format!(
                    "dump holds {offset} bytes but the checkpoint expects {}",
                    r.checkpoint.dump_offset
                )))
            }
            _ => Ok(restored),
        }
    }

    // -----------------------------------------------------------------------
    // 3. Run
    // -----------------------------------------------------------------------

    /// Convert the configured history into `out`.
    ///
    /// A fatal error saves the state as of the last completed group before
    /// it is returned; cancellation does the same and returns a report with
    /// `cancelled` set.
    ///
    /// `out` is flushed before every checkpoint save.  For crash safety its
    /// `flush` must leave the bytes on stable storage.
    pub fn run<W: Write>(
        &mut self,
        out: W,
        placement: OutputPlacement,
    ) -> ConvertResult<ConversionReport> {
        self.config.validate()?;
        let mode = self.config.mode();
        let restored = self.restore(placement)?;
        let mut report = ConversionReport {
            resumed: restored.is_some(),
            ..ConversionReport::default()
        };

        let mut progress = Progress::default();
        let (mut state, since) = match restored {
            Some(Restored { checkpoint, tree }) => {
                info!(
                    last_revision = checkpoint.last_revision,
                    watermark = ?checkpoint.watermark,
                    "resuming from checkpoint"
                );
                progress.processed = checkpoint.processed;
                progress.containers_created = checkpoint.containers_created;
                progress.latest = checkpoint.watermark;
                let state = ConversionState {
                    topology: BranchTopology::restore(checkpoint.branches, checkpoint.pending_links),
                    tree,
                    head: checkpoint.last_revision,
                };
                (state, checkpoint.watermark.map(|w| w.saturating_sub_secs(1)))
            }
            None => (ConversionState::fresh(&self.config), None),
        };

        let events = self.collect_events(since, &progress.processed)?;
        let groups = plan_groups(events, self.config.commit_window_secs, &mut state.topology);
        report.groups_planned = groups.len();
        info!(groups = groups.len(), ?mode, "conversion planned");

        let wanted: Vec<ElementVersion> = groups.iter().flat_map(CommitGroup::content_versions).collect();

        let offset = match placement {
            OutputPlacement::Fresh => 0,
            OutputPlacement::Append { offset } => offset,
        };
        let mut writer = DumpWriter::resume(out, offset);
        let stop = AtomicBool::new(false);
        let workers = self.config.prefetch_workers;
        let (cache, blobs) = (self.cache, self.blobs);
        let policy = self.config.retry.clone();

        let outcome = std::thread::scope(|scope| {
            let prefetcher = (workers > 0 && !wanted.is_empty())
                .then(|| scope.spawn(|| prefetch(cache, blobs, &policy, &wanted, workers, &stop)));
            let result = self.convert(&groups, &mut state, &mut progress, &mut writer, &mut report, placement);
            stop.store(true, Ordering::Relaxed);
            if let Some(handle) = prefetcher {
                match handle.join() {
                    Ok(stats) => report.prefetch = stats,
                    Err(_) => warn!("prefetch worker panicked"),
                }
            }
            result
        });
        report.cache = self.cache.stats();
        outcome?;

        report.last_revision = state.head;
        info!(
            written = report.revisions_written,
            suppressed = report.revisions_suppressed,
            last_revision = report.last_revision,
            skipped = report.skipped_elements.len(),
            cancelled = report.cancelled,
            "conversion finished"
        );
        Ok(report)
    }

    fn convert<W: Write>(
        &mut self,
        groups: &[CommitGroup],
        state: &mut ConversionState,
        progress: &mut Progress,
        writer: &mut DumpWriter<W>,
        report: &mut ConversionReport,
        placement: OutputPlacement,
    ) -> ConvertResult<()> {
        let mode = self.config.mode();
        let suppressed = |ts: Timestamp| matches!(mode, ConversionMode::Incremental { since } if ts <= since);

        if placement == OutputPlacement::Fresh {
            writer.write_header()?;
        }
        if let (Some(first), false) = (groups.first(), progress.containers_created) {
            if self.config.create_containers && state.head == 0 {
                let record = Assembler::new(&self.config, &self.filters, &self.autoprops)
                    .container_record(state, first.start);
                if mode == ConversionMode::Full {
                    writer.write_record(&record, self.cache)?;
                    report.revisions_written += 1;
                    report.first_revision.get_or_insert(record.number);
                } else {
                    report.revisions_suppressed += 1;
                }
                progress.containers_created = true;
                writer.flush()?;
                self.save(state, progress, writer.offset(), Some(first.start))?;
            }
        }

        let mut unsaved = 0u64;
        for (idx, group) in groups.iter().enumerate() {
            if self.cancel.load(Ordering::Relaxed) {
                warn!(revision = state.head, "conversion cancelled");
                report.cancelled = true;
                writer.flush()?;
                return self.save(state, progress, writer.offset(), Some(group.start));
            }

            let hide = suppressed(group.start);
            let assembled = {
                let assembler = Assembler::new(&self.config, &self.filters, &self.autoprops);
                let mut cached = CacheResolver {
                    cache: self.cache,
                    source: self.blobs,
                    policy: &self.config.retry,
                };
                if hide {
                    assembler.assemble(state, group, &mut PresenceResolver(cached))
                } else {
                    assembler.assemble(state, group, &mut cached)
                }
            };
            let Assembled {
                record,
                skipped,
                materialized,
                orphan,
                ..
            } = match assembled {
                Ok(assembled) => assembled,
                Err(e) => {
                    error!(revision = state.head + 1, error = %e, "conversion aborted");
                    writer.flush()?;
                    self.save(state, progress, writer.offset(), Some(group.start))?;
                    return Err(e);
                }
            };

            report.skipped_elements.extend(skipped);
            report.branches_materialized += usize::from(materialized.is_some());
            report.orphan_branches.extend(orphan);
            progress.absorb(group);

            if let Some(record) = record {
                if hide {
                    report.revisions_suppressed += 1;
                } else {
                    writer.write_record(&record, self.cache)?;
                    report.revisions_written += 1;
                    report.first_revision.get_or_insert(record.number);
                }
                unsaved += 1;
                if record.number % PROGRESS_EVERY == 0 {
                    info!(revision = record.number, groups_left = groups.len() - idx - 1, "progress");
                }
            }
            if unsaved >= self.config.checkpoint_every {
                writer.flush()?;
                let mark = groups.get(idx + 1).map(|g| g.start).or(progress.latest);
                self.save(state, progress, writer.offset(), mark)?;
                unsaved = 0;
            }
        }

        for link in state.topology.close() {
            let err = ConvertError::UnresolvableSymlink {
                link: link.link_path,
                branch: link.target_branch,
            };
            warn!(error = %err, "symbolic link dropped: target branch never materialized");
            report.dropped_symlinks += 1;
            report.skipped_elements.push(SkippedElement {
                event_id: link.event_id,
                reason: err.to_string(),
            });
        }
        writer.flush()?;
        let mark = progress.latest;
        self.save(state, progress, writer.offset(), mark)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryBlobs;
    use crate::history::MemoryHistory;
    use crate::models::VersionId;

    fn modify(element: &str, version: &str, ts: i64) -> ChangeEvent {
        ChangeEvent {
            element: element.into(),
            version: VersionId::parse(version).unwrap(),
            timestamp: Timestamp::from_unix(ts),
            author: "alice".into(),
            comment: format!("edit {element}"),
            kind: EventKind::ContentModify,
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            prefetch_workers: 0,
            ..EngineConfig::default()
        }
    }

    #[test]
    fn fresh_run_writes_containers_first() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), true).unwrap();
        let history = MemoryHistory::new(vec![modify("a.txt", "/main/1", 1_000)]);
        let mut blobs = MemoryBlobs::new();
        blobs.insert("a.txt", "/main/1", "hello\n");

        let mut out = Vec::new();
        let report = Converter::new(config(), &history, &blobs, &cache)
            .run(&mut out, OutputPlacement::Fresh)
            .unwrap();
        assert_eq!(report.revisions_written, 2);
        assert_eq!(report.last_revision, 2);
        let text = String::from_utf8(out).unwrap();
        let containers = text.find("Create branches and tags directories").unwrap();
        let file = text.find("Node-path: branches/main/a.txt").unwrap();
        assert!(containers < file);
        assert!(text.contains("hello\n"));
    }

    #[test]
    fn fresh_placement_refuses_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(&dir.path().join("cache"), true).unwrap();
        let history = MemoryHistory::new(vec![modify("a.txt", "/main/1", 1_000)]);
        let mut blobs = MemoryBlobs::new();
        blobs.insert("a.txt", "/main/1", "x");
        let state = dir.path().join("state.sqlite");

        Converter::new(config(), &history, &blobs, &cache)
            .with_checkpoints(CheckpointStore::new(&state))
            .run(&mut Vec::new(), OutputPlacement::Fresh)
            .unwrap();
        let err = Converter::new(config(), &history, &blobs, &cache)
            .with_checkpoints(CheckpointStore::new(&state))
            .run(&mut Vec::new(), OutputPlacement::Fresh)
            .unwrap_err();
        assert!(matches!(err, ConvertError::Config(_)));
    }

    #[test]
    fn cancelled_run_saves_and_reports() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(&dir.path().join("cache"), true).unwrap();
        let history = MemoryHistory::new(vec![modify("a.txt", "/main/1", 1_000)]);
        let blobs = MemoryBlobs::new();
        let state = dir.path().join("state.sqlite");

        let mut converter = Converter::new(config(), &history, &blobs, &cache)
            .with_checkpoints(CheckpointStore::new(&state));
        converter.cancel_flag().store(true, Ordering::SeqCst);
        let mut out = Vec::new();
        let report = converter.run(&mut out, OutputPlacement::Fresh).unwrap();
        assert!(report.cancelled);
        assert_eq!(blobs.total_fetches(), 0);

        let restored = CheckpointStore::new(&state).load().unwrap().unwrap();
        assert_eq!(restored.checkpoint.last_revision, 1);
        assert_eq!(restored.checkpoint.dump_offset, out.len() as u64);
        assert_eq!(restored.checkpoint.watermark, Some(Timestamp::from_unix(1_000)));
    }

    #[test]
    fn transient_history_failure_is_retried() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), true).unwrap();
        let history = MemoryHistory::new(vec![modify("a.txt", "/main/1", 1_000)]);
        history.fail_next(1);
        let mut blobs = MemoryBlobs::new();
        blobs.insert("a.txt", "/main/1", "x");
        let mut cfg = config();
        cfg.retry = RetryPolicy::no_backoff(2);

        let report = Converter::new(cfg, &history, &blobs, &cache)
            .run(&mut Vec::new(), OutputPlacement::Fresh)
            .unwrap();
        assert_eq!(history.query_count(), 2);
        assert_eq!(report.revisions_written, 2);
    }

    #[test]
    fn malformed_history_is_fatal() {
        struct Broken;
        impl HistorySource for Broken {
            fn events(
                &self,
                _root: &str,
                _since: Option<Timestamp>,
            ) -> Result<crate::history::EventStream<'_>, crate::errors::SourceError> {
                Ok(Box::new(std::iter::once(Err(
                    ConvertError::MalformedHistoryEvent("bad line".into()),
                ))))
            }
        }
        let dir = tempfile::tempdir().unwrap();
        let cache = ContentCache::open(dir.path(), true).unwrap();
        let blobs = MemoryBlobs::new();
        let err = Converter::new(config(), &Broken, &blobs, &cache)
            .run(&mut Vec::new(), OutputPlacement::Fresh)
            .unwrap_err();
        assert!(matches!(err, ConvertError::MalformedHistoryEvent(_)));
    }
}
