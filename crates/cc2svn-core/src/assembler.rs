//! Revision assembly: commit grouping, global ordering, and projection of
//! grouped events onto node operations against the target tree.
//!
//! Assembly runs in two phases per group.  Content for every event is
//! resolved first, without touching any state; only then are the tree and
//! topology mutated.  A per-element retrieval failure therefore drops just
//! that event, and a fatal error leaves the state exactly as it was after the
//! previous group.

use std::collections::{BTreeSet, HashMap, HashSet};

use indexmap::IndexSet;
use serde::Serialize;
use tracing::{debug, warn};

use crate::autoprops::AutoProps;
use crate::config::EngineConfig;
use crate::errors::{ConvertError, ConvertResult};
use crate::filters::Filters;
use crate::models::{
    ChangeEvent, ElementVersion, EventKind, NodeAction, NodeContent, NodeKind, NodeOp,
    PendingSymlink, RevisionRecord, Timestamp, VersionId, PROP_SPECIAL,
};
use crate::topology::{BranchTopology, Materialization};
use crate::tree::TreeState;

// ---------------------------------------------------------------------------
// 1. Commit groups
// ---------------------------------------------------------------------------

/// Start time, branch rank, author, first element, first version, creation
/// order.
type GroupOrder = (
    Timestamp,
    (Timestamp, usize, String),
    String,
    String,
    Option<VersionId>,
    usize,
);

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum GroupKind {
    Commit,
    /// Labels whose version was not touched by any commit group.
    Label(String),
}

/// Events folded into one prospective revision.
#[derive(Clone, Debug)]
pub struct CommitGroup {
    pub kind: GroupKind,
    pub branch: String,
    pub author: String,
    pub comment: String,
    pub start: Timestamp,
    pub end: Timestamp,
    pub events: Vec<ChangeEvent>,
    /// Label applications attached to this group.
    pub labels: Vec<ChangeEvent>,
    /// Branch-create events whose element also has content on the branch;
    /// they only feed the topology.
    pub absorbed: Vec<ChangeEvent>,
    seq: usize,
    elements: HashMap<String, String>,
}

impl CommitGroup {
    fn new(kind: GroupKind, seq: usize, first: &ChangeEvent, comment: String) -> Self {
        Self {
            kind,
            branch: first.branch().to_string(),
            author: first.author.clone(),
            comment,
            start: first.timestamp,
            end: first.timestamp,
            events: vec![],
            labels: vec![],
            absorbed: vec![],
            seq,
            elements: HashMap::new(),
        }
    }

    fn push(&mut self, event: ChangeEvent) {
        if event.timestamp > self.end {
            self.end = event.timestamp;
        }
        self.elements
            .insert(event.element.clone(), event.version.to_string());
        self.events.push(event);
    }

    /// Whether `event` may join without putting two versions of one element
    /// into the same revision.
    fn admits(&self, event: &ChangeEvent) -> bool {
        self.elements
            .get(&event.element)
            .map_or(true, |v| *v == event.version.to_string())
    }

    /// Every event this group accounts for, as `(timestamp, id)`.
    pub fn event_ids(&self) -> Vec<(Timestamp, String)> {
        self.events
            .iter()
            .chain(&self.labels)
            .chain(&self.absorbed)
            .map(|e| (e.timestamp, e.id()))
            .collect()
    }

    /// Versions whose content assembly will need, for cache prefetch.
    pub fn content_versions(&self) -> Vec<ElementVersion> {
        self.events
            .iter()
            .filter(|e| e.kind.needs_content())
            .filter(|e| !(e.kind == EventKind::BranchCreate && e.version.seq() == 0))
            .chain(&self.labels)
            .map(ChangeEvent::element_version)
            .collect()
    }

    fn sort_key(&self, topology: &BranchTopology) -> GroupOrder {
        let first = self.events.first().or(self.labels.first());
        (
            self.start,
            topology.rank(&self.branch),
            self.author.clone(),
            first.map(|e| e.element.clone()).unwrap_or_default(),
            first.map(|e| e.version.clone()),
            self.seq,
        )
    }
}

/// Observe `events` into the topology and fold them into globally ordered
/// commit groups.
///
/// Non-label events share a group when branch, author and comment match and
/// the gap to the group's latest event is at most `window_secs`.  Label
/// events join the group that touched the labeled version, or form a
/// standalone label group per label name.
pub fn plan_groups(
    mut events: Vec<ChangeEvent>,
    window_secs: i64,
    topology: &mut BranchTopology,
) -> Vec<CommitGroup> {
    events.sort_by_key(|e| e.timestamp);

    for event in &events {
        if !matches!(
            event.kind,
            EventKind::LabelApply { .. } | EventKind::SymlinkCreate { .. }
        ) {
            topology.observe(event);
        }
    }
    topology.finalize();

    let content_keys: HashSet<(String, String)> = events
        .iter()
        .filter(|e| e.kind == EventKind::ContentModify)
        .map(|e| (e.element.clone(), e.branch().to_string()))
        .collect();

    let mut groups: Vec<CommitGroup> = Vec::new();
    let mut open: HashMap<(String, String, String), usize> = HashMap::new();
    let mut last_touch: HashMap<(String, String), usize> = HashMap::new();
    let mut absorbed: Vec<ChangeEvent> = Vec::new();
    let mut labels: Vec<ChangeEvent> = Vec::new();

    for event in events {
        match &event.kind {
            EventKind::LabelApply { .. } => {
                labels.push(event);
                continue;
            }
            EventKind::BranchCreate
                if content_keys
                    .contains(&(event.element.clone(), event.branch().to_string())) =>
            {
                absorbed.push(event);
                continue;
            }
            _ => {}
        }

        let key = (
            event.branch().to_string(),
            event.author.clone(),
            event.comment.clone(),
        );
        let touch_key = (event.branch().to_string(), event.element.clone());
        let candidate = open.get(&key).copied().filter(|&idx| {
            let group = &groups[idx];
            event.timestamp.unix() - group.end.unix() <= window_secs
                && group.admits(&event)
                && last_touch.get(&touch_key).map_or(true, |&last| last <= idx)
        });
        let idx = match candidate {
            Some(idx) => idx,
            None => {
                let idx = groups.len();
                groups.push(CommitGroup::new(
                    GroupKind::Commit,
                    idx,
                    &event,
                    event.comment.clone(),
                ));
                open.insert(key, idx);
                idx
            }
        };
        last_touch.insert(touch_key, idx);
        groups[idx].push(event);
    }

    // Absorbed branch-creates travel with the first content event of their
    // element so resume accounting sees them as processed.
    let mut first_content: HashMap<(String, String), usize> = HashMap::new();
    for (idx, group) in groups.iter().enumerate() {
        for event in group.events.iter().filter(|e| e.kind == EventKind::ContentModify) {
            first_content
                .entry((event.element.clone(), event.branch().to_string()))
                .or_insert(idx);
        }
    }
    for event in absorbed {
        let key = (event.element.clone(), event.branch().to_string());
        if let Some(&idx) = first_content.get(&key) {
            groups[idx].absorbed.push(event);
        }
    }

    let mut touched: HashMap<String, usize> = HashMap::new();
    for (idx, group) in groups.iter().enumerate() {
        for event in group.events.iter().filter(|e| e.kind.needs_content()) {
            touched.insert(event.element_version().key(), idx);
        }
    }
    let mut open_labels: HashMap<String, usize> = HashMap::new();
    for event in labels {
        if let Some(&idx) = touched.get(&event.element_version().key()) {
            groups[idx].labels.push(event);
            continue;
        }
        let EventKind::LabelApply { label } = &event.kind else {
            continue;
        };
        let label = label.clone();
        let candidate = open_labels.get(&label).copied().filter(|&idx| {
            let group = &groups[idx];
            event.timestamp.unix() - group.end.unix() <= window_secs
                && !group.labels.iter().any(|l| l.element == event.element)
        });
        let idx = match candidate {
            Some(idx) => idx,
            None => {
                let idx = groups.len();
                groups.push(CommitGroup::new(
                    GroupKind::Label(label.clone()),
                    idx,
                    &event,
                    format!("Apply label {label}"),
                ));
                open_labels.insert(label, idx);
                idx
            }
        };
        let group = &mut groups[idx];
        if event.timestamp > group.end {
            group.end = event.timestamp;
        }
        group.labels.push(event);
    }

    groups.sort_by_cached_key(|g| g.sort_key(topology));
    debug!(groups = groups.len(), "commit groups planned");
    groups
}

// ---------------------------------------------------------------------------
// 2. Assembly state and results
// ---------------------------------------------------------------------------

/// Resolves the content of one element version.
pub trait ContentResolver {
    fn resolve(&mut self, version: &ElementVersion) -> ConvertResult<NodeContent>;
}

/// The single mutable structure of the pipeline: topology, target tree and
/// the number of the last assembled revision.
#[derive(Clone, Debug, Default)]
pub struct ConversionState {
    pub topology: BranchTopology,
    pub tree: TreeState,
    pub head: u64,
}

impl ConversionState {
    /// State for a fresh conversion; the container directories are part of
    /// the target tree whether or not this run creates them.
    pub fn fresh(config: &EngineConfig) -> Self {
        let mut tree = TreeState::new();
        tree.add_dir(&config.branches_dir);
        tree.add_dir(&config.tags_dir);
        Self {
            topology: BranchTopology::new(),
            tree,
            head: 0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct SkippedElement {
    pub event_id: String,
    pub reason: String,
}

#[derive(Debug, Default)]
pub struct Assembled {
    pub record: Option<RevisionRecord>,
    pub skipped: Vec<SkippedElement>,
    pub materialized: Option<String>,
    pub orphan: Option<String>,
    pub links_applied: usize,
}

enum Resolved {
    Content(NodeContent),
    Inherited,
    CopyFrom(String),
    /// Content of a renamed file that was also modified in this group.
    Moved { content: NodeContent, version: String },
}

// ---------------------------------------------------------------------------
// 3. Assembler
// ---------------------------------------------------------------------------

pub struct Assembler<'a> {
    config: &'a EngineConfig,
    filters: &'a Filters,
    autoprops: &'a AutoProps,
}

/// Node operations of one revision under construction.
struct RecordBuilder<'s> {
    tree: &'s mut TreeState,
    autoprops: &'s AutoProps,
    ops: Vec<NodeOp>,
    touched: BTreeSet<String>,
}

impl RecordBuilder<'_> {
    fn touch(&mut self, path: &str) {
        self.touched.insert(path.to_string());
    }

    fn touched_within(&self, root: &str) -> bool {
        self.touched
            .iter()
            .any(|p| p == root || (p.starts_with(root) && p.as_bytes().get(root.len()) == Some(&b'/')))
    }

    fn replace_dir(path: &str) -> NodeOp {
        NodeOp {
            action: NodeAction::Replace,
            ..NodeOp::add_dir(path)
        }
    }

    fn ensure_parents(&mut self, path: &str) {
        let missing: Vec<String> = self
            .tree
            .missing_parents(path)
            .into_iter()
            .map(str::to_string)
            .collect();
        for dir in missing {
            self.add_dir(&dir);
        }
    }

    fn add_dir(&mut self, path: &str) {
        match self.tree.kind(path) {
            Some(NodeKind::Dir) => return,
            Some(NodeKind::File) => {
                self.tree.remove(path);
                self.ops.push(Self::replace_dir(path));
            }
            None => self.ops.push(NodeOp::add_dir(path)),
        }
        self.tree.add_dir(path);
        self.touch(path);
    }

    /// Action for writing a node of `kind` at `path`; clears a node of the
    /// other kind from the tree.
    fn action_for(&mut self, path: &str, kind: NodeKind) -> NodeAction {
        match self.tree.kind(path) {
            None => NodeAction::Add,
            Some(existing) if existing == kind && kind == NodeKind::File => NodeAction::Change,
            Some(_) => {
                self.tree.remove(path);
                NodeAction::Replace
            }
        }
    }

    fn write_file(&mut self, path: &str, version: &str, content: NodeContent, special: bool) {
        self.ensure_parents(path);
        let action = self.action_for(path, NodeKind::File);
        let mut props = self.autoprops.props_for(path);
        if special {
            props.insert(PROP_SPECIAL.to_string(), "*".to_string());
        }
        self.ops.push(NodeOp::file(action, path, props, content));
        self.tree.set_file(path, version);
        self.touch(path);
    }

    fn copy(&mut self, kind: NodeKind, from: &str, to: &str, revision: u64) {
        self.ensure_parents(to);
        let action = self.action_for(to, kind);
        self.ops
            .push(NodeOp::copy(kind, action, to, from, revision));
        self.tree.copy(from, to);
        self.touch(to);
    }

    fn delete(&mut self, path: &str) {
        if self.tree.remove(path) > 0 {
            self.ops.push(NodeOp::delete(path));
            self.touch(path);
        }
    }
}

fn join(root: &str, element: &str) -> String {
    if element.is_empty() {
        root.to_string()
    } else {
        format!("{root}/{element}")
    }
}

/// Distinct `element@@version` keys in event order.
fn source_versions<'e>(events: impl IntoIterator<Item = &'e ChangeEvent>) -> Vec<String> {
    events
        .into_iter()
        .map(|e| e.element_version().key())
        .collect::<IndexSet<_>>()
        .into_iter()
        .collect()
}

fn link_content(target: &str) -> NodeContent {
    NodeContent::Inline(format!("link {target}").into_bytes())
}

impl<'a> Assembler<'a> {
    pub fn new(config: &'a EngineConfig, filters: &'a Filters, autoprops: &'a AutoProps) -> Self {
        Self {
            config,
            filters,
            autoprops,
        }
    }

    /// The revision creating the `branches`/`tags` containers.
    pub fn container_record(&self, state: &mut ConversionState, timestamp: Timestamp) -> RevisionRecord {
        state.head += 1;
        RevisionRecord {
            number: state.head,
            author: String::new(),
            timestamp,
            comment: format!(
                "Create {} and {} directories",
                self.config.branches_dir, self.config.tags_dir
            ),
            sources: vec![],
            ops: vec![
                NodeOp::add_dir(&self.config.branches_dir),
                NodeOp::add_dir(&self.config.tags_dir),
            ],
        }
    }

    fn resolve_or_skip(
        resolver: &mut dyn ContentResolver,
        event: &ChangeEvent,
        skipped: &mut Vec<SkippedElement>,
    ) -> ConvertResult<Option<NodeContent>> {
        match resolver.resolve(&event.element_version()) {
            Ok(content) => Ok(Some(content)),
            Err(e) if !e.is_fatal() => {
                warn!(element = %event.element, version = %event.version, error = %e, "element skipped");
                skipped.push(SkippedElement {
                    event_id: event.id(),
                    reason: e.to_string(),
                });
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Assemble one group into at most one revision numbered `head + 1`.
    /// Groups that produce no node operation consume no number.
    pub fn assemble(
        &self,
        state: &mut ConversionState,
        group: &CommitGroup,
        resolver: &mut dyn ContentResolver,
    ) -> ConvertResult<Assembled> {
        match &group.kind {
            GroupKind::Commit => self.assemble_commit(state, group, resolver),
            GroupKind::Label(label) => self.assemble_label(state, group, label, resolver),
        }
    }

    fn assemble_commit(
        &self,
        state: &mut ConversionState,
        group: &CommitGroup,
        resolver: &mut dyn ContentResolver,
    ) -> ConvertResult<Assembled> {
        let number = state.head + 1;
        let branch = group.branch.as_str();
        let branch_root = self.config.branch_root(branch);
        let already = state.topology.is_materialized(branch);
        let plan = (!already).then(|| {
            state
                .topology
                .plan_materialization(branch, |p| self.filters.allow_branch(p))
        });
        let inherit_root = match &plan {
            None => Some(branch_root.clone()),
            Some(Materialization::CopyFrom { parent }) => Some(self.config.branch_root(parent)),
            Some(_) => None,
        };

        // Phase 1: resolve content, no state mutation.
        let mut skipped = Vec::new();
        let mut resolved: HashMap<String, Resolved> = HashMap::new();
        for (pos, event) in group.events.iter().enumerate() {
            match &event.kind {
                kind if kind.needs_content() => {
                    let inherited = *kind == EventKind::BranchCreate
                        && event.version.seq() == 0
                        && inherit_root.as_ref().is_some_and(|root| {
                            state.tree.kind(&join(root, &event.element)) == Some(NodeKind::File)
                        });
                    if inherited {
                        resolved.insert(event.id(), Resolved::Inherited);
                    } else if let Some(content) =
                        Self::resolve_or_skip(resolver, event, &mut skipped)?
                    {
                        resolved.insert(event.id(), Resolved::Content(content));
                    }
                }
                EventKind::Rename { from } => {
                    let source = join(&branch_root, from);
                    let latest = group.events[..pos]
                        .iter()
                        .rev()
                        .find(|e| e.element == *from && e.kind.needs_content());
                    if let (Some(NodeKind::File), Some(latest)) = (state.tree.kind(&source), latest) {
                        if let Some(Resolved::Content(content)) = resolved.get(&latest.id()) {
                            let moved = Resolved::Moved {
                                content: content.clone(),
                                version: latest.version.to_string(),
                            };
                            resolved.insert(event.id(), moved);
                        }
                    }
                }
                _ => {}
            }
        }
        let mut label_contents: HashMap<String, NodeContent> = HashMap::new();
        for label in &group.labels {
            if let Some(content) = Self::resolve_or_skip(resolver, label, &mut skipped)? {
                label_contents.insert(label.id(), content);
            }
        }

        let materialize = plan.as_ref().filter(|_| {
            group
                .events
                .iter()
                .any(|e| e.kind.needs_content() && resolved.contains_key(&e.id()))
        });
        if let Some(Materialization::Orphan { parent }) = materialize {
            if self.config.strict_orphans {
                return Err(ConvertError::OrphanBranch {
                    branch: branch.to_string(),
                    parent: parent.clone(),
                });
            }
        }

        // Phase 2: mutate.
        let mut result = Assembled {
            skipped,
            ..Assembled::default()
        };
        let head = state.head;
        let mut builder = RecordBuilder {
            tree: &mut state.tree,
            autoprops: self.autoprops,
            ops: vec![],
            touched: BTreeSet::new(),
        };

        if let Some(plan) = materialize {
            let orphan = match plan {
                Materialization::Root => {
                    builder.ensure_parents(&branch_root);
                    builder.add_dir(&branch_root);
                    false
                }
                Materialization::CopyFrom { parent } => {
                    let parent_root = self.config.branch_root(parent);
                    builder.copy(NodeKind::Dir, &parent_root, &branch_root, head);
                    false
                }
                Materialization::Orphan { parent } => {
                    warn!(branch, parent = %parent, "orphan branch materialized without ancestry");
                    builder.ensure_parents(&branch_root);
                    builder.add_dir(&branch_root);
                    result.orphan = Some(branch.to_string());
                    true
                }
            };
            state.topology.mark_materialized(branch, number, orphan);
            result.materialized = Some(branch.to_string());
        }
        let live = state.topology.is_materialized(branch);

        for event in &group.events {
            let path = join(&branch_root, &event.element);
            let mut applied = false;
            match &event.kind {
                EventKind::SymlinkCreate { target, target_branch } => {
                    state.topology.enqueue_link(PendingSymlink {
                        target_branch: target_branch.clone(),
                        link_path: event.element.clone(),
                        link_target: target.clone(),
                        version: event.version.to_string(),
                        event_id: event.id(),
                        timestamp: event.timestamp,
                    });
                }
                _ if !live => {
                    debug!(branch, element = %event.element, kind = event.kind.tag(), "event before branch exists ignored");
                }
                kind if kind.needs_content() => match resolved.remove(&event.id()) {
                    Some(Resolved::Content(content)) => {
                        builder.write_file(&path, &event.version.to_string(), content, false);
                        applied = true;
                    }
                    Some(Resolved::Inherited) => applied = true,
                    Some(Resolved::CopyFrom(_) | Resolved::Moved { .. }) | None => {}
                },
                EventKind::DirectoryEntryAdd => {
                    builder.ensure_parents(&path);
                    builder.add_dir(&path);
                    applied = true;
                }
                EventKind::DirectoryEntryRemove { entry } => {
                    builder.delete(&join(&path, entry));
                    applied = true;
                }
                EventKind::Destroy => {
                    builder.delete(&path);
                    applied = true;
                }
                EventKind::Rename { from } => {
                    let source = join(&branch_root, from);
                    let Some(kind) = builder.tree.kind(&source) else {
                        debug!(source = %source, "rename source absent");
                        continue;
                    };
                    if !builder.touched_within(&source) {
                        builder.copy(kind, &source, &path, head);
                        builder.delete(&source);
                        applied = true;
                    } else if let Some(Resolved::Moved { content, version }) =
                        resolved.remove(&event.id())
                    {
                        builder.write_file(&path, &version, content, false);
                        builder.delete(&source);
                        applied = true;
                    } else {
                        warn!(source = %source, target = %path, "directory renamed after modification in the same revision; rename skipped");
                        result.skipped.push(SkippedElement {
                            event_id: event.id(),
                            reason: "rename of a directory modified in the same revision".into(),
                        });
                    }
                }
                EventKind::ContentModify
                | EventKind::Create
                | EventKind::BranchCreate
                | EventKind::LabelApply { .. } => {}
            }
            if applied {
                state
                    .topology
                    .record_progress(branch, &event.version.to_string(), event.timestamp, number);
            }
        }

        for link in state.topology.drain_ready_links() {
            let path = join(&self.config.branch_root(&link.target_branch), &link.link_path);
            builder.write_file(&path, &link.version, link_content(&link.link_target), true);
            result.links_applied += 1;
        }

        for label_event in &group.labels {
            let EventKind::LabelApply { label } = &label_event.kind else {
                continue;
            };
            let Some(content) = label_contents.remove(&label_event.id()) else {
                continue;
            };
            let path = join(&self.config.tag_root(label), &label_event.element);
            builder.write_file(&path, &label_event.version.to_string(), content, false);
        }

        let ops = builder.ops;
        if ops.is_empty() {
            return Ok(result);
        }
        state.head = number;
        result.record = Some(RevisionRecord {
            number,
            author: group.author.clone(),
            timestamp: group.start,
            comment: group.comment.clone(),
            sources: source_versions(&group.events),
            ops,
        });
        Ok(result)
    }

    fn assemble_label(
        &self,
        state: &mut ConversionState,
        group: &CommitGroup,
        label: &str,
        resolver: &mut dyn ContentResolver,
    ) -> ConvertResult<Assembled> {
        let number = state.head + 1;
        let tag_root = self.config.tag_root(label);

        let mut skipped = Vec::new();
        let mut resolved: Vec<(&ChangeEvent, Resolved)> = Vec::new();
        for event in &group.labels {
            let source = join(
                &self.config.branch_root(event.version.branch()),
                &event.element,
            );
            let version = event.version.to_string();
            match state.tree.get(&source) {
                Some(entry)
                    if entry.kind == NodeKind::File
                        && entry.version.as_deref() == Some(version.as_str())
                        && state.head > 0 =>
                {
                    resolved.push((event, Resolved::CopyFrom(source)));
                }
                _ => {
                    if let Some(content) = Self::resolve_or_skip(resolver, event, &mut skipped)? {
                        resolved.push((event, Resolved::Content(content)));
                    }
                }
            }
        }

        let head = state.head;
        let mut builder = RecordBuilder {
            tree: &mut state.tree,
            autoprops: self.autoprops,
            ops: vec![],
            touched: BTreeSet::new(),
        };
        for (event, how) in resolved {
            let path = join(&tag_root, &event.element);
            match how {
                Resolved::CopyFrom(source) => builder.copy(NodeKind::File, &source, &path, head),
                Resolved::Content(content) => {
                    builder.write_file(&path, &event.version.to_string(), content, false)
                }
                Resolved::Inherited | Resolved::Moved { .. } => {}
            }
        }

        let ops = builder.ops;
        let mut result = Assembled {
            skipped,
            ..Assembled::default()
        };
        if ops.is_empty() {
            return Ok(result);
        }
        state.head = number;
        result.record = Some(RevisionRecord {
            number,
            author: group.author.clone(),
            timestamp: group.start,
            comment: group.comment.clone(),
            sources: source_versions(&group.labels),
            ops,
        });
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::AllowList;

    fn event(element: &str, version: &str, ts: i64, kind: EventKind) -> ChangeEvent {
        ChangeEvent {
            element: element.into(),
            version: VersionId::parse(version).unwrap(),
            timestamp: Timestamp::from_unix(ts),
            author: "alice".into(),
            comment: "work".into(),
            kind,
        }
    }

    fn modify(element: &str, version: &str, ts: i64) -> ChangeEvent {
        event(element, version, ts, EventKind::ContentModify)
    }

    struct Bytes;

    impl ContentResolver for Bytes {
        fn resolve(&mut self, version: &ElementVersion) -> ConvertResult<NodeContent> {
            if version.element.starts_with("missing") {
                return Err(ConvertError::ElementNotFound(version.key()));
            }
            Ok(NodeContent::Inline(version.key().into_bytes()))
        }
    }

    fn config() -> EngineConfig {
        EngineConfig {
            create_containers: false,
            ..EngineConfig::default()
        }
    }

    fn run(events: Vec<ChangeEvent>, config: &EngineConfig, filters: &Filters) -> Vec<RevisionRecord> {
        let autoprops = AutoProps::parse("*.sh = svn:executable=*").unwrap();
        let mut state = ConversionState::fresh(config);
        let groups = plan_groups(events, config.commit_window_secs, &mut state.topology);
        let assembler = Assembler::new(config, filters, &autoprops);
        groups
            .iter()
            .filter_map(|g| assembler.assemble(&mut state, g, &mut Bytes).unwrap().record)
            .collect()
    }

    fn summary(record: &RevisionRecord) -> Vec<String> {
        record
            .ops
            .iter()
            .map(|op| match &op.copy_from {
                Some(from) => format!(
                    "{} {} <- {}@{}",
                    op.action.as_str(),
                    op.path,
                    from.path,
                    from.revision
                ),
                None => format!("{} {}", op.action.as_str(), op.path),
            })
            .collect()
    }

    #[test]
    fn window_folds_same_author_and_comment() {
        let mut topo = BranchTopology::new();
        let groups = plan_groups(
            vec![
                modify("a", "/main/1", 0),
                modify("b", "/main/1", 200),
                modify("c", "/main/1", 450),
                modify("d", "/main/1", 800),
            ],
            300,
            &mut topo,
        );
        let sizes: Vec<usize> = groups.iter().map(|g| g.events.len()).collect();
        assert_eq!(sizes, vec![3, 1]);
    }

    #[test]
    fn second_version_of_element_starts_new_group() {
        let mut topo = BranchTopology::new();
        let groups = plan_groups(
            vec![modify("a", "/main/1", 0), modify("a", "/main/2", 10)],
            300,
            &mut topo,
        );
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].events[0].version.seq(), 1);
    }

    #[test]
    fn ordering_is_deterministic_for_ties() {
        let mut a = modify("x", "/main/1", 5);
        a.author = "zed".into();
        let mut b = modify("y", "/main/1", 5);
        b.author = "amy".into();
        let mut topo = BranchTopology::new();
        let forward = plan_groups(vec![a.clone(), b.clone()], 300, &mut topo);
        let mut topo = BranchTopology::new();
        let backward = plan_groups(vec![b, a], 300, &mut topo);
        let names = |gs: &[CommitGroup]| gs.iter().map(|g| g.author.clone()).collect::<Vec<_>>();
        assert_eq!(names(&forward), vec!["amy", "zed"]);
        assert_eq!(names(&forward), names(&backward));
    }

    #[test]
    fn branch_creation_followed_by_checkin_is_one_revision() {
        let config = config();
        let records = run(
            vec![
                modify("a.txt", "/main/1", 86_400),
                event("a.txt", "/main/feature/0", 172_800, EventKind::BranchCreate),
                modify("a.txt", "/main/feature/1", 172_810),
            ],
            &config,
            &Filters::default(),
        );
        assert_eq!(records.len(), 2);
        assert_eq!(
            summary(&records[0]),
            vec!["add branches/main", "add branches/main/a.txt"]
        );
        assert_eq!(
            summary(&records[1]),
            vec![
                "add branches/feature <- branches/main@1",
                "change branches/feature/a.txt"
            ]
        );
    }

    #[test]
    fn parent_dirs_and_autoprops() {
        let config = config();
        let records = run(vec![modify("bin/tools/run.sh", "/main/1", 0)], &config, &Filters::default());
        assert_eq!(
            summary(&records[0]),
            vec![
                "add branches/main",
                "add branches/main/bin",
                "add branches/main/bin/tools",
                "add branches/main/bin/tools/run.sh"
            ]
        );
        let props = records[0].ops[3].props.as_ref().unwrap();
        assert_eq!(props["svn:executable"], "*");
    }

    #[test]
    fn failed_element_is_dropped_alone() {
        let config = config();
        let records = run(
            vec![modify("ok.txt", "/main/1", 0), modify("missing.txt", "/main/1", 1)],
            &config,
            &Filters::default(),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(
            summary(&records[0]),
            vec!["add branches/main", "add branches/main/ok.txt"]
        );
    }

    #[test]
    fn group_with_only_failures_does_not_materialize() {
        let config = config();
        let records = run(vec![modify("missing.txt", "/main/1", 0)], &config, &Filters::default());
        assert!(records.is_empty());
    }

    #[test]
    fn orphan_branch_is_fatal_in_strict_mode() {
        let mut config = config();
        config.strict_orphans = true;
        let filters = Filters::new(AllowList::only(["dev"]), AllowList::All, vec![]);
        let autoprops = AutoProps::default();
        let mut state = ConversionState::fresh(&config);
        let groups = plan_groups(vec![modify("a", "/main/dev/1", 0)], 300, &mut state.topology);
        let assembler = Assembler::new(&config, &filters, &autoprops);
        let err = assembler.assemble(&mut state, &groups[0], &mut Bytes).unwrap_err();
        assert!(matches!(err, ConvertError::OrphanBranch { .. }));
        assert_eq!(state.head, 0);
        assert!(!state.tree.contains("branches/dev"));
    }

    #[test]
    fn orphan_branch_warns_and_adds_directory() {
        let config = config();
        let filters = Filters::new(AllowList::only(["dev"]), AllowList::All, vec![]);
        let records = run(vec![modify("a", "/main/dev/1", 0)], &config, &filters);
        assert_eq!(summary(&records[0]), vec!["add branches/dev", "add branches/dev/a"]);
    }

    #[test]
    fn symlink_waits_for_its_branch() {
        let config = config();
        let link = event(
            "current",
            "/main/0",
            10,
            EventKind::SymlinkCreate {
                target: "../rel2/bin".into(),
                target_branch: "rel2".into(),
            },
        );
        let records = run(
            vec![
                modify("a", "/main/1", 0),
                link,
                modify("b", "/main/rel2/1", 5_000),
            ],
            &config,
            &Filters::default(),
        );
        assert_eq!(records.len(), 2);
        assert_eq!(
            summary(&records[1]),
            vec![
                "add branches/rel2 <- branches/main@1",
                "add branches/rel2/b",
                "add branches/rel2/current"
            ]
        );
        let op = &records[1].ops[2];
        assert_eq!(op.props.as_ref().unwrap()[PROP_SPECIAL], "*");
        assert_eq!(op.content, Some(NodeContent::Inline(b"link ../rel2/bin".to_vec())));
    }

    #[test]
    fn labels_attach_or_stand_alone() {
        let config = config();
        let label = |element: &str, version: &str, ts: i64| {
            event(
                element,
                version,
                ts,
                EventKind::LabelApply {
                    label: "REL_1".into(),
                },
            )
        };
        let records = run(
            vec![
                modify("a.txt", "/main/1", 0),
                label("a.txt", "/main/1", 0),
                event("a.txt", "/main/dev/0", 1_000, EventKind::BranchCreate),
                label("a.txt", "/main/dev/0", 1_000),
                label("b.txt", "/main/3", 2_000),
            ],
            &config,
            &Filters::default(),
        );
        assert_eq!(records.len(), 3);
        assert_eq!(
            summary(&records[0]),
            vec![
                "add branches/main",
                "add branches/main/a.txt",
                "add tags/REL_1",
                "add tags/REL_1/a.txt"
            ]
        );
        // The dev copy already holds a.txt; its /0 version adds no node.
        assert_eq!(
            summary(&records[1]),
            vec!["add branches/dev <- branches/main@1", "change tags/REL_1/a.txt"]
        );
        assert_eq!(records[2].comment, "Apply label REL_1");
        assert_eq!(summary(&records[2]), vec!["add tags/REL_1/b.txt"]);
        assert_eq!(records[2].sources, vec!["b.txt@@/main/3"]);
    }

    #[test]
    fn grouped_commit_lists_every_source_version() {
        let config = config();
        let records = run(
            vec![
                modify("a.c", "/main/4", 0),
                modify("lib/b.c", "/main/2", 100),
                event("lib", "/main/1", 110, EventKind::DirectoryEntryAdd),
            ],
            &config,
            &Filters::default(),
        );
        assert_eq!(records.len(), 1);
        assert_eq!(
            records[0].sources,
            vec!["a.c@@/main/4", "lib/b.c@@/main/2", "lib@@/main/1"]
        );
        let props = records[0].revision_props().unwrap();
        assert_eq!(
            props[crate::models::PROP_CLEARCASE_REVISION],
            "a.c@@/main/4, lib/b.c@@/main/2, lib@@/main/1"
        );
    }

    #[test]
    fn standalone_label_copies_when_branch_holds_version() {
        let config = config();
        let filters = Filters::default();
        let autoprops = AutoProps::default();
        let mut state = ConversionState::fresh(&config);
        let assembler = Assembler::new(&config, &filters, &autoprops);
        let groups = plan_groups(vec![modify("a", "/main/1", 0)], 300, &mut state.topology);
        assembler.assemble(&mut state, &groups[0], &mut Bytes).unwrap();

        // A later run sees only the label.
        let groups = plan_groups(
            vec![event("a", "/main/1", 0, EventKind::LabelApply { label: "L".into() })],
            300,
            &mut state.topology,
        );
        let record = assembler
            .assemble(&mut state, &groups[0], &mut Bytes)
            .unwrap()
            .record
            .unwrap();
        assert_eq!(
            summary(&record),
            vec!["add tags/L", "add tags/L/a <- branches/main/a@1"]
        );
    }

    #[test]
    fn directory_events_add_and_remove() {
        let config = config();
        let records = run(
            vec![
                modify("src/a.c", "/main/1", 0),
                event("src", "/main/2", 1_000, EventKind::DirectoryEntryAdd),
                event("src", "/main/2", 1_000, EventKind::DirectoryEntryRemove { entry: "a.c".into() }),
                event("docs", "/main/1", 1_000, EventKind::DirectoryEntryAdd),
            ],
            &config,
            &Filters::default(),
        );
        assert_eq!(records.len(), 2);
        assert_eq!(
            summary(&records[1]),
            vec!["delete branches/main/src/a.c", "add branches/main/docs"]
        );
    }

    #[test]
    fn rename_copies_from_previous_revision() {
        let config = config();
        let records = run(
            vec![
                modify("old.c", "/main/1", 0),
                event("new.c", "/main/2", 1_000, EventKind::Rename { from: "old.c".into() }),
            ],
            &config,
            &Filters::default(),
        );
        assert_eq!(
            summary(&records[1]),
            vec!["add branches/main/new.c <- branches/main/old.c@1", "delete branches/main/old.c"]
        );
    }

    #[test]
    fn rename_after_modification_in_same_group_re_adds_content() {
        let config = config();
        let records = run(
            vec![
                modify("old.c", "/main/1", 0),
                modify("old.c", "/main/2", 1_000),
                event("new.c", "/main/3", 1_010, EventKind::Rename { from: "old.c".into() }),
            ],
            &config,
            &Filters::default(),
        );
        assert_eq!(records.len(), 2);
        assert_eq!(
            summary(&records[1]),
            vec![
                "change branches/main/old.c",
                "add branches/main/new.c",
                "delete branches/main/old.c"
            ]
        );
        assert_eq!(
            records[1].ops[1].content,
            Some(NodeContent::Inline(b"old.c@@/main/2".to_vec()))
        );
    }
}
