//! Branch topology: the branch tree, per-branch lifecycle, and the deferred
//! symbolic-link queue.
//!
//! Lifecycle per branch: `Unseen -> Pending -> Materialized -> Closed`.  A
//! closed branch re-opens when a later run observes new events on it.

use std::collections::BTreeSet;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::models::{ChangeEvent, PendingSymlink, Timestamp, ROOT_BRANCH};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchState {
    Unseen,
    Pending,
    Materialized,
    Closed,
}

impl BranchState {
    pub fn as_str(self) -> &'static str {
        match self {
            BranchState::Unseen => "unseen",
            BranchState::Pending => "pending",
            BranchState::Materialized => "materialized",
            BranchState::Closed => "closed",
        }
    }

    pub fn parse(text: &str) -> Option<Self> {
        match text {
            "unseen" => Some(BranchState::Unseen),
            "pending" => Some(BranchState::Pending),
            "materialized" => Some(BranchState::Materialized),
            "closed" => Some(BranchState::Closed),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Branch {
    pub name: String,
    /// Declared parent; `None` only for top-level branches.
    pub parent: Option<String>,
    /// Position in the ancestry chain (`main` is 1).
    pub depth: usize,
    /// Earliest event on the branch, clamped to its parent's creation time.
    pub created_at: Timestamp,
    pub state: BranchState,
    /// Revision that materialized the branch.
    pub materialized_at: Option<u64>,
    pub orphan: bool,
    pub elements: BTreeSet<String>,
    pub last_version: Option<String>,
    pub last_timestamp: Option<Timestamp>,
    pub last_revision: Option<u64>,
}

impl Branch {
    pub fn is_materialized(&self) -> bool {
        self.materialized_at.is_some()
    }
}

/// How a branch's first revision brings it into existence.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Materialization {
    /// Top-level branch: a plain directory add.
    Root,
    /// Directory copy from the parent's head.
    CopyFrom { parent: String },
    /// Parent excluded or never materialized: a rootless directory add.
    Orphan { parent: String },
}

#[derive(Clone, Debug, Default)]
pub struct BranchTopology {
    branches: IndexMap<String, Branch>,
    pending_links: Vec<PendingSymlink>,
    new_elements: Vec<(String, String)>,
}

impl BranchTopology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted state.
    pub fn restore(branches: Vec<Branch>, pending_links: Vec<PendingSymlink>) -> Self {
        Self {
            branches: branches.into_iter().map(|b| (b.name.clone(), b)).collect(),
            pending_links,
            new_elements: vec![],
        }
    }

    pub fn get(&self, name: &str) -> Option<&Branch> {
        self.branches.get(name)
    }

    pub fn state(&self, name: &str) -> BranchState {
        self.branches
            .get(name)
            .map_or(BranchState::Unseen, |b| b.state)
    }

    pub fn is_materialized(&self, name: &str) -> bool {
        self.branches.get(name).is_some_and(Branch::is_materialized)
    }

    pub fn branches(&self) -> impl Iterator<Item = &Branch> {
        self.branches.values()
    }

    /// Register an allowed, non-deferred event: the branch becomes pending
    /// (or re-opens) and its creation time is lowered to the event time
    /// while it is not yet materialized.
    pub fn observe(&mut self, event: &ChangeEvent) {
        let version = &event.version;
        let name = version.branch().to_string();
        let parent = version.parent_branch().map(str::to_string);
        let depth = version.branch_path().len();
        let ts = event.timestamp;

        let branch = self.branches.entry(name.clone()).or_insert_with(|| Branch {
            name: name.clone(),
            parent: parent.clone(),
            depth,
            created_at: ts,
            state: BranchState::Unseen,
            materialized_at: None,
            orphan: false,
            elements: BTreeSet::new(),
            last_version: None,
            last_timestamp: None,
            last_revision: None,
        });
        match branch.state {
            BranchState::Unseen => {
                debug!(branch = %name, "branch observed");
                branch.state = BranchState::Pending;
            }
            BranchState::Closed => {
                branch.state = if branch.is_materialized() {
                    BranchState::Materialized
                } else {
                    BranchState::Pending
                };
            }
            BranchState::Pending | BranchState::Materialized => {}
        }
        if !branch.is_materialized() && ts < branch.created_at {
            branch.created_at = ts;
        }
        if branch.parent.is_none() && parent.is_some() {
            branch.parent = parent;
        }
        if branch.elements.insert(event.element.clone()) {
            self.new_elements.push((name, event.element.clone()));
        }
    }

    /// Clamp creation times so no branch predates its parent.  Parents are
    /// visited before children (by depth).
    pub fn finalize(&mut self) {
        let mut order: Vec<(usize, String)> = self
            .branches
            .values()
            .map(|b| (b.depth, b.name.clone()))
            .collect();
        order.sort();
        for (_, name) in order {
            let parent_created = self
                .branches
                .get(&name)
                .and_then(|b| b.parent.as_ref())
                .and_then(|p| self.branches.get(p))
                .map(|p| p.created_at);
            if let (Some(parent_created), Some(branch)) =
                (parent_created, self.branches.get_mut(&name))
            {
                if branch.created_at < parent_created && !branch.is_materialized() {
                    branch.created_at = parent_created;
                }
            }
        }
    }

    /// Deterministic creation-order key used to break ordering ties.
    pub fn rank(&self, name: &str) -> (Timestamp, usize, String) {
        match self.branches.get(name) {
            Some(b) => (b.created_at, b.depth, b.name.clone()),
            None => (Timestamp::from_unix(i64::MAX), usize::MAX, name.to_string()),
        }
    }

    /// Decide how `name` comes into existence.  `parent_allowed` reports
    /// whether the branch filter admits the parent.
    pub fn plan_materialization(
        &self,
        name: &str,
        parent_allowed: impl Fn(&str) -> bool,
    ) -> Materialization {
        let parent = self.branches.get(name).and_then(|b| b.parent.clone());
        match parent {
            None => Materialization::Root,
            Some(_) if name == ROOT_BRANCH => Materialization::Root,
            Some(parent) if parent_allowed(&parent) && self.is_materialized(&parent) => {
                Materialization::CopyFrom { parent }
            }
            Some(parent) => Materialization::Orphan { parent },
        }
    }

    pub fn mark_materialized(&mut self, name: &str, revision: u64, orphan: bool) {
        if let Some(branch) = self.branches.get_mut(name) {
            branch.state = BranchState::Materialized;
            branch.materialized_at = Some(revision);
            branch.orphan = orphan;
            info!(branch = %name, revision, orphan, "branch materialized");
        }
    }

    /// Advance the per-branch cursor after an event was applied.
    pub fn record_progress(&mut self, name: &str, version: &str, ts: Timestamp, revision: u64) {
        if let Some(branch) = self.branches.get_mut(name) {
            branch.last_version = Some(version.to_string());
            branch.last_timestamp = Some(ts);
            branch.last_revision = Some(revision);
        }
    }

    /// Queue a link until its target branch is materialized.  Re-queuing the
    /// same event is a no-op.
    pub fn enqueue_link(&mut self, link: PendingSymlink) -> bool {
        if self
            .pending_links
            .iter()
            .any(|l| l.event_id == link.event_id)
        {
            return false;
        }
        debug!(link = %link.link_path, branch = %link.target_branch, "symbolic link queued");
        self.pending_links.push(link);
        true
    }

    /// Dequeue every link whose target branch is now materialized.
    pub fn drain_ready_links(&mut self) -> Vec<PendingSymlink> {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_links)
            .into_iter()
            .partition(|l| self.is_materialized(&l.target_branch));
        self.pending_links = waiting;
        ready
    }

    pub fn pending_links(&self) -> &[PendingSymlink] {
        &self.pending_links
    }

    /// End of processing: close every branch and drop the links that never
    /// found their branch.
    pub fn close(&mut self) -> Vec<PendingSymlink> {
        for branch in self.branches.values_mut() {
            branch.state = BranchState::Closed;
        }
        std::mem::take(&mut self.pending_links)
    }

    /// Branch elements recorded since the last call.
    pub fn take_new_elements(&mut self) -> Vec<(String, String)> {
        std::mem::take(&mut self.new_elements)
    }
}
