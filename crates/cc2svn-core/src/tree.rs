//! Target-side tree state: which paths exist at the current revision, their
//! node kind, and which source version a file holds.
//!
//! Every mutation is also recorded as a [`TreeChange`] so the checkpoint store
//! can persist the tree incrementally.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::models::NodeKind;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeEntry {
    pub kind: NodeKind,
    /// Source version a file holds (`/main/3`, or the link version).
    pub version: Option<String>,
}

/// One journaled mutation, replayable in order.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TreeChange {
    Put { path: String, entry: TreeEntry },
    /// Removes the path and everything below it.
    Remove { path: String },
    /// Copies the path and everything below it.
    Copy { from: String, to: String },
}

#[derive(Clone, Debug, Default)]
pub struct TreeState {
    nodes: BTreeMap<String, TreeEntry>,
    journal: Vec<TreeChange>,
}

/// Ancestors of `path`, outermost first (`a/b/c` → `a`, `a/b`).
pub fn ancestors(path: &str) -> Vec<&str> {
    path.match_indices('/').map(|(i, _)| &path[..i]).collect()
}

fn is_within(path: &str, root: &str) -> bool {
    path == root || (path.starts_with(root) && path.as_bytes().get(root.len()) == Some(&b'/'))
}

impl TreeState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted nodes without journaling.
    pub fn from_nodes(nodes: impl IntoIterator<Item = (String, TreeEntry)>) -> Self {
        Self {
            nodes: nodes.into_iter().collect(),
            journal: vec![],
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&TreeEntry> {
        self.nodes.get(path)
    }

    pub fn kind(&self, path: &str) -> Option<NodeKind> {
        self.nodes.get(path).map(|e| e.kind)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    fn subtree_keys(&self, root: &str) -> Vec<String> {
        let prefix = format!("{root}/");
        let mut keys: Vec<String> = self
            .nodes
            .range::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(k, _)| k.starts_with(&prefix))
            .map(|(k, _)| k.clone())
            .collect();
        if self.nodes.contains_key(root) {
            keys.insert(0, root.to_string());
        }
        keys
    }

    /// Paths at or below `root`.
    pub fn subtree(&self, root: &str) -> Vec<(String, TreeEntry)> {
        self.subtree_keys(root)
            .into_iter()
            .filter_map(|k| self.nodes.get(&k).map(|e| (k.clone(), e.clone())))
            .collect()
    }

    pub fn put(&mut self, path: &str, entry: TreeEntry) {
        self.nodes.insert(path.to_string(), entry.clone());
        self.journal.push(TreeChange::Put {
            path: path.to_string(),
            entry,
        });
    }

    pub fn add_dir(&mut self, path: &str) {
        self.put(
            path,
            TreeEntry {
                kind: NodeKind::Dir,
                version: None,
            },
        );
    }

    pub fn set_file(&mut self, path: &str, version: impl Into<String>) {
        self.put(
            path,
            TreeEntry {
                kind: NodeKind::File,
                version: Some(version.into()),
            },
        );
    }

    /// Remove `path` and its subtree.  Returns the number of removed nodes.
    pub fn remove(&mut self, path: &str) -> usize {
        let keys = self.subtree_keys(path);
        for key in &keys {
            self.nodes.remove(key);
        }
        if !keys.is_empty() {
            self.journal.push(TreeChange::Remove {
                path: path.to_string(),
            });
        }
        keys.len()
    }

    /// Copy `from` and its subtree to `to`, replacing whatever was there.
    pub fn copy(&mut self, from: &str, to: &str) {
        let copied: Vec<(String, TreeEntry)> = self
            .subtree(from)
            .into_iter()
            .map(|(path, entry)| (format!("{to}{}", &path[from.len()..]), entry))
            .collect();
        for key in self.subtree_keys(to) {
            self.nodes.remove(&key);
        }
        for (path, entry) in copied {
            self.nodes.insert(path, entry);
        }
        self.journal.push(TreeChange::Copy {
            from: from.to_string(),
            to: to.to_string(),
        });
    }

    /// Apply a journaled change, e.g. when replaying.
    pub fn apply(&mut self, change: &TreeChange) {
        match change {
            TreeChange::Put { path, entry } => self.put(path, entry.clone()),
            TreeChange::Remove { path } => {
                self.remove(path);
            }
            TreeChange::Copy { from, to } => self.copy(from, to),
        }
    }

    /// Ancestors of `path` that do not exist yet, outermost first.
    pub fn missing_parents<'p>(&self, path: &'p str) -> Vec<&'p str> {
        ancestors(path)
            .into_iter()
            .filter(|p| self.kind(p) != Some(NodeKind::Dir))
            .collect()
    }

    pub fn take_journal(&mut self) -> Vec<TreeChange> {
        std::mem::take(&mut self.journal)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &TreeEntry)> {
        self.nodes.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ancestors_outermost_first() {
        assert_eq!(ancestors("a/b/c"), vec!["a", "a/b"]);
        assert!(ancestors("a").is_empty());
    }

    #[test]
    fn missing_parents_skips_existing_dirs() {
        let mut tree = TreeState::new();
        tree.add_dir("branches");
        tree.add_dir("branches/main");
        assert_eq!(
            tree.missing_parents("branches/main/src/lib/a.c"),
            vec!["branches/main/src", "branches/main/src/lib"]
        );
    }

    #[test]
    fn remove_drops_subtree_only() {
        let mut tree = TreeState::new();
        tree.add_dir("d");
        tree.set_file("d/x", "/main/1");
        tree.set_file("d2", "/main/1");
        assert_eq!(tree.remove("d"), 2);
        assert!(tree.contains("d2"));
        assert_eq!(tree.remove("nothing"), 0);
    }

    #[test]
    fn copy_duplicates_subtree_with_versions() {
        let mut tree = TreeState::new();
        tree.add_dir("branches/main");
        tree.set_file("branches/main/a.txt", "/main/1");
        tree.set_file("branches/mainline", "/main/1");
        tree.copy("branches/main", "branches/feature");
        assert_eq!(
            tree.get("branches/feature/a.txt").unwrap().version.as_deref(),
            Some("/main/1")
        );
        assert_eq!(tree.kind("branches/feature"), Some(NodeKind::Dir));
        assert!(!tree.contains("branches/featureline"));
    }

    #[test]
    fn journal_replays_to_same_state() {
        let mut tree = TreeState::new();
        tree.add_dir("b");
        tree.set_file("b/a", "/main/1");
        tree.copy("b", "c");
        tree.remove("b/a");
        let journal = tree.take_journal();
        assert!(tree.take_journal().is_empty());

        let mut replay = TreeState::new();
        for change in &journal {
            replay.apply(change);
        }
        let left: Vec<_> = tree.iter().collect();
        let right: Vec<_> = replay.iter().collect();
        assert_eq!(left, right);
    }
}
