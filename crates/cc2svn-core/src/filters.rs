//! Branch, label and ignored-subtree filters applied to the raw event stream.
//!
//! An absent allow-list file means "allow all"; a present but empty file
//! means "allow none".  The two states are kept apart by [`AllowList`].

use std::collections::BTreeSet;
use std::path::Path;

use crate::errors::ConvertResult;
use crate::models::{normalize_element_path, ChangeEvent, EventKind};

#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub enum AllowList {
    #[default]
    All,
    Only(BTreeSet<String>),
}

impl AllowList {
    pub fn only<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AllowList::Only(names.into_iter().map(Into::into).collect())
    }

    pub fn allows(&self, name: &str) -> bool {
        match self {
            AllowList::All => true,
            AllowList::Only(names) => names.contains(name),
        }
    }

    /// Load from a one-name-per-line file.  A missing file yields `All`.
    pub fn load(path: &Path) -> ConvertResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Ok(AllowList::Only(read_lines(&text).collect())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AllowList::All),
            Err(e) => Err(e.into()),
        }
    }
}

fn read_lines(text: &str) -> impl Iterator<Item = String> + '_ {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
}

/// Immutable filter configuration, shared read-only with worker threads.
#[derive(Clone, Debug, Default)]
pub struct Filters {
    branches: AllowList,
    labels: AllowList,
    ignored: Vec<String>,
}

impl Filters {
    pub fn new(branches: AllowList, labels: AllowList, ignored: Vec<String>) -> Self {
        let ignored = ignored
            .iter()
            .map(|p| normalize_element_path(p))
            .filter(|p| !p.is_empty())
            .collect();
        Self {
            branches,
            labels,
            ignored,
        }
    }

    /// Load the three filter files; any of them may be absent.
    pub fn load(
        branches: Option<&Path>,
        labels: Option<&Path>,
        ignored: Option<&Path>,
    ) -> ConvertResult<Self> {
        let branches = branches.map_or(Ok(AllowList::All), AllowList::load)?;
        let labels = labels.map_or(Ok(AllowList::All), AllowList::load)?;
        let ignored = match ignored {
            Some(path) => match std::fs::read_to_string(path) {
                Ok(text) => read_lines(&text).collect(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => vec![],
                Err(e) => return Err(e.into()),
            },
            None => vec![],
        };
        Ok(Self::new(branches, labels, ignored))
    }

    pub fn allow_branch(&self, name: &str) -> bool {
        self.branches.allows(name)
    }

    pub fn allow_label(&self, name: &str) -> bool {
        self.labels.allows(name)
    }

    /// Whether `path` is inside an ignored subtree.  Matches whole path
    /// components only.
    pub fn is_ignored(&self, path: &str) -> bool {
        let path = normalize_element_path(path);
        self.ignored.iter().any(|ignored| {
            path == *ignored
                || (path.starts_with(ignored.as_str())
                    && path.as_bytes().get(ignored.len()) == Some(&b'/'))
        })
    }

    /// Whether an event survives filtering.  Symbolic links are judged by
    /// the branch they will be placed into.
    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if self.is_ignored(&event.element) || !self.allow_branch(event.branch()) {
            return false;
        }
        match &event.kind {
            EventKind::LabelApply { label } => self.allow_label(label),
            EventKind::Rename { from } => !self.is_ignored(from),
            _ => true,
        }
    }

    pub fn branches(&self) -> &AllowList {
        &self.branches
    }
}
