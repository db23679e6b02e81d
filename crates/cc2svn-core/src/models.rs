//! Shared typed models used across history, assembly, dump, and checkpoint layers.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use time::macros::format_description;
use time::{OffsetDateTime, PrimitiveDateTime};

use crate::errors::{ConvertError, ConvertResult};

/// Name of the implicit root branch.
pub const ROOT_BRANCH: &str = "main";

/// Revision property keys, in the order they are written.
pub const PROP_LOG: &str = "svn:log";
pub const PROP_AUTHOR: &str = "svn:author";
pub const PROP_DATE: &str = "svn:date";
/// ClearCase versions a revision was built from, `path@@/branch/n`.
pub const PROP_CLEARCASE_REVISION: &str = "ClearcaseRevision";
pub const PROP_SPECIAL: &str = "svn:special";

// ---------------------------------------------------------------------------
// 1. Timestamp
// ---------------------------------------------------------------------------

/// Whole seconds since the Unix epoch, UTC.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    pub const fn from_unix(seconds: i64) -> Self {
        Self(seconds)
    }

    pub const fn unix(self) -> i64 {
        self.0
    }

    /// Parse the ClearCase `%Nd` form, e.g. `20090729.162424`.
    pub fn parse_clearcase(text: &str) -> ConvertResult<Self> {
        let parsed = PrimitiveDateTime::parse(
            text.trim(),
            format_description!("[year][month][day].[hour][minute][second]"),
        )
        .map_err(|e| ConvertError::MalformedHistoryEvent(format!("bad date {text:?}: {e}")))?;
        Ok(Self(parsed.assume_utc().unix_timestamp()))
    }

    fn to_datetime(self) -> ConvertResult<OffsetDateTime> {
        OffsetDateTime::from_unix_timestamp(self.0)
            .map_err(|e| ConvertError::MalformedHistoryEvent(format!("bad timestamp {}: {e}", self.0)))
    }

    /// Format for the `svn:date` revision property.
    pub fn to_svn_date(self) -> ConvertResult<String> {
        self.to_datetime()?
            .format(format_description!(
                "[year]-[month]-[day]T[hour]:[minute]:[second].000000Z"
            ))
            .map_err(|e| ConvertError::MalformedHistoryEvent(e.to_string()))
    }

    /// Format back into the ClearCase `%Nd` form.
    pub fn to_clearcase(self) -> ConvertResult<String> {
        self.to_datetime()?
            .format(format_description!(
                "[year][month][day].[hour][minute][second]"
            ))
            .map_err(|e| ConvertError::MalformedHistoryEvent(e.to_string()))
    }

    /// Format accepted by `cleartool lshistory -since`.
    pub fn to_cleartool_since(self) -> ConvertResult<String> {
        self.to_datetime()?
            .format(format_description!(
                "[day]-[month repr:short]-[year].[hour]:[minute]:[second]UTC"
            ))
            .map_err(|e| ConvertError::MalformedHistoryEvent(e.to_string()))
    }

    pub fn saturating_sub_secs(self, seconds: i64) -> Self {
        Self(self.0.saturating_sub(seconds))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_clearcase() {
            Ok(text) => f.write_str(&text),
            Err(_) => write!(f, "@{}", self.0),
        }
    }
}

// ---------------------------------------------------------------------------
// 2. VersionId
// ---------------------------------------------------------------------------

/// A ClearCase version identifier: branch path plus per-branch sequence.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct VersionId {
    branch_path: Vec<String>,
    seq: u32,
}

impl VersionId {
    pub fn new<S: AsRef<str>>(branch_path: &[S], seq: u32) -> Self {
        Self {
            branch_path: branch_path.iter().map(|s| s.as_ref().to_string()).collect(),
            seq,
        }
    }

    /// Parse `/main/rel2/3` (backslash separators are accepted too).
    pub fn parse(text: &str) -> ConvertResult<Self> {
        let normalized = text.trim().replace('\\', "/");
        let parts: Vec<&str> = normalized.split('/').filter(|p| !p.is_empty()).collect();
        if parts.len() < 2 {
            return Err(ConvertError::MalformedHistoryEvent(format!(
                "version {text:?} has no branch"
            )));
        }
        let (seq_text, branches) = parts.split_last().ok_or_else(|| {
            ConvertError::MalformedHistoryEvent(format!("version {text:?} is empty"))
        })?;
        let seq = seq_text.parse::<u32>().map_err(|_| {
            ConvertError::MalformedHistoryEvent(format!(
                "version {text:?} has non-numeric sequence {seq_text:?}"
            ))
        })?;
        Ok(Self::new(branches, seq))
    }

    /// The branch this version lives on (last branch path component).
    pub fn branch(&self) -> &str {
        self.branch_path.last().map(String::as_str).unwrap_or(ROOT_BRANCH)
    }

    /// Parent branch declared by the source system's ancestry metadata.
    pub fn parent_branch(&self) -> Option<&str> {
        if self.branch_path.len() < 2 {
            return None;
        }
        self.branch_path
            .get(self.branch_path.len() - 2)
            .map(String::as_str)
    }

    pub fn branch_path(&self) -> &[String] {
        &self.branch_path
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }
}

impl fmt::Display for VersionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for branch in &self.branch_path {
            write!(f, "/{branch}")?;
        }
        write!(f, "/{}", self.seq)
    }
}

/// Stable per-version identity of one element version.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementVersion {
    pub element: String,
    pub version: VersionId,
}

impl ElementVersion {
    pub fn new(element: impl Into<String>, version: VersionId) -> Self {
        Self {
            element: element.into(),
            version,
        }
    }

    /// Key used by the content cache and for event identity: `path@@/main/1`.
    pub fn key(&self) -> String {
        format!("{}@@{}", self.element, self.version)
    }
}

/// Normalize an element path to the relative `a/b/c` form used everywhere.
/// The VOB root (`.`) normalizes to the empty string.
pub fn normalize_element_path(path: &str) -> String {
    path.replace('\\', "/")
        .split('/')
        .filter(|part| !part.is_empty() && *part != ".")
        .collect::<Vec<_>>()
        .join("/")
}

// ---------------------------------------------------------------------------
// 3. ChangeEvent
// ---------------------------------------------------------------------------

/// Kind-specific payload of one historical action.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    ContentModify,
    Create,
    Destroy,
    Rename { from: String },
    DirectoryEntryAdd,
    DirectoryEntryRemove { entry: String },
    SymlinkCreate { target: String, target_branch: String },
    LabelApply { label: String },
    BranchCreate,
}

impl EventKind {
    pub fn tag(&self) -> &'static str {
        match self {
            EventKind::ContentModify => "modify",
            EventKind::Create => "create",
            EventKind::Destroy => "destroy",
            EventKind::Rename { .. } => "rename",
            EventKind::DirectoryEntryAdd => "dir-add",
            EventKind::DirectoryEntryRemove { .. } => "dir-remove",
            EventKind::SymlinkCreate { .. } => "symlink",
            EventKind::LabelApply { .. } => "label",
            EventKind::BranchCreate => "branch",
        }
    }

    /// Events whose file content must be retrieved from the source.
    pub fn needs_content(&self) -> bool {
        matches!(
            self,
            EventKind::ContentModify | EventKind::Create | EventKind::BranchCreate
        )
    }
}

/// One historical action on one source-repository element.  Immutable once
/// read from the source.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub element: String,
    pub version: VersionId,
    pub timestamp: Timestamp,
    pub author: String,
    pub comment: String,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ChangeEvent {
    /// Branch the event is projected onto.  Symbolic links go to their
    /// target branch; everything else to the branch of its version.
    pub fn branch(&self) -> &str {
        match &self.kind {
            EventKind::SymlinkCreate { target_branch, .. } => target_branch,
            _ => self.version.branch(),
        }
    }

    pub fn element_version(&self) -> ElementVersion {
        ElementVersion::new(self.element.clone(), self.version.clone())
    }

    /// Stable identity used for resume de-duplication.
    pub fn id(&self) -> String {
        match &self.kind {
            EventKind::LabelApply { label } => {
                format!("{}@@{}#label:{label}", self.element, self.version)
            }
            EventKind::DirectoryEntryRemove { entry } => {
                format!("{}@@{}#dir-remove:{entry}", self.element, self.version)
            }
            kind => format!("{}@@{}#{}", self.element, self.version, kind.tag()),
        }
    }
}

// ---------------------------------------------------------------------------
// 4. Dump-side records
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    File,
    Dir,
}

impl NodeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeKind::File => "file",
            NodeKind::Dir => "dir",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum NodeAction {
    Add,
    Change,
    Delete,
    Replace,
}

impl NodeAction {
    pub fn as_str(self) -> &'static str {
        match self {
            NodeAction::Add => "add",
            NodeAction::Change => "change",
            NodeAction::Delete => "delete",
            NodeAction::Replace => "replace",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopySource {
    pub path: String,
    pub revision: u64,
}

/// Handle to a blob held by the content cache.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlobRef {
    pub key: String,
    pub digest: String,
    pub size: u64,
    pub md5: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum NodeContent {
    Cached(BlobRef),
    Inline(Vec<u8>),
}

/// One path-level operation inside a revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeOp {
    pub path: String,
    pub kind: Option<NodeKind>,
    pub action: NodeAction,
    pub copy_from: Option<CopySource>,
    pub props: Option<IndexMap<String, String>>,
    pub content: Option<NodeContent>,
}

impl NodeOp {
    pub fn add_dir(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: Some(NodeKind::Dir),
            action: NodeAction::Add,
            copy_from: None,
            props: None,
            content: None,
        }
    }

    pub fn copy(
        kind: NodeKind,
        action: NodeAction,
        path: impl Into<String>,
        from_path: impl Into<String>,
        revision: u64,
    ) -> Self {
        Self {
            path: path.into(),
            kind: Some(kind),
            action,
            copy_from: Some(CopySource {
                path: from_path.into(),
                revision,
            }),
            props: None,
            content: None,
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            kind: None,
            action: NodeAction::Delete,
            copy_from: None,
            props: None,
            content: None,
        }
    }

    pub fn file(
        action: NodeAction,
        path: impl Into<String>,
        props: IndexMap<String, String>,
        content: NodeContent,
    ) -> Self {
        Self {
            path: path.into(),
            kind: Some(NodeKind::File),
            action,
            copy_from: None,
            props: Some(props),
            content: Some(content),
        }
    }
}

/// One atomic target-system revision.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RevisionRecord {
    pub number: u64,
    pub author: String,
    pub timestamp: Timestamp,
    pub comment: String,
    /// `element@@version` keys of the source versions, in event order.
    pub sources: Vec<String>,
    pub ops: Vec<NodeOp>,
}

impl RevisionRecord {
    pub fn revision_props(&self) -> ConvertResult<IndexMap<String, String>> {
        let mut props = IndexMap::new();
        props.insert(PROP_LOG.to_string(), self.comment.clone());
        props.insert(PROP_AUTHOR.to_string(), self.author.clone());
        props.insert(PROP_DATE.to_string(), self.timestamp.to_svn_date()?);
        if !self.sources.is_empty() {
            props.insert(PROP_CLEARCASE_REVISION.to_string(), self.sources.join(", "));
        }
        Ok(props)
    }
}

// ---------------------------------------------------------------------------
// 5. PendingSymlink
// ---------------------------------------------------------------------------

/// A link creation deferred until its target branch is materialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingSymlink {
    pub target_branch: String,
    pub link_path: String,
    pub link_target: String,
    pub version: String,
    pub event_id: String,
    pub timestamp: Timestamp,
}
