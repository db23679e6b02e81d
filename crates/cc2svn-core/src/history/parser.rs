//! Parser for `cleartool lshistory -fmt` output.
//!
//! Each record is ten `@@@`-separated fields terminated by a newline.  Comments
//! may span several lines, so physical lines are re-joined until a record has
//! exactly ten fields.  `lshistory` prints newest first; parsed events are
//! returned oldest first.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::errors::{ConvertError, ConvertResult};
use crate::models::{
    normalize_element_path, ChangeEvent, EventKind, Timestamp, VersionId, ROOT_BRANCH,
};

pub const FIELD_SEPARATOR: &str = "@@@";

/// Format string handed to `cleartool lshistory -fmt` / `cleartool describe -fmt`.
pub const HISTORY_FORMAT: &str = "%Nd@@@%En@@@%Vn@@@%o@@@%l@@@%a@@@%m@@@%u@@@%Nc@@@\\n";

const FIELD_COUNT: usize = 10;

static UNCATALOGED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^Uncataloged (?:file element|directory element|symbolic link) "(.+)"\.?$"#)
        .expect("valid regex")
});

static MOVED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"^Moved (?:file element|directory element|symbolic link) "(.+)" to "(.+)"\.?$"#)
        .expect("valid regex")
});

/// Reads the target of a symbolic link element, relative to the VOB root.
pub type LinkReader = Box<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// One raw history record before it is mapped onto typed events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryRecord {
    pub date: String,
    pub path: String,
    pub version: String,
    pub operation: String,
    pub labels: Vec<String>,
    pub attributes: Vec<String>,
    pub object_kind: String,
    pub user: String,
    pub comment: String,
}

/// Parse a `(A, B, C)` list; anything else is empty.
fn parse_list(field: &str) -> Vec<String> {
    let trimmed = field.trim();
    if trimmed.len() >= 2 && trimmed.starts_with('(') && trimmed.ends_with(')') {
        trimmed[1..trimmed.len() - 1]
            .split(", ")
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    } else {
        vec![]
    }
}

/// Split raw `lshistory` text into records, in the order they appear.
pub fn split_records(text: &str) -> ConvertResult<Vec<HistoryRecord>> {
    let mut records = Vec::new();
    let mut pending: Option<String> = None;

    for raw_line in text.split('\n') {
        let line = raw_line.strip_suffix('\r').unwrap_or(raw_line);
        let joined = match pending.take() {
            Some(prev) => format!("{prev}\n{line}"),
            None if line.trim().is_empty() => continue,
            None => line.to_string(),
        };

        let fields: Vec<&str> = joined.split(FIELD_SEPARATOR).collect();
        if fields.len() < FIELD_COUNT {
            pending = Some(joined);
            continue;
        }
        if fields.len() > FIELD_COUNT {
            return Err(ConvertError::MalformedHistoryEvent(format!(
                "expected {FIELD_COUNT} fields, found {}: {joined:?}",
                fields.len()
            )));
        }
        records.push(HistoryRecord {
            date: fields[0].trim().to_string(),
            path: fields[1].to_string(),
            version: fields[2].trim().to_string(),
            operation: fields[3].trim().to_string(),
            labels: parse_list(fields[4]),
            attributes: parse_list(fields[5]),
            object_kind: fields[6].trim().to_string(),
            user: fields[7].trim().to_string(),
            comment: fields[8].to_string(),
        });
    }

    if let Some(rest) = pending {
        if !rest.trim().is_empty() {
            return Err(ConvertError::MalformedHistoryEvent(format!(
                "truncated history record: {rest:?}"
            )));
        }
    }
    Ok(records)
}

/// Maps history records onto typed change events.
pub struct HistoryParser {
    link_reader: Option<LinkReader>,
}

impl Default for HistoryParser {
    fn default() -> Self {
        Self::new()
    }
}

impl HistoryParser {
    pub fn new() -> Self {
        Self { link_reader: None }
    }

    pub fn with_link_reader(mut self, reader: LinkReader) -> Self {
        self.link_reader = Some(reader);
        self
    }

    /// Parse `lshistory` output into events, oldest first.
    pub fn parse(&self, text: &str) -> ConvertResult<Vec<ChangeEvent>> {
        let records = split_records(text)?;
        let mut events = Vec::with_capacity(records.len());
        for record in records.iter().rev() {
            events.extend(self.record_events(record)?);
        }
        Ok(events)
    }

    /// Map one record; unsupported operation/kind pairs yield no events.
    pub fn record_events(&self, record: &HistoryRecord) -> ConvertResult<Vec<ChangeEvent>> {
        let element = normalize_element_path(&record.path);
        if element.is_empty() {
            return Ok(vec![]);
        }

        let kind = match (record.operation.as_str(), record.object_kind.as_str()) {
            ("checkin", "version") => EventKind::ContentModify,
            ("mkelem", "version") => EventKind::Create,
            ("mkbranch", "version") => EventKind::BranchCreate,
            ("checkin" | "mkelem" | "mkbranch", "directory version") => {
                EventKind::DirectoryEntryAdd
            }
            ("mkslink", "symbolic link") => {
                let version = version_or_root(&record.version)?;
                let Some(target) = self.read_link(&element) else {
                    let err = ConvertError::UnresolvableSymlink {
                        link: element.clone(),
                        branch: version.branch().to_string(),
                    };
                    warn!(error = %err, "symbolic link target unreadable, link dropped");
                    return Ok(vec![]);
                };
                let target_branch = version.branch().to_string();
                EventKind::SymlinkCreate {
                    target,
                    target_branch,
                }
            }
            ("rmelem", _) => EventKind::Destroy,
            (operation, kind) => {
                debug!(element = %element, operation, kind, "history record skipped");
                return Ok(vec![]);
            }
        };

        // rmelem and mkslink records carry no version; they act on the root branch.
        let version = version_or_root(&record.version)?;
        let timestamp = Timestamp::parse_clearcase(&record.date)?;
        let mut comment = record.comment.clone();
        for attribute in &record.attributes {
            comment.push('\n');
            comment.push_str(attribute);
        }

        let base = ChangeEvent {
            element: element.clone(),
            version,
            timestamp,
            author: record.user.clone(),
            comment,
            kind: kind.clone(),
        };

        let mut events = Vec::new();
        if kind == EventKind::DirectoryEntryAdd {
            for line in record.comment.lines() {
                let line = line.trim();
                if let Some(caps) = UNCATALOGED_RE.captures(line) {
                    let entry = normalize_element_path(&caps[1]);
                    if !entry.is_empty() {
                        events.push(ChangeEvent {
                            kind: EventKind::DirectoryEntryRemove { entry },
                            ..base.clone()
                        });
                    }
                } else if let Some(caps) = MOVED_RE.captures(line) {
                    // Names are relative to the directory that was checked in.
                    let from = normalize_element_path(&format!("{element}/{}", &caps[1]));
                    let to = normalize_element_path(&format!("{element}/{}", &caps[2]));
                    if from != element && to != element && from != to {
                        events.push(ChangeEvent {
                            element: to,
                            kind: EventKind::Rename { from },
                            ..base.clone()
                        });
                    }
                }
            }
        }

        let is_file_version = record.object_kind == "version";
        let labels: Vec<ChangeEvent> = if is_file_version {
            record
                .labels
                .iter()
                .map(|label| ChangeEvent {
                    kind: EventKind::LabelApply {
                        label: label.clone(),
                    },
                    ..base.clone()
                })
                .collect()
        } else {
            vec![]
        };

        events.insert(0, base);
        events.extend(labels);
        Ok(events)
    }

    fn read_link(&self, element: &str) -> Option<String> {
        self.link_reader.as_ref().and_then(|reader| reader(element))
    }
}

fn version_or_root(text: &str) -> ConvertResult<VersionId> {
    if text.trim().is_empty() {
        Ok(VersionId::new(&[ROOT_BRANCH], 0))
    } else {
        VersionId::parse(text)
    }
}
