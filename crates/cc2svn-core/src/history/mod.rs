//! History record source: the seam between the engine and the source system's
//! history query.

pub mod parser;
pub mod retry;

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::errors::{ConvertResult, SourceError};
use crate::models::{normalize_element_path, ChangeEvent, Timestamp};

/// Lazy stream of events.  Ordered by timestamp within each element; no
/// global ordering across elements is promised.
pub type EventStream<'a> = Box<dyn Iterator<Item = ConvertResult<ChangeEvent>> + Send + 'a>;

pub trait HistorySource: Send + Sync {
    /// Events recursively under `root`.  With `since`, only events whose
    /// timestamp is strictly greater than it.
    fn events(&self, root: &str, since: Option<Timestamp>) -> Result<EventStream<'_>, SourceError>;
}

/// Whether `element` lies under the (normalized) root path.
pub fn under_root(element: &str, root: &str) -> bool {
    let root = normalize_element_path(root);
    root.is_empty()
        || element == root
        || (element.starts_with(&root) && element.as_bytes().get(root.len()) == Some(&b'/'))
}

/// In-memory history, used by tests, the benchmark, and pre-parsed history
/// files.
pub struct MemoryHistory {
    events: Vec<ChangeEvent>,
    queries: AtomicUsize,
    failures: Mutex<u32>,
}

impl MemoryHistory {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self {
            events,
            queries: AtomicUsize::new(0),
            failures: Mutex::new(0),
        }
    }

    /// Make the next `count` queries fail with a transient error.
    pub fn fail_next(&self, count: u32) {
        *self.failures.lock() = count;
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

impl HistorySource for MemoryHistory {
    fn events(&self, root: &str, since: Option<Timestamp>) -> Result<EventStream<'_>, SourceError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        {
            let mut failures = self.failures.lock();
            if *failures > 0 {
                *failures -= 1;
                return Err(SourceError::Transient("history query interrupted".into()));
            }
        }
        let root = root.to_string();
        Ok(Box::new(
            self.events
                .iter()
                .filter(move |e| under_root(&e.element, &root))
                .filter(move |e| since.map_or(true, |s| e.timestamp > s))
                .cloned()
                .map(Ok),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{EventKind, VersionId};

    fn event(element: &str, ts: i64) -> ChangeEvent {
        ChangeEvent {
            element: element.into(),
            version: VersionId::parse("/main/1").unwrap(),
            timestamp: Timestamp::from_unix(ts),
            author: "alice".into(),
            comment: String::new(),
            kind: EventKind::ContentModify,
        }
    }

    #[test]
    fn root_matching_respects_component_boundaries() {
        assert!(under_root("src/a.c", "src"));
        assert!(under_root("src", "./src/"));
        assert!(!under_root("srcx/a.c", "src"));
        assert!(under_root("anything", "."));
    }

    #[test]
    fn since_is_strictly_greater() {
        let history = MemoryHistory::new(vec![event("a", 10), event("b", 20), event("c", 30)]);
        let got: Vec<String> = history
            .events(".", Some(Timestamp::from_unix(20)))
            .unwrap()
            .map(|e| e.unwrap().element)
            .collect();
        assert_eq!(got, vec!["c"]);
    }

    #[test]
    fn injected_failures_are_transient() {
        let history = MemoryHistory::new(vec![event("a", 1)]);
        history.fail_next(1);
        assert!(matches!(
            history.events(".", None),
            Err(SourceError::Transient(_))
        ));
        assert_eq!(history.events(".", None).unwrap().count(), 1);
        assert_eq!(history.query_count(), 2);
    }
}
