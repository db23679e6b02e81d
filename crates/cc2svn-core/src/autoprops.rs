//! Extension-to-property mapping applied to every file add/change.
//!
//! File format: one `pattern = key=value;key=value` entry per line.  The
//! pattern is a shell pattern matched against the file's basename.  When
//! several patterns match, the longest pattern wins; ties go to the entry
//! that appears first.

use std::path::Path;

use indexmap::IndexMap;
use regex::Regex;
use tracing::{debug, warn};

use crate::errors::{ConvertError, ConvertResult};

#[derive(Debug, Clone)]
struct Rule {
    pattern: String,
    matcher: Regex,
    props: IndexMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct AutoProps {
    rules: Vec<Rule>,
}

/// Translate a shell pattern (`*`, `?`, `[...]`, `[!...]`) into an anchored
/// regex.  Unterminated brackets match a literal `[`.
fn glob_to_regex(pattern: &str) -> String {
    let chars: Vec<char> = pattern.chars().collect();
    let mut out = String::from("^");
    let mut i = 0;
    while i < chars.len() {
        match chars[i] {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            '[' => {
                let mut j = i + 1;
                if j < chars.len() && chars[j] == '!' {
                    j += 1;
                }
                if j < chars.len() && chars[j] == ']' {
                    j += 1;
                }
                while j < chars.len() && chars[j] != ']' {
                    j += 1;
                }
                if j >= chars.len() {
                    out.push_str("\\[");
                } else {
                    let mut class: String = chars[i + 1..j].iter().collect();
                    if let Some(rest) = class.strip_prefix('!') {
                        class = format!("^{rest}");
                    } else if class.starts_with('^') {
                        class = format!("\\{class}");
                    }
                    out.push('[');
                    out.push_str(&class.replace('\\', "\\\\"));
                    out.push(']');
                    i = j;
                }
            }
            c => out.push_str(&regex::escape(&c.to_string())),
        }
        i += 1;
    }
    out.push('$');
    out
}

impl AutoProps {
    pub fn parse(text: &str) -> ConvertResult<Self> {
        let mut rules = Vec::new();
        for (line_no, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((pattern, assignments)) =
                line.split_once(" = ").or_else(|| line.split_once('='))
            else {
                warn!(line = line_no + 1, "autoprops line without '=' skipped");
                continue;
            };
            let pattern = pattern.trim().to_string();
            if pattern.is_empty() {
                warn!(line = line_no + 1, "autoprops line with empty pattern skipped");
                continue;
            }
            let matcher = Regex::new(&glob_to_regex(&pattern)).map_err(|e| {
                ConvertError::Config(format!("bad autoprops pattern {pattern:?}: {e}"))
            })?;
            let mut props = IndexMap::new();
            for assignment in assignments.split(';') {
                let assignment = assignment.trim();
                if assignment.is_empty() {
                    continue;
                }
                let (key, value) = assignment.split_once('=').unwrap_or((assignment, ""));
                props.insert(key.trim().to_string(), value.trim().to_string());
            }
            rules.push(Rule {
                pattern,
                matcher,
                props,
            });
        }
        debug!(rules = rules.len(), "autoprops loaded");
        Ok(Self { rules })
    }

    /// A missing file yields an empty mapping.
    pub fn load(path: &Path) -> ConvertResult<Self> {
        match std::fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Properties for `path`, resolved on its basename.
    pub fn props_for(&self, path: &str) -> IndexMap<String, String> {
        let name = path.rsplit('/').next().unwrap_or(path);
        let mut best: Option<&Rule> = None;
        for rule in &self.rules {
            if !rule.matcher.is_match(name) {
                continue;
            }
            if best.map_or(true, |b| rule.pattern.len() > b.pattern.len()) {
                best = Some(rule);
            }
        }
        best.map(|rule| rule.props.clone()).unwrap_or_default()
    }
}
