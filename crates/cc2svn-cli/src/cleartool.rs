//! `cleartool` collaborators: history queries and version retrieval by
//! process invocation, each bounded by the configured timeout.

use std::ffi::OsString;
use std::fs;
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use cc2svn_core::cache::BlobSource;
use cc2svn_core::history::parser::{HistoryParser, HISTORY_FORMAT};
use cc2svn_core::history::{EventStream, HistorySource};
use cc2svn_core::models::{normalize_element_path, Timestamp, VersionId};
use cc2svn_core::SourceError;
use tracing::{debug, info};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

static FETCH_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// Captured output of one finished invocation.
struct Invocation {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: String,
}

/// Map `cleartool` diagnostics onto the collaborator error classes.
pub fn classify_stderr(stderr: &str) -> SourceError {
    let message = stderr.trim().to_string();
    let lower = message.to_ascii_lowercase();
    if lower.contains("permission denied")
        || lower.contains("access denied")
        || lower.contains("not owner")
    {
        SourceError::AccessDenied(message)
    } else if lower.contains("no such file")
        || lower.contains("not found")
        || lower.contains("not a vob object")
        || lower.contains("version not found")
    {
        SourceError::NotFound(message)
    } else {
        SourceError::Transient(message)
    }
}

pub struct ClearTool {
    binary: PathBuf,
    vob_root: PathBuf,
    scratch: PathBuf,
    timeout: Duration,
    history_file: Option<PathBuf>,
    parser: HistoryParser,
}

impl ClearTool {
    /// `scratch` receives versions while they are being retrieved.
    pub fn new(
        binary: impl Into<PathBuf>,
        vob_root: impl Into<PathBuf>,
        scratch: impl Into<PathBuf>,
        timeout: Duration,
    ) -> Self {
        let vob_root = vob_root.into();
        let link_root = vob_root.clone();
        let parser = HistoryParser::new().with_link_reader(Box::new(move |element: &str| {
            fs::read_link(link_root.join(element))
                .ok()
                .map(|target| target.to_string_lossy().into_owned())
        }));
        Self {
            binary: binary.into(),
            vob_root,
            scratch: scratch.into(),
            timeout,
            history_file: None,
            parser,
        }
    }

    /// Reuse saved `lshistory` output for unbounded queries, saving it on
    /// first use.
    pub fn with_history_file(mut self, path: Option<PathBuf>) -> Self {
        self.history_file = path;
        self
    }

    fn spawn(&self, args: &[OsString]) -> Result<Child, SourceError> {
        Command::new(&self.binary)
            .args(args)
            .current_dir(&self.vob_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                let message = format!("{}: {e}", self.binary.display());
                match e.kind() {
                    ErrorKind::NotFound => SourceError::NotFound(message),
                    ErrorKind::PermissionDenied => SourceError::AccessDenied(message),
                    _ => SourceError::Transient(message),
                }
            })
    }

    fn invoke(&self, args: &[OsString]) -> Result<Invocation, SourceError> {
        let mut child = self.spawn(args)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let deadline = Instant::now() + self.timeout;
        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if Instant::now() >= deadline => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(SourceError::Transient(format!(
                        "cleartool {} timed out after {}s",
                        args.first().map(|a| a.to_string_lossy()).unwrap_or_default(),
                        self.timeout.as_secs()
                    )));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(SourceError::Transient(e.to_string())),
            }
        };

        Ok(Invocation {
            status,
            stdout: stdout.join().unwrap_or_default(),
            stderr: String::from_utf8_lossy(&stderr.join().unwrap_or_default()).into_owned(),
        })
    }

    /// Run and require success; failures are classified from stderr.
    fn invoke_checked(&self, args: &[OsString]) -> Result<Vec<u8>, SourceError> {
        let invocation = self.invoke(args)?;
        if invocation.status.success() {
            Ok(invocation.stdout)
        } else if invocation.stderr.trim().is_empty() {
            Err(SourceError::Transient(format!(
                "cleartool exited with {}",
                invocation.status
            )))
        } else {
            Err(classify_stderr(&invocation.stderr))
        }
    }

    fn lshistory(&self, root: &str, since: Option<Timestamp>) -> Result<String, SourceError> {
        let mut args: Vec<OsString> = vec![
            "lshistory".into(),
            "-recurse".into(),
            "-fmt".into(),
            HISTORY_FORMAT.into(),
        ];
        if let Some(since) = since {
            let text = since
                .to_cleartool_since()
                .map_err(|e| SourceError::Transient(e.to_string()))?;
            args.push("-since".into());
            args.push(text.into());
        }
        args.push(root.into());
        debug!(root, ?since, "querying history");
        let stdout = self.invoke_checked(&args)?;
        Ok(String::from_utf8_lossy(&stdout).into_owned())
    }

    /// Saved history for `root`; one file per root, suffixed after the first.
    fn history_path(&self, root: &str) -> Option<PathBuf> {
        let base = self.history_file.as_ref()?;
        let normalized = normalize_element_path(root);
        if normalized.is_empty() {
            return Some(base.clone());
        }
        let mut name = base.as_os_str().to_owned();
        name.push(format!(".{}", normalized.replace('/', "_")));
        Some(PathBuf::from(name))
    }

    fn history_text(&self, root: &str, since: Option<Timestamp>) -> Result<String, SourceError> {
        let saved = match since {
            None => self.history_path(root),
            Some(_) => None,
        };
        let Some(path) = saved else {
            return self.lshistory(root, since);
        };
        if path.exists() {
            info!(path = %path.display(), "reading saved history");
            let bytes = fs::read(&path).map_err(|e| io_error(&path, e))?;
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }
        let text = self.lshistory(root, None)?;
        fs::write(&path, &text).map_err(|e| io_error(&path, e))?;
        Ok(text)
    }

    fn scratch_file(&self) -> PathBuf {
        let n = FETCH_COUNTER.fetch_add(1, Ordering::Relaxed);
        self.scratch
            .join(format!("get-{}-{n}", std::process::id()))
    }
}

impl HistorySource for ClearTool {
    fn events(&self, root: &str, since: Option<Timestamp>) -> Result<EventStream<'_>, SourceError> {
        let text = self.history_text(root, since)?;
        match self.parser.parse(&text) {
            Ok(events) => Ok(Box::new(
                events
                    .into_iter()
                    // `-since` is inclusive.
                    .filter(move |e| since.map_or(true, |s| e.timestamp > s))
                    .map(Ok),
            )),
            Err(e) => Ok(Box::new(std::iter::once(Err(e)))),
        }
    }
}

impl BlobSource for ClearTool {
    fn fetch(&self, element: &str, version: &VersionId) -> Result<Vec<u8>, SourceError> {
        fs::create_dir_all(&self.scratch).map_err(|e| io_error(&self.scratch, e))?;
        let target = self.scratch_file();
        let args: Vec<OsString> = vec![
            "get".into(),
            "-to".into(),
            target.clone().into_os_string(),
            format!("{element}@@{version}").into(),
        ];
        let result = self
            .invoke_checked(&args)
            .and_then(|_| fs::read(&target).map_err(|e| io_error(&target, e)));
        let _ = fs::remove_file(&target);
        result
    }
}

fn drain<R: Read + Send + 'static>(stream: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut stream) = stream {
            let _ = stream.read_to_end(&mut buf);
        }
        buf
    })
}

fn io_error(path: &Path, e: std::io::Error) -> SourceError {
    let message = format!("{}: {e}", path.display());
    match e.kind() {
        ErrorKind::NotFound => SourceError::NotFound(message),
        ErrorKind::PermissionDenied => SourceError::AccessDenied(message),
        _ => SourceError::Transient(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stderr_classification() {
        assert!(matches!(
            classify_stderr("cleartool: Error: Unable to access \"x@@/main/9\": No such file or directory."),
            SourceError::NotFound(_)
        ));
        assert!(matches!(
            classify_stderr("cleartool: Error: Permission denied."),
            SourceError::AccessDenied(_)
        ));
        assert!(matches!(
            classify_stderr("cleartool: Error: Unable to contact albd_server on host 'vobsrv'"),
            SourceError::Transient(_)
        ));
    }

    #[test]
    fn missing_binary_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let tool = ClearTool::new(
            dir.path().join("no-such-cleartool"),
            dir.path(),
            dir.path().join("scratch"),
            Duration::from_secs(1),
        );
        let err = tool
            .fetch("a.txt", &VersionId::parse("/main/1").unwrap())
            .unwrap_err();
        assert!(matches!(err, SourceError::NotFound(_)));
    }

    #[cfg(unix)]
    mod fake_cleartool {
        use std::os::unix::fs::PermissionsExt;

        use super::*;

        const SCRIPT: &str = r#"#!/bin/sh
case "$1" in
  lshistory)
    printf '20200102.120000@@@b.txt@@@/main/1@@@checkin@@@@@@@@@version@@@bob@@@second@@@\n'
    printf '20200101.120000@@@a.txt@@@/main/1@@@checkin@@@(REL_1)@@@@@@version@@@alice@@@first@@@\n'
    ;;
  get)
    case "$4" in
      missing*) echo "cleartool: Error: Unable to access \"$4\": No such file or directory." >&2; exit 1 ;;
      slow*) sleep 5 ;;
      *) printf 'content of %s' "$4" > "$3" ;;
    esac
    ;;
esac
"#;

        fn tool(dir: &Path) -> ClearTool {
            let binary = dir.join("cleartool");
            fs::write(&binary, SCRIPT).unwrap();
            fs::set_permissions(&binary, fs::Permissions::from_mode(0o755)).unwrap();
            ClearTool::new(binary, dir, dir.join("scratch"), Duration::from_secs(1))
        }

        #[test]
        fn history_is_parsed_oldest_first() {
            let dir = tempfile::tempdir().unwrap();
            let events: Vec<_> = tool(dir.path())
                .events(".", None)
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
            let elements: Vec<&str> = events.iter().map(|e| e.element.as_str()).collect();
            assert_eq!(elements, vec!["a.txt", "a.txt", "b.txt"]);
            assert_eq!(events[0].author, "alice");
        }

        #[test]
        fn since_is_exclusive() {
            let dir = tempfile::tempdir().unwrap();
            let since = Timestamp::parse_clearcase("20200101.120000").unwrap();
            let events: Vec<_> = tool(dir.path())
                .events(".", Some(since))
                .unwrap()
                .collect::<Result<_, _>>()
                .unwrap();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].element, "b.txt");
        }

        #[test]
        fn history_file_is_saved_and_reused() {
            let dir = tempfile::tempdir().unwrap();
            let saved = dir.path().join("history.txt");
            let cleartool = tool(dir.path()).with_history_file(Some(saved.clone()));
            assert_eq!(cleartool.events(".", None).unwrap().count(), 3);
            assert!(saved.exists());

            fs::write(&saved, "").unwrap();
            assert_eq!(cleartool.events(".", None).unwrap().count(), 0);
        }

        #[test]
        fn get_returns_version_bytes() {
            let dir = tempfile::tempdir().unwrap();
            let bytes = tool(dir.path())
                .fetch("a.txt", &VersionId::parse("/main/3").unwrap())
                .unwrap();
            assert_eq!(bytes, b"content of a.txt@@/main/3");
            assert_eq!(fs::read_dir(dir.path().join("scratch")).unwrap().count(), 0);
        }

        #[test]
        fn get_failures_are_classified() {
            let dir = tempfile::tempdir().unwrap();
            let err = tool(dir.path())
                .fetch("missing.txt", &VersionId::parse("/main/1").unwrap())
                .unwrap_err();
            assert!(matches!(err, SourceError::NotFound(_)));
        }

        #[test]
        fn slow_get_times_out_as_transient() {
            let dir = tempfile::tempdir().unwrap();
            let started = Instant::now();
            let err = tool(dir.path())
                .fetch("slow.txt", &VersionId::parse("/main/1").unwrap())
                .unwrap_err();
            assert!(matches!(err, SourceError::Transient(_)));
            assert!(started.elapsed() < Duration::from_secs(4));
        }
    }
}
