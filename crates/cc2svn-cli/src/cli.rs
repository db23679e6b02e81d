use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use cc2svn_core::autoprops::AutoProps;
use cc2svn_core::checkpoint::Checkpoint;
use cc2svn_core::filters::Filters;
use cc2svn_core::models::Timestamp;
use cc2svn_core::{CheckpointStore, ContentCache, ConvertError, ConversionReport, Converter, OutputPlacement};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{info, warn};

use crate::cleartool::ClearTool;
use crate::config::{self, CliConfig, LogFormat};
use crate::error::{CliError, CliResult};
use crate::telemetry;

#[derive(Parser, Debug)]
#[command(
    name = "cc2svn",
    version,
    about = "Convert ClearCase history into a Subversion dump"
)]
pub struct Cli {
    /// Configuration file (default: ./cc2svn.toml).
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Default log filter, e.g. `debug` or `cc2svn_core=trace`.
    #[arg(long, global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    #[arg(long, global = true, value_enum)]
    pub log_format: Option<LogFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Convert, resuming from the checkpoint when one exists.
    Run {
        /// Only write revisions after this time (`YYYYMMDD.HHMMSS`).
        #[arg(long, value_name = "TIME")]
        since: Option<String>,

        /// Discard the checkpoint and the dump before converting.
        #[arg(long)]
        restart: bool,

        /// Print the conversion report as JSON on stdout.
        #[arg(long)]
        report_json: bool,
    },
    /// Print the stored checkpoint.
    Checkpoint,
    /// Remove cache blobs no entry references.
    CacheGc,
}

/// Load configuration, install logging, and dispatch.
pub fn run(cli: Cli) -> CliResult<()> {
    let mut config = config::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(format) = cli.log_format {
        config.logging.format = format;
    }
    telemetry::init(&config.logging)?;

    match cli.command {
        Command::Run {
            since,
            restart,
            report_json,
        } => {
            if let Some(since) = since {
                config.engine.dump_since = Some(
                    Timestamp::parse_clearcase(&since)
                        .map_err(|e| CliError::Argument(format!("--since {since:?}: {e}")))?,
                );
            }
            let cancel = Arc::new(AtomicBool::new(false));
            for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
                signal_hook::flag::register(signal, Arc::clone(&cancel))
                    .map_err(|e| CliError::io("signal handler", e))?;
            }
            let report = convert(&config, restart, cancel)?;
            if report_json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            }
            if report.cancelled {
                return Err(ConvertError::Cancelled(report.last_revision).into());
            }
            Ok(())
        }
        Command::Checkpoint => {
            let store = CheckpointStore::new(&config.paths.checkpoint);
            match store.load()? {
                Some(restored) => {
                    let summary = CheckpointSummary::new(&restored.checkpoint, restored.tree.len());
                    println!("{}", serde_json::to_string_pretty(&summary)?);
                }
                None => println!("no checkpoint"),
            }
            Ok(())
        }
        Command::CacheGc => {
            let cache = ContentCache::open(&config.paths.cache_dir, config.engine.verify_zero_size)?;
            let stats = cache.gc()?;
            info!(removed = stats.removed, kept = stats.kept, "cache gc finished");
            println!("{}", serde_json::to_string_pretty(&stats)?);
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

/// Run one conversion with the `cleartool` collaborators.
pub fn convert(config: &CliConfig, restart: bool, cancel: Arc<AtomicBool>) -> CliResult<ConversionReport> {
    let paths = &config.paths;
    let mut store = CheckpointStore::new(&paths.checkpoint);
    if restart {
        store.clear()?;
        remove_if_present(&paths.dump)?;
    }
    if let Some(dir) = paths.checkpoint.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir).map_err(|e| CliError::io(dir, e))?;
    }

    let filters = Filters::load(
        paths.branches.as_deref(),
        paths.labels.as_deref(),
        paths.ignored.as_deref(),
    )?;
    let autoprops = match &paths.autoprops {
        Some(path) => AutoProps::load(path)?,
        None => AutoProps::default(),
    };
    let cache = ContentCache::open(&paths.cache_dir, config.engine.verify_zero_size)?;
    let cleartool = ClearTool::new(
        &config.cleartool.binary,
        &paths.vob_root,
        paths.cache_dir.join("fetch"),
        config.engine.retry.timeout(),
    )
    .with_history_file(paths.history_file.clone());

    let checkpoint = store.load()?.map(|restored| restored.checkpoint);
    let (file, placement) = open_dump(&paths.dump, checkpoint.as_ref())?;
    let mut out = SyncedDump::new(file);

    let report = Converter::new(config.engine.clone(), &cleartool, &cleartool, &cache)
        .with_filters(filters)
        .with_autoprops(autoprops)
        .with_checkpoints(store)
        .with_cancel_flag(cancel)
        .run(&mut out, placement)?;
    out.flush().map_err(|e| CliError::io(&paths.dump, e))?;

    info!(
        dump = %paths.dump.display(),
        written = report.revisions_written,
        last_revision = report.last_revision,
        orphans = report.orphan_branches.len(),
        dropped_symlinks = report.dropped_symlinks,
        cache_hits = report.cache.hits,
        cache_misses = report.cache.misses,
        "run summary"
    );
    Ok(report)
}

/// Open the dump for a fresh run or for appending after `checkpoint`; any
/// bytes past the checkpoint offset are a partial revision and are cut off.
fn open_dump(path: &Path, checkpoint: Option<&Checkpoint>) -> CliResult<(File, OutputPlacement)> {
    let Some(checkpoint) = checkpoint else {
        let file = File::create(path).map_err(|e| CliError::io(path, e))?;
        return Ok((file, OutputPlacement::Fresh));
    };

    let offset = checkpoint.dump_offset;
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| CliError::io(path, e))?;
    let len = file.metadata().map_err(|e| CliError::io(path, e))?.len();
    if len < offset {
        return Err(CliError::Argument(format!(
            "{} holds {len} bytes but the checkpoint expects {offset}; rerun with --restart",
            path.display()
        )));
    }
    if len > offset {
        warn!(dump = %path.display(), len, offset, "truncating partial revision");
        file.set_len(offset).map_err(|e| CliError::io(path, e))?;
    }
    file.seek(SeekFrom::End(0)).map_err(|e| CliError::io(path, e))?;
    Ok((file, OutputPlacement::Append { offset }))
}

/// Buffered dump file whose `flush` also syncs the data to disk, so a
/// checkpoint saved after a flush never points past durable bytes.
struct SyncedDump {
    out: BufWriter<File>,
}

impl SyncedDump {
    fn new(file: File) -> Self {
        Self {
            out: BufWriter::new(file),
        }
    }
}

impl Write for SyncedDump {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.out.write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.out.flush()?;
        self.out.get_ref().sync_data()
    }
}

fn remove_if_present(path: &Path) -> CliResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(CliError::io(path, e)),
    }
}

// ---------------------------------------------------------------------------
// checkpoint
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
struct CheckpointSummary {
    last_revision: u64,
    dump_offset: u64,
    watermark: Option<String>,
    containers_created: bool,
    processed_events: usize,
    branches: usize,
    materialized_branches: usize,
    pending_links: usize,
    tree_nodes: usize,
}

impl CheckpointSummary {
    fn new(checkpoint: &Checkpoint, tree_nodes: usize) -> Self {
        Self {
            last_revision: checkpoint.last_revision,
            dump_offset: checkpoint.dump_offset,
            watermark: checkpoint.watermark.map(|w| w.to_string()),
            containers_created: checkpoint.containers_created,
            processed_events: checkpoint.processed.len(),
            branches: checkpoint.branches.len(),
            materialized_branches: checkpoint
                .branches
                .iter()
                .filter(|b| b.is_materialized())
                .count(),
            pending_links: checkpoint.pending_links.len(),
            tree_nodes,
        }
    }
}
