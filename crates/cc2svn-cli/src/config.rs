//! `cc2svn.toml` loading.
//!
//! ```toml
//! [paths]
//! vob_root = "/view/conv/vobs/project"
//! dump = "project.dump"
//! cache_dir = ".cc2svn/cache"
//! checkpoint = ".cc2svn/state.sqlite"
//! autoprops = "autoprops.conf"
//! branches = "branches.txt"
//!
//! [engine]
//! commit_window_secs = 300
//! links_branch = "main"
//!
//! [engine.retry]
//! max_attempts = 5
//!
//! [logging]
//! level = "debug"
//! format = "json"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use cc2svn_core::EngineConfig;
use serde::{Deserialize, Serialize};

use crate::error::{CliError, CliResult};

pub const DEFAULT_CONFIG_FILE: &str = "cc2svn.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    pub paths: PathsConfig,
    pub engine: EngineConfig,
    pub logging: LoggingConfig,
    pub cleartool: ClearToolConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// View directory the history roots are relative to.
    pub vob_root: PathBuf,
    pub dump: PathBuf,
    pub cache_dir: PathBuf,
    pub checkpoint: PathBuf,
    pub autoprops: Option<PathBuf>,
    /// Allow-list files, one name per line.
    pub branches: Option<PathBuf>,
    pub labels: Option<PathBuf>,
    /// Ignored path prefixes, one per line.
    pub ignored: Option<PathBuf>,
    /// Saved `lshistory` output, reused by full runs when present.
    pub history_file: Option<PathBuf>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            vob_root: PathBuf::from("."),
            dump: PathBuf::from("cc2svn.dump"),
            cache_dir: PathBuf::from(".cc2svn/cache"),
            checkpoint: PathBuf::from(".cc2svn/state.sqlite"),
            autoprops: None,
            branches: None,
            labels: None,
            ignored: None,
            history_file: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive; `RUST_LOG` overrides it.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearToolConfig {
    pub binary: PathBuf,
}

impl Default for ClearToolConfig {
    fn default() -> Self {
        Self {
            binary: PathBuf::from("cleartool"),
        }
    }
}

/// Load `path`, or `cc2svn.toml` in the working directory when no path is
/// given.  A missing file yields defaults.
pub fn load(path: Option<&Path>) -> CliResult<CliConfig> {
    let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
    if !path.exists() {
        return Ok(CliConfig::default());
    }
    let contents = fs::read_to_string(path).map_err(|e| CliError::Config {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    parse(&contents).map_err(|message| CliError::Config {
        path: path.to_path_buf(),
        message,
    })
}

fn parse(contents: &str) -> Result<CliConfig, String> {
    let config: CliConfig = toml::from_str(contents).map_err(|e| e.to_string())?;
    config.engine.validate().map_err(|e| e.to_string())?;
    Ok(config)
}
