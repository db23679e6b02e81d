use std::path::PathBuf;

use cc2svn_core::ConvertError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
    #[error("config error in {path}: {message}")]
    Config { path: PathBuf, message: String },

    #[error("invalid argument: {0}")]
    Argument(String),

    #[error(transparent)]
    Convert(#[from] ConvertError),

    #[error("io error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl CliError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code: 2 for usage and configuration problems, 130 for a
    /// cancelled run, 1 otherwise.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Config { .. } | Self::Argument(_) => 2,
            Self::Convert(ConvertError::Config(_)) => 2,
            Self::Convert(ConvertError::Cancelled(_)) => 130,
            _ => 1,
        }
    }
}

pub type CliResult<T> = Result<T, CliError>;
