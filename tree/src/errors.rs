use std::path::PathBuf;

use thiserror::Error;

/// Errors emitted while configuring, scanning or watching the served tree.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unable to list {0}: {1}")]
    ListDir(PathBuf, std::io::Error),

    #[error("unable to stat {0}: {1}")]
    Stat(PathBuf, std::io::Error),

    #[error("unable to watch {0}: {1}")]
    Watch(PathBuf, notify::Error),

    #[error("invalid pattern {0:?}: {1}")]
    InvalidPattern(String, regex::Error),

    #[error("rule set must end with a catch-all rule (empty pattern)")]
    MissingCatchAll,

    #[error("background scan task failed: {0}")]
    ScanTask(#[from] tokio::task::JoinError),
}
