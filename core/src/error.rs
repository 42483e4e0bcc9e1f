use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::session_id::SessionId;

pub type Result<T> = std::result::Result<T, ShellError>;

/// Failures a session can run into while executing a command line.
///
/// The `Display` text of every variant is the exact notice written back to the
/// invoking session, so callers can report an error with `notice_line(&err)`.
#[derive(Debug, Error)]
pub enum ShellError {
    #[error("*** Error: online users are up to limit ({limit}). ***")]
    CapacityExceeded { limit: usize },
    #[error("*** Error: user #{id} does not exist yet. ***")]
    PeerNotFound { id: SessionId },
    #[error("*** Error: the pipe #{src}->#{dst} already exists. ***")]
    DuplicateLink { src: SessionId, dst: SessionId },
    #[error("*** Error: the pipe #{src}->#{dst} does not exist yet. ***")]
    LinkNotFound { src: SessionId, dst: SessionId },
    #[error("Unknown command: [{name}].")]
    ProgramNotFound { name: String },
    #[error("*** User '{name}' already exists. ***")]
    NameCollision { name: String },
    #[error("*** Error: cannot open {}: {source}. ***", .path.display())]
    Redirect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("*** Error: {context}: {source}. ***")]
    ResourceExhaustion {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl ShellError {
    pub(crate) fn resource_exhaustion(context: impl Into<String>, source: io::Error) -> Self {
        Self::ResourceExhaustion {
            context: context.into(),
            source,
        }
    }
}

/// Errors raised while loading or validating [`crate::ServerConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Notice text for `err`, newline terminated, ready for a session outbox.
pub fn notice_line(err: &ShellError) -> String {
    format!("{err}\n")
}
