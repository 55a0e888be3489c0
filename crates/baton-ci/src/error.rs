//! Errors raised while running external commands or loading pipeline
//! configuration.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("command `{name}` is empty")]
    EmptyCommand { name: String },

    #[error("failed to start `{name}`: {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{name}` timed out after {secs}s")]
    Timeout { name: String, secs: u64 },

    #[error("i/o error while running `{name}`: {source}")]
    Io {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{name}` printed a malformed artifact line: {line:?}")]
    MalformedArtifact { name: String, line: String },

    #[error("cannot read pipeline config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid pipeline config: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("invalid pipeline config: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, CommandError>;
