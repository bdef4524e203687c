//! Errors raised while loading or saving a `DecryptionConfig`

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// Reading or writing the config file failed
    #[error("config file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed keyrelay config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("cannot encode keyrelay config: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// An environment override could not be parsed
    #[error("bad override: {0}")]
    InvalidValue(String),

    #[error("invalid engine settings: {0}")]
    ValidationFailed(String),
}

impl ConfigError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io { path: path.into(), source }
    }
}
