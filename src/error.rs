use std::path::PathBuf;

use thiserror::Error;

use crate::ClassifierKind;

/// Errors raised while building a trigger. Nothing after construction fails
/// loudly: evaluation degrades to a stale cached result instead.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("failed to load classifier {path}: {message}")]
    Model { path: PathBuf, message: String },

    #[error("decision rule expects a {expected:?} classifier, pool runs {actual:?}")]
    KindMismatch {
        expected: ClassifierKind,
        actual: ClassifierKind,
    },

    #[error("invalid {field}: {message}")]
    Invalid {
        field: &'static str,
        message: String,
    },

    #[error("failed to spawn worker {slot}: {source}")]
    Spawn {
        slot: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("worker pool has been stopped")]
    Stopped,
}

impl ConfigError {
    pub fn invalid<S: Into<String>>(field: &'static str, message: S) -> Self {
        Self::Invalid {
            field,
            message: message.into(),
        }
    }

    pub fn model<P: Into<PathBuf>>(path: P, err: anyhow::Error) -> Self {
        Self::Model {
            path: path.into(),
            message: format!("{err:#}"),
        }
    }
}
