//! Error types for the CLAP host.

use std::path::PathBuf;
use thiserror::Error;

/// Which step of the load sequence failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadStage {
    Scanning,
    Opening,
    Entry,
    Factory,
    Descriptor,
    Instantiation,
    Initialization,
    Activation,
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LoadStage::Scanning => write!(f, "scanning"),
            LoadStage::Opening => write!(f, "opening library"),
            LoadStage::Entry => write!(f, "initializing entry"),
            LoadStage::Factory => write!(f, "getting factory"),
            LoadStage::Descriptor => write!(f, "reading descriptor"),
            LoadStage::Instantiation => write!(f, "creating instance"),
            LoadStage::Initialization => write!(f, "initializing plugin"),
            LoadStage::Activation => write!(f, "activating"),
        }
    }
}

#[derive(Error, Debug)]
pub enum HostError {
    #[error("Plugin load failed at {stage} stage: {path}\n  Reason: {reason}")]
    LoadFailed {
        path: PathBuf,
        stage: LoadStage,
        reason: String,
    },

    #[error("Plugin process returned an error")]
    ProcessError,

    #[error("Plugin is not an audio effect (no audio input): {id}")]
    NotAnEffect { id: String },

    #[error("Plugin not found: {id}")]
    NotFound { id: String },

    #[error("Plugin index {index} out of range (0..{count})")]
    OutOfRange { index: i32, count: usize },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HostError>;

pub(crate) fn load_failed(
    path: &std::path::Path,
    stage: LoadStage,
    reason: impl Into<String>,
) -> HostError {
    HostError::LoadFailed {
        path: path.to_path_buf(),
        stage,
        reason: reason.into(),
    }
}
