//! Error taxonomy for the generation lifecycle.
//!
//! Every fatal condition maps to one variant here so callers (and tests) can
//! tell a missing kernel from a failed build from lock contention. Non-fatal
//! deletion problems are reported as data in [`crate::gc::GcSummary`] instead.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("another upgrade or gc is already running (lock held: {})", path.display())]
    AlreadyRunning { path: PathBuf },

    #[error("precondition not met: {0}")]
    Precondition(#[from] Precondition),

    #[error("UKI build failed: {0}")]
    Build(#[from] BuildError),

    #[error("{program} failed: {reason}")]
    Tool { program: String, reason: String },

    #[error("fstab update failed: {0}")]
    Fstab(String),

    #[error("interrupted")]
    Interrupted,

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// Wrap an I/O error with a description of what was being attempted.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Error::Io {
            context: context.into(),
            source,
        }
    }

    pub fn tool(program: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Tool {
            program: program.into(),
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{} is not trusted: {reason}", path.display())]
    UntrustedSource { path: PathBuf, reason: String },

    #[error("{}:{line}: {reason}", path.display())]
    Malformed {
        path: PathBuf,
        line: usize,
        key: String,
        reason: String,
    },

    #[error("{field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum Precondition {
    #[error("kernel image not found: {}", .0.display())]
    KernelMissing(PathBuf),

    #[error("initramfs not found: {}", .0.display())]
    InitramfsMissing(PathBuf),

    #[error("no os-release in {}", .0.display())]
    OsReleaseMissing(PathBuf),

    #[error("{0} is not a valid btrfs subvolume")]
    InvalidSubvolume(String),

    #[error("cannot determine the subvolume mounted at / (refusing to guess)")]
    CurrentGenerationUnknown,

    #[error("generation {0} already exists")]
    GenerationExists(String),

    #[error("invalid generation id {0:?}")]
    InvalidGenerationId(String),

    #[error("preflight checks failed: {0}")]
    PreflightFailed(String),
}

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("{tool} exited unsuccessfully: {reason}")]
    ToolFailed { tool: String, reason: String },

    #[error("build reported success but {} does not exist", .0.display())]
    ArtifactNotProduced(PathBuf),
}
