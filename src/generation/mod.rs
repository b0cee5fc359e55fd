//! Generations: one root sub-volume plus one UKI, sharing an id.
//!
//! Naming is fixed and derived from the id:
//!
//! - sub-volume: `root-<id>` at the top level of the btrfs volume
//! - boot artifact: `<ESP>/EFI/Linux/arch-<id>.efi`
//!
//! Ids are minted as `YYYYMMDD-HHMMSS`, so reverse string order is
//! newest-first.

mod registry;

pub use registry::{subvolume_from_options, Registry};

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Precondition, Result};

pub const SUBVOLUME_PREFIX: &str = "root-";
pub const ARTIFACT_PREFIX: &str = "arch-";
pub const ARTIFACT_SUFFIX: &str = ".efi";

const ID_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Opaque, lexically sortable generation identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct GenerationId(String);

impl GenerationId {
    /// Validate an id supplied from outside (CLI, file names).
    pub fn parse(raw: &str) -> Result<Self> {
        if Self::is_valid(raw) {
            Ok(Self(raw.to_string()))
        } else {
            Err(Precondition::InvalidGenerationId(raw.to_string()).into())
        }
    }

    /// Id for a generation created now (local time).
    pub fn now() -> Self {
        Self(chrono::Local::now().format(ID_FORMAT).to_string())
    }

    fn is_valid(raw: &str) -> bool {
        !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !raw.starts_with('.')
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Recover the id from a boot artifact file name like `arch-<id>.efi`.
    pub fn from_artifact_name(name: &str) -> Option<Self> {
        let id = name
            .strip_prefix(ARTIFACT_PREFIX)?
            .strip_suffix(ARTIFACT_SUFFIX)?;
        Self::is_valid(id).then(|| Self(id.to_string()))
    }

    pub fn artifact_name(&self) -> String {
        format!("{}{}{}", ARTIFACT_PREFIX, self.0, ARTIFACT_SUFFIX)
    }

    pub fn subvolume_name(&self) -> String {
        format!("{}{}", SUBVOLUME_PREFIX, self.0)
    }

    /// Recover the id from a sub-volume name like `root-<id>`.
    pub fn from_subvolume_name(name: &str) -> Option<Self> {
        let id = name
            .trim_start_matches('/')
            .strip_prefix(SUBVOLUME_PREFIX)?;
        Self::is_valid(id).then(|| Self(id.to_string()))
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A generation as seen on the ESP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub id: GenerationId,
    pub subvolume: String,
    pub artifact: PathBuf,
}

impl Generation {
    pub fn new(id: GenerationId, artifact_dir: &Path) -> Self {
        Self {
            subvolume: id.subvolume_name(),
            artifact: artifact_dir.join(id.artifact_name()),
            id,
        }
    }

    /// Whether this generation is the one mounted as `/`.
    ///
    /// `current` is compared with any leading `/` removed, the same way
    /// findmnt and fstab spell it.
    pub fn is_current(&self, current: &str) -> bool {
        same_subvolume(&self.subvolume, current)
    }
}

/// Compare sub-volume names ignoring the leading slash.
pub fn same_subvolume(a: &str, b: &str) -> bool {
    a.trim_start_matches('/') == b.trim_start_matches('/')
}
