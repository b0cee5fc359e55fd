//! Enumerates generations and works out which one is booted.
//!
//! The ESP is the source of truth for which generations exist. A sub-volume
//! without a UKI, or a UKI whose sub-volume is gone, is normal after an
//! interrupted run and must not break enumeration.

use std::fs;
use std::path::{Path, PathBuf};

use super::{Generation, GenerationId, SUBVOLUME_PREFIX};
use crate::config::Config;
use crate::error::{Precondition, Result};
use crate::system::VolumeManager;

pub struct Registry<'a> {
    artifact_dir: PathBuf,
    volumes: &'a dyn VolumeManager,
}

impl<'a> Registry<'a> {
    pub fn new(config: &Config, volumes: &'a dyn VolumeManager) -> Self {
        Self {
            artifact_dir: config.artifact_dir(),
            volumes,
        }
    }

    pub fn artifact_dir(&self) -> &Path {
        &self.artifact_dir
    }

    /// All generations with a boot artifact, newest first.
    ///
    /// A missing or unreadable directory is an empty list.
    pub fn list_generations(&self) -> Vec<Generation> {
        let entries = match fs::read_dir(&self.artifact_dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::debug!("cannot read {}: {}", self.artifact_dir.display(), e);
                return Vec::new();
            }
        };

        let mut ids: Vec<GenerationId> = entries
            .flatten()
            .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
            .filter_map(|entry| {
                GenerationId::from_artifact_name(entry.file_name().to_str()?)
            })
            .collect();

        ids.sort_by(|a, b| b.cmp(a));
        ids.into_iter()
            .map(|id| Generation::new(id, &self.artifact_dir))
            .collect()
    }

    /// Sub-volume mounted at `/`, leading `/` removed.
    ///
    /// Reported as-is: it does not have to follow the `root-<id>` scheme (a
    /// fresh install usually boots from `@`).
    pub fn current_subvolume(&self) -> Result<String> {
        let options = self.volumes.root_mount_options()?;
        subvolume_from_options(&options)
            .ok_or_else(|| Precondition::CurrentGenerationUnknown.into())
    }

    /// `root-<id>` sub-volumes under `top_level` that have no boot artifact.
    ///
    /// These are left behind by interrupted upgrades. They are reported, never
    /// deleted automatically.
    pub fn orphan_subvolumes(&self, top_level: &Path) -> Vec<String> {
        let known: Vec<String> = self
            .list_generations()
            .into_iter()
            .map(|g| g.subvolume)
            .collect();

        let Ok(entries) = fs::read_dir(top_level) else {
            return Vec::new();
        };

        let mut orphans: Vec<String> = entries
            .flatten()
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|name| name.starts_with(SUBVOLUME_PREFIX))
            .filter(|name| GenerationId::from_subvolume_name(name).is_some())
            .filter(|name| !known.contains(name))
            .filter(|name| self.volumes.is_subvolume(&top_level.join(name)))
            .collect();
        orphans.sort();
        orphans
    }
}

/// Extract `subvol=` from a mount option string.
pub fn subvolume_from_options(options: &str) -> Option<String> {
    options
        .split(',')
        .find_map(|opt| opt.trim().strip_prefix("subvol="))
        .map(|v| v.trim_start_matches('/').to_string())
        .filter(|v| !v.is_empty())
}
