//! Generation garbage collection.
//!
//! Retention is two-tier: the booted generation is always kept and does not
//! count, then the `keep` most recent other generations are kept. Everything
//! older goes. This holds even when the booted generation is old (the user
//! picked an older entry in the boot menu) or does not follow the
//! `root-<id>` naming at all.
//!
//! Dry runs compute the same [`RetentionPlan`] and stop before deleting.

use std::fs;
use std::io;
use std::path::Path;

use crate::config::Config;
use crate::error::Result;
use crate::generation::{same_subvolume, Generation, Registry};
use crate::interrupt::{InterruptFlag, INTERRUPTED};
use crate::mount::ensure_mounted;
use crate::system::VolumeManager;

/// How the generation list was split.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPlan {
    /// The booted generation, when it is on the list.
    pub current: Option<Generation>,
    /// Kept non-current generations, newest first.
    pub keep: Vec<Generation>,
    /// Generations to delete, newest first.
    pub delete: Vec<Generation>,
}

impl RetentionPlan {
    /// Every kept generation, current first.
    pub fn kept(&self) -> impl Iterator<Item = &Generation> {
        self.current.iter().chain(self.keep.iter())
    }
}

/// Split newest-first `generations` into keep and delete sets.
pub fn plan_retention(generations: &[Generation], current: &str, keep: usize) -> RetentionPlan {
    let mut plan = RetentionPlan::default();
    let mut others = 0;

    for generation in generations {
        if generation.is_current(current) {
            plan.current = Some(generation.clone());
            continue;
        }
        others += 1;
        if others <= keep {
            plan.keep.push(generation.clone());
        } else {
            plan.delete.push(generation.clone());
        }
    }
    plan
}

/// A generation that could not be fully removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionWarning {
    pub generation: String,
    pub reason: String,
}

/// Outcome of one gc run.
#[derive(Debug, Clone, Default)]
pub struct GcSummary {
    pub dry_run: bool,
    pub plan: RetentionPlan,
    pub kept: usize,
    pub deleted: usize,
    pub skipped_current: usize,
    pub warnings: Vec<DeletionWarning>,
}

impl GcSummary {
    pub fn print(&self) {
        if self.dry_run {
            println!(
                "  Kept {}, would delete {}, skipped (current) {}",
                self.kept,
                self.plan.delete.len() - self.skipped_current,
                self.skipped_current
            );
        } else {
            println!(
                "  Kept {}, deleted {}, skipped (current) {}",
                self.kept, self.deleted, self.skipped_current
            );
        }
        for warning in &self.warnings {
            println!("  [WARN] {}: {}", warning.generation, warning.reason);
        }
    }
}

pub struct GarbageCollector<'a> {
    config: &'a Config,
    volumes: &'a dyn VolumeManager,
    interrupt: &'a InterruptFlag,
}

impl<'a> GarbageCollector<'a> {
    pub fn new(config: &'a Config, volumes: &'a dyn VolumeManager) -> Self {
        Self {
            config,
            volumes,
            interrupt: &INTERRUPTED,
        }
    }

    /// Stop between deletions once `flag` is raised.
    pub fn with_interrupt(mut self, flag: &'a InterruptFlag) -> Self {
        self.interrupt = flag;
        self
    }

    /// Apply retention, keeping `keep` generations besides the booted one.
    ///
    /// The caller must hold the system lock.
    pub fn collect(&self, keep: usize, dry_run: bool) -> Result<GcSummary> {
        let registry = Registry::new(self.config, self.volumes);
        let current = registry.current_subvolume()?;

        ensure_mounted(
            self.volumes,
            &self.config.mapped_device(),
            &self.config.btrfs_mount,
        )?;

        let generations = registry.list_generations();
        let plan = plan_retention(&generations, &current, keep);

        let mut summary = GcSummary {
            dry_run,
            kept: plan.kept().count(),
            ..GcSummary::default()
        };

        for generation in plan.kept() {
            let tag = if plan.current.as_ref() == Some(generation) {
                " (current)"
            } else {
                ""
            };
            println!("  [KEEP] {}{}", generation.id, tag);
        }

        for generation in &plan.delete {
            self.interrupt.check()?;
            // The root may have been reported differently since the plan was
            // made; ask again before anything is removed.
            let live = registry.current_subvolume()?;
            if same_subvolume(&generation.subvolume, &live) {
                println!("  [SKIP] {} is the booted generation", generation.id);
                summary.skipped_current += 1;
                continue;
            }

            if dry_run {
                println!("  [DRY-RUN] would delete {}", generation.id);
                continue;
            }

            match self.delete(generation) {
                Ok(()) => {
                    println!("  [DELETE] {}", generation.id);
                    summary.deleted += 1;
                }
                Err(warning) => {
                    log::warn!("{}: {}", warning.generation, warning.reason);
                    summary.warnings.push(warning);
                }
            }
        }

        summary.plan = plan;
        Ok(summary)
    }

    /// Remove one generation's UKI, then its sub-volume.
    ///
    /// The sub-volume is only touched once the boot entry is gone, so a
    /// failure never leaves a boot entry pointing at a deleted root.
    fn delete(&self, generation: &Generation) -> std::result::Result<(), DeletionWarning> {
        let warn = |reason: String| DeletionWarning {
            generation: generation.id.to_string(),
            reason,
        };

        match fs::remove_file(&generation.artifact) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(warn(format!(
                    "cannot remove {}: {}",
                    generation.artifact.display(),
                    e
                )))
            }
        }

        let subvolume = self.config.btrfs_mount.join(&generation.subvolume);
        if exists_as_subvolume(self.volumes, &subvolume) {
            self.volumes
                .delete_subvolume(&subvolume)
                .map_err(|e| warn(format!("cannot delete subvolume: {}", e)))?;
        }
        Ok(())
    }
}

fn exists_as_subvolume(volumes: &dyn VolumeManager, path: &Path) -> bool {
    path.exists() && volumes.is_subvolume(path)
}
