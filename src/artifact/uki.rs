//! UKI (Unified Kernel Image) builder for generations.
//!
//! Each generation boots from its own UKI at `EFI/Linux/arch-<id>.efi`, which
//! systemd-boot discovers and lists. The builder handles:
//! - Input validation (kernel, initramfs, os-release in the new root)
//! - Cmdline construction: detected root clause + `rw` + hardening params
//! - Generation branding (the id in `PRETTY_NAME`, shown in the boot menu)
//!
//! Nothing outside the one output file is written. The branded os-release
//! lives in a fresh temporary file that is removed on every exit path.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;

use crate::config::Config;
use crate::error::{BuildError, Error, Precondition, Result};
use crate::generation::GenerationId;
use crate::system::{ImageBuilder, RootDetector, UkiInputs};

/// Relative locations of os-release, in lookup order.
const OS_RELEASE_PATHS: &[&str] = &["etc/os-release", "usr/lib/os-release"];

pub struct UkiBuilder<'a> {
    config: &'a Config,
    images: &'a dyn ImageBuilder,
    detector: &'a dyn RootDetector,
}

impl<'a> UkiBuilder<'a> {
    pub fn new(
        config: &'a Config,
        images: &'a dyn ImageBuilder,
        detector: &'a dyn RootDetector,
    ) -> Self {
        Self {
            config,
            images,
            detector,
        }
    }

    /// Build the UKI for generation `id` whose root is visible at `new_root`.
    ///
    /// # Returns
    ///
    /// Path of the written artifact.
    pub fn build(&self, id: &GenerationId, new_root: &Path, subvolume: &str) -> Result<PathBuf> {
        let kernel = self.config.kernel_path(new_root);
        if !kernel.is_file() {
            return Err(Precondition::KernelMissing(kernel).into());
        }
        let initramfs = self.config.initramfs_path(new_root);
        if !initramfs.is_file() {
            return Err(Precondition::InitramfsMissing(initramfs).into());
        }
        let os_release_src = find_os_release(new_root)
            .ok_or_else(|| Precondition::OsReleaseMissing(new_root.to_path_buf()))?;

        let cmdline = self.cmdline(subvolume)?;

        let os_release = os_release_file(&os_release_src, id)?;

        let artifact_dir = self.config.artifact_dir();
        fs::create_dir_all(&artifact_dir)
            .map_err(|e| Error::io(format!("creating {}", artifact_dir.display()), e))?;
        let output = artifact_dir.join(id.artifact_name());

        // Build next to the final path and rename over it, so an existing
        // entry for this generation survives a failed build.
        let staging = tempfile::Builder::new()
            .prefix(".arch-")
            .suffix(".efi")
            .tempfile_in(&artifact_dir)
            .map_err(|e| Error::io(format!("creating staging file in {}", artifact_dir.display()), e))?
            .into_temp_path();

        println!("  Building UKI: {}", output.display());
        let inputs = UkiInputs {
            kernel,
            initramfs,
            cmdline,
            os_release: os_release.path().to_path_buf(),
            output: staging.to_path_buf(),
        };
        self.images.build_image(&inputs)?;

        // The staging file starts out empty; a real UKI never is.
        let produced = fs::metadata(&staging).map(|m| m.len() > 0).unwrap_or(false);
        if !produced {
            return Err(BuildError::ArtifactNotProduced(output).into());
        }
        if output.exists() {
            println!("  Replacing {}", output.display());
        }
        staging
            .persist(&output)
            .map_err(|e| Error::io(format!("installing {}", output.display()), e.error))?;
        Ok(output)
    }

    /// Full kernel command line for booting `subvolume`.
    pub fn cmdline(&self, subvolume: &str) -> Result<String> {
        let root = self.detector.root_command_line(subvolume)?;
        let params = self.config.kernel_params.trim();
        if params.is_empty() {
            Ok(format!("{} rw", root))
        } else {
            Ok(format!("{} rw {}", root, params))
        }
    }
}

fn find_os_release(root: &Path) -> Option<PathBuf> {
    OS_RELEASE_PATHS
        .iter()
        .map(|rel| root.join(rel))
        .find(|path| path.is_file())
}

/// Write a branded copy of `source` to a new temporary file.
fn os_release_file(source: &Path, id: &GenerationId) -> Result<NamedTempFile> {
    let original = fs::read_to_string(source)
        .map_err(|e| Error::io(format!("reading {}", source.display()), e))?;

    let mut file = tempfile::Builder::new()
        .prefix("atomic-os-release-")
        .tempfile()
        .map_err(|e| Error::io("creating temporary os-release", e))?;
    file.write_all(brand_os_release(&original, id).as_bytes())
        .map_err(|e| Error::io("writing temporary os-release", e))?;
    file.flush()
        .map_err(|e| Error::io("writing temporary os-release", e))?;
    Ok(file)
}

/// Put the generation id into `PRETTY_NAME`, leaving every other line alone.
pub fn brand_os_release(content: &str, id: &GenerationId) -> String {
    let mut out = String::with_capacity(content.len() + 32);
    let mut branded = false;

    for line in content.lines() {
        match line.strip_prefix("PRETTY_NAME=") {
            Some(value) if !branded => {
                out.push_str(&format!("PRETTY_NAME=\"{} ({})\"\n", unquote(value), id));
                branded = true;
            }
            _ => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }

    if !branded {
        let name = content
            .lines()
            .find_map(|line| line.strip_prefix("NAME="))
            .map(unquote)
            .unwrap_or("Linux");
        out.push_str(&format!("PRETTY_NAME=\"{} ({})\"\n", name, id));
    }
    out
}

fn unquote(value: &str) -> &str {
    value.trim().trim_matches('"').trim_matches('\'')
}
