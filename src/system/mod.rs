//! Host capabilities.
//!
//! Everything that touches real storage or runs a privileged tool sits behind
//! one of these traits, so the registry, UKI builder, gc and upgrade sequence
//! can run against in-memory fakes in tests.
//!
//! - `btrfs` - [`VolumeManager`] backed by `btrfs`, `mount` and `findmnt`
//! - `ukify` - [`ImageBuilder`] backed by systemd's `ukify`
//! - `rootdev` - [`RootDetector`] that works out LUKS/LVM/plain roots
//! - `hooks` - package upgrade inside a chroot and Secure Boot signing
//! - `fstab` - atomic rewrite of the root entry's `subvol=`

pub mod btrfs;
pub mod fstab;
pub mod hooks;
pub mod rootdev;
pub mod ukify;

#[cfg(test)]
pub(crate) mod fake;

use std::path::{Path, PathBuf};

use crate::error::Result;

pub use btrfs::BtrfsVolumes;
pub use hooks::{ChrootPacman, Sbctl};
pub use rootdev::SystemDetector;
pub use ukify::Ukify;

/// Sub-volume and mount operations on the root filesystem.
pub trait VolumeManager {
    fn is_mounted(&self, mount_point: &Path) -> Result<bool>;

    /// Mount the top-level volume (subvolid=5) of `device` at `mount_point`.
    fn mount_top_level(&self, device: &Path, mount_point: &Path) -> Result<()>;

    /// Mount the named sub-volume of `device` at `mount_point`.
    fn mount_subvolume(&self, device: &Path, subvolume: &str, mount_point: &Path) -> Result<()>;

    fn unmount(&self, mount_point: &Path) -> Result<()>;

    /// True if `path` is a real btrfs sub-volume (not just a directory).
    fn is_subvolume(&self, path: &Path) -> bool;

    fn snapshot(&self, source: &Path, dest: &Path) -> Result<()>;

    fn delete_subvolume(&self, path: &Path) -> Result<()>;

    /// Mount options of the live `/`, as reported by the kernel.
    fn root_mount_options(&self) -> Result<String>;
}

/// Inputs for one UKI build.
#[derive(Debug, Clone)]
pub struct UkiInputs {
    pub kernel: PathBuf,
    pub initramfs: PathBuf,
    pub cmdline: String,
    pub os_release: PathBuf,
    pub output: PathBuf,
}

/// The tool that assembles a UKI.
pub trait ImageBuilder {
    fn build_image(&self, inputs: &UkiInputs) -> Result<()>;
}

/// Works out how the kernel finds and unlocks the root device.
pub trait RootDetector {
    /// Command-line clause (`root=...`, `rd.luks.name=...`, `rootflags=...`)
    /// for booting into `subvolume`.
    fn root_command_line(&self, subvolume: &str) -> Result<String>;
}

/// Package upgrade run inside the new generation.
pub trait PackageUpgrade {
    fn upgrade(&self, new_root: &Path) -> Result<()>;
}

/// Secure Boot signing of a finished UKI.
pub trait Signer {
    fn sign(&self, artifact: &Path) -> Result<()>;
}

/// The full set of capabilities an upgrade needs.
#[derive(Clone, Copy)]
pub struct Host<'a> {
    pub volumes: &'a dyn VolumeManager,
    pub images: &'a dyn ImageBuilder,
    pub detector: &'a dyn RootDetector,
    pub upgrader: &'a dyn PackageUpgrade,
    pub signer: &'a dyn Signer,
}

/// Capabilities backed by the real system tools.
#[derive(Debug, Default)]
pub struct SystemTools {
    pub volumes: BtrfsVolumes,
    pub images: Ukify,
    pub detector: SystemDetector,
    pub upgrader: ChrootPacman,
    pub signer: Sbctl,
}

impl SystemTools {
    pub fn host(&self) -> Host<'_> {
        Host {
            volumes: &self.volumes,
            images: &self.images,
            detector: &self.detector,
            upgrader: &self.upgrader,
            signer: &self.signer,
        }
    }
}
