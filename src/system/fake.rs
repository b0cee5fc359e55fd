//! In-memory capabilities for tests.

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use super::{ImageBuilder, PackageUpgrade, RootDetector, Signer, UkiInputs, VolumeManager};
use crate::error::{BuildError, Error, Result};
use crate::interrupt::InterruptFlag;

/// Sub-volumes are paths in a set; "mounting" only records the call.
#[derive(Debug, Default)]
pub struct FakeVolumes {
    pub root_options: String,
    /// Returned instead of `root_options` from the second query on.
    pub later_root_options: Option<String>,
    pub root_option_reads: RefCell<usize>,
    pub subvolumes: RefCell<BTreeSet<PathBuf>>,
    pub mounted: RefCell<BTreeSet<PathBuf>>,
    pub undeletable: BTreeSet<PathBuf>,
    pub deleted: RefCell<Vec<PathBuf>>,
    pub snapshots: RefCell<Vec<(PathBuf, PathBuf)>>,
    pub mount_calls: RefCell<usize>,
}

impl FakeVolumes {
    /// Live root mounted from `subvolume`.
    pub fn booted_from(subvolume: &str) -> Self {
        Self {
            root_options: format!("rw,relatime,ssd,space_cache=v2,subvolid=256,subvol=/{}", subvolume),
            ..Self::default()
        }
    }

    pub fn add_subvolume(&self, path: PathBuf) {
        fs::create_dir_all(&path).unwrap();
        self.subvolumes.borrow_mut().insert(path);
    }

    pub fn has_subvolume(&self, path: &Path) -> bool {
        self.subvolumes.borrow().contains(path)
    }
}

impl VolumeManager for FakeVolumes {
    fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        Ok(self.mounted.borrow().contains(mount_point))
    }

    fn mount_top_level(&self, _device: &Path, mount_point: &Path) -> Result<()> {
        *self.mount_calls.borrow_mut() += 1;
        self.mounted.borrow_mut().insert(mount_point.to_path_buf());
        Ok(())
    }

    fn mount_subvolume(&self, _device: &Path, _subvolume: &str, mount_point: &Path) -> Result<()> {
        self.mounted.borrow_mut().insert(mount_point.to_path_buf());
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        self.mounted.borrow_mut().remove(mount_point);
        Ok(())
    }

    fn is_subvolume(&self, path: &Path) -> bool {
        self.subvolumes.borrow().contains(path)
    }

    fn snapshot(&self, source: &Path, dest: &Path) -> Result<()> {
        self.snapshots
            .borrow_mut()
            .push((source.to_path_buf(), dest.to_path_buf()));
        self.add_subvolume(dest.to_path_buf());
        Ok(())
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        if self.undeletable.contains(path) {
            return Err(Error::tool("btrfs", "Device or resource busy"));
        }
        self.subvolumes.borrow_mut().remove(path);
        let _ = fs::remove_dir_all(path);
        self.deleted.borrow_mut().push(path.to_path_buf());
        Ok(())
    }

    fn root_mount_options(&self) -> Result<String> {
        let mut reads = self.root_option_reads.borrow_mut();
        *reads += 1;
        match &self.later_root_options {
            Some(later) if *reads > 1 => Ok(later.clone()),
            _ => Ok(self.root_options.clone()),
        }
    }
}

/// Records inputs; writes the output unless told not to.
#[derive(Debug, Default)]
pub struct FakeImageBuilder {
    pub skip_output: bool,
    pub fail: bool,
    pub calls: RefCell<Vec<UkiInputs>>,
    /// os-release content seen during the build (the file is gone afterwards).
    pub os_release_seen: RefCell<Vec<String>>,
}

impl ImageBuilder for FakeImageBuilder {
    fn build_image(&self, inputs: &UkiInputs) -> Result<()> {
        self.calls.borrow_mut().push(inputs.clone());
        self.os_release_seen
            .borrow_mut()
            .push(fs::read_to_string(&inputs.os_release).unwrap_or_default());
        if self.fail {
            return Err(Error::Build(BuildError::ToolFailed {
                tool: "ukify".into(),
                reason: "exit status: 1".into(),
            }));
        }
        if !self.skip_output {
            fs::write(&inputs.output, b"MZ").unwrap();
        }
        Ok(())
    }
}

#[derive(Debug)]
pub struct FakeDetector(pub &'static str);

impl RootDetector for FakeDetector {
    fn root_command_line(&self, subvolume: &str) -> Result<String> {
        Ok(format!("{} rootflags=subvol={}", self.0, subvolume))
    }
}

#[derive(Debug, Default)]
pub struct FakeUpgrade {
    pub fail: bool,
    /// Raised while the upgrade "runs", like a signal arriving mid-step.
    pub raise: Option<&'static InterruptFlag>,
    pub roots: RefCell<Vec<PathBuf>>,
}

impl PackageUpgrade for FakeUpgrade {
    fn upgrade(&self, new_root: &Path) -> Result<()> {
        self.roots.borrow_mut().push(new_root.to_path_buf());
        if let Some(flag) = self.raise {
            flag.raise();
        }
        if self.fail {
            return Err(Error::tool("arch-chroot", "pacman failed"));
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct FakeSigner {
    pub signed: RefCell<Vec<PathBuf>>,
}

impl Signer for FakeSigner {
    fn sign(&self, artifact: &Path) -> Result<()> {
        self.signed.borrow_mut().push(artifact.to_path_buf());
        Ok(())
    }
}
