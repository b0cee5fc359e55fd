//! Mount helpers for the btrfs volume.
//!
//! Sub-volumes are addressed by path under the top-level mount, so gc and the
//! upgrade sequence first make sure that mount exists.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::system::VolumeManager;

/// Mount the top-level volume of `device` at `mount_point` unless it already is.
pub fn ensure_mounted(volumes: &dyn VolumeManager, device: &Path, mount_point: &Path) -> Result<()> {
    if volumes.is_mounted(mount_point)? {
        log::debug!("{} already mounted", mount_point.display());
        return Ok(());
    }

    fs::create_dir_all(mount_point)
        .map_err(|e| Error::io(format!("creating {}", mount_point.display()), e))?;
    volumes.mount_top_level(device, mount_point)?;
    println!("  Mounted {} at {}", device.display(), mount_point.display());
    Ok(())
}

/// True only if `name` exists under `mount_point` and btrfs agrees it is a
/// sub-volume. A stale plain directory with the right name does not count.
pub fn validate_subvolume(volumes: &dyn VolumeManager, name: &str, mount_point: &Path) -> bool {
    let path = mount_point.join(name.trim_start_matches('/'));
    path.exists() && volumes.is_subvolume(&path)
}

/// A sub-volume mounted for the duration of a scope.
pub struct MountGuard<'a> {
    volumes: &'a dyn VolumeManager,
    mount_point: PathBuf,
}

impl<'a> MountGuard<'a> {
    /// Mount `subvolume` of `device` at `mount_point`.
    pub fn mount(
        volumes: &'a dyn VolumeManager,
        device: &Path,
        subvolume: &str,
        mount_point: &Path,
    ) -> Result<Self> {
        fs::create_dir_all(mount_point)
            .map_err(|e| Error::io(format!("creating {}", mount_point.display()), e))?;
        volumes.mount_subvolume(device, subvolume, mount_point)?;
        Ok(Self {
            volumes,
            mount_point: mount_point.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.mount_point
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.volumes.unmount(&self.mount_point) {
            log::warn!("failed to unmount {}: {}", self.mount_point.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::fake::FakeVolumes;
    use tempfile::TempDir;

    #[test]
    fn test_ensure_mounted_is_idempotent() {
        let temp = TempDir::new().unwrap();
        let mount_point = temp.path().join("run/atomic/temp_root");
        let volumes = FakeVolumes::default();

        ensure_mounted(&volumes, Path::new("/dev/mapper/root"), &mount_point).unwrap();
        ensure_mounted(&volumes, Path::new("/dev/mapper/root"), &mount_point).unwrap();

        assert!(mount_point.is_dir());
        assert_eq!(*volumes.mount_calls.borrow(), 1);
    }

    #[test]
    fn test_validate_subvolume() {
        let temp = TempDir::new().unwrap();
        let volumes = FakeVolumes::default();
        volumes.add_subvolume(temp.path().join("root-1"));
        fs::create_dir_all(temp.path().join("root-2")).unwrap();

        assert!(validate_subvolume(&volumes, "root-1", temp.path()));
        assert!(validate_subvolume(&volumes, "/root-1", temp.path()));
        // Directory exists but is not a sub-volume.
        assert!(!validate_subvolume(&volumes, "root-2", temp.path()));
        assert!(!validate_subvolume(&volumes, "root-3", temp.path()));
    }

    #[test]
    fn test_mount_guard_unmounts_on_drop() {
        let temp = TempDir::new().unwrap();
        let mount_point = temp.path().join("newroot");
        let volumes = FakeVolumes::default();

        {
            let guard =
                MountGuard::mount(&volumes, Path::new("/dev/sda2"), "root-1", &mount_point).unwrap();
            assert_eq!(guard.path(), mount_point);
            assert!(volumes.is_mounted(&mount_point).unwrap());
        }
        assert!(!volumes.is_mounted(&mount_point).unwrap());
    }
}
