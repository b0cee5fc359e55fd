//! [`VolumeManager`] backed by btrfs-progs and util-linux.

use std::path::Path;

use super::VolumeManager;
use crate::error::{Error, Result};
use crate::process::Cmd;

/// Talks to the real btrfs filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct BtrfsVolumes;

impl VolumeManager for BtrfsVolumes {
    fn is_mounted(&self, mount_point: &Path) -> Result<bool> {
        // findmnt exits 1 when nothing is mounted at the target
        let result = Cmd::new("findmnt")
            .args(["-n", "--mountpoint"])
            .arg_path(mount_point)
            .allow_fail()
            .run()?;
        Ok(result.success())
    }

    fn mount_top_level(&self, device: &Path, mount_point: &Path) -> Result<()> {
        Cmd::new("mount")
            .args(["-t", "btrfs", "-o", "subvolid=5"])
            .arg_path(device)
            .arg_path(mount_point)
            .error_msg(format!("cannot mount {}", device.display()))
            .run()?;
        Ok(())
    }

    fn mount_subvolume(&self, device: &Path, subvolume: &str, mount_point: &Path) -> Result<()> {
        Cmd::new("mount")
            .args(["-t", "btrfs", "-o"])
            .arg(format!("subvol={}", subvolume))
            .arg_path(device)
            .arg_path(mount_point)
            .error_msg(format!("cannot mount subvolume {}", subvolume))
            .run()?;
        Ok(())
    }

    fn unmount(&self, mount_point: &Path) -> Result<()> {
        Cmd::new("umount")
            .arg("-R")
            .arg_path(mount_point)
            .run()?;
        Ok(())
    }

    fn is_subvolume(&self, path: &Path) -> bool {
        Cmd::new("btrfs")
            .args(["subvolume", "show"])
            .arg_path(path)
            .allow_fail()
            .run()
            .map(|r| r.success())
            .unwrap_or(false)
    }

    fn snapshot(&self, source: &Path, dest: &Path) -> Result<()> {
        Cmd::new("btrfs")
            .args(["subvolume", "snapshot"])
            .arg_path(source)
            .arg_path(dest)
            .error_msg(format!("snapshot of {} failed", source.display()))
            .run()?;
        Ok(())
    }

    fn delete_subvolume(&self, path: &Path) -> Result<()> {
        Cmd::new("btrfs")
            .args(["subvolume", "delete"])
            .arg_path(path)
            .run()?;
        Ok(())
    }

    fn root_mount_options(&self) -> Result<String> {
        let result = Cmd::new("findmnt")
            .args(["-n", "-o", "OPTIONS", "/"])
            .run()?;
        let options = result.stdout.trim();
        if options.is_empty() {
            return Err(Error::tool("findmnt", "no mount options reported for /"));
        }
        Ok(options.to_string())
    }
}
