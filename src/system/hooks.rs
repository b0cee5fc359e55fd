//! Package upgrade and Secure Boot signing.
//!
//! Both are treated as opaque steps: success lets the upgrade continue,
//! failure aborts it.

use std::path::Path;

use super::{PackageUpgrade, Signer};
use crate::error::Result;
use crate::process::{exists, Cmd};

/// `pacman -Syu` inside the new generation via `arch-chroot`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ChrootPacman;

impl PackageUpgrade for ChrootPacman {
    fn upgrade(&self, new_root: &Path) -> Result<()> {
        Cmd::new("arch-chroot")
            .arg_path(new_root)
            .args(["pacman", "-Syu", "--noconfirm"])
            .error_msg("package upgrade in chroot failed")
            .run_interactive()
    }
}

/// Signs UKIs with `sbctl`. Hosts without sbctl skip signing.
#[derive(Debug, Default, Clone, Copy)]
pub struct Sbctl;

impl Signer for Sbctl {
    fn sign(&self, artifact: &Path) -> Result<()> {
        if !exists("sbctl") {
            println!("  [SKIP] Secure Boot signing (sbctl not installed)");
            return Ok(());
        }
        Cmd::new("sbctl")
            .arg("sign")
            .arg_path(artifact)
            .error_msg(format!("signing {} failed", artifact.display()))
            .run()?;
        println!("  Signed {}", artifact.display());
        Ok(())
    }
}
