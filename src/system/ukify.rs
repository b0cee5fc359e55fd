//! [`ImageBuilder`] backed by systemd's `ukify`.
//!
//! UKIs combine kernel + initramfs + cmdline + os-release into a single PE
//! binary that systemd-boot discovers under `EFI/Linux/`.

use super::{ImageBuilder, UkiInputs};
use crate::error::{BuildError, Error, Result};
use crate::process::Cmd;

#[derive(Debug, Default, Clone, Copy)]
pub struct Ukify;

impl Ukify {
    fn command(inputs: &UkiInputs) -> Cmd {
        Cmd::new("ukify")
            .arg("build")
            .arg(format!("--linux={}", inputs.kernel.display()))
            .arg(format!("--initrd={}", inputs.initramfs.display()))
            .arg(format!("--cmdline={}", inputs.cmdline))
            .arg(format!("--os-release=@{}", inputs.os_release.display()))
            .arg(format!("--output={}", inputs.output.display()))
    }
}

impl ImageBuilder for Ukify {
    fn build_image(&self, inputs: &UkiInputs) -> Result<()> {
        Self::command(inputs).run().map_err(|e| match e {
            Error::Tool { program, reason } => Error::Build(BuildError::ToolFailed {
                tool: program,
                reason,
            }),
            other => other,
        })?;
        Ok(())
    }
}
