//! Atomic, generation-based system upgrades on btrfs.
//!
//! Every upgrade snapshots the running root into a new `root-<id>`
//! sub-volume, upgrades packages inside it, points its fstab at itself and
//! builds a Unified Kernel Image for it. The running system is never
//! modified; the new generation becomes active on the next boot, and older
//! generations stay selectable in the boot menu until garbage collected.

pub mod artifact;
pub mod config;
pub mod error;
pub mod gc;
pub mod generation;
pub mod interrupt;
pub mod lock;
pub mod mount;
pub mod preflight;
pub mod process;
pub mod system;
pub mod upgrade;

pub use error::{Error, Result};

use std::time::Instant;

/// Prints how long a named step took.
pub struct Timer {
    label: &'static str,
    start: Instant,
}

impl Timer {
    pub fn start(label: &'static str) -> Self {
        Self {
            label,
            start: Instant::now(),
        }
    }

    pub fn finish(self) {
        let secs = self.start.elapsed().as_secs_f64();
        if secs >= 60.0 {
            println!("  [{}: {:.1}m]", self.label, secs / 60.0);
        } else {
            println!("  [{}: {:.1}s]", self.label, secs);
        }
    }
}
