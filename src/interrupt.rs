//! SIGINT/SIGTERM handling.
//!
//! The signal handler only raises a flag. Long-running steps check it at
//! step boundaries and return [`Error::Interrupted`], so the new root is
//! unmounted, temporary files are removed and the lock is released by the
//! same guards that handle any other failure.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{Error, Result};

/// Process-wide flag raised by the signal handler.
pub static INTERRUPTED: InterruptFlag = InterruptFlag::new();

#[derive(Debug, Default)]
pub struct InterruptFlag(AtomicBool);

impl InterruptFlag {
    pub const fn new() -> Self {
        Self(AtomicBool::new(false))
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::Relaxed);
    }

    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    /// Fail if an interrupt arrived since the process started.
    pub fn check(&self) -> Result<()> {
        if self.is_raised() {
            return Err(Error::Interrupted);
        }
        Ok(())
    }
}

/// Route SIGINT and SIGTERM to [`INTERRUPTED`].
pub fn install() {
    if let Err(e) = ctrlc::set_handler(|| {
        eprintln!("Interrupted, stopping after the current step...");
        INTERRUPTED.raise();
    }) {
        log::warn!("cannot install signal handler: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_starts_clear() {
        let flag = InterruptFlag::new();
        assert!(!flag.is_raised());
        assert!(flag.check().is_ok());
    }

    #[test]
    fn test_raised_flag_fails_check() {
        let flag = InterruptFlag::new();
        flag.raise();
        assert!(matches!(flag.check(), Err(Error::Interrupted)));
    }
}
