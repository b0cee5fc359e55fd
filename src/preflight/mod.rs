//! Preflight checks before an upgrade.
//!
//! Validates that the host can finish an upgrade BEFORE a snapshot is taken,
//! so a missing tool or a full ESP fails early instead of leaving a
//! half-built generation behind.
//!
//! # Checks Performed
//!
//! - **Host tools**: btrfs, findmnt, mount, umount, ukify, arch-chroot
//! - **ESP space**: room for one more UKI
//!
//! # Usage
//!
//! ```rust,ignore
//! use atomic_upgrade::preflight::PreflightChecker;
//!
//! let report = PreflightChecker::new(&config).run_all();
//! if !report.is_ok() {
//!     report.print_summary();
//!     std::process::exit(1);
//! }
//! ```

mod disk_space;
mod host_tools;

pub use disk_space::check_esp_space;
pub use host_tools::check_host_tools;

use crate::config::Config;

/// Result of a single preflight check.
#[derive(Debug, Clone)]
pub struct CheckResult {
    /// Name of the check
    pub name: String,
    /// Whether the check passed
    pub passed: bool,
    /// Human-readable message
    pub message: String,
    /// Optional suggestion for fixing the issue
    pub suggestion: Option<String>,
}

impl CheckResult {
    /// Create a passing check result.
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            message: message.into(),
            suggestion: None,
        }
    }

    /// Create a failing check result.
    pub fn fail(
        name: impl Into<String>,
        message: impl Into<String>,
        suggestion: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            passed: false,
            message: message.into(),
            suggestion: Some(suggestion.into()),
        }
    }
}

/// All preflight results for one run.
#[derive(Debug, Default)]
pub struct PreflightReport {
    pub checks: Vec<CheckResult>,
}

impl PreflightReport {
    /// Check if all preflight checks passed.
    pub fn is_ok(&self) -> bool {
        self.checks.iter().all(|c| c.passed)
    }

    /// Get all failing checks.
    pub fn errors(&self) -> Vec<&CheckResult> {
        self.checks.iter().filter(|c| !c.passed).collect()
    }

    pub fn passed_count(&self) -> usize {
        self.checks.iter().filter(|c| c.passed).count()
    }

    /// One-line description of the failures, for error messages.
    pub fn failure_summary(&self) -> String {
        self.errors()
            .iter()
            .map(|c| format!("{}: {}", c.name, c.message))
            .collect::<Vec<_>>()
            .join("; ")
    }

    /// Print a summary of the preflight checks.
    pub fn print_summary(&self) {
        println!("=== Preflight ===\n");

        for check in &self.checks {
            let status = if check.passed { "[OK]" } else { "[FAIL]" };
            println!("{} {}: {}", status, check.name, check.message);
            if let Some(suggestion) = &check.suggestion {
                println!("     Suggestion: {}", suggestion);
            }
        }

        println!();
        if self.is_ok() {
            println!(
                "All preflight checks passed ({}/{})\n",
                self.passed_count(),
                self.checks.len()
            );
        } else {
            println!(
                "Preflight checks failed: {} of {} passed\n",
                self.passed_count(),
                self.checks.len()
            );
        }
    }
}

/// Runs every preflight check against one configuration.
pub struct PreflightChecker<'a> {
    config: &'a Config,
}

impl<'a> PreflightChecker<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    pub fn run_all(&self) -> PreflightReport {
        let mut report = PreflightReport::default();
        report.checks.extend(check_host_tools());
        report.checks.push(check_esp_space(&self.config.esp));
        report
    }
}
