//! Host tool validation.
//!
//! Checks that the external tools an upgrade shells out to are installed.

use super::CheckResult;
use crate::process::which;

/// Required host tools with their install suggestions.
const REQUIRED_TOOLS: &[(&str, &str, &str)] = &[
    ("btrfs", "Snapshot and delete subvolumes", "pacman -S btrfs-progs"),
    ("findmnt", "Inspect the root mount", "pacman -S util-linux"),
    ("mount", "Mount subvolumes", "pacman -S util-linux"),
    ("umount", "Unmount the new root", "pacman -S util-linux"),
    ("ukify", "Build Unified Kernel Images", "pacman -S systemd-ukify"),
    ("arch-chroot", "Upgrade packages in the new root", "pacman -S arch-install-scripts"),
];

/// Check that all required host tools are installed.
pub fn check_host_tools() -> Vec<CheckResult> {
    REQUIRED_TOOLS
        .iter()
        .map(|(tool, purpose, install)| check_tool(tool, purpose, install))
        .collect()
}

fn check_tool(tool: &str, purpose: &str, install_cmd: &str) -> CheckResult {
    match which(tool) {
        Some(path) => CheckResult::pass(
            format!("{} tool", tool),
            format!("Found at {} ({})", path.display(), purpose),
        ),
        None => CheckResult::fail(
            format!("{} tool", tool),
            format!("Not found (needed for: {})", purpose),
            install_cmd,
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_host_tools_returns_results() {
        let results = check_host_tools();
        assert_eq!(results.len(), REQUIRED_TOOLS.len());
    }

    #[test]
    fn test_missing_tool_fails_with_suggestion() {
        let result = check_tool("definitely_not_a_real_command_12345", "testing", "install it");
        assert!(!result.passed);
        assert_eq!(result.suggestion.as_deref(), Some("install it"));
    }

    #[test]
    fn test_present_tool_passes() {
        let result = check_tool("sh", "testing", "n/a");
        assert!(result.passed);
    }
}
