//! Free space check for the ESP.
//!
//! Every generation adds one UKI (kernel + initramfs, typically 60-150 MB) to
//! a partition that is often only a few hundred MB.

use std::path::Path;

use super::CheckResult;
use crate::process::Cmd;

/// Minimum free space on the ESP in bytes (256 MiB).
const MIN_ESP_FREE_BYTES: u64 = 256 * 1024 * 1024;

/// Check that the ESP can take another UKI.
pub fn check_esp_space(esp: &Path) -> CheckResult {
    match available_space(esp) {
        Some(available) => {
            let available_mb = available / (1024 * 1024);
            let required_mb = MIN_ESP_FREE_BYTES / (1024 * 1024);

            if available >= MIN_ESP_FREE_BYTES {
                CheckResult::pass(
                    "ESP space",
                    format!("{} MB available (need {} MB)", available_mb, required_mb),
                )
            } else {
                CheckResult::fail(
                    "ESP space",
                    format!("Only {} MB available, need {} MB", available_mb, required_mb),
                    "Run 'atomic-upgrade gc' or lower KEEP_GENERATIONS",
                )
            }
        }
        None => CheckResult::fail(
            "ESP space",
            format!("Failed to check free space on {}", esp.display()),
            "Ensure the ESP is mounted and df is available",
        ),
    }
}

/// Available bytes on the filesystem holding `path`.
pub fn available_space(path: &Path) -> Option<u64> {
    Cmd::new("df")
        .args(["--output=avail", "-B1"])
        .arg_path(path)
        .allow_fail()
        .run()
        .ok()
        .filter(|r| r.success())
        .and_then(|r| parse_df_avail(&r.stdout))
}

/// Skip the header line, parse the first number.
fn parse_df_avail(stdout: &str) -> Option<u64> {
    stdout
        .lines()
        .nth(1)
        .and_then(|line| line.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_df_avail() {
        assert_eq!(parse_df_avail("    Avail\n 123456789\n"), Some(123456789));
        assert_eq!(parse_df_avail("Avail\n"), None);
        assert_eq!(parse_df_avail(""), None);
    }

    #[test]
    fn test_available_space() {
        let space = available_space(Path::new("."));
        assert!(space.is_some());
    }

    #[test]
    fn test_missing_path_fails() {
        let result = check_esp_space(Path::new("/definitely/not/a/real/esp"));
        assert!(!result.passed);
    }

    #[test]
    fn test_min_space_is_256mib() {
        assert_eq!(MIN_ESP_FREE_BYTES, 256 * 1024 * 1024);
    }
}
