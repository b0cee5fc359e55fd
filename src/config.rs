//! Runtime configuration.
//!
//! Loaded once from `/etc/atomic.conf` (shell-style `KEY=value` lines) and
//! passed by reference to every component afterwards. The file is only
//! honoured when it is owned by root and not world-writable; otherwise loading
//! fails and nothing from it is applied.
//!
//! # Example
//!
//! ```text
//! # /etc/atomic.conf
//! ESP="/boot/efi"
//! KEEP_GENERATIONS=5
//! KERNEL_PKG=linux-lts
//! ```

use std::fs;
use std::io;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/atomic.conf";
pub const LOCK_PATH: &str = "/run/lock/atomic-upgrade.lock";
pub const DEV_MAPPER_DIR: &str = "/dev/mapper";

/// Directory under the ESP where systemd-boot discovers UKIs.
pub const ARTIFACT_DIR: &str = "EFI/Linux";

const ROOT_UID: u32 = 0;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Where the top-level btrfs volume (subvolid=5) is mounted.
    pub btrfs_mount: PathBuf,
    /// Where a freshly snapshotted generation is mounted for the chroot upgrade.
    pub new_root: PathBuf,
    /// EFI system partition.
    pub esp: PathBuf,
    pub keep_generations: u32,
    /// Device-mapper name of the root block device.
    pub mapper_name: String,
    pub kernel_pkg: String,
    /// Hardening parameters appended to every generated command line.
    pub kernel_params: String,
    pub lock_path: PathBuf,
    pub dev_mapper_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            btrfs_mount: PathBuf::from("/run/atomic/temp_root"),
            new_root: PathBuf::from("/run/atomic/newroot"),
            esp: PathBuf::from("/efi"),
            keep_generations: 3,
            mapper_name: "root_crypt".to_string(),
            kernel_pkg: "linux".to_string(),
            kernel_params: "lsm=landlock,lockdown,yama,integrity,apparmor,bpf lockdown=integrity"
                .to_string(),
            lock_path: PathBuf::from(LOCK_PATH),
            dev_mapper_dir: PathBuf::from(DEV_MAPPER_DIR),
        }
    }
}

impl Config {
    /// Load from the default location, trusting only root-owned files.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_path(Path::new(DEFAULT_CONFIG_PATH))
    }

    /// Load from `path`, trusting only root-owned files.
    pub fn load_path(path: &Path) -> Result<Self, ConfigError> {
        Self::load_from(path, ROOT_UID)
    }

    /// Load from `path`, trusting only files owned by `trusted_uid`.
    ///
    /// A missing file yields the defaults.
    pub fn load_from(path: &Path, trusted_uid: u32) -> Result<Self, ConfigError> {
        let meta = match fs::metadata(path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                log::debug!("{} not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };

        if meta.uid() != trusted_uid {
            return Err(ConfigError::UntrustedSource {
                path: path.to_path_buf(),
                reason: format!("owned by uid {}, expected uid {}", meta.uid(), trusted_uid),
            });
        }
        if meta.mode() & 0o002 != 0 {
            return Err(ConfigError::UntrustedSource {
                path: path.to_path_buf(),
                reason: "file is world-writable".to_string(),
            });
        }

        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        Self::parse(&content, path)
    }

    /// Decode config text on top of the defaults.
    ///
    /// `origin` is only used in error messages.
    pub fn parse(content: &str, origin: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (idx, raw) in content.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let line = line.strip_prefix("export ").unwrap_or(line);

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::Malformed {
                    path: origin.to_path_buf(),
                    line: line_no,
                    key: line.to_string(),
                    reason: format!("expected KEY=value, got {:?}", line),
                });
            };
            let key = key.trim();
            let value = unquote(value.trim());

            let malformed = |reason: String| ConfigError::Malformed {
                path: origin.to_path_buf(),
                line: line_no,
                key: key.to_string(),
                reason,
            };

            match key {
                "BTRFS_MOUNT" => config.btrfs_mount = absolute_path(key, value).map_err(malformed)?,
                "NEW_ROOT" => config.new_root = absolute_path(key, value).map_err(malformed)?,
                "ESP" => config.esp = absolute_path(key, value).map_err(malformed)?,
                "KEEP_GENERATIONS" => {
                    config.keep_generations = value.parse().map_err(|_| {
                        malformed(format!("{} must be an unsigned integer, got {:?}", key, value))
                    })?;
                }
                "MAPPER_NAME" => config.mapper_name = plain_name(key, value).map_err(malformed)?,
                "KERNEL_PKG" => config.kernel_pkg = plain_name(key, value).map_err(malformed)?,
                "KERNEL_PARAMS" => config.kernel_params = value.to_string(),
                other => {
                    log::warn!(
                        "{}:{}: ignoring unknown key {}",
                        origin.display(),
                        line_no,
                        other
                    );
                }
            }
        }

        Ok(config)
    }

    /// Check cross-field constraints against the running system.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.keep_generations < 1 {
            return Err(ConfigError::InvalidField {
                field: "KEEP_GENERATIONS",
                reason: "must be at least 1".to_string(),
            });
        }

        if !self.esp.is_dir() {
            return Err(ConfigError::InvalidField {
                field: "ESP",
                reason: format!("{} is not a directory", self.esp.display()),
            });
        }

        let device = self.mapped_device();
        let is_block = fs::metadata(&device)
            .map(|m| m.file_type().is_block_device())
            .unwrap_or(false);
        if !is_block {
            return Err(ConfigError::InvalidField {
                field: "MAPPER_NAME",
                reason: format!("{} is not a block device", device.display()),
            });
        }

        Ok(())
    }

    /// Block device holding the btrfs filesystem.
    pub fn mapped_device(&self) -> PathBuf {
        self.dev_mapper_dir.join(&self.mapper_name)
    }

    /// Directory holding one UKI per generation.
    pub fn artifact_dir(&self) -> PathBuf {
        self.esp.join(ARTIFACT_DIR)
    }

    pub fn kernel_path(&self, root: &Path) -> PathBuf {
        root.join("boot").join(format!("vmlinuz-{}", self.kernel_pkg))
    }

    pub fn initramfs_path(&self, root: &Path) -> PathBuf {
        root.join("boot")
            .join(format!("initramfs-{}.img", self.kernel_pkg))
    }
}

/// Strip one pair of matching surrounding quotes.
fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn absolute_path(key: &str, value: &str) -> Result<PathBuf, String> {
    let path = PathBuf::from(value);
    if !path.is_absolute() {
        return Err(format!("{} must be an absolute path, got {:?}", key, value));
    }
    Ok(path)
}

fn plain_name(key: &str, value: &str) -> Result<String, String> {
    if value.is_empty() || value.contains('/') || value.contains(char::is_whitespace) {
        return Err(format!("{} must be a plain name, got {:?}", key, value));
    }
    Ok(value.to_string())
}
