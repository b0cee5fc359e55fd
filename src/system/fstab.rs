//! Safe rewrite of the root entry in an fstab.
//!
//! Only data lines whose mount point is `/` are considered, and only their
//! `subvol=` option is changed. Every other line comes out byte for byte.
//!
//! The write is crash safe: a `.bak` copy is taken, the new content goes to a
//! temporary file in the same directory with the original owner and mode, and
//! that file is renamed over the original. The result is read back and the
//! backup restored if the new sub-volume is not there.

use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::os::unix::fs::{chown, MetadataExt};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Point the root entry of `fstab` at `new` instead of `old`.
pub fn update_mount_entry(fstab: &Path, old: &str, new: &str) -> Result<()> {
    if !fstab.is_file() {
        return Err(Error::Fstab(format!("{} not found", fstab.display())));
    }

    let content = fs::read_to_string(fstab)
        .map_err(|e| Error::io(format!("reading {}", fstab.display()), e))?;
    let (rewritten, updated) = rewrite_root_subvolume(&content, old, new)?;
    if updated > 1 {
        log::warn!(
            "{} root entries updated in {}, review it",
            updated,
            fstab.display()
        );
    }

    let backup = backup_path(fstab);
    fs::copy(fstab, &backup)
        .map_err(|e| Error::io(format!("backing up {}", fstab.display()), e))?;

    write_atomically(fstab, &rewritten)?;

    let written = fs::read_to_string(fstab)
        .map_err(|e| Error::io(format!("re-reading {}", fstab.display()), e))?;
    let target = new.trim_matches('/');
    if !root_subvolumes(&written).iter().any(|s| s == target) {
        fs::copy(&backup, fstab)
            .map_err(|e| Error::io(format!("restoring {}", fstab.display()), e))?;
        return Err(Error::Fstab(format!(
            "verification failed, restored {} from backup",
            fstab.display()
        )));
    }

    Ok(())
}

/// Rewrite `subvol=<old>` to `subvol=<new>` on root entries.
///
/// Returns the new content and the number of root entries changed.
pub fn rewrite_root_subvolume(content: &str, old: &str, new: &str) -> Result<(String, usize)> {
    let mut out = String::with_capacity(content.len() + new.len());
    let mut saw_root = false;
    let mut updated = 0;

    for line in content.split_inclusive('\n') {
        let entry = match Entry::parse(line) {
            Some(entry) if entry.mount_point == "/" => entry,
            _ => {
                out.push_str(line);
                continue;
            }
        };
        saw_root = true;

        match replace_subvol(entry.options, old, new) {
            Some(options) => {
                updated += 1;
                out.push_str(&entry.format_with(&options));
            }
            None => out.push_str(line),
        }
    }

    if !saw_root {
        return Err(Error::Fstab("no root (/) entry found".to_string()));
    }
    if updated == 0 {
        return Err(Error::Fstab(format!(
            "root entry exists but subvol={} not found",
            old
        )));
    }
    Ok((out, updated))
}

/// `subvol=` values of every root entry, leading `/` stripped.
pub fn root_subvolumes(content: &str) -> Vec<String> {
    content
        .lines()
        .filter_map(Entry::parse)
        .filter(|e| e.mount_point == "/")
        .flat_map(|e| {
            e.options
                .split(',')
                .filter_map(|opt| opt.strip_prefix("subvol="))
                .map(|v| v.trim_start_matches('/').to_string())
                .collect::<Vec<_>>()
        })
        .collect()
}

/// One data line of an fstab.
struct Entry<'a> {
    device: &'a str,
    mount_point: &'a str,
    fstype: &'a str,
    options: &'a str,
    dump: &'a str,
    passno: &'a str,
}

impl<'a> Entry<'a> {
    fn parse(line: &'a str) -> Option<Self> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            return None;
        }
        let parts: Vec<&str> = trimmed.split_whitespace().collect();
        if parts.len() < 4 {
            return None;
        }
        Some(Self {
            device: parts[0],
            mount_point: parts[1],
            fstype: parts[2],
            options: parts[3],
            dump: parts.get(4).copied().unwrap_or("0"),
            passno: parts.get(5).copied().unwrap_or("0"),
        })
    }

    fn format_with(&self, options: &str) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{} {}\n",
            self.device, self.mount_point, self.fstype, options, self.dump, self.passno
        )
    }
}

/// Replace a matching `subvol=` option, keeping its leading-slash style.
fn replace_subvol(options: &str, old: &str, new: &str) -> Option<String> {
    let old = old.trim_matches('/');
    let new = new.trim_matches('/');
    let mut changed = false;

    let opts: Vec<String> = options
        .split(',')
        .map(|opt| match opt.strip_prefix("subvol=") {
            Some(value) if value.trim_start_matches('/') == old => {
                changed = true;
                let slash = if value.starts_with('/') { "/" } else { "" };
                format!("subvol={}{}", slash, new)
            }
            _ => opt.to_string(),
        })
        .collect();

    changed.then(|| opts.join(","))
}

fn backup_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".bak");
    PathBuf::from(name)
}

/// Replace `path` with `content` via a same-directory temp file and rename.
fn write_atomically(path: &Path, content: &str) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let meta = fs::metadata(path).map_err(|e| Error::io(format!("stat {}", path.display()), e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".fstab.")
        .tempfile_in(dir)
        .map_err(|e| Error::io(format!("creating temp file in {}", dir.display()), e))?;
    tmp.write_all(content.as_bytes())
        .map_err(|e| Error::io("writing new fstab", e))?;
    fs::set_permissions(tmp.path(), meta.permissions())
        .map_err(|e| Error::io("copying fstab permissions", e))?;
    chown(tmp.path(), Some(meta.uid()), Some(meta.gid()))
        .map_err(|e| Error::io("copying fstab ownership", e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| Error::io("syncing new fstab", e))?;

    tmp.persist(path)
        .map_err(|e| Error::io(format!("replacing {}", path.display()), e.error))?;
    Ok(())
}
