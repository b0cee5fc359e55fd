//! Root device detection and kernel command-line generation.
//!
//! Works with plain btrfs, LUKS, LVM, and LVM on LUKS, so the command line is
//! never hard-coded to one encryption layout:
//!
//! | Layout   | Clause                                                        |
//! |----------|---------------------------------------------------------------|
//! | plain    | `root=/dev/sda2 rootfstype=btrfs rootflags=subvol=...`        |
//! | luks     | `rd.luks.name=<uuid>=<name> root=/dev/mapper/<name> ...`      |
//! | lvm      | `root=/dev/mapper/<vg-lv> ...`                                |
//! | luks+lvm | `rd.luks.name=<uuid>=<pv> root=/dev/mapper/<vg-lv> ...`       |
//!
//! Each probe (`findmnt`, `dmsetup`, `cryptsetup`, `blkid`, `lvs`, `pvs`) is
//! bounded by a timeout and counts as empty output if it fails.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::RootDetector;
use crate::error::{Error, Result};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// How the root block device is assembled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RootKind {
    Plain,
    Luks,
    Lvm,
    #[serde(rename = "luks+lvm")]
    LuksLvm,
}

impl fmt::Display for RootKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RootKind::Plain => "plain",
            RootKind::Luks => "luks",
            RootKind::Lvm => "lvm",
            RootKind::LuksLvm => "luks+lvm",
        };
        f.write_str(s)
    }
}

/// What was learned about the live root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RootInfo {
    pub source: String,
    pub fstype: String,
    pub subvol: Option<String>,
    #[serde(rename = "type")]
    pub kind: RootKind,
    pub luks_uuid: Option<String>,
    pub luks_name: Option<String>,
    pub root_arg: String,
}

impl RootInfo {
    /// Kernel command-line clause for booting `subvolume` on this device.
    pub fn cmdline(&self, subvolume: &str) -> String {
        let mut parts = Vec::new();

        if matches!(self.kind, RootKind::Luks | RootKind::LuksLvm) {
            if let (Some(uuid), Some(name)) = (&self.luks_uuid, &self.luks_name) {
                parts.push(format!("rd.luks.name={}={}", uuid, name));
            }
        }
        parts.push(format!("root={}", self.root_arg));
        if !self.fstype.is_empty() {
            parts.push(format!("rootfstype={}", self.fstype));
        }
        parts.push(format!("rootflags=subvol={}", subvolume));

        parts.join(" ")
    }
}

#[derive(Debug, Deserialize)]
struct Findmnt {
    filesystems: Vec<FindmntEntry>,
}

#[derive(Debug, Deserialize)]
struct FindmntEntry {
    #[serde(default)]
    source: String,
    #[serde(default)]
    fstype: String,
    #[serde(default)]
    options: String,
}

/// Decode `findmnt -J -o SOURCE,FSTYPE,OPTIONS /` output.
pub fn parse_findmnt(json: &str) -> Option<RootInfo> {
    let parsed: Findmnt = serde_json::from_str(json).ok()?;
    let entry = parsed.filesystems.into_iter().next()?;

    // btrfs sources carry the sub-volume in brackets: /dev/mapper/root[/root-1]
    let source = match entry.source.find('[') {
        Some(idx) => entry.source[..idx].to_string(),
        None => entry.source,
    };
    if source.is_empty() {
        return None;
    }

    let subvol = entry
        .options
        .split(',')
        .find_map(|opt| opt.strip_prefix("subvol="))
        .map(str::to_string);

    Some(RootInfo {
        root_arg: source.clone(),
        source,
        fstype: entry.fstype,
        subvol,
        kind: RootKind::Plain,
        luks_uuid: None,
        luks_name: None,
    })
}

/// Runs one probe command, returning trimmed stdout or "" on any failure.
pub(crate) trait Prober {
    async fn run(&self, program: &str, args: &[&str]) -> String;
}

/// Probes the real system with `tokio::process`.
#[derive(Debug, Clone, Copy)]
pub struct TokioProber {
    timeout: Duration,
}

impl Default for TokioProber {
    fn default() -> Self {
        Self {
            timeout: PROBE_TIMEOUT,
        }
    }
}

impl Prober for TokioProber {
    async fn run(&self, program: &str, args: &[&str]) -> String {
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output();

        match tokio::time::timeout(self.timeout, output).await {
            Ok(Ok(output)) if output.status.success() => {
                String::from_utf8_lossy(&output.stdout).trim().to_string()
            }
            Ok(Ok(_)) => String::new(),
            Ok(Err(e)) => {
                log::debug!("{}: {}", program, e);
                String::new()
            }
            Err(_) => {
                log::warn!("{} timed out after {:?}", program, self.timeout);
                String::new()
            }
        }
    }
}

/// Detect the live root device, its type, and relevant UUIDs.
pub(crate) async fn detect_root<P: Prober>(prober: &P) -> Option<RootInfo> {
    let raw = prober
        .run("findmnt", &["-n", "-J", "-o", "SOURCE,FSTYPE,OPTIONS", "/"])
        .await;
    let mut info = parse_findmnt(&raw)?;

    if info.source.contains("/mapper/") || info.source.starts_with("/dev/dm-") {
        let mapper = info
            .source
            .rsplit('/')
            .next()
            .unwrap_or_default()
            .to_string();
        detect_dm_kind(prober, &mapper, &mut info).await;
    }

    Some(info)
}

async fn detect_dm_kind<P: Prober>(prober: &P, mapper: &str, info: &mut RootInfo) {
    if is_crypt_target(prober, mapper).await {
        info.kind = RootKind::Luks;
        info.luks_name = Some(mapper.to_string());
        info.root_arg = format!("/dev/mapper/{}", mapper);
        info.luks_uuid = luks_uuid(prober, mapper).await;
        return;
    }

    let mapper_dev = format!("/dev/mapper/{}", mapper);
    let lv = prober
        .run("lvs", &["--noheadings", "-o", "vg_name,lv_name", &mapper_dev])
        .await;
    if lv.is_empty() {
        return;
    }
    info.kind = RootKind::Lvm;
    info.root_arg = mapper_dev;

    let Some(vg) = lv.split_whitespace().next() else {
        return;
    };
    let selector = format!("vg_name={}", vg);
    let pv = prober
        .run("pvs", &["--noheadings", "-o", "pv_name", "-S", &selector])
        .await;
    let pv = pv.trim();
    if !pv.contains("/mapper/") {
        return;
    }
    let pv_mapper = pv.rsplit('/').next().unwrap_or_default();
    if is_crypt_target(prober, pv_mapper).await {
        info.kind = RootKind::LuksLvm;
        info.luks_name = Some(pv_mapper.to_string());
        info.luks_uuid = luks_uuid(prober, pv_mapper).await;
    }
}

async fn is_crypt_target<P: Prober>(prober: &P, mapper: &str) -> bool {
    !prober
        .run("dmsetup", &["table", "--target", "crypt", mapper])
        .await
        .is_empty()
}

/// UUID of the LUKS container behind `mapper`.
async fn luks_uuid<P: Prober>(prober: &P, mapper: &str) -> Option<String> {
    let status = prober.run("cryptsetup", &["status", mapper]).await;
    let underlying = underlying_device(&status)?;
    let uuid = prober
        .run("blkid", &["-s", "UUID", "-o", "value", &underlying])
        .await;
    (!uuid.is_empty()).then_some(uuid)
}

/// The `device:` line of `cryptsetup status` output.
fn underlying_device(status: &str) -> Option<String> {
    status
        .lines()
        .find(|line| line.contains("device:"))
        .and_then(|line| line.split_whitespace().last())
        .map(str::to_string)
}

/// [`RootDetector`] that probes the running system.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemDetector {
    prober: TokioProber,
}

impl SystemDetector {
    /// Detect the live root, or fail if `/` cannot be described.
    pub fn detect(&self) -> Result<RootInfo> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::io("starting probe runtime", e))?;

        runtime
            .block_on(detect_root(&self.prober))
            .ok_or_else(|| Error::tool("rootdev", "failed to detect root device"))
    }
}

impl RootDetector for SystemDetector {
    fn root_command_line(&self, subvolume: &str) -> Result<String> {
        let info = self.detect()?;
        log::debug!("root device: {} ({})", info.source, info.kind);
        Ok(info.cmdline(subvolume))
    }
}
