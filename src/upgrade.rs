//! The upgrade sequence.
//!
//! ```text
//! lock -> preflight -> mount top level -> snapshot current root into root-<id>
//!      -> mount root-<id> -> package upgrade -> validate -> fstab -> UKI
//!      -> sign -> unmount -> gc -> unlock
//! ```
//!
//! Any failing step stops the run. Nothing is rolled back: a snapshot that
//! never got a boot entry shows up as an orphan in `list`, and a failed UKI
//! build can be retried with [`Upgrade::rebuild_uki`].

use std::path::{Path, PathBuf};

use crate::artifact::UkiBuilder;
use crate::config::Config;
use crate::error::{Precondition, Result};
use crate::gc::{GarbageCollector, GcSummary};
use crate::generation::{GenerationId, Registry};
use crate::interrupt::{InterruptFlag, INTERRUPTED};
use crate::lock::LockGuard;
use crate::mount::{ensure_mounted, validate_subvolume, MountGuard};
use crate::preflight::{PreflightChecker, PreflightReport};
use crate::system::{fstab, Host};
use crate::Timer;

/// What an upgrade did, or would have done.
#[derive(Debug)]
pub struct UpgradeReport {
    pub dry_run: bool,
    pub id: GenerationId,
    /// Sub-volume the run started from.
    pub previous: String,
    pub subvolume: String,
    pub artifact: PathBuf,
    pub gc: GcSummary,
}

pub struct Upgrade<'a> {
    config: &'a Config,
    host: Host<'a>,
    preflight: fn(&Config) -> PreflightReport,
    interrupt: &'a InterruptFlag,
}

impl<'a> Upgrade<'a> {
    pub fn new(config: &'a Config, host: Host<'a>) -> Self {
        Self {
            config,
            host,
            preflight: |config| PreflightChecker::new(config).run_all(),
            interrupt: &INTERRUPTED,
        }
    }

    /// Watch `flag` instead of the process-wide signal flag.
    pub fn with_interrupt(mut self, flag: &'a InterruptFlag) -> Self {
        self.interrupt = flag;
        self
    }

    /// Replace the host preflight checks.
    pub fn with_preflight(mut self, preflight: fn(&Config) -> PreflightReport) -> Self {
        self.preflight = preflight;
        self
    }

    /// Create, upgrade and register a new generation, then apply retention.
    pub fn run(&self, dry_run: bool) -> Result<UpgradeReport> {
        let _lock = LockGuard::acquire(&self.config.lock_path)?;

        let report = (self.preflight)(self.config);
        report.print_summary();
        if !report.is_ok() {
            if dry_run {
                println!("[DRY-RUN] continuing despite failed preflight checks\n");
            } else {
                return Err(Precondition::PreflightFailed(report.failure_summary()).into());
            }
        }

        let volumes = self.host.volumes;
        ensure_mounted(volumes, &self.config.mapped_device(), &self.config.btrfs_mount)?;

        let current = Registry::new(self.config, volumes).current_subvolume()?;
        let id = GenerationId::now();
        let subvolume = id.subvolume_name();
        let artifact = self.config.artifact_dir().join(id.artifact_name());

        let target = self.config.btrfs_mount.join(&subvolume);
        if target.exists() || artifact.exists() {
            return Err(Precondition::GenerationExists(id.to_string()).into());
        }

        println!("=== Upgrade {} ===\n", id);
        println!("  Current:   {}", current);
        println!("  New:       {}", subvolume);
        println!("  Artifact:  {}", artifact.display());
        println!();

        if dry_run {
            self.check_running_boot_files();
            println!("\n=== Retention (dry run) ===\n");
            let gc = self.collect(true)?;
            println!("\n[DRY-RUN] no changes made");
            return Ok(UpgradeReport {
                dry_run,
                id,
                previous: current,
                subvolume,
                artifact,
                gc,
            });
        }

        let source = self.config.btrfs_mount.join(&current);
        let t = Timer::start("Snapshot");
        volumes.snapshot(&source, &target)?;
        t.finish();
        self.interrupt.check()?;

        let built = {
            let guard = MountGuard::mount(
                volumes,
                &self.config.mapped_device(),
                &subvolume,
                &self.config.new_root,
            )?;
            self.populate(&id, &current, &subvolume, guard.path())?
        };

        self.interrupt.check()?;
        println!("\n=== Retention ===\n");
        let gc = self.collect(false)?;

        println!("\n=== Upgrade Complete ===");
        println!("  Generation: {}", id);
        println!("  Boot entry: {}", built.display());
        println!("\nReboot to switch to the new generation.");

        Ok(UpgradeReport {
            dry_run,
            id,
            previous: current,
            subvolume,
            artifact: built,
            gc,
        })
    }

    /// Steps that run with the new sub-volume mounted at `new_root`.
    fn populate(
        &self,
        id: &GenerationId,
        current: &str,
        subvolume: &str,
        new_root: &Path,
    ) -> Result<PathBuf> {
        println!("\nUpgrading packages in {}...", new_root.display());
        let t = Timer::start("Package upgrade");
        self.host.upgrader.upgrade(new_root)?;
        t.finish();
        self.interrupt.check()?;

        if !validate_subvolume(self.host.volumes, subvolume, &self.config.btrfs_mount) {
            return Err(Precondition::InvalidSubvolume(subvolume.to_string()).into());
        }

        let fstab_path = new_root.join("etc/fstab");
        fstab::update_mount_entry(&fstab_path, current, subvolume)?;
        println!("  [OK] fstab root entry now uses {}", subvolume);
        self.interrupt.check()?;

        let t = Timer::start("UKI");
        let artifact = self.uki_builder().build(id, new_root, subvolume)?;
        t.finish();
        self.interrupt.check()?;

        self.host.signer.sign(&artifact)?;
        Ok(artifact)
    }

    /// Build the UKI for an existing generation again.
    ///
    /// This is the retry path after a failed build: the sub-volume is
    /// already upgraded and its fstab already points at itself.
    pub fn rebuild_uki(&self, id: &GenerationId) -> Result<PathBuf> {
        let _lock = LockGuard::acquire(&self.config.lock_path)?;

        let volumes = self.host.volumes;
        ensure_mounted(volumes, &self.config.mapped_device(), &self.config.btrfs_mount)?;

        let subvolume = id.subvolume_name();
        if !validate_subvolume(volumes, &subvolume, &self.config.btrfs_mount) {
            return Err(Precondition::InvalidSubvolume(subvolume).into());
        }

        println!("=== Rebuild UKI {} ===\n", id);
        let guard = MountGuard::mount(
            volumes,
            &self.config.mapped_device(),
            &subvolume,
            &self.config.new_root,
        )?;
        self.interrupt.check()?;
        let artifact = self.uki_builder().build(id, guard.path(), &subvolume)?;
        self.interrupt.check()?;
        self.host.signer.sign(&artifact)?;
        drop(guard);

        println!("\n  [OK] {}", artifact.display());
        Ok(artifact)
    }

    fn uki_builder(&self) -> UkiBuilder<'_> {
        UkiBuilder::new(self.config, self.host.images, self.host.detector)
    }

    fn collect(&self, dry_run: bool) -> Result<GcSummary> {
        let keep = self.config.keep_generations as usize;
        let summary = GarbageCollector::new(self.config, self.host.volumes)
            .with_interrupt(self.interrupt)
            .collect(keep, dry_run)?;
        summary.print();
        Ok(summary)
    }

    /// Dry runs cannot see the upgraded kernel, so check the running one.
    fn check_running_boot_files(&self) {
        let root = Path::new("/");
        for path in [self.config.kernel_path(root), self.config.initramfs_path(root)] {
            if path.is_file() {
                println!("  [OK] {}", path.display());
            } else {
                println!("  [WARN] {} not found", path.display());
            }
        }
    }
}

/// Standalone retention run under the system lock.
pub fn run_gc(config: &Config, host: Host<'_>, keep: usize, dry_run: bool) -> Result<GcSummary> {
    let _lock = LockGuard::acquire(&config.lock_path)?;
    println!("=== Garbage Collection (keep {}) ===\n", keep);
    let summary = GarbageCollector::new(config, host.volumes).collect(keep, dry_run)?;
    summary.print();
    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{BuildError, Error};
    use crate::preflight::CheckResult;
    use crate::system::fake::{FakeDetector, FakeImageBuilder, FakeSigner, FakeUpgrade, FakeVolumes};
    use crate::system::VolumeManager;
    use std::fs;
    use tempfile::TempDir;

    const FSTAB: &str = "\
# /etc/fstab
/dev/mapper/root\t/\tbtrfs\trw,noatime,subvol=/root-20240103-120000\t0 0
/dev/mapper/root /home btrfs rw,noatime,subvol=/home 0 0
UUID=ABCD-1234 /efi vfat umask=0077 0 2
";

    fn passing(_: &Config) -> PreflightReport {
        PreflightReport {
            checks: vec![CheckResult::pass("host", "ok")],
        }
    }

    fn failing(_: &Config) -> PreflightReport {
        PreflightReport {
            checks: vec![CheckResult::fail("ukify tool", "Not found", "install it")],
        }
    }

    struct Fixture {
        _temp: TempDir,
        config: Config,
        volumes: FakeVolumes,
        images: FakeImageBuilder,
        detector: FakeDetector,
        upgrader: FakeUpgrade,
        signer: FakeSigner,
    }

    impl Fixture {
        /// Booted from the newest of three registered generations, new root populated.
        fn new() -> Self {
            let temp = TempDir::new().unwrap();
            let config = Config {
                esp: temp.path().join("esp"),
                btrfs_mount: temp.path().join("top"),
                new_root: temp.path().join("newroot"),
                lock_path: temp.path().join("lock/atomic-upgrade.lock"),
                keep_generations: 2,
                ..Config::default()
            };
            fs::create_dir_all(config.artifact_dir()).unwrap();

            let volumes = FakeVolumes::booted_from("root-20240103-120000");
            for id in ["20240101-120000", "20240102-120000", "20240103-120000"] {
                fs::write(config.artifact_dir().join(format!("arch-{}.efi", id)), b"MZ").unwrap();
                volumes.add_subvolume(config.btrfs_mount.join(format!("root-{}", id)));
            }

            let root = &config.new_root;
            fs::create_dir_all(root.join("boot")).unwrap();
            fs::create_dir_all(root.join("etc")).unwrap();
            fs::write(config.kernel_path(root), b"kernel").unwrap();
            fs::write(config.initramfs_path(root), b"initramfs").unwrap();
            fs::write(root.join("etc/os-release"), "NAME=\"Arch Linux\"\nID=arch\n").unwrap();
            fs::write(root.join("etc/fstab"), FSTAB).unwrap();

            Self {
                _temp: temp,
                config,
                volumes,
                images: FakeImageBuilder::default(),
                detector: FakeDetector("root=/dev/mapper/root"),
                upgrader: FakeUpgrade::default(),
                signer: FakeSigner::default(),
            }
        }

        fn host(&self) -> Host<'_> {
            Host {
                volumes: &self.volumes,
                images: &self.images,
                detector: &self.detector,
                upgrader: &self.upgrader,
                signer: &self.signer,
            }
        }

        fn upgrade(&self) -> Upgrade<'_> {
            Upgrade::new(&self.config, self.host()).with_preflight(passing)
        }

        fn artifacts(&self) -> Vec<String> {
            let mut names: Vec<String> = fs::read_dir(self.config.artifact_dir())
                .unwrap()
                .flatten()
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect();
            names.sort();
            names
        }
    }

    #[test]
    fn test_upgrade_full_sequence() {
        let fx = Fixture::new();
        let report = fx.upgrade().run(false).unwrap();

        assert!(!report.dry_run);
        assert_eq!(report.previous, "root-20240103-120000");
        assert_eq!(report.subvolume, format!("root-{}", report.id));

        // Snapshot of the booted root into the new sub-volume
        let snapshots = fx.volumes.snapshots.borrow();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].0, fx.config.btrfs_mount.join("root-20240103-120000"));
        assert_eq!(snapshots[0].1, fx.config.btrfs_mount.join(&report.subvolume));

        // Upgrade ran inside the new root, which is unmounted again
        assert_eq!(*fx.upgrader.roots.borrow(), vec![fx.config.new_root.clone()]);
        assert!(!fx.volumes.is_mounted(&fx.config.new_root).unwrap());

        // fstab points at the new sub-volume, other lines untouched
        let fstab = fs::read_to_string(fx.config.new_root.join("etc/fstab")).unwrap();
        assert!(fstab.contains(&format!("subvol=/{}", report.subvolume)));
        assert!(!fstab.contains("subvol=/root-20240103-120000"));
        assert!(fstab.contains("/dev/mapper/root /home btrfs rw,noatime,subvol=/home 0 0\n"));

        // UKI built with a cmdline for the new sub-volume, then signed
        let calls = fx.images.calls.borrow();
        assert_eq!(calls.len(), 1);
        assert!(calls[0]
            .cmdline
            .contains(&format!("rootflags=subvol={}", report.subvolume)));
        assert!(report.artifact.is_file());
        assert_eq!(*fx.signer.signed.borrow(), vec![report.artifact.clone()]);

        // keep=2: current plus the new one and the middle one; the oldest goes
        assert_eq!(report.gc.deleted, 1);
        assert_eq!(
            fx.artifacts(),
            vec![
                "arch-20240102-120000.efi".to_string(),
                "arch-20240103-120000.efi".to_string(),
                report.id.artifact_name(),
            ]
        );
        assert!(!fx.volumes.has_subvolume(&fx.config.btrfs_mount.join("root-20240101-120000")));
    }

    #[test]
    fn test_dry_run_changes_nothing() {
        let fx = Fixture::new();
        let before = fx.artifacts();

        let report = fx.upgrade().run(true).unwrap();

        assert!(report.dry_run);
        assert!(fx.volumes.snapshots.borrow().is_empty());
        assert!(fx.upgrader.roots.borrow().is_empty());
        assert!(fx.images.calls.borrow().is_empty());
        assert!(fx.signer.signed.borrow().is_empty());
        assert!(fx.volumes.deleted.borrow().is_empty());
        assert_eq!(fx.artifacts(), before);
        assert_eq!(
            fs::read_to_string(fx.config.new_root.join("etc/fstab")).unwrap(),
            FSTAB
        );

        // Retention is still computed: both older generations fit in keep=2
        assert_eq!(report.gc.plan.delete.len(), 0);
        assert_eq!(report.gc.kept, 3);
    }

    #[test]
    fn test_dry_run_tolerates_failed_preflight() {
        let fx = Fixture::new();
        let report = Upgrade::new(&fx.config, fx.host())
            .with_preflight(failing)
            .run(true)
            .unwrap();
        assert!(report.dry_run);
    }

    #[test]
    fn test_failed_preflight_aborts_before_snapshot() {
        let fx = Fixture::new();
        let err = Upgrade::new(&fx.config, fx.host())
            .with_preflight(failing)
            .run(false)
            .unwrap_err();

        assert!(matches!(err, Error::Precondition(Precondition::PreflightFailed(_))));
        assert!(fx.volumes.snapshots.borrow().is_empty());
    }

    #[test]
    fn test_upgrade_refused_while_locked() {
        let fx = Fixture::new();
        let _held = LockGuard::acquire(&fx.config.lock_path).unwrap();

        let err = fx.upgrade().run(false).unwrap_err();

        assert!(matches!(err, Error::AlreadyRunning { .. }));
        assert!(fx.volumes.snapshots.borrow().is_empty());
        assert!(fx.images.calls.borrow().is_empty());
    }

    #[test]
    fn test_gc_refused_while_locked() {
        let fx = Fixture::new();
        let _held = LockGuard::acquire(&fx.config.lock_path).unwrap();

        let err = run_gc(&fx.config, fx.host(), 1, false).unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning { .. }));
        assert!(fx.volumes.deleted.borrow().is_empty());
    }

    #[test]
    fn test_lock_released_after_run() {
        let fx = Fixture::new();
        fx.upgrade().run(true).unwrap();
        assert!(LockGuard::acquire(&fx.config.lock_path).is_ok());
    }

    #[test]
    fn test_package_upgrade_failure_stops_the_run() {
        let mut fx = Fixture::new();
        fx.upgrader.fail = true;

        let err = fx.upgrade().run(false).unwrap_err();

        assert!(matches!(err, Error::Tool { .. }));
        assert!(fx.images.calls.borrow().is_empty());
        assert!(!fx.volumes.is_mounted(&fx.config.new_root).unwrap());
        // The snapshot stays behind; nothing is rolled back or collected.
        assert_eq!(fx.volumes.snapshots.borrow().len(), 1);
        assert!(fx.volumes.deleted.borrow().is_empty());
        assert_eq!(
            fs::read_to_string(fx.config.new_root.join("etc/fstab")).unwrap(),
            FSTAB
        );
    }

    #[test]
    fn test_interrupt_during_package_upgrade_unwinds() {
        static FLAG: InterruptFlag = InterruptFlag::new();
        let mut fx = Fixture::new();
        fx.upgrader.raise = Some(&FLAG);

        let err = fx.upgrade().with_interrupt(&FLAG).run(false).unwrap_err();

        assert!(matches!(err, Error::Interrupted));
        assert!(fx.images.calls.borrow().is_empty());
        assert!(fx.signer.signed.borrow().is_empty());
        assert!(fx.volumes.deleted.borrow().is_empty());
        assert!(!fx.volumes.is_mounted(&fx.config.new_root).unwrap());
        assert_eq!(
            fs::read_to_string(fx.config.new_root.join("etc/fstab")).unwrap(),
            FSTAB
        );
        assert!(LockGuard::acquire(&fx.config.lock_path).is_ok());
    }

    #[test]
    fn test_build_failure_leaves_orphan_and_skips_gc() {
        let mut fx = Fixture::new();
        fx.images.fail = true;

        let err = fx.upgrade().run(false).unwrap_err();

        assert!(matches!(err, Error::Build(BuildError::ToolFailed { .. })));
        assert!(fx.signer.signed.borrow().is_empty());
        assert!(fx.volumes.deleted.borrow().is_empty());

        let registry = Registry::new(&fx.config, &fx.volumes);
        let orphans = registry.orphan_subvolumes(&fx.config.btrfs_mount);
        assert_eq!(orphans.len(), 1);
        assert!(orphans[0].starts_with("root-"));
    }

    #[test]
    fn test_missing_root_entry_in_fstab_stops_before_uki() {
        let fx = Fixture::new();
        fs::write(
            fx.config.new_root.join("etc/fstab"),
            "/dev/mapper/root /home btrfs subvol=/home 0 0\n",
        )
        .unwrap();

        let err = fx.upgrade().run(false).unwrap_err();
        assert!(matches!(err, Error::Fstab(_)));
        assert!(fx.images.calls.borrow().is_empty());
    }

    #[test]
    fn test_unknown_current_generation_is_fatal() {
        let mut fx = Fixture::new();
        fx.volumes.root_options = "rw,relatime".to_string();

        let err = fx.upgrade().run(false).unwrap_err();
        assert!(matches!(
            err,
            Error::Precondition(Precondition::CurrentGenerationUnknown)
        ));
        assert!(fx.volumes.snapshots.borrow().is_empty());
    }

    #[test]
    fn test_rebuild_uki_for_existing_generation() {
        let fx = Fixture::new();
        fs::remove_file(fx.config.artifact_dir().join("arch-20240102-120000.efi")).unwrap();

        let id = GenerationId::parse("20240102-120000").unwrap();
        let artifact = fx.upgrade().rebuild_uki(&id).unwrap();

        assert_eq!(artifact, fx.config.artifact_dir().join("arch-20240102-120000.efi"));
        assert!(artifact.is_file());
        assert!(fx.images.calls.borrow()[0]
            .cmdline
            .contains("rootflags=subvol=root-20240102-120000"));
        assert_eq!(*fx.signer.signed.borrow(), vec![artifact]);
        assert!(!fx.volumes.is_mounted(&fx.config.new_root).unwrap());
    }

    #[test]
    fn test_failed_rebuild_keeps_booted_entry() {
        let mut fx = Fixture::new();
        fx.images.fail = true;
        let booted = fx.config.artifact_dir().join("arch-20240103-120000.efi");

        let id = GenerationId::parse("20240103-120000").unwrap();
        let err = fx.upgrade().rebuild_uki(&id).unwrap_err();

        assert!(matches!(err, Error::Build(BuildError::ToolFailed { .. })));
        assert_eq!(fs::read(&booted).unwrap(), b"MZ");
        assert!(fx.signer.signed.borrow().is_empty());
        assert_eq!(
            fx.artifacts(),
            vec![
                "arch-20240101-120000.efi".to_string(),
                "arch-20240102-120000.efi".to_string(),
                "arch-20240103-120000.efi".to_string(),
            ]
        );
        assert!(!fx.volumes.is_mounted(&fx.config.new_root).unwrap());
    }

    #[test]
    fn test_rebuild_uki_unknown_generation() {
        let fx = Fixture::new();
        let id = GenerationId::parse("20240109-120000").unwrap();

        let err = fx.upgrade().rebuild_uki(&id).unwrap_err();
        assert!(matches!(
            err,
            Error::Precondition(Precondition::InvalidSubvolume(_))
        ));
        assert!(fx.images.calls.borrow().is_empty());
    }

    #[test]
    fn test_run_gc_applies_retention() {
        let fx = Fixture::new();
        let summary = run_gc(&fx.config, fx.host(), 1, false).unwrap();

        assert_eq!(summary.deleted, 1);
        assert_eq!(
            fx.artifacts(),
            vec!["arch-20240102-120000.efi".to_string(), "arch-20240103-120000.efi".to_string()]
        );
    }
}
