//! Bundle pipeline run for every attached disk.
//!
//! Discovery publishes each compatible bundle as it is found; selection then
//! asks the policy hook (if any) which one to install. All state lives here
//! and is only touched from the worker thread.

use crate::device::{BlockDevice, DiskId};
use crate::discovery::{Bundle, BundleCounter, BundleScanner};
use crate::hook::{HookDecision, PolicyHook};
use crate::installer::Installer;
use crate::publisher::{Publisher, Status};
use crate::worker::{AttachedDisk, DiskListener};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

pub struct Updater<I, P> {
    installer: I,
    publisher: P,
    compatible: String,
    suffix: String,
    hook: Option<PolicyHook>,
    bundles: HashMap<DiskId, Vec<Bundle>>,
    counter: BundleCounter,
    device_count: u32,
}

impl<I: Installer, P: Publisher> Updater<I, P> {
    /// `compatible` is the running system's compatible string, read once at
    /// start-up.
    pub fn new(
        installer: I,
        publisher: P,
        compatible: impl Into<String>,
        suffix: impl Into<String>,
        hook: Option<PolicyHook>,
    ) -> Self {
        Self {
            installer,
            publisher,
            compatible: compatible.into(),
            suffix: suffix.into(),
            hook,
            bundles: HashMap::new(),
            counter: BundleCounter::default(),
            device_count: 0,
        }
    }

    pub fn device_count(&self) -> u32 {
        self.device_count
    }

    pub fn last_bundle_index(&self) -> u32 {
        self.counter.last()
    }

    pub fn bundles(&self, id: &DiskId) -> Option<&[Bundle]> {
        self.bundles.get(id).map(Vec::as_slice)
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    fn set_status(&mut self, status: Status) {
        if let Err(err) = self.publisher.set_status(status) {
            warn!("failed to update status to {status}: {err}");
        }
    }

    fn publish_device_count(&mut self) {
        if let Err(err) = self.publisher.set_device_count(self.device_count) {
            warn!("failed to update device count: {err}");
        }
    }

    fn discover(&mut self, mount_points: &[PathBuf], cancel: &CancellationToken) -> Vec<Bundle> {
        self.set_status(Status::Scanning);
        let scanner = BundleScanner::new(&self.installer, &self.compatible, &self.suffix);
        let bundles = scanner.discover(mount_points, cancel, &mut self.counter, &mut self.publisher);
        self.set_status(Status::Idle);
        bundles
    }

    /// Ask the hook which bundle to install and trigger that install.
    /// Failures are logged; this path never retries.
    fn install_selected(&self, bundles: &[Bundle], cancel: &CancellationToken) {
        let Some(hook) = &self.hook else {
            return;
        };
        if bundles.is_empty() || cancel.is_cancelled() {
            return;
        }

        let decision = match hook.decide(bundles, cancel) {
            Ok(decision) => decision,
            Err(err) => {
                warn!("{err}");
                return;
            }
        };

        match decision {
            HookDecision::Denied => info!("hook script denied installation"),
            HookDecision::Cancelled => debug!("hook script cancelled"),
            HookDecision::OutOfRange(code) => {
                warn!("hook script returned index out of bounds: {code}")
            }
            HookDecision::Install(position) => {
                let bundle = &bundles[position];
                if cancel.is_cancelled() {
                    debug!("disk removed after hook chose {}", bundle.path.display());
                    return;
                }
                info!("{:>10} {}", "install", bundle.path.display());
                if let Err(err) = self.installer.install(&bundle.path) {
                    warn!("failed to install {}: {err}", bundle.path.display());
                }
            }
        }
    }
}

impl<I: Installer, P: Publisher> DiskListener for Updater<I, P> {
    fn on_attach(&mut self, disk: &AttachedDisk) {
        self.device_count += 1;
        self.publish_device_count();

        let bundles = self.discover(&disk.mount_points, &disk.cancel);
        debug!("disk {} carries {} bundles", disk.id, bundles.len());
        self.install_selected(&bundles, &disk.cancel);
        self.bundles.insert(disk.id.clone(), bundles);
    }

    fn on_detach(&mut self, id: &DiskId, device: &BlockDevice, _mount_points: &[PathBuf]) {
        let Some(bundles) = self.bundles.remove(id) else {
            debug!("detach of {} without published bundles", device.name);
            return;
        };

        for bundle in &bundles {
            if let Err(err) = self.publisher.withdraw_bundle(bundle.index) {
                warn!("failed to withdraw bundle {}: {err}", bundle.index);
            }
        }

        self.device_count = self.device_count.saturating_sub(1);
        self.publish_device_count();
        if self.device_count == 0 {
            self.counter.reset();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{UpdaterError, UpdaterResult};
    use crate::installer::BundleInfo;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    #[derive(Default)]
    struct FakeInstaller {
        installed: Mutex<Vec<PathBuf>>,
        fail_install: bool,
    }

    impl Installer for FakeInstaller {
        fn compatible(&self) -> UpdaterResult<String> {
            Ok("sys-A".to_string())
        }

        fn inspect(&self, bundle: &Path) -> UpdaterResult<BundleInfo> {
            Ok(BundleInfo {
                compatible: "sys-A".to_string(),
                version: fs::read_to_string(bundle)?.trim().to_string(),
            })
        }

        fn install(&self, bundle: &Path) -> UpdaterResult<()> {
            self.installed.lock().unwrap().push(bundle.to_path_buf());
            if self.fail_install {
                return Err(UpdaterError::installer_call(
                    Some("org.example.Failed".to_string()),
                    "installation in progress",
                ));
            }
            Ok(())
        }
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Event {
        Publish(u32),
        Withdraw(u32),
        Status(Status),
        Count(u32),
    }

    #[derive(Default)]
    struct RecordingPublisher {
        events: Vec<Event>,
    }

    impl Publisher for RecordingPublisher {
        fn publish_bundle(&mut self, index: u32, _bundle: &Bundle) -> UpdaterResult<()> {
            self.events.push(Event::Publish(index));
            Ok(())
        }

        fn withdraw_bundle(&mut self, index: u32) -> UpdaterResult<()> {
            self.events.push(Event::Withdraw(index));
            Ok(())
        }

        fn set_status(&mut self, status: Status) -> UpdaterResult<()> {
            self.events.push(Event::Status(status));
            Ok(())
        }

        fn set_device_count(&mut self, count: u32) -> UpdaterResult<()> {
            self.events.push(Event::Count(count));
            Ok(())
        }
    }

    fn write_executable(path: &Path, contents: &str) {
        fs::write(path, contents).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    /// A mounted partition holding `count` bundles named so the walk order
    /// does not matter for the assertions below.
    fn mounted_disk(id: &str, count: usize) -> (TempDir, AttachedDisk) {
        let mount = tempdir().unwrap();
        for n in 1..=count {
            fs::write(mount.path().join(format!("update-{n}.raucb")), format!("1.{n}")).unwrap();
        }
        let disk = AttachedDisk {
            id: DiskId::new(id),
            device: BlockDevice::new("sdb", "/dev/sdb"),
            partitions: vec![BlockDevice::new("sdb1", "/dev/sdb1").with_fs_type("vfat")],
            mount_points: vec![mount.path().to_path_buf()],
            cancel: CancellationToken::new(),
        };
        (mount, disk)
    }

    fn updater(
        installer: Arc<FakeInstaller>,
        hook: Option<PolicyHook>,
    ) -> Updater<Arc<FakeInstaller>, RecordingPublisher> {
        Updater::new(
            installer,
            RecordingPublisher::default(),
            "sys-A",
            ".raucb",
            hook,
        )
    }

    fn hook_exiting(dir: &Path, code: i32) -> PolicyHook {
        let script = dir.join(format!("exit-{code}.sh"));
        write_executable(&script, &format!("#!/bin/sh\nexit {code}\n"));
        PolicyHook::new(script, Duration::from_millis(5))
    }

    #[test]
    fn attach_publishes_bundles_between_status_changes() {
        let installer = Arc::new(FakeInstaller::default());
        let mut updater = updater(Arc::clone(&installer), None);
        let (_mount, disk) = mounted_disk("disk-1", 2);

        updater.on_attach(&disk);

        assert_eq!(
            updater.publisher().events,
            vec![
                Event::Count(1),
                Event::Status(Status::Scanning),
                Event::Publish(1),
                Event::Publish(2),
                Event::Status(Status::Idle),
            ]
        );
        assert_eq!(updater.bundles(&disk.id).map(<[Bundle]>::len), Some(2));
        // no hook, no automatic install
        assert!(installer.installed.lock().unwrap().is_empty());
    }

    #[test]
    fn hook_exit_status_selects_the_bundle() {
        let scripts = tempdir().unwrap();

        for (code, expected) in [(0, None), (2, Some(1)), (4, None)] {
            let installer = Arc::new(FakeInstaller::default());
            let mut updater = updater(Arc::clone(&installer), Some(hook_exiting(scripts.path(), code)));
            let (_mount, disk) = mounted_disk("disk-1", 3);

            updater.on_attach(&disk);

            let installed = installer.installed.lock().unwrap().clone();
            match expected {
                None => assert!(installed.is_empty(), "exit {code} installed {installed:?}"),
                Some(position) => {
                    let bundles = updater.bundles(&disk.id).unwrap();
                    assert_eq!(installed, vec![bundles[position].path.clone()]);
                }
            }
        }
    }

    #[test]
    fn hook_is_not_run_without_bundles_or_after_cancellation() {
        let scripts = tempdir().unwrap();
        let marker = scripts.path().join("ran");
        let script = scripts.path().join("hook.sh");
        write_executable(
            &script,
            &format!("#!/bin/sh\ntouch {}\nexit 1\n", marker.display()),
        );

        let installer = Arc::new(FakeInstaller::default());
        let hook = PolicyHook::new(&script, Duration::from_millis(5));
        let mut updater = updater(Arc::clone(&installer), Some(hook));

        let (_empty, empty_disk) = mounted_disk("disk-1", 0);
        updater.on_attach(&empty_disk);
        assert!(!marker.exists());

        let (_mount, gone) = mounted_disk("disk-2", 1);
        gone.cancel.cancel();
        updater.on_attach(&gone);
        assert!(!marker.exists());
        assert!(installer.installed.lock().unwrap().is_empty());
    }

    #[test]
    fn removal_after_hook_exit_suppresses_the_install() {
        let scripts = tempdir().unwrap();
        let script = scripts.path().join("late.sh");
        write_executable(&script, "#!/bin/sh\nsleep 0.1\nexit 1\n");

        let installer = Arc::new(FakeInstaller::default());
        // the hook exits long before the next poll; removal lands in between
        let hook = PolicyHook::new(&script, Duration::from_millis(600));
        let mut updater = updater(Arc::clone(&installer), Some(hook));
        let (_mount, disk) = mounted_disk("disk-1", 1);

        let trigger = disk.cancel.clone();
        let remover = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(150));
            trigger.cancel();
        });
        updater.on_attach(&disk);
        remover.join().unwrap();

        assert!(disk.cancel.is_cancelled());
        assert!(installer.installed.lock().unwrap().is_empty());
    }

    #[test]
    fn failed_install_is_logged_not_fatal() {
        let scripts = tempdir().unwrap();
        let installer = Arc::new(FakeInstaller {
            fail_install: true,
            ..FakeInstaller::default()
        });
        let mut updater = updater(Arc::clone(&installer), Some(hook_exiting(scripts.path(), 1)));
        let (_mount, disk) = mounted_disk("disk-1", 1);

        updater.on_attach(&disk);

        assert_eq!(installer.installed.lock().unwrap().len(), 1);
        assert_eq!(updater.bundles(&disk.id).map(<[Bundle]>::len), Some(1));
    }

    #[test]
    fn counter_resets_only_when_last_disk_leaves() {
        let installer = Arc::new(FakeInstaller::default());
        let mut updater = updater(installer, None);
        let (_first_mount, first) = mounted_disk("disk-1", 2);
        let (_second_mount, second) = mounted_disk("disk-2", 1);

        updater.on_attach(&first);
        updater.on_attach(&second);
        assert_eq!(updater.device_count(), 2);
        assert_eq!(updater.last_bundle_index(), 3);

        updater.on_detach(&first.id, &first.device, &first.mount_points);
        assert_eq!(updater.device_count(), 1);
        assert_eq!(updater.last_bundle_index(), 3);
        assert!(updater.bundles(&first.id).is_none());

        updater.on_detach(&second.id, &second.device, &second.mount_points);
        assert_eq!(updater.device_count(), 0);
        assert_eq!(updater.last_bundle_index(), 0);

        let events = &updater.publisher().events;
        let withdrawn: Vec<&Event> = events
            .iter()
            .filter(|event| matches!(event, Event::Withdraw(_)))
            .collect();
        assert_eq!(withdrawn.len(), 3);
        assert!(withdrawn.contains(&&Event::Withdraw(3)));
        assert_eq!(events.last(), Some(&Event::Count(0)));
    }

    #[test]
    fn detach_of_unknown_disk_changes_nothing() {
        let installer = Arc::new(FakeInstaller::default());
        let mut updater = updater(installer, None);
        let (_mount, disk) = mounted_disk("disk-1", 1);
        updater.on_attach(&disk);

        updater.on_detach(&DiskId::new("never-attached"), &disk.device, &[]);

        assert_eq!(updater.device_count(), 1);
        assert_eq!(updater.last_bundle_index(), 1);
    }
}
