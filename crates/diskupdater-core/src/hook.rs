//! External policy hook that picks the bundle to install.
//!
//! The hook runs as `<script> install` with `BUNDLE_PATH_<n>`,
//! `BUNDLE_VERSION_<n>` (1-based, discovery order) and `BUNDLES` in its
//! environment. Its exit status is the answer: `0` declines, `n` selects the
//! n-th bundle.

use crate::discovery::Bundle;
use crate::error::{UpdaterError, UpdaterResult};
use log::debug;
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// What the hook asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookDecision {
    /// Exit status 0.
    Denied,
    /// Install the bundle at this zero-based position.
    Install(usize),
    /// The exit status did not name a discovered bundle.
    OutOfRange(i32),
    /// The disk went away while the hook was running.
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct PolicyHook {
    script: PathBuf,
    poll_interval: Duration,
}

impl PolicyHook {
    pub fn new(script: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            script: script.into(),
            poll_interval,
        }
    }

    /// Variables describing `bundles` to the hook.
    pub fn environment(bundles: &[Bundle]) -> Vec<(String, String)> {
        let mut vars = Vec::with_capacity(bundles.len() * 2 + 1);
        for (position, bundle) in bundles.iter().enumerate() {
            let n = position + 1;
            vars.push((
                format!("BUNDLE_PATH_{n}"),
                bundle.path.to_string_lossy().into_owned(),
            ));
            vars.push((format!("BUNDLE_VERSION_{n}"), bundle.version.clone()));
        }
        vars.push(("BUNDLES".to_string(), bundles.len().to_string()));
        vars
    }

    /// Run the hook for `bundles` and map its exit status to a decision.
    ///
    /// The wait is abandoned and the hook killed as soon as `cancel` fires.
    pub fn decide(
        &self,
        bundles: &[Bundle],
        cancel: &CancellationToken,
    ) -> UpdaterResult<HookDecision> {
        if cancel.is_cancelled() {
            return Ok(HookDecision::Cancelled);
        }

        debug!("start hook script {}", self.script.display());
        let child = Command::new(&self.script)
            .arg("install")
            .envs(Self::environment(bundles))
            .stdin(Stdio::null())
            .spawn()
            .map_err(|err| {
                UpdaterError::Hook(format!(
                    "failed to run script {}: {err}",
                    self.script.display()
                ))
            })?;

        match self.wait_cancellable(child, cancel)? {
            Some(status) => interpret_exit(status, bundles.len()),
            None => Ok(HookDecision::Cancelled),
        }
    }

    fn wait_cancellable(
        &self,
        mut child: Child,
        cancel: &CancellationToken,
    ) -> UpdaterResult<Option<ExitStatus>> {
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {}
                Err(err) => {
                    stop(&mut child);
                    return Err(UpdaterError::Hook(format!(
                        "failed to wait for script {}: {err}",
                        self.script.display()
                    )));
                }
            }
            if cancel.is_cancelled() {
                debug!("cancelling hook script {}", self.script.display());
                stop(&mut child);
                return Ok(None);
            }
            thread::sleep(self.poll_interval);
        }
    }
}

/// Kill the hook and reap it so no zombie is left behind.
fn stop(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

fn interpret_exit(status: ExitStatus, count: usize) -> UpdaterResult<HookDecision> {
    let code = status
        .code()
        .ok_or_else(|| UpdaterError::Hook(format!("hook script terminated abnormally ({status})")))?;
    Ok(decision_for_code(code, count))
}

pub(crate) fn decision_for_code(code: i32, count: usize) -> HookDecision {
    match usize::try_from(code) {
        Ok(0) => HookDecision::Denied,
        Ok(n) if n <= count => HookDecision::Install(n - 1),
        _ => HookDecision::OutOfRange(code),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use std::time::Instant;
    use tempfile::tempdir;

    fn write_executable(path: &Path, contents: &str) {
        fs::write(path, contents).unwrap();
        let mut perms = fs::metadata(path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(path, perms).unwrap();
    }

    fn bundles(count: usize) -> Vec<Bundle> {
        (1..=count)
            .map(|n| Bundle {
                path: PathBuf::from(format!("/run/media/disk-updater/sdb1/update-{n}.raucb")),
                version: format!("1.{n}.0"),
                compatible: "sys-A".to_string(),
                index: n as u32,
            })
            .collect()
    }

    fn hook(path: &Path) -> PolicyHook {
        PolicyHook::new(path, Duration::from_millis(5))
    }

    #[test]
    fn exit_codes_map_to_decisions() {
        assert_eq!(decision_for_code(0, 3), HookDecision::Denied);
        assert_eq!(decision_for_code(1, 3), HookDecision::Install(0));
        assert_eq!(decision_for_code(3, 3), HookDecision::Install(2));
        assert_eq!(decision_for_code(4, 3), HookDecision::OutOfRange(4));
        assert_eq!(decision_for_code(-1, 3), HookDecision::OutOfRange(-1));
    }

    #[test]
    fn environment_lists_bundles_in_discovery_order() {
        let vars = PolicyHook::environment(&bundles(2));
        assert_eq!(
            vars,
            vec![
                (
                    "BUNDLE_PATH_1".to_string(),
                    "/run/media/disk-updater/sdb1/update-1.raucb".to_string()
                ),
                ("BUNDLE_VERSION_1".to_string(), "1.1.0".to_string()),
                (
                    "BUNDLE_PATH_2".to_string(),
                    "/run/media/disk-updater/sdb1/update-2.raucb".to_string()
                ),
                ("BUNDLE_VERSION_2".to_string(), "1.2.0".to_string()),
                ("BUNDLES".to_string(), "2".to_string()),
            ]
        );
    }

    #[test]
    fn script_receives_argument_and_environment() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("hook.sh");
        let dump = dir.path().join("dump");
        write_executable(
            &script,
            &format!(
                "#!/bin/sh\necho \"$1 $BUNDLES $BUNDLE_VERSION_3 $BUNDLE_PATH_1\" > {}\nexit 2\n",
                dump.display()
            ),
        );

        let decision = hook(&script)
            .decide(&bundles(3), &CancellationToken::new())
            .unwrap();

        assert_eq!(decision, HookDecision::Install(1));
        assert_eq!(
            fs::read_to_string(&dump).unwrap().trim(),
            "install 3 1.3.0 /run/media/disk-updater/sdb1/update-1.raucb"
        );
    }

    #[test]
    fn zero_and_out_of_range_statuses() {
        let dir = tempdir().unwrap();
        let deny = dir.path().join("deny.sh");
        let wild = dir.path().join("wild.sh");
        write_executable(&deny, "#!/bin/sh\nexit 0\n");
        write_executable(&wild, "#!/bin/sh\nexit 4\n");

        let token = CancellationToken::new();
        assert_eq!(
            hook(&deny).decide(&bundles(3), &token).unwrap(),
            HookDecision::Denied
        );
        assert_eq!(
            hook(&wild).decide(&bundles(3), &token).unwrap(),
            HookDecision::OutOfRange(4)
        );
    }

    #[test]
    fn missing_script_is_a_hook_error() {
        let dir = tempdir().unwrap();
        let err = hook(&dir.path().join("absent"))
            .decide(&bundles(1), &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, UpdaterError::Hook(_)));
    }

    #[test]
    fn cancellation_kills_a_running_script() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("slow.sh");
        write_executable(&script, "#!/bin/sh\nsleep 30\nexit 1\n");

        let token = CancellationToken::new();
        let trigger = token.clone();
        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            trigger.cancel();
        });

        let started = Instant::now();
        let decision = hook(&script).decide(&bundles(1), &token).unwrap();
        canceller.join().unwrap();

        assert_eq!(decision, HookDecision::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn stop_kills_and_reaps_the_child() {
        let dir = tempdir().unwrap();
        let script = dir.path().join("hang.sh");
        write_executable(&script, "#!/bin/sh\nsleep 30\n");

        let mut child = Command::new(&script).spawn().unwrap();
        assert!(child.try_wait().unwrap().is_none());

        stop(&mut child);

        // reaped: the exit status is already collected, and it was a kill
        let status = child.try_wait().unwrap().expect("child was reaped");
        assert_eq!(status.code(), None);
    }

    #[test]
    fn already_cancelled_token_skips_the_script() {
        let dir = tempdir().unwrap();
        let marker = dir.path().join("ran");
        let script = dir.path().join("hook.sh");
        write_executable(
            &script,
            &format!("#!/bin/sh\ntouch {}\nexit 1\n", marker.display()),
        );

        let token = CancellationToken::new();
        token.cancel();
        assert_eq!(
            hook(&script).decide(&bundles(1), &token).unwrap(),
            HookDecision::Cancelled
        );
        assert!(!marker.exists());
    }
}
