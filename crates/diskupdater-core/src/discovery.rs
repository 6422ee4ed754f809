//! Recursive bundle search on mounted partitions.

use crate::installer::Installer;
use crate::publisher::Publisher;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use walkdir::WalkDir;

/// A compatible update bundle found on a disk and exported on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bundle {
    pub path: PathBuf,
    pub version: String,
    pub compatible: String,
    /// Number of the exported object (`.../bundles/<index>`).
    pub index: u32,
}

/// Hands out object numbers for published bundles.
///
/// Numbers grow monotonically and start over only once no disk is attached.
#[derive(Debug, Default)]
pub struct BundleCounter {
    last: u32,
}

impl BundleCounter {
    pub fn next_index(&mut self) -> u32 {
        self.last += 1;
        self.last
    }

    pub fn last(&self) -> u32 {
        self.last
    }

    pub fn reset(&mut self) {
        self.last = 0;
    }
}

/// Walks mounted filesystems and validates candidate files with the installer.
pub struct BundleScanner<'a> {
    installer: &'a dyn Installer,
    compatible: &'a str,
    suffix: &'a str,
}

impl<'a> BundleScanner<'a> {
    pub fn new(installer: &'a dyn Installer, compatible: &'a str, suffix: &'a str) -> Self {
        Self {
            installer,
            compatible,
            suffix,
        }
    }

    /// Search every mount point depth-first and publish each compatible bundle.
    ///
    /// Symbolic links are never followed. The token is checked before every
    /// directory entry; once it fires the bundles found so far are returned.
    pub fn discover(
        &self,
        mount_points: &[PathBuf],
        cancel: &CancellationToken,
        counter: &mut BundleCounter,
        publisher: &mut dyn Publisher,
    ) -> Vec<Bundle> {
        let mut bundles = Vec::new();

        for mount_point in mount_points {
            for entry in WalkDir::new(mount_point).follow_links(false) {
                if cancel.is_cancelled() {
                    debug!("bundle search on {} cancelled", mount_point.display());
                    return bundles;
                }

                let entry = match entry {
                    Ok(entry) => entry,
                    Err(err) => {
                        debug!("skipping unreadable entry below {}: {err}", mount_point.display());
                        continue;
                    }
                };

                if !entry.file_type().is_file() || !self.is_candidate(entry.path()) {
                    continue;
                }

                if let Some(bundle) = self.check_bundle(entry.path(), counter, publisher) {
                    bundles.push(bundle);
                }
            }
        }

        bundles
    }

    fn is_candidate(&self, path: &Path) -> bool {
        path.file_name()
            .and_then(|name| name.to_str())
            .is_some_and(|name| name.ends_with(self.suffix))
    }

    fn check_bundle(
        &self,
        path: &Path,
        counter: &mut BundleCounter,
        publisher: &mut dyn Publisher,
    ) -> Option<Bundle> {
        let info = match self.installer.inspect(path) {
            Ok(info) => info,
            Err(err) => {
                warn!("failed to verify {}: {err}", path.display());
                return None;
            }
        };

        if info.compatible != self.compatible {
            info!(
                "ignore {} with unknown compatible {}",
                path.display(),
                info.compatible
            );
            return None;
        }

        info!("{:>10} {} ({})", "found", path.display(), info.version);

        let bundle = Bundle {
            path: path.to_path_buf(),
            version: info.version,
            compatible: info.compatible,
            index: counter.next_index(),
        };

        if let Err(err) = publisher.publish_bundle(bundle.index, &bundle) {
            warn!("failed to publish bundle {}: {err}", path.display());
            return None;
        }

        Some(bundle)
    }
}
