//! Mounts inserted USB disks, offers the RAUC bundles found on them over the
//! system bus and lets an optional policy hook pick one for installation.

use crate::hotplug::{existing_usb_devices, UdevSource};
use anyhow::{anyhow, Context, Result};
use clap::Parser;
use diskupdater_core::{
    logging, DiskMonitor, Installer, JobQueue, MountWorker, PolicyHook, SupportedFilesystems,
    SystemMounter, Updater, UpdaterConfig,
};
use diskupdater_dbus::Bus;
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{interval, MissedTickBehavior};
use tokio::{select, signal as tokio_signal};

const EXIT_CONFIG: i32 = 1;
const EXIT_HOOK_MISSING: i32 = 2;
const EXIT_INSTALLER: i32 = 3;
const EXIT_BUS_NAME: i32 = 4;

/// Command-line options for the disk updater daemon.
#[derive(Parser, Debug)]
#[command(
    name = "disk-updater",
    version,
    about = "Mounts inserted disks and offers RAUC bundles found on them for installation."
)]
struct Args {
    /// Policy hook run as `<script> install` whenever bundles are found.
    #[arg(short, long, value_name = "FILE")]
    script: Option<PathBuf>,

    /// Configuration file (defaults to $DISK_UPDATER_CONFIG or /etc/disk-updater.toml).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

/// A startup failure together with the exit status it maps to.
struct Fatal {
    code: i32,
    error: anyhow::Error,
}

trait ExitStatusExt<T> {
    fn exit_status(self, code: i32) -> std::result::Result<T, Fatal>;
}

impl<T, E: Into<anyhow::Error>> ExitStatusExt<T> for std::result::Result<T, E> {
    fn exit_status(self, code: i32) -> std::result::Result<T, Fatal> {
        self.map_err(|err| Fatal {
            code,
            error: err.into(),
        })
    }
}

/// Top-level entry: wrap run() and map errors to logs + exit codes.
pub(crate) async fn main() {
    logging::init("info");

    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(err) => {
            let code = if err.use_stderr() { EXIT_CONFIG } else { 0 };
            let _ = err.print();
            std::process::exit(code);
        }
    };

    if let Err(fatal) = run(args).await {
        error!("{:?}", fatal.error);
        std::process::exit(fatal.code);
    }
}

/// Check the environment, bring up the bus side and the worker, then serve
/// udev events until a termination signal arrives.
async fn run(args: Args) -> std::result::Result<(), Fatal> {
    let config_path = UpdaterConfig::resolve_path(args.config.as_deref());
    let mut config = UpdaterConfig::load_or_default(&config_path)
        .with_context(|| format!("failed to load config {}", config_path.display()))
        .exit_status(EXIT_CONFIG)?;
    if let Some(script) = args.script {
        config.hook.script = Some(script);
    }

    let issues = config.validate();
    if !issues.is_empty() {
        return Err(anyhow!("invalid configuration: {}", issues.join("; ")))
            .exit_status(EXIT_CONFIG);
    }

    let hook = match &config.hook.script {
        Some(script) if !script.is_file() => {
            return Err(anyhow!("hook script {} does not exist", script.display()))
                .exit_status(EXIT_HOOK_MISSING);
        }
        Some(script) => Some(PolicyHook::new(script.clone(), config.hook_poll_interval())),
        None => None,
    };

    info!("disk updater starting (config: {})", config.path.display());

    let bus = Bus::connect(&config.dbus)
        .context("failed to connect to the installer service")
        .exit_status(EXIT_INSTALLER)?;
    let compatible = bus
        .installer()
        .compatible()
        .context("failed to read the system compatible")
        .exit_status(EXIT_INSTALLER)?;
    info!("system compatible: {compatible}");

    let publisher = bus
        .serve(&config.dbus.bus_name)
        .exit_status(EXIT_BUS_NAME)?;

    let filesystems = SupportedFilesystems::load(&config.monitor.filesystems_file);
    debug!("{} block filesystems supported", filesystems.len());

    let queue = Arc::new(JobQueue::new());
    let updater = Updater::new(
        bus.installer().clone(),
        publisher,
        compatible,
        config.bundles.suffix.clone(),
        hook,
    );
    let worker = MountWorker::new(
        Arc::clone(&queue),
        SystemMounter::new(config.monitor.read_only),
        filesystems,
        config.monitor.mount_root.clone(),
        updater,
    )
    .spawn()
    .context("failed to start the mount worker")
    .exit_status(EXIT_CONFIG)?;

    let mut monitor = DiskMonitor::new(Arc::clone(&queue), config.debounce_window());
    let served = serve(&mut monitor, &config).await;

    // udev is already closed here; stop the worker before the bus goes away
    monitor.shutdown(Some(worker));
    drop(bus);

    served.exit_status(EXIT_CONFIG)?;
    info!("disk updater stopped");
    Ok(())
}

/// The event context: udev events, debounce ticks and signals.
async fn serve(monitor: &mut DiskMonitor, config: &UpdaterConfig) -> Result<()> {
    let mut source = UdevSource::new().context("failed to open udev monitor")?;
    let mut terminate = signal(SignalKind::terminate()).context("failed to hook SIGTERM")?;

    if config.monitor.scan_existing {
        let now = Instant::now();
        match existing_usb_devices() {
            Ok(events) => {
                debug!("{} block devices already present", events.len());
                for event in events {
                    monitor.handle_event(event, now);
                }
            }
            Err(err) => warn!("failed to enumerate present devices: {err}"),
        }
    }

    let mut ticker = interval(monitor.debounce_window());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            events = source.next_events() => {
                let events = events.context("failed to read udev events")?;
                let now = Instant::now();
                for event in events {
                    monitor.handle_event(event, now);
                }
            }
            _ = ticker.tick(), if monitor.has_pending() => {
                monitor.debounce_tick(Instant::now());
            }
            _ = terminate.recv() => {
                info!("received SIGTERM");
                break;
            }
            _ = tokio_signal::ctrl_c() => {
                info!("received SIGINT");
                break;
            }
        }
    }

    Ok(())
}
