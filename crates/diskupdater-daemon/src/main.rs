#[cfg(target_os = "linux")]
mod daemon;

#[cfg(target_os = "linux")]
mod hotplug;

#[cfg(target_os = "linux")]
#[tokio::main(flavor = "current_thread")]
async fn main() {
    daemon::main().await;
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("disk-updater is only supported on Linux hosts.");
    std::process::exit(1);
}
