//! Application plumbing: logging and signal-driven shutdown.

pub mod logging;

use log::info;
use tokio_util::sync::CancellationToken;

/// Spawns a task that cancels `root` on SIGINT/SIGTERM. A second signal
/// aborts the process immediately.
pub fn install_signal_handler(root: CancellationToken) {
    tokio::spawn(async move {
        if wait_for_signal().await {
            info!("Shutdown signal received; finishing in-flight work");
            root.cancel();
            if wait_for_signal().await {
                std::process::exit(130);
            }
        }
    });
}

#[cfg(unix)]
async fn wait_for_signal() -> bool {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => return false,
    };
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.is_ok(),
        _ = term.recv() => true,
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() -> bool {
    tokio::signal::ctrl_c().await.is_ok()
}
