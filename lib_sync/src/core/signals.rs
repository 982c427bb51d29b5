//! # Process Lifecycle Hooks
//!
//! Wires the registry's `cleanup()` to the process-lifecycle signals, so a
//! terminated or backgrounded process never leaks timers or in-flight work.
//! SIGINT, SIGTERM and SIGHUP all fire the same teardown; relying on a
//! single signal is not enough because supervisors and terminals differ in
//! which one they deliver.

use crate::core::registry::CleanupRegistry;

/// Installs the signal watchers once, process-wide. Whichever signal arrives
/// first runs `cleanup()`; later ones are no-ops thanks to idempotence.
///
/// # Errors
/// Returns the OS error if a signal listener cannot be installed.
#[cfg(unix)]
pub fn install_signal_hooks(
    registry: CleanupRegistry,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut hangup = signal(SignalKind::hangup())?;

    Ok(tokio::spawn(async move {
        tokio::select! {
            _ = interrupt.recv() => log::info!("SIGINT received. Running registry cleanup..."),
            _ = terminate.recv() => log::info!("SIGTERM received. Running registry cleanup..."),
            _ = hangup.recv() => log::info!("SIGHUP received. Running registry cleanup..."),
        }
        registry.cleanup();
    }))
}

/// Non-unix fallback: Ctrl-C is the only portable lifecycle signal.
#[cfg(not(unix))]
pub fn install_signal_hooks(
    registry: CleanupRegistry,
) -> std::io::Result<tokio::task::JoinHandle<()>> {
    Ok(tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                log::info!("Ctrl-C received. Running registry cleanup...");
                registry.cleanup();
            }
            Err(e) => log::error!("Failed to listen for Ctrl-C: {}", e),
        }
    }))
}
