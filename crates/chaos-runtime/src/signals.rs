//! OS termination signals.
//!
//! On Unix, SIGINT, SIGTERM and SIGQUIT each map onto
//! [`TerminationReason::Signal`]. Elsewhere only Ctrl-C is observed.

use chaos_core::TerminationReason;

/// Wait for the first termination signal and return its name.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

/// Wait for the first termination signal and return its name.
#[cfg(not(unix))]
pub async fn wait_for_shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("CTRL_C")
}

/// Resolve when the process is asked to terminate.
///
/// If signal handlers cannot be installed this never resolves, leaving the
/// other triggers (explicit stop, fatal errors) in charge.
pub async fn shutdown_signal() -> TerminationReason {
    match wait_for_shutdown_signal().await {
        Ok(name) => {
            tracing::info!(signal = name, "Received shutdown signal");
            TerminationReason::Signal(name)
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to install signal handlers");
            std::future::pending().await
        }
    }
}
