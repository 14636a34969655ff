//! OS signal handling.
//!
//! # Responsibilities
//! - Wait for a termination signal (SIGINT, SIGTERM, SIGQUIT)
//! - Report which signal arrived so it can be logged
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - `ctrl_c` is awaited as a fallback, and is the only source off unix
//! - Every termination signal maps to the same interrupt reason

/// Resolve when the process receives a termination signal.
#[cfg(unix)]
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let name = tokio::select! {
        _ = tokio::signal::ctrl_c() => "SIGINT",
        _ = sigint.recv() => "SIGINT",
        _ = sigterm.recv() => "SIGTERM",
        _ = sigquit.recv() => "SIGQUIT",
    };
    Ok(name)
}

#[cfg(not(unix))]
pub async fn shutdown_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await?;
    Ok("CTRL+C")
}

/// Like [`shutdown_signal`], but never resolves if handlers cannot be installed.
pub async fn shutdown_signal_or_pending() -> &'static str {
    match shutdown_signal().await {
        Ok(name) => name,
        Err(e) => {
            tracing::warn!(error = %e, "Signal handlers unavailable, relying on events only");
            std::future::pending().await
        }
    }
}
