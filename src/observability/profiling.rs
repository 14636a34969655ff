//! Optional wall-clock profiling of the worker entry.

use std::time::Instant;
use tracing::Instrument;

use crate::lifecycle::launch::{EntryFuture, WorkerLaunch};

/// Wrap a worker entry so it is timed when `extras.profile` is set.
///
/// Apply outermost, so the measured routine already has logging configured.
pub fn with_profiling<F>(label: &'static str, entry: F) -> impl FnOnce(WorkerLaunch) -> EntryFuture
where
    F: FnOnce(WorkerLaunch) -> EntryFuture + 'static,
{
    move |launch| {
        if !launch.extras.profile {
            return entry(launch);
        }

        Box::pin(async move {
            let started = Instant::now();
            let span = tracing::info_span!("profile", routine = label);
            let result = entry(launch).instrument(span).await;
            tracing::info!(
                routine = label,
                elapsed_ms = started.elapsed().as_millis() as u64,
                ok = result.is_ok(),
                "Profiled run finished"
            );
            result
        })
    }
}
