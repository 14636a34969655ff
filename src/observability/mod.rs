//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! main process:
//!     tracing events → logging.rs (stderr layer + log file layer)
//!
//! worker process:
//!     tracing events → JSON on stderr
//!         → pipe → forward.rs (listener thread in the main process)
//!         → re-emitted under `skein::worker` → main process layers
//! ```
//!
//! # Design Decisions
//! - Structured logging (tracing fields) everywhere
//! - Each sink filters independently; the worker runs at the minimum of them
//! - Profiling is opt-in and wraps the worker entry from the outside

pub mod forward;
pub mod logging;
pub mod profiling;
