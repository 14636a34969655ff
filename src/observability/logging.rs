//! Structured logging.
//!
//! # Responsibilities
//! - Parse and order log levels (names or numeric severities)
//! - Compute the minimum level across every configured sink
//! - Install the main-process subscriber (stderr + file)
//! - Install the worker subscriber that feeds the parent's log listener
//!
//! # Design Decisions
//! - Uses tracing-subscriber layers with one `EnvFilter` per sink
//! - Per-logger levels become `target=level` directives on both sinks
//! - The worker writes JSON records to stderr; the parent re-emits them

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tracing_subscriber::filter::{EnvFilter, LevelFilter};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::Layer;

use crate::config::cli::LaunchArgs;
use crate::config::validation::validate_logging;
use crate::config::ConfigError;
use crate::lifecycle::launch::{EntryFuture, LaunchExtras, LogQueue, WorkerLaunch};

/// Log verbosity, ordered from most to least verbose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Numeric severity; lower is more verbose.
    pub fn severity(self) -> u8 {
        match self {
            LogLevel::Trace => 5,
            LogLevel::Debug => 10,
            LogLevel::Info => 20,
            LogLevel::Warn => 30,
            LogLevel::Error => 40,
        }
    }

    /// The most severe level whose severity does not exceed `severity`.
    pub fn from_severity(severity: u8) -> Self {
        match severity {
            0..=9 => LogLevel::Trace,
            10..=19 => LogLevel::Debug,
            20..=29 => LogLevel::Info,
            30..=39 => LogLevel::Warn,
            _ => LogLevel::Error,
        }
    }

    pub fn as_filter(self) -> LevelFilter {
        match self {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid log level '{0}' (expected trace, debug, info, warn, error or a number)")]
pub struct ParseLevelError(String);

impl FromStr for LogLevel {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(severity) = s.parse::<u8>() {
            return Ok(LogLevel::from_severity(severity));
        }
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" | "critical" => Ok(LogLevel::Error),
            _ => Err(ParseLevelError(s.to_string())),
        }
    }
}

/// One `--log-level` value: `LEVEL` or `LOGGER=LEVEL`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogLevelDirective {
    /// `None` sets the default level.
    pub logger: Option<String>,
    pub level: LogLevel,
}

impl FromStr for LogLevelDirective {
    type Err = ParseLevelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('=') {
            Some((logger, level)) if !logger.is_empty() => Ok(Self {
                logger: Some(logger.to_string()),
                level: level.parse()?,
            }),
            Some(_) => Err(ParseLevelError(s.to_string())),
            None => Ok(Self {
                logger: None,
                level: s.parse()?,
            }),
        }
    }
}

/// Default stderr level when nothing is configured.
pub const DEFAULT_STDERR_LEVEL: LogLevel = LogLevel::Info;

/// Default file level when nothing is configured.
pub const DEFAULT_FILE_LEVEL: LogLevel = LogLevel::Debug;

/// Resolved sink levels for the main process.
#[derive(Debug, Clone, PartialEq)]
pub struct LoggingPlan {
    pub stderr_level: LogLevel,
    pub file_level: LogLevel,
    /// Explicit per-logger levels, in command-line order.
    pub logger_levels: Vec<(String, LogLevel)>,
    pub logfile: PathBuf,
}

impl LoggingPlan {
    /// Resolve sink levels from the command line.
    ///
    /// A default `--log-level` combined with `--stderr-log-level` is rejected.
    pub fn from_args(args: &LaunchArgs, logfile: PathBuf) -> Result<Self, ConfigError> {
        validate_logging(args)?;

        let default_level = args
            .log_levels
            .iter()
            .rev()
            .find(|d| d.logger.is_none())
            .map(|d| d.level);

        let logger_levels = args
            .log_levels
            .iter()
            .filter_map(|d| d.logger.clone().map(|logger| (logger, d.level)))
            .collect();

        Ok(Self {
            stderr_level: args
                .stderr_log_level
                .or(default_level)
                .unwrap_or(DEFAULT_STDERR_LEVEL),
            file_level: args.file_log_level.unwrap_or(DEFAULT_FILE_LEVEL),
            logger_levels,
            logfile,
        })
    }

    /// Lowest level any sink or logger will let through.
    pub fn min_level(&self) -> LogLevel {
        self.logger_levels
            .iter()
            .map(|(_, level)| *level)
            .chain([self.stderr_level, self.file_level])
            .min()
            .unwrap_or(self.stderr_level)
    }

    fn filter_for(&self, sink_level: LogLevel) -> Result<EnvFilter, LoggingError> {
        let mut directives = vec![sink_level.as_str().to_string()];
        directives.extend(
            self.logger_levels
                .iter()
                .map(|(logger, level)| format!("{}={}", logger, level)),
        );
        EnvFilter::try_new(directives.join(",")).map_err(|e| LoggingError::Filter(e.to_string()))
    }
}

#[derive(Debug, Error)]
pub enum LoggingError {
    #[error("invalid logging directive: {0}")]
    Filter(String),

    #[error("cannot open log file {}: {source}", .path.display())]
    LogFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("a global log subscriber is already installed")]
    AlreadyInstalled,
}

/// Install the main-process subscriber: stderr plus the debug log file.
pub fn init_main_logging(plan: &LoggingPlan) -> Result<(), LoggingError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&plan.logfile)
        .map_err(|source| LoggingError::LogFile {
            path: plan.logfile.clone(),
            source,
        })?;

    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_filter(plan.filter_for(plan.stderr_level)?);

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .with_filter(plan.filter_for(plan.file_level)?);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .map_err(|_| LoggingError::AlreadyInstalled)
}

/// Install the worker subscriber described by `extras`.
pub fn init_worker_logging(extras: &LaunchExtras) -> Result<(), LoggingError> {
    let level = LogLevel::from_severity(extras.log_level).as_filter();

    let result = match extras.log_queue {
        LogQueue::ParentStderr => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr)
                    .with_filter(level),
            )
            .try_init(),
        LogQueue::Disabled => tracing_subscriber::registry()
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(std::io::stderr)
                    .with_filter(level),
            )
            .try_init(),
    };
    result.map_err(|_| LoggingError::AlreadyInstalled)
}

/// Wrap a worker entry so its logging is configured before it runs.
pub fn with_queued_logging<F>(entry: F) -> impl FnOnce(WorkerLaunch) -> EntryFuture
where
    F: FnOnce(WorkerLaunch) -> EntryFuture + 'static,
{
    move |launch| {
        if let Err(e) = init_worker_logging(&launch.extras) {
            eprintln!("worker logging not configured: {}", e);
        }
        entry(launch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args_with(levels: &[&str], stderr: Option<LogLevel>, file: Option<LogLevel>) -> LaunchArgs {
        LaunchArgs {
            log_levels: levels.iter().map(|l| l.parse().unwrap()).collect(),
            stderr_log_level: stderr,
            file_log_level: file,
            ..LaunchArgs::default()
        }
    }

    #[test]
    fn test_level_parsing() {
        assert_eq!("INFO".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warning".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("15".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert!("loud".parse::<LogLevel>().is_err());
    }

    #[test]
    fn test_directive_parsing() {
        let d: LogLevelDirective = "skein::ipc=trace".parse().unwrap();
        assert_eq!(d.logger.as_deref(), Some("skein::ipc"));
        assert_eq!(d.level, LogLevel::Trace);

        let d: LogLevelDirective = "error".parse().unwrap();
        assert_eq!(d.logger, None);

        assert!("=debug".parse::<LogLevelDirective>().is_err());
    }

    #[test]
    fn test_min_level_spans_every_sink() {
        let plan = LoggingPlan::from_args(
            &args_with(&["skein::ipc=trace"], Some(LogLevel::Warn), Some(LogLevel::Info)),
            PathBuf::from("skein.log"),
        )
        .unwrap();
        assert_eq!(plan.min_level(), LogLevel::Trace);

        let plan = LoggingPlan::from_args(
            &args_with(&[], Some(LogLevel::Error), Some(LogLevel::Warn)),
            PathBuf::from("skein.log"),
        )
        .unwrap();
        assert_eq!(plan.min_level(), LogLevel::Warn);
    }

    #[test]
    fn test_defaults() {
        let plan = LoggingPlan::from_args(&LaunchArgs::default(), PathBuf::from("skein.log")).unwrap();
        assert_eq!(plan.stderr_level, DEFAULT_STDERR_LEVEL);
        assert_eq!(plan.file_level, DEFAULT_FILE_LEVEL);
        assert_eq!(plan.min_level(), LogLevel::Debug);
    }

    #[test]
    fn test_default_log_level_drives_stderr() {
        let plan =
            LoggingPlan::from_args(&args_with(&["warn"], None, None), PathBuf::from("skein.log"))
                .unwrap();
        assert_eq!(plan.stderr_level, LogLevel::Warn);
    }

    #[test]
    fn test_ambiguous_stderr_configuration() {
        let err = LoggingPlan::from_args(
            &args_with(&["debug"], Some(LogLevel::Info), None),
            PathBuf::from("skein.log"),
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::AmbiguousLogging));

        // Per-logger levels alongside --stderr-log-level are fine.
        assert!(LoggingPlan::from_args(
            &args_with(&["skein=debug"], Some(LogLevel::Info), None),
            PathBuf::from("skein.log"),
        )
        .is_ok());
    }
}
