//! Log fan-in from the worker process.
//!
//! The worker writes one JSON record per line to its stderr. The main
//! process drains that pipe on a dedicated thread and re-emits every
//! record through its own subscriber under the `skein::worker` target,
//! so worker output reaches the same stderr and file sinks.

use serde_json::{Map, Value};
use std::io::{self, BufRead, BufReader, Read};
use std::thread::{self, JoinHandle};

use crate::observability::logging::LogLevel;

/// A worker log line, decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardedRecord {
    pub level: LogLevel,
    /// Target the record was emitted under in the worker.
    pub origin: Option<String>,
    pub message: String,
    /// Remaining structured fields, rendered as JSON.
    pub fields: Option<String>,
}

impl ForwardedRecord {
    /// Decode a line written by the worker's JSON formatter.
    ///
    /// Anything that is not such a record is kept verbatim at warn level.
    pub fn parse(line: &str) -> Self {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(record)) => Self::from_json(record),
            _ => Self::raw(line),
        }
    }

    fn from_json(mut record: Map<String, Value>) -> Self {
        let level = record
            .get("level")
            .and_then(Value::as_str)
            .and_then(|level| level.parse().ok())
            .unwrap_or(LogLevel::Info);
        let origin = record
            .get("target")
            .and_then(Value::as_str)
            .map(str::to_string);

        let mut fields = match record.remove("fields") {
            Some(Value::Object(fields)) => fields,
            _ => Map::new(),
        };
        let message = match fields.remove("message") {
            Some(Value::String(message)) => message,
            Some(other) => other.to_string(),
            None => String::new(),
        };
        let fields = (!fields.is_empty()).then(|| Value::Object(fields).to_string());

        Self {
            level,
            origin,
            message,
            fields,
        }
    }

    fn raw(line: &str) -> Self {
        Self {
            level: LogLevel::Warn,
            origin: None,
            message: line.to_string(),
            fields: None,
        }
    }

    /// Re-emit through the current subscriber.
    pub fn emit(&self) {
        let origin = self.origin.as_deref().unwrap_or("-");
        let fields = self.fields.as_deref().unwrap_or("");
        match self.level {
            LogLevel::Trace => {
                tracing::trace!(target: "skein::worker", origin, fields, "{}", self.message)
            }
            LogLevel::Debug => {
                tracing::debug!(target: "skein::worker", origin, fields, "{}", self.message)
            }
            LogLevel::Info => {
                tracing::info!(target: "skein::worker", origin, fields, "{}", self.message)
            }
            LogLevel::Warn => {
                tracing::warn!(target: "skein::worker", origin, fields, "{}", self.message)
            }
            LogLevel::Error => {
                tracing::error!(target: "skein::worker", origin, fields, "{}", self.message)
            }
        }
    }
}

/// Background thread draining a worker's log stream.
#[derive(Debug)]
pub struct LogListener {
    handle: JoinHandle<u64>,
}

impl LogListener {
    /// Start draining `stream` until it reaches end of file.
    pub fn spawn<R>(stream: R) -> io::Result<Self>
    where
        R: Read + Send + 'static,
    {
        let handle = thread::Builder::new()
            .name("skein-log-listener".into())
            .spawn(move || drain(BufReader::new(stream)))?;
        Ok(Self { handle })
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the stream to close. Returns the number of records forwarded.
    pub fn join(self) -> u64 {
        self.handle.join().unwrap_or(0)
    }
}

fn drain<R: BufRead>(reader: R) -> u64 {
    let mut forwarded = 0;
    for line in reader.lines() {
        let line = match line {
            Ok(line) => line,
            Err(e) => {
                tracing::debug!(error = %e, "Worker log stream closed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }
        ForwardedRecord::parse(&line).emit();
        forwarded += 1;
    }
    forwarded
}
