//! Process-id file guarding a data directory.
//!
//! The worker holds an exclusive `fs2` lock on `pids/<name>.pid` for as
//! long as it runs. A second worker pointed at the same data directory
//! fails to take the lock and aborts. The file is unlocked and removed
//! on drop.

use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PidFileError {
    #[error("cannot open pid file {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{name} is already running (pid {pid:?}, pid file {})", .path.display())]
    AlreadyRunning {
        name: String,
        pid: Option<u32>,
        path: PathBuf,
    },

    #[error("cannot write pid file {}: {source}", .path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An exclusively held pid file.
#[derive(Debug)]
pub struct ProcessIdFile {
    file: File,
    path: PathBuf,
    pid: u32,
}

impl ProcessIdFile {
    /// Lock `<dir>/<name>.pid` and write the current pid into it.
    pub fn acquire(dir: &Path, name: &str) -> Result<Self, PidFileError> {
        let path = dir.join(format!("{}.pid", name));

        // Not truncated before locking: the current holder's pid must survive.
        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|source| PidFileError::Open {
                path: path.clone(),
                source,
            })?;

        if file.try_lock_exclusive().is_err() {
            return Err(PidFileError::AlreadyRunning {
                name: name.to_string(),
                pid: read_pid(&mut file),
                path,
            });
        }

        let pid = std::process::id();
        if let Err(source) = write_pid(&mut file, pid) {
            let _ = FileExt::unlock(&file);
            return Err(PidFileError::Write { path, source });
        }

        tracing::debug!(path = %path.display(), pid, "Pid file acquired");
        Ok(Self { file, path, pid })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }
}

impl Drop for ProcessIdFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
        let _ = FileExt::unlock(&self.file);
        tracing::debug!(path = %self.path.display(), "Pid file released");
    }
}

fn write_pid(file: &mut File, pid: u32) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "{}", pid)?;
    file.sync_all()
}

fn read_pid(file: &mut File) -> Option<u32> {
    let mut content = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut content).ok()?;
    content.trim().parse().ok()
}
