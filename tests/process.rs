//! The real binary: main process, networking process and the signal path.

#![cfg(unix)]

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use skein::lifecycle::shutdown::INTERRUPT_REASON;
use skein::plugins::cleanup::FIX_UNCLEAN_SHUTDOWN;

const READY_TIMEOUT: Duration = Duration::from_secs(15);
const EXIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Line the networking process logs once its service runs. It only reaches
/// the main process's stderr through log forwarding.
const READY_LINE: &str = "Networking service running";

/// A `skein` process with its stderr collected line by line.
struct Node {
    child: Child,
    lines: Arc<Mutex<Vec<String>>>,
    reader: Option<JoinHandle<()>>,
}

impl Node {
    fn start(root: &Path, args: &[&str]) -> Self {
        let mut child = Command::new(env!("CARGO_BIN_EXE_skein"))
            .args(args)
            .env("XDG_SKEIN_ROOT", root)
            .env("NO_COLOR", "1")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .unwrap();

        let stderr = child.stderr.take().unwrap();
        let lines = Arc::new(Mutex::new(Vec::new()));
        let reader = thread::spawn({
            let lines = lines.clone();
            move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    lines.lock().unwrap().push(line);
                }
            }
        });

        Self {
            child,
            lines,
            reader: Some(reader),
        }
    }

    fn output(&self) -> Vec<String> {
        self.lines.lock().unwrap().clone()
    }

    fn logged(&self, pred: impl Fn(&str) -> bool) -> bool {
        self.output().iter().any(|line| pred(line))
    }

    fn wait_for_line(&mut self, needle: &str) {
        let deadline = Instant::now() + READY_TIMEOUT;
        while !self.logged(|line| line.contains(needle)) {
            if let Ok(Some(status)) = self.child.try_wait() {
                panic!("skein exited ({}) early:\n{}", status, self.output().join("\n"));
            }
            if Instant::now() >= deadline {
                panic!("no '{}' line:\n{}", needle, self.output().join("\n"));
            }
            thread::sleep(Duration::from_millis(50));
        }
    }

    fn interrupt(&self) {
        kill(Pid::from_raw(self.child.id() as i32), Signal::SIGINT).unwrap();
    }

    fn wait_exit(&mut self) -> ExitStatus {
        let deadline = Instant::now() + EXIT_TIMEOUT;
        let status = loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                break status;
            }
            if Instant::now() >= deadline {
                let _ = self.child.kill();
                panic!("skein did not exit:\n{}", self.output().join("\n"));
            }
            thread::sleep(Duration::from_millis(50));
        };
        if let Some(reader) = self.reader.take() {
            reader.join().unwrap();
        }
        status
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

#[test]
fn test_interrupt_shuts_down_both_processes() {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("mainnet");

    let mut node = Node::start(root.path(), &[]);
    node.wait_for_line(READY_LINE);
    assert!(data_dir.join("pids/main.pid").exists());
    assert!(data_dir.join("pids/networking.pid").exists());
    assert!(data_dir.join("ipc/broker.sock").exists());

    node.interrupt();
    let status = node.wait_exit();
    let output = node.output().join("\n");
    assert!(status.success(), "exit {}:\n{}", status, output);

    assert!(node.logged(|line| line.contains("|___/")), "{}", output);
    assert!(
        node.logged(|line| line.contains(&format!("Shutdown complete ({})", INTERRUPT_REASON))),
        "{}",
        output
    );
    assert!(
        node.logged(|line| line.contains("Shutting down") && line.contains(INTERRUPT_REASON)),
        "{}",
        output
    );
    assert!(
        node.logged(|line| line.contains("skein::worker") && line.contains(READY_LINE)),
        "{}",
        output
    );
    assert!(
        node.logged(|line| line.contains("skein::worker") && line.contains("Networking process shutting down")),
        "{}",
        output
    );

    assert!(!data_dir.join("pids/main.pid").exists());
    assert!(!data_dir.join("pids/networking.pid").exists());
    assert!(!data_dir.join("ipc/broker.sock").exists());
}

#[test]
fn test_second_instance_leaves_the_first_running() {
    let root = tempfile::tempdir().unwrap();
    let endpoint = root.path().join("mainnet/ipc/broker.sock");

    let mut first = Node::start(root.path(), &[]);
    first.wait_for_line(READY_LINE);

    let mut second = Node::start(root.path(), &[]);
    let status = second.wait_exit();
    let output = second.output().join("\n");
    assert_eq!(status.code(), Some(1), "{}", output);
    assert!(output.contains("already running"), "{}", output);
    assert!(!output.contains(READY_LINE), "{}", output);

    assert!(endpoint.exists());
    assert!(first.child.try_wait().unwrap().is_none());

    first.interrupt();
    assert!(first.wait_exit().success());
    assert!(!endpoint.exists());
}

#[test]
fn test_fix_unclean_shutdown_removes_leftovers() {
    let root = tempfile::tempdir().unwrap();
    let data_dir = root.path().join("mainnet");

    // First run only initializes the data directory.
    assert!(Node::start(root.path(), &[FIX_UNCLEAN_SHUTDOWN]).wait_exit().success());

    let stale_pid = data_dir.join("pids/networking.pid");
    std::fs::write(&stale_pid, "4242").unwrap();
    let stale_socket = data_dir.join("ipc/broker.sock");
    drop(std::os::unix::net::UnixListener::bind(&stale_socket).unwrap());

    let mut node = Node::start(root.path(), &[FIX_UNCLEAN_SHUTDOWN]);
    let status = node.wait_exit();
    let output = node.output().join("\n");
    assert!(status.success(), "{}", output);
    assert!(!output.contains(READY_LINE), "{}", output);
    assert!(!stale_pid.exists());
    assert!(!stale_socket.exists());
    assert!(!data_dir.join("pids/main.pid").exists());
}
