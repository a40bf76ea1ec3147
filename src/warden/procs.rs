//! Process table abstraction
//!
//! The supervisor only needs two things from the OS: start a command with
//! its output captured, and read back the command line of a PID.

use crate::error::{Error, Result};
use crate::sys;
use std::collections::HashMap;
use std::fs::{self, File};
use std::io;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use tracing::debug;

/// Launch and inspect processes
pub trait ProcessTable {
    /// Start `argv`, redirecting output into `log_dir/<name>.stdout|stderr`
    fn launch(&mut self, name: &str, argv: &[String], log_dir: &Path) -> Result<u32>;

    /// Command line of a live process, `None` if it no longer exists
    fn cmdline(&mut self, pid: u32) -> Option<Vec<String>>;

    /// Collect every exited child, checked or not. Returns how many were reaped.
    fn reap(&mut self) -> usize;
}

/// Process table backed by real child processes and `/proc`
#[derive(Default)]
pub struct OsProcessTable {
    children: HashMap<u32, Child>,
}

impl OsProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collect an exited child so it does not linger as a zombie
    fn reap_one(&mut self, pid: u32) -> bool {
        let Some(child) = self.children.get_mut(&pid) else {
            return false;
        };
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!("Reaped process {} ({})", pid, status);
                self.children.remove(&pid);
                true
            }
            Ok(None) => false,
            Err(_) => {
                self.children.remove(&pid);
                true
            }
        }
    }
}

impl ProcessTable for OsProcessTable {
    fn launch(&mut self, name: &str, argv: &[String], log_dir: &Path) -> Result<u32> {
        let launch_error = |source: io::Error| Error::LaunchFailed {
            name: name.to_string(),
            source,
        };

        let (program, args) = argv.split_first().ok_or_else(|| {
            launch_error(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty command line",
            ))
        })?;

        fs::create_dir_all(log_dir).map_err(launch_error)?;
        let stdout = File::create(log_dir.join(format!("{}.stdout", name))).map_err(launch_error)?;
        let stderr = File::create(log_dir.join(format!("{}.stderr", name))).map_err(launch_error)?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .spawn()
            .map_err(launch_error)?;

        let pid = child.id();
        self.children.insert(pid, child);
        Ok(pid)
    }

    fn cmdline(&mut self, pid: u32) -> Option<Vec<String>> {
        if self.reap_one(pid) || !sys::pid_alive(pid) {
            return None;
        }
        sys::read_cmdline(pid)
    }

    fn reap(&mut self) -> usize {
        let before = self.children.len();
        self.children.retain(|pid, child| match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                debug!("Reaped process {} ({})", pid, status);
                false
            }
            Err(_) => false,
        });
        before - self.children.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_launch_and_inspect() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = OsProcessTable::new();
        let command = argv(&["sleep", "30"]);

        let pid = table.launch("sleeper", &command, dir.path()).unwrap();
        assert_eq!(table.cmdline(pid), Some(command));
        assert!(dir.path().join("sleeper.stdout").exists());
        assert!(dir.path().join("sleeper.stderr").exists());

        table.children.get_mut(&pid).unwrap().kill().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while table.cmdline(pid).is_some() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(table.cmdline(pid), None);
    }

    #[test]
    fn test_output_is_captured() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = OsProcessTable::new();
        let pid = table
            .launch("echo", &argv(&["echo", "hashrate"]), dir.path())
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while table.cmdline(pid).is_some() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(20));
        }
        let out = fs::read_to_string(dir.path().join("echo.stdout")).unwrap();
        assert_eq!(out.trim(), "hashrate");
    }

    #[test]
    fn test_reap_collects_unchecked_children() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = OsProcessTable::new();
        let done = table.launch("done", &argv(&["true"]), dir.path()).unwrap();
        let sleeper = table
            .launch("sleeper", &argv(&["sleep", "30"]), dir.path())
            .unwrap();

        let mut reaped = 0;
        let deadline = Instant::now() + Duration::from_secs(5);
        while table.children.contains_key(&done) && Instant::now() < deadline {
            reaped += table.reap();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert_eq!(reaped, 1);
        assert!(!table.children.contains_key(&done));
        assert!(table.children.contains_key(&sleeper));

        table.children.get_mut(&sleeper).unwrap().kill().unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while !table.children.is_empty() && Instant::now() < deadline {
            table.reap();
            std::thread::sleep(Duration::from_millis(20));
        }
        assert!(table.children.is_empty());
    }

    #[test]
    fn test_launch_failures() {
        let dir = tempfile::tempdir().unwrap();
        let mut table = OsProcessTable::new();

        let err = table.launch("empty", &[], dir.path()).unwrap_err();
        assert!(matches!(err, Error::LaunchFailed { ref name, .. } if name == "empty"));

        let err = table
            .launch("missing", &argv(&["/nonexistent/rigwarden-test-binary"]), dir.path())
            .unwrap_err();
        assert!(matches!(err, Error::LaunchFailed { .. }));
    }
}
