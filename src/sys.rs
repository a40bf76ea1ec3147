//! Process inspection helpers

use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;
use std::fs;
use std::path::Path;

/// Check whether a process with this PID exists
///
/// Uses `kill(pid, 0)`: EPERM still means the process is there.
pub fn pid_alive(pid: u32) -> bool {
    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    if raw <= 0 {
        return false;
    }
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Read a process's argument vector from `/proc/<pid>/cmdline`
///
/// Returns `None` when the process is gone or has no command line
/// (kernel threads, zombies).
pub fn read_cmdline(pid: u32) -> Option<Vec<String>> {
    read_cmdline_from(&Path::new("/proc").join(pid.to_string()).join("cmdline"))
}

fn read_cmdline_from(path: &Path) -> Option<Vec<String>> {
    let raw = fs::read(path).ok()?;
    let argv = parse_cmdline(&raw);
    (!argv.is_empty()).then_some(argv)
}

/// Split a NUL-separated, NUL-terminated command line
pub fn parse_cmdline(raw: &[u8]) -> Vec<String> {
    let Some(end) = raw.iter().rposition(|b| *b != 0) else {
        return Vec::new();
    };
    raw[..=end]
        .split(|b| *b == 0)
        .map(|arg| String::from_utf8_lossy(arg).into_owned())
        .collect()
}

/// Write the current PID to a file
pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    fs::write(path, std::process::id().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cmdline() {
        assert_eq!(
            parse_cmdline(b"python3\0api/api.py\0--api\0"),
            vec!["python3", "api/api.py", "--api"]
        );
        assert_eq!(parse_cmdline(b"sleep\0\0"), vec!["sleep"]);
        assert!(parse_cmdline(b"").is_empty());
    }

    #[test]
    fn test_own_process_is_alive() {
        let pid = std::process::id();
        assert!(pid_alive(pid));
        let argv = read_cmdline(pid).unwrap();
        assert!(!argv.is_empty());
    }

    #[test]
    fn test_invalid_pid_is_dead() {
        assert!(!pid_alive(0));
        assert!(!pid_alive(u32::MAX));
        assert!(read_cmdline(u32::MAX).is_none());
    }

    #[test]
    fn test_write_pid_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run").join("rigwarden.pid");
        write_pid_file(&path).unwrap();
        let content = fs::read_to_string(&path).unwrap();
        assert_eq!(content, std::process::id().to_string());
    }
}
