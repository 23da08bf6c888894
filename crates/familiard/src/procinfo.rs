//! Operating-system process inspection and signalling.
//!
//! Liveness uses `kill(pid, 0)`; identity checks read `/proc/<pid>/stat` and
//! `/proc/<pid>/cmdline` where procfs is available.

use nix::errno::Errno;
use nix::sys::signal::{kill, killpg, Signal};
use nix::unistd::Pid;

/// Result of probing a PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Running,
    Gone,
    /// The probe itself failed for an unexpected reason.
    Unknown,
}

fn pid_of(pid: u32) -> Option<Pid> {
    // 0 and negative values address process groups, never a single process.
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

pub fn probe(pid: u32) -> Liveness {
    let Some(pid) = pid_of(pid) else {
        return Liveness::Gone;
    };
    match kill(pid, None) {
        Ok(()) | Err(Errno::EPERM) => Liveness::Running,
        Err(Errno::ESRCH) => Liveness::Gone,
        Err(_) => Liveness::Unknown,
    }
}

pub fn is_running(pid: u32) -> bool {
    probe(pid) == Liveness::Running
}

/// Fields of `/proc/<pid>/stat` used for identity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcStat {
    pub state: char,
    /// Start time in clock ticks since boot.
    pub start_ticks: u64,
}

impl ProcStat {
    pub fn is_zombie(&self) -> bool {
        matches!(self.state, 'Z' | 'X')
    }
}

/// Parse the contents of a `/proc/<pid>/stat` file.
pub fn parse_stat(contents: &str) -> Option<ProcStat> {
    // The command name is parenthesized and may itself contain spaces or parens.
    let rest = &contents[contents.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let state = fields.first()?.chars().next()?;
    // Field 22 overall; fields here start at field 3.
    let start_ticks = fields.get(19)?.parse().ok()?;
    Some(ProcStat { state, start_ticks })
}

pub fn read_stat(pid: u32) -> Option<ProcStat> {
    std::fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|s| parse_stat(&s))
}

pub fn read_cmdline(pid: u32) -> Option<Vec<String>> {
    let raw = std::fs::read(format!("/proc/{pid}/cmdline")).ok()?;
    Some(
        raw.split(|b| *b == 0)
            .filter(|part| !part.is_empty())
            .map(|part| String::from_utf8_lossy(part).into_owned())
            .collect(),
    )
}

/// Whether procfs is mounted, i.e. identity checks are possible at all.
pub fn procfs_available() -> bool {
    std::path::Path::new("/proc/self/stat").exists()
}

pub fn signal(pid: u32, sig: Signal) -> nix::Result<()> {
    match pid_of(pid) {
        Some(pid) => kill(pid, sig),
        None => Err(Errno::ESRCH),
    }
}

/// Signal every process in the group led by `pgid`.
pub fn signal_group(pgid: u32, sig: Signal) -> nix::Result<()> {
    match pid_of(pgid) {
        Some(pgid) => killpg(pgid, sig),
        None => Err(Errno::ESRCH),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_stat_with_awkward_command_name() {
        let line = "1234 (my (weird) cmd) S 1 1234 1234 0 -1 4194560 100 0 0 0 5 3 0 0 20 0 1 0 987654 1000000 200";
        let stat = parse_stat(line).unwrap();
        assert_eq!(stat.state, 'S');
        assert_eq!(stat.start_ticks, 987_654);
        assert!(!stat.is_zombie());

        let zombie = "9 (x) Z 1 9 9 0 -1 0 0 0 0 0 0 0 0 0 20 0 1 0 55 0 0";
        assert!(parse_stat(zombie).unwrap().is_zombie());
        assert!(parse_stat("garbage").is_none());
    }

    #[test]
    fn probe_sees_own_process() {
        assert_eq!(probe(std::process::id()), Liveness::Running);
        assert_eq!(probe(0), Liveness::Gone);
    }

    #[test]
    fn own_stat_and_cmdline_are_readable_when_procfs_exists() {
        if !procfs_available() {
            return;
        }
        let pid = std::process::id();
        assert!(read_stat(pid).is_some());
        assert!(!read_cmdline(pid).unwrap().is_empty());
    }
}
