//! Single-instance guard: PID lock file, liveness probe and process sweep.
//!
//! The lock file holds the decimal PID of the running bot. A lock naming a
//! process that no longer exists is stale and gets replaced on the next
//! [`ProcessGuard::acquire`].
//!
//! Concurrent starters are serialized with `flock(2)` on a sibling
//! `.<name>.guard` file, and the lock itself is published with a hard link,
//! which never replaces an existing file.

use std::fs;
use std::io::{self, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "mpb-guard";

pub const DEFAULT_LOCK_PATH: &str = "bot.lock";

pub const DEFAULT_GRACE: Duration = Duration::from_secs(1);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum GuardError {
    #[error("another instance is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    #[error("lock file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("signalling pid {pid}: {source}")]
    Signal {
        pid: u32,
        #[source]
        source: io::Error,
    },
    #[error("listing processes: {0}")]
    ProcessList(String),
}

/// What the lock file currently says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Free,
    Held { pid: u32 },
    Stale { pid: u32 },
    Unreadable { contents: String },
}

#[derive(Debug, Clone)]
pub struct ProcessGuard {
    path: PathBuf,
}

impl ProcessGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn inspect(&self) -> Result<LockState, GuardError> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LockState::Free),
            Err(source) => {
                return Err(GuardError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        Ok(match parse_pid(&contents) {
            Some(pid) if is_process_alive(pid) => LockState::Held { pid },
            Some(pid) => LockState::Stale { pid },
            None => LockState::Unreadable {
                contents: contents.trim().to_string(),
            },
        })
    }

    pub fn acquire(&self) -> Result<Ownership, GuardError> {
        let own_pid = std::process::id();
        let _serial = AcquireMutex::lock(&self.path).map_err(|source| self.io_error(source))?;

        for _ in 0..MAX_ACQUIRE_ATTEMPTS {
            match self.inspect()? {
                LockState::Held { pid } if pid != own_pid => {
                    return Err(GuardError::AlreadyRunning { pid });
                }
                LockState::Held { .. } => return Ok(self.ownership(own_pid)),
                LockState::Free => {}
                LockState::Stale { pid } => {
                    warn!(pid, path = %self.path.display(), "replacing stale lock file");
                    self.remove_lock()?;
                }
                LockState::Unreadable { contents } => {
                    warn!(%contents, path = %self.path.display(), "replacing unreadable lock file");
                    self.remove_lock()?;
                }
            }

            match publish_pid(&self.path, own_pid) {
                Ok(()) => {
                    info!(pid = own_pid, path = %self.path.display(), "process lock acquired");
                    return Ok(self.ownership(own_pid));
                }
                // Written by someone outside the guard protocol; look again.
                Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                    debug!(path = %self.path.display(), "lock file appeared while acquiring");
                }
                Err(source) => return Err(self.io_error(source)),
            }
        }
        match self.inspect()? {
            LockState::Held { pid } => Err(GuardError::AlreadyRunning { pid }),
            _ => Err(self.io_error(io::Error::new(
                io::ErrorKind::WouldBlock,
                "lock file keeps changing while acquiring",
            ))),
        }
    }

    fn ownership(&self, pid: u32) -> Ownership {
        Ownership {
            path: self.path.clone(),
            pid,
            released: false,
        }
    }

    fn io_error(&self, source: io::Error) -> GuardError {
        GuardError::Io {
            path: self.path.clone(),
            source,
        }
    }

    fn remove_lock(&self) -> Result<(), GuardError> {
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(self.io_error(source)),
        }
    }
}

/// Proof that this process holds the lock. Dropping it releases the lock.
#[derive(Debug)]
pub struct Ownership {
    path: PathBuf,
    pid: u32,
    released: bool,
}

impl Ownership {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the lock file if it still names our PID. Safe to call twice.
    pub fn release(&mut self) -> Result<(), GuardError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(source) => {
                return Err(GuardError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        };
        if parse_pid(&contents) != Some(self.pid) {
            warn!(
                path = %self.path.display(),
                "lock file no longer names this process; leaving it in place"
            );
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {
                info!(pid = self.pid, path = %self.path.display(), "process lock released");
                Ok(())
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(GuardError::Io {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

impl Drop for Ownership {
    fn drop(&mut self) {
        if let Err(err) = self.release() {
            warn!(error = %err, "releasing process lock on drop");
        }
    }
}

fn parse_pid(contents: &str) -> Option<u32> {
    contents.trim().parse::<u32>().ok().filter(|pid| *pid > 0)
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| DEFAULT_LOCK_PATH.to_string());
    path.with_file_name(format!(".{file_name}.{suffix}"))
}

/// Writes the PID to a private temp file, then links it into place so the
/// lock never appears half-written. Fails with `AlreadyExists` if a lock is there.
fn publish_pid(path: &Path, pid: u32) -> io::Result<()> {
    let tmp = sibling(path, &format!("{pid}.tmp"));
    let written = (|| {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp)?;
        write!(file, "{pid}")?;
        file.sync_all()?;
        fs::hard_link(&tmp, path)
    })();
    let _ = fs::remove_file(&tmp);
    written
}

const MAX_ACQUIRE_ATTEMPTS: usize = 3;

/// Exclusive `flock` held across inspect-and-publish. Unlocked when the file closes.
struct AcquireMutex {
    _file: fs::File,
}

impl AcquireMutex {
    fn lock(lock_path: &Path) -> io::Result<Self> {
        let file = fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(sibling(lock_path, "guard"))?;
        loop {
            // SAFETY: the descriptor is owned by `file`, which outlives the call.
            let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) };
            if rc == 0 {
                return Ok(Self { _file: file });
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(err);
            }
        }
    }
}

fn send_signal(pid: u32, signal: libc::c_int) -> io::Result<()> {
    let raw = libc::pid_t::try_from(pid)
        .ok()
        .filter(|raw| *raw > 0)
        .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, format!("invalid pid {pid}")))?;
    // SAFETY: kill(2) has no memory-safety preconditions; raw is a positive pid.
    let rc = unsafe { libc::kill(raw, signal) };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// `kill(pid, 0)` probe. `EPERM` means the process exists under another user.
pub fn is_process_alive(pid: u32) -> bool {
    match send_signal(pid, 0) {
        Ok(()) => !is_zombie(pid),
        Err(err) => err.raw_os_error() == Some(libc::EPERM),
    }
}

#[cfg(target_os = "linux")]
fn is_zombie(pid: u32) -> bool {
    // Field 3 of /proc/<pid>/stat, after the parenthesised command name.
    fs::read_to_string(format!("/proc/{pid}/stat"))
        .ok()
        .and_then(|stat| {
            let after = stat.rsplit_once(')')?.1;
            after.split_whitespace().next().map(|state| state == "Z")
        })
        .unwrap_or(false)
}

#[cfg(not(target_os = "linux"))]
fn is_zombie(_pid: u32) -> bool {
    false
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Termination {
    NotRunning,
    Exited,
    Killed,
}

/// SIGTERM, wait up to `grace`, then SIGKILL.
pub async fn terminate(pid: u32, grace: Duration) -> Result<Termination, GuardError> {
    if !is_process_alive(pid) {
        return Ok(Termination::NotRunning);
    }
    info!(pid, "sending SIGTERM");
    match send_signal(pid, libc::SIGTERM) {
        Ok(()) => {}
        Err(err) if err.raw_os_error() == Some(libc::ESRCH) => return Ok(Termination::NotRunning),
        Err(source) => return Err(GuardError::Signal { pid, source }),
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if !is_process_alive(pid) {
            info!(pid, "process exited after SIGTERM");
            return Ok(Termination::Exited);
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    if !is_process_alive(pid) {
        return Ok(Termination::Exited);
    }

    warn!(pid, "process still running after grace period, sending SIGKILL");
    match send_signal(pid, libc::SIGKILL) {
        Ok(()) => Ok(Termination::Killed),
        Err(err) if err.raw_os_error() == Some(libc::ESRCH) => Ok(Termination::Exited),
        Err(source) => Err(GuardError::Signal { pid, source }),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessEntry {
    pub pid: u32,
    pub command: String,
}

/// Parses `ps -eo pid=,args=` output. Malformed lines are skipped.
pub fn parse_ps_output(output: &str) -> Vec<ProcessEntry> {
    output
        .lines()
        .filter_map(|line| {
            let line = line.trim_start();
            let (pid, command) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            Some(ProcessEntry {
                pid: pid.parse().ok()?,
                command: command.trim().to_string(),
            })
        })
        .collect()
}

pub fn select_sweep_targets(
    entries: &[ProcessEntry],
    signature: &str,
    own_pid: u32,
    parent_pid: u32,
) -> Vec<ProcessEntry> {
    if signature.trim().is_empty() {
        return Vec::new();
    }
    entries
        .iter()
        .filter(|e| e.pid != own_pid && e.pid != parent_pid)
        .filter(|e| e.command.contains(signature))
        .filter(|e| !e.command.starts_with("grep ") && !e.command.starts_with("ps "))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SweptProcess {
    pub pid: u32,
    pub command: String,
    pub outcome: Termination,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweepReport {
    pub terminated: Vec<SweptProcess>,
    pub failed: Vec<ProcessEntry>,
}

async fn list_processes() -> Result<Vec<ProcessEntry>, GuardError> {
    let output = tokio::process::Command::new("ps")
        .args(["-eo", "pid=,args="])
        .output()
        .await
        .map_err(|e| GuardError::ProcessList(e.to_string()))?;
    if !output.status.success() {
        return Err(GuardError::ProcessList(format!(
            "ps exited with {}",
            output.status
        )));
    }
    Ok(parse_ps_output(&String::from_utf8_lossy(&output.stdout)))
}

/// Terminates every other process whose command line contains `signature`.
pub async fn sweep(signature: &str, grace: Duration) -> Result<SweepReport, GuardError> {
    let entries = list_processes().await?;
    let targets = select_sweep_targets(
        &entries,
        signature,
        std::process::id(),
        std::os::unix::process::parent_id(),
    );
    debug!(signature, candidates = targets.len(), "sweeping stray instances");

    let mut report = SweepReport::default();
    for entry in targets {
        match terminate(entry.pid, grace).await {
            Ok(outcome) => report.terminated.push(SweptProcess {
                pid: entry.pid,
                command: entry.command,
                outcome,
            }),
            Err(err) => {
                warn!(pid = entry.pid, error = %err, "could not terminate process");
                report.failed.push(entry);
            }
        }
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use std::process::{Child, Command, Stdio};

    use super::*;

    fn spawn_sleeper() -> Child {
        Command::new("sleep").arg("30").spawn().expect("spawn sleep")
    }

    #[test]
    fn missing_lock_is_free_and_acquire_writes_our_pid() {
        let dir = tempfile::tempdir().unwrap();
        let guard = ProcessGuard::new(dir.path().join("bot.lock"));
        assert_eq!(guard.inspect().unwrap(), LockState::Free);

        let ownership = guard.acquire().unwrap();
        let written = fs::read_to_string(guard.path()).unwrap();
        assert_eq!(written, std::process::id().to_string());
        assert_eq!(ownership.pid(), std::process::id());
    }

    #[test]
    fn live_holder_blocks_until_it_dies() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.lock");
        let mut child = spawn_sleeper();
        fs::write(&path, child.id().to_string()).unwrap();

        let guard = ProcessGuard::new(&path);
        match guard.acquire() {
            Err(GuardError::AlreadyRunning { pid }) => assert_eq!(pid, child.id()),
            other => panic!("expected AlreadyRunning, got {other:?}"),
        }

        child.kill().unwrap();
        child.wait().unwrap();

        assert_eq!(guard.inspect().unwrap(), LockState::Stale { pid: child.id() });
        let _ownership = guard.acquire().expect("stale lock is replaced");
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            std::process::id().to_string()
        );
    }

    const CONTENDER_LOCK_ENV: &str = "MPB_GUARD_CONTENDER_LOCK";

    /// Runs only when re-executed by `simultaneous_starters_yield_a_single_owner`.
    #[test]
    fn contender_holds_the_lock_when_asked() {
        let Ok(path) = std::env::var(CONTENDER_LOCK_ENV) else {
            return;
        };
        match ProcessGuard::new(path).acquire() {
            Ok(_ownership) => {
                println!("ACQUIRED");
                std::thread::sleep(Duration::from_millis(1500));
            }
            Err(GuardError::AlreadyRunning { .. }) => println!("BLOCKED"),
            Err(err) => println!("FAILED {err}"),
        }
    }

    #[test]
    fn simultaneous_starters_yield_a_single_owner() {
        let exe = std::env::current_exe().unwrap();
        for _ in 0..3 {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("bot.lock");
            let contenders: Vec<Child> = (0..8)
                .map(|_| {
                    Command::new(&exe)
                        .args([
                            "tests::contender_holds_the_lock_when_asked",
                            "--exact",
                            "--nocapture",
                            "--test-threads=1",
                        ])
                        .env(CONTENDER_LOCK_ENV, &path)
                        .stdout(Stdio::piped())
                        .stderr(Stdio::null())
                        .spawn()
                        .unwrap()
                })
                .collect();
            let outputs: Vec<String> = contenders
                .into_iter()
                .map(|child| {
                    String::from_utf8_lossy(&child.wait_with_output().unwrap().stdout).into_owned()
                })
                .collect();

            let owners = outputs.iter().filter(|out| out.contains("ACQUIRED")).count();
            let blocked = outputs.iter().filter(|out| out.contains("BLOCKED")).count();
            assert_eq!(owners, 1, "{outputs:#?}");
            assert_eq!(blocked, 7, "{outputs:#?}");
            assert!(!path.exists());
        }
    }

    #[test]
    fn garbage_and_empty_locks_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.lock");
        let guard = ProcessGuard::new(&path);

        for junk in ["", "not-a-pid", "0", "-12"] {
            fs::write(&path, junk).unwrap();
            assert!(matches!(guard.inspect().unwrap(), LockState::Unreadable { .. }));
            let mut ownership = guard.acquire().unwrap();
            ownership.release().unwrap();
        }
    }

    #[test]
    fn release_is_idempotent_and_respects_foreign_locks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.lock");
        let guard = ProcessGuard::new(&path);

        let mut ownership = guard.acquire().unwrap();
        ownership.release().unwrap();
        ownership.release().unwrap();
        assert!(!path.exists());

        let mut ownership = guard.acquire().unwrap();
        fs::write(&path, "424242").unwrap();
        ownership.release().unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "424242");
    }

    #[test]
    fn dropping_ownership_removes_the_lock() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bot.lock");
        {
            let _ownership = ProcessGuard::new(&path).acquire().unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn own_process_is_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(0));
    }

    #[tokio::test]
    async fn terminate_stops_a_sleeping_child() {
        let mut child = spawn_sleeper();
        let outcome = terminate(child.id(), Duration::from_secs(2)).await.unwrap();
        assert_eq!(outcome, Termination::Exited);
        child.wait().unwrap();

        let again = terminate(child.id(), Duration::from_millis(10)).await.unwrap();
        assert_eq!(again, Termination::NotRunning);
    }

    #[tokio::test]
    async fn terminate_escalates_to_sigkill_when_sigterm_is_ignored() {
        let mut child = Command::new("sh")
            .args(["-c", "trap '' TERM; exec sleep 30"])
            .spawn()
            .expect("spawn sh");
        // Let the shell install its trap before signalling.
        tokio::time::sleep(Duration::from_millis(300)).await;

        let outcome = terminate(child.id(), Duration::from_millis(300)).await.unwrap();
        assert_eq!(outcome, Termination::Killed);
        let status = child.wait().unwrap();
        assert!(!status.success());
        assert!(!is_process_alive(child.id()));
    }

    #[test]
    fn ps_output_parses_pid_and_arguments() {
        let output = "    1 /sbin/init\n  812 /usr/local/bin/mpb-cli run --source api\n garbage line\n  900\n";
        let entries = parse_ps_output(output);
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].pid, 812);
        assert_eq!(entries[1].command, "/usr/local/bin/mpb-cli run --source api");
        assert_eq!(entries[2].command, "");
    }

    #[test]
    fn sweep_targets_skip_self_parent_and_search_tools() {
        let entries = vec![
            ProcessEntry { pid: 10, command: "mpb-cli run".into() },
            ProcessEntry { pid: 11, command: "mpb-cli cleanup".into() },
            ProcessEntry { pid: 12, command: "cargo run -p mpb-cli".into() },
            ProcessEntry { pid: 13, command: "grep mpb-cli".into() },
            ProcessEntry { pid: 14, command: "nginx: worker".into() },
        ];
        let targets = select_sweep_targets(&entries, "mpb-cli", 11, 12);
        assert_eq!(targets.iter().map(|e| e.pid).collect::<Vec<_>>(), vec![10]);
        assert!(select_sweep_targets(&entries, "  ", 11, 12).is_empty());
    }
}
