//! Singleton lock.
//!
//! At most one node runs per host. The running node keeps a JSON lock record
//! in the state directory plus a plain PID file. A record is honoured only
//! while its process is alive and the record is younger than
//! [`LOCK_TIMEOUT`]; anything else is stale and replaced.
//!
//! Reading the record and writing ours happen while holding an OS advisory
//! lock on a sibling `.guard` file, so two nodes starting at the same moment
//! cannot both win.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use air_p2p::clock::now_millis;

use crate::env::EnvVars;
use crate::paths::AirPaths;

/// Age after which a lock record is stale even if its process lives.
pub const LOCK_TIMEOUT: Duration = Duration::from_secs(10 * 60);

/// Setting this variable to `true` skips the lock entirely.
pub const BYPASS_VAR: &str = "FORCE_AIR";

/// Lock errors.
#[derive(Debug, Error)]
pub enum LockError {
    /// Reading or writing lock files failed.
    #[error("Lock file I/O failed: {0}")]
    Io(#[from] io::Error),

    /// The record could not be encoded.
    #[error("Failed to encode lock record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Contents of the lock file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockRecord {
    pub pid: u32,
    /// Acquisition time, ms since the epoch.
    pub started_at: u64,
    pub port: u16,
    pub location: String,
    pub owner: String,
    /// Last heartbeat refresh, ms since the epoch.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refreshed_at: Option<u64>,
}

impl LockRecord {
    /// Milliseconds since the record was last written by its owner.
    pub fn age_ms(&self, now: u64) -> u64 {
        now.saturating_sub(self.refreshed_at.unwrap_or(self.started_at))
    }
}

/// What the lock file currently says.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked(LockRecord),
    Stale(LockRecord),
}

/// Acquires and releases the singleton lock.
#[derive(Debug, Clone)]
pub struct LockManager {
    lock_file: PathBuf,
    pid_file: PathBuf,
    port: u16,
    location: String,
    timeout: Duration,
    bypass: bool,
    pid: u32,
}

impl LockManager {
    /// Lock for a node listening on `port`, described by `location`.
    pub fn new(paths: &AirPaths, port: u16, location: impl Into<String>) -> Self {
        Self {
            lock_file: paths.lock_file(),
            pid_file: paths.pid_file(),
            port,
            location: location.into(),
            timeout: LOCK_TIMEOUT,
            bypass: false,
            pid: std::process::id(),
        }
    }

    /// Skip locking altogether.
    pub fn with_bypass(mut self, bypass: bool) -> Self {
        self.bypass = bypass;
        self
    }

    /// Set the staleness timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Whether `FORCE_AIR=true` is set.
    pub fn bypass_requested(env: &EnvVars) -> bool {
        env.flag(BYPASS_VAR).unwrap_or(false)
    }

    pub fn lock_file(&self) -> &Path {
        &self.lock_file
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// The current record. Missing and unreadable records are both absent.
    pub fn read(&self) -> Option<LockRecord> {
        let contents = fs::read_to_string(&self.lock_file).ok()?;
        match serde_json::from_str(&contents) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::debug!(error = %e, "Lock record unreadable, treating as absent");
                None
            }
        }
    }

    /// Classify the current record.
    pub fn inspect(&self) -> LockState {
        self.classify(self.read(), now_millis())
    }

    /// Take the lock for `owner`. Returns `false` when a live, fresh lock is
    /// held by another process; nothing is modified in that case.
    pub fn acquire(&self, owner: &str) -> Result<bool, LockError> {
        if self.bypass {
            tracing::warn!(var = BYPASS_VAR, "Singleton lock bypassed");
            return Ok(true);
        }

        if let Some(dir) = self.lock_file.parent() {
            fs::create_dir_all(dir)?;
        }

        let guard = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(self.guard_file())?;

        match guard.try_lock_exclusive() {
            Ok(()) => {}
            Err(e) if is_contended(&e) => {
                tracing::warn!("Another process is acquiring the lock");
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        }

        // Released when `guard` is dropped
        self.acquire_guarded(owner)
    }

    /// Remove our lock record and PID file. Records of other processes or
    /// owners are left alone.
    pub fn release(&self, owner: &str) -> Result<(), LockError> {
        if self.bypass {
            return Ok(());
        }

        match self.read() {
            Some(record) if record.pid == self.pid && record.owner == owner => {
                remove_if_exists(&self.lock_file)?;
                tracing::info!(pid = self.pid, owner, "Lock released");
            }
            Some(record) => {
                tracing::debug!(pid = record.pid, owner = %record.owner, "Lock held by another process");
            }
            None => {}
        }

        match fs::read_to_string(&self.pid_file) {
            Ok(contents) if contents.trim() == self.pid.to_string() => {
                remove_if_exists(&self.pid_file)?;
            }
            _ => {}
        }

        Ok(())
    }

    /// Stamp our record with the current time. Returns whether it was ours.
    pub fn refresh(&self) -> Result<bool, LockError> {
        if self.bypass {
            return Ok(false);
        }

        let Some(mut record) = self.read().filter(|r| r.pid == self.pid) else {
            return Ok(false);
        };

        record.refreshed_at = Some(now_millis());
        write_atomic(&self.lock_file, &serde_json::to_vec_pretty(&record)?)?;
        tracing::trace!(pid = self.pid, "Lock refreshed");
        Ok(true)
    }

    /// Delete the lock and PID files whoever owns them.
    pub fn force_cleanup(&self) -> Result<(), LockError> {
        remove_if_exists(&self.lock_file)?;
        remove_if_exists(&self.pid_file)?;
        tracing::warn!(path = %self.lock_file.display(), "Lock files removed");
        Ok(())
    }

    fn acquire_guarded(&self, owner: &str) -> Result<bool, LockError> {
        let now = now_millis();

        match self.classify(self.read(), now) {
            LockState::Locked(record) => {
                tracing::warn!(
                    pid = record.pid,
                    owner = %record.owner,
                    port = record.port,
                    age_secs = record.age_ms(now) / 1000,
                    "Another instance is running"
                );
                return Ok(false);
            }
            LockState::Stale(record) => {
                tracing::info!(pid = record.pid, owner = %record.owner, "Replacing stale lock");
                remove_if_exists(&self.lock_file)?;
            }
            LockState::Unlocked => {}
        }

        let record = LockRecord {
            pid: self.pid,
            started_at: now,
            port: self.port,
            location: self.location.clone(),
            owner: owner.to_string(),
            refreshed_at: None,
        };
        write_atomic(&self.lock_file, &serde_json::to_vec_pretty(&record)?)?;
        write_atomic(&self.pid_file, self.pid.to_string().as_bytes())?;

        tracing::info!(pid = self.pid, owner, "Lock acquired");
        Ok(true)
    }

    fn classify(&self, record: Option<LockRecord>, now: u64) -> LockState {
        match record {
            None => LockState::Unlocked,
            Some(record) => {
                let fresh = u128::from(record.age_ms(now)) < self.timeout.as_millis();
                if fresh && is_process_alive(record.pid) {
                    LockState::Locked(record)
                } else {
                    LockState::Stale(record)
                }
            }
        }
    }

    fn guard_file(&self) -> PathBuf {
        let mut name = self
            .lock_file
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".guard");
        self.lock_file.with_file_name(name)
    }
}

/// Check `pid` with signal 0.
#[cfg(unix)]
pub fn is_process_alive(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    if pid <= 0 {
        return false;
    }

    // SAFETY: signal 0 performs only the existence and permission check.
    let rc = unsafe { libc::kill(pid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() == Some(libc::EPERM)
}

/// Without signal 0 every recorded process is assumed alive.
#[cfg(not(unix))]
pub fn is_process_alive(pid: u32) -> bool {
    pid != 0
}

fn is_contended(error: &io::Error) -> bool {
    error.kind() == io::ErrorKind::WouldBlock
        || error.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut temp = path.as_os_str().to_os_string();
    temp.push(".tmp");
    let temp = PathBuf::from(temp);

    let mut file = File::create(&temp)?;
    file.write_all(contents)?;
    file.sync_all()?;
    drop(file);

    fs::rename(&temp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(root: &Path) -> LockManager {
        LockManager::new(&AirPaths::in_dir(root), 8765, "127.0.0.1")
    }

    /// Pid of a process that has already exited and been reaped.
    fn dead_pid() -> u32 {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        pid
    }

    fn write_record(manager: &LockManager, record: &LockRecord) {
        fs::create_dir_all(manager.lock_file().parent().unwrap()).unwrap();
        fs::write(manager.lock_file(), serde_json::to_vec(record).unwrap()).unwrap();
    }

    fn foreign_record(pid: u32, age_ms: u64) -> LockRecord {
        LockRecord {
            pid,
            started_at: now_millis() - age_ms,
            port: 9000,
            location: "elsewhere".to_string(),
            owner: "other".to_string(),
            refreshed_at: None,
        }
    }

    #[test]
    fn test_acquire_and_release() {
        let dir = tempdir().unwrap();
        let lock = manager(dir.path());

        assert_eq!(lock.inspect(), LockState::Unlocked);
        assert!(lock.acquire("me").unwrap());

        let record = lock.read().unwrap();
        assert_eq!(record.pid, std::process::id());
        assert_eq!(record.owner, "me");
        assert_eq!(
            fs::read_to_string(lock.pid_file()).unwrap(),
            std::process::id().to_string()
        );
        assert!(matches!(lock.inspect(), LockState::Locked(_)));

        // Held by a live process, so a second attempt fails
        assert!(!lock.acquire("me").unwrap());

        lock.release("me").unwrap();
        assert!(!lock.lock_file().exists());
        assert!(!lock.pid_file().exists());

        // Idempotent
        lock.release("me").unwrap();
    }

    #[test]
    fn test_dead_pid_lock_is_replaced() {
        let dir = tempdir().unwrap();
        let lock = manager(dir.path());
        write_record(&lock, &foreign_record(dead_pid(), 2 * 60 * 1000));

        assert!(matches!(lock.inspect(), LockState::Stale(_)));
        assert!(lock.acquire("me").unwrap());
        assert_eq!(lock.read().unwrap().pid, std::process::id());
    }

    #[test]
    fn test_live_young_lock_is_respected() {
        let dir = tempdir().unwrap();
        let lock = manager(dir.path());
        let held = foreign_record(std::process::id(), 60 * 1000);
        write_record(&lock, &held);
        let before = fs::read(lock.lock_file()).unwrap();

        assert!(!lock.acquire("me").unwrap());
        assert_eq!(fs::read(lock.lock_file()).unwrap(), before);
        assert!(!lock.pid_file().exists());
    }

    #[test]
    fn test_old_lock_is_stale_even_if_alive() {
        let dir = tempdir().unwrap();
        let lock = manager(dir.path());
        write_record(&lock, &foreign_record(std::process::id(), 11 * 60 * 1000));

        assert!(lock.acquire("me").unwrap());
        assert_eq!(lock.read().unwrap().owner, "me");
    }

    #[test]
    fn test_refresh_keeps_lock_fresh() {
        let dir = tempdir().unwrap();
        let lock = manager(dir.path()).with_timeout(Duration::from_secs(60));
        assert!(lock.acquire("me").unwrap());

        let mut record = lock.read().unwrap();
        record.started_at -= 5 * 60 * 1000;
        write_record(&lock, &record);
        assert!(matches!(lock.inspect(), LockState::Stale(_)));

        assert!(lock.refresh().unwrap());
        assert!(matches!(lock.inspect(), LockState::Locked(_)));
    }

    #[test]
    fn test_release_leaves_foreign_lock() {
        let dir = tempdir().unwrap();
        let lock = manager(dir.path());
        write_record(&lock, &foreign_record(dead_pid(), 0));

        lock.release("me").unwrap();
        assert!(lock.lock_file().exists());
        assert!(!lock.refresh().unwrap());
    }

    #[test]
    fn test_corrupt_record_counts_as_absent() {
        let dir = tempdir().unwrap();
        let lock = manager(dir.path());
        fs::create_dir_all(lock.lock_file().parent().unwrap()).unwrap();
        fs::write(lock.lock_file(), "garbage").unwrap();

        assert_eq!(lock.inspect(), LockState::Unlocked);
        assert!(lock.acquire("me").unwrap());
    }

    #[test]
    fn test_bypass_touches_nothing() {
        let dir = tempdir().unwrap();
        let env = EnvVars::default().with(BYPASS_VAR, "true");
        let lock = manager(dir.path()).with_bypass(LockManager::bypass_requested(&env));

        assert!(lock.acquire("me").unwrap());
        assert!(!lock.lock_file().exists());
        lock.release("me").unwrap();
    }

    #[test]
    fn test_guard_blocks_concurrent_acquire() {
        let dir = tempdir().unwrap();
        let lock = manager(dir.path());
        fs::create_dir_all(lock.lock_file().parent().unwrap()).unwrap();

        let held = File::create(lock.guard_file()).unwrap();
        held.try_lock_exclusive().unwrap();

        assert!(!lock.acquire("me").unwrap());
        assert!(!lock.lock_file().exists());

        drop(held);
        assert!(lock.acquire("me").unwrap());
    }

    #[test]
    fn test_force_cleanup() {
        let dir = tempdir().unwrap();
        let lock = manager(dir.path());
        write_record(&lock, &foreign_record(std::process::id(), 0));
        fs::write(lock.pid_file(), "1").unwrap();

        lock.force_cleanup().unwrap();
        assert_eq!(lock.inspect(), LockState::Unlocked);
        assert!(!lock.pid_file().exists());
    }
}
