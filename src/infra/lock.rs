//! Single-instance guard for scheduled runs.
//!
//! The lock file holds `{"pid": .., "acquired_at": ..}`. It is published with
//! a hard link from a fully written temp file, so other processes never see
//! a half-written lock. A lock whose pid is no longer running is stale and
//! gets reclaimed by the next `acquire`. Reclaiming happens under a
//! `<lock>.reclaim` guard so only one contender removes the stale file.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

const MAX_ATTEMPTS: usize = 5;
/// Wait before retrying while someone else is reclaiming.
const RECLAIM_BACKOFF: Duration = Duration::from_millis(10);
/// A guard without a readable pid older than this was left by a crash.
const GUARD_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum LockError {
    #[error("another run (pid {holder_pid}) holds {}", path.display())]
    Held { holder_pid: u32, path: PathBuf },

    #[error("lock I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("gave up acquiring {} after repeated contention", path.display())]
    Contended { path: PathBuf },
}

impl LockError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub pid: u32,
    pub acquired_at: DateTime<Utc>,
}

/// Current state of a lock file, as seen by `status`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockStatus {
    Free,
    Held(LockRecord),
    Stale(Option<LockRecord>),
}

/// Exclusive ownership of a run. Released on drop, so every exit path of the
/// run (including unwinding) gives the lock back.
#[derive(Debug)]
pub struct LockHandle {
    owner_pid: u32,
    acquired_at: DateTime<Utc>,
    lock_path: PathBuf,
    released: bool,
}

impl LockHandle {
    pub fn owner_pid(&self) -> u32 {
        self.owner_pid
    }

    pub fn acquired_at(&self) -> DateTime<Utc> {
        self.acquired_at
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    pub fn release(mut self) -> Result<(), LockError> {
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<(), LockError> {
        if self.released {
            return Ok(());
        }
        self.released = true;

        // Only remove the file if it is still ours
        match read_lock(&self.lock_path) {
            Ok(Some((Some(record), _))) if record.pid == self.owner_pid && record.acquired_at == self.acquired_at => {
                match fs::remove_file(&self.lock_path) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => return Err(LockError::io(&self.lock_path, e)),
                }
                tracing::debug!(path = %self.lock_path.display(), "run lock released");
                Ok(())
            }
            Ok(_) => {
                tracing::warn!(path = %self.lock_path.display(), "run lock was taken over before release");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        if let Err(e) = self.release_inner() {
            tracing::error!("failed to release run lock: {}", e);
        }
    }
}

pub struct RunLock;

impl RunLock {
    pub fn acquire(path: impl AsRef<Path>) -> Result<LockHandle, LockError> {
        Self::acquire_as(path.as_ref(), std::process::id())
    }

    fn acquire_as(path: &Path, pid: u32) -> Result<LockHandle, LockError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| LockError::io(parent, e))?;
        }

        let record = LockRecord {
            pid,
            acquired_at: Utc::now(),
        };

        for attempt in 0..MAX_ATTEMPTS {
            match publish(path, &record) {
                Ok(()) => {
                    tracing::info!(pid, path = %path.display(), "run lock acquired");
                    return Ok(LockHandle {
                        owner_pid: pid,
                        acquired_at: record.acquired_at,
                        lock_path: path.to_path_buf(),
                        released: false,
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(LockError::io(path, e)),
            }

            match read_lock(path)? {
                // Released between our attempt and the read
                None => continue,
                Some((Some(holder), _)) if process_alive(holder.pid) => {
                    return Err(LockError::Held {
                        holder_pid: holder.pid,
                        path: path.to_path_buf(),
                    });
                }
                Some((holder, raw)) => {
                    tracing::warn!(
                        attempt,
                        stale_pid = holder.as_ref().map(|h| h.pid),
                        path = %path.display(),
                        "reclaiming stale run lock"
                    );
                    if reclaim(path, &raw, pid)? == Reclaim::Busy {
                        std::thread::sleep(RECLAIM_BACKOFF * (attempt as u32 + 1));
                    }
                }
            }
        }

        Err(LockError::Contended {
            path: path.to_path_buf(),
        })
    }

    pub fn inspect(path: impl AsRef<Path>) -> Result<LockStatus, LockError> {
        Ok(match read_lock(path.as_ref())? {
            None => LockStatus::Free,
            Some((Some(record), _)) if process_alive(record.pid) => LockStatus::Held(record),
            Some((record, _)) => LockStatus::Stale(record),
        })
    }
}

/// Exclusive create with complete contents.
fn publish(path: &Path, record: &LockRecord) -> io::Result<()> {
    let tmp = sibling(path, &format!("{}.{}.tmp", record.pid, Uuid::new_v4().simple()));
    {
        let mut file = fs::File::create(&tmp)?;
        serde_json::to_writer(&mut file, record)?;
        file.write_all(b"\n")?;
        file.sync_all()?;
    }

    let linked = fs::hard_link(&tmp, path);
    let _ = fs::remove_file(&tmp);

    match linked {
        Err(e) if matches!(e.kind(), io::ErrorKind::Unsupported | io::ErrorKind::PermissionDenied) => {
            // Filesystems without hard links: fall back to create_new
            let mut file = fs::OpenOptions::new().write(true).create_new(true).open(path)?;
            serde_json::to_writer(&mut file, record)?;
            file.write_all(b"\n")
        }
        other => other,
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Reclaim {
    Done,
    Busy,
}

/// Remove the lock file if it still holds exactly `observed`. The guard
/// makes check-and-remove atomic with respect to other reclaimers; `publish`
/// never replaces an existing file, so nothing else can swap the contents
/// in between.
fn reclaim(path: &Path, observed: &str, pid: u32) -> Result<Reclaim, LockError> {
    let guard = sibling(path, "reclaim");
    let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&guard) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            clear_abandoned_guard(&guard);
            return Ok(Reclaim::Busy);
        }
        Err(e) => return Err(LockError::io(&guard, e)),
    };
    let written = write!(file, "{pid}");
    drop(file);

    let removed = written.and_then(|()| match fs::read_to_string(path) {
        Ok(current) if current == observed => match fs::remove_file(path) {
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            other => other,
        },
        Ok(_) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    });

    if let Err(e) = fs::remove_file(&guard) {
        tracing::warn!(guard = %guard.display(), "failed to remove reclaim guard: {}", e);
    }
    removed.map(|()| Reclaim::Done).map_err(|e| LockError::io(path, e))
}

fn clear_abandoned_guard(guard: &Path) {
    let holder = fs::read_to_string(guard)
        .ok()
        .and_then(|raw| raw.trim().parse::<u32>().ok());
    let abandoned = match holder {
        Some(pid) => !process_alive(pid),
        None => fs::metadata(guard)
            .and_then(|m| m.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age > GUARD_TTL),
    };
    if abandoned {
        tracing::warn!(guard = %guard.display(), ?holder, "removing abandoned reclaim guard");
        let _ = fs::remove_file(guard);
    }
}

/// `None` when there is no lock file. The record is `None` when the file
/// exists but can't be parsed.
fn read_lock(path: &Path) -> Result<Option<(Option<LockRecord>, String)>, LockError> {
    match fs::read_to_string(path) {
        Ok(raw) => Ok(Some((serde_json::from_str(raw.trim()).ok(), raw))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(LockError::io(path, e)),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "harvester.lock".into());
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

#[cfg(target_os = "linux")]
pub fn process_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

#[cfg(all(unix, not(target_os = "linux")))]
pub fn process_alive(pid: u32) -> bool {
    std::process::Command::new("kill")
        .args(["-0", &pid.to_string()])
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(true)
}

#[cfg(not(unix))]
pub fn process_alive(_pid: u32) -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    // Far above any real pid_max
    const DEAD_PID: u32 = 4_000_000_000;

    #[test]
    fn acquire_writes_pid_and_release_removes_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");

        let handle = RunLock::acquire(&path).unwrap();
        assert_eq!(handle.owner_pid(), std::process::id());
        assert!(matches!(RunLock::inspect(&path).unwrap(), LockStatus::Held(r) if r.pid == std::process::id()));

        handle.release().unwrap();
        assert!(!path.exists());
        assert_eq!(RunLock::inspect(&path).unwrap(), LockStatus::Free);
    }

    #[test]
    fn second_acquire_names_the_holder() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");

        let _held = RunLock::acquire(&path).unwrap();
        match RunLock::acquire(&path) {
            Err(LockError::Held { holder_pid, .. }) => assert_eq!(holder_pid, std::process::id()),
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(
            &path,
            serde_json::to_string(&LockRecord { pid: DEAD_PID, acquired_at: Utc::now() }).unwrap(),
        )
        .unwrap();
        assert!(matches!(RunLock::inspect(&path).unwrap(), LockStatus::Stale(Some(_))));

        let handle = RunLock::acquire(&path).unwrap();
        assert_eq!(handle.owner_pid(), std::process::id());
        assert!(matches!(RunLock::inspect(&path).unwrap(), LockStatus::Held(_)));
    }

    #[test]
    fn garbage_lock_is_reclaimed() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, "not a lock").unwrap();

        assert!(RunLock::acquire(&path).is_ok());
    }

    #[test]
    fn drop_releases() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("run.lock");
        {
            let _handle = RunLock::acquire(&path).unwrap();
            assert!(path.exists());
        }
        assert!(!path.exists());
    }

    #[test]
    fn release_leaves_foreign_lock_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        let handle = RunLock::acquire_as(&path, DEAD_PID).unwrap();

        // Another process reclaims the (dead-pid) lock while we still hold the handle
        let theirs = RunLock::acquire(&path).unwrap();
        drop(handle);
        assert!(path.exists());
        drop(theirs);
        assert!(!path.exists());
    }

    #[test]
    fn abandoned_reclaim_guard_does_not_block_forever() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        fs::write(&path, "not a lock").unwrap();
        fs::write(sibling(&path, "reclaim"), DEAD_PID.to_string()).unwrap();

        let handle = RunLock::acquire(&path).unwrap();
        assert_eq!(handle.owner_pid(), std::process::id());
        assert!(!sibling(&path, "reclaim").exists());
    }

    #[test]
    fn reclaim_leaves_a_fresh_lock_alone() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        let _live = RunLock::acquire(&path).unwrap();

        // Judged stale from an earlier read, but the file has changed since
        assert_eq!(reclaim(&path, "old contents", DEAD_PID).unwrap(), Reclaim::Done);
        assert!(matches!(RunLock::inspect(&path).unwrap(), LockStatus::Held(_)));
    }

    #[test]
    fn no_leftover_temp_files() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("run.lock");
        let _handle = RunLock::acquire(&path).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("run.lock")]);
    }
}
