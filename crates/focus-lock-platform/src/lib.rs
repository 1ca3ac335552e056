//! Operating-system capability surface for the enforcement agent.
//!
//! Everything the agent asks of the host OS goes through [`OsPlatform`]:
//! process snapshots and termination, the hosts file location, the shadow
//! copy of critical session state, single-instance locking, logon-task
//! persistence and self-protection. Production code picks an adapter via
//! [`native`]; tests drive the loop through [`MockPlatform`].

pub mod mock;
#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows_impl;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};

pub use focus_lock_common::{Error, Result};
pub use mock::{MockPlatform, MockProcess};

/// One entry of a fast process snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Executable file name without path, e.g. `notepad.exe`.
    pub exe_name: String,
}

/// Version-resource strings read in deep scan mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileMetadata {
    pub product_name: String,
    pub file_description: String,
}

/// The redundant copy of critical session state kept outside the config
/// file (registry hive on Windows). Zero means unset throughout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShadowState {
    /// Unix seconds of the manual session end.
    pub lock_end_unix: u64,
    /// Remaining session budget in nanoseconds.
    pub remaining_nanos: u64,
    /// Unix seconds until which enforcement is paused.
    pub paused_until_unix: u64,
}

impl ShadowState {
    pub fn from_fields(
        lock_end: Option<DateTime<Utc>>,
        remaining: Duration,
        paused_until: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            lock_end_unix: lock_end.map_or(0, |t| t.timestamp().max(0) as u64),
            remaining_nanos: remaining.as_nanos().min(u64::MAX as u128) as u64,
            paused_until_unix: paused_until.map_or(0, |t| t.timestamp().max(0) as u64),
        }
    }

    pub fn lock_end_time(&self) -> Option<DateTime<Utc>> {
        unix_opt(self.lock_end_unix)
    }

    pub fn paused_until(&self) -> Option<DateTime<Utc>> {
        unix_opt(self.paused_until_unix)
    }

    pub fn remaining(&self) -> Duration {
        Duration::from_nanos(self.remaining_nanos)
    }

    /// Whether this shadow describes a session worth restoring: an active
    /// lock, leftover budget, or a pause still in effect.
    pub fn holds_active_session(&self, now: DateTime<Utc>) -> bool {
        self.lock_end_time().is_some_and(|end| end > now)
            || self.remaining_nanos > 0
            || self.paused_until().is_some_and(|until| until > now)
    }
}

fn unix_opt(secs: u64) -> Option<DateTime<Utc>> {
    if secs == 0 {
        return None;
    }
    Utc.timestamp_opt(secs as i64, 0).single()
}

/// The operations the enforcement core consumes from the host OS.
///
/// Implementations are synchronous; every call is a bounded syscall or
/// command execution, invoked from the loop's cooperative ticks.
pub trait OsPlatform: Send + Sync {
    // --- process scanner -------------------------------------------------

    /// Enumerate running processes, names only. Individual process errors
    /// are swallowed; enumeration never aborts mid-snapshot.
    fn process_snapshot(&self) -> Vec<ProcessEntry>;

    /// Resolve the full image path of a process, if accessible.
    fn process_image_path(&self, pid: u32) -> Option<PathBuf>;

    /// Read `ProductName` / `FileDescription` from an executable's version
    /// resource, preferring the system locale over US English.
    fn file_metadata(&self, path: &Path) -> Option<FileMetadata>;

    /// Open with terminate-only rights and kill.
    fn terminate_process(&self, pid: u32) -> Result<()>;

    // --- hosts / DNS -----------------------------------------------------

    fn hosts_path(&self) -> PathBuf;

    /// Best effort; failures are logged, never surfaced.
    fn flush_dns_cache(&self);

    // --- persisted state locations --------------------------------------

    /// Per-user configuration root (the `FocusLock` folder lives below it).
    fn config_root(&self) -> PathBuf;

    /// The HMAC secret, hex-persisted in the shadow store; generated on
    /// first use. Never written to the config directory.
    fn get_or_create_secret(&self) -> Result<Vec<u8>>;

    fn read_shadow(&self) -> Result<ShadowState>;

    fn write_shadow(&self, state: &ShadowState) -> Result<()>;

    // --- process identity ------------------------------------------------

    /// Acquire the named system-wide single-instance lock. `Ok(false)`
    /// means another holder exists; the lock is held until process exit.
    fn acquire_instance_lock(&self, name: &str) -> Result<bool>;

    fn current_exe(&self) -> Result<PathBuf> {
        Ok(std::env::current_exe()?)
    }

    // --- persistence -----------------------------------------------------

    /// Register a logon-triggered task running `"<exe>" --enforce` with the
    /// highest available privileges, overwriting any existing task.
    fn register_logon_task(&self, task_name: &str, exe: &Path) -> Result<()>;

    fn delete_logon_task(&self, task_name: &str) -> Result<()>;

    /// Start the registered task now (no elevation prompt).
    fn run_logon_task(&self, task_name: &str) -> Result<()>;

    /// Fallback spawn of `"<exe>" --enforce`, detached, current context.
    fn spawn_detached(&self, exe: &Path) -> Result<()>;

    // --- self-protection -------------------------------------------------

    fn enable_debug_privilege(&self) -> Result<()>;

    /// Append a DENY ace for PROCESS_TERMINATE (Everyone) to our DACL.
    fn deny_process_terminate(&self) -> Result<()>;

    /// Toggle the critical-process mark. Must be cleared before any
    /// planned exit; the OS bug-checks if a critical process dies.
    fn set_process_critical(&self, enabled: bool) -> Result<()>;
}

/// The adapter for the OS we are running on.
pub fn native() -> Arc<dyn OsPlatform> {
    #[cfg(windows)]
    {
        Arc::new(windows_impl::WindowsPlatform::new())
    }
    #[cfg(unix)]
    {
        Arc::new(unix::UnixPlatform::new())
    }
}
