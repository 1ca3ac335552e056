//! Portable Unix adapter.
//!
//! Process work goes through `sysinfo`; the shadow store and secret live as
//! restricted files under the config root (the registry equivalent on this
//! platform); logon-task persistence has no sanctioned counterpart here and
//! reports unsupported so callers take their documented fallbacks. The
//! protection calls are no-ops, matching the reduced surface of the
//! original tool outside Windows.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Mutex, MutexGuard, PoisonError};

use rand::RngCore;
use sysinfo::{Pid, PidExt, ProcessExt, System, SystemExt};
use tracing::{debug, warn};

use crate::{Error, FileMetadata, OsPlatform, ProcessEntry, Result, ShadowState};

pub struct UnixPlatform {
    system: Mutex<System>,
}

impl UnixPlatform {
    pub fn new() -> Self {
        Self {
            system: Mutex::new(System::new()),
        }
    }

    fn system(&self) -> MutexGuard<'_, System> {
        self.system.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn state_dir(&self) -> PathBuf {
        self.config_root().join("FocusLock")
    }

    fn shadow_path(&self) -> PathBuf {
        self.state_dir().join("shadow")
    }

    fn secret_path(&self) -> PathBuf {
        self.state_dir().join("secret.key")
    }
}

impl Default for UnixPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl OsPlatform for UnixPlatform {
    fn process_snapshot(&self) -> Vec<ProcessEntry> {
        let mut system = self.system();
        system.refresh_processes();
        system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                exe_name: process.name().to_string(),
            })
            .collect()
    }

    fn process_image_path(&self, pid: u32) -> Option<PathBuf> {
        let system = self.system();
        let process = system.process(Pid::from_u32(pid))?;
        let exe = process.exe();
        if exe.as_os_str().is_empty() {
            None
        } else {
            Some(exe.to_path_buf())
        }
    }

    fn file_metadata(&self, _path: &Path) -> Option<FileMetadata> {
        // ELF binaries carry no version resource; deep mode degrades to
        // path resolution only.
        None
    }

    fn terminate_process(&self, pid: u32) -> Result<()> {
        let mut system = self.system();
        system.refresh_processes();
        let process = system
            .process(Pid::from_u32(pid))
            .ok_or_else(|| Error::platform(format!("no such process: {pid}")))?;
        if process.kill() {
            Ok(())
        } else {
            Err(Error::platform(format!("failed to signal pid {pid}")))
        }
    }

    fn hosts_path(&self) -> PathBuf {
        PathBuf::from("/etc/hosts")
    }

    fn flush_dns_cache(&self) {
        match Command::new("resolvectl").arg("flush-caches").output() {
            Ok(output) if output.status.success() => {}
            Ok(output) => debug!("resolvectl flush-caches exited with {}", output.status),
            Err(err) => debug!("resolvectl unavailable: {err}"),
        }
    }

    fn config_root(&self) -> PathBuf {
        dirs::config_dir().unwrap_or_else(|| PathBuf::from("/tmp"))
    }

    fn get_or_create_secret(&self) -> Result<Vec<u8>> {
        let path = self.secret_path();
        if let Ok(existing) = fs::read_to_string(&path) {
            if let Ok(bytes) = hex::decode(existing.trim()) {
                if bytes.len() == 32 {
                    return Ok(bytes);
                }
            }
            warn!("secret file unreadable, regenerating");
        }

        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        fs::create_dir_all(self.state_dir())?;
        fs::write(&path, hex::encode(bytes))?;
        restrict_permissions(&path)?;
        Ok(bytes.to_vec())
    }

    fn read_shadow(&self) -> Result<ShadowState> {
        let content = fs::read_to_string(self.shadow_path())?;
        let mut state = ShadowState::default();
        for line in content.lines() {
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value: u64 = value.trim().parse().unwrap_or(0);
            match key.trim() {
                "lock_end_unix" => state.lock_end_unix = value,
                "remaining_nanos" => state.remaining_nanos = value,
                "paused_until_unix" => state.paused_until_unix = value,
                _ => {}
            }
        }
        Ok(state)
    }

    fn write_shadow(&self, state: &ShadowState) -> Result<()> {
        fs::create_dir_all(self.state_dir())?;
        let content = format!(
            "lock_end_unix={}\nremaining_nanos={}\npaused_until_unix={}\n",
            state.lock_end_unix, state.remaining_nanos, state.paused_until_unix
        );
        let path = self.shadow_path();
        fs::write(&path, content)?;
        restrict_permissions(&path)?;
        Ok(())
    }

    fn acquire_instance_lock(&self, name: &str) -> Result<bool> {
        let dir = self.state_dir().join("locks");
        fs::create_dir_all(&dir)?;
        let path = dir.join(format!("{name}.pid"));

        if let Ok(existing) = fs::read_to_string(&path) {
            if let Ok(pid) = existing.trim().parse::<u32>() {
                if pid != std::process::id() && Path::new(&format!("/proc/{pid}")).exists() {
                    return Ok(false);
                }
            }
        }
        fs::write(&path, std::process::id().to_string())?;
        Ok(true)
    }

    fn register_logon_task(&self, task_name: &str, _exe: &Path) -> Result<()> {
        Err(Error::platform(format!(
            "logon task {task_name}: scheduled tasks are not supported on this platform"
        )))
    }

    fn delete_logon_task(&self, _task_name: &str) -> Result<()> {
        Ok(())
    }

    fn run_logon_task(&self, task_name: &str) -> Result<()> {
        Err(Error::platform(format!(
            "logon task {task_name}: scheduled tasks are not supported on this platform"
        )))
    }

    fn spawn_detached(&self, exe: &Path) -> Result<()> {
        Command::new(exe)
            .arg("--enforce")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()?;
        Ok(())
    }

    fn enable_debug_privilege(&self) -> Result<()> {
        Ok(())
    }

    fn deny_process_terminate(&self) -> Result<()> {
        debug!("process DACL hardening is a no-op on this platform");
        Ok(())
    }

    fn set_process_critical(&self, _enabled: bool) -> Result<()> {
        debug!("critical-process marking is a no-op on this platform");
        Ok(())
    }
}

fn restrict_permissions(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o600))
}
