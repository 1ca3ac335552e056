//! Persistence and spawning of the background agent ("ghost").
//!
//! The agent survives logout and reboot as a logon-triggered task running a
//! disguised copy of this executable. Starting it through the task's run
//! endpoint avoids an elevation prompt; when that fails the copy is
//! spawned directly in the current context and site blocking may degrade.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use focus_lock_common::{Config, Result};
use focus_lock_platform::OsPlatform;

/// Single-instance mutex held by the enforcement agent.
pub const AGENT_MUTEX: &str = "FocusLockGhost";

/// Single-instance mutex held by the desktop shell.
pub const UI_MUTEX: &str = "FocusLockMutex";

const SUBSYSTEMS: &[&str] =
    &["Windows", "Win32", "Shell", "UserSession", "AppX", "Runtime", "System", "Net", "Host"];
const COMPONENTS: &[&str] = &[
    "Experience",
    "Telemetry",
    "Broker",
    "Cache",
    "Component",
    "Host",
    "Service",
    "Manager",
    "Provider",
];
const ACTIONS: &[&str] =
    &["Update", "Sync", "Maintenance", "Refresh", "Coordinator", "Handler", "Monitor", "Helper"];

/// A plausible system-service identifier, fresh each call.
pub fn generate_task_name() -> String {
    let mut rng = rand::thread_rng();
    let mut pick = |words: &[&str]| -> String { words.choose(&mut rng).unwrap_or(&words[0]).to_string() };
    format!("{}{}{}", pick(SUBSYSTEMS), pick(COMPONENTS), pick(ACTIONS))
}

pub struct GhostSpawner {
    platform: Arc<dyn OsPlatform>,
}

impl GhostSpawner {
    pub fn new(platform: Arc<dyn OsPlatform>) -> Self {
        Self { platform }
    }

    /// Reuse the recorded ghost identity, or clone the current executable
    /// under a fresh disguised name.
    pub fn provision(&self, config: &Config) -> Result<(String, PathBuf)> {
        if !config.ghost_task_name.is_empty() && !config.ghost_exe_path.is_empty() {
            return Ok((config.ghost_task_name.clone(), PathBuf::from(&config.ghost_exe_path)));
        }

        let task_name = generate_task_name();
        let exe = self.clone_executable(&task_name)?;
        Ok((task_name, exe))
    }

    fn clone_executable(&self, task_name: &str) -> Result<PathBuf> {
        let bin_dir = self.platform.config_root().join("FocusLock").join("Bin");
        fs::create_dir_all(&bin_dir)?;

        let source = self.platform.current_exe()?;
        let target = bin_dir.join(format!("{task_name}.exe"));
        fs::copy(&source, &target)?;
        debug!("ghost executable staged at {}", target.display());
        Ok(target)
    }

    /// Best effort; a missing task only costs reboot survival.
    pub fn enable_persistence(&self, task_name: &str, exe: &Path) {
        match self.platform.register_logon_task(task_name, exe) {
            Ok(()) => info!("logon task {task_name} registered"),
            Err(err) => warn!("logon task registration failed: {err}"),
        }
    }

    pub fn disable_persistence(&self, task_name: &str) {
        if let Err(err) = self.platform.delete_logon_task(task_name) {
            debug!("logon task removal failed: {err}");
        }
    }

    /// Start the agent now, preferring the task's run endpoint.
    pub fn spawn(&self, task_name: &str, exe: &Path) -> Result<()> {
        if self.platform.run_logon_task(task_name).is_ok() {
            info!("agent started through scheduled task");
            return Ok(());
        }
        warn!("scheduled task start failed; spawning directly, site blocking may degrade");
        self.platform.spawn_detached(exe)
    }

    /// Remove both persistence artifacts.
    pub fn cleanup(&self, task_name: &str, exe_path: &str) {
        if !task_name.is_empty() {
            self.disable_persistence(task_name);
        }
        if !exe_path.is_empty() {
            if let Err(err) = fs::remove_file(exe_path) {
                debug!("ghost executable removal failed: {err}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use focus_lock_platform::MockPlatform;

    #[test]
    fn test_task_names_look_like_services() {
        for _ in 0..20 {
            let name = generate_task_name();
            assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
            assert!(!name.to_lowercase().contains("focus"));
        }
    }

    #[test]
    fn test_provision_clones_executable_once() {
        let dir = tempfile::tempdir().unwrap();
        let platform = MockPlatform::new(dir.path());
        let spawner = GhostSpawner::new(Arc::new(platform));

        let config = Config::default();
        let (task_name, exe) = spawner.provision(&config).unwrap();
        assert!(exe.exists());
        assert!(exe.ends_with(format!("{task_name}.exe")));

        // An existing identity is reused, not re-cloned.
        let recorded = Config {
            ghost_task_name: task_name.clone(),
            ghost_exe_path: exe.display().to_string(),
            ..Config::default()
        };
        let (again_task, again_exe) = spawner.provision(&recorded).unwrap();
        assert_eq!(again_task, task_name);
        assert_eq!(again_exe, exe);
    }

    #[test]
    fn test_spawn_falls_back_to_direct_spawn() {
        let dir = tempfile::tempdir().unwrap();
        let platform = MockPlatform::new(dir.path());
        let spawner = GhostSpawner::new(Arc::new(platform.clone()));

        // No task registered: the run endpoint fails, direct spawn is used.
        spawner.spawn("WinShellSync", Path::new("ghost.exe")).unwrap();
        assert_eq!(platform.task_runs().len(), 0);
        assert_eq!(platform.spawned(), vec![PathBuf::from("ghost.exe")]);

        // With the task registered the run endpoint wins.
        platform.register_logon_task("WinShellSync", Path::new("ghost.exe")).unwrap();
        spawner.spawn("WinShellSync", Path::new("ghost.exe")).unwrap();
        assert_eq!(platform.task_runs(), vec!["WinShellSync".to_string()]);
        assert_eq!(platform.spawned().len(), 1);
    }

    #[test]
    fn test_cleanup_removes_task_and_copy() {
        let dir = tempfile::tempdir().unwrap();
        let platform = MockPlatform::new(dir.path());
        let spawner = GhostSpawner::new(Arc::new(platform.clone()));

        let (task_name, exe) = spawner.provision(&Config::default()).unwrap();
        spawner.enable_persistence(&task_name, &exe);
        assert_eq!(platform.registered_tasks().len(), 1);

        spawner.cleanup(&task_name, &exe.display().to_string());
        assert!(platform.registered_tasks().is_empty());
        assert!(!exe.exists());
    }
}
