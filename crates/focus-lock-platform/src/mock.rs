//! Recording test double for [`OsPlatform`].
//!
//! Scenarios configure the process table, shadow contents and failure
//! switches up front, run the code under test, then assert on the recorded
//! calls (kills, task operations, DNS flushes, critical-mark toggles).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::{Error, FileMetadata, OsPlatform, ProcessEntry, Result, ShadowState};

#[derive(Debug, Clone)]
pub struct MockProcess {
    pub pid: u32,
    pub exe_name: String,
    pub image_path: Option<PathBuf>,
    pub metadata: Option<FileMetadata>,
}

impl MockProcess {
    pub fn named(pid: u32, exe_name: &str) -> Self {
        Self {
            pid,
            exe_name: exe_name.to_string(),
            image_path: None,
            metadata: None,
        }
    }

    /// A process whose name gives nothing away but whose version resource
    /// carries the given product name (the renamed-binary case).
    pub fn with_metadata(pid: u32, exe_name: &str, product: &str, description: &str) -> Self {
        Self {
            pid,
            exe_name: exe_name.to_string(),
            image_path: Some(PathBuf::from(format!("C:/Users/test/{exe_name}"))),
            metadata: Some(FileMetadata {
                product_name: product.to_string(),
                file_description: description.to_string(),
            }),
        }
    }
}

#[derive(Debug, Default)]
struct MockState {
    processes: Vec<MockProcess>,
    killed: Vec<(u32, String)>,
    unkillable: HashSet<u32>,
    shadow: ShadowState,
    shadow_available: bool,
    secret: Option<Vec<u8>>,
    instance_locks: HashSet<String>,
    registered_tasks: HashSet<String>,
    task_runs: Vec<String>,
    run_task_fails: bool,
    spawned: Vec<PathBuf>,
    dns_flushes: u32,
    critical_marks: Vec<bool>,
    debug_privilege_enabled: bool,
    terminate_denied: bool,
    protection_fails: bool,
}

/// In-memory [`OsPlatform`] rooted at a caller-supplied directory (usually
/// a tempdir); the fake hosts file lives at `<root>/hosts`.
#[derive(Clone)]
pub struct MockPlatform {
    root: PathBuf,
    current_exe: PathBuf,
    state: Arc<Mutex<MockState>>,
}

impl MockPlatform {
    pub fn new(root: &Path) -> Self {
        let state = MockState {
            shadow_available: true,
            ..MockState::default()
        };
        // Stand-in for the agent binary so ghost cloning has a source.
        let current_exe = root.join("focus-lock.exe");
        let _ = std::fs::write(&current_exe, b"focus-lock stub binary");
        Self {
            root: root.to_path_buf(),
            current_exe,
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- scenario setup --------------------------------------------------

    pub fn set_processes(&self, processes: Vec<MockProcess>) {
        self.lock().processes = processes;
    }

    pub fn add_process(&self, process: MockProcess) {
        self.lock().processes.push(process);
    }

    pub fn set_unkillable(&self, pid: u32) {
        self.lock().unkillable.insert(pid);
    }

    pub fn set_shadow(&self, shadow: ShadowState) {
        self.lock().shadow = shadow;
    }

    pub fn set_shadow_available(&self, available: bool) {
        self.lock().shadow_available = available;
    }

    pub fn set_run_task_fails(&self, fails: bool) {
        self.lock().run_task_fails = fails;
    }

    pub fn set_protection_fails(&self, fails: bool) {
        self.lock().protection_fails = fails;
    }

    // --- recorded observations -------------------------------------------

    pub fn killed(&self) -> Vec<(u32, String)> {
        self.lock().killed.clone()
    }

    pub fn running_names(&self) -> Vec<String> {
        self.lock().processes.iter().map(|p| p.exe_name.clone()).collect()
    }

    pub fn shadow(&self) -> ShadowState {
        self.lock().shadow
    }

    pub fn registered_tasks(&self) -> Vec<String> {
        self.lock().registered_tasks.iter().cloned().collect()
    }

    pub fn task_runs(&self) -> Vec<String> {
        self.lock().task_runs.clone()
    }

    pub fn spawned(&self) -> Vec<PathBuf> {
        self.lock().spawned.clone()
    }

    pub fn dns_flushes(&self) -> u32 {
        self.lock().dns_flushes
    }

    pub fn critical_marks(&self) -> Vec<bool> {
        self.lock().critical_marks.clone()
    }

    pub fn terminate_denied(&self) -> bool {
        self.lock().terminate_denied
    }
}

impl OsPlatform for MockPlatform {
    fn process_snapshot(&self) -> Vec<ProcessEntry> {
        self.lock()
            .processes
            .iter()
            .map(|p| ProcessEntry {
                pid: p.pid,
                exe_name: p.exe_name.clone(),
            })
            .collect()
    }

    fn process_image_path(&self, pid: u32) -> Option<PathBuf> {
        self.lock().processes.iter().find(|p| p.pid == pid).and_then(|p| p.image_path.clone())
    }

    fn file_metadata(&self, path: &Path) -> Option<FileMetadata> {
        self.lock()
            .processes
            .iter()
            .find(|p| p.image_path.as_deref() == Some(path))
            .and_then(|p| p.metadata.clone())
    }

    fn terminate_process(&self, pid: u32) -> Result<()> {
        let mut state = self.lock();
        if state.unkillable.contains(&pid) {
            return Err(Error::platform(format!("access denied terminating pid {pid}")));
        }
        let Some(index) = state.processes.iter().position(|p| p.pid == pid) else {
            return Err(Error::platform(format!("no such process: {pid}")));
        };
        let process = state.processes.remove(index);
        state.killed.push((pid, process.exe_name));
        Ok(())
    }

    fn hosts_path(&self) -> PathBuf {
        self.root.join("hosts")
    }

    fn flush_dns_cache(&self) {
        self.lock().dns_flushes += 1;
    }

    fn config_root(&self) -> PathBuf {
        self.root.clone()
    }

    fn get_or_create_secret(&self) -> Result<Vec<u8>> {
        let mut state = self.lock();
        if !state.shadow_available {
            return Err(Error::platform("shadow store unavailable"));
        }
        if state.secret.is_none() {
            state.secret = Some((0..32u8).collect());
        }
        Ok(state.secret.clone().unwrap_or_default())
    }

    fn read_shadow(&self) -> Result<ShadowState> {
        let state = self.lock();
        if !state.shadow_available {
            return Err(Error::platform("shadow store unavailable"));
        }
        Ok(state.shadow)
    }

    fn write_shadow(&self, shadow: &ShadowState) -> Result<()> {
        let mut state = self.lock();
        if !state.shadow_available {
            return Err(Error::platform("shadow store unavailable"));
        }
        state.shadow = *shadow;
        Ok(())
    }

    fn acquire_instance_lock(&self, name: &str) -> Result<bool> {
        Ok(self.lock().instance_locks.insert(name.to_string()))
    }

    fn current_exe(&self) -> Result<PathBuf> {
        Ok(self.current_exe.clone())
    }

    fn register_logon_task(&self, task_name: &str, _exe: &Path) -> Result<()> {
        self.lock().registered_tasks.insert(task_name.to_string());
        Ok(())
    }

    fn delete_logon_task(&self, task_name: &str) -> Result<()> {
        self.lock().registered_tasks.remove(task_name);
        Ok(())
    }

    fn run_logon_task(&self, task_name: &str) -> Result<()> {
        let mut state = self.lock();
        if state.run_task_fails || !state.registered_tasks.contains(task_name) {
            return Err(Error::platform(format!("task not runnable: {task_name}")));
        }
        state.task_runs.push(task_name.to_string());
        Ok(())
    }

    fn spawn_detached(&self, exe: &Path) -> Result<()> {
        self.lock().spawned.push(exe.to_path_buf());
        Ok(())
    }

    fn enable_debug_privilege(&self) -> Result<()> {
        let mut state = self.lock();
        if state.protection_fails {
            return Err(Error::privilege("debug privilege denied"));
        }
        state.debug_privilege_enabled = true;
        Ok(())
    }

    fn deny_process_terminate(&self) -> Result<()> {
        let mut state = self.lock();
        if state.protection_fails {
            return Err(Error::privilege("DACL update denied"));
        }
        state.terminate_denied = true;
        Ok(())
    }

    fn set_process_critical(&self, enabled: bool) -> Result<()> {
        let mut state = self.lock();
        if state.protection_fails {
            return Err(Error::privilege("critical-process toggle denied"));
        }
        state.critical_marks.push(enabled);
        Ok(())
    }
}
