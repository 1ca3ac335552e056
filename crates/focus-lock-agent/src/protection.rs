//! Self-protection surface.
//!
//! Everything here is best effort: a hardened agent is better, but a
//! running agent is non-negotiable, so failures are logged (to
//! `protection_error.log` as well as the normal log) and enforcement
//! proceeds with whatever protection stuck.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use tracing::{info, warn};

use focus_lock_platform::OsPlatform;

/// Enable the debug privilege and deny PROCESS_TERMINATE to Everyone.
pub fn enable_protections(platform: &Arc<dyn OsPlatform>, log_dir: &Path) {
    if let Err(err) = platform.enable_debug_privilege() {
        log_protection_error(log_dir, &format!("debug privilege: {err}"));
    }
    if let Err(err) = platform.deny_process_terminate() {
        log_protection_error(log_dir, &format!("terminate denial: {err}"));
    }
}

/// Holds the critical-process mark and guarantees it is cleared on every
/// exit path. The OS bug-checks if a critical process dies, so the mark
/// must never outlive a planned exit; `Drop` runs on normal returns and on
/// unwinding panics alike.
pub struct CriticalGuard {
    platform: Arc<dyn OsPlatform>,
    log_dir: PathBuf,
    engaged: bool,
}

impl CriticalGuard {
    pub fn engage(platform: Arc<dyn OsPlatform>, log_dir: &Path) -> Self {
        let engaged = match platform.set_process_critical(true) {
            Ok(()) => {
                info!("critical-process mark engaged");
                true
            }
            Err(err) => {
                log_protection_error(log_dir, &format!("critical mark: {err}"));
                false
            }
        };
        Self {
            platform,
            log_dir: log_dir.to_path_buf(),
            engaged,
        }
    }

    pub fn disarm(&mut self) {
        if !self.engaged {
            return;
        }
        match self.platform.set_process_critical(false) {
            Ok(()) => {
                info!("critical-process mark cleared");
                self.engaged = false;
            }
            Err(err) => {
                log_protection_error(&self.log_dir, &format!("clearing critical mark: {err}"));
            }
        }
    }
}

impl Drop for CriticalGuard {
    fn drop(&mut self) {
        self.disarm();
    }
}

fn log_protection_error(dir: &Path, message: &str) {
    warn!("protection: {message}");
    let path = dir.join("protection_error.log");
    let entry = format!("{}: {message}\n", Utc::now().to_rfc3339());
    let result = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .and_then(|mut file| file.write_all(entry.as_bytes()));
    if let Err(err) = result {
        warn!("could not append to {}: {err}", path.display());
    }
}
