//! User-facing session operations.
//!
//! These are the entry points the desktop shell (or the CLI in a headless
//! build) drives: arming and ending sessions, emergency unlocks, blocklist
//! and schedule editing. Every mutation goes through the store's atomic
//! read-modify-write so a concurrently running agent never observes torn
//! state.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tracing::{info, warn};

use crate::ghost::GhostSpawner;
use crate::hosts::HostsWriter;
use focus_lock_common::{
    is_active, Config, Error, Result, Schedule, EMERGENCY_UNLOCK_LIMIT, EMERGENCY_UNLOCK_PAUSE,
};
use focus_lock_platform::OsPlatform;
use focus_lock_store::Store;

pub struct SessionControl {
    store: Arc<Store>,
    hosts: HostsWriter,
    ghost: GhostSpawner,
}

impl SessionControl {
    pub fn new(store: Arc<Store>, platform: Arc<dyn OsPlatform>) -> Self {
        Self {
            store,
            hosts: HostsWriter::new(platform.clone()),
            ghost: GhostSpawner::new(platform),
        }
    }

    /// Arm a manual session. The config is fully written before the ghost
    /// is spawned so the agent always reads a consistent session.
    pub fn start_focus(&self, duration: Duration) -> Result<()> {
        let config = self.load_tolerant();
        let (task_name, exe) = self.ghost.provision(&config)?;

        let span = chrono::Duration::from_std(duration)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let blocked = config.blocked_apps.clone();
        let duration_secs = duration.as_secs() as i64;

        self.store.update_atomic(|config| {
            config.lock_end_time = Some(Utc::now() + span);
            config.remaining_duration = duration;
            config.emergency_unlocks_used = 0;
            config.ghost_task_name = task_name.clone();
            config.ghost_exe_path = exe.display().to_string();
            for app in &blocked {
                *config.stats.blocked_frequency.entry(app.clone()).or_insert(0) += 1;
                *config.stats.blocked_duration.entry(app.clone()).or_insert(0) += duration_secs;
            }
        })?;

        self.ghost.enable_persistence(&task_name, &exe);
        self.ghost.spawn(&task_name, &exe)?;
        info!("focus session armed for {duration:?}");
        Ok(())
    }

    /// End the manual session. Persistence artifacts are kept while any
    /// enabled schedule still needs the ghost to activate its next window.
    pub fn stop_focus(&self) -> Result<()> {
        let config = self.load_tolerant();
        let keep_ghost = config.has_enabled_schedules();

        if let Err(err) = self.hosts.unblock() {
            warn!("hosts cleanup deferred to the agent: {err}");
        }
        if !keep_ghost {
            self.ghost.cleanup(&config.ghost_task_name, &config.ghost_exe_path);
        }

        self.store.update_atomic(|config| {
            config.lock_end_time = None;
            config.remaining_duration = Duration::ZERO;
            if !keep_ghost {
                config.ghost_task_name.clear();
                config.ghost_exe_path.clear();
            }
        })?;
        info!("focus session stopped (ghost retained: {keep_ghost})");
        Ok(())
    }

    /// Pause enforcement for one minute. Limited to two uses per session;
    /// a refused attempt changes no state.
    pub fn emergency_unlock(&self) -> Result<chrono::DateTime<Utc>> {
        let until = Utc::now()
            + chrono::Duration::from_std(EMERGENCY_UNLOCK_PAUSE)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        let mut refused_at = None;
        let updated = self.store.update_atomic(|config| {
            if config.emergency_unlocks_used >= EMERGENCY_UNLOCK_LIMIT {
                refused_at = Some(config.emergency_unlocks_used);
                return;
            }
            config.paused_until = Some(until);
            config.emergency_unlocks_used += 1;
        })?;

        if let Some(used) = refused_at {
            return Err(Error::LimitReached {
                used,
                limit: EMERGENCY_UNLOCK_LIMIT,
            });
        }
        info!(
            "emergency unlock granted until {until} ({}/{EMERGENCY_UNLOCK_LIMIT} used)",
            updated.emergency_unlocks_used
        );
        Ok(until)
    }

    /// Replace the schedule set. While a session is active, previously
    /// enabled schedules may not be disabled or deleted.
    pub fn save_schedules(&self, schedules: Vec<Schedule>) -> Result<()> {
        let config = self.load_tolerant();
        let locked =
            config.manual_active(Utc::now()) || is_active(&config.schedules, Local::now());

        if locked {
            for old in config.schedules.iter().filter(|s| s.enabled) {
                match schedules.iter().find(|s| s.id == old.id) {
                    None => return Err(Error::ScheduleConflict),
                    Some(new) if !new.enabled => return Err(Error::ScheduleConflict),
                    Some(_) => {}
                }
            }
        }

        self.store.update_atomic(|config| config.schedules = schedules.clone())?;
        self.ensure_ghost_for_schedules()
    }

    /// Startup sanity pass: tear down leftovers when nothing needs
    /// enforcement, or provision the ghost when enabled schedules lack one.
    pub fn startup_sanity(&self) -> Result<()> {
        let config = self.load_tolerant();
        let manual = config.manual_active(Utc::now());
        let schedule_now = is_active(&config.schedules, Local::now());

        if !manual && !schedule_now && !config.has_enabled_schedules() {
            if let Err(err) = self.hosts.unblock() {
                warn!("hosts cleanup failed: {err}");
            }
            if !config.ghost_task_name.is_empty() {
                self.ghost.cleanup(&config.ghost_task_name, &config.ghost_exe_path);
                self.store.update_atomic(|config| {
                    config.ghost_task_name.clear();
                    config.ghost_exe_path.clear();
                })?;
            }
            return Ok(());
        }
        self.ensure_ghost_for_schedules()
    }

    pub fn add_app(&self, name: &str) -> Result<()> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Ok(());
        }
        self.store
            .update_atomic(|config| {
                if !config.blocked_apps.iter().any(|a| a.eq_ignore_ascii_case(&name)) {
                    config.blocked_apps.push(name.clone());
                    config.blocked_apps.sort();
                }
            })
            .map(|_| ())
    }

    pub fn remove_app(&self, name: &str) -> Result<()> {
        self.store
            .update_atomic(|config| {
                config.blocked_apps.retain(|a| !a.eq_ignore_ascii_case(name));
            })
            .map(|_| ())
    }

    pub fn add_site(&self, site: &str) -> Result<()> {
        let site = site.trim().to_string();
        if site.is_empty() {
            return Ok(());
        }
        let updated = self.store.update_atomic(|config| {
            if !config.blocked_sites.iter().any(|s| s.eq_ignore_ascii_case(&site)) {
                config.blocked_sites.push(site.clone());
                config.blocked_sites.sort();
            }
        })?;
        self.apply_hosts_if_active(&updated);
        Ok(())
    }

    pub fn remove_site(&self, site: &str) -> Result<()> {
        let updated = self.store.update_atomic(|config| {
            config.blocked_sites.retain(|s| !s.eq_ignore_ascii_case(site));
        })?;
        self.apply_hosts_if_active(&updated);
        Ok(())
    }

    pub fn set_block_common_vpn(&self, enabled: bool) -> Result<()> {
        self.store.update_atomic(|config| config.block_common_vpn = enabled).map(|_| ())
    }

    pub fn status(&self) -> Result<Config> {
        self.store.load()
    }

    fn ensure_ghost_for_schedules(&self) -> Result<()> {
        let config = self.store.snapshot();
        if !config.has_enabled_schedules() || !config.ghost_task_name.is_empty() {
            return Ok(());
        }

        let (task_name, exe) = self.ghost.provision(&config)?;
        self.store.update_atomic(|config| {
            config.ghost_task_name = task_name.clone();
            config.ghost_exe_path = exe.display().to_string();
        })?;
        self.ghost.enable_persistence(&task_name, &exe);
        if let Err(err) = self.ghost.spawn(&task_name, &exe) {
            warn!("ghost spawn failed, schedules will activate at next logon: {err}");
        }
        Ok(())
    }

    /// Immediate hosts rewrite after a site edit, only while the gate is
    /// open; failures are left for the privileged agent's next slow tick.
    fn apply_hosts_if_active(&self, config: &Config) {
        let active =
            config.manual_active(Utc::now()) || is_active(&config.schedules, Local::now());
        if !active {
            return;
        }
        let mut sites = config.blocked_sites.clone();
        if config.block_common_vpn {
            sites.extend(focus_lock_common::vpn::vpn_domains());
        }
        let result = if sites.is_empty() {
            self.hosts.unblock()
        } else {
            self.hosts.block(&sites)
        };
        if let Err(err) = result {
            warn!("hosts update deferred to the agent: {err}");
        }
    }

    fn load_tolerant(&self) -> Config {
        match self.store.load() {
            Ok(config) => config,
            Err(err) => {
                warn!("config load failed, operating on in-memory state: {err}");
                self.store.snapshot()
            }
        }
    }
}
