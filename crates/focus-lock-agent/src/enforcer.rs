//! The enforcement loop.
//!
//! A single cooperative task driven by two timers. The fast tick matches
//! running processes by executable name against a cached lookup set and
//! kills them; the slow tick reloads the config, re-derives the cache,
//! decrements the session budget from the monotonic deadline, runs the
//! deep metadata match for renamed binaries, and reconciles the hosts
//! file with the gate. Every transient error is logged and absorbed; the
//! loop only ends when nothing is left to enforce.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, Utc};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::hosts::HostsWriter;
use crate::time_oracle::{Deadline, SessionClock};
use focus_lock_common::{is_active, vpn, Config};
use focus_lock_platform::OsPlatform;
use focus_lock_store::Store;

/// Tick intervals; tests shrink these to keep scenarios fast.
#[derive(Debug, Clone, Copy)]
pub struct Cadence {
    pub fast: Duration,
    pub slow: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Self {
            fast: Duration::from_millis(200),
            slow: Duration::from_secs(4),
        }
    }
}

/// Lookup sets derived from the config, refreshed every slow tick.
struct BlockCache {
    /// Raw names/identifiers, for the deep metadata match.
    apps: Vec<String>,
    /// Lowercased executable names, for the fast name match.
    lookup: HashSet<String>,
}

impl BlockCache {
    fn derive(config: &Config) -> Self {
        let mut apps = config.blocked_apps.clone();
        if config.block_common_vpn {
            apps.extend(vpn::vpn_executables());
        }
        let lookup = apps.iter().map(|app| app.to_lowercase()).collect();
        Self { apps, lookup }
    }
}

pub struct Enforcer {
    store: Arc<Store>,
    platform: Arc<dyn OsPlatform>,
    hosts: HostsWriter,
    cadence: Cadence,
}

impl Enforcer {
    pub fn new(store: Arc<Store>, platform: Arc<dyn OsPlatform>) -> Self {
        Self {
            store,
            hosts: HostsWriter::new(platform.clone()),
            platform,
            cadence: Cadence::default(),
        }
    }

    pub fn with_cadence(mut self, cadence: Cadence) -> Self {
        self.cadence = cadence;
        self
    }

    /// Run until the session is spent and no schedule needs the agent.
    pub async fn run(&self, clock: SessionClock) -> focus_lock_common::Result<()> {
        let deadline = match clock {
            SessionClock::Armed(deadline) => Some(deadline),
            SessionClock::Expired => {
                self.clear_manual_lock();
                None
            }
            SessionClock::Idle => None,
        };

        let mut config = self.store.snapshot();
        if deadline.is_none() && !config.has_enabled_schedules() {
            info!("nothing to enforce, agent exiting");
            return Ok(());
        }

        let mut cache = BlockCache::derive(&config);
        if self.gate_open(deadline.as_ref(), &config) && !config.paused(Utc::now()) {
            self.apply_hosts(&config);
        }

        let mut fast = interval(self.cadence.fast);
        let mut slow = interval(self.cadence.slow);
        fast.set_missed_tick_behavior(MissedTickBehavior::Delay);
        slow.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "enforcement loop running (fast {:?}, slow {:?})",
            self.cadence.fast, self.cadence.slow
        );

        loop {
            tokio::select! {
                _ = fast.tick() => {
                    if self.should_exit(deadline.as_ref(), &config) {
                        break;
                    }
                    self.fast_tick(deadline.as_ref(), &cache, &config);
                }
                _ = slow.tick() => {
                    self.slow_tick(deadline.as_ref(), &mut config, &mut cache);
                    if self.should_exit(deadline.as_ref(), &config) {
                        break;
                    }
                }
            }
        }

        self.shutdown(deadline.as_ref());
        Ok(())
    }

    /// The gate: a live monotonic deadline or an active schedule window.
    /// The wall clock is deliberately not consulted for the manual side.
    fn gate_open(&self, deadline: Option<&Deadline>, config: &Config) -> bool {
        deadline.is_some_and(|d| !d.expired()) || is_active(&config.schedules, Local::now())
    }

    /// Exit only once the monotonic deadline has passed, no schedule is
    /// active or enabled, and the wall clock agrees the lock is over.
    fn should_exit(&self, deadline: Option<&Deadline>, config: &Config) -> bool {
        if deadline.is_some_and(|d| !d.expired()) {
            return false;
        }
        if is_active(&config.schedules, Local::now()) || config.has_enabled_schedules() {
            return false;
        }
        config.lock_end_time.map_or(true, |end| Utc::now() >= end)
    }

    fn fast_tick(&self, deadline: Option<&Deadline>, cache: &BlockCache, config: &Config) {
        if config.paused(Utc::now()) {
            return;
        }
        if !self.gate_open(deadline, config) {
            return;
        }
        self.enforce_fast(cache);
    }

    fn slow_tick(&self, deadline: Option<&Deadline>, config: &mut Config, cache: &mut BlockCache) {
        // Persist the decremented budget first so a crash loses at most
        // one slow-tick interval.
        if let Some(deadline) = deadline {
            let remaining = deadline.remaining();
            if let Err(err) = self.store.update_atomic(|config| {
                config.remaining_duration = remaining;
            }) {
                warn!("failed to persist remaining duration: {err}");
            }
        }

        match self.store.load() {
            Ok(fresh) => {
                *cache = BlockCache::derive(&fresh);
                *config = fresh;
            }
            Err(err) => warn!("config reload failed, enforcing with cached lists: {err}"),
        }

        let now = Utc::now();
        if config.paused(now) {
            info!("emergency unlock active, enforcement suspended");
            if let Err(err) = self.hosts.unblock() {
                warn!("hosts unblock failed: {err}");
            }
            return;
        }

        if self.gate_open(deadline, config) {
            self.enforce_deep(&cache.apps);
            self.apply_hosts(config);
        } else {
            if let Err(err) = self.hosts.unblock() {
                debug!("hosts unblock failed: {err}");
            }
            if config.lock_expired(now) {
                self.clear_manual_lock();
                config.lock_end_time = None;
                config.remaining_duration = Duration::ZERO;
            }
        }
    }

    /// Name-only matching against the cached lookup set. The config is
    /// reloaded from disk immediately before each kill so an emergency
    /// unlock issued by the shell is honored within one fast tick.
    fn enforce_fast(&self, cache: &BlockCache) {
        if cache.lookup.is_empty() {
            return;
        }
        for entry in self.platform.process_snapshot() {
            if !cache.lookup.contains(&entry.exe_name.to_lowercase()) {
                continue;
            }
            if let Ok(fresh) = self.store.load() {
                if fresh.paused(Utc::now()) {
                    return;
                }
            }
            self.kill(entry.pid, &entry.exe_name);
        }
    }

    /// Metadata matching for renamed binaries: a process whose
    /// ProductName or FileDescription contains a blocked identifier is
    /// killed no matter what its file is called.
    fn enforce_deep(&self, apps: &[String]) {
        if apps.is_empty() {
            return;
        }
        let needles: Vec<String> = apps
            .iter()
            .map(|app| {
                let lowered = app.to_lowercase();
                lowered.strip_suffix(".exe").unwrap_or(&lowered).to_string()
            })
            .filter(|needle| !needle.is_empty())
            .collect();

        for entry in self.platform.process_snapshot() {
            let Some(path) = self.platform.process_image_path(entry.pid) else {
                continue;
            };
            let Some(metadata) = self.platform.file_metadata(&path) else {
                continue;
            };
            let product = metadata.product_name.to_lowercase();
            let description = metadata.file_description.to_lowercase();

            for needle in &needles {
                if (!product.is_empty() && product.contains(needle))
                    || (!description.is_empty() && description.contains(needle))
                {
                    self.kill(entry.pid, &entry.exe_name);
                    break;
                }
            }
        }
    }

    fn kill(&self, pid: u32, exe_name: &str) {
        match self.platform.terminate_process(pid) {
            Ok(()) => {
                info!("terminated {exe_name} [pid {pid}]");
                if let Err(err) = self.store.increment_kill_count(exe_name) {
                    debug!("kill count update failed: {err}");
                }
            }
            Err(err) => warn!("failed to terminate {exe_name} [pid {pid}]: {err}"),
        }
    }

    fn apply_hosts(&self, config: &Config) {
        let mut sites = config.blocked_sites.clone();
        if config.block_common_vpn {
            sites.extend(vpn::vpn_domains());
        }
        if sites.is_empty() {
            return;
        }
        if let Err(err) = self.hosts.block(&sites) {
            warn!("hosts block failed, retrying next slow tick: {err}");
        }
    }

    fn clear_manual_lock(&self) {
        if let Err(err) = self.store.update_atomic(|config| {
            config.lock_end_time = None;
            config.remaining_duration = Duration::ZERO;
        }) {
            warn!("failed to clear expired lock: {err}");
        }
    }

    fn shutdown(&self, deadline: Option<&Deadline>) {
        if let Err(err) = self.hosts.unblock() {
            warn!("hosts unblock on shutdown failed: {err}");
        }
        if deadline.is_some() {
            self.clear_manual_lock();
        }
        info!("enforcement loop finished");
    }
}
