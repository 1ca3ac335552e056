use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Maximum number of emergency unlocks per manual session.
pub const EMERGENCY_UNLOCK_LIMIT: u32 = 2;

/// How long a single emergency unlock suspends enforcement.
pub const EMERGENCY_UNLOCK_PAUSE: Duration = Duration::from_secs(60);

/// The persisted configuration document. Serialized with stable key order
/// (struct order) so the detached HMAC signature is reproducible.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub blocked_apps: Vec<String>,
    pub blocked_sites: Vec<String>,
    pub block_common_vpn: bool,
    pub schedules: Vec<Schedule>,
    pub stats: Stats,
    /// Wall-clock end of the manual session; `None` when no manual session.
    pub lock_end_time: Option<DateTime<Utc>>,
    /// Session budget still owed; the offline / NTP-failure fallback.
    pub remaining_duration: Duration,
    pub ghost_task_name: String,
    pub ghost_exe_path: String,
    /// Enforcement is suspended until this instant (emergency unlock).
    pub paused_until: Option<DateTime<Utc>>,
    pub emergency_unlocks_used: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blocked_apps: Vec::new(),
            blocked_sites: Vec::new(),
            block_common_vpn: true,
            schedules: Vec::new(),
            stats: Stats::default(),
            lock_end_time: None,
            remaining_duration: Duration::ZERO,
            ghost_task_name: String::new(),
            ghost_exe_path: String::new(),
            paused_until: None,
            emergency_unlocks_used: 0,
        }
    }
}

impl Config {
    /// True while a manual session holds the gate open. A spent budget ends
    /// the session even if `lock_end_time` still lies in the future.
    pub fn manual_active(&self, now: DateTime<Utc>) -> bool {
        self.lock_end_time.is_some_and(|end| now < end) && !self.remaining_duration.is_zero()
    }

    pub fn paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.is_some_and(|until| now < until)
    }

    pub fn has_enabled_schedules(&self) -> bool {
        self.schedules.iter().any(|s| s.enabled)
    }

    /// Non-zero `lock_end_time` that already lies in the past.
    pub fn lock_expired(&self, now: DateTime<Utc>) -> bool {
        self.lock_end_time.is_some_and(|end| now >= end)
    }
}

/// A weekly recurring enforcement window. Times are local wall-clock,
/// zero-padded 24-hour `HH:MM`, `start < end` within one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub name: String,
    /// Day names, three-letter: "Mon".."Sun".
    pub days: Vec<String>,
    pub start_time: String,
    pub end_time: String,
    pub enabled: bool,
}

impl Schedule {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            days: Vec::new(),
            start_time: "09:00".to_string(),
            end_time: "17:00".to_string(),
            enabled: false,
        }
    }
}

/// Observation-only counters; never consulted by enforcement.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Stats {
    pub kill_counts: BTreeMap<String, u64>,
    pub blocked_frequency: BTreeMap<String, u64>,
    /// Cumulative seconds each app spent on the blocklist during sessions.
    pub blocked_duration: BTreeMap<String, i64>,
}
