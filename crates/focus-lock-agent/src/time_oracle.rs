//! The monotonic deadline engine.
//!
//! A session's expiry is measured against `Instant`, never against the
//! wall clock, so no wall-clock change can shorten it. At arm time the
//! stored `lock_end_time` is reconciled with network time; when the
//! network is unreachable only the persisted `remaining_duration` is
//! trusted and the end time is rewritten forward from now, which freezes
//! the countdown for whatever span the machine was off or offline.

use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{error, info, warn};

use crate::ntp;
use focus_lock_common::Config;
use focus_lock_store::Store;

/// Expiry measured on the OS monotonic clock.
#[derive(Debug, Clone)]
pub struct Deadline {
    started: Instant,
    initial: Duration,
}

impl Deadline {
    pub fn new(initial: Duration) -> Self {
        Self {
            started: Instant::now(),
            initial,
        }
    }

    pub fn initial(&self) -> Duration {
        self.initial
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn remaining(&self) -> Duration {
        self.initial.saturating_sub(self.elapsed())
    }

    pub fn expired(&self) -> bool {
        self.remaining().is_zero()
    }
}

/// What the oracle found at agent startup.
#[derive(Debug)]
pub enum SessionClock {
    /// No manual session; the gate is driven by schedules alone.
    Idle,
    /// A manual session existed but its budget is spent.
    Expired,
    /// A manual session is running with this much time left.
    Armed(Deadline),
}

/// Reconcile the persisted session with network time and produce the
/// monotonic deadline. Store failures degrade (the loop re-persists every
/// slow tick); they never abort the agent.
pub fn arm(store: &Store) -> SessionClock {
    arm_with_offset(store, ntp::clock_offset())
}

pub fn arm_with_offset(
    store: &Store,
    offset: focus_lock_common::Result<chrono::Duration>,
) -> SessionClock {
    let config = match store.load() {
        Ok(config) => config,
        Err(err) => {
            error!("config unusable at session arm, continuing with defaults: {err}");
            store.snapshot()
        }
    };

    let Some(lock_end) = config.lock_end_time else {
        return SessionClock::Idle;
    };

    let remaining = match offset {
        Ok(offset) => {
            info!("network time offset: {} ms", offset.num_milliseconds());
            let corrected_now = Utc::now() + offset;
            let remaining = (lock_end - corrected_now).to_std().unwrap_or(Duration::ZERO);
            if !remaining.is_zero() {
                persist(store, |config| config.remaining_duration = remaining);
            }
            remaining
        }
        Err(err) => {
            warn!("network time unavailable ({err}); using usage-based countdown");
            offline_remaining(store, &config, lock_end)
        }
    };

    if remaining.is_zero() {
        info!("session already expired at arm");
        return SessionClock::Expired;
    }

    info!("session armed with {remaining:?} remaining");
    SessionClock::Armed(Deadline::new(remaining))
}

/// Offline fallback: trust only the persisted budget and push the wall
/// deadline forward so a jumped clock cannot shorten the session.
fn offline_remaining(
    store: &Store,
    config: &Config,
    lock_end: chrono::DateTime<Utc>,
) -> Duration {
    let remaining = config.remaining_duration;
    if remaining.is_zero() {
        // Pre-budget state: an end time without a recorded budget. All we
        // can do is read the wall clock.
        return (lock_end - Utc::now()).to_std().unwrap_or(Duration::ZERO);
    }

    let span = chrono::Duration::from_std(remaining).unwrap_or_else(|_| chrono::Duration::zero());
    let new_end = Utc::now() + span;
    persist(store, |config| {
        config.lock_end_time = Some(new_end);
        config.remaining_duration = remaining;
    });
    remaining
}

fn persist<F: FnOnce(&mut Config)>(store: &Store, mutate: F) {
    if let Err(err) = store.update_atomic(mutate) {
        warn!("failed to persist reconciled session state: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use focus_lock_common::Error;
    use focus_lock_platform::MockPlatform;
    use std::sync::Arc;

    fn fixture() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let platform = MockPlatform::new(dir.path());
        let store = Store::new(Arc::new(platform)).unwrap();
        (dir, store)
    }

    #[test]
    fn test_deadline_counts_down_monotonically() {
        let deadline = Deadline::new(Duration::from_millis(200));
        assert!(!deadline.expired());

        std::thread::sleep(Duration::from_millis(50));
        let remaining = deadline.remaining();
        assert!(remaining <= Duration::from_millis(150), "remaining was {remaining:?}");

        std::thread::sleep(Duration::from_millis(250));
        assert!(deadline.expired());
        assert_eq!(deadline.remaining(), Duration::ZERO);
    }

    #[test]
    fn test_no_manual_session_is_idle() {
        let (_dir, store) = fixture();
        assert!(matches!(
            arm_with_offset(&store, Ok(chrono::Duration::zero())),
            SessionClock::Idle
        ));
    }

    #[test]
    fn test_arm_online_uses_corrected_now() {
        let (_dir, store) = fixture();
        store
            .update_atomic(|config| {
                config.lock_end_time = Some(Utc::now() + chrono::Duration::minutes(10));
                config.remaining_duration = Duration::from_secs(600);
            })
            .unwrap();

        let clock = arm_with_offset(&store, Ok(chrono::Duration::zero()));
        let SessionClock::Armed(deadline) = clock else {
            panic!("expected an armed session");
        };
        assert!(deadline.initial() > Duration::from_secs(595));
        assert!(deadline.initial() <= Duration::from_secs(600));
    }

    #[test]
    fn test_arm_online_detects_backdated_clock() {
        let (_dir, store) = fixture();
        // End time 10 minutes out, but the network says our clock runs an
        // hour behind: the session is actually long over.
        store
            .update_atomic(|config| {
                config.lock_end_time = Some(Utc::now() + chrono::Duration::minutes(10));
                config.remaining_duration = Duration::from_secs(600);
            })
            .unwrap();

        let clock = arm_with_offset(&store, Ok(chrono::Duration::hours(1)));
        assert!(matches!(clock, SessionClock::Expired));
    }

    #[test]
    fn test_arm_offline_rewrites_end_time_from_budget() {
        let (_dir, store) = fixture();
        // The machine was off for two hours; the stored end time is stale
        // but 25 minutes of budget remain.
        store
            .update_atomic(|config| {
                config.lock_end_time = Some(Utc::now() - chrono::Duration::hours(2));
                config.remaining_duration = Duration::from_secs(25 * 60);
            })
            .unwrap();

        let clock = arm_with_offset(&store, Err(Error::NetTime));
        let SessionClock::Armed(deadline) = clock else {
            panic!("expected an armed session");
        };
        assert_eq!(deadline.initial(), Duration::from_secs(25 * 60));

        let saved = store.load().unwrap();
        let end = saved.lock_end_time.unwrap();
        let distance = end - Utc::now();
        assert!(distance > chrono::Duration::minutes(24));
        assert!(distance <= chrono::Duration::minutes(25));
    }

    #[test]
    fn test_arm_offline_without_budget_is_expired() {
        let (_dir, store) = fixture();
        store
            .update_atomic(|config| {
                config.lock_end_time = Some(Utc::now() - chrono::Duration::minutes(5));
                config.remaining_duration = Duration::ZERO;
            })
            .unwrap();

        assert!(matches!(arm_with_offset(&store, Err(Error::NetTime)), SessionClock::Expired));
    }
}
