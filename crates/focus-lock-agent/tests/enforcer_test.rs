//! End-to-end enforcement scenarios driven through the mock platform.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time::timeout;

use focus_lock_agent::{Cadence, Deadline, Enforcer, SessionClock};
use focus_lock_platform::{MockPlatform, MockProcess, OsPlatform};
use focus_lock_store::Store;

const TEST_CADENCE: Cadence = Cadence {
    fast: Duration::from_millis(20),
    slow: Duration::from_millis(60),
};

struct Scenario {
    _dir: tempfile::TempDir,
    platform: MockPlatform,
    store: Arc<Store>,
}

impl Scenario {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let platform = MockPlatform::new(dir.path());
        std::fs::write(platform.hosts_path(), "127.0.0.1 localhost\n").unwrap();
        let store = Arc::new(Store::new(Arc::new(platform.clone())).unwrap());
        Self {
            _dir: dir,
            platform,
            store,
        }
    }

    fn arm_session(&self, budget: Duration, apps: &[&str], sites: &[&str]) {
        self.store
            .update_atomic(|config| {
                config.blocked_apps = apps.iter().map(|a| a.to_string()).collect();
                config.blocked_sites = sites.iter().map(|s| s.to_string()).collect();
                config.block_common_vpn = false;
                config.lock_end_time = Some(
                    Utc::now()
                        + chrono::Duration::from_std(budget).unwrap_or_else(|_| {
                            chrono::Duration::zero()
                        }),
                );
                config.remaining_duration = budget;
            })
            .unwrap();
    }

    async fn run_to_completion(&self, budget: Duration) {
        let enforcer = Enforcer::new(self.store.clone(), Arc::new(self.platform.clone()))
            .with_cadence(TEST_CADENCE);
        let clock = SessionClock::Armed(Deadline::new(budget));
        timeout(Duration::from_secs(10), enforcer.run(clock))
            .await
            .expect("enforcement loop should terminate")
            .expect("enforcement loop should not fail");
    }
}

#[tokio::test]
async fn test_kill_by_name_within_fast_ticks() {
    let scenario = Scenario::new();
    scenario.arm_session(Duration::from_millis(400), &["notepad.exe"], &[]);
    scenario.platform.set_processes(vec![
        MockProcess::named(100, "notepad.exe"),
        MockProcess::named(200, "explorer.exe"),
    ]);

    scenario.run_to_completion(Duration::from_millis(400)).await;

    let killed = scenario.platform.killed();
    assert_eq!(killed, vec![(100, "notepad.exe".to_string())]);
    assert_eq!(scenario.platform.running_names(), vec!["explorer.exe".to_string()]);

    let stats = scenario.store.load().unwrap().stats;
    assert_eq!(stats.kill_counts.get("notepad.exe"), Some(&1));
}

#[tokio::test]
async fn test_name_match_is_case_insensitive() {
    let scenario = Scenario::new();
    scenario.arm_session(Duration::from_millis(300), &["NotePad.EXE"], &[]);
    scenario.platform.set_processes(vec![MockProcess::named(100, "notepad.exe")]);

    scenario.run_to_completion(Duration::from_millis(300)).await;
    assert_eq!(scenario.platform.killed().len(), 1);
}

#[tokio::test]
async fn test_kill_by_metadata_on_slow_tick() {
    let scenario = Scenario::new();
    // Blocked by product identifier; the running binary is renamed.
    scenario.arm_session(Duration::from_millis(500), &["WhatsApp"], &[]);
    scenario.platform.set_processes(vec![
        MockProcess::with_metadata(300, "renamed.exe", "WhatsApp", "WhatsApp Desktop"),
        MockProcess::with_metadata(301, "editor.exe", "SomeEditor", "A text editor"),
    ]);

    scenario.run_to_completion(Duration::from_millis(500)).await;

    let killed = scenario.platform.killed();
    assert_eq!(killed, vec![(300, "renamed.exe".to_string())]);
}

#[tokio::test]
async fn test_hosts_blocked_during_session_and_released_after() {
    let scenario = Scenario::new();
    scenario.arm_session(Duration::from_millis(400), &[], &["example.com"]);

    let enforcer = Enforcer::new(scenario.store.clone(), Arc::new(scenario.platform.clone()))
        .with_cadence(TEST_CADENCE);
    let clock = SessionClock::Armed(Deadline::new(Duration::from_millis(400)));

    let hosts_path = scenario.platform.hosts_path();
    let platform = scenario.platform.clone();
    let observer = tokio::spawn(async move {
        // Snapshot mid-session.
        tokio::time::sleep(Duration::from_millis(150)).await;
        std::fs::read_to_string(platform.hosts_path()).unwrap()
    });

    timeout(Duration::from_secs(10), enforcer.run(clock)).await.unwrap().unwrap();

    let mid_session = observer.await.unwrap();
    assert!(mid_session.contains("127.0.0.1 example.com"));
    assert!(mid_session.contains("::1 www.example.com"));

    let after = std::fs::read_to_string(&hosts_path).unwrap();
    assert!(!after.contains("example.com"));
    assert!(after.contains("127.0.0.1 localhost"));
}

#[tokio::test]
async fn test_emergency_pause_suspends_kills() {
    let scenario = Scenario::new();
    scenario.arm_session(Duration::from_millis(400), &["notepad.exe"], &[]);
    // Pause covers the whole scenario.
    scenario
        .store
        .update_atomic(|config| {
            config.paused_until = Some(Utc::now() + chrono::Duration::seconds(30));
        })
        .unwrap();
    scenario.platform.set_processes(vec![MockProcess::named(100, "notepad.exe")]);

    scenario.run_to_completion(Duration::from_millis(400)).await;

    assert!(scenario.platform.killed().is_empty());
    assert_eq!(scenario.platform.running_names(), vec!["notepad.exe".to_string()]);
}

#[tokio::test]
async fn test_unlock_mid_session_is_honored() {
    let scenario = Scenario::new();
    scenario.arm_session(Duration::from_secs(2), &["notepad.exe"], &[]);

    let enforcer = Enforcer::new(scenario.store.clone(), Arc::new(scenario.platform.clone()))
        .with_cadence(TEST_CADENCE);
    let clock = SessionClock::Armed(Deadline::new(Duration::from_secs(2)));
    let handle = tokio::spawn({
        let platform = scenario.platform.clone();
        let store = scenario.store.clone();
        async move {
            // Let a few fast ticks pass, pause, then expose the process.
            tokio::time::sleep(Duration::from_millis(100)).await;
            store
                .update_atomic(|config| {
                    config.paused_until = Some(Utc::now() + chrono::Duration::seconds(30));
                })
                .unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            platform.add_process(MockProcess::named(100, "notepad.exe"));
        }
    });

    timeout(Duration::from_secs(10), enforcer.run(clock)).await.unwrap().unwrap();
    handle.await.unwrap();

    assert!(scenario.platform.killed().is_empty(), "paused session must not kill");
}

#[tokio::test]
async fn test_failed_kill_does_not_stop_the_loop() {
    let scenario = Scenario::new();
    scenario.arm_session(Duration::from_millis(400), &["notepad.exe", "steam.exe"], &[]);
    scenario.platform.set_processes(vec![
        MockProcess::named(100, "notepad.exe"),
        MockProcess::named(200, "steam.exe"),
    ]);
    scenario.platform.set_unkillable(100);

    scenario.run_to_completion(Duration::from_millis(400)).await;

    // The protected process survives, the other one dies anyway.
    assert!(scenario.platform.running_names().contains(&"notepad.exe".to_string()));
    assert!(scenario.platform.killed().iter().any(|(pid, _)| *pid == 200));
}

#[tokio::test]
async fn test_loop_clears_lock_and_budget_on_expiry() {
    let scenario = Scenario::new();
    scenario.arm_session(Duration::from_millis(300), &["notepad.exe"], &[]);

    scenario.run_to_completion(Duration::from_millis(300)).await;

    let config = scenario.store.load().unwrap();
    assert!(config.lock_end_time.is_none());
    assert_eq!(config.remaining_duration, Duration::ZERO);
}

#[tokio::test]
async fn test_idle_agent_with_no_schedules_exits_immediately() {
    let scenario = Scenario::new();
    let enforcer = Enforcer::new(scenario.store.clone(), Arc::new(scenario.platform.clone()))
        .with_cadence(TEST_CADENCE);

    timeout(Duration::from_secs(2), enforcer.run(SessionClock::Idle))
        .await
        .expect("idle agent should exit at once")
        .unwrap();
}

#[tokio::test]
async fn test_schedule_window_drives_the_gate_without_manual_session() {
    let scenario = Scenario::new();
    let mut schedule = focus_lock_common::Schedule::new("always");
    schedule.days =
        vec!["Mon".into(), "Tue".into(), "Wed".into(), "Thu".into(), "Fri".into(), "Sat".into(), "Sun".into()];
    schedule.start_time = "00:00".to_string();
    schedule.end_time = "23:59".to_string();
    schedule.enabled = true;
    scenario
        .store
        .update_atomic(|config| {
            config.blocked_apps = vec!["steam.exe".to_string()];
            config.block_common_vpn = false;
            config.schedules = vec![schedule];
        })
        .unwrap();
    scenario.platform.set_processes(vec![MockProcess::named(500, "steam.exe")]);

    // No manual session at all: the schedule alone must open the gate.
    let enforcer = Enforcer::new(scenario.store.clone(), Arc::new(scenario.platform.clone()))
        .with_cadence(TEST_CADENCE);
    let store = scenario.store.clone();
    let stopper = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(250)).await;
        // Disabling the schedule is what lets the agent wind down.
        store
            .update_atomic(|config| config.schedules[0].enabled = false)
            .unwrap();
    });

    timeout(Duration::from_secs(10), enforcer.run(SessionClock::Idle))
        .await
        .expect("loop should exit once the schedule is disabled")
        .unwrap();
    stopper.await.unwrap();

    assert_eq!(scenario.platform.killed(), vec![(500, "steam.exe".to_string())]);
}

#[tokio::test]
async fn test_vpn_union_applies_when_toggled() {
    let scenario = Scenario::new();
    scenario.arm_session(Duration::from_millis(400), &[], &[]);
    scenario.store.update_atomic(|config| config.block_common_vpn = true).unwrap();
    scenario.platform.set_processes(vec![MockProcess::named(400, "openvpn.exe")]);

    scenario.run_to_completion(Duration::from_millis(400)).await;

    assert_eq!(scenario.platform.killed(), vec![(400, "openvpn.exe".to_string())]);
}
