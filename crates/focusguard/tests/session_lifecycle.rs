//! End-to-end session scenarios against a fixture hosts file.

use chrono::{TimeZone, Utc};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast::{self, error::RecvError};

use focusguard::clock::{Clock, ManualClock, SharedClock};
use focusguard::hosts::{DirectWriter, BLOCK_END, BLOCK_START};
use focusguard::session::{local_date, NOTE_COMPLETED, NOTE_STOPPED};
use focusguard::{
    AuthError, ControllerOptions, ControllerStatus, CredentialGuard, EnforcementStore, FocusEvent,
    FocusSessionController, Recovery, Session, SessionStatus, SessionStore,
};

const HOSTS: &str = "127.0.0.1 localhost\n::1 localhost ip6-localhost\n";

struct Env {
    dir: TempDir,
    clock: ManualClock,
}

impl Env {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("hosts"), HOSTS).unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 6, 12, 0, 0).unwrap());
        Self { dir, clock }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.path().join(name)
    }

    fn shared_clock(&self) -> SharedClock {
        Arc::new(self.clock.clone())
    }

    fn hosts(&self) -> String {
        fs::read_to_string(self.path("hosts")).unwrap()
    }

    fn sessions(&self) -> SessionStore {
        SessionStore::open(&self.path("sessions.db"), self.shared_clock()).unwrap()
    }

    fn enforcement(&self) -> EnforcementStore {
        EnforcementStore::new(self.path("hosts"), self.path("hosts_backup"), Box::new(DirectWriter))
    }

    fn controller(&self, strict_mode: bool) -> FocusSessionController {
        FocusSessionController::new(
            self.sessions(),
            self.enforcement(),
            CredentialGuard::new(self.path("auth.hash"), self.path("lockout"), self.shared_clock()),
            self.shared_clock(),
            ControllerOptions {
                strict_mode,
                tick_period: Duration::from_millis(5),
            },
        )
    }
}

fn sites(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

async fn wait_finished(events: &mut broadcast::Receiver<FocusEvent>) -> Session {
    loop {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Ok(FocusEvent::Finished(session))) => return session,
            Ok(Ok(_)) | Ok(Err(RecvError::Lagged(_))) => continue,
            Ok(Err(RecvError::Closed)) => panic!("event channel closed"),
            Err(_) => panic!("session did not finish"),
        }
    }
}

#[tokio::test]
async fn test_full_session_blocks_then_completes() {
    let env = Env::new();
    let controller = env.controller(false);
    let mut events = controller.subscribe();

    let outcome = controller.start(25, sites(&["example.com"]), true).await.unwrap();
    assert!(outcome.enforced);

    let hosts = env.hosts();
    assert!(hosts.contains(BLOCK_START));
    assert!(hosts.contains("127.0.0.1 example.com\n"));
    assert!(hosts.contains("127.0.0.1 www.example.com\n"));
    assert!(hosts.contains(BLOCK_END));

    env.clock.advance(chrono::Duration::minutes(25));
    let session = wait_finished(&mut events).await;
    assert_eq!(session.status(), SessionStatus::Completed);
    assert_eq!(session.notes, NOTE_COMPLETED);

    assert_eq!(env.hosts(), HOSTS);
    let day = env.sessions().day(local_date(session.start_time)).unwrap();
    assert_eq!((day.completed, day.interrupted, day.total_minutes), (1, 0, 25));
}

#[tokio::test]
async fn test_crash_then_resume_counts_once() {
    let env = Env::new();

    // What a crashed run leaves behind: an open row and a live region
    let id = env
        .sessions()
        .start_session(25, &sites(&["example.com", "reddit.com"]))
        .unwrap();
    env.enforcement()
        .activate(&sites(&["example.com", "reddit.com"]))
        .unwrap();
    env.clock.advance(chrono::Duration::minutes(10));

    let controller = env.controller(false);
    let mut events = controller.subscribe();
    let resumed = match controller.discover_open_session().await.unwrap() {
        Recovery::Resumed(outcome) => outcome,
        other => panic!("expected resume, got {other:?}"),
    };
    assert_eq!(resumed.session.id, id);
    assert!(resumed.enforced);
    assert_eq!(
        env.enforcement().currently_blocked().unwrap().into_iter().collect::<Vec<_>>(),
        sites(&["example.com", "reddit.com"])
    );
    match controller.status().await {
        ControllerStatus::Active { session_id, remaining_secs, .. } => {
            assert_eq!(session_id, id);
            assert_eq!(remaining_secs, 15 * 60);
        }
        ControllerStatus::Idle => panic!("expected an active session"),
    }

    env.clock.advance(chrono::Duration::minutes(15));
    let session = wait_finished(&mut events).await;
    assert_eq!(session.id, id);
    assert_eq!(session.actual_minutes, Some(25));
    assert_eq!(env.hosts(), HOSTS);

    let store = env.sessions();
    let week = store.week_stats(local_date(session.start_time)).unwrap();
    assert_eq!(week.iter().map(|d| d.completed).sum::<u32>(), 1);
    assert_eq!(week.iter().map(|d| d.total_minutes).sum::<u32>(), 25);
    assert_eq!(store.recent_sessions(10).unwrap().len(), 1);
}

#[tokio::test]
async fn test_recovered_session_past_deadline_is_completed() {
    let env = Env::new();
    let id = env.sessions().start_session(25, &sites(&["example.com"])).unwrap();
    env.enforcement().activate(&sites(&["example.com"])).unwrap();
    env.clock.advance(chrono::Duration::hours(2));

    let controller = env.controller(false);
    match controller.discover_open_session().await.unwrap() {
        Recovery::Expired(closed) => {
            assert_eq!(closed.session.id, id);
            assert_eq!(closed.session.status(), SessionStatus::Completed);
            assert_eq!(closed.session.actual_minutes, Some(120));
        }
        other => panic!("expected expiry, got {other:?}"),
    }

    assert_eq!(env.hosts(), HOSTS);
    assert!(matches!(controller.discover_open_session().await.unwrap(), Recovery::Nothing));
    let day = env.sessions().day(local_date(env.clock.now() - chrono::Duration::hours(2))).unwrap();
    assert_eq!((day.completed, day.total_minutes), (1, 120));
}

#[tokio::test]
async fn test_strict_mode_lockout_through_stop() {
    let env = Env::new();
    let controller = env.controller(true);
    controller.set_credential("deep-work").unwrap();
    controller.start(50, sites(&["example.com"]), true).await.unwrap();

    for expected in [2, 1] {
        let err = controller.stop(Some("distracted")).await.unwrap_err();
        assert_eq!(err.auth(), Some(&AuthError::WrongPassword { remaining_attempts: expected }));
    }
    let err = controller.stop(Some("distracted")).await.unwrap_err();
    assert_eq!(err.auth(), Some(&AuthError::LockedOut { remaining_secs: 300 }));

    // Lockout survives a restart of the guard
    let guard = CredentialGuard::new(env.path("auth.hash"), env.path("lockout"), env.shared_clock());
    assert!(guard.is_locked_out());

    env.clock.advance(chrono::Duration::seconds(300));
    assert!(!controller.is_locked_out());
    let closed = controller.stop(Some("deep-work")).await.unwrap();
    assert_eq!(closed.session.notes, NOTE_STOPPED);
    assert_eq!(env.hosts(), HOSTS);
}

#[tokio::test]
async fn test_restore_returns_first_seen_bytes() {
    let env = Env::new();
    let enforcement = env.enforcement();

    enforcement.activate(&sites(&["a.com"])).unwrap();
    enforcement.activate(&sites(&["b.com", "c.com"])).unwrap();
    enforcement.deactivate().unwrap();
    fs::write(env.path("hosts"), "10.1.1.1 intranet\n").unwrap();
    enforcement.activate(&sites(&["d.com"])).unwrap();
    enforcement.deactivate().unwrap();
    enforcement.deactivate().unwrap();

    enforcement.restore_from_backup().unwrap();
    assert_eq!(fs::read(env.path("hosts")).unwrap(), HOSTS.as_bytes());
}

#[test]
fn test_deactivate_always_strips_to_base_content() {
    let env = Env::new();
    let enforcement = env.enforcement();
    let sequences: [&[usize]; 4] = [&[1], &[3], &[1, 2, 1], &[0, 4, 2]];

    for activations in sequences {
        for &times in activations {
            for _ in 0..times {
                enforcement.activate(&sites(&["example.com", "www.news.org"])).unwrap();
            }
            enforcement.deactivate().unwrap();
            assert_eq!(env.hosts(), HOSTS);
        }
    }
}
