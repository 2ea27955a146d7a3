//! Focus session state machine
//!
//! The controller is the only writer to the session store and the hosts
//! file. It is either idle or running exactly one session; the running
//! session lives in a single slot guarded by an async mutex, so a second
//! countdown cannot be started while one is in that slot.
//!
//! State that must survive a crash is read back from disk rather than
//! cached: the open row in the session store and the blocking region in
//! the hosts file.

use chrono::{DateTime, NaiveDate, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use focusguard_core::{Config, Paths};

use crate::clock::{self, SharedClock};
use crate::countdown::{Countdown, CountdownOutcome, DEFAULT_PERIOD};
use crate::credential::{CredentialGuard, MIN_PASSWORD_LEN};
use crate::error::{FocusError, Result};
use crate::hosts::{writer_for, EnforcementStore};
use crate::session::{
    remaining_until, DailyAggregate, Session, NOTE_COMPLETED, NOTE_EXITED, NOTE_RESTART,
    NOTE_STOPPED,
};
use crate::stats::FocusStats;
use crate::store::SessionStore;

const EVENT_CAPACITY: usize = 64;

/// Notifications for whoever is presenting the session
#[derive(Debug, Clone)]
pub enum FocusEvent {
    Started {
        session_id: i64,
        planned_minutes: u32,
        enforced: bool,
    },
    Tick {
        session_id: i64,
        remaining_secs: u64,
    },
    /// The countdown ran out
    Finished(Session),
    /// The session was ended early
    Stopped(Session),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerStatus {
    Idle,
    Active {
        session_id: i64,
        planned_minutes: u32,
        remaining_secs: u64,
        /// Read from the hosts file, not remembered
        enforced: bool,
    },
}

/// A session that has just entered the active state
#[derive(Debug)]
pub struct StartOutcome {
    pub session: Session,
    pub enforced: bool,
    /// Set when blocking was wanted but could not be installed
    pub enforcement_error: Option<FocusError>,
}

/// A session that has just been closed
#[derive(Debug)]
pub struct ClosedSession {
    pub session: Session,
    /// Set when the blocking region could not be removed
    pub cleanup_error: Option<FocusError>,
}

/// What cold-start recovery did with a leftover open session
#[derive(Debug)]
pub enum Recovery {
    /// Nothing was left open
    Nothing,
    /// Time remained, the countdown is running again
    Resumed(StartOutcome),
    /// The deadline passed while nothing was running
    Expired(ClosedSession),
}

#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Require the password to end a session early
    pub strict_mode: bool,
    pub tick_period: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            strict_mode: false,
            tick_period: DEFAULT_PERIOD,
        }
    }
}

struct ActiveSession {
    id: i64,
    planned_minutes: u32,
    deadline: DateTime<Utc>,
    cancel: CancellationToken,
}

struct Inner {
    sessions: Mutex<SessionStore>,
    enforcement: EnforcementStore,
    guard: CredentialGuard,
    clock: SharedClock,
    strict_mode: AtomicBool,
    tick_period: Duration,
    events: broadcast::Sender<FocusEvent>,
    // Held while a tick is sent and while a countdown is cancelled
    tick_gate: Mutex<()>,
    active: AsyncMutex<Option<ActiveSession>>,
}

/// Orchestrates sessions, enforcement and the credential gate
#[derive(Clone)]
pub struct FocusSessionController {
    inner: Arc<Inner>,
}

impl FocusSessionController {
    /// Build a controller, removing any blocking region a crash left behind
    pub fn new(
        sessions: SessionStore,
        enforcement: EnforcementStore,
        guard: CredentialGuard,
        clock: SharedClock,
        options: ControllerOptions,
    ) -> Self {
        if enforcement.is_active() {
            warn!(path = %enforcement.hosts_file().display(), "removing orphaned blocking region");
            if let Err(e) = enforcement.deactivate() {
                error!(error = %e, "could not remove orphaned blocking region");
            }
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                sessions: Mutex::new(sessions),
                enforcement,
                guard,
                clock,
                strict_mode: AtomicBool::new(options.strict_mode),
                tick_period: options.tick_period,
                events,
                tick_gate: Mutex::new(()),
                active: AsyncMutex::new(None),
            }),
        }
    }

    /// Controller over the per-user state directory and the configured hosts file
    pub fn open(paths: &Paths, config: &Config) -> Result<Self> {
        paths.ensure()?;
        let clock = clock::system();
        let sessions = SessionStore::open(&paths.database(), clock.clone())?;
        let enforcement = EnforcementStore::new(
            config.hosts_file.clone(),
            paths.hosts_backup(),
            writer_for(&config.hosts_file),
        );
        let guard = CredentialGuard::new(paths.credential_file(), paths.lockout_file(), clock.clone());

        Ok(Self::new(
            sessions,
            enforcement,
            guard,
            clock,
            ControllerOptions {
                strict_mode: config.strict_mode,
                ..ControllerOptions::default()
            },
        ))
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FocusEvent> {
        self.inner.events.subscribe()
    }

    pub fn strict_mode(&self) -> bool {
        self.inner.strict_mode.load(Ordering::SeqCst)
    }

    pub fn set_strict_mode(&self, enabled: bool) {
        self.inner.strict_mode.store(enabled, Ordering::SeqCst);
    }

    /// Start a session
    ///
    /// With `enforce`, the hosts file must be writable or nothing starts.
    /// Passing `enforce = false` is the explicit override: the session runs
    /// unblocked and records no target hostnames.
    pub async fn start(&self, planned_minutes: u32, hostnames: Vec<String>, enforce: bool) -> Result<StartOutcome> {
        if planned_minutes == 0 {
            return Err(FocusError::InvalidDuration);
        }

        let mut active = self.inner.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(FocusError::Concurrency(current.id));
        }
        if enforce && !self.inner.enforcement.has_write_capability() {
            return Err(FocusError::Permission(
                self.inner.enforcement.hosts_file().display().to_string(),
            ));
        }

        let targeted = if enforce { hostnames } else { Vec::new() };
        let session = {
            let mut store = self.sessions();
            let id = store.start_session(planned_minutes, &targeted)?;
            store.session(id)?
        };

        Ok(self.enter_active(&mut active, session))
    }

    /// End the running session early, as interrupted
    ///
    /// In strict mode the password must verify first; a rejection leaves
    /// the session running.
    pub async fn stop(&self, password: Option<&str>) -> Result<ClosedSession> {
        self.interrupt(password, NOTE_STOPPED).await
    }

    /// Quit while a session may be running. `None` when idle.
    pub async fn shutdown(&self, password: Option<&str>) -> Result<Option<ClosedSession>> {
        match self.interrupt(password, NOTE_EXITED).await {
            Err(FocusError::Idle) => Ok(None),
            other => other.map(Some),
        }
    }

    /// The session left open by an earlier run, without acting on it
    pub fn open_session(&self) -> Result<Option<Session>> {
        self.sessions().open_session()
    }

    /// Pick up a session left open by an earlier run
    ///
    /// With time remaining the countdown restarts from the remainder and
    /// the blocking region is reinstalled. Past its deadline the session
    /// is closed as completed.
    pub async fn discover_open_session(&self) -> Result<Recovery> {
        let mut active = self.inner.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(FocusError::Concurrency(current.id));
        }

        let Some(session) = self.sessions().open_session()? else {
            return Ok(Recovery::Nothing);
        };

        let remaining = session.remaining_secs(self.inner.clock.now());
        if remaining == 0 {
            info!(id = session.id, "recovered session already past its deadline");
            return self.finish(session.id, true, NOTE_COMPLETED).map(Recovery::Expired);
        }

        info!(id = session.id, remaining, "resuming recovered session");
        Ok(Recovery::Resumed(self.enter_active(&mut active, session)))
    }

    /// Close a leftover open session as interrupted instead of resuming it
    ///
    /// Gated like `stop` in strict mode while the session still has time left.
    pub async fn interrupt_recovered(&self, password: Option<&str>) -> Result<Option<ClosedSession>> {
        let active = self.inner.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(FocusError::Concurrency(current.id));
        }

        let Some(session) = self.sessions().open_session()? else {
            return Ok(None);
        };
        if self.strict_mode() && session.remaining_secs(self.inner.clock.now()) > 0 {
            self.inner.guard.verify(password.unwrap_or_default())?;
        }

        self.finish(session.id, false, NOTE_RESTART).map(Some)
    }

    pub async fn status(&self) -> ControllerStatus {
        let active = self.inner.active.lock().await;
        match active.as_ref() {
            None => ControllerStatus::Idle,
            Some(current) => ControllerStatus::Active {
                session_id: current.id,
                planned_minutes: current.planned_minutes,
                remaining_secs: remaining_until(current.deadline, self.inner.clock.now()),
                enforced: self.inner.enforcement.is_active(),
            },
        }
    }

    pub fn today_stats(&self) -> Result<FocusStats> {
        self.sessions().today_stats()
    }

    pub fn week_stats(&self, end: NaiveDate) -> Result<Vec<DailyAggregate>> {
        self.sessions().week_stats(end)
    }

    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        self.sessions().recent_sessions(limit)
    }

    pub fn verify(&self, password: &str) -> Result<()> {
        self.inner.guard.verify(password)
    }

    pub fn set_credential(&self, password: &str) -> Result<()> {
        self.inner.guard.set_credential(password)
    }

    pub fn has_credential(&self) -> bool {
        self.inner.guard.has_credential()
    }

    pub fn is_locked_out(&self) -> bool {
        self.inner.guard.is_locked_out()
    }

    pub fn remaining_lockout_seconds(&self) -> u64 {
        self.inner.guard.remaining_lockout_seconds()
    }

    /// Replace the password after verifying the current one
    pub fn change_credential(&self, old: &str, new: &str) -> Result<()> {
        if new.chars().count() < MIN_PASSWORD_LEN {
            return Err(FocusError::InvalidPassword { min: MIN_PASSWORD_LEN });
        }
        self.inner.guard.verify(old)?;
        self.inner.guard.set_credential(new)
    }

    /// Forget the password. Authorizing this is up to the caller.
    pub fn reset_credential(&self) -> Result<()> {
        self.inner.guard.reset()
    }

    pub fn has_write_capability(&self) -> bool {
        self.inner.enforcement.has_write_capability()
    }

    /// Put the hosts file back as it was before the first activation
    pub async fn restore_hosts(&self) -> Result<()> {
        let active = self.inner.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(FocusError::Concurrency(current.id));
        }
        self.inner.enforcement.restore_from_backup()
    }

    fn sessions(&self) -> MutexGuard<'_, SessionStore> {
        self.inner.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter_active(&self, slot: &mut Option<ActiveSession>, session: Session) -> StartOutcome {
        let (enforced, enforcement_error) = self.enforce(&session.websites);

        let cancel = CancellationToken::new();
        let deadline = session.deadline();
        self.spawn_countdown(session.id, deadline, cancel.clone());
        *slot = Some(ActiveSession {
            id: session.id,
            planned_minutes: session.planned_minutes,
            deadline,
            cancel,
        });

        let _ = self.inner.events.send(FocusEvent::Started {
            session_id: session.id,
            planned_minutes: session.planned_minutes,
            enforced,
        });

        StartOutcome {
            session,
            enforced,
            enforcement_error,
        }
    }

    /// Install the blocking region. Failure is reported, never fatal.
    fn enforce(&self, hostnames: &[String]) -> (bool, Option<FocusError>) {
        if hostnames.is_empty() {
            return (false, None);
        }
        match self.inner.enforcement.activate(hostnames) {
            Ok(()) => (true, None),
            Err(e) => {
                warn!(error = %e, "session continues without blocking");
                (false, Some(e))
            }
        }
    }

    fn spawn_countdown(&self, id: i64, deadline: DateTime<Utc>, cancel: CancellationToken) {
        let controller = self.clone();
        let countdown = Countdown::new(deadline, self.inner.clock.clone()).with_period(self.inner.tick_period);

        tokio::spawn(async move {
            let inner = controller.inner.clone();
            let ticking = cancel.clone();
            let outcome = countdown
                .run(cancel.clone(), move |remaining_secs| {
                    let _gate = inner.tick_gate.lock().unwrap_or_else(|e| e.into_inner());
                    if ticking.is_cancelled() {
                        return;
                    }
                    let _ = inner.events.send(FocusEvent::Tick {
                        session_id: id,
                        remaining_secs,
                    });
                })
                .await;

            if outcome == CountdownOutcome::Expired {
                controller.expire(id, &cancel).await;
            }
        });
    }

    async fn expire(&self, id: i64, cancel: &CancellationToken) {
        let mut active = self.inner.active.lock().await;
        let current = matches!(active.as_ref(), Some(a) if a.id == id);
        if !current || cancel.is_cancelled() {
            return;
        }
        *active = None;

        if let Err(e) = self.finish(id, true, NOTE_COMPLETED) {
            error!(id, error = %e, "could not record completed session");
            if let Err(e) = self.inner.enforcement.deactivate() {
                error!(error = %e, "blocking region could not be removed");
            }
        }
    }

    async fn interrupt(&self, password: Option<&str>, notes: &str) -> Result<ClosedSession> {
        let mut active = self.inner.active.lock().await;
        let id = active.as_ref().map(|a| a.id).ok_or(FocusError::Idle)?;

        if self.strict_mode() {
            self.inner.guard.verify(password.unwrap_or_default())?;
        }

        let closed = match self.close(id, false, notes) {
            // A failed write keeps the session running
            Err(e @ FocusError::Storage(_)) => return Err(e),
            other => other,
        };
        if let Some(current) = active.take() {
            let _gate = self.inner.tick_gate.lock().unwrap_or_else(|e| e.into_inner());
            current.cancel.cancel();
        }
        let closed = closed?;
        self.announce(&closed.session);
        Ok(closed)
    }

    fn finish(&self, id: i64, completed: bool, notes: &str) -> Result<ClosedSession> {
        let closed = self.close(id, completed, notes)?;
        self.announce(&closed.session);
        Ok(closed)
    }

    /// Close a session in the store, then drop the blocking region
    fn close(&self, id: i64, completed: bool, notes: &str) -> Result<ClosedSession> {
        let ended = self.sessions().end_session(id, completed, notes)?;

        let cleanup_error = self.inner.enforcement.deactivate().err();
        if let Some(e) = &cleanup_error {
            error!(id, error = %e, "blocking region could not be removed");
        }

        let session = ended.ok_or(FocusError::NotFound(id))?;
        Ok(ClosedSession {
            session,
            cleanup_error,
        })
    }

    fn announce(&self, session: &Session) {
        let event = if session.completed {
            FocusEvent::Finished(session.clone())
        } else {
            FocusEvent::Stopped(session.clone())
        };
        let _ = self.inner.events.send(event);
    }
}
