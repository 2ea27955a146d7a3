//! Durable session history
//!
//! SQLite database with two tables:
//! - `sessions`: one row per focus attempt, open while `end_time` is NULL
//! - `daily_stats`: per-date rollup folded in whenever a session closes
//!
//! Closing a session and folding it into its day happen in one
//! transaction, so the rollup always matches the closed sessions.

use chrono::{DateTime, Duration, NaiveDate, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use std::path::Path;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::error::{FocusError, Result, StorageError};
use crate::session::{local_date, DailyAggregate, Session};
use crate::stats::FocusStats;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    start_time TEXT NOT NULL,
    end_time TEXT,
    planned_duration INTEGER NOT NULL,
    actual_duration INTEGER,
    completed INTEGER NOT NULL DEFAULT 0,
    interrupted INTEGER NOT NULL DEFAULT 0,
    websites_blocked TEXT NOT NULL DEFAULT '[]',
    notes TEXT NOT NULL DEFAULT ''
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_sessions_single_open
    ON sessions((end_time IS NULL)) WHERE end_time IS NULL;

CREATE INDEX IF NOT EXISTS idx_sessions_start ON sessions(start_time DESC);

CREATE TABLE IF NOT EXISTS daily_stats (
    date TEXT PRIMARY KEY,
    total_focus_time INTEGER NOT NULL DEFAULT 0,
    sessions_completed INTEGER NOT NULL DEFAULT 0,
    sessions_interrupted INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL
);
"#;

const SESSION_COLUMNS: &str = "id, start_time, end_time, planned_duration, actual_duration, \
     completed, interrupted, websites_blocked, notes";

/// Session and daily aggregate storage
pub struct SessionStore {
    conn: Connection,
    clock: SharedClock,
}

impl SessionStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path, clock: SharedClock) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        Self::init(conn, clock)
    }

    /// A throwaway database, for tests and dry runs
    pub fn open_in_memory(clock: SharedClock) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, clock)
    }

    fn init(conn: Connection, clock: SharedClock) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn, clock })
    }

    /// Open a new session stamped with the current time
    ///
    /// Fails with [`FocusError::Concurrency`] while another session is open.
    pub fn start_session(&mut self, planned_minutes: u32, hostnames: &[String]) -> Result<i64> {
        let now = self.clock.now();
        let websites = serde_json::to_string(hostnames)
            .map_err(|e| StorageError::Corrupt(format!("website list: {e}")))?;

        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let open: Option<i64> = tx
            .query_row("SELECT id FROM sessions WHERE end_time IS NULL LIMIT 1", [], |row| row.get(0))
            .optional()?;
        if let Some(id) = open {
            return Err(FocusError::Concurrency(id));
        }

        tx.execute(
            "INSERT INTO sessions (start_time, planned_duration, websites_blocked) VALUES (?1, ?2, ?3)",
            params![timestamp(now), planned_minutes, websites],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;

        info!(id, planned_minutes, sites = hostnames.len(), "session started");
        Ok(id)
    }

    /// Close an open session and fold it into its day's aggregate
    ///
    /// Returns the closed session, or `None` (changing nothing) when `id`
    /// is not an open session.
    pub fn end_session(&mut self, id: i64, completed: bool, notes: &str) -> Result<Option<Session>> {
        let now = self.clock.now();
        let tx = self.conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let row = tx
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1 AND end_time IS NULL"),
                params![id],
                SessionRow::from_row,
            )
            .optional()?;
        let Some(row) = row else {
            warn!(id, "end_session ignored: no open session with that id");
            return Ok(None);
        };
        let mut session = row.into_session()?;

        let actual = session.elapsed_minutes(now);
        tx.execute(
            "UPDATE sessions SET end_time = ?1, actual_duration = ?2, completed = ?3, \
             interrupted = ?4, notes = ?5 WHERE id = ?6",
            params![timestamp(now), actual, completed, !completed, notes, id],
        )?;

        let credited = if completed { actual } else { 0 };
        tx.execute(
            r#"
            INSERT INTO daily_stats (date, total_focus_time, sessions_completed, sessions_interrupted, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(date) DO UPDATE SET
                total_focus_time = total_focus_time + excluded.total_focus_time,
                sessions_completed = sessions_completed + excluded.sessions_completed,
                sessions_interrupted = sessions_interrupted + excluded.sessions_interrupted,
                updated_at = excluded.updated_at
            "#,
            params![
                session.date().to_string(),
                credited,
                u32::from(completed),
                u32::from(!completed),
                timestamp(now)
            ],
        )?;
        tx.commit()?;

        session.end_time = Some(now);
        session.actual_minutes = Some(actual);
        session.completed = completed;
        session.interrupted = !completed;
        session.notes = notes.to_string();

        info!(id, completed, minutes = actual, "session closed");
        Ok(Some(session))
    }

    /// The session left open, if any. Entry point for crash recovery.
    pub fn open_session(&self) -> Result<Option<Session>> {
        let row = self
            .conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS} FROM sessions WHERE end_time IS NULL \
                     ORDER BY start_time DESC LIMIT 1"
                ),
                [],
                SessionRow::from_row,
            )
            .optional()?;
        row.map(SessionRow::into_session).transpose()
    }

    pub fn session(&self, id: i64) -> Result<Session> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"),
                params![id],
                SessionRow::from_row,
            )
            .optional()?;
        row.ok_or(FocusError::NotFound(id))?.into_session()
    }

    /// Aggregate for one date, zero-filled when nothing closed that day
    pub fn day(&self, date: NaiveDate) -> Result<DailyAggregate> {
        let row = self
            .conn
            .query_row(
                "SELECT total_focus_time, sessions_completed, sessions_interrupted \
                 FROM daily_stats WHERE date = ?1",
                params![date.to_string()],
                |row| {
                    Ok(DailyAggregate {
                        date,
                        total_minutes: row.get(0)?,
                        completed: row.get(1)?,
                        interrupted: row.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row.unwrap_or_else(|| DailyAggregate::empty(date)))
    }

    pub fn today_stats(&self) -> Result<FocusStats> {
        let today = local_date(self.clock.now());
        Ok(FocusStats::from_day(&self.day(today)?))
    }

    /// Seven days ending on `end`, oldest first, with no gaps
    pub fn week_stats(&self, end: NaiveDate) -> Result<Vec<DailyAggregate>> {
        (0..7)
            .rev()
            .map(|back| self.day(end - Duration::days(back)))
            .collect()
    }

    /// Closed sessions, most recent start first
    pub fn recent_sessions(&self, limit: usize) -> Result<Vec<Session>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions WHERE end_time IS NOT NULL \
             ORDER BY start_time DESC, id DESC LIMIT ?1"
        ))?;
        let rows = stmt
            .query_map(params![limit as i64], SessionRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(SessionRow::into_session).collect()
    }
}

/// Raw column values, converted into a [`Session`] outside the row callback
struct SessionRow {
    id: i64,
    start_time: String,
    end_time: Option<String>,
    planned: u32,
    actual: Option<u32>,
    completed: bool,
    interrupted: bool,
    websites: String,
    notes: String,
}

impl SessionRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            start_time: row.get(1)?,
            end_time: row.get(2)?,
            planned: row.get(3)?,
            actual: row.get(4)?,
            completed: row.get(5)?,
            interrupted: row.get(6)?,
            websites: row.get(7)?,
            notes: row.get(8)?,
        })
    }

    fn into_session(self) -> Result<Session> {
        let websites = serde_json::from_str(&self.websites)
            .map_err(|e| StorageError::Corrupt(format!("session {} websites: {e}", self.id)))?;
        Ok(Session {
            id: self.id,
            start_time: parse_timestamp(&self.start_time)?,
            end_time: self.end_time.as_deref().map(parse_timestamp).transpose()?,
            planned_minutes: self.planned,
            actual_minutes: self.actual,
            completed: self.completed,
            interrupted: self.interrupted,
            websites,
            notes: self.notes,
        })
    }
}

fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::Corrupt(format!("timestamp '{s}': {e}")).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::session::{SessionStatus, NOTE_COMPLETED, NOTE_STOPPED};
    use chrono::TimeZone;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn store() -> (SessionStore, ManualClock) {
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let store = SessionStore::open_in_memory(Arc::new(clock.clone())).unwrap();
        (store, clock)
    }

    fn sites() -> Vec<String> {
        vec!["example.com".to_string()]
    }

    #[test]
    fn test_single_open_session() {
        let (mut store, _) = store();
        let id = store.start_session(25, &sites()).unwrap();

        let err = store.start_session(25, &sites()).unwrap_err();
        assert!(matches!(err, FocusError::Concurrency(open) if open == id));

        let open = store.open_session().unwrap().unwrap();
        assert_eq!(open.id, id);
        assert_eq!(open.status(), SessionStatus::Open);
        assert_eq!(open.websites, sites());
    }

    #[test]
    fn test_completed_session_is_folded() {
        let (mut store, clock) = store();
        let id = store.start_session(25, &sites()).unwrap();
        clock.advance(Duration::minutes(25));

        let closed = store.end_session(id, true, NOTE_COMPLETED).unwrap().unwrap();
        assert_eq!(closed.actual_minutes, Some(25));
        assert!(closed.completed && !closed.interrupted);
        assert!(store.open_session().unwrap().is_none());

        let today = store.today_stats().unwrap();
        assert_eq!((today.minutes, today.completed, today.interrupted), (25, 1, 0));
        assert_eq!(today.success_rate, 100.0);
    }

    #[test]
    fn test_interrupted_session_adds_no_minutes() {
        let (mut store, clock) = store();
        let id = store.start_session(25, &sites()).unwrap();
        clock.advance(Duration::minutes(10));
        store.end_session(id, false, NOTE_STOPPED).unwrap();

        let recent = store.recent_sessions(10).unwrap();
        assert_eq!(recent[0].actual_minutes, Some(10));
        assert_eq!(recent[0].notes, NOTE_STOPPED);
        assert_eq!(recent[0].status(), SessionStatus::Interrupted);

        let today = store.today_stats().unwrap();
        assert_eq!((today.minutes, today.completed, today.interrupted), (0, 0, 1));
        assert_eq!(today.success_rate, 0.0);
    }

    #[test]
    fn test_end_unknown_or_closed_session_is_noop() {
        let (mut store, clock) = store();
        assert!(store.end_session(42, true, "").unwrap().is_none());

        let id = store.start_session(25, &sites()).unwrap();
        clock.advance(Duration::minutes(25));
        store.end_session(id, true, NOTE_COMPLETED).unwrap();
        let before = store.today_stats().unwrap();

        assert!(store.end_session(id, false, "again").unwrap().is_none());
        assert_eq!(store.today_stats().unwrap(), before);
        assert_eq!(store.session(id).unwrap().notes, NOTE_COMPLETED);
    }

    #[test]
    fn test_duration_past_plan_records_elapsed() {
        let (mut store, clock) = store();
        let id = store.start_session(25, &sites()).unwrap();
        clock.advance(Duration::minutes(120));

        let closed = store.end_session(id, true, NOTE_COMPLETED).unwrap().unwrap();
        assert_eq!(closed.actual_minutes, Some(120));
        let day = store.day(local_date(closed.start_time)).unwrap();
        assert_eq!(day.total_minutes, 120);
    }

    #[test]
    fn test_week_stats_always_seven_days() {
        let (store, _) = store();
        let end = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();

        let week = store.week_stats(end).unwrap();
        assert_eq!(week.len(), 7);
        assert_eq!(week[0].date, NaiveDate::from_ymd_opt(2024, 2, 24).unwrap());
        assert_eq!(week[6].date, end);
        assert!(week.iter().all(|d| d.sessions() == 0));
        assert!(week.windows(2).all(|w| w[0].date < w[1].date));
    }

    #[test]
    fn test_week_stats_places_sessions_on_their_day() {
        let (mut store, clock) = store();
        let id = store.start_session(30, &sites()).unwrap();
        clock.advance(Duration::minutes(30));
        store.end_session(id, true, NOTE_COMPLETED).unwrap();

        let day = local_date(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());
        let week = store.week_stats(day + Duration::days(2)).unwrap();
        assert_eq!(week[4].date, day);
        assert_eq!(week[4].total_minutes, 30);
        assert_eq!(week.iter().map(|d| d.completed).sum::<u32>(), 1);
    }

    #[test]
    fn test_recent_sessions_order_and_filter() {
        let (mut store, clock) = store();
        let mut ids = Vec::new();
        for _ in 0..3 {
            let id = store.start_session(5, &sites()).unwrap();
            clock.advance(Duration::minutes(5));
            store.end_session(id, true, NOTE_COMPLETED).unwrap();
            ids.push(id);
        }
        store.start_session(5, &sites()).unwrap();

        let recent = store.recent_sessions(2).unwrap();
        assert_eq!(recent.iter().map(|s| s.id).collect::<Vec<_>>(), vec![ids[2], ids[1]]);
        assert!(recent.iter().all(|s| !s.is_open()));
    }

    #[test]
    fn test_session_not_found() {
        let (store, _) = store();
        assert!(matches!(store.session(7), Err(FocusError::NotFound(7))));
    }

    #[test]
    fn test_reopen_keeps_open_session() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("sessions.db");
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap());

        let id = {
            let mut store = SessionStore::open(&path, Arc::new(clock.clone())).unwrap();
            store.start_session(25, &sites()).unwrap()
        };

        let store = SessionStore::open(&path, Arc::new(clock)).unwrap();
        assert_eq!(store.open_session().unwrap().map(|s| s.id), Some(id));
    }
}
