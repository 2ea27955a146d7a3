//! focusguard - time-boxed focus sessions with hostname blocking
//!
//! While a session runs, a configurable set of hostnames is pointed at the
//! loopback address through a marked region in the system hosts file.
//! Ending a session early can be gated behind a password with a lockout
//! after repeated failures.
//!
//! Components:
//! - credential: password hash, verification and persisted lockout
//! - hosts: the blocking region, backup and restore
//! - store: session records and daily aggregates in SQLite
//! - controller: the session state machine tying the three together

pub mod clock;
pub mod controller;
pub mod countdown;
pub mod credential;
pub mod error;
pub mod hosts;
pub mod session;
pub mod stats;
pub mod store;

pub use controller::{
    ClosedSession, ControllerOptions, ControllerStatus, FocusEvent, FocusSessionController, Recovery,
    StartOutcome,
};
pub use credential::CredentialGuard;
pub use error::{AuthError, FocusError, StorageError};
pub use hosts::{EnforcementStore, HostsWriter};
pub use session::{DailyAggregate, Session, SessionStatus};
pub use stats::FocusStats;
pub use store::SessionStore;
