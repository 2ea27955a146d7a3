//! Password gate for disruptive actions
//!
//! The password is stored only as an Argon2id PHC string in an owner-only
//! file. Failed attempts are counted in memory; after [`MAX_ATTEMPTS`]
//! failures a lockout deadline is written to disk so it survives restarts,
//! and is removed lazily once the deadline has passed. The deadline is also
//! held in memory, so a lockout that could not be persisted still holds for
//! the life of the process.

use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use chrono::{DateTime, Duration, Utc};
use std::fs::{self, OpenOptions};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use tracing::{info, warn};

use crate::clock::SharedClock;
use crate::error::{AuthError, FocusError, Result, StorageError};
use crate::session::remaining_until;

/// Consecutive failures that trigger a lockout
pub const MAX_ATTEMPTS: u32 = 3;
/// Length of a lockout in seconds
pub const LOCKOUT_SECS: i64 = 300;
/// Shortest accepted password, in characters
pub const MIN_PASSWORD_LEN: usize = 6;

/// Password hashing, verification and lockout policy
pub struct CredentialGuard {
    hash_file: PathBuf,
    lockout_file: PathBuf,
    clock: SharedClock,
    failed_attempts: AtomicU32,
    locked_until: Mutex<Option<DateTime<Utc>>>,
}

impl CredentialGuard {
    pub fn new(hash_file: impl Into<PathBuf>, lockout_file: impl Into<PathBuf>, clock: SharedClock) -> Self {
        Self {
            hash_file: hash_file.into(),
            lockout_file: lockout_file.into(),
            clock,
            failed_attempts: AtomicU32::new(0),
            locked_until: Mutex::new(None),
        }
    }

    pub fn has_credential(&self) -> bool {
        self.hash_file.is_file()
    }

    /// Hash and store a new password, replacing any existing one
    ///
    /// Does not check the old password; callers changing a password must
    /// verify it first.
    pub fn set_credential(&self, password: &str) -> Result<()> {
        if password.chars().count() < MIN_PASSWORD_LEN {
            return Err(FocusError::InvalidPassword { min: MIN_PASSWORD_LEN });
        }

        let salt = SaltString::generate(&mut OsRng);
        let hash = Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| StorageError::Hash(e.to_string()))?
            .to_string();

        write_private(&self.hash_file, hash.as_bytes())?;
        info!(path = %self.hash_file.display(), "password set");
        Ok(())
    }

    /// Check a password against the stored hash
    pub fn verify(&self, password: &str) -> Result<()> {
        if let Some(remaining) = self.active_lockout()? {
            return Err(AuthError::LockedOut { remaining_secs: remaining }.into());
        }

        let stored = match fs::read_to_string(&self.hash_file) {
            Ok(s) => s,
            Err(e) if is_absent(&e) => return Err(AuthError::NoCredential.into()),
            Err(e) => return Err(e.into()),
        };
        let parsed = PasswordHash::new(stored.trim())
            .map_err(|e| StorageError::Corrupt(format!("credential hash: {e}")))?;

        match Argon2::default().verify_password(password.as_bytes(), &parsed) {
            Ok(()) => {
                self.failed_attempts.store(0, Ordering::SeqCst);
                self.clear_lockout()?;
                Ok(())
            }
            Err(argon2::password_hash::Error::Password) => self.record_failure(),
            Err(e) => Err(StorageError::Hash(e.to_string()).into()),
        }
    }

    fn record_failure(&self) -> Result<()> {
        let failures = self.failed_attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if failures >= MAX_ATTEMPTS {
            let deadline = self.clock.now() + Duration::seconds(LOCKOUT_SECS);
            *self.locked_until.lock().unwrap_or_else(|e| e.into_inner()) = Some(deadline);
            warn!(until = %deadline, "too many failed password attempts, locking out");
            if let Err(e) = write_private(&self.lockout_file, deadline.to_rfc3339().as_bytes()) {
                warn!(
                    path = %self.lockout_file.display(),
                    error = %e,
                    "cannot persist lockout, holding it in memory only"
                );
            }
            return Err(AuthError::LockedOut {
                remaining_secs: LOCKOUT_SECS as u64,
            }
            .into());
        }
        Err(AuthError::WrongPassword {
            remaining_attempts: MAX_ATTEMPTS - failures,
        }
        .into())
    }

    pub fn is_locked_out(&self) -> bool {
        matches!(self.active_lockout(), Ok(Some(_)))
    }

    pub fn remaining_lockout_seconds(&self) -> u64 {
        self.active_lockout().ok().flatten().unwrap_or(0)
    }

    pub fn remaining_attempts(&self) -> u32 {
        MAX_ATTEMPTS.saturating_sub(self.failed_attempts.load(Ordering::SeqCst))
    }

    /// Forget the password and any lockout
    pub fn reset(&self) -> Result<()> {
        remove_if_present(&self.hash_file)?;
        self.clear_lockout()?;
        info!("password reset");
        Ok(())
    }

    /// Seconds left on the current lockout, clearing it once expired
    fn active_lockout(&self) -> Result<Option<u64>> {
        let deadline = match self.persisted_deadline()? {
            Some(d) => Some(d),
            None => *self.locked_until.lock().unwrap_or_else(|e| e.into_inner()),
        };
        let Some(deadline) = deadline else {
            return Ok(None);
        };

        let remaining = remaining_until(deadline, self.clock.now());
        if remaining > 0 {
            Ok(Some(remaining))
        } else {
            info!("lockout expired");
            self.clear_lockout()?;
            Ok(None)
        }
    }

    fn persisted_deadline(&self) -> Result<Option<DateTime<Utc>>> {
        let content = match fs::read_to_string(&self.lockout_file) {
            Ok(s) => s,
            Err(e) if is_absent(&e) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        match DateTime::parse_from_rfc3339(content.trim()) {
            Ok(d) => Ok(Some(d.with_timezone(&Utc))),
            Err(e) => {
                warn!(error = %e, "unreadable lockout file, discarding");
                remove_if_present(&self.lockout_file)?;
                Ok(None)
            }
        }
    }

    fn clear_lockout(&self) -> Result<()> {
        self.failed_attempts.store(0, Ordering::SeqCst);
        *self.locked_until.lock().unwrap_or_else(|e| e.into_inner()) = None;
        remove_if_present(&self.lockout_file)
    }
}

/// Not found, or a parent component that is not a directory
fn is_absent(err: &io::Error) -> bool {
    if err.kind() == ErrorKind::NotFound {
        return true;
    }
    #[cfg(unix)]
    {
        err.raw_os_error() == Some(libc::ENOTDIR)
    }
    #[cfg(not(unix))]
    {
        false
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if is_absent(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Write a file readable by its owner only
fn write_private(path: &Path, content: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(content)?;
    file.sync_all()?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
