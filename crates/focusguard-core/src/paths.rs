//! Standard paths used by FocusGuard

use std::path::{Path, PathBuf};

/// Environment variable that relocates the whole state directory
pub const HOME_ENV: &str = "FOCUSGUARD_HOME";

/// Standard FocusGuard paths
#[derive(Debug, Clone)]
pub struct Paths {
    /// State directory (~/.config/focusguard)
    pub root: PathBuf,
}

impl Default for Paths {
    fn default() -> Self {
        Self::new()
    }
}

impl Paths {
    pub fn new() -> Self {
        if let Some(root) = std::env::var_os(HOME_ENV) {
            return Self::with_root(PathBuf::from(root));
        }

        let root = dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("~/.config"))
            .join("focusguard");

        Self { root }
    }

    /// Paths rooted at an explicit directory
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the state directory if it does not exist yet
    pub fn ensure(&self) -> std::io::Result<&Path> {
        std::fs::create_dir_all(&self.root)?;
        Ok(&self.root)
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.json")
    }

    /// Salted password hash, owner-readable only
    pub fn credential_file(&self) -> PathBuf {
        self.root.join("auth.hash")
    }

    /// Present only while a lockout is active
    pub fn lockout_file(&self) -> PathBuf {
        self.root.join("lockout")
    }

    /// Verbatim copy of the hosts file taken before the first activation
    pub fn hosts_backup(&self) -> PathBuf {
        self.root.join("hosts_backup")
    }

    pub fn database(&self) -> PathBuf {
        self.root.join("sessions.db")
    }
}

/// Platform location of the shared name-resolution file
pub fn system_hosts_file() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from(r"C:\Windows\System32\drivers\etc\hosts")
    } else {
        PathBuf::from("/etc/hosts")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_files_live_under_root() {
        let paths = Paths::with_root("/tmp/fg-test");
        assert_eq!(paths.config_file(), PathBuf::from("/tmp/fg-test/config.json"));
        assert_eq!(paths.credential_file(), PathBuf::from("/tmp/fg-test/auth.hash"));
        assert_eq!(paths.lockout_file(), PathBuf::from("/tmp/fg-test/lockout"));
        assert_eq!(paths.hosts_backup(), PathBuf::from("/tmp/fg-test/hosts_backup"));
        assert_eq!(paths.database(), PathBuf::from("/tmp/fg-test/sessions.db"));
    }

    #[test]
    fn test_ensure_creates_root() {
        let dir = tempfile::TempDir::new().unwrap();
        let paths = Paths::with_root(dir.path().join("nested").join("focusguard"));
        paths.ensure().unwrap();
        assert!(paths.root.is_dir());
    }
}
