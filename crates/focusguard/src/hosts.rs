//! Hosts-file enforcement
//!
//! Blocking works by appending one delimited region to the system hosts
//! file that maps every blocked hostname (and its `www.` variant) to the
//! loopback address. The region itself is the record of whether
//! enforcement is on: nothing is cached, every call re-reads the file.
//!
//! The file is never edited in place. New content is staged in a
//! temporary file and handed to a [`HostsWriter`], which owns the
//! privileged replace step.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{FocusError, Result, StorageError};

pub const BLOCK_START: &str = "# === FOCUSGUARD BLOCK START ===";
pub const BLOCK_END: &str = "# === FOCUSGUARD BLOCK END ===";
pub const LOOPBACK: &str = "127.0.0.1";

/// The privileged step that swaps new content into the hosts file
pub trait HostsWriter: Send + Sync {
    /// Whether `replace` is expected to succeed right now. Must not modify anything.
    fn can_write(&self, target: &Path) -> bool;

    /// Replace `target` with the content of `staged`
    fn replace(&self, staged: &Path, target: &Path) -> Result<()>;
}

/// Writes through non-interactive `sudo`
///
/// Needs a sudoers rule letting the user run `test`, `cp` and `mv` without
/// a password. `-n` makes sudo fail instead of prompting. The new content
/// is copied to a hidden sibling of the target and then renamed over it.
#[derive(Debug, Default, Clone, Copy)]
pub struct SudoWriter;

impl SudoWriter {
    fn run(&self, target: &Path, args: &[&OsStr]) -> Result<()> {
        let output = Command::new("sudo")
            .arg("-n")
            .args(args)
            .output()
            .map_err(|e| FocusError::Permission(format!("{} (sudo: {})", target.display(), e)))?;

        if output.status.success() {
            Ok(())
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            Err(FocusError::Permission(format!(
                "{} (sudo: {})",
                target.display(),
                stderr.trim()
            )))
        }
    }
}

impl HostsWriter for SudoWriter {
    fn can_write(&self, target: &Path) -> bool {
        self.run(target, &[OsStr::new("test"), OsStr::new("-w"), target.as_os_str()])
            .is_ok()
    }

    fn replace(&self, staged: &Path, target: &Path) -> Result<()> {
        // cp creates the sibling with the source's mode, so hand it the target's
        let mut source = NamedTempFile::new()?;
        source.write_all(&fs::read(staged)?)?;
        source.as_file().sync_all()?;
        if let Ok(meta) = fs::metadata(target) {
            fs::set_permissions(source.path(), meta.permissions())?;
        }

        let sibling = sibling_of(target);
        self.run(target, &[OsStr::new("cp"), source.path().as_os_str(), sibling.as_os_str()])?;
        self.run(target, &[OsStr::new("mv"), OsStr::new("-f"), sibling.as_os_str(), target.as_os_str()])
            .inspect_err(|e| warn!(path = %sibling.display(), error = %e, "staged hosts copy left behind"))
    }
}

/// Hidden file next to `target` used as the rename source
fn sibling_of(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "hosts".to_string());
    target.with_file_name(format!(".{name}.focusguard"))
}

/// Writes directly, for a process that already owns write access
///
/// The new content goes to a sibling temporary file that takes over the
/// target's permission bits and is then renamed over it, so both the file
/// and its directory must be writable.
#[derive(Debug, Default, Clone, Copy)]
pub struct DirectWriter;

impl HostsWriter for DirectWriter {
    fn can_write(&self, target: &Path) -> bool {
        OpenOptions::new().append(true).open(target).is_ok() && dir_writable(parent_dir(target))
    }

    fn replace(&self, staged: &Path, target: &Path) -> Result<()> {
        let content = fs::read(staged)?;
        let mut tmp = NamedTempFile::new_in(parent_dir(target)).map_err(|e| permission_or_io(target, e))?;
        tmp.write_all(&content)?;
        tmp.as_file().sync_all()?;

        if let Ok(meta) = fs::metadata(target) {
            fs::set_permissions(tmp.path(), meta.permissions())?;
        }

        tmp.persist(target)
            .map_err(|e| permission_or_io(target, e.error))?;
        Ok(())
    }
}

fn parent_dir(target: &Path) -> &Path {
    target
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
}

/// Whether new entries can be created in `dir`
#[cfg(unix)]
fn dir_writable(dir: &Path) -> bool {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    if !dir.is_dir() {
        return false;
    }
    let Ok(path) = CString::new(dir.as_os_str().as_bytes()) else {
        return false;
    };
    // SAFETY: path is a valid NUL-terminated string that outlives the call
    unsafe { libc::access(path.as_ptr(), libc::W_OK) == 0 }
}

#[cfg(not(unix))]
fn dir_writable(dir: &Path) -> bool {
    fs::metadata(dir)
        .map(|m| m.is_dir() && !m.permissions().readonly())
        .unwrap_or(false)
}

fn permission_or_io(target: &Path, err: std::io::Error) -> FocusError {
    if err.kind() == std::io::ErrorKind::PermissionDenied {
        FocusError::Permission(target.display().to_string())
    } else {
        FocusError::Storage(StorageError::Io(err))
    }
}

/// Pick the writer for this process
///
/// Root, or anyone who can already rewrite the file and its directory,
/// goes direct; everyone else goes through sudo.
pub fn writer_for(target: &Path) -> Box<dyn HostsWriter> {
    if is_root() || DirectWriter.can_write(target) {
        Box::new(DirectWriter)
    } else {
        Box::new(SudoWriter)
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Owner of the blocking region in the hosts file
pub struct EnforcementStore {
    hosts_file: PathBuf,
    backup_file: PathBuf,
    writer: Box<dyn HostsWriter>,
}

impl EnforcementStore {
    pub fn new(
        hosts_file: impl Into<PathBuf>,
        backup_file: impl Into<PathBuf>,
        writer: Box<dyn HostsWriter>,
    ) -> Self {
        Self {
            hosts_file: hosts_file.into(),
            backup_file: backup_file.into(),
            writer,
        }
    }

    pub fn hosts_file(&self) -> &Path {
        &self.hosts_file
    }

    pub fn backup_file(&self) -> &Path {
        &self.backup_file
    }

    /// Whether the blocking region is present in the file right now
    pub fn is_active(&self) -> bool {
        match fs::read_to_string(&self.hosts_file) {
            Ok(content) => has_region(&content),
            Err(e) => {
                debug!(error = %e, "cannot read hosts file");
                false
            }
        }
    }

    /// Hostnames inside the region, without the synthesized `www.` twins
    pub fn currently_blocked(&self) -> Result<BTreeSet<String>> {
        let content = fs::read_to_string(&self.hosts_file)?;
        Ok(blocked_in(&content))
    }

    pub fn has_write_capability(&self) -> bool {
        self.writer.can_write(&self.hosts_file)
    }

    /// Install a region blocking `hostnames`, replacing any existing one
    pub fn activate(&self, hostnames: &[String]) -> Result<()> {
        self.ensure_backup();

        let current = fs::read_to_string(&self.hosts_file)?;
        let mut content = strip_region(&current);
        if !content.is_empty() && !content.ends_with('\n') {
            content.push('\n');
        }
        content.push_str(&build_region(hostnames));

        self.write(&content)?;
        info!(count = hostnames.len(), "blocking region installed");
        Ok(())
    }

    /// Remove the region. Succeeds without writing when there is none.
    pub fn deactivate(&self) -> Result<()> {
        let current = fs::read_to_string(&self.hosts_file)?;
        if !has_region(&current) {
            return Ok(());
        }

        self.write(&strip_region(&current))?;
        info!("blocking region removed");
        Ok(())
    }

    /// Put back the hosts file as it was before the first activation
    ///
    /// Without a backup this only strips the region, which keeps whatever
    /// else has changed in the file since.
    pub fn restore_from_backup(&self) -> Result<()> {
        if !self.backup_file.is_file() {
            warn!(path = %self.backup_file.display(), "no hosts backup, stripping region only");
            return self.deactivate();
        }

        self.writer.replace(&self.backup_file, &self.hosts_file)?;
        info!(from = %self.backup_file.display(), "hosts file restored");
        Ok(())
    }

    /// Copy the pristine file aside once. Never overwritten afterwards.
    fn ensure_backup(&self) {
        if self.backup_file.exists() {
            return;
        }
        if let Some(parent) = self.backup_file.parent() {
            if let Err(e) = fs::create_dir_all(parent) {
                warn!(error = %e, "cannot create backup directory");
                return;
            }
        }
        match fs::copy(&self.hosts_file, &self.backup_file) {
            Ok(_) => info!(path = %self.backup_file.display(), "hosts file backed up"),
            Err(e) => warn!(error = %e, "hosts backup failed"),
        }
    }

    fn write(&self, content: &str) -> Result<()> {
        let mut staged = NamedTempFile::new()?;
        staged.write_all(content.as_bytes())?;
        staged.as_file().sync_all()?;
        self.writer.replace(staged.path(), &self.hosts_file)
    }
}

fn is_marker(line: &str, marker: &str) -> bool {
    line.trim() == marker
}

pub fn has_region(content: &str) -> bool {
    content.lines().any(|line| is_marker(line, BLOCK_START))
}

/// Content with every marked region removed
pub fn strip_region(content: &str) -> String {
    let mut kept = Vec::new();
    let mut inside = false;

    for line in content.split('\n') {
        if is_marker(line, BLOCK_START) {
            inside = true;
        } else if is_marker(line, BLOCK_END) {
            inside = false;
        } else if !inside {
            kept.push(line);
        }
    }

    kept.join("\n")
}

/// A complete region, markers included, ending in a newline
pub fn build_region(hostnames: &[String]) -> String {
    let mut region = String::new();
    region.push_str(BLOCK_START);
    region.push('\n');

    let mut seen = BTreeSet::new();
    for host in hostnames {
        if !seen.insert(host.as_str()) {
            continue;
        }
        region.push_str(&format!("{} {}\n", LOOPBACK, host));
        if !host.starts_with("www.") {
            region.push_str(&format!("{} www.{}\n", LOOPBACK, host));
        }
    }

    region.push_str(BLOCK_END);
    region.push('\n');
    region
}

/// Base hostnames mapped to loopback inside the region
pub fn blocked_in(content: &str) -> BTreeSet<String> {
    let mut hosts = BTreeSet::new();
    let mut inside = false;

    for line in content.lines() {
        if is_marker(line, BLOCK_START) {
            inside = true;
            continue;
        }
        if is_marker(line, BLOCK_END) {
            inside = false;
            continue;
        }
        if !inside {
            continue;
        }

        let mut fields = line.split_whitespace();
        if fields.next() != Some(LOOPBACK) {
            continue;
        }
        if let Some(host) = fields.next() {
            hosts.insert(host.to_string());
        }
    }

    let twins: Vec<String> = hosts
        .iter()
        .filter(|h| h.strip_prefix("www.").is_some_and(|base| hosts.contains(base)))
        .cloned()
        .collect();
    for twin in twins {
        hosts.remove(&twin);
    }
    hosts
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const ORIGINAL: &str = "127.0.0.1 localhost\n::1 localhost\n";

    /// A writer that never has access
    struct Refusing;

    impl HostsWriter for Refusing {
        fn can_write(&self, _target: &Path) -> bool {
            false
        }

        fn replace(&self, _staged: &Path, target: &Path) -> Result<()> {
            Err(FocusError::Permission(target.display().to_string()))
        }
    }

    fn fixture(dir: &TempDir, writer: Box<dyn HostsWriter>) -> EnforcementStore {
        let hosts = dir.path().join("hosts");
        fs::write(&hosts, ORIGINAL).unwrap();
        EnforcementStore::new(hosts, dir.path().join("state").join("hosts_backup"), writer)
    }

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_direct_writer_needs_file_and_directory() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("hosts");
        fs::write(&target, ORIGINAL).unwrap();

        assert!(dir_writable(dir.path()));
        assert!(DirectWriter.can_write(&target));
        assert!(!DirectWriter.can_write(&dir.path().join("missing")));
        assert!(!dir_writable(&dir.path().join("missing")));
        // A file is not a directory entries can be created in
        assert!(!dir_writable(&target));
    }

    #[cfg(unix)]
    #[test]
    fn test_read_only_directory_is_not_direct_writable() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let etc = dir.path().join("etc");
        fs::create_dir(&etc).unwrap();
        let target = etc.join("hosts");
        fs::write(&target, ORIGINAL).unwrap();
        fs::set_permissions(&etc, fs::Permissions::from_mode(0o555)).unwrap();

        // Root ignores permission bits, so only check as an ordinary user
        if !is_root() {
            assert!(OpenOptions::new().append(true).open(&target).is_ok());
            assert!(!DirectWriter.can_write(&target));
        }
        fs::set_permissions(&etc, fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_sudo_sibling_is_hidden_next_to_target() {
        assert_eq!(sibling_of(Path::new("/etc/hosts")), PathBuf::from("/etc/.hosts.focusguard"));
    }

    #[test]
    fn test_region_layout() {
        let region = build_region(&hosts(&["example.com", "www.news.org"]));
        assert_eq!(
            region,
            format!(
                "{}\n127.0.0.1 example.com\n127.0.0.1 www.example.com\n127.0.0.1 www.news.org\n{}\n",
                BLOCK_START, BLOCK_END
            )
        );
    }

    #[test]
    fn test_activate_appends_region() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir, Box::new(DirectWriter));

        assert!(!store.is_active());
        store.activate(&hosts(&["example.com"])).unwrap();

        let content = fs::read_to_string(store.hosts_file()).unwrap();
        assert!(content.starts_with(ORIGINAL));
        assert!(content.contains("127.0.0.1 example.com\n"));
        assert!(content.contains("127.0.0.1 www.example.com\n"));
        assert!(store.is_active());
    }

    #[test]
    fn test_activate_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir, Box::new(DirectWriter));

        store.activate(&hosts(&["a.com"])).unwrap();
        store.activate(&hosts(&["a.com"])).unwrap();
        store.activate(&hosts(&["b.com", "c.com"])).unwrap();

        let content = fs::read_to_string(store.hosts_file()).unwrap();
        assert_eq!(content.matches(BLOCK_START).count(), 1);
        assert_eq!(content.matches(BLOCK_END).count(), 1);
        assert_eq!(store.currently_blocked().unwrap(), BTreeSet::from(["b.com".to_string(), "c.com".to_string()]));

        store.deactivate().unwrap();
        assert_eq!(fs::read_to_string(store.hosts_file()).unwrap(), ORIGINAL);
        assert!(!store.is_active());
    }

    #[test]
    fn test_deactivate_without_region_is_noop() {
        let dir = TempDir::new().unwrap();
        // Refusing writer proves nothing is written
        let store = fixture(&dir, Box::new(Refusing));
        store.deactivate().unwrap();
        assert_eq!(fs::read_to_string(store.hosts_file()).unwrap(), ORIGINAL);
    }

    #[test]
    fn test_currently_blocked_skips_www_twins() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir, Box::new(DirectWriter));
        store
            .activate(&hosts(&["example.com", "www.only-www.net", "reddit.com"]))
            .unwrap();

        let blocked = store.currently_blocked().unwrap();
        let expected: BTreeSet<String> = ["example.com", "www.only-www.net", "reddit.com"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert_eq!(blocked, expected);
    }

    #[test]
    fn test_external_edits_are_kept() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir, Box::new(DirectWriter));
        store.activate(&hosts(&["example.com"])).unwrap();

        let mut content = fs::read_to_string(store.hosts_file()).unwrap();
        content.push_str("10.0.0.5 build-server\n");
        fs::write(store.hosts_file(), &content).unwrap();

        store.activate(&hosts(&["example.com"])).unwrap();
        store.deactivate().unwrap();
        assert_eq!(
            fs::read_to_string(store.hosts_file()).unwrap(),
            format!("{}10.0.0.5 build-server\n", ORIGINAL)
        );
    }

    #[test]
    fn test_markers_match_trimmed_lines_only() {
        let content = format!(
            "# see {} for details\n  {}  \n127.0.0.1 x.com\n\t{}\nafter\n",
            BLOCK_START, BLOCK_START, BLOCK_END
        );
        assert_eq!(strip_region(&content), format!("# see {} for details\nafter\n", BLOCK_START));
        assert_eq!(blocked_in(&content), BTreeSet::from(["x.com".to_string()]));
    }

    #[test]
    fn test_missing_trailing_newline() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir, Box::new(DirectWriter));
        fs::write(store.hosts_file(), "127.0.0.1 localhost").unwrap();

        store.activate(&hosts(&["a.com"])).unwrap();
        let content = fs::read_to_string(store.hosts_file()).unwrap();
        assert!(content.starts_with(&format!("127.0.0.1 localhost\n{}\n", BLOCK_START)));
    }

    #[test]
    fn test_permission_error_leaves_file_untouched() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir, Box::new(Refusing));

        let err = store.activate(&hosts(&["example.com"])).unwrap_err();
        assert!(err.is_permission());
        assert_eq!(fs::read_to_string(store.hosts_file()).unwrap(), ORIGINAL);
        assert!(!store.has_write_capability());
    }

    #[test]
    fn test_backup_taken_once_and_restored() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir, Box::new(DirectWriter));

        store.activate(&hosts(&["a.com"])).unwrap();
        store.deactivate().unwrap();
        fs::write(store.hosts_file(), "changed later\n").unwrap();
        store.activate(&hosts(&["b.com"])).unwrap();

        assert_eq!(fs::read_to_string(store.backup_file()).unwrap(), ORIGINAL);

        store.restore_from_backup().unwrap();
        assert_eq!(fs::read_to_string(store.hosts_file()).unwrap(), ORIGINAL);
    }

    #[test]
    fn test_restore_without_backup_strips_region() {
        let dir = TempDir::new().unwrap();
        let store = fixture(&dir, Box::new(DirectWriter));
        let with_region = format!("{}{}", ORIGINAL, build_region(&hosts(&["a.com"])));
        fs::write(store.hosts_file(), with_region).unwrap();

        store.restore_from_backup().unwrap();
        assert_eq!(fs::read_to_string(store.hosts_file()).unwrap(), ORIGINAL);
    }

    #[cfg(unix)]
    #[test]
    fn test_direct_writer_keeps_mode() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let store = fixture(&dir, Box::new(DirectWriter));
        fs::set_permissions(store.hosts_file(), fs::Permissions::from_mode(0o644)).unwrap();

        store.activate(&hosts(&["a.com"])).unwrap();
        let mode = fs::metadata(store.hosts_file()).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o644);
    }

    #[test]
    fn test_writer_for_writable_file_is_direct() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("hosts");
        fs::write(&path, ORIGINAL).unwrap();

        let writer = writer_for(&path);
        assert!(writer.can_write(&path));
    }
}
