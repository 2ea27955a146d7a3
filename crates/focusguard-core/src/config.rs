//! User configuration for FocusGuard
//!
//! Stored as pretty JSON in the state directory. Keys missing from the file
//! fall back to their defaults, so older files keep loading after new
//! settings are introduced.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::paths::system_hosts_file;

/// Persisted FocusGuard configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Hostnames blocked when a session starts without an explicit list
    #[serde(default = "default_blocked_websites")]
    pub blocked_websites: Vec<String>,

    /// Session length in minutes when none is given
    #[serde(default = "default_focus_duration")]
    pub default_focus_duration: u32,

    /// Require the password to end a session early
    #[serde(default)]
    pub strict_mode: bool,

    /// Shared name-resolution file that receives the blocking region
    #[serde(default = "system_hosts_file")]
    pub hosts_file: PathBuf,
}

fn default_blocked_websites() -> Vec<String> {
    [
        "facebook.com",
        "twitter.com",
        "instagram.com",
        "youtube.com",
        "tiktok.com",
        "reddit.com",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_focus_duration() -> u32 {
    25
}

impl Default for Config {
    fn default() -> Self {
        Self {
            blocked_websites: default_blocked_websites(),
            default_focus_duration: default_focus_duration(),
            strict_mode: false,
            hosts_file: system_hosts_file(),
        }
    }
}

impl Config {
    /// Load config from file
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Self::default())
        }
    }

    /// Save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;
        Ok(())
    }

    /// Add a hostname to the block list. Returns false if it was already there.
    pub fn add_blocked_website(&mut self, website: &str) -> Result<bool> {
        let website = normalize_host(website);
        if website.is_empty() || website.chars().any(char::is_whitespace) {
            bail!("Invalid hostname: '{}'", website);
        }
        if self.blocked_websites.contains(&website) {
            return Ok(false);
        }
        self.blocked_websites.push(website);
        Ok(true)
    }

    /// Remove a hostname from the block list. Returns false if it was absent.
    pub fn remove_blocked_website(&mut self, website: &str) -> bool {
        let website = normalize_host(website);
        let before = self.blocked_websites.len();
        self.blocked_websites.retain(|w| *w != website);
        self.blocked_websites.len() != before
    }

    pub fn set_focus_duration(&mut self, minutes: u32) -> Result<()> {
        if minutes == 0 {
            bail!("Focus duration must be at least one minute");
        }
        self.default_focus_duration = minutes;
        Ok(())
    }

    pub fn set_strict_mode(&mut self, enabled: bool) {
        self.strict_mode = enabled;
    }
}

fn normalize_host(website: &str) -> String {
    website.trim().to_lowercase()
}
