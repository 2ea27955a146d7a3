//! FocusGuard Core - Shared functionality for the FocusGuard tools
//!
//! Paths to the per-user state directory, the persisted user configuration
//! and the small formatting helpers used by the CLI.

pub mod config;
pub mod format;
pub mod paths;

pub use config::Config;
pub use paths::Paths;
