//! focusguard - time-boxed focus sessions with hostname blocking
//!
//! Usage:
//!   focusguard start [MINS]          Run a focus session in the foreground
//!   focusguard resume                Pick up a session left open by a crash
//!   focusguard status                Show the running session, if any
//!   focusguard stats | week          Today's numbers, the last seven days
//!   focusguard history               Recent sessions
//!   focusguard sites add|remove|list Edit the default block list
//!   focusguard strict on|off         Require the password to stop early
//!   focusguard password ...          Manage the password
//!   focusguard check-access          Check write access to the hosts file
//!   focusguard restore-hosts         Restore the hosts file from backup

use anyhow::{bail, Context, Result};
use chrono::{Local, Utc};
use clap::{Parser, Subcommand};
use std::io::Write;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing_subscriber::EnvFilter;

use focusguard::clock;
use focusguard::hosts::writer_for;
use focusguard::{
    AuthError, ClosedSession, CredentialGuard, EnforcementStore, FocusError, FocusEvent,
    FocusSessionController, FocusStats, Recovery, SessionStatus, SessionStore,
};
use focusguard_core::{format, Config, Paths};

/// FocusGuard - block distracting sites for a fixed stretch of time
#[derive(Parser)]
#[command(name = "focusguard")]
#[command(about = "Time-boxed focus sessions that block distracting hostnames")]
#[command(version)]
#[command(after_help = r#"HOW IT WORKS:
    While a session runs, the blocked hostnames are mapped to 127.0.0.1
    in the system hosts file. The entries are removed when the session
    ends, and any left behind by a crash are removed on the next start.

WRITE ACCESS:
    Root writes the hosts file directly. Everyone else needs a sudoers
    rule allowing cp, mv and test without a password, for example:
        youruser ALL=(ALL) NOPASSWD: /bin/cp, /bin/mv, /usr/bin/test
    Run 'focusguard check-access' to verify.

STRICT MODE:
    With strict mode on, stopping a session early (Ctrl-C) asks for the
    password. Three wrong answers lock it for five minutes.

EXAMPLES:
    focusguard start                    # default length and block list
    focusguard start 50 --site news.ycombinator.com
    focusguard start 25 --no-block      # timer only
    focusguard sites add reddit.com
    focusguard password set
    focusguard strict on
    focusguard week

ENVIRONMENT:
    FOCUSGUARD_HOME    state directory (default: ~/.config/focusguard)
    RUST_LOG           log filter, e.g. RUST_LOG=focusguard=debug
"#)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a focus session in the foreground
    #[command(alias = "s")]
    Start {
        /// Length in minutes (default from config)
        #[arg(value_name = "MINS")]
        minutes: Option<u32>,

        /// Block this hostname instead of the configured list (repeatable)
        #[arg(long = "site", value_name = "HOST")]
        sites: Vec<String>,

        /// Run the timer without touching the hosts file
        #[arg(long)]
        no_block: bool,
    },

    /// Resume a session left open by an earlier run
    Resume {
        /// Close it as interrupted instead of resuming
        #[arg(long)]
        interrupt: bool,
    },

    /// Show the running session
    #[command(alias = "st")]
    Status,

    /// Show today's statistics
    Stats,

    /// Show the last seven days
    Week,

    /// Show recent sessions
    History {
        /// Number of sessions to show
        #[arg(short = 'n', long, default_value = "10")]
        limit: usize,
    },

    /// Manage the default block list
    Sites {
        #[command(subcommand)]
        action: Option<SitesAction>,
    },

    /// Turn strict mode on or off
    Strict {
        #[arg(value_parser = ["on", "off"])]
        state: String,
    },

    /// Manage the password
    Password {
        #[command(subcommand)]
        action: PasswordAction,
    },

    /// Check whether the hosts file can be written
    CheckAccess,

    /// Restore the hosts file from the backup taken before first use
    RestoreHosts,
}

#[derive(Subcommand)]
enum SitesAction {
    /// List blocked hostnames
    List,
    /// Add a hostname
    Add { host: String },
    /// Remove a hostname
    Remove { host: String },
}

#[derive(Subcommand)]
enum PasswordAction {
    /// Set the password for the first time
    Set,
    /// Change the password
    Change,
    /// Forget the password and any lockout
    Reset {
        /// Confirm the reset
        #[arg(long)]
        confirm: bool,
    },
    /// Show whether a password is set and any lockout
    Status,
}

// ANSI color codes
const RED: &str = "\x1b[0;31m";
const GREEN: &str = "\x1b[0;32m";
const YELLOW: &str = "\x1b[0;33m";
const CYAN: &str = "\x1b[0;36m";
const MAGENTA: &str = "\x1b[0;35m";
const BOLD: &str = "\x1b[1m";
const NC: &str = "\x1b[0m";

fn use_colors() -> bool {
    std::io::IsTerminal::is_terminal(&std::io::stdout())
}

fn color(code: &str, text: &str) -> String {
    if use_colors() {
        format!("{}{}{}", code, text, NC)
    } else {
        text.to_string()
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let paths = Paths::new();
    let mut config = Config::load(&paths.config_file())?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match cli.command {
            Some(Commands::Start {
                minutes,
                sites,
                no_block,
            }) => cmd_start(&paths, &config, minutes, sites, no_block).await,
            Some(Commands::Resume { interrupt }) => cmd_resume(&paths, &config, interrupt).await,
            Some(Commands::Status) | None => cmd_status(&paths, &config),
            Some(Commands::Stats) => cmd_stats(&paths),
            Some(Commands::Week) => cmd_week(&paths),
            Some(Commands::History { limit }) => cmd_history(&paths, limit),
            Some(Commands::Sites { action }) => cmd_sites(&paths, &mut config, action),
            Some(Commands::Strict { state }) => cmd_strict(&paths, &mut config, state == "on"),
            Some(Commands::Password { action }) => cmd_password(&paths, action),
            Some(Commands::CheckAccess) => cmd_check_access(&paths, &config),
            Some(Commands::RestoreHosts) => cmd_restore_hosts(&paths, &config),
        }
    })
}

fn session_store(paths: &Paths) -> Result<SessionStore> {
    SessionStore::open(&paths.database(), clock::system()).context("Failed to open session database")
}

fn enforcement(paths: &Paths, config: &Config) -> EnforcementStore {
    EnforcementStore::new(
        config.hosts_file.clone(),
        paths.hosts_backup(),
        writer_for(&config.hosts_file),
    )
}

fn credential_guard(paths: &Paths) -> CredentialGuard {
    CredentialGuard::new(paths.credential_file(), paths.lockout_file(), clock::system())
}

fn prompt(label: &str) -> Result<String> {
    rpassword::prompt_password(label).context("Failed to read password")
}

/// Ask twice, require a match
fn prompt_new_password() -> Result<String> {
    let first = prompt("New password: ")?;
    let second = prompt("Repeat new password: ")?;
    if first != second {
        bail!("Passwords do not match");
    }
    Ok(first)
}

/// Human wording that keeps the three rejection cases apart
fn describe_auth(err: &AuthError) -> String {
    match err {
        AuthError::WrongPassword { remaining_attempts } => format!(
            "Wrong password. {} attempt{} left before lockout.",
            remaining_attempts,
            if *remaining_attempts == 1 { "" } else { "s" }
        ),
        AuthError::LockedOut { remaining_secs } => format!(
            "Too many wrong passwords. Locked for another {}.",
            format::countdown(*remaining_secs)
        ),
        AuthError::NoCredential => {
            "No password has been set yet. Run 'focusguard password set'.".to_string()
        }
    }
}

/// Turn credential rejections into their user-facing wording
fn auth_failure(err: FocusError) -> anyhow::Error {
    match err {
        FocusError::Auth(auth) => anyhow::anyhow!(describe_auth(&auth)),
        other => other.into(),
    }
}

fn normalize_sites(sites: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for site in sites {
        let site = site.trim().to_lowercase();
        if !site.is_empty() && !out.contains(&site) {
            out.push(site);
        }
    }
    out
}

/// Start a session and stay with it until it ends
async fn cmd_start(
    paths: &Paths,
    config: &Config,
    minutes: Option<u32>,
    sites: Vec<String>,
    no_block: bool,
) -> Result<()> {
    paths.ensure()?;
    if let Some(open) = session_store(paths)?.open_session()? {
        bail!(
            "Session {} is still open. Run 'focusguard resume' to continue it or 'focusguard resume --interrupt' to close it.",
            open.id
        );
    }

    let controller = FocusSessionController::open(paths, config)?;
    let minutes = minutes.unwrap_or(config.default_focus_duration);
    let hosts = if sites.is_empty() {
        config.blocked_websites.clone()
    } else {
        normalize_sites(sites)
    };

    let events = controller.subscribe();
    let outcome = match controller.start(minutes, hosts, !no_block).await {
        Ok(outcome) => outcome,
        Err(FocusError::Permission(target)) => bail!(
            "Cannot write {}. Run 'focusguard check-access' for setup help, or pass --no-block to run the timer only.",
            target
        ),
        Err(e) => return Err(e.into()),
    };

    let ends_at = outcome.session.deadline().with_timezone(&Local);
    println!("{} Focus session started", color(GREEN, "[ok]"));
    println!();
    println!("  {}  {}", color(CYAN, "Duration:"), format::minutes(minutes));
    println!("  {}   {}", color(CYAN, "Ends at:"), ends_at.format("%H:%M"));
    if outcome.enforced {
        println!("  {}  {}", color(CYAN, "Blocking:"), outcome.session.websites.join(", "));
    } else if let Some(err) = &outcome.enforcement_error {
        println!("  {} sites are NOT blocked: {}", color(YELLOW, "[warn]"), err);
    } else {
        println!("  {}  off", color(CYAN, "Blocking:"));
    }
    if controller.strict_mode() {
        println!("  {}    on (password needed to stop early)", color(CYAN, "Strict:"));
    }
    println!();
    println!("Press Ctrl-C to stop early.");

    run_foreground(&controller, events).await
}

/// Resume or close a session left open by an earlier run
async fn cmd_resume(paths: &Paths, config: &Config, interrupt: bool) -> Result<()> {
    let controller = FocusSessionController::open(paths, config)?;

    if interrupt {
        let needs_password = controller.strict_mode()
            && controller
                .open_session()?
                .is_some_and(|s| s.remaining_secs(Utc::now()) > 0);
        let password = if needs_password {
            Some(prompt("Password: ")?)
        } else {
            None
        };

        return match controller.interrupt_recovered(password.as_deref()).await {
            Ok(Some(closed)) => {
                report_closed(&closed);
                Ok(())
            }
            Ok(None) => {
                println!("No open session.");
                Ok(())
            }
            Err(e) => Err(auth_failure(e)),
        };
    }

    let events = controller.subscribe();
    match controller.discover_open_session().await? {
        Recovery::Nothing => {
            println!("No open session to resume.");
            Ok(())
        }
        Recovery::Expired(closed) => {
            println!(
                "{} Session {} ran its full length while FocusGuard was not running.",
                color(GREEN, "[ok]"),
                closed.session.id
            );
            report_closed(&closed);
            Ok(())
        }
        Recovery::Resumed(outcome) => {
            let remaining = outcome.session.remaining_secs(Utc::now());
            println!(
                "{} Resumed session {} with {} left",
                color(GREEN, "[ok]"),
                outcome.session.id,
                format::countdown(remaining)
            );
            if let Some(err) = &outcome.enforcement_error {
                println!("  {} sites are NOT blocked: {}", color(YELLOW, "[warn]"), err);
            }
            println!("Press Ctrl-C to stop early.");
            run_foreground(&controller, events).await
        }
    }
}

/// Print the countdown until the session finishes or is stopped
async fn run_foreground(
    controller: &FocusSessionController,
    mut events: broadcast::Receiver<FocusEvent>,
) -> Result<()> {
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(FocusEvent::Tick { remaining_secs, .. }) => {
                    print!("\r  {} remaining ", color(BOLD, &format::countdown(remaining_secs)));
                    std::io::stdout().flush()?;
                }
                Ok(FocusEvent::Finished(session)) => {
                    println!();
                    println!("{}", color(&format!("{}{}", BOLD, GREEN), "Session complete!"));
                    println!("{} minutes of focus recorded. Sites are unblocked.", session.actual_minutes.unwrap_or(0));
                    return Ok(());
                }
                Ok(FocusEvent::Stopped(_)) | Err(RecvError::Closed) => return Ok(()),
                Ok(FocusEvent::Started { .. }) | Err(RecvError::Lagged(_)) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                let password = if controller.strict_mode() {
                    Some(tokio::task::spawn_blocking(|| prompt("Password to stop: ")).await??)
                } else {
                    None
                };

                match controller.stop(password.as_deref()).await {
                    Ok(closed) => {
                        report_closed(&closed);
                        return Ok(());
                    }
                    Err(FocusError::Idle) => return Ok(()),
                    Err(FocusError::Auth(e)) => {
                        println!("{} {} The session continues.", color(RED, "[denied]"), describe_auth(&e));
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
    }
}

fn report_closed(closed: &ClosedSession) {
    let session = &closed.session;
    let label = match session.status() {
        SessionStatus::Completed => color(GREEN, "completed"),
        _ => color(YELLOW, "interrupted"),
    };
    println!(
        "Session {} {} after {} of {} planned.",
        session.id,
        label,
        format::minutes(session.actual_minutes.unwrap_or(0)),
        format::minutes(session.planned_minutes)
    );
    if let Some(err) = &closed.cleanup_error {
        println!(
            "{} blocking entries could not be removed ({}). Run 'focusguard restore-hosts'.",
            color(RED, "[error]"),
            err
        );
    }
}

/// Show the open session from durable state only
fn cmd_status(paths: &Paths, config: &Config) -> Result<()> {
    let store = session_store(paths)?;
    let enforcement = enforcement(paths, config);
    let now = Utc::now();

    match store.open_session()? {
        None => {
            println!("No focus session running");
            if enforcement.is_active() {
                println!(
                    "{} blocking entries are present in {} without a session. Run 'focusguard restore-hosts'.",
                    color(YELLOW, "[warn]"),
                    config.hosts_file.display()
                );
            }
            println!();
            println!("Start one with: focusguard start");
        }
        Some(session) => {
            let progress = session.progress_percent(now);
            println!("{}", color(&format!("{}{}", BOLD, MAGENTA), "FOCUS SESSION ACTIVE"));
            println!();
            println!("  {} [{}] {}%", color(CYAN, "Progress:"), format::progress_bar(progress, 30), progress);
            println!("  {}   {}", color(CYAN, "Elapsed:"), format::minutes(session.elapsed_minutes(now)));
            println!("  {} {}", color(CYAN, "Remaining:"), format::countdown(session.remaining_secs(now)));
            if enforcement.is_active() {
                let blocked: Vec<String> = enforcement.currently_blocked()?.into_iter().collect();
                println!("  {}  {}", color(CYAN, "Blocking:"), blocked.join(", "));
            } else {
                println!("  {}  off", color(CYAN, "Blocking:"));
            }
        }
    }

    println!();
    print_today(&store.today_stats()?);
    Ok(())
}

fn print_today(stats: &FocusStats) {
    println!("{}Today{}", BOLD, NC);
    println!("  {}       {}", color(CYAN, "Focus:"), format::minutes(stats.minutes));
    println!("  {}   {}", color(CYAN, "Completed:"), stats.completed);
    println!("  {} {}", color(CYAN, "Interrupted:"), stats.interrupted);
    println!("  {}     {:.0}%", color(CYAN, "Success:"), stats.success_rate);
}

fn cmd_stats(paths: &Paths) -> Result<()> {
    let store = session_store(paths)?;
    print_today(&store.today_stats()?);
    Ok(())
}

fn cmd_week(paths: &Paths) -> Result<()> {
    let store = session_store(paths)?;
    let days = store.week_stats(Local::now().date_naive())?;
    let longest = days.iter().map(|d| d.total_minutes).max().unwrap_or(0).max(1);

    println!("{}Last 7 days{}", BOLD, NC);
    println!();
    for day in &days {
        let percent = day.total_minutes * 100 / longest;
        println!(
            "  {}  {}  {:>7}  {} done, {} stopped",
            day.date.format("%a %m-%d"),
            format::progress_bar(percent, 20),
            format::minutes(day.total_minutes),
            day.completed,
            day.interrupted
        );
    }

    let week = FocusStats::from_days(&days);
    let (hours, mins) = week.total_time();
    println!();
    println!(
        "  {} {}h {}m over {} sessions ({:.0}% completed)",
        color(CYAN, "Total:"),
        hours,
        mins,
        week.sessions(),
        week.success_rate
    );
    Ok(())
}

fn cmd_history(paths: &Paths, limit: usize) -> Result<()> {
    let store = session_store(paths)?;
    let sessions = store.recent_sessions(limit)?;
    if sessions.is_empty() {
        println!("No sessions yet.");
        return Ok(());
    }

    let now = Utc::now();
    for session in sessions {
        let status = match session.status() {
            SessionStatus::Completed => color(GREEN, "done"),
            _ => color(YELLOW, "stop"),
        };
        println!(
            "  {:>4}  {}  {}  {:>7} / {:<7}  {:>8}  {}",
            session.id,
            status,
            session.start_time.with_timezone(&Local).format("%Y-%m-%d %H:%M"),
            format::minutes(session.actual_minutes.unwrap_or(0)),
            format::minutes(session.planned_minutes),
            format::relative_time(session.start_time, now),
            format::truncate(&session.notes, 40)
        );
    }
    Ok(())
}

fn cmd_sites(paths: &Paths, config: &mut Config, action: Option<SitesAction>) -> Result<()> {
    match action.unwrap_or(SitesAction::List) {
        SitesAction::List => {
            if config.blocked_websites.is_empty() {
                println!("Block list is empty. Add one with: focusguard sites add HOST");
            }
            for site in &config.blocked_websites {
                println!("  {}", site);
            }
            return Ok(());
        }
        SitesAction::Add { host } => {
            if config.add_blocked_website(&host)? {
                println!("{} Added {}", color(GREEN, "[ok]"), host.trim().to_lowercase());
            } else {
                println!("{} already blocked", host);
            }
        }
        SitesAction::Remove { host } => {
            if config.remove_blocked_website(&host) {
                println!("{} Removed {}", color(GREEN, "[ok]"), host);
            } else {
                println!("{} was not in the list", host);
            }
        }
    }
    paths.ensure()?;
    config.save(&paths.config_file())
}

fn cmd_strict(paths: &Paths, config: &mut Config, enabled: bool) -> Result<()> {
    let guard = credential_guard(paths);

    if enabled && !guard.has_credential() {
        bail!("Set a password first: focusguard password set");
    }
    if !enabled && config.strict_mode && guard.has_credential() {
        guard.verify(&prompt("Password: ")?).map_err(auth_failure)?;
    }

    config.set_strict_mode(enabled);
    paths.ensure()?;
    config.save(&paths.config_file())?;
    println!(
        "{} Strict mode {}",
        color(GREEN, "[ok]"),
        if enabled { "on" } else { "off" }
    );
    Ok(())
}

fn cmd_password(paths: &Paths, action: PasswordAction) -> Result<()> {
    let guard = credential_guard(paths);

    let result = match action {
        PasswordAction::Set => {
            if guard.has_credential() {
                bail!("A password is already set. Use 'focusguard password change'.");
            }
            guard.set_credential(&prompt_new_password()?)
        }
        PasswordAction::Change => {
            if !guard.has_credential() {
                bail!("No password set yet. Use 'focusguard password set'.");
            }
            guard
                .verify(&prompt("Current password: ")?)
                .map_err(auth_failure)?;
            guard.set_credential(&prompt_new_password()?)
        }
        PasswordAction::Reset { confirm } => {
            if !confirm {
                bail!("This removes the password and any lockout. Re-run with --confirm.");
            }
            if session_store(paths)?.open_session()?.is_some() {
                bail!("A focus session is open. Finish or interrupt it before resetting the password.");
            }
            guard.reset()
        }
        PasswordAction::Status => {
            if !guard.has_credential() {
                println!("No password set");
            } else if guard.is_locked_out() {
                println!(
                    "Password set, {} for {}",
                    color(RED, "locked"),
                    format::countdown(guard.remaining_lockout_seconds())
                );
            } else {
                println!("Password set");
            }
            return Ok(());
        }
    };

    result.map_err(auth_failure)?;
    println!("{} Done", color(GREEN, "[ok]"));
    Ok(())
}

fn cmd_check_access(paths: &Paths, config: &Config) -> Result<()> {
    let enforcement = enforcement(paths, config);
    if enforcement.has_write_capability() {
        println!(
            "{} {} is writable. Sites can be blocked.",
            color(GREEN, "[ok]"),
            config.hosts_file.display()
        );
    } else {
        let user = std::env::var("USER").unwrap_or_else(|_| "youruser".to_string());
        println!(
            "{} {} is not writable.",
            color(RED, "[error]"),
            config.hosts_file.display()
        );
        println!();
        println!("Run 'sudo visudo' and add:");
        println!("  {} ALL=(ALL) NOPASSWD: /bin/cp, /bin/mv, /usr/bin/test", user);
    }
    Ok(())
}

fn cmd_restore_hosts(paths: &Paths, config: &Config) -> Result<()> {
    if let Some(open) = session_store(paths)?.open_session()? {
        bail!(
            "Session {} is still open. Resume or interrupt it first.",
            open.id
        );
    }

    let enforcement = enforcement(paths, config);
    let had_backup = enforcement.backup_file().is_file();
    enforcement.restore_from_backup()?;

    if had_backup {
        println!("{} Restored {} from backup", color(GREEN, "[ok]"), config.hosts_file.display());
    } else {
        println!(
            "{} No backup found; removed blocking entries only",
            color(YELLOW, "[warn]")
        );
    }
    Ok(())
}
