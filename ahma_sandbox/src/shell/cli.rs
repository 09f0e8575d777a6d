//! # Ahma Sandbox CLI
//!
//! Argument parsing, policy resolution and dispatch to the
//! [`SandboxManager`].

use crate::{
    config::{self, ResolvedPolicy},
    sandbox::{self, SandboxManager},
    utils::logging::init_logging,
};
use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;

/// Run a command inside a macOS Seatbelt sandbox with filesystem rules and
/// domain-filtered network access.
#[derive(Parser, Debug, Clone)]
#[command(
    author,
    version,
    about,
    long_about = "ahma_sandbox confines a command with sandbox-exec.

Filesystem access is controlled by denyRead/allowWrite/denyWrite/allowUnlink
lists (paths or globs). Network access is blocked unless domains are allowed,
in which case traffic is routed through local HTTP and SOCKS5 proxies that
filter by domain. Blocked operations are recorded in deny.log.

Examples:
  ahma_sandbox -- npm install
  ahma_sandbox --settings '{\"network\":{\"allowedDomains\":[\"github.com\"]}}' -- git fetch
  ahma_sandbox --dry-run -- cat ~/.ssh/id_rsa"
)]
pub struct Cli {
    /// Settings file (defaults to settings.json in the platform config dir)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Override applied on top of the settings: a JSON file or inline JSON
    #[arg(long)]
    pub settings: Option<String>,

    /// Print the generated profile and environment without running anything
    #[arg(long)]
    pub dry_run: bool,

    /// Show violations as they happen and enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log to a file in the cache dir instead of stderr
    #[arg(long)]
    pub log_to_file: bool,

    /// Do not add package-manager cache dirs to the writable paths
    #[arg(long)]
    pub no_package_managers: bool,

    /// Command to run inside the sandbox
    #[arg(required = true, trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<String>,
}

/// Parse arguments, run the command and return the exit code to use.
pub async fn run() -> Result<i32> {
    let cli = Cli::parse();
    init_logging(if cli.verbose { "debug" } else { "warn" }, cli.log_to_file)?;
    execute(cli).await
}

pub async fn execute(cli: Cli) -> Result<i32> {
    let policy = resolve_policy(&cli)?;
    let manager = SandboxManager::new(policy).verbose(cli.verbose);

    if cli.dry_run {
        let report = manager.dry_run(&cli.command).await?;
        println!("{report}");
        return Ok(0);
    }

    sandbox::check_sandbox_prerequisites().context("cannot confine the command")?;
    let outcome = manager.run(&cli.command).await?;
    if outcome.violations.logged > 0 {
        tracing::info!(
            count = outcome.violations.logged,
            "sandbox violations recorded"
        );
    }
    Ok(outcome.exit_code)
}

/// Defaults, then the settings file, then the `--settings` override.
pub fn resolve_policy(cli: &Cli) -> Result<ResolvedPolicy> {
    let mut policy = config::load(cli.config.as_deref()).context("failed to load settings")?;

    if let Some(settings) = &cli.settings {
        let layer = config::parse_override(settings).context("failed to read --settings")?;
        policy = config::apply_layer(&policy, layer).context("failed to apply --settings")?;
    }
    if cli.no_package_managers {
        policy.detect_package_managers = false;
    }

    Ok(policy)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::DefaultPolicy;

    #[test]
    fn command_keeps_its_own_flags() {
        let cli = Cli::try_parse_from([
            "ahma_sandbox",
            "--dry-run",
            "--",
            "ls",
            "-la",
            "--color",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.command, vec!["ls", "-la", "--color"]);
    }

    #[test]
    fn command_is_required() {
        assert!(Cli::try_parse_from(["ahma_sandbox", "--dry-run"]).is_err());
    }

    #[test]
    fn inline_settings_layer_over_the_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("settings.json");
        std::fs::write(
            &file,
            r#"{"network":{"defaultPolicy":"allow","deniedDomains":["evil.com"]}}"#,
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "ahma_sandbox".to_string(),
            "--config".to_string(),
            file.display().to_string(),
            "--settings".to_string(),
            r#"{"network":{"allowedDomains":["github.com"]}}"#.to_string(),
            "--no-package-managers".to_string(),
            "true".to_string(),
        ])
        .unwrap();

        let policy = resolve_policy(&cli).unwrap();
        assert_eq!(policy.network.default_policy, DefaultPolicy::Allow);
        assert_eq!(policy.network.denied_domains, vec!["evil.com"]);
        assert_eq!(policy.network.allowed_domains, vec!["github.com"]);
        assert!(!policy.detect_package_managers);
    }

    #[test]
    fn unreadable_config_names_the_phase() {
        let cli = Cli::try_parse_from([
            "ahma_sandbox",
            "--config",
            "/nonexistent/settings.json",
            "true",
        ])
        .unwrap();
        let err = resolve_policy(&cli).unwrap_err();
        assert!(format!("{err:#}").contains("failed to load settings"));
    }
}
