//! dbguard: host firewall policy applier for database servers
//!
//! Responsibilities:
//! - Read the policy (trusted hosts, interface, ports) from /etc/dbguard/policy.toml
//! - Build the ordered rule plan that never strands a remote operator
//! - Apply it through iptables, step by step or as one atomic restore
//! - Print the resulting rule listing with counters
//! - Optionally persist the active rule set for restore on boot

use anyhow::{Context, Result};
use clap::{ArgAction, Parser};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

mod applier;
mod config;
mod control;
mod error;
mod persist;
mod plan;
mod rules;
#[cfg(test)]
mod testing;

use applier::PolicyApplier;
use config::ApplyMode;
use control::IptablesCli;
use plan::Plan;

/// Exit status when the policy was applied but some steps failed
const EXIT_PARTIAL: u8 = 2;

#[derive(Parser, Debug)]
#[command(name = "dbguard", version, about = "Apply the database server firewall policy")]
struct Cli {
    /// Policy file
    #[arg(long, env = "DBGUARD_CONFIG", default_value = config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print the commands that would run and exit without touching the firewall
    #[arg(long)]
    dry_run: bool,

    /// Override the configured apply mode
    #[arg(long, value_enum)]
    mode: Option<ApplyMode>,

    /// Save the active rule set after applying, regardless of config
    #[arg(long)]
    save: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, env = "DBGUARD_LOG", default_value = "info")]
    log_level: String,

    /// Increase verbosity (-v = debug, -vv = trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Emit logs as JSON lines
    #[arg(long)]
    log_json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = init_logging(&cli) {
        eprintln!("dbguard: {e:#}");
        return ExitCode::FAILURE;
    }

    match run(&cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    info!("dbguard v{}", env!("CARGO_PKG_VERSION"));

    // Phase 1: configuration
    let config = config::load_config(&cli.config)?;
    config
        .validate()
        .with_context(|| format!("Invalid policy in {}", cli.config.display()))?;
    let mode = cli.mode.unwrap_or(config.apply.mode);
    info!(
        "Policy loaded: interface={}, {} trusted hosts, mode={:?}",
        config.network.interface,
        config.trusted_hosts.len(),
        mode
    );

    // Phase 2: plan
    let plan = Plan::build(&config);

    if cli.dry_run {
        match mode {
            ApplyMode::Sequential => print!("{}", plan.to_shell(&config.apply.iptables)),
            ApplyMode::Atomic => print!("{}", plan.to_restore()),
        }
        return Ok(ExitCode::SUCCESS);
    }

    // Phase 3: apply
    check_privileges();
    let mut control = IptablesCli::new(&config.apply);
    let report = PolicyApplier::new(&mut control)
        .apply(&plan, mode)
        .context("Atomic restore failed; the filter table was left unchanged")?;

    if let Some(listing) = &report.listing {
        print!("{listing}");
    }

    for failure in report.failures() {
        warn!(
            "Not applied: {} ({})",
            failure.step.describe(),
            failure.error.as_deref().unwrap_or("unknown error")
        );
    }
    let failed = report.failed_count();

    // Phase 4: persistence
    if cli.save || config.persistence.enabled {
        if failed > 0 {
            warn!("Skipping persistence: {failed} steps failed and the active rule set is incomplete");
        } else {
            persist::save_rules(&mut control, &config.persistence.path)?;
        }
    } else {
        info!("Rule set not persisted; it will not survive a reboot");
    }

    if failed > 0 {
        warn!(
            "Policy applied at {} with {failed} failed steps",
            report.applied_at.to_rfc3339()
        );
        return Ok(ExitCode::from(EXIT_PARTIAL));
    }

    info!(
        "Policy applied at {} ({:?} mode, {} steps)",
        report.applied_at.to_rfc3339(),
        report.mode,
        report.applied_count()
    );
    Ok(ExitCode::SUCCESS)
}

fn init_logging(cli: &Cli) -> Result<()> {
    let level = match cli.verbose {
        0 => cli.log_level.as_str(),
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Invalid log level")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true);

    if cli.log_json {
        tracing::subscriber::set_global_default(builder.json().finish())
            .context("Failed to set tracing subscriber")?;
    } else {
        tracing::subscriber::set_global_default(builder.compact().finish())
            .context("Failed to set tracing subscriber")?;
    }
    Ok(())
}

/// iptables needs CAP_NET_ADMIN; without root every command will fail on
/// its own, which is reported per step rather than aborting here
fn check_privileges() {
    if !nix::unistd::Uid::effective().is_root() {
        warn!("Not running as root; iptables commands are likely to be refused");
    }
}
