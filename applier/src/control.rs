//! Firewall control interface
//!
//! The kernel filter table is reached only through [`FirewallControl`], so
//! ordered application can run against an in-memory fake in tests. The
//! production implementation shells out to the iptables tool family.

use std::io::Write;
use std::process::{Command, Stdio};
use tracing::debug;

use crate::config::ApplyConfig;
use crate::error::ControlError;
use crate::rules::{Chain, Policy, Rule};

pub const FILTER: &str = "filter";

/// Capability over the live packet-filter state
pub trait FirewallControl {
    /// Remove every rule from all chains of `table`. Policies are untouched.
    fn flush(&mut self, table: &str) -> Result<(), ControlError>;

    fn append(&mut self, table: &str, rule: &Rule) -> Result<(), ControlError>;

    fn set_policy(&mut self, table: &str, chain: Chain, policy: Policy)
        -> Result<(), ControlError>;

    /// Human-readable listing with packet and byte counters
    fn list(&mut self, table: &str) -> Result<String, ControlError>;

    /// Replace the whole table from an iptables-restore payload in one commit
    fn restore(&mut self, payload: &str) -> Result<(), ControlError>;

    /// Dump `table` in iptables-save format
    fn save(&mut self, table: &str) -> Result<String, ControlError>;
}

/// [`FirewallControl`] backed by the `iptables`, `iptables-restore` and
/// `iptables-save` binaries
pub struct IptablesCli {
    iptables: String,
    iptables_restore: String,
    iptables_save: String,
}

impl IptablesCli {
    pub fn new(config: &ApplyConfig) -> Self {
        Self {
            iptables: config.iptables.clone(),
            iptables_restore: config.iptables_restore.clone(),
            iptables_save: config.iptables_save.clone(),
        }
    }

    fn run(&self, program: &str, args: &[String], stdin: Option<&str>) -> Result<String, ControlError> {
        let command = format!("{} {}", program, args.join(" "));
        debug!("exec: {command}");

        let mut child = Command::new(program)
            .args(args)
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| ControlError::Spawn {
                program: program.to_string(),
                source,
            })?;

        // A child that exits early breaks the pipe; its exit status and stderr
        // say why, so always reap it before reporting the write error.
        let written = match (stdin, child.stdin.take()) {
            (Some(input), Some(mut pipe)) => pipe.write_all(input.as_bytes()),
            _ => Ok(()),
        };

        let output = child.wait_with_output().map_err(|source| ControlError::Spawn {
            program: program.to_string(),
            source,
        })?;

        if !output.status.success() {
            return Err(ControlError::Failed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        written.map_err(|source| ControlError::Spawn {
            program: program.to_string(),
            source,
        })?;

        String::from_utf8(output.stdout).map_err(|_| ControlError::Utf8 { command })
    }

    fn iptables(&self, table: &str, args: Vec<String>) -> Result<String, ControlError> {
        let mut full = vec!["-t".to_string(), table.to_string()];
        full.extend(args);
        self.run(&self.iptables, &full, None)
    }
}

impl FirewallControl for IptablesCli {
    fn flush(&mut self, table: &str) -> Result<(), ControlError> {
        self.iptables(table, vec!["-F".into()]).map(|_| ())
    }

    fn append(&mut self, table: &str, rule: &Rule) -> Result<(), ControlError> {
        self.iptables(table, rule.append_args()).map(|_| ())
    }

    fn set_policy(
        &mut self,
        table: &str,
        chain: Chain,
        policy: Policy,
    ) -> Result<(), ControlError> {
        self.iptables(
            table,
            vec!["-P".into(), chain.as_str().into(), policy.as_str().into()],
        )
        .map(|_| ())
    }

    fn list(&mut self, table: &str) -> Result<String, ControlError> {
        self.iptables(table, vec!["-L".into(), "-n".into(), "-v".into()])
    }

    fn restore(&mut self, payload: &str) -> Result<(), ControlError> {
        self.run(&self.iptables_restore, &[], Some(payload)).map(|_| ())
    }

    fn save(&mut self, table: &str) -> Result<String, ControlError> {
        self.run(&self.iptables_save, &["-t".to_string(), table.to_string()], None)
    }
}
