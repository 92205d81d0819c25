//! Ordered application plan
//!
//! Turns a [`PolicyConfig`] into the exact sequence of control-interface
//! steps. Order is load-bearing: INPUT and FORWARD only switch to DROP once
//! the rate limiter, the INVALID/fragment drops and every trusted-host accept
//! rule are in place, so a remote operator's session survives the switch.

use std::fmt::Write;

use crate::config::PolicyConfig;
use crate::control::FILTER;
use crate::rules::{Action, Chain, ConnState, Match, Policy, Protocol, Recent, Rule};

/// One instruction to the firewall control interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    Flush,
    Append(Rule),
    SetPolicy(Chain, Policy),
    List,
}

impl Step {
    /// Arguments for a standalone iptables invocation
    pub fn iptables_args(&self) -> Vec<String> {
        let mut args = vec!["-t".to_string(), FILTER.to_string()];
        match self {
            Step::Flush => args.push("-F".into()),
            Step::Append(rule) => args.extend(rule.append_args()),
            Step::SetPolicy(chain, policy) => {
                args.extend(["-P".into(), chain.to_string(), policy.to_string()])
            }
            Step::List => args.extend(["-L".into(), "-n".into(), "-v".into()]),
        }
        args
    }

    pub fn describe(&self) -> String {
        self.iptables_args().join(" ")
    }
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub fn build(config: &PolicyConfig) -> Self {
        let iface = &config.network.interface;
        let ssh_port = config.network.ssh_port;
        let db_port = config.network.database_port;
        let mut steps = Vec::new();

        // Open policies first so the flush cannot strand an existing session
        // when a previous run already left INPUT at DROP.
        for chain in Chain::ALL {
            steps.push(Step::SetPolicy(chain, Policy::Accept));
        }
        steps.push(Step::Flush);

        let limit = &config.ssh_rate_limit;
        if limit.enabled {
            let new_ssh = || {
                Rule::new(Chain::Input)
                    .with(Match::InInterface(iface.clone()))
                    .with(Match::Protocol(Protocol::Tcp))
                    .with(Match::DestPort(ssh_port))
                    .with(Match::State(vec![ConnState::New]))
            };
            steps.push(Step::Append(new_ssh().with(Match::Recent(Recent::Set {
                name: limit.list_name.clone(),
            }))));
            // The set rule above already counted the current packet, so the
            // update matches on the attempt that exceeds max_attempts.
            // validate() keeps this under MAX_RECENT_HITCOUNT; saturate so an
            // unvalidated config can never wrap to a hitcount of 0.
            steps.push(Step::Append(
                new_ssh()
                    .with(Match::Recent(Recent::Update {
                        name: limit.list_name.clone(),
                        seconds: limit.window_secs,
                        hitcount: limit.max_attempts.saturating_add(1),
                    }))
                    .jump(limit.action),
            ));
        }

        steps.push(Step::Append(
            Rule::new(Chain::Input)
                .with(Match::State(vec![ConnState::Invalid]))
                .jump(Action::Drop),
        ));
        steps.push(Step::Append(
            Rule::new(Chain::Input).with(Match::Fragment).jump(Action::Drop),
        ));

        for host in &config.trusted_hosts {
            for (service, port) in [("database", db_port), ("ssh", ssh_port)] {
                steps.push(Step::Append(
                    Rule::new(Chain::Input)
                        .with(Match::InInterface(iface.clone()))
                        .with(Match::Protocol(Protocol::Tcp))
                        .with(Match::Source(host.address))
                        .with(Match::DestPort(port))
                        .with(Match::Comment(format!("dbguard:{}:{}", host.name, service)))
                        .jump(Action::Accept),
                ));
            }
        }

        steps.push(Step::SetPolicy(Chain::Input, Policy::Drop));
        steps.push(Step::SetPolicy(Chain::Forward, Policy::Drop));
        steps.push(Step::SetPolicy(Chain::Output, Policy::Accept));

        steps.push(Step::Append(
            Rule::new(Chain::Input)
                .with(Match::InInterface("lo".into()))
                .jump(Action::Accept),
        ));
        steps.push(Step::Append(
            Rule::new(Chain::Input)
                .with(Match::State(vec![ConnState::Established, ConnState::Related]))
                .jump(Action::Accept),
        ));

        steps.push(Step::List);

        Self { steps }
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    pub fn rules(&self) -> impl Iterator<Item = &Rule> {
        self.steps.iter().filter_map(|s| match s {
            Step::Append(rule) => Some(rule),
            _ => None,
        })
    }

    /// Final policy per chain once every step has run
    pub fn final_policy(&self, chain: Chain) -> Option<Policy> {
        self.steps.iter().rev().find_map(|s| match s {
            Step::SetPolicy(c, p) if *c == chain => Some(*p),
            _ => None,
        })
    }

    /// Shell script equivalent of sequential application (dry run)
    pub fn to_shell(&self, iptables: &str) -> String {
        let mut out = String::from("#!/bin/sh\n# dbguard plan, applied in order\n");
        for step in &self.steps {
            let _ = writeln!(out, "{} {}", iptables, step.describe());
        }
        out
    }

    /// iptables-restore payload replacing the filter table in one commit.
    ///
    /// The restore itself flushes the table, and policies are declared in the
    /// chain header, so the lockout ordering holds within the commit.
    pub fn to_restore(&self) -> String {
        let mut out = format!(
            "# Generated by dbguard v{}\n*{}\n",
            env!("CARGO_PKG_VERSION"),
            FILTER
        );
        for chain in Chain::ALL {
            let policy = self.final_policy(chain).unwrap_or(Policy::Accept);
            let _ = writeln!(out, ":{} {} [0:0]", chain, policy);
        }
        for rule in self.rules() {
            let _ = writeln!(out, "{rule}");
        }
        out.push_str("COMMIT\n");
        out
    }
}
