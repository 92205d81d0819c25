//! Test doubles: an in-memory filter table and a sample policy

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;

use crate::config::{PolicyConfig, TrustedHost};
use crate::control::FirewallControl;
use crate::error::ControlError;
use crate::rules::{Chain, Policy, Rule};

/// The four placeholder hosts shipped in dbguard.toml
pub fn sample_config() -> PolicyConfig {
    let hosts = [
        ("HOME", [192, 0, 2, 10]),
        ("WEB", [192, 0, 2, 20]),
        ("PRIVATE", [198, 51, 100, 30]),
        ("PUBLIC", [203, 0, 113, 40]),
    ];
    PolicyConfig {
        trusted_hosts: hosts
            .iter()
            .map(|(name, addr)| TrustedHost {
                name: name.to_string(),
                address: Ipv4Addr::from(*addr),
            })
            .collect(),
        ..Default::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Flush,
    Append(String),
    SetPolicy(Chain, Policy),
    List,
    Restore,
    Save,
}

/// An established inbound session the fake checks after every call
#[derive(Debug, Clone)]
struct Session {
    source: Ipv4Addr,
    port: u16,
}

/// Records calls and keeps filter-table state as rendered `-A` lines.
/// Rules and policies are stored, never evaluated against packets.
#[derive(Debug)]
pub struct FakeFirewall {
    pub policies: BTreeMap<Chain, Policy>,
    pub rules: Vec<String>,
    pub calls: Vec<Call>,
    failing: HashSet<usize>,
    session: Option<Session>,
    pub session_cut: bool,
}

impl Default for FakeFirewall {
    fn default() -> Self {
        Self {
            policies: Chain::ALL.iter().map(|c| (*c, Policy::Accept)).collect(),
            rules: Vec::new(),
            calls: Vec::new(),
            failing: HashSet::new(),
            session: None,
            session_cut: false,
        }
    }
}

fn chain_named(name: &str) -> Chain {
    Chain::ALL
        .into_iter()
        .find(|c| c.as_str() == name)
        .unwrap_or_else(|| panic!("unknown chain {name}"))
}

fn policy_named(name: &str) -> Policy {
    match name {
        "ACCEPT" => Policy::Accept,
        "DROP" => Policy::Drop,
        other => panic!("unknown policy {other}"),
    }
}

impl FakeFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the call with this zero-based index fail
    pub fn fail_call(mut self, index: usize) -> Self {
        self.failing.insert(index);
        self
    }

    /// Track an operator session that must stay reachable throughout
    pub fn with_session(mut self, source: Ipv4Addr, port: u16) -> Self {
        self.session = Some(Session { source, port });
        self
    }

    pub fn policy(&self, chain: Chain) -> Policy {
        self.policies[&chain]
    }

    pub fn has_rule(&self, line: &str) -> bool {
        self.rules.iter().any(|r| r == line)
    }

    fn record(&mut self, call: Call) -> Result<(), ControlError> {
        let index = self.calls.len();
        let command = format!("{call:?}");
        self.calls.push(call);
        if self.failing.contains(&index) {
            return Err(ControlError::Failed {
                command,
                status: "exit status: 1".into(),
                stderr: "iptables: injected failure".into(),
            });
        }
        Ok(())
    }

    fn check_session(&mut self) {
        let Some(session) = &self.session else { return };
        if self.policy(Chain::Input) == Policy::Accept {
            return;
        }
        let source = format!("-s {} ", session.source);
        let port = format!("--dport {} ", session.port);
        let admitted = self.rules.iter().any(|r| {
            r.starts_with("-A INPUT ")
                && r.ends_with("-j ACCEPT")
                && ((r.contains(&source) && r.contains(&port))
                    || r.contains("--ctstate ESTABLISHED,RELATED"))
        });
        if !admitted {
            self.session_cut = true;
        }
    }

    fn render(&self) -> String {
        let mut out = String::new();
        for (chain, policy) in &self.policies {
            out.push_str(&format!("-P {chain} {policy}\n"));
        }
        for rule in &self.rules {
            out.push_str(rule);
            out.push('\n');
        }
        out
    }
}

impl FirewallControl for FakeFirewall {
    fn flush(&mut self, _table: &str) -> Result<(), ControlError> {
        self.record(Call::Flush)?;
        self.rules.clear();
        self.check_session();
        Ok(())
    }

    fn append(&mut self, _table: &str, rule: &Rule) -> Result<(), ControlError> {
        let line = rule.to_string();
        self.record(Call::Append(line.clone()))?;
        self.rules.push(line);
        self.check_session();
        Ok(())
    }

    fn set_policy(
        &mut self,
        _table: &str,
        chain: Chain,
        policy: Policy,
    ) -> Result<(), ControlError> {
        self.record(Call::SetPolicy(chain, policy))?;
        self.policies.insert(chain, policy);
        self.check_session();
        Ok(())
    }

    fn list(&mut self, _table: &str) -> Result<String, ControlError> {
        self.record(Call::List)?;
        Ok(self.render())
    }

    fn restore(&mut self, payload: &str) -> Result<(), ControlError> {
        self.record(Call::Restore)?;
        let mut policies = self.policies.clone();
        let mut rules = Vec::new();
        for line in payload.lines() {
            if let Some(header) = line.strip_prefix(':') {
                let mut parts = header.split_whitespace();
                let chain = chain_named(parts.next().unwrap_or_default());
                let policy = policy_named(parts.next().unwrap_or_default());
                policies.insert(chain, policy);
            } else if line.starts_with("-A ") {
                rules.push(line.to_string());
            }
        }
        // one commit: state swaps in whole
        self.policies = policies;
        self.rules = rules;
        self.check_session();
        Ok(())
    }

    fn save(&mut self, table: &str) -> Result<String, ControlError> {
        self.record(Call::Save)?;
        let mut out = format!("*{table}\n");
        for (chain, policy) in &self.policies {
            out.push_str(&format!(":{chain} {policy} [0:0]\n"));
        }
        for rule in &self.rules {
            out.push_str(rule);
            out.push('\n');
        }
        out.push_str("COMMIT\n");
        Ok(out)
    }
}
