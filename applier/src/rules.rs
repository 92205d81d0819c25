//! Firewall rule model: chains, match predicates and actions
//!
//! Rules describe what to append to the kernel filter table and render to
//! iptables argument vectors. Matching itself is the kernel's job; nothing
//! here evaluates packets.

use serde::Deserialize;
use std::fmt;
use std::net::Ipv4Addr;

/// Built-in filter table chain
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Chain {
    Input,
    Forward,
    Output,
}

impl Chain {
    pub const ALL: [Chain; 3] = [Chain::Input, Chain::Forward, Chain::Output];

    pub fn as_str(self) -> &'static str {
        match self {
            Chain::Input => "INPUT",
            Chain::Forward => "FORWARD",
            Chain::Output => "OUTPUT",
        }
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rule target
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Accept,
    Drop,
    /// Refuse with an ICMP error instead of silently discarding
    Reject,
}

impl Action {
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Accept => "ACCEPT",
            Action::Drop => "DROP",
            Action::Reject => "REJECT",
        }
    }
}

/// Default chain policy. Built-in chains only take ACCEPT or DROP.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    Accept,
    Drop,
}

impl Policy {
    pub fn as_str(self) -> &'static str {
        match self {
            Policy::Accept => "ACCEPT",
            Policy::Drop => "DROP",
        }
    }
}

impl fmt::Display for Policy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
}

impl Protocol {
    pub fn as_str(self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
        }
    }
}

/// Connection tracking state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    New,
    Established,
    Related,
    Invalid,
}

impl ConnState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnState::New => "NEW",
            ConnState::Established => "ESTABLISHED",
            ConnState::Related => "RELATED",
            ConnState::Invalid => "INVALID",
        }
    }
}

/// `recent` match operation over a named per-source address list
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recent {
    /// Record the source address of every matching packet.
    Set { name: String },
    /// Refresh the entry and match once it holds `hitcount` hits inside the window.
    Update {
        name: String,
        seconds: u32,
        hitcount: u32,
    },
}

/// A single match predicate
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Match {
    InInterface(String),
    Protocol(Protocol),
    Source(Ipv4Addr),
    /// Requires a preceding `Protocol` match.
    DestPort(u16),
    State(Vec<ConnState>),
    Fragment,
    Recent(Recent),
    Comment(String),
}

impl Match {
    fn push_args(&self, args: &mut Vec<String>) {
        match self {
            Match::InInterface(name) => {
                args.push("-i".into());
                args.push(name.clone());
            }
            Match::Protocol(proto) => {
                args.push("-p".into());
                args.push(proto.as_str().into());
            }
            Match::Source(addr) => {
                args.push("-s".into());
                args.push(addr.to_string());
            }
            Match::DestPort(port) => {
                args.push("--dport".into());
                args.push(port.to_string());
            }
            Match::State(states) => {
                let joined: Vec<&str> = states.iter().map(|s| s.as_str()).collect();
                args.extend(["-m".into(), "conntrack".into(), "--ctstate".into()]);
                args.push(joined.join(","));
            }
            Match::Fragment => args.push("-f".into()),
            Match::Recent(Recent::Set { name }) => {
                args.extend(["-m".into(), "recent".into(), "--set".into()]);
                args.extend(["--name".into(), name.clone()]);
            }
            Match::Recent(Recent::Update {
                name,
                seconds,
                hitcount,
            }) => {
                args.extend(["-m".into(), "recent".into(), "--update".into()]);
                args.extend(["--seconds".into(), seconds.to_string()]);
                args.extend(["--hitcount".into(), hitcount.to_string()]);
                args.extend(["--name".into(), name.clone()]);
            }
            Match::Comment(text) => {
                args.extend(["-m".into(), "comment".into(), "--comment".into()]);
                args.push(text.clone());
            }
        }
    }
}

/// One rule appended to a chain. A rule without an action only updates
/// match state (e.g. a `recent --set`) and lets the packet continue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub chain: Chain,
    pub matches: Vec<Match>,
    pub action: Option<Action>,
}

impl Rule {
    pub fn new(chain: Chain) -> Self {
        Self {
            chain,
            matches: Vec::new(),
            action: None,
        }
    }

    pub fn with(mut self, m: Match) -> Self {
        self.matches.push(m);
        self
    }

    pub fn jump(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    /// Match and target arguments, without the chain selector
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        for m in &self.matches {
            m.push_args(&mut args);
        }
        if let Some(action) = self.action {
            args.push("-j".into());
            args.push(action.as_str().into());
        }
        args
    }

    /// `-A CHAIN ...` as accepted by both iptables and iptables-restore
    pub fn append_args(&self) -> Vec<String> {
        let mut args = vec!["-A".to_string(), self.chain.as_str().to_string()];
        args.extend(self.to_args());
        args
    }
}

#[cfg(test)]
impl Rule {
    pub fn has(&self, m: &Match) -> bool {
        self.matches.contains(m)
    }

    pub fn source(&self) -> Option<Ipv4Addr> {
        self.matches.iter().find_map(|m| match m {
            Match::Source(addr) => Some(*addr),
            _ => None,
        })
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.append_args().join(" "))
    }
}
