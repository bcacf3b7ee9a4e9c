//! Abstraction over the kernel packet-filter tables and named IP sets.
//!
//! Every mutation the daemon performs goes through the [`Firewall`] trait so
//! the reconciliation logic can be exercised against an in-memory model
//! without root. The live backend drives iptables and ipset(8).

use std::fmt;
use std::net::IpAddr;

use thiserror::Error;

mod iptables;
mod memory;

pub use iptables::IptablesDriver;
pub use memory::MemoryDriver;

#[derive(Debug, Error)]
pub enum FirewallError {
    // Structural: the backend could not be brought up at all. The daemon
    // exits on this one; everything else is logged and retried next tick.
    #[error("couldn't initialize packet filter backend: {0}")]
    Init(String),

    #[error("{op} failed in {table}/{chain}: {detail}")]
    Rule {
        op: &'static str,
        table: String,
        chain: String,
        detail: String,
    },

    #[error("ipset {op} {set} failed: {detail}")]
    Set {
        op: &'static str,
        set: String,
        detail: String,
    },
}

pub type FwResult<T> = Result<T, FirewallError>;

/// Terminal action of a rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// Jump to a chain or builtin target (ACCEPT, DROP, operator-supplied).
    Jump(String),
    /// MARK --set-mark <fwmark>.
    Mark(u32),
}

/// One iptables rule as a predicate-and-target tuple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleSpec {
    /// Restrict to UDP when set.
    pub udp: bool,
    /// Destination port match.
    pub dport: Option<u16>,
    /// `-m set --match-set <name> src` clause.
    pub match_set: Option<String>,
    pub target: Target,
}

impl RuleSpec {
    pub fn jump(chain: impl Into<String>) -> Self {
        Self {
            udp: false,
            dport: None,
            match_set: None,
            target: Target::Jump(chain.into()),
        }
    }

    pub fn udp_jump(chain: impl Into<String>) -> Self {
        Self {
            udp: true,
            dport: None,
            match_set: None,
            target: Target::Jump(chain.into()),
        }
    }

    pub fn udp_dport_jump(dport: u16, chain: impl Into<String>) -> Self {
        Self {
            udp: true,
            dport: Some(dport),
            match_set: None,
            target: Target::Jump(chain.into()),
        }
    }

    pub fn mark_from_set(set: impl Into<String>, fwmark: u32) -> Self {
        Self {
            udp: false,
            dport: None,
            match_set: Some(set.into()),
            target: Target::Mark(fwmark),
        }
    }

    /// Render to the argument form the iptables binary expects.
    pub fn render(&self) -> String {
        let mut parts: Vec<String> = Vec::new();
        if self.udp {
            parts.push("-p udp".to_string());
        }
        if let Some(port) = self.dport {
            parts.push(format!("--dport {port}"));
        }
        if let Some(set) = &self.match_set {
            parts.push(format!("-m set --match-set {set} src"));
        }
        match &self.target {
            Target::Jump(chain) => parts.push(format!("-j {chain}")),
            Target::Mark(mark) => parts.push(format!("-j MARK --set-mark {mark}")),
        }
        parts.join(" ")
    }
}

impl fmt::Display for RuleSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Capability set over the packet-filter and named-set subsystems.
///
/// All operations are idempotent against current kernel state unless noted;
/// deletion-style calls tolerate absence.
pub trait Firewall: Send {
    /// Create `chain` in `table` if absent. When `default_target` is given,
    /// append a terminal jump to it unless one is already present.
    fn ensure_chain(&self, table: &str, chain: &str, default_target: Option<&str>) -> FwResult<()>;

    /// Flush and remove `chain`; absence is not an error.
    fn clear_and_delete_chain(&self, table: &str, chain: &str) -> FwResult<()>;

    /// Remove `chain` only if it holds no rules; absence is not an error.
    fn delete_chain_if_empty(&self, table: &str, chain: &str) -> FwResult<()>;

    /// Insert `rule` at 1-based `position`, unless already present anywhere
    /// in the chain.
    fn insert_rule(&self, table: &str, chain: &str, position: u32, rule: &RuleSpec) -> FwResult<()>;

    /// Append `rule` unless already present.
    fn append_unique(&self, table: &str, chain: &str, rule: &RuleSpec) -> FwResult<()>;

    /// Delete `rule`; absence is not an error.
    fn delete_rule(&self, table: &str, chain: &str, rule: &RuleSpec) -> FwResult<()>;

    fn ensure_set(&self, name: &str) -> FwResult<()>;
    fn flush_set(&self, name: &str) -> FwResult<()>;
    fn destroy_set(&self, name: &str) -> FwResult<()>;
    fn set_add(&self, name: &str, addr: IpAddr) -> FwResult<()>;
    fn set_del(&self, name: &str, addr: IpAddr) -> FwResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rule_rendering() {
        assert_eq!(
            RuleSpec::udp_dport_jump(8003, "solana-tpu").render(),
            "-p udp --dport 8003 -j solana-tpu"
        );
        assert_eq!(
            RuleSpec::mark_from_set("gold", 10).render(),
            "-m set --match-set gold src -j MARK --set-mark 10"
        );
        assert_eq!(RuleSpec::jump("solana-tpu-custom").render(), "-j solana-tpu-custom");
        assert_eq!(RuleSpec::udp_jump("solana-nodes").render(), "-p udp -j solana-nodes");
    }
}
