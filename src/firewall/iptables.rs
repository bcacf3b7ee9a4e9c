//! Live backend: iptables via the userspace wrapper crate, named sets via
//! the ipset(8) binary.
//!
//! Set operations pass `-exist` so creating an existing set or re-adding a
//! member is a no-op; flush/destroy of a missing set is treated as already
//! done. This keeps every operation safe to re-run after a partial failure.

use std::net::IpAddr;
use std::process::Command;

use tracing::debug;

use super::{Firewall, FirewallError, FwResult, RuleSpec};

pub struct IptablesDriver {
    ipt: iptables::IPTables,
}

impl IptablesDriver {
    /// Bring up both backends. Failure here is structural: without iptables
    /// and ipset there is nothing for the daemon to do.
    pub fn new() -> FwResult<Self> {
        let ipt = iptables::new(false).map_err(|e| FirewallError::Init(e.to_string()))?;

        let probe = Command::new("ipset")
            .arg("version")
            .output()
            .map_err(|e| FirewallError::Init(format!("ipset binary unavailable: {e}")))?;
        if !probe.status.success() {
            return Err(FirewallError::Init(format!(
                "ipset version check failed: {}",
                String::from_utf8_lossy(&probe.stderr).trim()
            )));
        }

        Ok(Self { ipt })
    }

    fn rule_err(
        op: &'static str,
        table: &str,
        chain: &str,
        e: Box<dyn std::error::Error>,
    ) -> FirewallError {
        FirewallError::Rule {
            op,
            table: table.to_string(),
            chain: chain.to_string(),
            detail: e.to_string(),
        }
    }

    fn ipset(op: &'static str, set: &str, args: &[&str]) -> FwResult<()> {
        let output = Command::new("ipset").args(args).output().map_err(|e| {
            FirewallError::Set {
                op,
                set: set.to_string(),
                detail: e.to_string(),
            }
        })?;

        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        // Missing sets are fine on the teardown path.
        if stderr.contains("does not exist") {
            debug!(set, op, "ipset target already absent");
            return Ok(());
        }
        Err(FirewallError::Set {
            op,
            set: set.to_string(),
            detail: stderr.trim().to_string(),
        })
    }
}

impl Firewall for IptablesDriver {
    fn ensure_chain(&self, table: &str, chain: &str, default_target: Option<&str>) -> FwResult<()> {
        let exists = self
            .ipt
            .chain_exists(table, chain)
            .map_err(|e| Self::rule_err("chain_exists", table, chain, e))?;
        if !exists {
            self.ipt
                .new_chain(table, chain)
                .map_err(|e| Self::rule_err("new_chain", table, chain, e))?;
        }
        if let Some(target) = default_target {
            self.append_unique(table, chain, &RuleSpec::jump(target))?;
        }
        Ok(())
    }

    fn clear_and_delete_chain(&self, table: &str, chain: &str) -> FwResult<()> {
        let exists = self
            .ipt
            .chain_exists(table, chain)
            .map_err(|e| Self::rule_err("chain_exists", table, chain, e))?;
        if !exists {
            return Ok(());
        }
        self.ipt
            .flush_chain(table, chain)
            .map_err(|e| Self::rule_err("flush_chain", table, chain, e))?;
        self.ipt
            .delete_chain(table, chain)
            .map_err(|e| Self::rule_err("delete_chain", table, chain, e))
    }

    fn delete_chain_if_empty(&self, table: &str, chain: &str) -> FwResult<()> {
        let exists = self
            .ipt
            .chain_exists(table, chain)
            .map_err(|e| Self::rule_err("chain_exists", table, chain, e))?;
        if !exists {
            return Ok(());
        }
        // iptables refuses to delete a nonempty chain, which is exactly the
        // behavior wanted for operator-populated custom chains.
        if let Err(e) = self.ipt.delete_chain(table, chain) {
            debug!(table, chain, error = %e, "left nonempty chain in place");
        }
        Ok(())
    }

    fn insert_rule(&self, table: &str, chain: &str, position: u32, rule: &RuleSpec) -> FwResult<()> {
        let rendered = rule.render();
        let exists = self
            .ipt
            .exists(table, chain, &rendered)
            .map_err(|e| Self::rule_err("exists", table, chain, e))?;
        if exists {
            return Ok(());
        }
        self.ipt
            .insert(table, chain, &rendered, position as i32)
            .map_err(|e| Self::rule_err("insert", table, chain, e))
    }

    fn append_unique(&self, table: &str, chain: &str, rule: &RuleSpec) -> FwResult<()> {
        let rendered = rule.render();
        let exists = self
            .ipt
            .exists(table, chain, &rendered)
            .map_err(|e| Self::rule_err("exists", table, chain, e))?;
        if exists {
            return Ok(());
        }
        self.ipt
            .append(table, chain, &rendered)
            .map_err(|e| Self::rule_err("append", table, chain, e))
    }

    fn delete_rule(&self, table: &str, chain: &str, rule: &RuleSpec) -> FwResult<()> {
        let rendered = rule.render();
        let exists = self
            .ipt
            .exists(table, chain, &rendered)
            .map_err(|e| Self::rule_err("exists", table, chain, e))?;
        if !exists {
            return Ok(());
        }
        self.ipt
            .delete(table, chain, &rendered)
            .map_err(|e| Self::rule_err("delete", table, chain, e))
    }

    fn ensure_set(&self, name: &str) -> FwResult<()> {
        Self::ipset("create", name, &["-exist", "create", name, "hash:ip"])
    }

    fn flush_set(&self, name: &str) -> FwResult<()> {
        Self::ipset("flush", name, &["flush", name])
    }

    fn destroy_set(&self, name: &str) -> FwResult<()> {
        Self::ipset("destroy", name, &["destroy", name])
    }

    fn set_add(&self, name: &str, addr: IpAddr) -> FwResult<()> {
        let addr = addr.to_string();
        Self::ipset("add", name, &["-exist", "add", name, &addr])
    }

    fn set_del(&self, name: &str, addr: IpAddr) -> FwResult<()> {
        let addr = addr.to_string();
        Self::ipset("del", name, &["-exist", "del", name, &addr])
    }
}
