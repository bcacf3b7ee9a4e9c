//! In-memory firewall backend.
//!
//! Models tables of named chains and the named-set store with the same
//! idempotence rules as the live driver, so reconciliation behavior can be
//! asserted in tests without touching the kernel.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Mutex;

use super::{Firewall, FwResult, RuleSpec};

#[derive(Default)]
struct State {
    // table -> chain -> ordered rules
    tables: BTreeMap<String, BTreeMap<String, Vec<RuleSpec>>>,
    sets: BTreeMap<String, BTreeSet<IpAddr>>,
}

#[derive(Default)]
pub struct MemoryDriver {
    state: Mutex<State>,
}

impl MemoryDriver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn has_chain(&self, table: &str, chain: &str) -> bool {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .map_or(false, |chains| chains.contains_key(chain))
    }

    pub fn chain_rules(&self, table: &str, chain: &str) -> Vec<RuleSpec> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .and_then(|chains| chains.get(chain))
            .cloned()
            .unwrap_or_default()
    }

    pub fn chain_names(&self, table: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .tables
            .get(table)
            .map(|chains| chains.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_set(&self, name: &str) -> bool {
        self.state.lock().unwrap().sets.contains_key(name)
    }

    pub fn set_members(&self, name: &str) -> BTreeSet<IpAddr> {
        let state = self.state.lock().unwrap();
        state.sets.get(name).cloned().unwrap_or_default()
    }

    pub fn set_names(&self) -> Vec<String> {
        self.state.lock().unwrap().sets.keys().cloned().collect()
    }

    /// Names of every set currently containing `addr`.
    pub fn sets_containing(&self, addr: IpAddr) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .sets
            .iter()
            .filter(|(_, members)| members.contains(&addr))
            .map(|(name, _)| name.clone())
            .collect()
    }
}

impl Firewall for MemoryDriver {
    fn ensure_chain(&self, table: &str, chain: &str, default_target: Option<&str>) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        let rules = state
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(chain.to_string())
            .or_default();
        if let Some(target) = default_target {
            let rule = RuleSpec::jump(target);
            if !rules.contains(&rule) {
                rules.push(rule);
            }
        }
        Ok(())
    }

    fn clear_and_delete_chain(&self, table: &str, chain: &str) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(chains) = state.tables.get_mut(table) {
            chains.remove(chain);
        }
        Ok(())
    }

    fn delete_chain_if_empty(&self, table: &str, chain: &str) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(chains) = state.tables.get_mut(table) {
            if chains.get(chain).map_or(false, |rules| rules.is_empty()) {
                chains.remove(chain);
            }
        }
        Ok(())
    }

    fn insert_rule(&self, table: &str, chain: &str, position: u32, rule: &RuleSpec) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        let rules = state
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(chain.to_string())
            .or_default();
        if rules.contains(rule) {
            return Ok(());
        }
        let index = (position.saturating_sub(1) as usize).min(rules.len());
        rules.insert(index, rule.clone());
        Ok(())
    }

    fn append_unique(&self, table: &str, chain: &str, rule: &RuleSpec) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        let rules = state
            .tables
            .entry(table.to_string())
            .or_default()
            .entry(chain.to_string())
            .or_default();
        if !rules.contains(rule) {
            rules.push(rule.clone());
        }
        Ok(())
    }

    fn delete_rule(&self, table: &str, chain: &str, rule: &RuleSpec) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(rules) = state
            .tables
            .get_mut(table)
            .and_then(|chains| chains.get_mut(chain))
        {
            rules.retain(|r| r != rule);
        }
        Ok(())
    }

    fn ensure_set(&self, name: &str) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        state.sets.entry(name.to_string()).or_default();
        Ok(())
    }

    fn flush_set(&self, name: &str) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(members) = state.sets.get_mut(name) {
            members.clear();
        }
        Ok(())
    }

    fn destroy_set(&self, name: &str) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        state.sets.remove(name);
        Ok(())
    }

    fn set_add(&self, name: &str, addr: IpAddr) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        state.sets.entry(name.to_string()).or_default().insert(addr);
        Ok(())
    }

    fn set_del(&self, name: &str, addr: IpAddr) -> FwResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(members) = state.sets.get_mut(name) {
            members.remove(&addr);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn append_unique_deduplicates() {
        let fw = MemoryDriver::new();
        let rule = RuleSpec::udp_dport_jump(8003, "solana-tpu");
        fw.append_unique("filter", "INPUT", &rule).unwrap();
        fw.append_unique("filter", "INPUT", &rule).unwrap();
        assert_eq!(fw.chain_rules("filter", "INPUT"), vec![rule]);
    }

    #[test]
    fn insert_lands_at_position_one() {
        let fw = MemoryDriver::new();
        fw.append_unique("filter", "INPUT", &RuleSpec::jump("ACCEPT")).unwrap();
        let first = RuleSpec::udp_dport_jump(8003, "solana-tpu");
        fw.insert_rule("filter", "INPUT", 1, &first).unwrap();
        assert_eq!(fw.chain_rules("filter", "INPUT")[0], first);
    }

    #[test]
    fn delete_tolerates_absence() {
        let fw = MemoryDriver::new();
        let rule = RuleSpec::udp_jump("solana-nodes");
        fw.delete_rule("mangle", "PREROUTING", &rule).unwrap();
        fw.destroy_set("solana-gossip").unwrap();
        fw.set_del("solana-gossip", addr("10.0.0.1")).unwrap();
    }

    #[test]
    fn nonempty_chain_survives_conditional_delete() {
        let fw = MemoryDriver::new();
        fw.ensure_chain("filter", "solana-tpu-custom", None).unwrap();
        fw.append_unique("filter", "solana-tpu-custom", &RuleSpec::jump("DROP"))
            .unwrap();
        fw.delete_chain_if_empty("filter", "solana-tpu-custom").unwrap();
        assert!(fw.has_chain("filter", "solana-tpu-custom"));

        fw.ensure_chain("filter", "solana-tpu-custom-fwd", None).unwrap();
        fw.delete_chain_if_empty("filter", "solana-tpu-custom-fwd").unwrap();
        assert!(!fw.has_chain("filter", "solana-tpu-custom-fwd"));
    }

    #[test]
    fn set_membership_round_trip() {
        let fw = MemoryDriver::new();
        fw.ensure_set("gold").unwrap();
        fw.set_add("gold", addr("10.0.0.1")).unwrap();
        fw.set_add("gold", addr("10.0.0.1")).unwrap();
        assert_eq!(fw.set_members("gold").len(), 1);
        fw.flush_set("gold").unwrap();
        assert!(fw.set_members("gold").is_empty());
        assert!(fw.has_set("gold"));
    }
}
