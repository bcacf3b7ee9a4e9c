//! The local validator's UDP port quintuple and its dispatch rules.
//!
//! The cluster reports a TPU and a TPU-QUIC endpoint for our own identity
//! via gossip; the remaining ports follow the cluster's fixed layout
//! relative to those two. Each port gets a rule pair: a PREROUTING rule
//! steering it through the mangle chain for marking, and an INPUT rule (at
//! the head of the chain) dispatching it to the per-service filter chain.

use tracing::warn;

use crate::firewall::{Firewall, RuleSpec};
use crate::topology::{Service, FILTER_TABLE, INPUT, MANGLE_CHAIN, MANGLE_TABLE, PREROUTING};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValidatorPorts {
    pub tpu: u16,
    pub tpu_fwd: u16,
    pub vote: u16,
    pub tpu_quic: u16,
    pub tpu_quic_fwd: u16,
}

impl ValidatorPorts {
    /// Derive the quintuple from the reported TPU and TPU-QUIC ports. The
    /// QUIC port is taken as reported rather than re-derived from `tpu`.
    pub fn new(tpu: u16, tpu_quic: u16) -> Self {
        Self {
            tpu,
            tpu_fwd: tpu.saturating_add(6),
            vote: tpu.saturating_sub(1),
            tpu_quic,
            tpu_quic_fwd: tpu_quic.saturating_add(6),
        }
    }

    pub fn port(&self, service: Service) -> u16 {
        match service {
            Service::Tpu => self.tpu,
            Service::TpuFwd => self.tpu_fwd,
            Service::Vote => self.vote,
            Service::TpuQuic => self.tpu_quic,
            Service::TpuQuicFwd => self.tpu_quic_fwd,
        }
    }

    /// Install the rule pair for every service. The INPUT rule goes in at
    /// position 1 so it outranks anything else in the chain.
    pub fn install<F: Firewall>(&self, fw: &F) {
        for service in Service::ALL {
            let port = self.port(service);
            if let Err(e) = fw.append_unique(
                MANGLE_TABLE,
                PREROUTING,
                &RuleSpec::udp_dport_jump(port, MANGLE_CHAIN),
            ) {
                warn!(port, error = %e, "couldn't add mangle rule for port");
            }
            if let Err(e) = fw.insert_rule(
                FILTER_TABLE,
                INPUT,
                1,
                &RuleSpec::udp_dport_jump(port, service.chain()),
            ) {
                warn!(port, error = %e, "couldn't add filter rule for port");
            }
        }
    }

    /// Delete both rules of every pair. Called before installing a changed
    /// quintuple so a stale port never keeps privileged handling.
    pub fn remove<F: Firewall>(&self, fw: &F) {
        for service in Service::ALL {
            let port = self.port(service);
            if let Err(e) = fw.delete_rule(
                MANGLE_TABLE,
                PREROUTING,
                &RuleSpec::udp_dport_jump(port, MANGLE_CHAIN),
            ) {
                warn!(port, error = %e, "couldn't delete mangle rule for port");
            }
            if let Err(e) = fw.delete_rule(
                FILTER_TABLE,
                INPUT,
                &RuleSpec::udp_dport_jump(port, service.chain()),
            ) {
                warn!(port, error = %e, "couldn't delete filter rule for port");
            }
        }
    }
}

impl std::fmt::Display for ValidatorPorts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "tpu={} tpufwd={} vote={} quic={} quic-fwd={}",
            self.tpu, self.tpu_fwd, self.vote, self.tpu_quic, self.tpu_quic_fwd
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::MemoryDriver;

    #[test]
    fn derives_the_documented_layout() {
        let ports = ValidatorPorts::new(8003, 8009);
        assert_eq!(ports.tpu, 8003);
        assert_eq!(ports.tpu_fwd, 8009);
        assert_eq!(ports.vote, 8002);
        assert_eq!(ports.tpu_quic, 8009);
        assert_eq!(ports.tpu_quic_fwd, 8015);
    }

    #[test]
    fn quic_port_is_taken_as_reported() {
        // Not derived as tpu+6; a cluster may report something else.
        let ports = ValidatorPorts::new(8003, 9100);
        assert_eq!(ports.tpu_quic, 9100);
        assert_eq!(ports.tpu_quic_fwd, 9106);
    }

    #[test]
    fn install_places_both_rules_per_port() {
        let fw = MemoryDriver::new();
        let ports = ValidatorPorts::new(8003, 8020);
        ports.install(&fw);

        let prerouting = fw.chain_rules(MANGLE_TABLE, PREROUTING);
        let input = fw.chain_rules(FILTER_TABLE, INPUT);
        assert_eq!(prerouting.len(), 5);
        assert_eq!(input.len(), 5);
        assert!(prerouting.contains(&RuleSpec::udp_dport_jump(8002, MANGLE_CHAIN)));
        assert!(input.contains(&RuleSpec::udp_dport_jump(8002, Service::Vote.chain())));
        // Last installed pair sits at position 1 of INPUT.
        assert_eq!(
            input[0],
            RuleSpec::udp_dport_jump(8026, Service::TpuQuicFwd.chain())
        );
    }

    #[test]
    fn overlapping_ports_share_one_prerouting_rule() {
        // tpu=8003 puts tpu_fwd and a reported quic port both on 8009; the
        // identical PREROUTING rules collapse, the INPUT dispatches do not.
        let fw = MemoryDriver::new();
        ValidatorPorts::new(8003, 8009).install(&fw);
        assert_eq!(fw.chain_rules(MANGLE_TABLE, PREROUTING).len(), 4);
        assert_eq!(fw.chain_rules(FILTER_TABLE, INPUT).len(), 5);
    }

    #[test]
    fn swap_leaves_no_stale_pair() {
        let fw = MemoryDriver::new();
        let old = ValidatorPorts::new(8003, 8020);
        old.install(&fw);

        let new = ValidatorPorts::new(9003, 9020);
        old.remove(&fw);
        new.install(&fw);

        let prerouting = fw.chain_rules(MANGLE_TABLE, PREROUTING);
        let input = fw.chain_rules(FILTER_TABLE, INPUT);
        assert_eq!(prerouting.len(), 5);
        assert_eq!(input.len(), 5);
        for service in Service::ALL {
            let stale = RuleSpec::udp_dport_jump(old.port(service), service.chain());
            assert!(!input.contains(&stale));
            assert!(!prerouting.contains(&RuleSpec::udp_dport_jump(old.port(service), MANGLE_CHAIN)));
        }
        assert!(input.contains(&RuleSpec::udp_dport_jump(9002, Service::Vote.chain())));
    }

    #[test]
    fn reinstall_is_idempotent() {
        let fw = MemoryDriver::new();
        let ports = ValidatorPorts::new(8003, 8020);
        ports.install(&fw);
        ports.install(&fw);
        assert_eq!(fw.chain_rules(MANGLE_TABLE, PREROUTING).len(), 5);
        assert_eq!(fw.chain_rules(FILTER_TABLE, INPUT).len(), 5);
    }
}
