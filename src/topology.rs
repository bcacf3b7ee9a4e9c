//! Installation and teardown of the kernel objects the daemon owns.
//!
//! The topology is fixed: one mangle chain that marks packets by source set,
//! five filter chains (one per UDP service a validator exposes), five custom
//! override chains the operator may populate, and one ipset per traffic
//! class plus the all-peers gossip set. Installation is idempotent so a
//! crashed run can simply be re-run; teardown tolerates absence so it is
//! safe after a partial startup.

use tracing::{debug, info, warn};

use crate::config::{Config, CustomNode, TrafficClass};
use crate::firewall::{Firewall, FwResult, RuleSpec};
use crate::ports::ValidatorPorts;

pub const MANGLE_TABLE: &str = "mangle";
pub const FILTER_TABLE: &str = "filter";
pub const PREROUTING: &str = "PREROUTING";
pub const INPUT: &str = "INPUT";

/// Mangle chain that marks packets whose source is in any tier set.
pub const MANGLE_CHAIN: &str = "solana-nodes";
/// Set holding every peer currently visible in gossip, regardless of tier.
pub const GOSSIP_SET: &str = "solana-gossip";

/// The five UDP services a validator exposes, in rule-installation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Service {
    Tpu,
    TpuFwd,
    Vote,
    TpuQuic,
    TpuQuicFwd,
}

impl Service {
    pub const ALL: [Service; 5] = [
        Service::Tpu,
        Service::TpuFwd,
        Service::Vote,
        Service::TpuQuic,
        Service::TpuQuicFwd,
    ];

    /// Filter chain receiving this service's inbound traffic.
    pub fn chain(self) -> &'static str {
        match self {
            Service::Tpu => "solana-tpu",
            Service::TpuFwd => "solana-tpu-fwd",
            Service::Vote => "solana-tpu-vote",
            Service::TpuQuic => "solana-tpu-quic",
            Service::TpuQuicFwd => "solana-tpu-quic-fwd",
        }
    }

    /// Override chain the service chain jumps to first, so operator rules
    /// survive reconciliation.
    pub fn custom_chain(self) -> &'static str {
        match self {
            Service::Tpu => "solana-tpu-custom",
            Service::TpuFwd => "solana-tpu-custom-fwd",
            Service::Vote => "solana-tpu-custom-vote",
            Service::TpuQuic => "solana-tpu-custom-quic",
            Service::TpuQuicFwd => "solana-tpu-custom-quic-fwd",
        }
    }
}

/// Default terminal target per service chain. Empty string means the chain
/// falls through to whatever follows in INPUT.
#[derive(Debug, Clone, Default)]
pub struct ServicePolicies {
    pub tpu: String,
    pub tpu_fwd: String,
    pub vote: String,
    pub tpu_quic: String,
    pub tpu_quic_fwd: String,
}

impl ServicePolicies {
    fn for_service(&self, service: Service) -> Option<&str> {
        let policy = match service {
            Service::Tpu => &self.tpu,
            Service::TpuFwd => &self.tpu_fwd,
            Service::Vote => &self.vote,
            Service::TpuQuic => &self.tpu_quic,
            Service::TpuQuicFwd => &self.tpu_quic_fwd,
        };
        if policy.is_empty() {
            None
        } else {
            Some(policy.as_str())
        }
    }
}

/// Materialize the static firewall topology.
///
/// Chain creation failures are structural and bubble up; individual rule
/// appends are logged and skipped, matching the transient-error policy.
pub fn install<F: Firewall>(
    fw: &F,
    cfg: &Config,
    policies: &ServicePolicies,
    have_identity: bool,
) -> FwResult<()> {
    // Sets first, flushed of anything a previous run left behind.
    fw.ensure_set(GOSSIP_SET)?;
    fw.flush_set(GOSSIP_SET)?;
    for class in &cfg.classes {
        fw.ensure_set(&class.name)?;
        fw.flush_set(&class.name)?;
    }

    fw.ensure_chain(MANGLE_TABLE, MANGLE_CHAIN, Some("ACCEPT"))?;

    for service in Service::ALL {
        fw.ensure_chain(FILTER_TABLE, service.chain(), policies.for_service(service))?;
    }
    // Custom chains carry no default so they fall through to the parent.
    for service in Service::ALL {
        fw.ensure_chain(FILTER_TABLE, service.custom_chain(), None)?;
    }
    for service in Service::ALL {
        if let Err(e) = fw.insert_rule(
            FILTER_TABLE,
            service.chain(),
            1,
            &RuleSpec::jump(service.custom_chain()),
        ) {
            warn!(chain = service.chain(), error = %e, "couldn't link custom override chain");
        }
    }

    // One MARK rule per tier, highest threshold first. Order matters: the
    // first match in the mangle chain wins.
    for class in &cfg.classes {
        if let Err(e) = fw.append_unique(
            MANGLE_TABLE,
            MANGLE_CHAIN,
            &RuleSpec::mark_from_set(&class.name, class.fwmark),
        ) {
            warn!(set = %class.name, error = %e, "couldn't append mangle mark rule");
        }
    }

    // Without a known identity there are no per-port dispatch rules, so mark
    // all UDP traffic through the mangle chain instead.
    if !have_identity {
        if let Err(e) =
            fw.append_unique(MANGLE_TABLE, PREROUTING, &RuleSpec::udp_jump(MANGLE_CHAIN))
        {
            warn!(error = %e, "couldn't add catch-all prerouting rule");
        }
    }

    seed_custom_nodes(fw, &cfg.custom_nodes, &cfg.custom_class);

    Ok(())
}

/// Custom nodes are static configuration, not gossip-derived; they are
/// seeded once here and never churned by the reconciliation loop.
pub fn seed_custom_nodes<F: Firewall>(fw: &F, nodes: &[CustomNode], custom_class: &str) {
    for node in nodes {
        info!(name = %node.name, ip = %node.ip, set = custom_class, "adding custom node");
        if let Err(e) = fw.set_add(GOSSIP_SET, node.ip) {
            warn!(ip = %node.ip, error = %e, "couldn't add custom node to gossip set");
        }
        if let Err(e) = fw.set_add(custom_class, node.ip) {
            warn!(ip = %node.ip, set = custom_class, error = %e, "couldn't add custom node to set");
        }
    }
}

/// Append mangle MARK rules for `classes`, preserving the given order.
/// Used by config reload for tiers that appeared since startup.
pub fn ensure_class<F: Firewall>(fw: &F, class: &TrafficClass) -> FwResult<()> {
    fw.ensure_set(&class.name)?;
    fw.append_unique(
        MANGLE_TABLE,
        MANGLE_CHAIN,
        &RuleSpec::mark_from_set(&class.name, class.fwmark),
    )
}

/// Remove a tier's MARK rule and destroy its set. Used by config reload for
/// tiers that disappeared.
pub fn retire_class<F: Firewall>(fw: &F, class: &TrafficClass) {
    if let Err(e) = fw.delete_rule(
        MANGLE_TABLE,
        MANGLE_CHAIN,
        &RuleSpec::mark_from_set(&class.name, class.fwmark),
    ) {
        warn!(set = %class.name, error = %e, "couldn't remove mangle mark rule");
    }
    if let Err(e) = fw.flush_set(&class.name) {
        warn!(set = %class.name, error = %e, "couldn't flush retired set");
    }
    if let Err(e) = fw.destroy_set(&class.name) {
        warn!(set = %class.name, error = %e, "couldn't destroy retired set");
    }
}

/// Tear down everything this daemon owns. Custom override chains are only
/// removed when empty so operator rules survive. Every step tolerates
/// absence; errors are logged and the walk continues.
pub fn teardown<F: Firewall>(fw: &F, cfg: &Config, ports: Option<&ValidatorPorts>) {
    info!("cleaning up all owned sets and firewall rules");

    log_err(fw.flush_set(GOSSIP_SET));
    log_err(fw.destroy_set(GOSSIP_SET));
    for class in &cfg.classes {
        log_err(fw.flush_set(&class.name));
        log_err(fw.destroy_set(&class.name));
    }

    // Never added when the TPU port was never discovered.
    if let Some(ports) = ports {
        ports.remove(fw);
    }

    // Catch-all hook rules, installed only in the no-identity case, but
    // cheap to delete unconditionally.
    log_err(fw.delete_rule(MANGLE_TABLE, PREROUTING, &RuleSpec::udp_jump(MANGLE_CHAIN)));
    for service in Service::ALL {
        log_err(fw.delete_rule(FILTER_TABLE, INPUT, &RuleSpec::udp_jump(service.chain())));
    }

    log_err(fw.clear_and_delete_chain(MANGLE_TABLE, MANGLE_CHAIN));
    for service in Service::ALL {
        log_err(fw.clear_and_delete_chain(FILTER_TABLE, service.chain()));
    }
    for service in Service::ALL {
        log_err(fw.delete_chain_if_empty(FILTER_TABLE, service.custom_chain()));
    }

    info!("finished cleaning up");
}

fn log_err<T>(result: FwResult<T>) {
    if let Err(e) = result {
        debug!(error = %e, "teardown step skipped");
    }
}
