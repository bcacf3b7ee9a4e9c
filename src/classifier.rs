//! Stake-weight classification of gossip-visible peers.
//!
//! Each reconciliation tick rebuilds a view of the cluster: every peer with
//! a gossip endpoint contributes its addresses to the gossip set, and peers
//! carrying activated stake land in the highest traffic class whose
//! threshold their stake fraction strictly exceeds. Stake-less peers fall
//! into the unstaked class. The custom class is operator-seeded and never
//! touched here.

use std::net::IpAddr;

use tracing::{debug, warn};

use crate::config::{Config, TrafficClass};
use crate::firewall::Firewall;
use crate::topology::GOSSIP_SET;

/// One validator identity as seen this tick. Rebuilt from the RPC snapshots
/// every reconciliation pass, never persisted.
#[derive(Debug, Clone)]
pub struct PeerNode {
    pub pubkey: String,
    pub gossip_ip: Option<IpAddr>,
    pub tpu_ip: Option<IpAddr>,
    /// Activated stake in lamports; zero means not in the stake table.
    pub stake: u64,
}

impl PeerNode {
    /// Unique addresses for this peer: the gossip host, plus the TPU host
    /// when it differs. Both receive identical tier treatment.
    pub fn addresses(&self) -> Vec<IpAddr> {
        let mut addrs = Vec::with_capacity(2);
        if let Some(gossip) = self.gossip_ip {
            addrs.push(gossip);
            if let Some(tpu) = self.tpu_ip {
                if tpu != gossip {
                    addrs.push(tpu);
                }
            }
        }
        addrs
    }
}

/// First tier in the descending-sorted list whose threshold the stake
/// fraction strictly exceeds. The custom sentinel is unreachable by
/// construction; the unstaked sentinel catches everything else.
pub fn select_tier<'a>(
    stake: u64,
    total_stake: u64,
    classes: &'a [TrafficClass],
) -> Option<&'a TrafficClass> {
    if total_stake == 0 {
        return None;
    }
    let percent = stake as f64 / total_stake as f64;
    classes.iter().find(|class| percent > class.threshold)
}

/// Walk the roster and drive set membership. Returns how many peers were
/// visible in gossip this tick.
pub fn classify<F: Firewall>(
    fw: &F,
    cfg: &Config,
    peers: &[PeerNode],
    total_stake: u64,
    local_identity: Option<&str>,
) -> usize {
    let mut visible = 0;

    for peer in peers {
        if peer.gossip_ip.is_none() {
            debug!(pubkey = %peer.pubkey, "not visible in gossip");
            continue;
        }
        let addresses = peer.addresses();
        visible += 1;

        for &addr in &addresses {
            if let Err(e) = fw.set_add(GOSSIP_SET, addr) {
                warn!(%addr, error = %e, "failed to add node to gossip set");
            }
        }

        // Our own addresses belong in the gossip set but never in a tier.
        if local_identity == Some(peer.pubkey.as_str()) {
            continue;
        }

        let target = if peer.stake > 0 {
            match select_tier(peer.stake, total_stake, &cfg.classes) {
                Some(tier) => tier.name.as_str(),
                None => continue,
            }
        } else {
            cfg.unstaked_class.as_str()
        };

        for &addr in &addresses {
            if let Err(e) = fw.set_add(target, addr) {
                warn!(%addr, set = target, error = %e, "failed to add node to set");
            }
            // A peer whose tier changed since the last tick must not stay
            // counted in its old one. The custom set is exempt: it holds
            // static operator entries, not gossip-derived state.
            for class in &cfg.classes {
                if class.name != target && class.name != cfg.custom_class {
                    if let Err(e) = fw.set_del(&class.name, addr) {
                        warn!(%addr, set = %class.name, error = %e, "failed to prune node from set");
                    }
                }
            }
        }
    }

    visible
}
