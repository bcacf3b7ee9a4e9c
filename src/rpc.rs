//! Thin adapter over the cluster RPC endpoint.
//!
//! Wraps the nonblocking client and reshapes the two snapshots the loop
//! needs: the stake table (vote accounts, current and delinquent) and the
//! gossip roster. Failures surface as errors for the loop's backoff; no
//! retry happens at this layer.

use std::collections::HashMap;

use anyhow::{Context, Result};
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_client::rpc_response::RpcContactInfo;
use solana_sdk::pubkey::Pubkey;

use crate::classifier::PeerNode;

/// Aggregated view of the cluster's vote accounts for one tick.
#[derive(Debug, Default)]
pub struct StakeSnapshot {
    /// Sum of activated stake across every vote account, self included.
    pub total_stake: u64,
    /// node pubkey -> activated stake, excluding ourselves and zero-stake
    /// entries.
    pub staked_peers: HashMap<String, u64>,
}

pub struct ClusterRpc {
    client: RpcClient,
}

impl ClusterRpc {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            client: RpcClient::new(uri.into()),
        }
    }

    pub async fn identity(&self) -> Result<Pubkey> {
        self.client
            .get_identity()
            .await
            .context("couldn't fetch validator identity")
    }

    pub async fn stake_snapshot(&self, exclude: Option<&str>) -> Result<StakeSnapshot> {
        let accounts = self
            .client
            .get_vote_accounts()
            .await
            .context("couldn't load vote accounts")?;
        let entries = accounts
            .current
            .iter()
            .chain(accounts.delinquent.iter())
            .map(|account| (account.node_pubkey.as_str(), account.activated_stake));
        Ok(aggregate_stake(entries, exclude))
    }

    pub async fn cluster_nodes(&self) -> Result<Vec<RpcContactInfo>> {
        self.client
            .get_cluster_nodes()
            .await
            .context("couldn't load cluster nodes")
    }
}

/// Fold vote-account entries into a [`StakeSnapshot`]. Total stake counts
/// everything; the peer map drops our own identity and unstaked entries.
fn aggregate_stake<'a>(
    entries: impl Iterator<Item = (&'a str, u64)>,
    exclude: Option<&str>,
) -> StakeSnapshot {
    let mut snapshot = StakeSnapshot::default();
    for (node_pubkey, activated_stake) in entries {
        snapshot.total_stake += activated_stake;
        if exclude == Some(node_pubkey) {
            continue;
        }
        if activated_stake == 0 {
            continue;
        }
        snapshot
            .staked_peers
            .insert(node_pubkey.to_string(), activated_stake);
    }
    snapshot
}

/// Join the gossip roster with the stake table into per-tick peer records.
pub fn peers_from_roster(
    nodes: &[RpcContactInfo],
    stakes: Option<&StakeSnapshot>,
) -> Vec<PeerNode> {
    nodes
        .iter()
        .map(|node| PeerNode {
            pubkey: node.pubkey.clone(),
            gossip_ip: node.gossip.map(|a| a.ip()),
            tpu_ip: node.tpu.map(|a| a.ip()),
            stake: stakes
                .and_then(|s| s.staked_peers.get(&node.pubkey).copied())
                .unwrap_or(0),
        })
        .collect()
}
