//! Traffic-class configuration.
//!
//! The YAML file carries the operator's staked tiers plus two special
//! classes: one for stake-less gossip peers and one for statically
//! configured custom nodes. Loading merges any trusted-provider files into
//! the custom-node list and flattens everything into a single tier list
//! sorted by threshold, highest first, which is the only view the rest of
//! the daemon sees.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde::Deserialize;

/// Sentinel threshold for the unstaked class: every stake fraction beats it,
/// so it catches anything the staked tiers passed over.
pub const UNSTAKED_THRESHOLD: f64 = f64::NEG_INFINITY;

/// Sentinel threshold for the custom class: no stake fraction can exceed it,
/// so membership only ever comes from static configuration.
pub const CUSTOM_THRESHOLD: f64 = 2.0;

#[derive(Debug, Clone, Deserialize)]
pub struct TrafficClass {
    pub name: String,
    #[serde(rename = "stake_percentage", default)]
    pub threshold: f64,
    #[serde(default)]
    pub fwmark: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CustomNode {
    pub name: String,
    pub ip: IpAddr,
}

#[derive(Debug, Deserialize)]
struct RawConfig {
    staked_classes: Vec<TrafficClass>,
    unstaked_class: TrafficClass,
    custom_node_class: TrafficClass,
    #[serde(default)]
    custom_node_entries: Vec<CustomNode>,
}

// Trusted-provider files carry a bare node list.
#[derive(Debug, Deserialize)]
struct ProviderFile {
    nodes: Vec<CustomNode>,
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Every tier, sentinels included, sorted by threshold descending.
    pub classes: Vec<TrafficClass>,
    pub unstaked_class: String,
    pub custom_class: String,
    pub custom_nodes: Vec<CustomNode>,
}

impl Config {
    pub fn load(path: &Path, providers: &[PathBuf]) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("couldn't open config file {}", path.display()))?;
        let raw: RawConfig = serde_yaml::from_str(&text)
            .with_context(|| format!("couldn't decode config file {}", path.display()))?;

        let mut custom_nodes = raw.custom_node_entries;
        for provider in providers {
            let text = fs::read_to_string(provider)
                .with_context(|| format!("couldn't open provider file {}", provider.display()))?;
            let parsed: ProviderFile = serde_yaml::from_str(&text).with_context(|| {
                format!("couldn't decode provider file {}", provider.display())
            })?;
            custom_nodes.extend(parsed.nodes);
        }

        Self::assemble(raw.staked_classes, raw.unstaked_class, raw.custom_node_class, custom_nodes)
    }

    fn assemble(
        staked: Vec<TrafficClass>,
        mut unstaked: TrafficClass,
        mut custom: TrafficClass,
        custom_nodes: Vec<CustomNode>,
    ) -> Result<Self> {
        for class in &staked {
            if !(class.threshold > 0.0 && class.threshold <= 1.0) {
                bail!(
                    "staked class {} has stake_percentage {} outside (0, 1]",
                    class.name,
                    class.threshold
                );
            }
        }

        // Whatever the file said, the sentinels decide where these two sort.
        unstaked.threshold = UNSTAKED_THRESHOLD;
        custom.threshold = CUSTOM_THRESHOLD;

        let unstaked_class = unstaked.name.clone();
        let custom_class = custom.name.clone();

        let mut classes = staked;
        classes.push(unstaked);
        classes.push(custom);
        classes.sort_by(|a, b| b.threshold.total_cmp(&a.threshold));

        let mut names: Vec<&str> = classes.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if names.windows(2).any(|pair| pair[0] == pair[1]) {
            bail!("traffic class names must be unique");
        }
        if classes.iter().any(|c| c.name.is_empty()) {
            bail!("traffic class names must be non-empty");
        }

        Ok(Self {
            classes,
            unstaked_class,
            custom_class,
            custom_nodes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONFIG: &str = r#"
staked_classes:
  - name: solana-gold
    stake_percentage: 0.01
    fwmark: 10
  - name: solana-silver
    stake_percentage: 0.001
    fwmark: 20
unstaked_class:
  name: solana-bronze
  fwmark: 30
custom_node_class:
  name: solana-custom
  fwmark: 1
custom_node_entries:
  - name: rpc-1
    ip: 192.0.2.10
"#;

    fn parse(text: &str) -> Result<Config> {
        let raw: RawConfig = serde_yaml::from_str(text).unwrap();
        Config::assemble(
            raw.staked_classes,
            raw.unstaked_class,
            raw.custom_node_class,
            raw.custom_node_entries,
        )
    }

    #[test]
    fn normalizes_and_sorts_descending() {
        let cfg = parse(CONFIG).unwrap();
        let names: Vec<&str> = cfg.classes.iter().map(|c| c.name.as_str()).collect();
        // Custom sentinel first, staked tiers high to low, unstaked last.
        assert_eq!(
            names,
            vec!["solana-custom", "solana-gold", "solana-silver", "solana-bronze"]
        );
        assert_eq!(cfg.unstaked_class, "solana-bronze");
        assert_eq!(cfg.custom_class, "solana-custom");
        assert_eq!(cfg.classes[0].threshold, CUSTOM_THRESHOLD);
        assert_eq!(cfg.classes[3].threshold, UNSTAKED_THRESHOLD);
        assert_eq!(cfg.custom_nodes.len(), 1);
        assert_eq!(cfg.custom_nodes[0].ip, "192.0.2.10".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn rejects_threshold_out_of_range() {
        let bad = CONFIG.replace("stake_percentage: 0.01", "stake_percentage: 1.5");
        assert!(parse(&bad).is_err());
        let zero = CONFIG.replace("stake_percentage: 0.01", "stake_percentage: 0");
        assert!(parse(&zero).is_err());
    }

    #[test]
    fn rejects_duplicate_names() {
        let bad = CONFIG.replace("name: solana-silver", "name: solana-gold");
        assert!(parse(&bad).is_err());
    }

    #[test]
    fn provider_nodes_append_to_custom_list() {
        let raw: RawConfig = serde_yaml::from_str(CONFIG).unwrap();
        let provider: ProviderFile = serde_yaml::from_str(
            "nodes:\n  - name: provider-1\n    ip: 198.51.100.7\n",
        )
        .unwrap();
        let mut nodes = raw.custom_node_entries;
        nodes.extend(provider.nodes);
        let cfg =
            Config::assemble(raw.staked_classes, raw.unstaked_class, raw.custom_node_class, nodes)
                .unwrap();
        assert_eq!(cfg.custom_nodes.len(), 2);
        assert_eq!(cfg.custom_nodes[1].name, "provider-1");
    }

    #[test]
    fn sentinel_overrides_file_thresholds() {
        let text = CONFIG.replace(
            "unstaked_class:\n  name: solana-bronze",
            "unstaked_class:\n  stake_percentage: 0.9\n  name: solana-bronze",
        );
        let cfg = parse(&text).unwrap();
        let bronze = cfg.classes.iter().find(|c| c.name == "solana-bronze").unwrap();
        assert_eq!(bronze.threshold, UNSTAKED_THRESHOLD);
    }
}
