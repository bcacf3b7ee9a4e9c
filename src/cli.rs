//! Command-line surface.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::topology::ServicePolicies;

#[derive(Debug, Parser)]
#[command(name = "solana-firewall")]
#[command(about = "Stake-weighted firewall manager for Solana validators")]
#[command(version)]
pub struct Args {
    /// Traffic class configuration file
    #[arg(long, default_value = "config.yml")]
    pub config_file: PathBuf,

    /// Local validator identity (base58); enables per-port handling
    #[arg(long)]
    pub pubkey: Option<String>,

    /// Fetch the validator identity from rpc
    #[arg(long)]
    pub fetch_identity: bool,

    /// Use localhost:8899 for rpc and fetch identity from that rpc
    #[arg(long)]
    pub our_localhost: bool,

    /// The rpc uri to poll for stake weights and gossip
    #[arg(long, default_value = "https://api.mainnet-beta.solana.com")]
    pub rpc_uri: String,

    /// Default policy for the tpu chain, default is passthrough
    #[arg(long, default_value = "")]
    pub tpu_policy: String,

    /// Default policy for the tpu forward chain, default is passthrough
    #[arg(long, default_value = "")]
    pub fwd_policy: String,

    /// Default policy for the vote chain, default is passthrough
    #[arg(long, default_value = "")]
    pub vote_policy: String,

    /// Default policy for the quic tpu chain, default is passthrough
    #[arg(long, default_value = "")]
    pub tpu_quic_policy: String,

    /// Default policy for the quic tpu forward chain, default is passthrough
    #[arg(long, default_value = "")]
    pub tpu_quic_fwd_policy: String,

    /// Whether or not to keep ipsets updated from stake weights
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    pub update: bool,

    /// How long to sleep between updates
    #[arg(long, default_value = "10s", value_parser = humantime::parse_duration)]
    pub sleep: Duration,

    /// Extra yaml files appending to the custom node list (repeatable)
    #[arg(long = "trusted-providers")]
    pub trusted_providers: Vec<PathBuf>,
}

impl Args {
    /// Expand the localhost shorthand into its two underlying settings.
    pub fn normalize(&mut self) {
        if self.our_localhost {
            self.rpc_uri = "http://localhost:8899/".to_string();
            self.fetch_identity = true;
        }
    }

    pub fn policies(&self) -> ServicePolicies {
        ServicePolicies {
            tpu: self.tpu_policy.clone(),
            tpu_fwd: self.fwd_policy.clone(),
            vote: self.vote_policy.clone(),
            tpu_quic: self.tpu_quic_policy.clone(),
            tpu_quic_fwd: self.tpu_quic_fwd_policy.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_behavior() {
        let args = Args::try_parse_from(["solana-firewall"]).unwrap();
        assert_eq!(args.config_file, PathBuf::from("config.yml"));
        assert_eq!(args.rpc_uri, "https://api.mainnet-beta.solana.com");
        assert!(args.update);
        assert_eq!(args.sleep, Duration::from_secs(10));
        assert!(args.trusted_providers.is_empty());
        assert!(args.tpu_policy.is_empty());
    }

    #[test]
    fn our_localhost_rewrites_rpc_and_identity() {
        let mut args = Args::try_parse_from(["solana-firewall", "--our-localhost"]).unwrap();
        args.normalize();
        assert_eq!(args.rpc_uri, "http://localhost:8899/");
        assert!(args.fetch_identity);
    }

    #[test]
    fn update_flag_takes_an_explicit_value() {
        let args = Args::try_parse_from(["solana-firewall", "--update", "false"]).unwrap();
        assert!(!args.update);
    }

    #[test]
    fn trusted_providers_accumulate() {
        let args = Args::try_parse_from([
            "solana-firewall",
            "--trusted-providers",
            "a.yml",
            "--trusted-providers",
            "b.yml",
        ])
        .unwrap();
        assert_eq!(args.trusted_providers.len(), 2);
    }

    #[test]
    fn sleep_parses_human_durations() {
        let args = Args::try_parse_from(["solana-firewall", "--sleep", "30s"]).unwrap();
        assert_eq!(args.sleep, Duration::from_secs(30));
    }
}
