//! The reconciliation loop and its signal-driven lifecycle.
//!
//! One control task owns every kernel mutation. Signals never touch the
//! firewall directly; the listener task translates them into control events
//! on a channel the loop drains between ticks, so teardown and reloads are
//! serialized with reconciliation.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use solana_client::rpc_response::RpcContactInfo;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::classifier;
use crate::config::Config;
use crate::firewall::{Firewall, RuleSpec};
use crate::ports::ValidatorPorts;
use crate::rpc::{self, ClusterRpc};
use crate::topology;

/// Wait after a failed RPC fetch before restarting the tick.
pub const RPC_BACKOFF: Duration = Duration::from_secs(5);

/// Intent posted by the signal listener, handled between ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// SIGINT / SIGTERM: tear down and exit.
    Shutdown,
    /// SIGHUP: re-read configuration files.
    Reload,
    /// SIGUSR1: reconcile now instead of waiting out the tick.
    Refresh,
}

/// Translate process signals into control events. The returned channel end
/// is the only way signals reach the loop.
pub fn spawn_signal_listener(tx: mpsc::Sender<ControlEvent>) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigusr1 = signal(SignalKind::user_defined1())?;

    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = sigint.recv() => ControlEvent::Shutdown,
                _ = sigterm.recv() => ControlEvent::Shutdown,
                _ = sighup.recv() => ControlEvent::Reload,
                _ = sigusr1.recv() => ControlEvent::Refresh,
            };
            if tx.send(event).await.is_err() {
                break;
            }
        }
    });

    Ok(())
}

#[derive(Debug, Clone)]
pub struct DaemonSettings {
    /// Local validator identity, base58. None disables per-port handling
    /// and tier exclusion of our own addresses.
    pub identity: Option<String>,
    /// When false, skip stake fetches and set churn; only track our ports.
    pub update_sets: bool,
    pub tick: Duration,
    pub config_path: PathBuf,
    pub provider_paths: Vec<PathBuf>,
}

enum TickResult {
    Ok,
    Backoff,
}

enum LoopAction {
    Continue,
    Exit(i32),
}

pub struct Daemon<F: Firewall> {
    fw: F,
    rpc: ClusterRpc,
    cfg: Config,
    settings: DaemonSettings,
    ports: Option<ValidatorPorts>,
}

impl<F: Firewall> Daemon<F> {
    pub fn new(fw: F, rpc: ClusterRpc, cfg: Config, settings: DaemonSettings) -> Self {
        Self {
            fw,
            rpc,
            cfg,
            settings,
            ports: None,
        }
    }

    /// Run until a shutdown event arrives; returns the process exit code.
    pub async fn run(mut self, mut rx: mpsc::Receiver<ControlEvent>) -> i32 {
        loop {
            let delay = match self.tick_once().await {
                TickResult::Ok => self.settings.tick,
                TickResult::Backoff => RPC_BACKOFF,
            };
            match self.wait(&mut rx, delay).await {
                LoopAction::Continue => {}
                LoopAction::Exit(code) => return code,
            }
        }
    }

    /// One reconciliation pass. RPC failures abort the pass without touching
    /// kernel state; the caller retries after a short backoff.
    async fn tick_once(&mut self) -> TickResult {
        let stakes = if self.settings.update_sets {
            info!("updating stake weights");
            match self
                .rpc
                .stake_snapshot(self.settings.identity.as_deref())
                .await
            {
                Ok(snapshot) => Some(snapshot),
                Err(e) => {
                    warn!(error = %e, "couldn't load vote accounts");
                    return TickResult::Backoff;
                }
            }
        } else {
            None
        };

        let nodes = match self.rpc.cluster_nodes().await {
            Ok(nodes) => nodes,
            Err(e) => {
                warn!(error = %e, "couldn't load cluster nodes");
                return TickResult::Backoff;
            }
        };

        // Port discovery runs before classification so a port change never
        // rides on stale dispatch rules for a full tick.
        self.refresh_ports(&nodes);

        if self.settings.update_sets {
            let peers = rpc::peers_from_roster(&nodes, stakes.as_ref());
            let total_stake = stakes.map(|s| s.total_stake).unwrap_or(0);
            let visible = classifier::classify(
                &self.fw,
                &self.cfg,
                &peers,
                total_stake,
                self.settings.identity.as_deref(),
            );
            info!(visible, roster = nodes.len(), "updated ipsets");
        } else {
            info!("not updating ipsets");
        }

        TickResult::Ok
    }

    /// Find our own gossip entry and keep the per-port dispatch rules in
    /// sync with the ports it reports. On a change the old pair group is
    /// deleted before the new one is inserted.
    fn refresh_ports(&mut self, nodes: &[RpcContactInfo]) {
        let Some(identity) = self.settings.identity.as_deref() else {
            return;
        };
        let Some(own) = nodes.iter().find(|n| n.pubkey == identity) else {
            return;
        };
        debug!(entry = ?own, "own gossip entry");

        let (Some(tpu), Some(tpu_quic)) = (own.tpu, own.tpu_quic) else {
            debug!("own gossip entry has no TPU endpoint yet");
            return;
        };
        let discovered = ValidatorPorts::new(tpu.port(), tpu_quic.port());

        match self.ports {
            Some(current) if current == discovered => {}
            Some(current) => {
                info!(old = %current, new = %discovered, "validator ports changed, swapping rules");
                current.remove(&self.fw);
                discovered.install(&self.fw);
                self.ports = Some(discovered);
            }
            None => {
                discovered.install(&self.fw);
                self.ports = Some(discovered);
                info!(identity, ports = %discovered, "validator ports set");
            }
        }
    }

    /// Sleep out `delay`, waking early for control events. Shutdown returns
    /// the exit code; reload and refresh both lead straight into the next
    /// tick.
    async fn wait(&mut self, rx: &mut mpsc::Receiver<ControlEvent>, delay: Duration) -> LoopAction {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        tokio::select! {
            _ = &mut sleep => LoopAction::Continue,
            event = rx.recv() => match event {
                Some(ControlEvent::Shutdown) => {
                    // Later signals pile up unread in the channel; teardown
                    // runs exactly once.
                    topology::teardown(&self.fw, &self.cfg, self.ports.as_ref());
                    LoopAction::Exit(1)
                }
                Some(ControlEvent::Refresh) => {
                    info!("refresh requested, reconciling now");
                    LoopAction::Continue
                }
                Some(ControlEvent::Reload) => {
                    self.reload_config();
                    LoopAction::Continue
                }
                // Listener gone; nothing further to wake up for early.
                None => {
                    (&mut sleep).await;
                    LoopAction::Continue
                }
            }
        }
    }

    /// Re-read the config and provider files. The tier list is diffed:
    /// dropped tiers lose their set and MARK rule, survivors and newcomers
    /// are re-installed in the new sort order, custom nodes are re-seeded.
    /// A file that fails to parse leaves the running config untouched.
    fn reload_config(&mut self) {
        info!("reloading configuration files");
        let new_cfg = match Config::load(&self.settings.config_path, &self.settings.provider_paths)
        {
            Ok(cfg) => cfg,
            Err(e) => {
                warn!(error = %e, "reload failed, keeping previous configuration");
                return;
            }
        };

        // Rebuild the mangle MARK rules from scratch so the new tier order
        // holds; first match in the chain must stay the highest tier.
        for class in &self.cfg.classes {
            if let Err(e) = self.fw.delete_rule(
                topology::MANGLE_TABLE,
                topology::MANGLE_CHAIN,
                &RuleSpec::mark_from_set(&class.name, class.fwmark),
            ) {
                warn!(set = %class.name, error = %e, "couldn't drop old mark rule");
            }
        }
        for old in &self.cfg.classes {
            if !new_cfg.classes.iter().any(|c| c.name == old.name) {
                topology::retire_class(&self.fw, old);
            }
        }
        for class in &new_cfg.classes {
            if let Err(e) = topology::ensure_class(&self.fw, class) {
                warn!(set = %class.name, error = %e, "couldn't install reloaded class");
            }
        }
        topology::seed_custom_nodes(&self.fw, &new_cfg.custom_nodes, &new_cfg.custom_class);

        self.cfg = new_cfg;
        info!("configuration reloaded");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firewall::MemoryDriver;
    use crate::topology::{ServicePolicies, GOSSIP_SET};
    use std::time::Instant;

    fn test_daemon(name: &str, tick: Duration) -> Daemon<MemoryDriver> {
        let yaml = r#"
staked_classes:
  - name: gold
    stake_percentage: 0.01
    fwmark: 10
unstaked_class:
  name: bronze
  fwmark: 30
custom_node_class:
  name: custom
  fwmark: 1
"#;
        let dir = std::env::temp_dir().join(format!("solana-fw-daemon-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{name}.yml"));
        std::fs::write(&path, yaml).unwrap();
        let cfg = Config::load(&path, &[]).unwrap();

        let settings = DaemonSettings {
            identity: None,
            update_sets: true,
            tick,
            config_path: path,
            provider_paths: Vec::new(),
        };
        Daemon::new(
            MemoryDriver::new(),
            ClusterRpc::new("http://localhost:8899/"),
            cfg,
            settings,
        )
    }

    #[tokio::test]
    async fn refresh_cuts_the_sleep_short() {
        let mut daemon = test_daemon("refresh", Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ControlEvent::Refresh).await.unwrap();

        let started = Instant::now();
        let action = daemon.wait(&mut rx, Duration::from_secs(60)).await;
        assert!(matches!(action, LoopAction::Continue));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn shutdown_tears_down_and_exits_nonzero() {
        let mut daemon = test_daemon("shutdown", Duration::from_secs(60));
        // Pretend a previous tick installed state.
        topology::install(&daemon.fw, &daemon.cfg, &ServicePolicies::default(), true).unwrap();
        assert!(daemon.fw.has_set(GOSSIP_SET));

        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ControlEvent::Shutdown).await.unwrap();
        // A second termination arriving mid-teardown is left unread.
        tx.send(ControlEvent::Shutdown).await.unwrap();

        let action = daemon.wait(&mut rx, Duration::from_secs(60)).await;
        match action {
            LoopAction::Exit(code) => assert_eq!(code, 1),
            LoopAction::Continue => panic!("expected exit"),
        }
        assert!(!daemon.fw.has_set(GOSSIP_SET));
    }

    #[tokio::test]
    async fn reload_rewrites_tier_state() {
        let mut daemon = test_daemon("reload", Duration::from_millis(10));
        topology::install(&daemon.fw, &daemon.cfg, &ServicePolicies::default(), true).unwrap();
        assert!(daemon.fw.has_set("gold"));

        // New config renames the staked tier.
        let yaml = r#"
staked_classes:
  - name: platinum
    stake_percentage: 0.05
    fwmark: 11
unstaked_class:
  name: bronze
  fwmark: 30
custom_node_class:
  name: custom
  fwmark: 1
"#;
        std::fs::write(&daemon.settings.config_path, yaml).unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ControlEvent::Reload).await.unwrap();
        let action = daemon.wait(&mut rx, Duration::from_secs(60)).await;
        assert!(matches!(action, LoopAction::Continue));

        assert!(!daemon.fw.has_set("gold"));
        assert!(daemon.fw.has_set("platinum"));
        assert_eq!(daemon.cfg.classes.iter().filter(|c| c.name == "platinum").count(), 1);

        // Mark rules follow the new tier order.
        let marks: Vec<String> = daemon
            .fw
            .chain_rules(topology::MANGLE_TABLE, topology::MANGLE_CHAIN)
            .into_iter()
            .filter_map(|rule| rule.match_set)
            .collect();
        assert_eq!(marks, vec!["custom", "platinum", "bronze"]);
    }

    #[tokio::test]
    async fn broken_reload_keeps_previous_config() {
        let mut daemon = test_daemon("reload-broken", Duration::from_millis(10));
        std::fs::write(&daemon.settings.config_path, "not: [valid").unwrap();

        let (tx, mut rx) = mpsc::channel(8);
        tx.send(ControlEvent::Reload).await.unwrap();
        daemon.wait(&mut rx, Duration::from_secs(60)).await;
        assert!(daemon.cfg.classes.iter().any(|c| c.name == "gold"));
    }
}
