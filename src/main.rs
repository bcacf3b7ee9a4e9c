use anyhow::{Context, Result};
use clap::Parser;
use solana_sdk::pubkey::Pubkey;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use solana_firewall::cli::Args;
use solana_firewall::config::Config;
use solana_firewall::daemon::{self, Daemon, DaemonSettings};
use solana_firewall::firewall::IptablesDriver;
use solana_firewall::rpc::ClusterRpc;
use solana_firewall::topology;

fn install_panic_handler() {
    let default_panic = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        let location = panic_info
            .location()
            .map(|l| format!("{}:{}", l.file(), l.line()))
            .unwrap_or_else(|| "unknown location".to_string());
        error!("panic at {location}: {panic_info}");
        default_panic(panic_info);
        std::process::exit(1);
    }));
}

fn main() {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(num_cpus::get())
        .thread_name("solana-firewall-worker")
        .enable_all()
        .build()
        .expect("couldn't create tokio runtime");

    let code = match runtime.block_on(run()) {
        Ok(code) => code,
        Err(e) => {
            error!("{e:#}");
            1
        }
    };
    std::process::exit(code);
}

async fn run() -> Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    install_panic_handler();

    let mut args = Args::parse();
    args.normalize();

    let cfg = Config::load(&args.config_file, &args.trusted_providers)?;

    let rpc = ClusterRpc::new(args.rpc_uri.clone());

    let mut identity = args.pubkey.clone();
    if let Some(pubkey) = &identity {
        pubkey
            .parse::<Pubkey>()
            .with_context(|| format!("invalid validator pubkey {pubkey}"))?;
    }
    if args.fetch_identity {
        match rpc.identity().await {
            Ok(pubkey) => {
                identity = Some(pubkey.to_string());
                info!(identity = %pubkey, "loaded identity");
            }
            Err(e) => {
                warn!(error = %e, "couldn't fetch validator identity, firewall will not by default handle tpu/tpufwd/vote ports");
            }
        }
    }

    let fw = IptablesDriver::new().context("couldn't init packet filter backend")?;

    topology::install(&fw, &cfg, &args.policies(), identity.is_some())
        .context("couldn't install firewall topology")?;

    let (tx, rx) = mpsc::channel(16);
    daemon::spawn_signal_listener(tx).context("couldn't install signal handlers")?;

    let settings = DaemonSettings {
        identity,
        update_sets: args.update,
        tick: args.sleep,
        config_path: args.config_file.clone(),
        provider_paths: args.trusted_providers.clone(),
    };
    let daemon = Daemon::new(fw, rpc, cfg, settings);
    Ok(daemon.run(rx).await)
}
