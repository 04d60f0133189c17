use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info};
use remote_unlock_core::{
    config::{RemoteUnlockConfig, DEFAULT_CONFIG_PATH},
    lifecycle, logging, shutdown,
};
use remote_unlock_zfs::SystemZfsProvider;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

mod ssh;

use ssh::{SshListener, SshSettings};

/// Serves the ZFS unlock prompt over SSH during early boot.
#[derive(Parser, Debug)]
#[command(name = "remote-unlock-daemon", version)]
struct Args {
    /// Path to the configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override `server.listen`.
    #[arg(long)]
    listen: Option<String>,

    /// Override `server.host_keys`; repeat for several keys.
    #[arg(long = "host-key")]
    host_keys: Vec<PathBuf>,
}

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");
    let args = Args::parse();

    let mut config = RemoteUnlockConfig::load(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        config.server.listen = listen;
    }
    if !args.host_keys.is_empty() {
        config.server.host_keys = args.host_keys;
    }
    config.validate().context("validate config overrides")?;

    info!("remote-unlock daemon starting (config: {})", config.path.display());

    let provider = SystemZfsProvider::from_config(&config).context("initialise zfs provider")?;
    provider
        .probe()
        .context("zfs is not usable; is the kernel module loaded?")?;

    let settings = SshSettings::from_config(&config).context("load ssh keys")?;
    let listener = SshListener::bind(config.listen_addr()?, settings)
        .await
        .with_context(|| format!("bind {}", config.server.listen))?;

    let cancel = CancellationToken::new();
    let (triggers_tx, triggers) = mpsc::channel(4);
    forward_signals(triggers_tx).context("install signal handlers")?;
    let watcher = tokio::spawn(shutdown::escalate(triggers, cancel.clone(), || {
        std::process::exit(1)
    }));

    let result = lifecycle::run(cancel.clone(), Arc::new(provider), listener).await;
    watcher.abort();

    match result {
        Ok(()) => {
            info!("boot resumed; exiting");
            Ok(())
        }
        Err(err) if err.is_cancelled() => {
            info!("shutdown requested; exiting without resuming boot");
            Ok(())
        }
        Err(err) => Err(err).context("serve unlock sessions"),
    }
}

/// Feed SIGINT and SIGTERM into the shutdown watcher.
fn forward_signals(tx: mpsc::Sender<&'static str>) -> Result<()> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                _ = interrupt.recv() => "SIGINT",
                _ = terminate.recv() => "SIGTERM",
            };
            if tx.send(name).await.is_err() {
                break;
            }
        }
    });
    Ok(())
}
