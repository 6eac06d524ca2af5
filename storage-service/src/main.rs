// SPDX-License-Identifier: GPL-3.0-only

//! localdrive agent - keeps this node's block devices in the drive registry

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, fmt};

use storage_contracts::{DriveRegistry, VolumeRegistry};
use storage_service::{
    Agent, AgentConfig, Cli, FormatService, LocalRegistry, Reconciler,
};
use storage_sys::{DeviceProber, MountListener, Mounter, ProcMountSource, XfsFilesystem, xfs};
use storage_types::{Drive, Volume};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("storage_service=info,storage_sys=info,warn")),
        )
        .with_writer(std::io::stderr)
        .init();

    tracing::info!("Starting localdrive agent v{}", env!("CARGO_PKG_VERSION"));

    if unsafe { libc::geteuid() } != 0 {
        tracing::error!("localdrive agent must run as root");
        anyhow::bail!("Agent must run with root privileges");
    }

    let config = Arc::new(AgentConfig::load(&cli).context("Failed to load configuration")?);
    tracing::info!(
        "Node {} manages drives under {}",
        config.node_name,
        config.mount_root()
    );

    let cancel = CancellationToken::new();
    let mounter = Arc::new(Mounter::new(config.mountinfo_path.clone()));
    let prober = Arc::new(DeviceProber::new(config.host_paths(), config.allow_loopback));

    let reflink = match xfs::probe_reflink_support(&mounter, &cancel).await {
        Ok(supported) => supported,
        Err(e) => {
            tracing::warn!("Reflink probe failed: {}. Formatting without reflink.", e);
            false
        }
    };
    tracing::info!("XFS reflink support: {}", reflink);
    let filesystem = Arc::new(XfsFilesystem::new(reflink));

    let drives: Arc<DriveRegistry>;
    let volumes: Arc<VolumeRegistry>;
    match &config.state_dir {
        Some(dir) => {
            tracing::info!("Registry state directory: {}", dir.display());
            drives = Arc::new(LocalRegistry::<Drive>::open(dir.join("drives")).await?);
            volumes = Arc::new(LocalRegistry::<Volume>::open(dir.join("volumes")).await?);
        }
        None => {
            tracing::info!("Registry records are kept in memory");
            drives = Arc::new(LocalRegistry::<Drive>::in_memory());
            volumes = Arc::new(LocalRegistry::<Volume>::in_memory());
        }
    }

    let source = ProcMountSource::open(&config.mountinfo_path)
        .with_context(|| format!("Cannot watch {}", config.mountinfo_path.display()))?;
    let listener = MountListener::start(source, config.resync_interval(), cancel.clone())
        .await
        .context("Failed to start mount listener")?;

    let reconciler = Arc::new(Reconciler::new(
        Arc::clone(&config),
        prober.clone(),
        mounter.clone(),
        Arc::clone(&drives),
        volumes,
    ));
    let formatter = Arc::new(FormatService::new(
        Arc::clone(&config),
        prober,
        mounter,
        filesystem,
        Arc::clone(&drives),
    ));
    let agent = Agent::new(config, reconciler, formatter, drives);

    let mut terminate = signal(SignalKind::terminate())?;
    let shutdown = cancel.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = terminate.recv() => {}
        }
        tracing::info!("Received shutdown signal");
        shutdown.cancel();
    });

    tracing::info!("Agent ready");
    let result = agent.run(&listener, &cancel).await;
    listener.close();

    tracing::info!("localdrive agent shutting down");
    Ok(result?)
}
