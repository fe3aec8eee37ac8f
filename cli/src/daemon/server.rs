// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Daemon server: serves agent connections until a shutdown signal arrives

use anyhow::{Context, Result};
use tokio::signal;
use tracing::{error, info, warn};

use hangar_core::domain::controller_config::ControllerConfigManifest;
use hangar_core::Controller;

pub async fn run_daemon(config: ControllerConfigManifest) -> Result<()> {
    info!("Hangar controller starting (PID: {})", std::process::id());

    let controller = Controller::from_config(config).context("Failed to initialize controller")?;
    let declared = controller
        .register_declared_agents()
        .await
        .context("Failed to register declared agents")?;
    info!(
        "Configuration loaded: name={}, declared agents={}, launcher policy={:?}",
        controller.config().metadata.name,
        declared,
        controller.config().spec.admission.launcher_policy
    );

    let listener = controller.bind().await?;
    info!("Controller listening on {}", listener.local_addr()?);

    tokio::select! {
        result = controller.serve(listener) => {
            if let Err(e) = &result {
                error!("Agent listener stopped unexpectedly: {:#}", e);
            }
            controller.shutdown().await;
            result?;
        }
        signal = shutdown_signal() => {
            if let Err(e) = signal {
                warn!("Signal handling failed, shutting down: {}", e);
            }
            controller.shutdown().await;
        }
    }

    info!("Controller stopped");
    Ok(())
}

async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C signal");
            },
            _ = terminate.recv() => {
                info!("Received SIGTERM signal");
            },
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C signal");
    }

    Ok(())
}
