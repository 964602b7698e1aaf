// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Process wiring: flags to [`DriverConfig`], config to CSI services

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tracing::{info, warn};

use hyperv_csi_core::application::{NodeProvisioner, VolumeController};
use hyperv_csi_core::domain::driver_config::{
    DriverConfig, ServiceRole, WinRmAuth, WinRmConfig, WinRmEndpoint, STARTUP_CHECK_TIMEOUT,
};
use hyperv_csi_core::domain::volume::VolumePaths;
use hyperv_csi_core::infrastructure::metrics::register_metrics;
use hyperv_csi_core::infrastructure::{LinuxHost, PowerShellGateway, WinRmShell};
use hyperv_csi_core::presentation::grpc::server::CsiServices;

use crate::Cli;

pub(crate) fn driver_config(cli: &Cli) -> Result<DriverConfig> {
    let role: ServiceRole = cli.grpc_service.parse()?;

    let winrm = match cli.winrm_host.as_deref().filter(|h| !h.trim().is_empty()) {
        Some(host) => Some(WinRmConfig {
            endpoint: WinRmEndpoint::parse(host)?,
            username: cli.winrm_user.clone().unwrap_or_default(),
            password: cli.winrm_password.clone().unwrap_or_default(),
            auth: cli.winrm_auth.parse()?,
            ca_file: cli.winrm_ca_file.clone(),
        }),
        None => None,
    };

    let config = DriverConfig {
        role,
        csi_address: cli.csi_address.clone(),
        winrm,
        volume_root: cli.volume_path.clone(),
        node_id: cli.node_id.clone(),
        command_timeout: Duration::from_secs(cli.command_timeout_secs),
    };
    config.validate().context("invalid driver configuration")?;
    Ok(config)
}

pub(crate) fn install_metrics(addr: SocketAddr) -> Result<()> {
    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .context("failed to install Prometheus exporter")?;
    register_metrics();
    info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

/// Build the role's services. The controller must reach the Hyper-V host
/// before it starts serving.
pub(crate) async fn build_services(config: &DriverConfig) -> Result<CsiServices> {
    match config.role {
        ServiceRole::Controller => {
            let winrm = config
                .winrm
                .as_ref()
                .context("controller role requires WinRM settings")?;
            let shell = WinRmShell::from_config(winrm)
                .await
                .context("failed to build WinRM client")?;
            info!(url = shell.url(), user = %winrm.username, auth = %winrm.auth, "Connecting to Hyper-V host");

            let gateway = Arc::new(PowerShellGateway::new(Arc::new(shell)));
            let check = gateway.run("echo ok", STARTUP_CHECK_TIMEOUT).await;
            if !check.succeeded() {
                match check.transport_error {
                    Some(e) => bail!("Hyper-V host is unreachable: {}", e),
                    None => bail!(
                        "Hyper-V host check failed with exit code {}: {}",
                        check.exit_code,
                        check.output
                    ),
                }
            }
            info!("Hyper-V host reachable");

            let controller = VolumeController::new(gateway, VolumePaths::new(&config.volume_root));
            Ok(CsiServices::Controller {
                lifecycle: Arc::new(controller),
                command_timeout: config.command_timeout,
            })
        }
        ServiceRole::Node => {
            let node_id = config
                .node_id
                .clone()
                .context("node role requires a node id")?;
            let provisioner = NodeProvisioner::new(Arc::new(LinuxHost::new()), node_id);
            Ok(CsiServices::Node {
                provisioner: Arc::new(provisioner),
            })
        }
    }
}

/// Resolves on Ctrl+C or SIGTERM
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received");
}
