// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! # Hyper-V CSI driver
//!
//! The `hyperv-csi` binary runs one CSI role per process:
//!
//! - **controller**: Identity + Controller, provisions VHDX images on the
//!   Hyper-V host over WinRM and attaches them to worker VMs
//! - **node**: Identity + Node, partitions, formats and mounts attached disks
//!   inside the worker VM
//!
//! Every flag has an environment variable fallback so the driver can be
//! configured entirely from a pod spec.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tracing::info;

mod bootstrap;

/// Hyper-V CSI driver - VHDX-backed persistent volumes for Kubernetes
#[derive(Parser, Debug)]
#[command(name = "hyperv-csi")]
#[command(version, about, long_about = None)]
pub(crate) struct Cli {
    /// CSI role to serve (controller, node)
    #[arg(long, env = "GRPC_SERVICE", default_value = "controller")]
    pub grpc_service: String,

    /// Unix socket the CSI services listen on
    #[arg(long, env = "CSI_ADDRESS", default_value = "/run/csi/socket")]
    pub csi_address: PathBuf,

    /// WinRM endpoint of the Hyper-V host (http://host:port or https://host:port)
    #[arg(long, env = "WINRM_HOST")]
    pub winrm_host: Option<String>,

    #[arg(long, env = "WINRM_USER")]
    pub winrm_user: Option<String>,

    #[arg(long, env = "WINRM_PASSWORD", hide_env_values = true)]
    pub winrm_password: Option<String>,

    /// WinRM authentication scheme (ntlm, basic)
    #[arg(long, env = "WINRM_AUTH", default_value = "ntlm")]
    pub winrm_auth: String,

    /// Extra CA certificate (PEM) trusted for an https WinRM endpoint
    #[arg(long, env = "WINRM_CA_FILE_PATH", value_name = "FILE")]
    pub winrm_ca_file: Option<PathBuf>,

    /// Directory holding volume images on the Hyper-V host
    #[arg(
        long,
        env = "HV_VOLUME_PATH",
        default_value = r"V:\Hyper-V\Virtual Hard Disks"
    )]
    pub volume_path: String,

    /// Name of this node; must match the VM name on the Hyper-V host
    #[arg(long, env = "KUBE_NODE_NAME")]
    pub node_id: Option<String>,

    /// Upper bound in seconds for a single remote command
    #[arg(long, env = "HV_COMMAND_TIMEOUT_SECS", default_value = "120")]
    pub command_timeout_secs: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "HV_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    #[arg(long, env = "HV_LOG_FORMAT", value_enum, default_value = "compact")]
    pub log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "HV_METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum LogFormat {
    Compact,
    Json,
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is normal outside development
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();

    init_logging(&cli.log_level, cli.log_format)?;

    let config = bootstrap::driver_config(&cli)?;
    info!(
        role = %config.role,
        socket = %config.csi_address.display(),
        version = env!("CARGO_PKG_VERSION"),
        "Starting Hyper-V CSI driver"
    );

    if let Some(addr) = cli.metrics_addr {
        bootstrap::install_metrics(addr)?;
    }

    let services = bootstrap::build_services(&config).await?;

    hyperv_csi_core::presentation::grpc::server::start_grpc_server(
        &config.csi_address,
        services,
        bootstrap::shutdown_signal(),
    )
    .await
}

/// Initialize tracing subscriber for logging
fn init_logging(level: &str, format: LogFormat) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    match format {
        LogFormat::Compact => builder.with_target(false).compact().init(),
        LogFormat::Json => builder.json().init(),
    }

    Ok(())
}
