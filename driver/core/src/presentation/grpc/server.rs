// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! gRPC Server for the CSI driver
//!
//! Serves Identity plus the role's Controller or Node service on the CSI
//! unix socket.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tracing::info;

use super::controller::ControllerService;
use super::identity::IdentityService;
use super::node::NodeService;
use crate::application::controller::VolumeLifecycle;
use crate::application::node::NodeProvisioner;

/// Services one driver process exposes next to Identity
pub enum CsiServices {
    Controller {
        lifecycle: Arc<dyn VolumeLifecycle>,
        command_timeout: Duration,
    },
    Node {
        provisioner: Arc<NodeProvisioner>,
    },
}

impl CsiServices {
    fn role(&self) -> &'static str {
        match self {
            Self::Controller { .. } => "controller",
            Self::Node { .. } => "node",
        }
    }
}

/// Bind `socket` and serve until `shutdown` resolves.
///
/// A leftover socket file from a previous run is removed first.
pub async fn start_grpc_server<F>(socket: &Path, services: CsiServices, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send,
{
    match tokio::fs::remove_file(socket).await {
        Ok(()) => info!(socket = %socket.display(), "Removed existing socket"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => {
            return Err(e).with_context(|| format!("failed to remove existing socket {}", socket.display()))
        }
    }
    if let Some(parent) = socket.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create socket directory {}", parent.display()))?;
    }

    let listener = UnixListener::bind(socket)
        .with_context(|| format!("failed to listen on {}", socket.display()))?;
    let incoming = UnixListenerStream::new(listener);

    let role = services.role();
    let (controller, node) = match services {
        CsiServices::Controller {
            lifecycle,
            command_timeout,
        } => (
            Some(ControllerService::new(lifecycle, command_timeout).into_server()),
            None,
        ),
        CsiServices::Node { provisioner } => (None, Some(NodeService::new(provisioner).into_server())),
    };

    info!(role = role, socket = %socket.display(), "CSI server listening");

    tonic::transport::Server::builder()
        .add_service(IdentityService::new().into_server())
        .add_optional_service(controller)
        .add_optional_service(node)
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await
        .context("gRPC server failed")?;

    info!(role = role, "CSI server stopped");
    Ok(())
}
