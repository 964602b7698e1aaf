// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use std::path::Path;
use std::sync::Arc;

use tonic::{Request, Response, Status};
use tracing::error;

use super::csi::node_server::{Node, NodeServer};
use super::csi::{self, volume_capability};
use super::{log_request, unimplemented, Redacted};
use crate::application::node::NodeProvisioner;
use crate::domain::mount::MountTarget;

/// CSI Node service, running on each worker VM
pub struct NodeService {
    provisioner: Arc<NodeProvisioner>,
}

impl NodeService {
    pub fn new(provisioner: Arc<NodeProvisioner>) -> Self {
        Self { provisioner }
    }

    pub fn into_server(self) -> NodeServer<Self> {
        NodeServer::new(self)
    }
}

/// Mount target for a publish request; raw block access is not offered
fn mount_target(req: &csi::NodePublishVolumeRequest) -> Result<MountTarget, Status> {
    let (fs_type, mut flags) = match req
        .volume_capability
        .as_ref()
        .and_then(|c| c.access_type.as_ref())
    {
        Some(volume_capability::AccessType::Mount(mount)) => {
            (mount.fs_type.clone(), mount.mount_flags.clone())
        }
        Some(volume_capability::AccessType::Block(_)) => {
            return Err(Status::invalid_argument("block access is not supported"));
        }
        None => (String::new(), Vec::new()),
    };

    if req.readonly && !flags.iter().any(|f| f == "ro") {
        flags.push("ro".to_string());
    }

    Ok(MountTarget::new(&req.target_path, &fs_type, flags))
}

#[tonic::async_trait]
impl Node for NodeService {
    async fn node_stage_volume(
        &self,
        _request: Request<csi::NodeStageVolumeRequest>,
    ) -> Result<Response<csi::NodeStageVolumeResponse>, Status> {
        Err(unimplemented("NodeStageVolume"))
    }

    async fn node_unstage_volume(
        &self,
        _request: Request<csi::NodeUnstageVolumeRequest>,
    ) -> Result<Response<csi::NodeUnstageVolumeResponse>, Status> {
        Err(unimplemented("NodeUnstageVolume"))
    }

    async fn node_publish_volume(
        &self,
        request: Request<csi::NodePublishVolumeRequest>,
    ) -> Result<Response<csi::NodePublishVolumeResponse>, Status> {
        let req = request.into_inner();
        log_request("NodePublishVolume", &req.redacted());

        let target = mount_target(&req)?;
        self.provisioner
            .publish(&req.volume_id, &target)
            .await
            .map_err(|e| {
                error!(volume_id = %req.volume_id, error = %e, "NodePublishVolume failed");
                Status::from(e)
            })?;

        Ok(Response::new(csi::NodePublishVolumeResponse {}))
    }

    async fn node_unpublish_volume(
        &self,
        request: Request<csi::NodeUnpublishVolumeRequest>,
    ) -> Result<Response<csi::NodeUnpublishVolumeResponse>, Status> {
        let req = request.into_inner();
        log_request("NodeUnpublishVolume", &req);

        self.provisioner
            .unpublish(&req.volume_id, Path::new(&req.target_path))
            .await
            .map_err(|e| {
                error!(volume_id = %req.volume_id, error = %e, "NodeUnpublishVolume failed");
                Status::from(e)
            })?;

        Ok(Response::new(csi::NodeUnpublishVolumeResponse {}))
    }

    async fn node_get_volume_stats(
        &self,
        _request: Request<csi::NodeGetVolumeStatsRequest>,
    ) -> Result<Response<csi::NodeGetVolumeStatsResponse>, Status> {
        Err(unimplemented("NodeGetVolumeStats"))
    }

    async fn node_expand_volume(
        &self,
        _request: Request<csi::NodeExpandVolumeRequest>,
    ) -> Result<Response<csi::NodeExpandVolumeResponse>, Status> {
        Err(unimplemented("NodeExpandVolume"))
    }

    async fn node_get_capabilities(
        &self,
        request: Request<csi::NodeGetCapabilitiesRequest>,
    ) -> Result<Response<csi::NodeGetCapabilitiesResponse>, Status> {
        log_request("NodeGetCapabilities", request.get_ref());
        Ok(Response::new(csi::NodeGetCapabilitiesResponse {
            capabilities: Vec::new(),
        }))
    }

    async fn node_get_info(
        &self,
        request: Request<csi::NodeGetInfoRequest>,
    ) -> Result<Response<csi::NodeGetInfoResponse>, Status> {
        log_request("NodeGetInfo", request.get_ref());
        Ok(Response::new(csi::NodeGetInfoResponse {
            node_id: self.provisioner.node_id().to_string(),
            max_volumes_per_node: self.provisioner.max_volumes_per_node(),
            accessible_topology: None,
        }))
    }
}
