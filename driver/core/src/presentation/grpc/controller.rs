// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! CSI Controller service
//!
//! Converts controller RPCs to [`VolumeLifecycle`] calls. Remote work is
//! bounded by the configured command timeout or the caller's `grpc-timeout`,
//! whichever is shorter.

use std::sync::Arc;
use std::time::Duration;

use tonic::{Request, Response, Status};
use tracing::error;

use super::csi::controller_server::{Controller, ControllerServer};
use super::csi::{self, controller_service_capability, list_volumes_response};
use super::{
    capability_from_proto, capability_to_proto, effective_deadline, log_request, unimplemented,
    Redacted,
};
use crate::application::controller::{confirm_capabilities, CreateVolumeParams, VolumeLifecycle};

pub struct ControllerService {
    lifecycle: Arc<dyn VolumeLifecycle>,
    command_timeout: Duration,
}

impl ControllerService {
    pub fn new(lifecycle: Arc<dyn VolumeLifecycle>, command_timeout: Duration) -> Self {
        Self {
            lifecycle,
            command_timeout,
        }
    }

    pub fn into_server(self) -> ControllerServer<Self> {
        ControllerServer::new(self)
    }

    fn rpc_capability(kind: controller_service_capability::rpc::Type) -> csi::ControllerServiceCapability {
        csi::ControllerServiceCapability {
            r#type: Some(controller_service_capability::Type::Rpc(
                controller_service_capability::Rpc { r#type: kind as i32 },
            )),
        }
    }
}

fn failed(method: &'static str, status: Status) -> Status {
    error!(method = method, code = ?status.code(), message = %status.message(), "request failed");
    status
}

#[tonic::async_trait]
impl Controller for ControllerService {
    async fn create_volume(
        &self,
        request: Request<csi::CreateVolumeRequest>,
    ) -> Result<Response<csi::CreateVolumeResponse>, Status> {
        let deadline = effective_deadline(request.metadata(), self.command_timeout);
        let req = request.into_inner();
        log_request("CreateVolume", &req.redacted());

        let (required_bytes, limit_bytes) = req
            .capacity_range
            .as_ref()
            .map(|r| (r.required_bytes, r.limit_bytes))
            .unwrap_or((0, 0));
        let params = CreateVolumeParams {
            name: req.name,
            required_bytes,
            limit_bytes,
            capabilities: req.volume_capabilities.iter().map(capability_from_proto).collect(),
        };

        let volume = self
            .lifecycle
            .create_volume(params, deadline)
            .await
            .map_err(|e| failed("CreateVolume", e.into()))?;

        Ok(Response::new(csi::CreateVolumeResponse {
            volume: Some(csi::Volume {
                capacity_bytes: volume.capacity_bytes,
                volume_id: volume.id.to_string(),
                ..Default::default()
            }),
        }))
    }

    async fn delete_volume(
        &self,
        request: Request<csi::DeleteVolumeRequest>,
    ) -> Result<Response<csi::DeleteVolumeResponse>, Status> {
        let deadline = effective_deadline(request.metadata(), self.command_timeout);
        let req = request.into_inner();
        log_request("DeleteVolume", &req.redacted());

        self.lifecycle
            .delete_volume(&req.volume_id, deadline)
            .await
            .map_err(|e| failed("DeleteVolume", e.into()))?;

        Ok(Response::new(csi::DeleteVolumeResponse {}))
    }

    async fn controller_publish_volume(
        &self,
        request: Request<csi::ControllerPublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerPublishVolumeResponse>, Status> {
        let deadline = effective_deadline(request.metadata(), self.command_timeout);
        let req = request.into_inner();
        log_request("ControllerPublishVolume", &req.redacted());

        self.lifecycle
            .publish_volume(&req.volume_id, &req.node_id, deadline)
            .await
            .map_err(|e| failed("ControllerPublishVolume", e.into()))?;

        Ok(Response::new(csi::ControllerPublishVolumeResponse {
            publish_context: Default::default(),
        }))
    }

    async fn controller_unpublish_volume(
        &self,
        request: Request<csi::ControllerUnpublishVolumeRequest>,
    ) -> Result<Response<csi::ControllerUnpublishVolumeResponse>, Status> {
        let deadline = effective_deadline(request.metadata(), self.command_timeout);
        let req = request.into_inner();
        log_request("ControllerUnpublishVolume", &req.redacted());

        self.lifecycle
            .unpublish_volume(&req.volume_id, &req.node_id, deadline)
            .await
            .map_err(|e| failed("ControllerUnpublishVolume", e.into()))?;

        Ok(Response::new(csi::ControllerUnpublishVolumeResponse {}))
    }

    async fn validate_volume_capabilities(
        &self,
        request: Request<csi::ValidateVolumeCapabilitiesRequest>,
    ) -> Result<Response<csi::ValidateVolumeCapabilitiesResponse>, Status> {
        let req = request.into_inner();
        log_request("ValidateVolumeCapabilities", &req.redacted());

        if req.volume_id.trim().is_empty() {
            return Err(Status::invalid_argument("volume id is required"));
        }
        if req.volume_capabilities.is_empty() {
            return Err(Status::invalid_argument("volume capabilities are required"));
        }

        let requested: Vec<_> = req.volume_capabilities.iter().map(capability_from_proto).collect();
        let confirmed = confirm_capabilities(&requested);

        Ok(Response::new(csi::ValidateVolumeCapabilitiesResponse {
            confirmed: Some(csi::validate_volume_capabilities_response::Confirmed {
                volume_context: req.volume_context,
                volume_capabilities: confirmed.iter().map(capability_to_proto).collect(),
                parameters: Default::default(),
            }),
            message: String::new(),
        }))
    }

    async fn list_volumes(
        &self,
        request: Request<csi::ListVolumesRequest>,
    ) -> Result<Response<csi::ListVolumesResponse>, Status> {
        let deadline = effective_deadline(request.metadata(), self.command_timeout);
        log_request("ListVolumes", request.get_ref());

        let ids = self
            .lifecycle
            .list_volumes(deadline)
            .await
            .map_err(|e| failed("ListVolumes", e.into()))?;

        let entries = ids
            .into_iter()
            .map(|id| list_volumes_response::Entry {
                volume: Some(csi::Volume {
                    volume_id: id.to_string(),
                    ..Default::default()
                }),
                status: Some(list_volumes_response::VolumeStatus::default()),
            })
            .collect();

        Ok(Response::new(csi::ListVolumesResponse {
            entries,
            next_token: String::new(),
        }))
    }

    async fn get_capacity(
        &self,
        _request: Request<csi::GetCapacityRequest>,
    ) -> Result<Response<csi::GetCapacityResponse>, Status> {
        Err(unimplemented("GetCapacity"))
    }

    async fn controller_get_capabilities(
        &self,
        request: Request<csi::ControllerGetCapabilitiesRequest>,
    ) -> Result<Response<csi::ControllerGetCapabilitiesResponse>, Status> {
        use controller_service_capability::rpc::Type;

        log_request("ControllerGetCapabilities", request.get_ref());
        Ok(Response::new(csi::ControllerGetCapabilitiesResponse {
            capabilities: vec![
                Self::rpc_capability(Type::ListVolumes),
                Self::rpc_capability(Type::CreateDeleteVolume),
                Self::rpc_capability(Type::PublishUnpublishVolume),
            ],
        }))
    }

    async fn create_snapshot(
        &self,
        _request: Request<csi::CreateSnapshotRequest>,
    ) -> Result<Response<csi::CreateSnapshotResponse>, Status> {
        Err(unimplemented("CreateSnapshot"))
    }

    async fn delete_snapshot(
        &self,
        _request: Request<csi::DeleteSnapshotRequest>,
    ) -> Result<Response<csi::DeleteSnapshotResponse>, Status> {
        Err(unimplemented("DeleteSnapshot"))
    }

    async fn list_snapshots(
        &self,
        _request: Request<csi::ListSnapshotsRequest>,
    ) -> Result<Response<csi::ListSnapshotsResponse>, Status> {
        Err(unimplemented("ListSnapshots"))
    }

    async fn controller_expand_volume(
        &self,
        _request: Request<csi::ControllerExpandVolumeRequest>,
    ) -> Result<Response<csi::ControllerExpandVolumeResponse>, Status> {
        Err(unimplemented("ControllerExpandVolume"))
    }

    async fn controller_get_volume(
        &self,
        _request: Request<csi::ControllerGetVolumeRequest>,
    ) -> Result<Response<csi::ControllerGetVolumeResponse>, Status> {
        Err(unimplemented("ControllerGetVolume"))
    }
}
