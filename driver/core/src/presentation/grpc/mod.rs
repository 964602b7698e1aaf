// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! CSI gRPC services
//!
//! One handler type per CSI role, composed in [`server`]:
//! - [`identity::IdentityService`] - plugin name, capabilities, probe
//! - [`controller::ControllerService`] - volume lifecycle on the Hyper-V host
//! - [`node::NodeService`] - mount/unmount on the worker VM
//!
//! # Architecture
//!
//! - **Layer:** Presentation Layer
//! - **Purpose:** Protocol conversion and error-to-status mapping

use std::time::Duration;

use tonic::metadata::MetadataMap;
use tonic::Status;
use tracing::debug;

use crate::application::controller::ControllerError;
use crate::application::node::NodeError;
use crate::domain::remote::TransportError;
use crate::domain::volume::{AccessMode, AccessType, VolumeCapability};

pub mod controller;
pub mod identity;
pub mod node;
pub mod server;

// Generated protobuf code
pub mod csi {
    tonic::include_proto!("csi.v1");
}

use csi::volume_capability;

/// Remaining time the caller gave this request, from `grpc-timeout`
pub fn request_timeout(metadata: &MetadataMap) -> Option<Duration> {
    let value = metadata.get("grpc-timeout")?.to_str().ok()?;
    if value.len() < 2 {
        return None;
    }
    let (digits, unit) = value.split_at(value.len() - 1);
    let amount: u64 = digits.parse().ok()?;
    match unit {
        "H" => Some(Duration::from_secs(amount.saturating_mul(3600))),
        "M" => Some(Duration::from_secs(amount.saturating_mul(60))),
        "S" => Some(Duration::from_secs(amount)),
        "m" => Some(Duration::from_millis(amount)),
        "u" => Some(Duration::from_micros(amount)),
        "n" => Some(Duration::from_nanos(amount)),
        _ => None,
    }
}

/// Deadline for work done on behalf of a request: the configured limit,
/// shortened to the caller's own timeout when that is tighter
pub fn effective_deadline(metadata: &MetadataMap, configured: Duration) -> Duration {
    match request_timeout(metadata) {
        Some(caller) => caller.min(configured),
        None => configured,
    }
}

/// Requests that carry secrets; logged with the secrets removed
pub(crate) trait Redacted: Clone {
    fn redacted(&self) -> Self;
}

macro_rules! redact_secrets {
    ($($request:ty),* $(,)?) => {
        $(
            impl Redacted for $request {
                fn redacted(&self) -> Self {
                    let mut request = self.clone();
                    request.secrets.clear();
                    request
                }
            }
        )*
    };
}

redact_secrets!(
    csi::CreateVolumeRequest,
    csi::DeleteVolumeRequest,
    csi::ControllerPublishVolumeRequest,
    csi::ControllerUnpublishVolumeRequest,
    csi::ValidateVolumeCapabilitiesRequest,
    csi::NodePublishVolumeRequest,
);

pub(crate) fn log_request<T: std::fmt::Debug>(method: &'static str, request: &T) {
    debug!(method = method, request = ?request, "received request");
}

pub(crate) fn unimplemented(method: &str) -> Status {
    Status::unimplemented(format!("{} not implemented", method))
}

// ============================================================================
// Capability conversion
// ============================================================================

pub fn capability_from_proto(capability: &csi::VolumeCapability) -> VolumeCapability {
    use volume_capability::access_mode::Mode;

    let access_mode = match capability.access_mode.as_ref().map(|m| m.mode()) {
        Some(Mode::SingleNodeWriter) => AccessMode::SingleNodeWriter,
        Some(Mode::SingleNodeReaderOnly) => AccessMode::SingleNodeReaderOnly,
        Some(Mode::MultiNodeReaderOnly) => AccessMode::MultiNodeReaderOnly,
        Some(Mode::MultiNodeSingleWriter) => AccessMode::MultiNodeSingleWriter,
        Some(Mode::MultiNodeMultiWriter) => AccessMode::MultiNodeMultiWriter,
        Some(Mode::Unknown) | None => AccessMode::Unknown,
    };

    let access_type = match &capability.access_type {
        Some(volume_capability::AccessType::Mount(mount)) => AccessType::Mount {
            fs_type: mount.fs_type.clone(),
            mount_flags: mount.mount_flags.clone(),
        },
        Some(volume_capability::AccessType::Block(_)) => AccessType::Block,
        None => AccessType::Unspecified,
    };

    VolumeCapability {
        access_mode,
        access_type,
    }
}

pub fn capability_to_proto(capability: &VolumeCapability) -> csi::VolumeCapability {
    use volume_capability::access_mode::Mode;

    let mode = match capability.access_mode {
        AccessMode::SingleNodeWriter => Mode::SingleNodeWriter,
        AccessMode::SingleNodeReaderOnly => Mode::SingleNodeReaderOnly,
        AccessMode::MultiNodeReaderOnly => Mode::MultiNodeReaderOnly,
        AccessMode::MultiNodeSingleWriter => Mode::MultiNodeSingleWriter,
        AccessMode::MultiNodeMultiWriter => Mode::MultiNodeMultiWriter,
        AccessMode::Unknown => Mode::Unknown,
    };

    let access_type = match &capability.access_type {
        AccessType::Mount {
            fs_type,
            mount_flags,
        } => Some(volume_capability::AccessType::Mount(
            volume_capability::MountVolume {
                fs_type: fs_type.clone(),
                mount_flags: mount_flags.clone(),
            },
        )),
        AccessType::Block => Some(volume_capability::AccessType::Block(
            volume_capability::BlockVolume {},
        )),
        AccessType::Unspecified => None,
    };

    csi::VolumeCapability {
        access_type,
        access_mode: Some(volume_capability::AccessMode { mode: mode as i32 }),
    }
}

// ============================================================================
// Error mapping
// ============================================================================

impl From<ControllerError> for Status {
    fn from(err: ControllerError) -> Self {
        let message = err.to_string();
        match &err {
            ControllerError::InvalidArgument(msg) => Status::invalid_argument(msg.clone()),
            ControllerError::NotFound(_) => Status::not_found(message),
            ControllerError::Transport {
                source: TransportError::Timeout(_),
                ..
            } => Status::deadline_exceeded(message),
            ControllerError::Transport { .. } => Status::unavailable(message),
            ControllerError::Remote { .. }
            | ControllerError::Decode { .. }
            | ControllerError::Chain(_) => Status::internal(message),
        }
    }
}

impl From<NodeError> for Status {
    fn from(err: NodeError) -> Self {
        let message = err.to_string();
        match &err {
            NodeError::InvalidArgument(msg) => Status::invalid_argument(msg.clone()),
            NodeError::NotFound(_) | NodeError::DeviceNotFound { .. } => Status::not_found(message),
            NodeError::AmbiguousDevice { .. } | NodeError::Command { .. } | NodeError::Io { .. } => {
                Status::internal(message)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tonic::Code;

    fn metadata(timeout: &str) -> MetadataMap {
        let mut map = MetadataMap::new();
        map.insert("grpc-timeout", timeout.parse().unwrap());
        map
    }

    #[test]
    fn test_request_timeout_units() {
        assert_eq!(request_timeout(&metadata("30S")), Some(Duration::from_secs(30)));
        assert_eq!(request_timeout(&metadata("2M")), Some(Duration::from_secs(120)));
        assert_eq!(request_timeout(&metadata("1500m")), Some(Duration::from_millis(1500)));
        assert_eq!(request_timeout(&metadata("10x")), None);
        assert_eq!(request_timeout(&MetadataMap::new()), None);
    }

    #[test]
    fn test_effective_deadline_takes_tighter_bound() {
        let configured = Duration::from_secs(120);
        assert_eq!(effective_deadline(&metadata("15S"), configured), Duration::from_secs(15));
        assert_eq!(effective_deadline(&metadata("1H"), configured), configured);
        assert_eq!(effective_deadline(&MetadataMap::new(), configured), configured);
    }

    #[test]
    fn test_capability_conversion() {
        let proto = capability_to_proto(&VolumeCapability::single_node_writer_mount());
        assert_eq!(
            proto.access_mode.as_ref().map(|m| m.mode()),
            Some(volume_capability::access_mode::Mode::SingleNodeWriter)
        );
        assert_eq!(capability_from_proto(&proto), VolumeCapability::single_node_writer_mount());

        let block = csi::VolumeCapability {
            access_type: Some(volume_capability::AccessType::Block(volume_capability::BlockVolume {})),
            access_mode: None,
        };
        let converted = capability_from_proto(&block);
        assert_eq!(converted.access_type, AccessType::Block);
        assert_eq!(converted.access_mode, AccessMode::Unknown);
    }

    #[test]
    fn test_controller_error_codes() {
        let status: Status = ControllerError::InvalidArgument("volume id is required".into()).into();
        assert_eq!(status.code(), Code::InvalidArgument);

        let status: Status = ControllerError::Transport {
            operation: "DeleteVolume",
            source: TransportError::Timeout(Duration::from_secs(5)),
        }
        .into();
        assert_eq!(status.code(), Code::DeadlineExceeded);

        let status: Status = ControllerError::Transport {
            operation: "DeleteVolume",
            source: TransportError::Unauthorized,
        }
        .into();
        assert_eq!(status.code(), Code::Unavailable);

        let status: Status = ControllerError::Remote {
            operation: "DeleteVolume",
            exit_code: 1,
            output: "in use".into(),
        }
        .into();
        assert_eq!(status.code(), Code::Internal);
        assert!(status.message().contains("exit code 1"));
        assert!(status.message().contains("in use"));
    }

    #[test]
    fn test_node_error_codes() {
        let status: Status = NodeError::NotFound("mount failed".into()).into();
        assert_eq!(status.code(), Code::NotFound);
        let status: Status = NodeError::Command {
            program: "mkfs".into(),
            status: Some(1),
            output: "bad superblock".into(),
        }
        .into();
        assert_eq!(status.code(), Code::Internal);
    }

    #[test]
    fn test_redacted_drops_secrets() {
        let mut request = csi::DeleteVolumeRequest {
            volume_id: "abc".into(),
            ..Default::default()
        };
        request.secrets.insert("password".into(), "hunter2".into());
        assert!(!format!("{:?}", request.redacted()).contains("hunter2"));
    }
}
