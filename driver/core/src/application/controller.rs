// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Volume Lifecycle Controller
//!
//! Turns CSI controller requests into PowerShell commands on the Hyper-V
//! host and interprets their textual results:
//! - Domain layer: VolumeId naming, capacity rules, differencing chains
//! - Infrastructure layer: PowerShellGateway
//!
//! Every command is safe to re-run. Whether a failed-looking result is
//! really a failure is decided by one `classify_*` function per command.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::domain::remote::{ExecResult, TransportError};
use crate::domain::vhd_chain::{resolve_leaf, ChainEntry, ChainError};
use crate::domain::volume::{
    resolve_capacity, temp_token, Volume, VolumeCapability, VolumeFileName, VolumeId,
    VolumePaths, VOLUME_FILE_EXTENSION, VOLUME_FILE_PREFIX,
};
use crate::infrastructure::powershell::{ps_single_quote, PowerShellGateway};

/// Printed by the delete path when the image is still attached to a VM
pub const DELETE_ATTACHED_PHRASE: &str = "failed to delete attached volume";

/// Printed by `Add-VMHardDiskDrive` when the image is already on the VM (sic)
pub const ATTACH_ALREADY_CONNECTED_PHRASE: &str = "The disk is already connect to the virtual machine";

/// Printed by `Get-VMHardDiskDrive` when the VM does not exist
pub const DETACH_VM_NOT_FOUND_PHRASE: &str = "unable to find a virtual machine";

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("{operation} failed with exit code {exit_code}: {output}")]
    Remote {
        operation: &'static str,
        exit_code: i32,
        output: String,
    },

    #[error("{operation} could not reach the Hyper-V host: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: TransportError,
    },

    #[error("unexpected output from {operation}: {detail}")]
    Decode {
        operation: &'static str,
        detail: String,
    },

    #[error(transparent)]
    Chain(#[from] ChainError),
}

/// Successful outcome of a remote command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The command did what was asked
    Done,
    /// The target state already held; carries the phrase that said so
    AlreadyDone(&'static str),
}

fn transport_failure(operation: &'static str, result: &ExecResult) -> Option<ControllerError> {
    result
        .transport_error
        .clone()
        .map(|source| ControllerError::Transport { operation, source })
}

fn remote_failure(operation: &'static str, result: &ExecResult) -> ControllerError {
    ControllerError::Remote {
        operation,
        exit_code: result.exit_code,
        output: result.output.clone(),
    }
}

/// Plain commands: zero exit is success, anything else fails
pub fn classify_plain(operation: &'static str, result: &ExecResult) -> Result<Outcome, ControllerError> {
    if let Some(e) = transport_failure(operation, result) {
        return Err(e);
    }
    if result.exit_code != 0 {
        return Err(remote_failure(operation, result));
    }
    Ok(Outcome::Done)
}

/// `Remove-Item` of a volume's images.
///
/// The attached-volume phrase fails the call even with exit code zero.
pub fn classify_delete(result: &ExecResult) -> Result<Outcome, ControllerError> {
    const OP: &str = "DeleteVolume";
    if let Some(e) = transport_failure(OP, result) {
        return Err(e);
    }
    if result.output_contains(DELETE_ATTACHED_PHRASE) {
        return Err(remote_failure(OP, result));
    }
    if result.exit_code != 0 {
        return Err(remote_failure(OP, result));
    }
    Ok(Outcome::Done)
}

/// `Add-VMHardDiskDrive`.
///
/// Already-connected is success whatever the exit code.
pub fn classify_attach(result: &ExecResult) -> Result<Outcome, ControllerError> {
    const OP: &str = "ControllerPublishVolume";
    if let Some(e) = transport_failure(OP, result) {
        return Err(e);
    }
    if result.output_contains(ATTACH_ALREADY_CONNECTED_PHRASE) {
        return Ok(Outcome::AlreadyDone(ATTACH_ALREADY_CONNECTED_PHRASE));
    }
    if result.exit_code != 0 {
        return Err(remote_failure(OP, result));
    }
    Ok(Outcome::Done)
}

/// `Get-VMHardDiskDrive | Remove-VMHardDiskDrive`.
///
/// A missing VM has nothing attached, so that phrase is success.
pub fn classify_detach(result: &ExecResult) -> Result<Outcome, ControllerError> {
    const OP: &str = "ControllerUnpublishVolume";
    if let Some(e) = transport_failure(OP, result) {
        return Err(e);
    }
    if result.exit_code != 0 {
        if result.output_contains(DETACH_VM_NOT_FOUND_PHRASE) {
            return Ok(Outcome::AlreadyDone(DETACH_VM_NOT_FOUND_PHRASE));
        }
        return Err(remote_failure(OP, result));
    }
    Ok(Outcome::Done)
}

// ============================================================================
// Service Trait
// ============================================================================

/// Parameters of a CreateVolume request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CreateVolumeParams {
    pub name: String,
    pub required_bytes: i64,
    pub limit_bytes: i64,
    pub capabilities: Vec<VolumeCapability>,
}

#[async_trait]
pub trait VolumeLifecycle: Send + Sync {
    /// Ids of every volume image under the root, in host order
    async fn list_volumes(&self, deadline: Duration) -> Result<Vec<VolumeId>, ControllerError>;

    async fn create_volume(
        &self,
        params: CreateVolumeParams,
        deadline: Duration,
    ) -> Result<Volume, ControllerError>;

    async fn delete_volume(&self, volume_id: &str, deadline: Duration) -> Result<(), ControllerError>;

    /// Attach the volume's leaf image to the node's VM
    async fn publish_volume(
        &self,
        volume_id: &str,
        node_id: &str,
        deadline: Duration,
    ) -> Result<(), ControllerError>;

    async fn unpublish_volume(
        &self,
        volume_id: &str,
        node_id: &str,
        deadline: Duration,
    ) -> Result<(), ControllerError>;
}

/// Project requested capabilities onto the one the driver supports.
///
/// Each single-node-writer request is confirmed as a plain mount; anything
/// else is left out of the confirmed set.
pub fn confirm_capabilities(requested: &[VolumeCapability]) -> Vec<VolumeCapability> {
    requested
        .iter()
        .filter(|c| c.access_mode == crate::domain::volume::AccessMode::SingleNodeWriter)
        .map(|_| VolumeCapability::single_node_writer_mount())
        .collect()
}

// ============================================================================
// Hyper-V Implementation
// ============================================================================

pub struct VolumeController {
    gateway: Arc<PowerShellGateway>,
    paths: VolumePaths,
}

impl VolumeController {
    pub fn new(gateway: Arc<PowerShellGateway>, paths: VolumePaths) -> Self {
        Self { gateway, paths }
    }

    pub fn paths(&self) -> &VolumePaths {
        &self.paths
    }

    fn require<'a>(value: &'a str, field: &str) -> Result<&'a str, ControllerError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(ControllerError::InvalidArgument(format!("{} is required", field)));
        }
        Ok(value)
    }

    fn list_command(&self) -> String {
        format!(
            "Get-Item {} | Select-Object -ExpandProperty Name",
            ps_single_quote(&self.paths.listing_pattern())
        )
    }

    fn create_command(&self, temp_path: &str, capacity_bytes: i64) -> String {
        format!(
            "$p = {}; $id = (New-VHD -Path $p -SizeBytes {} -Dynamic).DiskIdentifier.ToLower(); \
             Move-Item $p (Join-Path -Path (Split-Path -Parent $p) -ChildPath \"{}${{id}}{}\"); echo $id",
            ps_single_quote(temp_path),
            capacity_bytes,
            VOLUME_FILE_PREFIX,
            VOLUME_FILE_EXTENSION
        )
    }

    fn delete_command(&self, id: &VolumeId) -> String {
        format!(
            "Remove-Item -Force ({}+'*')",
            ps_single_quote(&self.paths.image_prefix(id))
        )
    }

    fn chain_command(&self, id: &VolumeId) -> String {
        format!(
            "ConvertTo-Json @(Get-VHD ({}+'*') | Select-Object ParentPath, Path)",
            ps_single_quote(&self.paths.image_prefix(id))
        )
    }

    fn attach_command(&self, node_id: &str, image_path: &str) -> String {
        format!(
            "Add-VMHardDiskDrive -VMName {} -ControllerType SCSI -ControllerNumber 0 -Path {}",
            ps_single_quote(node_id),
            ps_single_quote(image_path)
        )
    }

    fn detach_command(&self, node_id: &str, id: &VolumeId) -> String {
        format!(
            "Get-VMHardDiskDrive -VMName {} | Where-Object {{$_.Path -like {}}} | Remove-VMHardDiskDrive",
            ps_single_quote(node_id),
            ps_single_quote(&format!("*{}*", id))
        )
    }
}

/// Volume ids out of `Get-Item ... -ExpandProperty Name` output
pub fn parse_volume_listing(output: &str) -> Vec<VolumeId> {
    output
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let id = VolumeFileName::parse(line);
            if id.is_none() {
                debug!(file = %line, "Skipping image outside the volume naming convention");
            }
            id
        })
        .collect()
}

/// Chain records out of `ConvertTo-Json` output, which is an array for
/// several images, a bare object for one, and empty for none
pub fn parse_chain_entries(output: &str) -> Result<Vec<ChainEntry>, serde_json::Error> {
    let output = output.trim();
    if output.is_empty() {
        return Ok(Vec::new());
    }
    match serde_json::from_str::<Vec<ChainEntry>>(output) {
        Ok(entries) => Ok(entries),
        Err(_) => serde_json::from_str::<ChainEntry>(output).map(|entry| vec![entry]),
    }
}

#[async_trait]
impl VolumeLifecycle for VolumeController {
    async fn list_volumes(&self, deadline: Duration) -> Result<Vec<VolumeId>, ControllerError> {
        let result = self.gateway.run(&self.list_command(), deadline).await;
        if let Err(e) = classify_plain("ListVolumes", &result) {
            error!(exit_code = result.exit_code, output = %result.output, "Error listing volumes");
            return Err(e);
        }

        let volumes = parse_volume_listing(&result.output);
        debug!(count = volumes.len(), "Listed volumes");
        Ok(volumes)
    }

    async fn create_volume(
        &self,
        params: CreateVolumeParams,
        deadline: Duration,
    ) -> Result<Volume, ControllerError> {
        let name = Self::require(&params.name, "volume name")?;

        let unsupported: Vec<&VolumeCapability> =
            params.capabilities.iter().filter(|c| !c.is_supported()).collect();
        if !unsupported.is_empty() {
            info!(capabilities = ?unsupported, "Unsupported volume capabilities requested");
            return Err(ControllerError::InvalidArgument(
                "only single-node-writer mount access is supported".to_string(),
            ));
        }

        let token = temp_token(name).map_err(|e| ControllerError::InvalidArgument(e.to_string()))?;
        let capacity = resolve_capacity(params.required_bytes, params.limit_bytes);
        let temp_path = self.paths.temp_path(token);

        info!(name = %name, path = %temp_path, size = capacity, "Creating volume");

        let result = self
            .gateway
            .run(&self.create_command(&temp_path, capacity), deadline)
            .await;
        if let Err(e) = classify_plain("CreateVolume", &result) {
            error!(exit_code = result.exit_code, output = %result.output, "New-VHD failed");
            return Err(e);
        }

        let echoed = result.output.trim_matches(&['\r', '\n'][..]);
        let id = VolumeId::from_string(echoed).map_err(|_| {
            error!(output = %echoed, "Unexpected New-VHD output, expected a disk identifier");
            ControllerError::Decode {
                operation: "CreateVolume",
                detail: "expected a parseable disk identifier".to_string(),
            }
        })?;

        let volume = Volume::new(id, &self.paths, capacity);
        info!(volume_id = %volume.id, path = %volume.host_path, "Created volume");
        Ok(volume)
    }

    async fn delete_volume(&self, volume_id: &str, deadline: Duration) -> Result<(), ControllerError> {
        let raw_id = Self::require(volume_id, "volume id")?;
        let Ok(id) = VolumeId::from_string(raw_id) else {
            info!(volume_id = %raw_id, "Volume id is not a disk identifier, nothing to delete");
            return Ok(());
        };

        let result = self.gateway.run(&self.delete_command(&id), deadline).await;
        match classify_delete(&result) {
            Ok(_) => {
                info!(volume_id = %id, "Deleted volume");
                Ok(())
            }
            Err(e) => {
                error!(volume_id = %id, exit_code = result.exit_code, output = %result.output, "Error deleting volume");
                Err(e)
            }
        }
    }

    async fn publish_volume(
        &self,
        volume_id: &str,
        node_id: &str,
        deadline: Duration,
    ) -> Result<(), ControllerError> {
        let raw_id = Self::require(volume_id, "volume id")?;
        let node_id = Self::require(node_id, "node id")?;
        let id = VolumeId::from_string(raw_id)
            .map_err(|_| ControllerError::NotFound(format!("volume {}", raw_id)))?;

        // One deadline covers both the chain query and the attach
        let started = Instant::now();
        let result = self.gateway.run(&self.chain_command(&id), deadline).await;
        if let Err(e) = classify_plain("ControllerPublishVolume", &result) {
            info!(volume_id = %id, exit_code = result.exit_code, output = %result.output, "Error querying disk chain");
            return Err(e);
        }

        let entries = parse_chain_entries(&result.output).map_err(|e| {
            warn!(volume_id = %id, output = %result.output, "Couldn't parse disk chain JSON");
            ControllerError::Decode {
                operation: "ControllerPublishVolume",
                detail: e.to_string(),
            }
        })?;

        let leaf = match resolve_leaf(&entries) {
            Ok(leaf) => leaf,
            Err(ChainError::Empty) => {
                return Err(ControllerError::NotFound(format!("volume {}", id)));
            }
            Err(e) => {
                error!(volume_id = %id, entries = ?entries, error = %e, "Unusable disk chain");
                return Err(e.into());
            }
        };

        info!(vhd = %leaf, node = %node_id, "Attaching vhd");
        let result = self
            .gateway
            .run(
                &self.attach_command(node_id, &leaf),
                deadline.saturating_sub(started.elapsed()),
            )
            .await;
        match classify_attach(&result)? {
            Outcome::Done => info!(volume_id = %id, node = %node_id, "Attached volume"),
            Outcome::AlreadyDone(_) => {
                info!(volume_id = %id, node = %node_id, "Volume already attached")
            }
        }
        Ok(())
    }

    async fn unpublish_volume(
        &self,
        volume_id: &str,
        node_id: &str,
        deadline: Duration,
    ) -> Result<(), ControllerError> {
        let raw_id = Self::require(volume_id, "volume id")?;
        let node_id = Self::require(node_id, "node id")?;
        let Ok(id) = VolumeId::from_string(raw_id) else {
            info!(volume_id = %raw_id, "Volume id is not a disk identifier, nothing to detach");
            return Ok(());
        };

        let result = self
            .gateway
            .run(&self.detach_command(node_id, &id), deadline)
            .await;
        match classify_detach(&result)? {
            Outcome::Done => info!(volume_id = %id, node = %node_id, "Detached volume"),
            Outcome::AlreadyDone(phrase) => {
                info!(volume_id = %id, node = %node_id, reason = %phrase, "Volume already detached")
            }
        }
        Ok(())
    }
}
