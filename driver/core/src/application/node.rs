// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Node Block-Device Provisioner
//!
//! Brings an attached Hyper-V disk from raw block device to mounted
//! filesystem on the worker VM:
//!
//! ```text
//! discover ──> partition ──> format ──> mount
//! (by-id glob)  (parted)     (mkfs)     (mount)
//! ```
//!
//! Each step checks whether it already happened, so a publish that died
//! half-way is finished by the next one. Calls for the same target path are
//! serialized.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::mount::{MountTarget, NodeHost, ProcessOutput};
use crate::domain::volume::VolumeId;
use crate::infrastructure::metrics;

/// Where udev publishes stable device links
pub const DEVICE_BY_ID_DIR: &str = "/dev/disk/by-id";

/// SCSI controller slots on a Hyper-V VM, minus those kept for the OS disks
pub const MAX_VOLUMES_PER_NODE: i64 = 64 - 4;

/// `mount`/`umount` exit status for a failed (un)mount
const MOUNT_FAILURE_STATUS: i32 = 32;

/// `blkid` exit status when the requested tag is not present
const BLKID_NOT_FOUND_STATUS: i32 = 2;

const PARTITION_SETTLE_ATTEMPTS: u32 = 10;
const PARTITION_SETTLE_INTERVAL: std::time::Duration = std::time::Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("no block device found for volume {volume_id} (pattern {pattern})")]
    DeviceNotFound { volume_id: String, pattern: String },

    #[error("more than one block device matches volume {volume_id}: {devices:?}")]
    AmbiguousDevice {
        volume_id: String,
        devices: Vec<PathBuf>,
    },

    #[error("{0}")]
    NotFound(String),

    #[error("{program} exited with status {status:?}: {output}")]
    Command {
        program: String,
        status: Option<i32>,
        output: String,
    },

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl NodeError {
    fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    fn command(program: &str, output: &ProcessOutput) -> Self {
        Self::Command {
            program: program.to_string(),
            status: output.status,
            output: output.combined(),
        }
    }
}

pub struct NodeProvisioner {
    host: Arc<dyn NodeHost>,
    node_id: String,
    device_dir: PathBuf,
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl NodeProvisioner {
    pub fn new(host: Arc<dyn NodeHost>, node_id: impl Into<String>) -> Self {
        Self::with_device_dir(host, node_id, DEVICE_BY_ID_DIR)
    }

    /// Provisioner that discovers devices under a different directory
    pub fn with_device_dir(
        host: Arc<dyn NodeHost>,
        node_id: impl Into<String>,
        device_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            host,
            node_id: node_id.into(),
            device_dir: device_dir.into(),
            locks: DashMap::new(),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn max_volumes_per_node(&self) -> i64 {
        MAX_VOLUMES_PER_NODE
    }

    fn lock_for(&self, path: &Path) -> Arc<Mutex<()>> {
        self.locks.entry(path.to_path_buf()).or_default().clone()
    }

    fn release_lock(&self, path: &Path, lock: Arc<Mutex<()>>) {
        drop(lock);
        self.locks.remove_if(path, |_, l| Arc::strong_count(l) == 1);
    }

    /// Discover, partition, format and mount the volume at `target`
    pub async fn publish(&self, volume_id: &str, target: &MountTarget) -> Result<(), NodeError> {
        let volume_id = volume_id.trim();
        if volume_id.is_empty() {
            return Err(NodeError::InvalidArgument("volume id is required".into()));
        }
        // The id ends up in a device glob; only disk identifiers are accepted
        let id = VolumeId::from_string(volume_id).map_err(|_| {
            NodeError::InvalidArgument(format!("volume id {} is not a disk identifier", volume_id))
        })?;
        if target.target_path.as_os_str().is_empty() {
            return Err(NodeError::InvalidArgument("target path is required".into()));
        }

        let lock = self.lock_for(&target.target_path);
        let result = {
            let _guard = lock.lock().await;
            self.publish_locked(&id, target).await
        };
        self.release_lock(&target.target_path, lock);

        metrics::record_node_operation("publish", if result.is_ok() { "success" } else { "failure" });
        result
    }

    async fn publish_locked(&self, volume_id: &VolumeId, target: &MountTarget) -> Result<(), NodeError> {
        let device = self.discover(volume_id).await?;
        let partition = PathBuf::from(format!("{}-part1", device.display()));

        self.ensure_partition(&device, &partition, &target.fs_type).await?;
        self.ensure_filesystem(&partition, &target.fs_type).await?;
        self.ensure_mounted(&partition, target).await?;

        info!(volume_id = %volume_id, partition = %partition.display(), target = %target.target_path.display(), "Volume published");
        Ok(())
    }

    /// Unmount `target_path` and remove the directory
    pub async fn unpublish(&self, volume_id: &str, target_path: &Path) -> Result<(), NodeError> {
        if target_path.as_os_str().is_empty() {
            return Err(NodeError::InvalidArgument("target path is required".into()));
        }

        let lock = self.lock_for(target_path);
        let result = {
            let _guard = lock.lock().await;
            self.unpublish_locked(volume_id, target_path).await
        };
        self.release_lock(target_path, lock);

        metrics::record_node_operation("unpublish", if result.is_ok() { "success" } else { "failure" });
        result
    }

    async fn unpublish_locked(&self, volume_id: &str, target_path: &Path) -> Result<(), NodeError> {
        let output = self.run("umount", vec![path_arg(target_path)]).await?;
        match output.status {
            Some(0) => {}
            Some(MOUNT_FAILURE_STATUS) => {
                debug!(target = %target_path.display(), output = %output.combined(), "Target not mounted");
            }
            _ => return Err(NodeError::command("umount", &output)),
        }

        match self.host.remove_dir(target_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(NodeError::io(
                    format!("failed to remove {}", target_path.display()),
                    e,
                ))
            }
        }

        info!(volume_id = %volume_id, target = %target_path.display(), "Volume unpublished");
        Ok(())
    }

    async fn discover(&self, volume_id: &VolumeId) -> Result<PathBuf, NodeError> {
        let pattern = format!(
            "{}/wwn-*{}",
            glob::Pattern::escape(&self.device_dir.to_string_lossy()),
            glob::Pattern::escape(&volume_id.device_suffix())
        );
        let devices = self
            .host
            .find_devices(&pattern)
            .await
            .map_err(|e| NodeError::io(format!("failed to search {}", pattern), e))?;

        match devices.len() {
            0 => Err(NodeError::DeviceNotFound {
                volume_id: volume_id.to_string(),
                pattern,
            }),
            1 => {
                let device = devices.into_iter().next().unwrap_or_default();
                debug!(volume_id = %volume_id, device = %device.display(), "Discovered block device");
                Ok(device)
            }
            _ => {
                warn!(volume_id = %volume_id, devices = ?devices, "Several block devices match volume");
                Err(NodeError::AmbiguousDevice {
                    volume_id: volume_id.to_string(),
                    devices,
                })
            }
        }
    }

    async fn ensure_partition(&self, device: &Path, partition: &Path, fs_type: &str) -> Result<(), NodeError> {
        if self.host.path_exists(partition).await {
            debug!(partition = %partition.display(), "Partition exists");
            return Ok(());
        }

        info!(device = %device.display(), "Partitioning device");
        let args = vec![
            path_arg(device),
            "--script".into(),
            "-a".into(),
            "optimal".into(),
            "mklabel".into(),
            "gpt".into(),
            "mkpart".into(),
            "primary".into(),
            fs_type.to_string(),
            "0%".into(),
            "100%".into(),
        ];
        let output = self.run("parted", args).await?;
        if !output.success() {
            return Err(NodeError::command("parted", &output));
        }

        // udev creates the -part1 link asynchronously
        for _ in 0..PARTITION_SETTLE_ATTEMPTS {
            if self.host.path_exists(partition).await {
                return Ok(());
            }
            tokio::time::sleep(PARTITION_SETTLE_INTERVAL).await;
        }
        Err(NodeError::NotFound(format!(
            "partition {} did not appear after partitioning",
            partition.display()
        )))
    }

    async fn ensure_filesystem(&self, partition: &Path, fs_type: &str) -> Result<(), NodeError> {
        let args = vec![
            "-o".into(),
            "value".into(),
            "-s".into(),
            "TYPE".into(),
            path_arg(partition),
        ];
        let output = self.run("blkid", args).await?;
        let existing = output.stdout.trim();

        match output.status {
            Some(0) if !existing.is_empty() => {
                if existing != fs_type {
                    info!(partition = %partition.display(), existing = %existing, requested = %fs_type, "Keeping existing filesystem");
                } else {
                    debug!(partition = %partition.display(), fs_type = %existing, "Filesystem exists");
                }
                return Ok(());
            }
            Some(0) | Some(BLKID_NOT_FOUND_STATUS) => {}
            _ => return Err(NodeError::command("blkid", &output)),
        }

        info!(partition = %partition.display(), fs_type = %fs_type, "Formatting partition");
        let output = self
            .run("mkfs", vec!["-t".into(), fs_type.to_string(), path_arg(partition)])
            .await?;
        if !output.success() {
            return Err(NodeError::command("mkfs", &output));
        }
        Ok(())
    }

    async fn ensure_mounted(&self, partition: &Path, target: &MountTarget) -> Result<(), NodeError> {
        let target_path = &target.target_path;
        self.host
            .create_dir_all(target_path)
            .await
            .map_err(|e| NodeError::io(format!("failed to create {}", target_path.display()), e))?;

        let mounted = self
            .run(
                "findmnt",
                vec![
                    "--noheadings".into(),
                    "--output".into(),
                    "SOURCE".into(),
                    "--mountpoint".into(),
                    path_arg(target_path),
                ],
            )
            .await?;
        if mounted.success() {
            let source = mounted.stdout.trim();
            let expected = self.host.canonicalize(partition).await.unwrap_or_else(|_| partition.to_path_buf());
            if Path::new(source) == expected || Path::new(source) == partition {
                debug!(target = %target_path.display(), source = %source, "Already mounted");
                return Ok(());
            }
            return Err(NodeError::Command {
                program: "findmnt".into(),
                status: mounted.status,
                output: format!(
                    "{} is already a mountpoint for {}",
                    target_path.display(),
                    source
                ),
            });
        }

        let mut args = Vec::new();
        if let Some(options) = target.mount_options() {
            args.push("-o".to_string());
            args.push(options);
        }
        args.push(path_arg(partition));
        args.push(path_arg(target_path));

        let output = self.run("mount", args).await?;
        match output.status {
            Some(0) => Ok(()),
            Some(MOUNT_FAILURE_STATUS) => Err(NodeError::NotFound(format!(
                "mount of {} at {} failed: {}",
                partition.display(),
                target_path.display(),
                output.combined()
            ))),
            _ => Err(NodeError::command("mount", &output)),
        }
    }

    async fn run(&self, program: &str, args: Vec<String>) -> Result<ProcessOutput, NodeError> {
        self.host
            .run(program, &args)
            .await
            .map_err(|e| NodeError::io(format!("failed to run {}", program), e))
    }
}

fn path_arg(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}
