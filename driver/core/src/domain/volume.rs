// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Prefix carried by every volume image file on the Hyper-V host.
pub const VOLUME_FILE_PREFIX: &str = "pv-";

/// Extension carried by every volume image file on the Hyper-V host.
pub const VOLUME_FILE_EXTENSION: &str = ".vhdx";

/// Marker inserted after the prefix while an image is being created.
pub const TEMP_FILE_MARKER: &str = "temp-";

/// Capacity used when a create request carries no usable capacity range (20 GiB).
pub const DEFAULT_CAPACITY_BYTES: i64 = 20 * 1024 * 1024 * 1024;

/// Default image root on the Hyper-V host.
pub const DEFAULT_VOLUME_ROOT: &str = "V:\\Hyper-V\\Virtual Hard Disks";

// ============================================================================
// Value Objects
// ============================================================================

/// Unique identifier for a volume
///
/// The identifier is the `DiskIdentifier` Hyper-V assigns to the image when it
/// is created; the driver never chooses it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VolumeId(pub Uuid);

impl VolumeId {
    pub fn from_string(s: &str) -> Result<Self, VolumeError> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| VolumeError::InvalidId(s.to_string()))
    }

    /// Last hyphen-delimited group of the identifier.
    ///
    /// Once the image is attached the guest exposes this group in the disk's
    /// WWN, which is how the node finds the block device.
    pub fn device_suffix(&self) -> String {
        device_suffix(&self.to_string()).to_string()
    }
}

impl std::fmt::Display for VolumeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl std::str::FromStr for VolumeId {
    type Err = VolumeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

/// Segment after the last `-` of a volume id, or the whole id when it has none.
pub fn device_suffix(volume_id: &str) -> &str {
    match volume_id.rfind('-') {
        Some(idx) => &volume_id[idx + 1..],
        None => volume_id,
    }
}

/// File naming convention for volume images: `pv-<id>.vhdx`
pub struct VolumeFileName;

impl VolumeFileName {
    pub fn to_file_name(id: &VolumeId) -> String {
        format!("{}{}{}", VOLUME_FILE_PREFIX, id, VOLUME_FILE_EXTENSION)
    }

    /// Recover the volume id from an image file name.
    ///
    /// Surrounding whitespace and carriage returns left over from the remote
    /// shell's line handling are ignored. Returns `None` for names outside
    /// the convention, including in-flight `pv-temp-*` images.
    pub fn parse(file_name: &str) -> Option<VolumeId> {
        let stem = file_name
            .trim()
            .strip_prefix(VOLUME_FILE_PREFIX)?
            .strip_suffix(VOLUME_FILE_EXTENSION)?;
        if stem.starts_with(TEMP_FILE_MARKER) {
            return None;
        }
        VolumeId::from_string(stem).ok()
    }
}

/// Locations of volume images under the configured root on the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumePaths {
    root: String,
}

impl VolumePaths {
    pub fn new(root: impl Into<String>) -> Self {
        let root = root.into();
        Self {
            root: root.trim_end_matches('\\').to_string(),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Final image path: `<root>\pv-<id>.vhdx`
    pub fn image_path(&self, id: &VolumeId) -> String {
        format!("{}\\{}", self.root, VolumeFileName::to_file_name(id))
    }

    /// Path prefix shared by a volume's base image and its differencing children
    pub fn image_prefix(&self, id: &VolumeId) -> String {
        format!("{}\\{}{}", self.root, VOLUME_FILE_PREFIX, id)
    }

    /// Temporary image path used before the disk identifier is known
    pub fn temp_path(&self, token: &str) -> String {
        format!(
            "{}\\{}{}{}{}",
            self.root, VOLUME_FILE_PREFIX, TEMP_FILE_MARKER, token, VOLUME_FILE_EXTENSION
        )
    }

    /// Glob matching every volume image (`<root>\pv-*.vhdx`)
    pub fn listing_pattern(&self) -> String {
        format!("{}\\{}*{}", self.root, VOLUME_FILE_PREFIX, VOLUME_FILE_EXTENSION)
    }
}

impl Default for VolumePaths {
    fn default() -> Self {
        Self::new(DEFAULT_VOLUME_ROOT)
    }
}

/// Compute the capacity of a new image from a CSI capacity range.
///
/// A positive limit replaces the default and a positive required size
/// replaces both. This mirrors the shipped driver; it is not a clamp into
/// `[required, limit]`.
pub fn resolve_capacity(required_bytes: i64, limit_bytes: i64) -> i64 {
    let mut capacity = DEFAULT_CAPACITY_BYTES;
    if limit_bytes > 0 {
        capacity = limit_bytes;
    }
    if required_bytes > 0 {
        capacity = required_bytes;
    }
    capacity
}

/// Token used to name the temporary image of a create request.
///
/// Contract: the requested volume name has the form `<prefix>-<token>[-...]`
/// (external-provisioner names are `pvc-<uuid>`), and the token is the second
/// hyphen-delimited segment. Names that break the contract are rejected
/// rather than guessed at.
pub fn temp_token(volume_name: &str) -> Result<&str, VolumeError> {
    let token = volume_name
        .split('-')
        .nth(1)
        .filter(|t| !t.is_empty())
        .ok_or_else(|| VolumeError::InvalidName(format!(
            "volume name '{}' has no second hyphen-delimited segment",
            volume_name
        )))?;

    if !token.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(VolumeError::InvalidName(format!(
            "volume name token '{}' must be alphanumeric",
            token
        )));
    }

    Ok(token)
}

/// Volume access mode requested by the orchestrator
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AccessMode {
    SingleNodeWriter,
    SingleNodeReaderOnly,
    MultiNodeReaderOnly,
    MultiNodeSingleWriter,
    MultiNodeMultiWriter,
    Unknown,
}

/// How the volume is exposed to the workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AccessType {
    Mount {
        fs_type: String,
        mount_flags: Vec<String>,
    },
    Block,
    Unspecified,
}

/// One requested volume capability
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeCapability {
    pub access_mode: AccessMode,
    pub access_type: AccessType,
}

impl VolumeCapability {
    /// The only capability the driver offers: single-node writer with a filesystem mount
    pub fn single_node_writer_mount() -> Self {
        Self {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Mount {
                fs_type: String::new(),
                mount_flags: Vec::new(),
            },
        }
    }

    pub fn is_supported(&self) -> bool {
        self.access_mode == AccessMode::SingleNodeWriter
            && self.access_type != AccessType::Block
    }
}

// ============================================================================
// Aggregate: Volume
// ============================================================================

/// A provisioned virtual disk image on the Hyper-V host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub id: VolumeId,

    /// Full image path on the host (`<root>\pv-<id>.vhdx`)
    pub host_path: String,

    pub capacity_bytes: i64,
}

impl Volume {
    pub fn new(id: VolumeId, paths: &VolumePaths, capacity_bytes: i64) -> Self {
        Self {
            id,
            host_path: paths.image_path(&id),
            capacity_bytes,
        }
    }
}

// ============================================================================
// Domain Errors
// ============================================================================

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum VolumeError {
    #[error("Invalid volume id: {0}")]
    InvalidId(String),

    #[error("Invalid volume name: {0}")]
    InvalidName(String),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const ID: &str = "eab72431-5d15-4152-a8d1-5cf4ea41627e";

    #[test]
    fn test_volume_id_from_string() {
        let id = VolumeId::from_string(ID).unwrap();
        assert_eq!(id.to_string(), ID);
        assert!(VolumeId::from_string("not-a-uuid").is_err());
    }

    #[test]
    fn test_device_suffix() {
        let id = VolumeId::from_string(ID).unwrap();
        assert_eq!(id.device_suffix(), "5cf4ea41627e");
        assert_eq!(device_suffix("nohyphen"), "nohyphen");
    }

    #[test]
    fn test_file_name_round_trip() {
        let id = VolumeId::from_string(ID).unwrap();
        let name = VolumeFileName::to_file_name(&id);
        assert_eq!(name, format!("pv-{}.vhdx", ID));
        assert_eq!(VolumeFileName::parse(&name), Some(id));
    }

    #[test]
    fn test_file_name_parse_tolerates_carriage_return() {
        let parsed = VolumeFileName::parse(&format!("pv-{}.vhdx\r", ID));
        assert_eq!(parsed.map(|id| id.to_string()), Some(ID.to_string()));
    }

    #[test]
    fn test_file_name_parse_rejects_foreign_names() {
        assert_eq!(VolumeFileName::parse("pv-temp-b0475d14.vhdx"), None);
        assert_eq!(VolumeFileName::parse(&format!("pvc-{}.vhdx", ID)), None);
        assert_eq!(VolumeFileName::parse(&format!("pv-{}.avhdx", ID)), None);
    }

    #[test]
    fn test_volume_paths() {
        let paths = VolumePaths::new("D:\\disks\\");
        let id = VolumeId::from_string(ID).unwrap();
        assert_eq!(paths.root(), "D:\\disks");
        assert_eq!(paths.image_path(&id), format!("D:\\disks\\pv-{}.vhdx", ID));
        assert_eq!(paths.image_prefix(&id), format!("D:\\disks\\pv-{}", ID));
        assert_eq!(paths.temp_path("b0475d14"), "D:\\disks\\pv-temp-b0475d14.vhdx");
        assert_eq!(paths.listing_pattern(), "D:\\disks\\pv-*.vhdx");
    }

    #[test]
    fn test_resolve_capacity_precedence() {
        assert_eq!(resolve_capacity(0, 0), DEFAULT_CAPACITY_BYTES);
        assert_eq!(resolve_capacity(0, 5_000_000_000), 5_000_000_000);
        assert_eq!(resolve_capacity(9_000_000_000, 5_000_000_000), 9_000_000_000);
        assert_eq!(resolve_capacity(3_000_000_000, 0), 3_000_000_000);
        assert_eq!(resolve_capacity(-1, -1), DEFAULT_CAPACITY_BYTES);
    }

    #[test]
    fn test_temp_token() {
        assert_eq!(temp_token("pvc-b0475d14-782d-4485-b09c-ee93150dca72"), Ok("b0475d14"));
        assert!(temp_token("nohyphen").is_err());
        assert!(temp_token("pvc-").is_err());
        assert!(temp_token("pvc-..\\evil").is_err());
    }

    #[test]
    fn test_capability_support() {
        assert!(VolumeCapability::single_node_writer_mount().is_supported());
        assert!(VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Unspecified,
        }
        .is_supported());
        assert!(!VolumeCapability {
            access_mode: AccessMode::SingleNodeWriter,
            access_type: AccessType::Block,
        }
        .is_supported());
        assert!(!VolumeCapability {
            access_mode: AccessMode::MultiNodeMultiWriter,
            access_type: AccessType::Mount { fs_type: "ext4".into(), mount_flags: vec![] },
        }
        .is_supported());
    }
}
