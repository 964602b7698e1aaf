// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Node-side mount model and the host capability it runs against

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Filesystem used when the publish request names none
pub const DEFAULT_FS_TYPE: &str = "ext4";

/// Where and how an attached volume should be mounted on the node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTarget {
    pub target_path: PathBuf,
    pub fs_type: String,
    pub mount_flags: Vec<String>,
}

impl MountTarget {
    /// Build a target, falling back to [`DEFAULT_FS_TYPE`] for an empty type
    pub fn new(target_path: impl Into<PathBuf>, fs_type: &str, mount_flags: Vec<String>) -> Self {
        let fs_type = if fs_type.trim().is_empty() {
            DEFAULT_FS_TYPE.to_string()
        } else {
            fs_type.trim().to_string()
        };
        Self {
            target_path: target_path.into(),
            fs_type,
            mount_flags,
        }
    }

    /// Mount flags as a single `-o` argument, if any
    pub fn mount_options(&self) -> Option<String> {
        let flags: Vec<&str> = self
            .mount_flags
            .iter()
            .map(|f| f.trim())
            .filter(|f| !f.is_empty())
            .collect();
        if flags.is_empty() {
            None
        } else {
            Some(flags.join(","))
        }
    }
}

/// Exit status and captured streams of a local process
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// `None` when the process was killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr).trim().to_string()
    }
}

/// Local machine operations the node provisioner needs
#[async_trait]
pub trait NodeHost: Send + Sync {
    /// Paths matching a glob pattern, sorted
    async fn find_devices(&self, pattern: &str) -> io::Result<Vec<PathBuf>>;

    async fn path_exists(&self, path: &Path) -> bool;

    /// Resolve symlinks (e.g. a by-id link to its `/dev/sdX` node)
    async fn canonicalize(&self, path: &Path) -> io::Result<PathBuf>;

    /// Create a directory and its parents with mode 0700
    async fn create_dir_all(&self, path: &Path) -> io::Result<()>;

    async fn remove_dir(&self, path: &Path) -> io::Result<()>;

    /// Run a program to completion, capturing its output
    async fn run(&self, program: &str, args: &[String]) -> io::Result<ProcessOutput>;
}
