// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Local node host
//!
//! [`NodeHost`] backed by the real machine: `glob` for device discovery,
//! `tokio::fs` for directories and `tokio::process` for the partitioning,
//! formatting and mount utilities.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::mount::{NodeHost, ProcessOutput};

#[derive(Debug, Clone, Default)]
pub struct LinuxHost;

impl LinuxHost {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NodeHost for LinuxHost {
    async fn find_devices(&self, pattern: &str) -> io::Result<Vec<PathBuf>> {
        let pattern = pattern.to_string();
        tokio::task::spawn_blocking(move || {
            let paths = glob::glob(&pattern)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
            let mut found: Vec<PathBuf> = paths.filter_map(Result::ok).collect();
            found.sort();
            Ok(found)
        })
        .await
        .map_err(io::Error::other)?
    }

    async fn path_exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    async fn canonicalize(&self, path: &Path) -> io::Result<PathBuf> {
        tokio::fs::canonicalize(path).await
    }

    async fn create_dir_all(&self, path: &Path) -> io::Result<()> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true).mode(0o700);
        builder.create(path).await
    }

    async fn remove_dir(&self, path: &Path) -> io::Result<()> {
        tokio::fs::remove_dir(path).await
    }

    async fn run(&self, program: &str, args: &[String]) -> io::Result<ProcessOutput> {
        debug!(program = %program, args = ?args, "Running local command");
        let output = Command::new(program).args(args).output().await?;
        let result = ProcessOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        debug!(program = %program, status = ?result.status, output = %result.combined(), "Local command finished");
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_find_devices_sorted() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["wwn-0x600b-5cf4ea41627e", "wwn-0x600a-5cf4ea41627e", "wwn-0x600c-other"] {
            std::fs::write(dir.path().join(name), b"").unwrap();
        }
        let host = LinuxHost::new();
        let pattern = format!("{}/wwn-*5cf4ea41627e", dir.path().display());
        let found = host.find_devices(&pattern).await.unwrap();
        assert_eq!(
            found,
            vec![
                dir.path().join("wwn-0x600a-5cf4ea41627e"),
                dir.path().join("wwn-0x600b-5cf4ea41627e"),
            ]
        );
    }

    #[tokio::test]
    async fn test_create_dir_all_mode_and_remove() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("pods/abc/mount");
        let host = LinuxHost::new();

        host.create_dir_all(&target).await.unwrap();
        assert!(host.path_exists(&target).await);
        let mode = std::fs::metadata(&target).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o700);

        host.remove_dir(&target).await.unwrap();
        assert!(!host.path_exists(&target).await);
    }

    #[tokio::test]
    async fn test_run_captures_status() {
        let host = LinuxHost::new();
        let output = host
            .run("sh", &["-c".to_string(), "echo out; echo err >&2; exit 3".to_string()])
            .await
            .unwrap();
        assert_eq!(output.status, Some(3));
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
    }
}
