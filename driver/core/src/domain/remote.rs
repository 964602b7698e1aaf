// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! Remote execution capability
//!
//! The driver only needs one thing from the Hyper-V host: run a command line
//! with a deadline and hand back what it printed and how it exited. How that
//! happens (WinRM, SSH, a test double) lives behind [`RemoteShell`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Output of one remote process, as captured by the transport
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl RawOutput {
    /// Combined stdout followed by stderr
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }
}

#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Execute a command line on the remote host.
    ///
    /// `deadline` is advisory for the transport (e.g. WS-Management operation
    /// timeouts); callers enforce it independently.
    async fn execute(&self, command_line: &str, deadline: Duration)
        -> Result<RawOutput, TransportError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("remote command timed out after {0:?}")]
    Timeout(Duration),

    #[error("remote transport request failed: {0}")]
    Http(String),

    #[error("remote transport protocol error: {0}")]
    Protocol(String),

    #[error("remote host rejected credentials")]
    Unauthorized,
}

/// Result of one remote invocation after output decoding
///
/// A nonzero `exit_code` without a `transport_error` is an ordinary failure
/// whose meaning callers derive from `output`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    pub exit_code: i32,
    pub output: String,
    pub transport_error: Option<TransportError>,
}

impl ExecResult {
    pub fn completed(exit_code: i32, output: impl Into<String>) -> Self {
        Self {
            exit_code,
            output: output.into(),
            transport_error: None,
        }
    }

    pub fn transport_failure(error: TransportError) -> Self {
        Self {
            exit_code: -1,
            output: String::new(),
            transport_error: Some(error),
        }
    }

    /// Completed with exit code zero
    pub fn succeeded(&self) -> bool {
        self.transport_error.is_none() && self.exit_code == 0
    }

    pub fn output_contains(&self, phrase: &str) -> bool {
        self.output.contains(phrase)
    }
}
