// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Driver Configuration Types
//
// Validated process configuration, built by the binary from flags and
// environment variables before any service is constructed:
// - Service role (controller or node)
// - WinRM endpoint, credentials and auth scheme for the Hyper-V host
// - Image root and command timeout
// - Node identity

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::volume::DEFAULT_VOLUME_ROOT;

/// WinRM HTTP listener port, used when `WINRM_HOST` carries no port
pub const DEFAULT_WINRM_PORT: u16 = 5985;

pub const DEFAULT_CSI_ADDRESS: &str = "/run/csi/socket";

pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(120);

/// Deadline for the startup connectivity check
pub const STARTUP_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Which CSI services this process serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceRole {
    /// Identity + Controller, talks to the Hyper-V host
    Controller,
    /// Identity + Node, runs on every worker VM
    Node,
}

impl FromStr for ServiceRole {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "controller" => Ok(Self::Controller),
            // "driver" is the historical name of the node role
            "node" | "driver" => Ok(Self::Node),
            other => Err(ConfigError::InvalidRole(other.to_string())),
        }
    }
}

impl fmt::Display for ServiceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Controller => write!(f, "controller"),
            Self::Node => write!(f, "node"),
        }
    }
}

/// How the WinRM client authenticates to the host
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WinRmAuth {
    /// NTLMv2 handshake, accepted by a default WinRM listener
    #[default]
    Ntlm,
    /// Requires `Basic="true"` in the WinRM service auth settings
    Basic,
}

impl FromStr for WinRmAuth {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ntlm" | "negotiate" => Ok(Self::Ntlm),
            "basic" => Ok(Self::Basic),
            other => Err(ConfigError::InvalidAuth(other.to_string())),
        }
    }
}

impl fmt::Display for WinRmAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ntlm => write!(f, "ntlm"),
            Self::Basic => write!(f, "basic"),
        }
    }
}

/// WS-Management endpoint of the Hyper-V host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WinRmEndpoint {
    pub https: bool,
    pub host: String,
    pub port: u16,
}

impl WinRmEndpoint {
    /// Parse `WINRM_HOST`: `http://host[:port]`, `https://host[:port]` or a bare host.
    ///
    /// A missing port defaults to 5985 for both schemes.
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(ConfigError::Missing("WINRM_HOST"));
        }
        let with_scheme = if raw.contains("://") {
            raw.to_string()
        } else {
            format!("http://{}", raw)
        };

        let url = reqwest::Url::parse(&with_scheme)
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{}: {}", raw, e)))?;
        let https = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ConfigError::InvalidEndpoint(format!(
                    "unsupported scheme '{}'",
                    other
                )))
            }
        };
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ConfigError::InvalidEndpoint(format!("{}: missing host", raw)))?
            .to_string();

        // Url normalizes :80/:443 away, so look at the authority for an explicit port
        let authority = with_scheme
            .split("://")
            .nth(1)
            .and_then(|rest| rest.split('/').next())
            .unwrap_or_default();
        let explicit_port = authority
            .rsplit_once(':')
            .is_some_and(|(_, p)| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()));
        let port = if explicit_port {
            url.port_or_known_default().unwrap_or(DEFAULT_WINRM_PORT)
        } else {
            DEFAULT_WINRM_PORT
        };

        Ok(Self { https, host, port })
    }

    /// `http(s)://host:port/wsman`
    pub fn wsman_url(&self) -> String {
        format!(
            "{}://{}:{}/wsman",
            if self.https { "https" } else { "http" },
            self.host,
            self.port
        )
    }
}

/// Credentials and TLS material for the WinRM endpoint
#[derive(Clone, Serialize, Deserialize)]
pub struct WinRmConfig {
    pub endpoint: WinRmEndpoint,
    pub username: String,
    pub password: String,

    #[serde(default)]
    pub auth: WinRmAuth,

    /// Extra CA certificate (PEM) trusted for HTTPS endpoints
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,
}

impl fmt::Debug for WinRmConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinRmConfig")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("auth", &self.auth)
            .field("ca_file", &self.ca_file)
            .finish()
    }
}

/// Complete, validated configuration for one driver process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverConfig {
    pub role: ServiceRole,

    /// Unix socket the CSI services listen on
    pub csi_address: PathBuf,

    /// Required for the controller role
    #[serde(skip_serializing_if = "Option::is_none")]
    pub winrm: Option<WinRmConfig>,

    /// Image directory on the Hyper-V host
    pub volume_root: String,

    /// Node identity reported by NodeGetInfo (the VM name on the host)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,

    #[serde(with = "duration_secs")]
    pub command_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            role: ServiceRole::Controller,
            csi_address: PathBuf::from(DEFAULT_CSI_ADDRESS),
            winrm: None,
            volume_root: DEFAULT_VOLUME_ROOT.to_string(),
            node_id: None,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }
}

impl DriverConfig {
    /// Check that everything the selected role needs is present
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.csi_address.as_os_str().is_empty() {
            return Err(ConfigError::Missing("CSI_ADDRESS"));
        }
        if self.command_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout);
        }

        match self.role {
            ServiceRole::Controller => {
                let winrm = self.winrm.as_ref().ok_or(ConfigError::Missing("WINRM_HOST"))?;
                if winrm.username.is_empty() {
                    return Err(ConfigError::Missing("WINRM_USER"));
                }
                if winrm.password.is_empty() {
                    return Err(ConfigError::Missing("WINRM_PASSWORD"));
                }
                if self.volume_root.trim().is_empty() {
                    return Err(ConfigError::Missing("HV_VOLUME_PATH"));
                }
            }
            ServiceRole::Node => {
                if self.node_id.as_deref().map_or(true, |id| id.trim().is_empty()) {
                    return Err(ConfigError::Missing("KUBE_NODE_NAME"));
                }
            }
        }

        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),

    #[error("invalid grpc service '{0}' (expected controller or node)")]
    InvalidRole(String),

    #[error("invalid WinRM endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid WinRM auth '{0}' (expected ntlm or basic)")]
    InvalidAuth(String),

    #[error("command timeout must be greater than zero")]
    InvalidTimeout,
}
