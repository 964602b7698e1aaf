// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

pub mod clixml;
pub mod powershell;
pub mod ntlm;
pub mod winrm;
pub mod host;
pub mod metrics;

pub use clixml::CliXmlDecoder;
pub use host::LinuxHost;
pub use powershell::PowerShellGateway;
pub use winrm::WinRmShell;
