// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! Remote PowerShell Gateway
//!
//! Runs PowerShell snippets on the Hyper-V host through a [`RemoteShell`]
//! and hands back decoded output.
//!
//! # Execution model
//!
//! - Commands are wrapped as `powershell.exe -NoProfile -NonInteractive
//!   -EncodedCommand <base64 UTF-16LE>` so no quoting survives the transport.
//! - One command at a time per gateway: the host session is a single shell,
//!   and interleaved commands would mix their captured output.
//! - The deadline covers queueing plus execution. An expired deadline is a
//!   transport failure and is never retried here.

use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tokio::sync::Mutex;
use tracing::debug;

use crate::domain::remote::{ExecResult, RemoteShell, TransportError};
use crate::infrastructure::clixml::CliXmlDecoder;
use crate::infrastructure::metrics;

/// Executes PowerShell on the Hyper-V host, one command at a time
pub struct PowerShellGateway {
    shell: Arc<dyn RemoteShell>,
    decoder: CliXmlDecoder,
    slot: Mutex<()>,
}

impl PowerShellGateway {
    pub fn new(shell: Arc<dyn RemoteShell>) -> Self {
        Self {
            shell,
            decoder: CliXmlDecoder::new(),
            slot: Mutex::new(()),
        }
    }

    /// Run a PowerShell snippet and decode whatever it printed.
    pub async fn run(&self, command: &str, deadline: Duration) -> ExecResult {
        let command_line = wrap_command(command);
        debug!(command = %command, deadline = ?deadline, "Running remote PowerShell command");

        let started = Instant::now();
        let attempt = tokio::time::timeout(deadline, async {
            let _slot = self.slot.lock().await;
            self.shell.execute(&command_line, deadline).await
        })
        .await;
        let elapsed = started.elapsed().as_secs_f64();

        let raw = match attempt {
            Err(_) => {
                metrics::record_remote_command("timeout", elapsed);
                debug!(command = %command, deadline = ?deadline, "Remote PowerShell command timed out");
                return ExecResult::transport_failure(TransportError::Timeout(deadline));
            }
            Ok(Err(e)) => {
                metrics::record_remote_command("transport_error", elapsed);
                debug!(command = %command, error = %e, "Remote PowerShell transport failed");
                return ExecResult::transport_failure(e);
            }
            Ok(Ok(raw)) => raw,
        };

        let combined = raw.combined();
        let captured = combined.trim_matches(&['\r', '\n', '\t', ' '][..]);
        debug!(rc = raw.exit_code, output = %captured, "Remote PowerShell raw output");

        let output = self.decoder.parse(captured);
        debug!(command = %command, rc = raw.exit_code, decoded = %output, "Remote PowerShell decoded output");
        metrics::record_remote_command(
            if raw.exit_code == 0 { "success" } else { "failure" },
            elapsed,
        );

        ExecResult::completed(raw.exit_code, output)
    }
}

/// Full command line for a PowerShell snippet
pub fn wrap_command(command: &str) -> String {
    format!(
        "powershell.exe -NoProfile -NonInteractive -EncodedCommand {}",
        encode_command(command)
    )
}

/// Base64 of the UTF-16LE bytes of `command`, as `-EncodedCommand` expects
pub fn encode_command(command: &str) -> String {
    let bytes: Vec<u8> = command
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect();
    BASE64.encode(bytes)
}

/// PowerShell single-quoted string literal (no interpolation, `'` doubled)
pub fn ps_single_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    use async_trait::async_trait;

    use crate::domain::remote::RawOutput;

    struct FixedShell {
        output: Result<RawOutput, TransportError>,
        delay: Duration,
    }

    #[async_trait]
    impl RemoteShell for FixedShell {
        async fn execute(&self, _command_line: &str, _deadline: Duration) -> Result<RawOutput, TransportError> {
            tokio::time::sleep(self.delay).await;
            self.output.clone()
        }
    }

    fn gateway(output: Result<RawOutput, TransportError>, delay: Duration) -> PowerShellGateway {
        PowerShellGateway::new(Arc::new(FixedShell { output, delay }))
    }

    #[test]
    fn test_encode_command_is_utf16le_base64() {
        let encoded = encode_command("echo ok");
        let bytes = BASE64.decode(encoded).unwrap();
        let units: Vec<u16> = bytes
            .chunks(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(String::from_utf16(&units).unwrap(), "echo ok");
        assert_eq!(encode_command("A"), "QQA=");
    }

    #[test]
    fn test_wrap_command() {
        assert_eq!(
            wrap_command("A"),
            "powershell.exe -NoProfile -NonInteractive -EncodedCommand QQA="
        );
    }

    #[test]
    fn test_single_quote_escaping() {
        assert_eq!(ps_single_quote("V:\\disks"), "'V:\\disks'");
        assert_eq!(ps_single_quote("it's"), "'it''s'");
    }

    #[tokio::test]
    async fn test_run_decodes_clixml() {
        let gateway = gateway(
            Ok(RawOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "#< CLIXML\r\n<Objs><S S=\"Error\">boom_x000D__x000A_</S></Objs>\r\n".into(),
            }),
            Duration::ZERO,
        );
        let result = gateway.run("Get-Thing", Duration::from_secs(1)).await;
        assert_eq!(result, ExecResult::completed(1, "boom"));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for CapturedLog {
        type Writer = CapturedLog;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[tokio::test]
    async fn test_run_logs_command_with_raw_and_decoded_output() {
        let log = CapturedLog::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .with_writer(log.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let gateway = gateway(
            Ok(RawOutput {
                exit_code: 1,
                stdout: String::new(),
                stderr: "#< CLIXML\r\n<Objs><S S=\"Error\">disk_x0020_busy</S></Objs>".into(),
            }),
            Duration::ZERO,
        );
        gateway.run("Get-VHD", Duration::from_secs(1)).await;

        let written = String::from_utf8(log.0.lock().unwrap().clone()).unwrap();
        let decoded = written
            .lines()
            .find(|line| line.contains("Remote PowerShell decoded output"))
            .expect("decoded output is logged");
        assert!(decoded.contains("command=Get-VHD"));
        assert!(decoded.contains("decoded=disk busy"));
        assert!(written.contains("disk_x0020_busy"));
    }

    #[tokio::test]
    async fn test_run_trims_plain_output() {
        let gateway = gateway(
            Ok(RawOutput {
                exit_code: 0,
                stdout: "ok\r\n".into(),
                stderr: String::new(),
            }),
            Duration::ZERO,
        );
        assert_eq!(gateway.run("echo ok", Duration::from_secs(1)).await.output, "ok");
    }

    #[tokio::test]
    async fn test_run_deadline_is_transport_error() {
        let gateway = gateway(Ok(RawOutput::default()), Duration::from_secs(5));
        let result = gateway.run("Start-Sleep 5", Duration::from_millis(20)).await;
        assert_eq!(
            result.transport_error,
            Some(TransportError::Timeout(Duration::from_millis(20)))
        );
        assert!(!result.succeeded());
    }

    #[tokio::test]
    async fn test_run_surfaces_transport_error() {
        let gateway = gateway(Err(TransportError::Unauthorized), Duration::ZERO);
        let result = gateway.run("echo ok", Duration::from_secs(1)).await;
        assert_eq!(result.transport_error, Some(TransportError::Unauthorized));
    }
}
