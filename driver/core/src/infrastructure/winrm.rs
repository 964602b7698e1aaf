// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! WinRM Remote Shell
//!
//! Implements [`RemoteShell`] over WS-Management (SOAP over HTTP/HTTPS), the
//! transport Hyper-V hosts expose for remote PowerShell. Requests authenticate
//! with NTLMv2 (the default) or Basic.
//!
//! # Message sequence per command
//!
//! - `Create` - open a `cmd` shell, returns a ShellId
//! - `Command` - start the command line in that shell, returns a CommandId
//! - `Receive` - poll base64 stdout/stderr chunks until `CommandState/Done`
//! - `Signal terminate` - release the command
//! - `Delete` - close the shell
//!
//! A fresh shell per command keeps one command's leftovers out of the next.
//! Payloads are not sealed, so a plain HTTP endpoint needs
//! `AllowUnencrypted="true"`. Basic auth additionally needs `Basic="true"`.
//!
//! # NTLM
//!
//! Every SOAP request runs its own handshake: an empty POST carrying the
//! NEGOTIATE message, then the real POST carrying AUTHENTICATE. NTLM
//! authenticates the connection, so the client keeps a single idle
//! connection per host and both POSTs reuse it.

use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use quick_xml::escape::escape;
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::driver_config::{WinRmAuth, WinRmConfig};
use crate::domain::remote::{RawOutput, RemoteShell, TransportError};
use crate::infrastructure::ntlm::{self, Challenge, Credentials};

const NS_DECLS: &str = concat!(
    r#"xmlns:s="http://www.w3.org/2003/05/soap-envelope" "#,
    r#"xmlns:a="http://schemas.xmlsoap.org/ws/2004/08/addressing" "#,
    r#"xmlns:w="http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd" "#,
    r#"xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell""#,
);

const RESOURCE_CMD: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";
const STATE_DONE_SUFFIX: &str = "CommandState/Done";

/// WSManFault code for a Receive that saw no output before OperationTimeout
const FAULT_OPERATION_TIMEOUT: &str = "2150858793";

const MAX_ENVELOPE_SIZE: u32 = 153_600;

/// Longest a single Receive poll is allowed to block on the host
const RECEIVE_POLL: Duration = Duration::from_secs(20);

/// WinRM client for one Hyper-V host
pub struct WinRmShell {
    client: Client,
    url: String,
    auth: WinRmAuth,
    credentials: Credentials,
    username: String,
    password: String,
}

impl WinRmShell {
    /// Build a client from validated configuration, loading the extra CA if set
    pub async fn from_config(config: &WinRmConfig) -> Result<Self, TransportError> {
        let mut builder = Client::builder().pool_max_idle_per_host(1);

        if let Some(ca_file) = &config.ca_file {
            debug!(ca_file = %ca_file.display(), "Using non-default CA file for WinRM");
            let pem = tokio::fs::read(ca_file).await.map_err(|e| {
                TransportError::Http(format!("couldn't read CA file {}: {}", ca_file.display(), e))
            })?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| TransportError::Http(format!("invalid CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Http(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            url: config.endpoint.wsman_url(),
            auth: config.auth,
            credentials: Credentials::new(&config.username, &config.password),
            username: config.username.clone(),
            password: config.password.clone(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn request(&self, timeout: Duration) -> RequestBuilder {
        self.client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/soap+xml;charset=UTF-8")
            .timeout(timeout)
    }

    async fn post(&self, envelope: String, timeout: Duration) -> Result<String, TransportError> {
        let response = match self.auth {
            WinRmAuth::Basic => self
                .request(timeout)
                .basic_auth(&self.username, Some(&self.password))
                .body(envelope)
                .send()
                .await
                .map_err(|e| send_error(e, timeout))?,
            WinRmAuth::Ntlm => self.send_ntlm(envelope, timeout).await?,
        };

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            return Err(TransportError::Unauthorized);
        }

        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        if let Some(fault) = parse_fault(&body) {
            return Err(TransportError::Protocol(fault.to_string()));
        }
        if !status.is_success() {
            return Err(TransportError::Http(format!("HTTP {}", status)));
        }

        Ok(body)
    }

    async fn send_ntlm(&self, envelope: String, timeout: Duration) -> Result<Response, TransportError> {
        let negotiate = self
            .request(timeout)
            .header(AUTHORIZATION, negotiate_header(&ntlm::negotiate_message()))
            .body(Vec::<u8>::new())
            .send()
            .await
            .map_err(|e| send_error(e, timeout))?;

        let status = negotiate.status();
        let token = ntlm_challenge(negotiate.headers());
        // Drain the body so the connection goes back to the pool for the next POST
        let _ = negotiate.bytes().await;

        if status != StatusCode::UNAUTHORIZED {
            return Err(TransportError::Http(format!(
                "NTLM negotiation answered with HTTP {}",
                status
            )));
        }
        let token = token.ok_or(TransportError::Unauthorized)?;
        let challenge = Challenge::parse(&token).map_err(|e| TransportError::Protocol(e.to_string()))?;
        let authenticate = ntlm::authenticate_message(&self.credentials, &challenge)
            .map_err(|e| TransportError::Protocol(e.to_string()))?;

        self.request(timeout)
            .header(AUTHORIZATION, negotiate_header(&authenticate))
            .body(envelope)
            .send()
            .await
            .map_err(|e| send_error(e, timeout))
    }

    async fn create_shell(&self, timeout: Duration) -> Result<String, TransportError> {
        let options = concat!(
            r#"<w:OptionSet><w:Option Name="WINRS_NOPROFILE">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_CODEPAGE">65001</w:Option></w:OptionSet>"#,
        );
        let body = "<rsp:Shell><rsp:InputStreams>stdin</rsp:InputStreams>\
                    <rsp:OutputStreams>stdout stderr</rsp:OutputStreams></rsp:Shell>";
        let response = self
            .post(self.envelope(ACTION_CREATE, None, options, body, timeout), timeout)
            .await?;

        element_text(&response, b"ShellId")
            .or_else(|| selector_value(&response, "ShellId"))
            .ok_or_else(|| TransportError::Protocol("Create response carried no ShellId".into()))
    }

    async fn start_command(
        &self,
        shell_id: &str,
        command_line: &str,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let options = concat!(
            r#"<w:OptionSet><w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>"#,
            r#"<w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option></w:OptionSet>"#,
        );
        let body = format!(
            "<rsp:CommandLine><rsp:Command>{}</rsp:Command></rsp:CommandLine>",
            escape(command_line)
        );
        let response = self
            .post(
                self.envelope(ACTION_COMMAND, Some(shell_id), options, &body, timeout),
                timeout,
            )
            .await?;

        element_text(&response, b"CommandId")
            .ok_or_else(|| TransportError::Protocol("Command response carried no CommandId".into()))
    }

    async fn receive_all(
        &self,
        shell_id: &str,
        command_id: &str,
    ) -> Result<RawOutput, TransportError> {
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let body = format!(
            r#"<rsp:Receive><rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream></rsp:Receive>"#,
            escape(command_id)
        );

        loop {
            let envelope = self.envelope(ACTION_RECEIVE, Some(shell_id), "", &body, RECEIVE_POLL);
            let response = match self.post(envelope, RECEIVE_POLL + Duration::from_secs(5)).await {
                Ok(response) => response,
                // Nothing printed within the poll window; the command is still running
                Err(TransportError::Protocol(msg)) if msg.contains(FAULT_OPERATION_TIMEOUT) => continue,
                Err(e) => return Err(e),
            };

            let chunk = parse_receive(&response)?;
            stdout.extend_from_slice(&chunk.stdout);
            stderr.extend_from_slice(&chunk.stderr);

            if chunk.done {
                return Ok(RawOutput {
                    exit_code: chunk.exit_code.unwrap_or(-1),
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                });
            }
        }
    }

    async fn terminate(&self, shell_id: &str, command_id: &str) -> Result<(), TransportError> {
        let body = format!(
            r#"<rsp:Signal CommandId="{}"><rsp:Code>{}</rsp:Code></rsp:Signal>"#,
            escape(command_id),
            SIGNAL_TERMINATE
        );
        let timeout = Duration::from_secs(10);
        self.post(self.envelope(ACTION_SIGNAL, Some(shell_id), "", &body, timeout), timeout)
            .await
            .map(|_| ())
    }

    async fn delete_shell(&self, shell_id: &str) -> Result<(), TransportError> {
        let timeout = Duration::from_secs(10);
        self.post(self.envelope(ACTION_DELETE, Some(shell_id), "", "", timeout), timeout)
            .await
            .map(|_| ())
    }

    fn envelope(
        &self,
        action: &str,
        shell_id: Option<&str>,
        options: &str,
        body: &str,
        timeout: Duration,
    ) -> String {
        let selector = shell_id
            .map(|id| {
                format!(
                    r#"<w:SelectorSet><w:Selector Name="ShellId">{}</w:Selector></w:SelectorSet>"#,
                    escape(id)
                )
            })
            .unwrap_or_default();

        format!(
            concat!(
                r#"<s:Envelope {ns}><s:Header>"#,
                r#"<a:To>{to}</a:To>"#,
                r#"<a:ReplyTo><a:Address s:mustUnderstand="true">http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous</a:Address></a:ReplyTo>"#,
                r#"<w:ResourceURI s:mustUnderstand="true">{resource}</w:ResourceURI>"#,
                r#"<a:Action s:mustUnderstand="true">{action}</a:Action>"#,
                r#"<w:MaxEnvelopeSize s:mustUnderstand="true">{max}</w:MaxEnvelopeSize>"#,
                r#"<a:MessageID>uuid:{id}</a:MessageID>"#,
                r#"<w:Locale xml:lang="en-US" s:mustUnderstand="false"/>"#,
                r#"<w:OperationTimeout>PT{secs}S</w:OperationTimeout>"#,
                r#"{selector}{options}</s:Header><s:Body>{body}</s:Body></s:Envelope>"#,
            ),
            ns = NS_DECLS,
            to = escape(self.url.as_str()),
            resource = RESOURCE_CMD,
            action = action,
            max = MAX_ENVELOPE_SIZE,
            id = Uuid::new_v4().hyphenated().to_string().to_uppercase(),
            secs = timeout.as_secs().max(1),
            selector = selector,
            options = options,
            body = body,
        )
    }
}

#[async_trait]
impl RemoteShell for WinRmShell {
    async fn execute(&self, command_line: &str, deadline: Duration) -> Result<RawOutput, TransportError> {
        let shell_id = self.create_shell(deadline).await?;

        let result = async {
            let command_id = self.start_command(&shell_id, command_line, deadline).await?;
            let output = self.receive_all(&shell_id, &command_id).await;
            if let Err(e) = self.terminate(&shell_id, &command_id).await {
                debug!(error = %e, "Failed to signal command termination");
            }
            output
        }
        .await;

        if let Err(e) = self.delete_shell(&shell_id).await {
            warn!(shell_id = %shell_id, error = %e, "Failed to close WinRM shell");
        }

        result
    }
}

fn send_error(e: reqwest::Error, timeout: Duration) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout(timeout)
    } else {
        TransportError::Http(e.to_string())
    }
}

fn negotiate_header(message: &[u8]) -> String {
    format!("Negotiate {}", BASE64.encode(message))
}

/// NTLM CHALLENGE token from a 401, under either the Negotiate or NTLM scheme
fn ntlm_challenge(headers: &HeaderMap) -> Option<Vec<u8>> {
    headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|value| {
            value
                .strip_prefix("Negotiate ")
                .or_else(|| value.strip_prefix("NTLM "))
        })
        .find_map(|token| BASE64.decode(token.trim()).ok())
}

// ============================================================================
// Response parsing
// ============================================================================

#[derive(Debug, Default, PartialEq, Eq)]
struct ReceiveChunk {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    done: bool,
    exit_code: Option<i32>,
}

fn attribute(e: &BytesStart<'_>, name: &[u8]) -> Option<String> {
    e.attributes()
        .flatten()
        .find(|a| a.key.local_name().as_ref() == name)
        .and_then(|a| a.unescape_value().ok().map(|v| v.into_owned()))
}

/// Text of the first element with the given local name
fn element_text(xml: &str, local_name: &[u8]) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) if e.local_name().as_ref() == local_name => inside = true,
            Ok(Event::Text(t)) if inside => {
                return t.unescape().ok().map(|v| v.trim().to_string());
            }
            Ok(Event::End(_)) if inside => return Some(String::new()),
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

/// Value of `<w:Selector Name="...">`
fn selector_value(xml: &str, name: &str) -> Option<String> {
    let mut reader = Reader::from_str(xml);
    let mut inside = false;
    loop {
        match reader.read_event() {
            Ok(Event::Start(e))
                if e.local_name().as_ref() == b"Selector"
                    && attribute(&e, b"Name").as_deref() == Some(name) =>
            {
                inside = true
            }
            Ok(Event::Text(t)) if inside => {
                return t.unescape().ok().map(|v| v.trim().to_string());
            }
            Ok(Event::Eof) | Err(_) => return None,
            _ => {}
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
struct Fault {
    code: Option<String>,
    message: String,
}

impl std::fmt::Display for Fault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.code {
            Some(code) => write!(f, "WSManFault {}: {}", code, self.message),
            None => write!(f, "SOAP fault: {}", self.message),
        }
    }
}

/// SOAP fault carried by a response, if any
fn parse_fault(xml: &str) -> Option<Fault> {
    let mut reader = Reader::from_str(xml);
    let mut in_fault = false;
    let mut capture = false;
    let mut code = None;
    let mut message = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Fault" => in_fault = true,
                b"WSManFault" => code = attribute(&e, b"Code"),
                b"Text" | b"Message" if in_fault => capture = true,
                _ => {}
            },
            Ok(Event::Text(t)) if capture => {
                if let Ok(text) = t.unescape() {
                    let text = text.trim();
                    if !text.is_empty() {
                        if !message.is_empty() {
                            message.push_str("; ");
                        }
                        message.push_str(text);
                    }
                }
            }
            Ok(Event::End(_)) => capture = false,
            Ok(Event::Eof) | Err(_) => break,
            _ => {}
        }
    }

    in_fault.then_some(Fault { code, message })
}

fn parse_receive(xml: &str) -> Result<ReceiveChunk, TransportError> {
    let mut reader = Reader::from_str(xml);
    let mut chunk = ReceiveChunk::default();
    let mut stream: Option<String> = None;
    let mut in_exit_code = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => match e.local_name().as_ref() {
                b"Stream" => stream = attribute(&e, b"Name"),
                b"CommandState" => {
                    if attribute(&e, b"State").is_some_and(|s| s.ends_with(STATE_DONE_SUFFIX)) {
                        chunk.done = true;
                    }
                }
                b"ExitCode" => in_exit_code = true,
                _ => {}
            },
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"CommandState"
                    && attribute(&e, b"State").is_some_and(|s| s.ends_with(STATE_DONE_SUFFIX))
                {
                    chunk.done = true;
                }
            }
            Ok(Event::Text(t)) => {
                let text = t
                    .unescape()
                    .map_err(|e| TransportError::Protocol(format!("bad Receive response: {}", e)))?;
                if in_exit_code {
                    chunk.exit_code = text.trim().parse().ok();
                } else if let Some(name) = stream.as_deref() {
                    let bytes = BASE64.decode(text.trim()).map_err(|e| {
                        TransportError::Protocol(format!("bad {} stream encoding: {}", name, e))
                    })?;
                    match name {
                        "stdout" => chunk.stdout.extend_from_slice(&bytes),
                        "stderr" => chunk.stderr.extend_from_slice(&bytes),
                        _ => {}
                    }
                }
            }
            Ok(Event::End(_)) => {
                stream = None;
                in_exit_code = false;
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(TransportError::Protocol(format!("bad Receive response: {}", e))),
        }
    }

    Ok(chunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::domain::driver_config::WinRmEndpoint;

    fn config() -> WinRmConfig {
        WinRmConfig {
            endpoint: WinRmEndpoint::parse("http://hv01:5985").unwrap(),
            username: "svc".into(),
            password: "pw".into(),
            auth: WinRmAuth::Basic,
            ca_file: None,
        }
    }

    #[tokio::test]
    async fn test_envelope_contains_selector_and_escaped_body() {
        let shell = WinRmShell::from_config(&config()).await.unwrap();
        assert_eq!(shell.url(), "http://hv01:5985/wsman");

        let body = format!("<rsp:Command>{}</rsp:Command>", escape("a & b"));
        let envelope = shell.envelope(ACTION_COMMAND, Some("SHELL-1"), "", &body, Duration::from_secs(30));
        assert!(envelope.contains(r#"<w:Selector Name="ShellId">SHELL-1</w:Selector>"#));
        assert!(envelope.contains("<rsp:Command>a &amp; b</rsp:Command>"));
        assert!(envelope.contains("<w:OperationTimeout>PT30S</w:OperationTimeout>"));
        assert!(envelope.contains(ACTION_COMMAND));
    }

    #[tokio::test]
    async fn test_missing_ca_file_is_error() {
        let mut config = config();
        config.ca_file = Some("/nonexistent/ca.pem".into());
        assert!(matches!(
            WinRmShell::from_config(&config).await,
            Err(TransportError::Http(_))
        ));
    }

    #[test]
    fn test_parse_create_response() {
        let xml = r#"<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:rsp="http://schemas.microsoft.com/wbem/wsman/1/windows/shell"><s:Body><rsp:Shell><rsp:ShellId>0F9B2C3A-1111</rsp:ShellId></rsp:Shell></s:Body></s:Envelope>"#;
        assert_eq!(element_text(xml, b"ShellId").as_deref(), Some("0F9B2C3A-1111"));
    }

    #[test]
    fn test_parse_selector_fallback() {
        let xml = r#"<s:Envelope xmlns:s="s" xmlns:w="w"><s:Header><w:SelectorSet><w:Selector Name="ShellId">ABC</w:Selector></w:SelectorSet></s:Header></s:Envelope>"#;
        assert_eq!(selector_value(xml, "ShellId").as_deref(), Some("ABC"));
        assert_eq!(element_text(xml, b"ShellId"), None);
    }

    #[test]
    fn test_parse_receive_chunks() {
        let xml = format!(
            r#"<s:Envelope xmlns:s="s" xmlns:rsp="rsp"><s:Body><rsp:ReceiveResponse>
<rsp:Stream Name="stdout" CommandId="C1">{}</rsp:Stream>
<rsp:Stream Name="stderr" CommandId="C1">{}</rsp:Stream>
<rsp:Stream Name="stdout" CommandId="C1" End="true"></rsp:Stream>
<rsp:CommandState CommandId="C1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done"><rsp:ExitCode>3</rsp:ExitCode></rsp:CommandState>
</rsp:ReceiveResponse></s:Body></s:Envelope>"#,
            BASE64.encode("ok\r\n"),
            BASE64.encode("#< CLIXML")
        );
        let chunk = parse_receive(&xml).unwrap();
        assert_eq!(chunk.stdout, b"ok\r\n");
        assert_eq!(chunk.stderr, b"#< CLIXML");
        assert!(chunk.done);
        assert_eq!(chunk.exit_code, Some(3));
    }

    #[test]
    fn test_parse_receive_still_running() {
        let xml = r#"<s:Envelope xmlns:s="s" xmlns:rsp="rsp"><s:Body><rsp:ReceiveResponse><rsp:CommandState CommandId="C1" State="http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Running"/></rsp:ReceiveResponse></s:Body></s:Envelope>"#;
        let chunk = parse_receive(xml).unwrap();
        assert!(!chunk.done);
        assert_eq!(chunk.exit_code, None);
    }

    #[test]
    fn test_parse_fault() {
        let xml = r#"<s:Envelope xmlns:s="s" xmlns:f="f"><s:Body><s:Fault><s:Code><s:Value>s:Receiver</s:Value></s:Code><s:Reason><s:Text xml:lang="en-US">The WS-Management service cannot complete the operation within the time specified in OperationTimeout.</s:Text></s:Reason><s:Detail><f:WSManFault Code="2150858793" Machine="hv01"><f:Message>timed out</f:Message></f:WSManFault></s:Detail></s:Fault></s:Body></s:Envelope>"#;
        let fault = parse_fault(xml).unwrap();
        assert_eq!(fault.code.as_deref(), Some(FAULT_OPERATION_TIMEOUT));
        assert!(fault.to_string().contains(FAULT_OPERATION_TIMEOUT));
        assert!(fault.message.contains("OperationTimeout"));
        assert!(fault.message.ends_with("timed out"));

        assert_eq!(parse_fault("<s:Envelope xmlns:s=\"s\"><s:Body/></s:Envelope>"), None);
    }

    // ------------------------------------------------------------------------
    // Full exchanges against a local WS-Management listener
    // ------------------------------------------------------------------------

    use std::sync::{Arc, Mutex};

    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::{TcpListener, TcpStream};

    const DONE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/CommandState/Done";

    #[derive(Debug, Clone)]
    struct Seen {
        action: String,
        authorization: Option<String>,
        body: String,
    }

    struct Reply {
        status: u16,
        headers: Vec<(&'static str, String)>,
        body: String,
    }

    impl Reply {
        fn soap(body: &str) -> Self {
            Self {
                status: 200,
                headers: Vec::new(),
                body: format!(r#"<s:Envelope xmlns:s="s" xmlns:rsp="rsp"><s:Body>{}</s:Body></s:Envelope>"#, body),
            }
        }

        fn fault(code: &str) -> Self {
            Self {
                status: 500,
                headers: Vec::new(),
                body: format!(
                    r#"<s:Envelope xmlns:s="s" xmlns:f="f"><s:Body><s:Fault><s:Reason><s:Text>failed</s:Text></s:Reason><s:Detail><f:WSManFault Code="{}"><f:Message>failed</f:Message></f:WSManFault></s:Detail></s:Fault></s:Body></s:Envelope>"#,
                    code
                ),
            }
        }

        fn status(status: u16) -> Self {
            Self {
                status,
                headers: Vec::new(),
                body: String::new(),
            }
        }
    }

    type Responder = Box<dyn FnMut(&Seen) -> Reply + Send>;

    struct Listener {
        url: String,
        seen: Arc<Mutex<Vec<Seen>>>,
    }

    impl Listener {
        async fn start(respond: impl FnMut(&Seen) -> Reply + Send + 'static) -> Self {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            let port = listener.local_addr().unwrap().port();
            let seen = Arc::new(Mutex::new(Vec::new()));
            let respond: Responder = Box::new(respond);
            let respond = Arc::new(Mutex::new(respond));

            let recorded = seen.clone();
            tokio::spawn(async move {
                while let Ok((stream, _)) = listener.accept().await {
                    tokio::spawn(serve_connection(stream, recorded.clone(), respond.clone()));
                }
            });

            Self {
                url: format!("http://127.0.0.1:{}", port),
                seen,
            }
        }

        fn actions(&self) -> Vec<String> {
            self.seen.lock().unwrap().iter().map(|s| s.action.clone()).collect()
        }

        fn seen(&self) -> Vec<Seen> {
            self.seen.lock().unwrap().clone()
        }
    }

    async fn serve_connection(
        stream: TcpStream,
        seen: Arc<Mutex<Vec<Seen>>>,
        respond: Arc<Mutex<Responder>>,
    ) {
        let mut reader = BufReader::new(stream);
        loop {
            let mut line = String::new();
            if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                return;
            }

            let mut content_length = 0;
            let mut authorization = None;
            loop {
                line.clear();
                if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
                    return;
                }
                let header = line.trim_end();
                if header.is_empty() {
                    break;
                }
                if let Some((name, value)) = header.split_once(':') {
                    match name.to_ascii_lowercase().as_str() {
                        "content-length" => content_length = value.trim().parse().unwrap_or(0),
                        "authorization" => authorization = Some(value.trim().to_string()),
                        _ => {}
                    }
                }
            }

            let mut body = vec![0u8; content_length];
            if reader.read_exact(&mut body).await.is_err() {
                return;
            }
            let body = String::from_utf8_lossy(&body).into_owned();
            let request = Seen {
                action: action_name(&body),
                authorization,
                body,
            };

            let reply = {
                let mut respond = respond.lock().unwrap();
                (*respond)(&request)
            };
            seen.lock().unwrap().push(request);

            let mut response = format!(
                "HTTP/1.1 {} X\r\nContent-Type: application/soap+xml\r\nContent-Length: {}\r\n",
                reply.status,
                reply.body.len()
            );
            for (name, value) in &reply.headers {
                response.push_str(&format!("{}: {}\r\n", name, value));
            }
            response.push_str("\r\n");
            response.push_str(&reply.body);
            if reader.get_mut().write_all(response.as_bytes()).await.is_err() {
                return;
            }
        }
    }

    /// Last path segment of the SOAP action, empty for a bodiless request
    fn action_name(body: &str) -> String {
        body.split_once(r#"<a:Action s:mustUnderstand="true">"#)
            .and_then(|(_, rest)| rest.split_once("</a:Action>"))
            .and_then(|(action, _)| action.rsplit('/').next())
            .unwrap_or_default()
            .to_string()
    }

    fn stream(name: &str, text: &str) -> String {
        format!(r#"<rsp:Stream Name="{}" CommandId="C1">{}</rsp:Stream>"#, name, BASE64.encode(text))
    }

    fn shell_against(url: &str, auth: WinRmAuth) -> WinRmConfig {
        WinRmConfig {
            endpoint: WinRmEndpoint::parse(url).unwrap(),
            username: "HV01\\svc".into(),
            password: "pw".into(),
            auth,
            ca_file: None,
        }
    }

    /// Replies for a command that prints in two chunks, with an idle poll in between
    fn scripted_host() -> impl FnMut(&Seen) -> Reply + Send + 'static {
        let mut receives = 0;
        move |request: &Seen| match request.action.as_str() {
            "Create" => Reply::soap("<rsp:Shell><rsp:ShellId>S1</rsp:ShellId></rsp:Shell>"),
            "Command" => Reply::soap("<rsp:CommandResponse><rsp:CommandId>C1</rsp:CommandId></rsp:CommandResponse>"),
            "Receive" => {
                receives += 1;
                match receives {
                    1 => Reply::fault(FAULT_OPERATION_TIMEOUT),
                    2 => Reply::soap(&format!(
                        "<rsp:ReceiveResponse>{}{}</rsp:ReceiveResponse>",
                        stream("stdout", "first "),
                        stream("stderr", "warning")
                    )),
                    _ => Reply::soap(&format!(
                        r#"<rsp:ReceiveResponse>{}<rsp:CommandState CommandId="C1" State="{}"><rsp:ExitCode>0</rsp:ExitCode></rsp:CommandState></rsp:ReceiveResponse>"#,
                        stream("stdout", "second"),
                        DONE
                    )),
                }
            }
            _ => Reply::soap(""),
        }
    }

    #[tokio::test]
    async fn test_rejected_credentials_are_unauthorized() {
        let host = Listener::start(|_: &Seen| Reply::status(401)).await;
        let shell = WinRmShell::from_config(&shell_against(&host.url, WinRmAuth::Basic))
            .await
            .unwrap();

        let result = shell.execute("hostname", Duration::from_secs(5)).await;
        assert_eq!(result, Err(TransportError::Unauthorized));

        let seen = host.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].action, "Create");
        assert_eq!(
            seen[0].authorization.as_deref(),
            Some(format!("Basic {}", BASE64.encode("HV01\\svc:pw")).as_str())
        );
    }

    #[tokio::test]
    async fn test_idle_receive_is_polled_again_and_streams_accumulate() {
        let host = Listener::start(scripted_host()).await;
        let shell = WinRmShell::from_config(&shell_against(&host.url, WinRmAuth::Basic))
            .await
            .unwrap();

        let output = shell.execute("hostname", Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.exit_code, 0);
        assert_eq!(output.stdout, "first second");
        assert_eq!(output.stderr, "warning");
        assert_eq!(output.combined(), "first secondwarning");

        assert_eq!(
            host.actions(),
            ["Create", "Command", "Receive", "Receive", "Receive", "Signal", "Delete"]
        );
        assert!(host.seen()[1].body.contains("<rsp:Command>hostname</rsp:Command>"));
    }

    #[tokio::test]
    async fn test_shell_is_deleted_when_command_fails() {
        let host = Listener::start(|request: &Seen| match request.action.as_str() {
            "Create" => Reply::soap("<rsp:Shell><rsp:ShellId>S1</rsp:ShellId></rsp:Shell>"),
            "Command" => Reply::fault("2150859002"),
            _ => Reply::soap(""),
        })
        .await;
        let shell = WinRmShell::from_config(&shell_against(&host.url, WinRmAuth::Basic))
            .await
            .unwrap();

        let result = shell.execute("hostname", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(TransportError::Protocol(msg)) if msg.contains("2150859002")));
        assert_eq!(host.actions(), ["Create", "Command", "Delete"]);
        assert!(host.seen()[2].body.contains(r#"<w:Selector Name="ShellId">S1</w:Selector>"#));
    }

    #[tokio::test]
    async fn test_ntlm_handshake_precedes_every_request() {
        let mut host_replies = scripted_host();
        let host = Listener::start(move |request: &Seen| {
            let token = request
                .authorization
                .as_deref()
                .and_then(|value| value.strip_prefix("Negotiate "))
                .and_then(|token| BASE64.decode(token).ok())
                .unwrap_or_default();
            match token.get(8) {
                Some(1) => {
                    let mut challenge = Vec::new();
                    challenge.extend_from_slice(b"NTLMSSP\0");
                    challenge.extend_from_slice(&2u32.to_le_bytes());
                    challenge.extend_from_slice(&[0, 0, 0, 0, 48, 0, 0, 0]);
                    challenge.extend_from_slice(&0x0080_0201u32.to_le_bytes());
                    challenge.extend_from_slice(&[7; 8]);
                    challenge.extend_from_slice(&[0; 8]);
                    challenge.extend_from_slice(&[4, 0, 4, 0, 48, 0, 0, 0]);
                    challenge.extend_from_slice(&[0; 4]);
                    Reply {
                        status: 401,
                        headers: vec![("WWW-Authenticate", format!("Negotiate {}", BASE64.encode(challenge)))],
                        body: String::new(),
                    }
                }
                Some(3) if ntlm::security_buffer(&token, 36) == Some(&[b's', 0, b'v', 0, b'c', 0][..]) => {
                    host_replies(request)
                }
                _ => Reply::status(401),
            }
        })
        .await;
        let shell = WinRmShell::from_config(&shell_against(&host.url, WinRmAuth::Ntlm))
            .await
            .unwrap();

        let output = shell.execute("hostname", Duration::from_secs(5)).await.unwrap();
        assert_eq!(output.stdout, "first second");

        let seen = host.seen();
        assert_eq!(seen.len(), 14);
        for pair in seen.chunks(2) {
            assert_eq!(pair[0].action, "");
            assert!(pair[0].body.is_empty());
            assert_ne!(pair[1].action, "");
        }
        assert_eq!(seen.last().map(|s| s.action.as_str()), Some("Delete"));
    }

    #[tokio::test]
    async fn test_ntlm_without_challenge_is_unauthorized() {
        let host = Listener::start(|_: &Seen| Reply::status(401)).await;
        let shell = WinRmShell::from_config(&shell_against(&host.url, WinRmAuth::Ntlm))
            .await
            .unwrap();

        assert_eq!(
            shell.execute("hostname", Duration::from_secs(5)).await,
            Err(TransportError::Unauthorized)
        );
        assert_eq!(host.actions(), [""]);
    }
}
