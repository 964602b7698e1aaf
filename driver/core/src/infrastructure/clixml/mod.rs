// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

//! PowerShell CLIXML decoding
//!
//! When a remote PowerShell command writes to anything other than the
//! success stream, the remoting layer serializes those records into a
//! CLIXML document on stderr:
//!
//! ```text
//! #< CLIXML
//! <Objs Version="1.1.0.1" xmlns="http://schemas.microsoft.com/powershell/2004/04">
//!   <S S="Error">New-VHD : Failed to create the virtual hard disk._x000D__x000A_</S>
//! </Objs>
//! ```
//!
//! [`CliXmlDecoder`] turns that back into the text an operator would have
//! seen in a console. Plain output passes through untouched.

mod format;
pub mod name;

pub use format::format_markup;
pub use name::{decode_name, XmlNameDecoder};

use quick_xml::events::Event;
use quick_xml::Reader;

/// First line of every CLIXML document
pub const CLIXML_MARKER: &str = "#< CLIXML";

const TRIM_CHARS: &[char] = &['\r', '\n', '\t', ' '];

/// Extracts readable text from CLIXML-enveloped command output
#[derive(Debug, Clone, Default)]
pub struct CliXmlDecoder {
    names: XmlNameDecoder,
}

impl CliXmlDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode captured output.
    ///
    /// Never fails: malformed documents come back as indented markup so the
    /// content still reaches logs and error messages.
    pub fn parse(&self, raw: &str) -> String {
        let trimmed = raw.trim_matches(TRIM_CHARS);
        let Some(body) = trimmed.strip_prefix(CLIXML_MARKER) else {
            return trimmed.to_string();
        };

        match self.extract_strings(body) {
            Ok(strings) => {
                let mut output = String::new();
                for s in strings {
                    output.push_str(&self.names.decode(&s).replace("\r\n", "\n"));
                }
                output.trim_matches(TRIM_CHARS).to_string()
            }
            Err(reason) => {
                tracing::warn!(reason = %reason, "Couldn't parse PowerShell CLIXML output");
                format_markup(body)
            }
        }
    }

    /// Text content of every `<S>` directly under the `<Objs>` root, in document order
    fn extract_strings(&self, body: &str) -> Result<Vec<String>, String> {
        let mut reader = Reader::from_str(body);
        reader.config_mut().trim_text(false);

        let mut strings = Vec::new();
        let mut depth: usize = 0;
        let mut seen_root = false;
        let mut current: Option<String> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(e)) => {
                    let local = e.local_name();
                    if depth == 0 {
                        if seen_root || local.as_ref() != b"Objs" {
                            return Err("expected a single <Objs> root element".into());
                        }
                        seen_root = true;
                    } else if depth == 1 && local.as_ref() == b"S" {
                        current = Some(String::new());
                    }
                    depth += 1;
                }
                Ok(Event::Empty(e)) => {
                    let local = e.local_name();
                    if depth == 0 {
                        if seen_root || local.as_ref() != b"Objs" {
                            return Err("expected a single <Objs> root element".into());
                        }
                        seen_root = true;
                    } else if depth == 1 && local.as_ref() == b"S" {
                        strings.push(String::new());
                    }
                }
                Ok(Event::End(_)) => {
                    depth = depth.saturating_sub(1);
                    if depth == 1 {
                        if let Some(s) = current.take() {
                            strings.push(s);
                        }
                    }
                }
                Ok(Event::Text(t)) => {
                    if let Some(s) = current.as_mut() {
                        if depth == 2 {
                            let text = t.unescape().map_err(|e| e.to_string())?;
                            s.push_str(&text);
                        }
                    } else if depth == 0 && !t.iter().all(|b| b.is_ascii_whitespace()) {
                        return Err("text outside the <Objs> root".into());
                    }
                }
                Ok(Event::CData(t)) => {
                    if let (Some(s), 2) = (current.as_mut(), depth) {
                        s.push_str(&String::from_utf8_lossy(&t));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(e.to_string()),
            }
        }

        if !seen_root {
            return Err("no <Objs> root element".into());
        }
        if depth != 0 {
            return Err("unterminated element".into());
        }

        Ok(strings)
    }
}
