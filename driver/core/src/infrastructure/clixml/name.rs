// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! XML name unescaping
//!
//! PowerShell serializes characters that are not safe inside XML as
//! `_xHHHH_` (BMP) or `_xHHHHHHHH_` (any codepoint), the same convention as
//! .NET's `XmlConvert.DecodeName`.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::{Captures, Regex};

const ESCAPE_PATTERN: &str = r"_[Xx]([0-9a-fA-F]{4}|[0-9a-fA-F]{8})_";

static SHARED: LazyLock<XmlNameDecoder> = LazyLock::new(XmlNameDecoder::new);

/// Decodes `_xHHHH_` escapes back into characters
#[derive(Debug, Clone)]
pub struct XmlNameDecoder {
    pattern: Regex,
}

impl XmlNameDecoder {
    pub fn new() -> Self {
        Self {
            pattern: Regex::new(ESCAPE_PATTERN).expect("escape pattern is valid"),
        }
    }

    /// Replace every escape with the character it encodes.
    ///
    /// Escapes that do not name a Unicode scalar value (surrogate halves,
    /// values past U+10FFFF) are left untouched.
    pub fn decode<'a>(&self, name: &'a str) -> Cow<'a, str> {
        if name.is_empty() || !name.contains('_') {
            return Cow::Borrowed(name);
        }

        self.pattern.replace_all(name, |caps: &Captures<'_>| {
            u32::from_str_radix(&caps[1], 16)
                .ok()
                .and_then(char::from_u32)
                .map(String::from)
                .unwrap_or_else(|| caps[0].to_string())
        })
    }
}

impl Default for XmlNameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Decode with a process-wide decoder instance
pub fn decode_name(name: &str) -> Cow<'_, str> {
    SHARED.decode(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_underscore_is_borrowed() {
        let decoder = XmlNameDecoder::new();
        assert!(matches!(decoder.decode("plain text"), Cow::Borrowed("plain text")));
        assert_eq!(decoder.decode(""), "");
    }

    #[test]
    fn test_bmp_escape() {
        assert_eq!(decode_name("_x0041_"), "A");
        assert_eq!(decode_name("line_x000D__x000A_next"), "line\r\nnext");
        assert_eq!(decode_name("_X0041_"), "A");
    }

    #[test]
    fn test_supplementary_plane_escape() {
        assert_eq!(decode_name("_x0001F64F_"), "\u{1F64F}");
        assert_eq!(decode_name("_x0001f64f_"), "\u{1F64F}");
    }

    #[test]
    fn test_non_matching_text_untouched() {
        assert_eq!(decode_name("snake_case_name"), "snake_case_name");
        assert_eq!(decode_name("_x12_"), "_x12_");
        assert_eq!(decode_name("_x00410_"), "_x00410_");
    }

    #[test]
    fn test_invalid_scalar_left_in_place() {
        assert_eq!(decode_name("_xD83D_"), "_xD83D_");
        assert_eq!(decode_name("a_xFFFFFFFF_b"), "a_xFFFFFFFF_b");
    }
}
