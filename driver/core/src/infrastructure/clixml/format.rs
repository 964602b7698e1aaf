// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

/// Render markup one tag or text run per line, indented by nesting depth.
///
/// Works on text that failed to parse, so it never validates: unclosed tags
/// and stray closing tags only shift the indentation.
pub fn format_markup(markup: &str) -> String {
    let mut lines: Vec<String> = Vec::new();
    let mut depth: usize = 0;
    let mut rest = markup.trim();

    while !rest.is_empty() {
        if rest.starts_with('<') {
            let end = rest.find('>').map(|i| i + 1).unwrap_or(rest.len());
            let tag = &rest[..end];
            rest = &rest[end..];

            if tag.starts_with("</") {
                depth = depth.saturating_sub(1);
                lines.push(indent(depth, tag));
            } else if tag.ends_with("/>") || tag.starts_with("<?") || tag.starts_with("<!") {
                lines.push(indent(depth, tag));
            } else {
                lines.push(indent(depth, tag));
                depth += 1;
            }
        } else {
            let end = rest.find('<').unwrap_or(rest.len());
            let text = rest[..end].trim();
            rest = &rest[end..];
            if !text.is_empty() {
                lines.push(indent(depth, text));
            }
        }
    }

    lines.join("\n")
}

fn indent(depth: usize, text: &str) -> String {
    format!("{}{}", "  ".repeat(depth), text)
}
