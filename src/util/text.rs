use std::borrow::Cow;

/// Removes C0 control characters, DEL and ANSI escape sequences.
///
/// Tabs, newlines and carriage returns are kept. Returns `Cow::Borrowed`
/// when nothing needs stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    let needs_strip = s.chars().any(is_stripped);
    if !needs_strip {
        return Cow::Borrowed(s);
    }

    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '\u{1b}' {
            // CSI sequence: ESC [ params... final byte in 0x40..=0x7e
            if chars.peek() == Some(&'[') {
                chars.next();
                for c in chars.by_ref() {
                    if ('\u{40}'..='\u{7e}').contains(&c) {
                        break;
                    }
                }
            }
            continue;
        }
        if !is_stripped(c) {
            out.push(c);
        }
    }
    Cow::Owned(out)
}

fn is_stripped(c: char) -> bool {
    c == '\u{1b}' || c == '\u{7f}' || (c < '\u{20}' && !matches!(c, '\t' | '\n' | '\r'))
}

/// Sanitizes a user-supplied display name (group names, query feed titles).
///
/// Returns `None` when nothing but whitespace remains.
pub fn sanitize_name(name: &str) -> Option<String> {
    let stripped = strip_control_chars(name);
    let trimmed = stripped.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_owned())
    }
}

/// Flattens an HTML fragment into plain text.
///
/// Tags are dropped, block-level tags become line breaks, the common named
/// entities are decoded and runs of whitespace collapse to a single space.
/// Feed summaries are frequently HTML; this is what gets stored as the
/// feed's summary.
pub fn html_to_text(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut in_tag = false;
    let mut tag = String::new();

    for c in html.chars() {
        match c {
            '<' => {
                in_tag = true;
                tag.clear();
            }
            '>' if in_tag => {
                in_tag = false;
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();
                if matches!(name.as_str(), "p" | "br" | "div" | "li" | "h1" | "h2" | "h3") {
                    text.push('\n');
                }
            }
            _ if in_tag => tag.push(c),
            _ => text.push(c),
        }
    }

    let decoded = decode_entities(&text);
    let lines: Vec<String> = decoded
        .lines()
        .map(|line| line.split_whitespace().collect::<Vec<_>>().join(" "))
        .filter(|line| !line.is_empty())
        .collect();
    lines.join("\n")
}

fn decode_entities(s: &str) -> Cow<'_, str> {
    if !s.contains('&') {
        return Cow::Borrowed(s);
    }
    Cow::Owned(
        s.replace("&nbsp;", " ")
            .replace("&lt;", "<")
            .replace("&gt;", ">")
            .replace("&quot;", "\"")
            .replace("&#39;", "'")
            .replace("&apos;", "'")
            .replace("&amp;", "&"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_clean_text_returns_borrowed() {
        let input = "Hello, world!";
        let result = strip_control_chars(input);
        assert!(matches!(result, Cow::Borrowed(_)));
        assert_eq!(result, input);
    }

    #[test]
    fn test_strip_preserves_tabs_newlines_cr() {
        let input = "line1\nline2\ttabbed\r\nwindows";
        assert_eq!(strip_control_chars(input), input);
    }

    #[test]
    fn test_strip_removes_controls_and_csi() {
        let input = "he\x00ll\x07o \x1b[31mred\x1b[0m\x7f!";
        assert_eq!(strip_control_chars(input), "hello red!");
    }

    #[test]
    fn test_sanitize_name_rejects_blank() {
        assert_eq!(sanitize_name("  \x07 \t"), None);
        assert_eq!(sanitize_name("  Tech \n").as_deref(), Some("Tech"));
    }

    #[test]
    fn test_html_to_text() {
        let html = "<p>Hello <b>world</b></p><p>Second&nbsp;&amp; last</p>";
        assert_eq!(html_to_text(html), "Hello world\nSecond & last");
    }

    #[test]
    fn test_html_to_text_plain_passthrough() {
        assert_eq!(html_to_text("just   text"), "just text");
    }
}
