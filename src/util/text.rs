use std::borrow::Cow;

/// Maximum number of characters kept from a summary after markup removal.
pub const MAX_SUMMARY_CHARS: usize = 2000;

/// Returns true for bytes that must never reach stored text.
///
/// Tab, newline and carriage return are allowed through.
fn is_control_byte(b: u8) -> bool {
    b == 0x1b || b == 0x7f || (b < 0x20 && b != b'\t' && b != b'\n' && b != b'\r')
}

/// Strips terminal control characters and ANSI escape sequences.
///
/// Source feeds are untrusted and their text ends up in terminals (CLI listing)
/// and in logs. CSI sequences (`ESC [` ... final byte) and OSC sequences
/// (`ESC ]` ... BEL or `ESC \`) are removed whole; other control bytes are
/// dropped individually.
///
/// Returns `Cow::Borrowed` when nothing needs stripping.
pub fn strip_control_chars(s: &str) -> Cow<'_, str> {
    if !s.bytes().any(is_control_byte) {
        return Cow::Borrowed(s);
    }

    let bytes = s.as_bytes();
    let mut out = String::with_capacity(s.len());
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        if b == 0x1b {
            match bytes.get(i + 1) {
                Some(b'[') => {
                    i += 2;
                    while i < bytes.len() {
                        let c = bytes[i];
                        i += 1;
                        if (0x40..=0x7e).contains(&c) {
                            break;
                        }
                    }
                }
                Some(b']') => {
                    i += 2;
                    while i < bytes.len() {
                        if bytes[i] == 0x07 {
                            i += 1;
                            break;
                        }
                        if bytes[i] == 0x1b && bytes.get(i + 1) == Some(&b'\\') {
                            i += 2;
                            break;
                        }
                        i += 1;
                    }
                }
                _ => i += 1,
            }
        } else if is_control_byte(b) {
            i += 1;
        } else {
            let start = i;
            while i < bytes.len() && !is_control_byte(bytes[i]) {
                i += 1;
            }
            // Control bytes are ASCII, so they never split a UTF-8 sequence.
            out.push_str(&s[start..i]);
        }
    }

    Cow::Owned(out)
}

/// Removes HTML markup from a fragment and returns plain text.
///
/// Tags are dropped, the common named entities and numeric entities are
/// decoded, runs of whitespace collapse to a single space, and control
/// characters are stripped from the result. Content of `<script>` and
/// `<style>` elements is not preserved as text either, since feed summaries
/// that carry them are never meant to be read.
pub fn strip_markup(html: &str) -> String {
    let mut text = String::with_capacity(html.len());
    let mut chars = html.chars().peekable();
    let mut skip_until: Option<&'static str> = None;

    while let Some(ch) = chars.next() {
        match ch {
            '<' => {
                let mut tag = String::new();
                for c in chars.by_ref() {
                    if c == '>' {
                        break;
                    }
                    tag.push(c);
                }
                let name = tag
                    .trim_start_matches('/')
                    .split(|c: char| c.is_whitespace() || c == '/')
                    .next()
                    .unwrap_or("")
                    .to_ascii_lowercase();

                if let Some(end) = skip_until {
                    if tag.starts_with('/') && name == end {
                        skip_until = None;
                    }
                    continue;
                }
                match name.as_str() {
                    "script" if !tag.starts_with('/') => skip_until = Some("script"),
                    "style" if !tag.starts_with('/') => skip_until = Some("style"),
                    // Block-level boundaries become whitespace so words do not fuse
                    "br" | "p" | "div" | "li" | "tr" | "h1" | "h2" | "h3" | "h4" | "section" => {
                        text.push(' ')
                    }
                    _ => {}
                }
            }
            _ if skip_until.is_some() => {}
            '&' => {
                let mut entity = String::new();
                let mut terminated = false;
                while let Some(&c) = chars.peek() {
                    if c == ';' {
                        chars.next();
                        terminated = true;
                        break;
                    }
                    if !(c.is_ascii_alphanumeric() || c == '#') || entity.len() > 10 {
                        break;
                    }
                    entity.push(c);
                    chars.next();
                }
                match (terminated, decode_entity(&entity)) {
                    (true, Some(decoded)) => text.push(decoded),
                    _ => {
                        text.push('&');
                        text.push_str(&entity);
                        if terminated {
                            text.push(';');
                        }
                    }
                }
            }
            _ => text.push(ch),
        }
    }

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    strip_control_chars(&collapsed).into_owned()
}

fn decode_entity(entity: &str) -> Option<char> {
    match entity {
        "amp" => Some('&'),
        "lt" => Some('<'),
        "gt" => Some('>'),
        "quot" => Some('"'),
        "apos" | "#39" => Some('\''),
        "nbsp" => Some(' '),
        "hellip" => Some('…'),
        "mdash" => Some('—'),
        "ndash" => Some('–'),
        "ldquo" => Some('“'),
        "rdquo" => Some('”'),
        _ => {
            let digits = entity.strip_prefix('#')?;
            let code = match digits.strip_prefix(['x', 'X']) {
                Some(hex) => u32::from_str_radix(hex, 16).ok()?,
                None => digits.parse().ok()?,
            };
            char::from_u32(code)
        }
    }
}

/// Truncates `s` to at most `max_chars` characters, never splitting a codepoint.
pub fn truncate_chars(s: &str, max_chars: usize) -> Cow<'_, str> {
    match s.char_indices().nth(max_chars) {
        Some((byte_end, _)) => Cow::Owned(s[..byte_end].to_string()),
        None => Cow::Borrowed(s),
    }
}
