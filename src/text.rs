use std::borrow::Cow;

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(ch),
        }
    }
    out
}

pub fn normalize_line_endings(input: &str) -> Cow<'_, str> {
    if input.contains('\r') {
        Cow::Owned(input.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(input)
    }
}

/// Collapses every whitespace run to a single space and trims both ends.
pub fn collapse_whitespace(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_space = false;
    for ch in input.chars() {
        if ch.is_whitespace() {
            pending_space = !out.is_empty();
            continue;
        }
        if pending_space {
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }
    out
}

/// Lowercased extension of a file name, if it has a plausible one.
pub fn file_extension(name: &str) -> Option<String> {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    let (stem, ext) = base.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 8 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

pub fn strip_extension(name: &str) -> &str {
    match file_extension(name) {
        Some(ext) => &name[..name.len() - ext.len() - 1],
        None => name,
    }
}

pub fn file_stem(name: &str) -> &str {
    let base = name.rsplit(['/', '\\']).next().unwrap_or(name);
    strip_extension(base)
}

pub fn is_word_char(ch: char) -> bool {
    ch.is_alphanumeric() || ch == '_'
}

/// Characters that markdown consumes as syntax and that never reach the
/// rendered text on their own.
pub fn is_formatting_punct(ch: char) -> bool {
    matches!(ch, '*' | '_' | '~' | '`' | '$')
}

pub fn byte_to_utf16(text: &str, byte: usize) -> usize {
    let byte = floor_char_boundary(text, byte);
    text[..byte].encode_utf16().count()
}

pub fn utf16_to_byte(text: &str, units: usize) -> usize {
    let mut seen = 0;
    for (idx, ch) in text.char_indices() {
        if seen >= units {
            return idx;
        }
        seen += ch.len_utf16();
    }
    text.len()
}

pub fn char_to_byte(text: &str, chars: usize) -> usize {
    text.char_indices()
        .nth(chars)
        .map(|(idx, _)| idx)
        .unwrap_or(text.len())
}

pub fn byte_to_char(text: &str, byte: usize) -> usize {
    let byte = floor_char_boundary(text, byte);
    text[..byte].chars().count()
}

pub fn floor_char_boundary(text: &str, byte: usize) -> usize {
    let mut byte = byte.min(text.len());
    while !text.is_char_boundary(byte) {
        byte -= 1;
    }
    byte
}

pub fn truncate_chars(text: &str, max: usize) -> &str {
    &text[..char_to_byte(text, max)]
}

/// Byte length of the char starting at `byte`, or 0 at the end of `text`.
pub fn char_len_at(text: &str, byte: usize) -> usize {
    text.get(byte..)
        .and_then(|rest| rest.chars().next())
        .map(char::len_utf8)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escape_html_covers_markup_and_quotes() {
        assert_eq!(
            escape_html(r#"<a href="x">Tom & 'Jerry'</a>"#),
            "&lt;a href=&quot;x&quot;&gt;Tom &amp; &#39;Jerry&#39;&lt;/a&gt;"
        );
    }

    #[test]
    fn normalize_line_endings_converts_crlf_and_cr() {
        assert!(matches!(normalize_line_endings("a\nb"), Cow::Borrowed(_)));
        assert_eq!(normalize_line_endings("a\r\nb\rc").as_ref(), "a\nb\nc");
    }

    #[test]
    fn collapse_whitespace_trims_and_merges_runs() {
        assert_eq!(collapse_whitespace("  Hello \n\t world  "), "Hello world");
        assert_eq!(collapse_whitespace("   "), "");
    }

    #[test]
    fn extension_detection_ignores_dotfiles_and_odd_suffixes() {
        assert_eq!(file_extension("notes/Plan.MD"), Some("md".to_string()));
        assert_eq!(file_extension(".gitignore"), None);
        assert_eq!(file_extension("v1.2 draft"), None);
        assert_eq!(strip_extension("paper.pdf"), "paper");
        assert_eq!(file_stem("a/b/Daily Log.md"), "Daily Log");
    }

    #[test]
    fn utf16_conversions_round_trip_over_astral_chars() {
        let text = "a😀b";
        assert_eq!(byte_to_utf16(text, 5), 3);
        assert_eq!(utf16_to_byte(text, 3), 5);
        assert_eq!(byte_to_utf16(text, 2), 1);
    }

    #[test]
    fn char_helpers_respect_boundaries() {
        let text = "héllo";
        assert_eq!(char_to_byte(text, 2), 3);
        assert_eq!(byte_to_char(text, 2), 1);
        assert_eq!(truncate_chars(text, 2), "hé");
        assert_eq!(char_len_at(text, 1), 2);
        assert_eq!(char_len_at(text, text.len()), 0);
    }
}
