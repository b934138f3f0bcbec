use regex::Regex;
use std::sync::OnceLock;

use super::{Level, Parser, Token, TokenKind};
use crate::anchors::parse_anchor_marker;

fn autolink_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^<((?:https?://|mailto:)[^\s<>]+)>").expect("valid autolink pattern")
    })
}

fn hard_break_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ {2,}\n").expect("valid break pattern"))
}

pub(super) fn lex_inline(parser: &Parser, src: &str) -> Vec<Token> {
    let mut tokens: Vec<Token> = Vec::new();
    let mut pos = 0;
    let mut prev: Option<char> = None;
    while pos < src.len() {
        let rest = &src[pos..];
        let token = next_inline(parser, rest, prev);
        let len = token.raw.len().max(1);
        prev = src[..pos + len].chars().next_back();
        pos += len;
        match tokens.last_mut() {
            Some(last) if last.kind == TokenKind::Text && token.kind == TokenKind::Text => {
                last.raw.push_str(&token.raw);
                last.text.push_str(&token.text);
            }
            _ => tokens.push(token),
        }
    }
    tokens
}

fn next_inline(parser: &Parser, src: &str, prev: Option<char>) -> Token {
    for ext in parser.extensions(Level::Inline) {
        if let Some(token) = ext.tokenize(src) {
            if !token.raw.is_empty() && src.starts_with(&token.raw) {
                return token;
            }
        }
    }
    anchor(src)
        .or_else(|| escape(src))
        .or_else(|| code_span(src))
        .or_else(|| autolink(src))
        .or_else(|| image(parser, src))
        .or_else(|| link(parser, src))
        .or_else(|| strong(parser, src, prev))
        .or_else(|| em(parser, src, prev))
        .or_else(|| del(parser, src))
        .or_else(|| hard_break(src))
        .unwrap_or_else(|| text(parser, src))
}

fn anchor(src: &str) -> Option<Token> {
    let (len, id, title) = parse_anchor_marker(src)?;
    Some(Token::new(TokenKind::Anchor { id, title }, &src[..len], ""))
}

fn escape(src: &str) -> Option<Token> {
    let rest = src.strip_prefix('\\')?;
    let ch = rest.chars().next()?;
    if ch == '\n' {
        return Some(Token::new(TokenKind::Br, &src[..2], ""));
    }
    if !ch.is_ascii_punctuation() {
        return None;
    }
    Some(Token::new(TokenKind::Escape, &src[..1 + ch.len_utf8()], ch.to_string()))
}

fn code_span(src: &str) -> Option<Token> {
    let ticks = src.chars().take_while(|c| *c == '`').count();
    if ticks == 0 {
        return None;
    }
    let body = &src[ticks..];
    let mut search = 0;
    while let Some(found) = body[search..].find('`') {
        let start = search + found;
        let run = body[start..].chars().take_while(|c| *c == '`').count();
        if run == ticks {
            let inner = body[..start].replace('\n', " ");
            let trimmed = if inner.len() > 2
                && inner.starts_with(' ')
                && inner.ends_with(' ')
                && !inner.trim().is_empty()
            {
                inner[1..inner.len() - 1].to_string()
            } else {
                inner
            };
            let raw = &src[..ticks + start + run];
            return Some(Token::new(TokenKind::CodeSpan, raw, trimmed));
        }
        search = start + run;
    }
    // No closing run: the backticks are literal.
    Some(Token::new(TokenKind::Text, &src[..ticks], &src[..ticks]))
}

fn autolink(src: &str) -> Option<Token> {
    let caps = autolink_re().captures(src)?;
    let href = caps.get(1)?.as_str();
    Some(
        Token::new(
            TokenKind::Link {
                href: href.to_string(),
                title: None,
            },
            caps.get(0)?.as_str(),
            href,
        )
        .with_children(vec![Token::new(TokenKind::Text, href, href)]),
    )
}

pub(crate) fn closing_bracket(src: &str) -> Option<usize> {
    let mut depth = 0usize;
    let mut escaped = false;
    for (idx, ch) in src.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '[' => depth += 1,
            ']' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(idx);
                }
            }
            '\n' if src[idx + 1..].starts_with('\n') => return None,
            _ => {}
        }
    }
    None
}

/// Parses `(dest "title")` at the start of `src`.
/// Returns `(consumed, destination, title)`.
pub(crate) fn link_destination(src: &str) -> Option<(usize, String, Option<String>)> {
    let inner = src.strip_prefix('(')?;
    let trimmed = inner.trim_start();
    let mut pos = 1 + inner.len() - trimmed.len();
    let dest;
    if let Some(angled) = trimmed.strip_prefix('<') {
        let end = angled.find('>')?;
        dest = angled[..end].to_string();
        pos += end + 2;
    } else {
        let mut depth = 0usize;
        let mut end = trimmed.len();
        for (idx, ch) in trimmed.char_indices() {
            match ch {
                '(' => depth += 1,
                ')' if depth == 0 => {
                    end = idx;
                    break;
                }
                ')' => depth -= 1,
                c if c.is_whitespace() => {
                    end = idx;
                    break;
                }
                _ => {}
            }
        }
        dest = trimmed[..end].to_string();
        pos += end;
    }

    let rest = &src[pos..];
    let after_ws = rest.trim_start();
    pos += rest.len() - after_ws.len();
    let mut title = None;
    if let Some(quote) = after_ws.chars().next().filter(|c| matches!(c, '"' | '\'')) {
        let body = &after_ws[1..];
        let end = body.find(quote)?;
        title = Some(body[..end].to_string());
        pos += end + 2;
        let rest = &src[pos..];
        pos += rest.len() - rest.trim_start().len();
    }
    if !src[pos..].starts_with(')') {
        return None;
    }
    Some((pos + 1, dest, title))
}

fn link(parser: &Parser, src: &str) -> Option<Token> {
    if !src.starts_with('[') {
        return None;
    }
    let close = closing_bracket(src)?;
    let label = &src[1..close];
    let (consumed, href, title) = link_destination(&src[close + 1..])?;
    let raw = &src[..close + 1 + consumed];
    Some(
        Token::new(TokenKind::Link { href, title }, raw, label)
            .with_children(parser.lex_inline(label)),
    )
}

fn image(parser: &Parser, src: &str) -> Option<Token> {
    let rest = src.strip_prefix('!')?;
    if !rest.starts_with('[') {
        return None;
    }
    let close = closing_bracket(rest)?;
    let alt = &rest[1..close];
    let (consumed, href, title) = link_destination(&rest[close + 1..])?;
    let raw = &src[..1 + close + 1 + consumed];
    Some(
        Token::new(TokenKind::Image { src: href, title }, raw, alt)
            .with_children(parser.lex_inline(alt)),
    )
}

/// Finds a closing delimiter run of exactly `want` `marker` chars whose
/// preceding char is not whitespace. Code spans and escapes are skipped.
fn closing_run(src: &str, marker: char, want: usize, intraword_ok: bool) -> Option<usize> {
    let bytes = src.as_bytes();
    let mut idx = 0;
    while idx < src.len() {
        let ch = src[idx..].chars().next()?;
        if ch == '\\' {
            idx += 1 + src[idx + 1..].chars().next().map(char::len_utf8).unwrap_or(0);
            continue;
        }
        if ch == '`' {
            if let Some(span) = code_span(&src[idx..]) {
                idx += span.raw.len();
                continue;
            }
        }
        if ch == marker {
            let run = src[idx..].chars().take_while(|c| *c == marker).count();
            let before = src[..idx].chars().next_back();
            let after = src[idx + run..].chars().next();
            let flanked = before.is_some_and(|c| !c.is_whitespace());
            let word_after = after.is_some_and(char::is_alphanumeric);
            if run == want && flanked && (intraword_ok || !word_after) {
                return Some(idx);
            }
            idx += run;
            continue;
        }
        if ch == '\n' && bytes.get(idx + 1) == Some(&b'\n') {
            return None;
        }
        idx += ch.len_utf8();
    }
    None
}

fn delimiter_close(src: &str, prev: Option<char>, marker: char, width: usize) -> Option<usize> {
    let run = src.chars().take_while(|c| *c == marker).count();
    if run != width {
        return None;
    }
    let body = &src[width..];
    if body.chars().next().is_none_or(char::is_whitespace) {
        return None;
    }
    let intraword_ok = marker != '_';
    if !intraword_ok && prev.is_some_and(char::is_alphanumeric) {
        return None;
    }
    closing_run(body, marker, width, intraword_ok).filter(|close| *close > 0)
}

/// `(width, closer offset)` when the delimiter run at the start of `src`
/// opens strong, em or strikethrough text. `prev` is the char before `src`.
pub(crate) fn emphasis_span(src: &str, prev: Option<char>) -> Option<(usize, usize)> {
    let marker = src.chars().next()?;
    let widths: &[usize] = match marker {
        '*' | '_' => &[2, 1],
        '~' => &[2],
        _ => return None,
    };
    widths.iter().find_map(|&width| {
        delimiter_close(src, prev, marker, width).map(|close| (width, width + close))
    })
}

fn delimited(
    parser: &Parser,
    src: &str,
    prev: Option<char>,
    marker: char,
    width: usize,
    kind: TokenKind,
) -> Option<Token> {
    let close = delimiter_close(src, prev, marker, width)?;
    let inner = &src[width..width + close];
    let raw = &src[..width + close + width];
    Some(Token::new(kind, raw, inner).with_children(parser.lex_inline(inner)))
}

fn strong(parser: &Parser, src: &str, prev: Option<char>) -> Option<Token> {
    let marker = src.chars().next().filter(|c| matches!(c, '*' | '_'))?;
    delimited(parser, src, prev, marker, 2, TokenKind::Strong)
}

fn em(parser: &Parser, src: &str, prev: Option<char>) -> Option<Token> {
    let marker = src.chars().next().filter(|c| matches!(c, '*' | '_'))?;
    delimited(parser, src, prev, marker, 1, TokenKind::Em)
}

fn del(parser: &Parser, src: &str) -> Option<Token> {
    if !src.starts_with("~~") {
        return None;
    }
    delimited(parser, src, None, '~', 2, TokenKind::Del)
}

fn hard_break(src: &str) -> Option<Token> {
    let m = hard_break_re().find(src)?;
    Some(Token::new(TokenKind::Br, m.as_str(), ""))
}

fn is_special(ch: char) -> bool {
    matches!(
        ch,
        '\\' | '`' | '*' | '_' | '~' | '[' | '!' | '<' | '\n'
    )
}

fn text(parser: &Parser, src: &str) -> Token {
    let first = src.chars().next().map(char::len_utf8).unwrap_or(1);
    let tail = &src[first..];
    let mut end = src.len();
    for ext in parser.extensions(Level::Inline) {
        if let Some(idx) = ext.start(tail) {
            end = end.min(first + idx);
        }
    }
    for (idx, ch) in tail.char_indices() {
        let at = first + idx;
        if at >= end {
            break;
        }
        if is_special(ch) || (ch == ' ' && hard_break_re().is_match(&src[at..])) {
            end = at;
            break;
        }
    }
    let raw = &src[..end];
    Token::new(TokenKind::Text, raw, raw)
}
