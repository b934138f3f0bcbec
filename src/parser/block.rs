use regex::Regex;
use std::sync::OnceLock;

use super::{Align, Level, Parser, Token, TokenKind};

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("valid block pattern"))
        }
    };
}

static_regex!(space_re, r"^(?:[ \t]*\n)+|^[ \t]+$");
static_regex!(fence_open_re, r"^ {0,3}(`{3,}|~{3,})([^\n]*)(?:\n|$)");
static_regex!(
    heading_re,
    r"^ {0,3}(#{1,6})(?:[ \t]+([^\n]*?))??(?:[ \t]+#+)?[ \t]*(?:\n|$)"
);
static_regex!(
    hr_re,
    r"^ {0,3}(?:(?:-[ \t]*){3,}|(?:\*[ \t]*){3,}|(?:_[ \t]*){3,})(?:\n|$)"
);
static_regex!(quote_re, r"^ {0,3}> ?");
static_regex!(list_marker_re, r"^( {0,3})([*+-]|(\d{1,9})([.)]))([ \t]+|$)");
static_regex!(
    html_block_re,
    r"^ {0,3}<(?:[A-Za-z][A-Za-z0-9-]*(?:[\s/>]|$)|/[A-Za-z][A-Za-z0-9-]*\s*>|!--)"
);
static_regex!(
    table_delim_re,
    r"^ {0,3}\|?[ \t]*:?-+:?[ \t]*(?:\|[ \t]*:?-+:?[ \t]*)*\|?[ \t]*$"
);
static_regex!(setext_re, r"^ {0,3}(=+|-+)[ \t]*$");
static_regex!(task_re, r"^\[([ xX])\][ \t]+");

pub(super) fn lex_blocks(parser: &Parser, src: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut pos = 0;
    while pos < src.len() {
        let token = next_block(parser, &src[pos..]);
        pos += token.raw.len().max(1);
        tokens.push(token);
    }
    tokens
}

fn next_block(parser: &Parser, src: &str) -> Token {
    for ext in parser.extensions(Level::Block) {
        if let Some(token) = ext.tokenize(src) {
            if !token.raw.is_empty() && src.starts_with(&token.raw) {
                return token;
            }
        }
    }
    space(src)
        .or_else(|| fenced_code(src))
        .or_else(|| indented_code(src))
        .or_else(|| heading(parser, src))
        .or_else(|| hr(src))
        .or_else(|| blockquote(parser, src))
        .or_else(|| list(parser, src))
        .or_else(|| html_block(src))
        .or_else(|| table(parser, src))
        .unwrap_or_else(|| paragraph(parser, src))
}

/// Byte index just past the line starting at `from` (including its `\n`).
pub(crate) fn next_line(src: &str, from: usize) -> usize {
    src[from..]
        .find('\n')
        .map(|idx| from + idx + 1)
        .unwrap_or(src.len())
}

fn line_at(src: &str, from: usize) -> &str {
    src[from..next_line(src, from)].trim_end_matches('\n')
}

fn is_blank(line: &str) -> bool {
    line.trim().is_empty()
}

fn indent_width(line: &str) -> usize {
    let mut width = 0;
    for ch in line.chars() {
        match ch {
            ' ' => width += 1,
            '\t' => width += 4 - width % 4,
            _ => break,
        }
    }
    width
}

/// Drops up to `width` columns of leading indentation.
fn strip_indent(line: &str, width: usize) -> &str {
    let mut col = 0;
    for (idx, ch) in line.char_indices() {
        if col >= width {
            return &line[idx..];
        }
        match ch {
            ' ' => col += 1,
            '\t' => col += 4 - col % 4,
            _ => return &line[idx..],
        }
    }
    ""
}

fn space(src: &str) -> Option<Token> {
    let m = space_re().find(src)?;
    Some(Token::new(TokenKind::Space, m.as_str(), ""))
}

fn fenced_code(src: &str) -> Option<Token> {
    let caps = fence_open_re().captures(src)?;
    let fence = caps.get(1)?.as_str();
    let info = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
    let fence_char = fence.chars().next()?;
    if fence_char == '`' && info.contains('`') {
        return None;
    }
    let body_start = caps.get(0)?.end();
    let (body_end, end) = find_closing_fence(src, body_start, fence_char, fence.len());
    let text = src[body_start..body_end].trim_end_matches('\n');
    let lang = info.split_whitespace().next().map(str::to_string);
    Some(Token::new(TokenKind::Code { lang }, &src[..end], text))
}

/// Returns `(body_end, block_end)`; an unclosed fence runs to the end.
pub(crate) fn find_closing_fence(
    src: &str,
    from: usize,
    fence_char: char,
    fence_len: usize,
) -> (usize, usize) {
    let mut pos = from;
    while pos < src.len() {
        let line_end = next_line(src, pos);
        let line = src[pos..line_end].trim_end_matches('\n');
        let trimmed = line.trim_start_matches(' ');
        if line.len() - trimmed.len() <= 3 {
            let run = trimmed.chars().take_while(|c| *c == fence_char).count();
            if run >= fence_len && trimmed[run..].trim().is_empty() {
                return (pos, line_end);
            }
        }
        pos = line_end;
    }
    (src.len(), src.len())
}

fn indented_code(src: &str) -> Option<Token> {
    let first = line_at(src, 0);
    if is_blank(first) || indent_width(first) < 4 {
        return None;
    }
    let mut end = next_line(src, 0);
    let mut content_end = end;
    while end < src.len() {
        let line = line_at(src, end);
        if !is_blank(line) && indent_width(line) < 4 {
            break;
        }
        end = next_line(src, end);
        if !is_blank(line) {
            content_end = end;
        }
    }
    let raw = &src[..content_end];
    let text = raw
        .lines()
        .map(|line| strip_indent(line, 4))
        .collect::<Vec<_>>()
        .join("\n");
    Some(Token::new(TokenKind::Code { lang: None }, raw, text.trim_end()))
}

fn heading(parser: &Parser, src: &str) -> Option<Token> {
    let caps = heading_re().captures(src)?;
    let level = caps.get(1)?.as_str().len() as u8;
    let text = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");
    let raw = caps.get(0)?.as_str();
    Some(Token::new(TokenKind::Heading(level), raw, text).with_children(parser.lex_inline(text)))
}

fn hr(src: &str) -> Option<Token> {
    let m = hr_re().find(src)?;
    Some(Token::new(TokenKind::Hr, m.as_str(), ""))
}

fn blockquote(parser: &Parser, src: &str) -> Option<Token> {
    if !quote_re().is_match(src) {
        return None;
    }
    let mut end = 0;
    let mut inner = String::new();
    while end < src.len() {
        let line = line_at(src, end);
        let Some(m) = quote_re().find(line) else {
            break;
        };
        inner.push_str(&line[m.end()..]);
        inner.push('\n');
        end = next_line(src, end);
    }
    let children = lex_blocks(parser, &inner);
    Some(Token::new(TokenKind::Blockquote, &src[..end], inner).with_children(children))
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Marker {
    content_indent: usize,
    ordered: bool,
    number: u64,
    symbol: char,
    empty: bool,
    content_start: usize,
}

fn list_marker(line: &str) -> Option<Marker> {
    let caps = list_marker_re().captures(line)?;
    let indent = caps.get(1)?.as_str().len();
    let marker = caps.get(2)?.as_str();
    let spacing = caps.get(5).map(|m| m.as_str()).unwrap_or("");
    let ordered = caps.get(3).is_some();
    let number = caps
        .get(3)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(1);
    let symbol = match caps.get(4) {
        Some(delim) => delim.as_str().chars().next()?,
        None => marker.chars().next()?,
    };
    let matched_end = caps.get(0)?.end();
    let empty = line[matched_end..].trim().is_empty();
    let gap = indent_width(spacing);
    let (gap, content_start) = if gap == 0 || gap > 4 || empty {
        (1, (matched_end - spacing.len() + 1).min(line.len()))
    } else {
        (gap, matched_end)
    };
    Some(Marker {
        content_indent: indent + marker.len() + gap,
        ordered,
        number,
        symbol,
        empty,
        content_start,
    })
}

fn starts_other_block(line: &str) -> bool {
    heading_re().is_match(line)
        || hr_re().is_match(line)
        || fence_open_re().is_match(line)
        || quote_re().is_match(line)
}

fn list(parser: &Parser, src: &str) -> Option<Token> {
    let first = list_marker(line_at(src, 0))?;
    let mut items = Vec::new();
    let mut pos = 0;
    let mut loose = false;

    loop {
        let line = line_at(src, pos);
        let Some(marker) = list_marker(line) else {
            break;
        };
        if marker.ordered != first.ordered || marker.symbol != first.symbol {
            break;
        }
        let item_start = pos;
        let after_marker = &line[marker.content_start..];
        let mut content = String::from(after_marker.trim_end());
        content.push('\n');
        pos = next_line(src, pos);
        let mut item_end = pos;
        let mut saw_blank = false;

        while pos < src.len() {
            let line = line_at(src, pos);
            if is_blank(line) {
                let mut ahead = pos;
                while ahead < src.len() && is_blank(line_at(src, ahead)) {
                    ahead = next_line(src, ahead);
                }
                if ahead < src.len() && indent_width(line_at(src, ahead)) >= marker.content_indent
                {
                    for _ in src[pos..ahead].lines() {
                        content.push('\n');
                    }
                    saw_blank = true;
                    pos = ahead;
                    continue;
                }
                break;
            }
            if indent_width(line) >= marker.content_indent {
                content.push_str(strip_indent(line, marker.content_indent));
                content.push('\n');
            } else if list_marker(line).is_some() || starts_other_block(line) || saw_blank {
                break;
            } else {
                content.push_str(line.trim_start());
                content.push('\n');
            }
            pos = next_line(src, pos);
            item_end = pos;
        }

        let mut checked = None;
        let mut body = content.as_str();
        if let Some(caps) = task_re().captures(body) {
            checked = Some(&caps[1] != " ");
            body = &body[caps[0].len()..];
        }
        let children = lex_blocks(parser, body);
        if saw_blank && children.iter().filter(|t| t.kind != TokenKind::Space).count() > 1 {
            loose = true;
        }
        items.push(
            Token::new(
                TokenKind::ListItem { checked },
                &src[item_start..item_end],
                body.trim_end(),
            )
            .with_children(children),
        );
        pos = item_end;

        let mut ahead = pos;
        while ahead < src.len() && is_blank(line_at(src, ahead)) {
            ahead = next_line(src, ahead);
        }
        if ahead >= src.len() {
            break;
        }
        match list_marker(line_at(src, ahead)) {
            Some(next) if next.ordered == first.ordered && next.symbol == first.symbol => {
                if ahead > pos {
                    loose = true;
                }
                pos = ahead;
            }
            _ => break,
        }
    }

    if items.is_empty() {
        return None;
    }
    let raw = &src[..pos];
    Some(
        Token::new(
            TokenKind::List {
                ordered: first.ordered,
                start: first.number,
                loose,
            },
            raw,
            "",
        )
        .with_children(items),
    )
}

fn html_block(src: &str) -> Option<Token> {
    if !html_block_re().is_match(src) || src.trim_start().starts_with("<span class=\"block-anchor\"")
    {
        return None;
    }
    let mut end = 0;
    while end < src.len() {
        let line = line_at(src, end);
        if is_blank(line) {
            break;
        }
        end = next_line(src, end);
    }
    let raw = &src[..end];
    Some(Token::new(TokenKind::Html, raw, raw.trim_end()))
}

pub(crate) fn split_table_row(line: &str) -> Vec<&str> {
    let mut row = line.trim();
    row = row.strip_prefix('|').unwrap_or(row);
    if row.ends_with('|') && !row.ends_with("\\|") {
        row = &row[..row.len() - 1];
    }
    let mut cells = Vec::new();
    let mut start = 0;
    let mut escaped = false;
    for (idx, ch) in row.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '|' => {
                cells.push(row[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    cells.push(row[start..].trim());
    cells
}

fn parse_align(cell: &str) -> Align {
    match (cell.starts_with(':'), cell.ends_with(':')) {
        (true, true) => Align::Center,
        (true, false) => Align::Left,
        (false, true) => Align::Right,
        (false, false) => Align::None,
    }
}

fn table(parser: &Parser, src: &str) -> Option<Token> {
    let header_line = line_at(src, 0);
    if !header_line.contains('|') {
        return None;
    }
    let delim_start = next_line(src, 0);
    if delim_start >= src.len() {
        return None;
    }
    let delim_line = line_at(src, delim_start);
    if !table_delim_re().is_match(delim_line) || !delim_line.contains('-') {
        return None;
    }
    let header = split_table_row(header_line);
    let aligns: Vec<Align> = split_table_row(delim_line)
        .into_iter()
        .map(parse_align)
        .collect();
    if header.len() != aligns.len() {
        return None;
    }

    let make_row = |line: &str, is_header: bool| -> Token {
        let mut cells = split_table_row(line);
        cells.resize(aligns.len(), "");
        let children = cells
            .iter()
            .zip(&aligns)
            .map(|(cell, align)| {
                Token::new(
                    TokenKind::TableCell {
                        header: is_header,
                        align: *align,
                    },
                    *cell,
                    *cell,
                )
                .with_children(parser.lex_inline(cell))
            })
            .collect();
        Token::new(TokenKind::TableRow { header: is_header }, line, "").with_children(children)
    };

    let mut rows = vec![make_row(header_line, true)];
    let mut end = next_line(src, delim_start);
    while end < src.len() {
        let line = line_at(src, end);
        if is_blank(line) || starts_other_block(line) {
            break;
        }
        rows.push(make_row(line, false));
        end = next_line(src, end);
    }
    Some(Token::new(TokenKind::Table, &src[..end], "").with_children(rows))
}

fn interrupts_paragraph(parser: &Parser, rest: &str) -> bool {
    let line = line_at(rest, 0);
    if starts_other_block(line) || html_block(rest).is_some() {
        return true;
    }
    if let Some(marker) = list_marker(line) {
        if !marker.empty && (!marker.ordered || marker.number == 1) {
            return true;
        }
    }
    parser
        .extensions(Level::Block)
        .any(|ext| ext.tokenize(rest).is_some())
}

fn paragraph(parser: &Parser, src: &str) -> Token {
    let mut end = next_line(src, 0);
    let mut lines = vec![line_at(src, 0).trim_start()];
    while end < src.len() {
        let line = line_at(src, end);
        if is_blank(line) {
            break;
        }
        if let Some(caps) = setext_re().captures(line) {
            let level = if caps[1].starts_with('=') { 1 } else { 2 };
            let text = lines.join("\n");
            let raw = &src[..next_line(src, end)];
            let children = parser.lex_inline(&text);
            return Token::new(TokenKind::Heading(level), raw, text).with_children(children);
        }
        if interrupts_paragraph(parser, &src[end..]) {
            break;
        }
        lines.push(line.trim_start());
        end = next_line(src, end);
    }
    let text = lines.join("\n");
    let text = text.trim_end();
    Token::new(TokenKind::Paragraph, &src[..end], text).with_children(parser.lex_inline(text))
}
