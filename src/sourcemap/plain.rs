use regex::Regex;
use std::ops::Range;
use std::sync::OnceLock;

use crate::anchors::{parse_anchor_marker, scan_block_anchors};
use crate::extensions::inline_math_len;
use crate::parser::{closing_bracket, emphasis_span, link_destination};
use crate::resolve::wikilink_display;

macro_rules! static_regex {
    ($name:ident, $pattern:expr) => {
        fn $name() -> &'static Regex {
            static RE: OnceLock<Regex> = OnceLock::new();
            RE.get_or_init(|| Regex::new($pattern).expect("valid plain-text pattern"))
        }
    };
}

static_regex!(atx_open_re, r"^ {0,3}#{1,6}(?:[ \t]+|$)");
static_regex!(atx_close_re, r"[ \t]+#+[ \t]*$");
static_regex!(setext_re, r"^ {0,3}(?:=+|-+)[ \t]*$");
static_regex!(list_marker_re, r"^[ \t]*(?:[*+-]|\d{1,9}[.)])(?:[ \t]+|$)(?:\[[ xX]\][ \t]+)?");
static_regex!(quote_re, r"^(?: {0,3}> ?)+");
static_regex!(table_delim_re, r"^ {0,3}\|?[ \t]*:?-+:?[ \t]*(?:\|[ \t]*:?-+:?[ \t]*)*\|?[ \t]*$");
static_regex!(fence_re, r"^ {0,3}(?:`{3,}|~{3,})");

#[derive(Debug, Default)]
struct PlainBuilder {
    text: String,
    mapping: Vec<usize>,
    closers: Vec<Range<usize>>,
}

impl PlainBuilder {
    fn push(&mut self, ch: char, offset: usize) {
        self.text.push(ch);
        self.mapping.push(offset);
    }

    fn verbatim(&mut self, src: &str, range: Range<usize>, base: usize) {
        for (idx, ch) in src[range.clone()].char_indices() {
            self.push(ch, base + range.start + idx);
        }
    }

    fn newline_before(&mut self, src: &str, line_start: usize, base: usize) {
        if !self.text.is_empty() && line_start > 0 && src.as_bytes()[line_start - 1] == b'\n' {
            self.push('\n', base + line_start - 1);
        }
    }
}

fn line_spans(src: &str) -> Vec<(usize, &str)> {
    let mut spans = Vec::new();
    let mut offset = 0;
    for line in src.split('\n') {
        spans.push((offset, line));
        offset += line.len() + 1;
    }
    spans
}

/// Plain text and char-to-source mapping for a block of `kind` whose source
/// `block` starts at `base` in the original document.
pub fn plain_text(kind: &str, block: &str, base: usize) -> (String, Vec<usize>) {
    let body = block.trim_end();
    let skip: Vec<Range<usize>> = scan_block_anchors(body)
        .into_iter()
        .map(|a| a.start..a.end)
        .collect();
    let lines = line_spans(body);
    let mut out = PlainBuilder::default();

    match kind {
        "code" => code_lines(&mut out, body, &lines, base),
        "math_block" => math_lines(&mut out, body, &lines, base),
        _ => {
            let strip_pipes = matches!(kind, "table" | "table_cell");
            for (idx, &(offset, line)) in lines.iter().enumerate() {
                let Some(lead) = content_start(kind, idx, line) else {
                    continue;
                };
                let mut end = offset + line.len();
                if kind == "heading" {
                    if let Some(close) = atx_close_re().find(line) {
                        end = offset + close.start();
                    }
                }
                let start = offset + lead;
                if start >= end {
                    continue;
                }
                // Headings and table rows are lexed one line at a time.
                let limit = if kind == "heading" || strip_pipes { end } else { body.len() };
                out.newline_before(body, offset, base);
                inline(&mut out, body, start..end, limit, base, &skip, strip_pipes);
            }
        }
    }
    (out.text, out.mapping)
}

/// Byte offset in `line` where rendered content starts, or `None` when the
/// line renders nothing.
fn content_start(kind: &str, idx: usize, line: &str) -> Option<usize> {
    let lead_ws = line.len() - line.trim_start().len();
    let start = match kind {
        "heading" => {
            if idx > 0 && setext_re().is_match(line) {
                return None;
            }
            atx_open_re().find(line).map_or(lead_ws, |m| m.end())
        }
        "list_item" => list_marker_re().find(line).map_or(lead_ws, |m| m.end()),
        "blockquote" => {
            let after_quote = quote_re().find(line).map_or(0, |m| m.end());
            let rest = &line[after_quote..];
            let marker = list_marker_re()
                .find(rest)
                .or_else(|| atx_open_re().find(rest))
                .map_or(rest.len() - rest.trim_start().len(), |m| m.end());
            after_quote + marker
        }
        "table" => {
            if table_delim_re().is_match(line) {
                return None;
            }
            lead_ws
        }
        _ => lead_ws,
    };
    Some(start)
}

fn code_lines(out: &mut PlainBuilder, body: &str, lines: &[(usize, &str)], base: usize) {
    let fenced = lines.first().is_some_and(|(_, l)| fence_re().is_match(l));
    for (idx, &(offset, line)) in lines.iter().enumerate() {
        if fenced && idx == 0 {
            continue;
        }
        if fenced && idx + 1 == lines.len() && idx > 0 && fence_re().is_match(line) {
            let trimmed = line.trim();
            if trimmed.chars().all(|c| c == '`' || c == '~') {
                continue;
            }
        }
        let lead = if fenced {
            0
        } else {
            line.chars().take(4).take_while(|c| *c == ' ').count()
        };
        if idx > 0 && !(fenced && idx == 1) {
            out.newline_before(body, offset, base);
        }
        out.verbatim(body, offset + lead..offset + line.len(), base);
    }
}

fn math_lines(out: &mut PlainBuilder, body: &str, lines: &[(usize, &str)], base: usize) {
    let last = lines.len().saturating_sub(1);
    for (idx, &(offset, line)) in lines.iter().enumerate() {
        let mut start = offset;
        let mut end = offset + line.len();
        if idx == 0 {
            let lead = line.len() - line.trim_start().len();
            start = offset + lead + if line.trim_start().starts_with("$$") { 2 } else { 0 };
        }
        if idx == last {
            let trimmed = body[start..end].trim_end();
            if let Some(stripped) = trimmed.strip_suffix("$$") {
                end = start + stripped.len();
            }
        }
        if start >= end {
            continue;
        }
        out.newline_before(body, offset, base);
        out.verbatim(body, start..end, base);
    }
}

/// Walks `src[range]`. Delimiter runs are matched the way the inline lexer
/// matches them, searching for closers no further than `limit`.
fn inline(
    out: &mut PlainBuilder,
    src: &str,
    range: Range<usize>,
    limit: usize,
    base: usize,
    skip: &[Range<usize>],
    strip_pipes: bool,
) {
    let end = range.end;
    let mut i = range.start;
    while i < end {
        if let Some(hole) = skip.iter().find(|r| r.start <= i && i < r.end) {
            i = hole.end;
            continue;
        }
        while out.closers.last().is_some_and(|c| c.start < i) {
            out.closers.pop();
        }
        let rest = &src[i..end];
        let Some(ch) = rest.chars().next() else {
            break;
        };
        match ch {
            '\\' => match rest[1..].chars().next() {
                Some(next) if next.is_ascii_punctuation() => {
                    out.push(next, base + i + 1);
                    i += 1 + next.len_utf8();
                }
                Some('\n') => i += 1,
                _ => {
                    out.push('\\', base + i);
                    i += 1;
                }
            },
            '`' => {
                let ticks = rest.bytes().take_while(|b| *b == b'`').count();
                match closing_ticks(&rest[ticks..], ticks) {
                    Some(close) => {
                        let inner = i + ticks..i + ticks + close;
                        out.verbatim(src, inner, base);
                        i += ticks + close + ticks;
                    }
                    None => {
                        out.verbatim(src, i..i + ticks, base);
                        i += ticks;
                    }
                }
            }
            '$' => match inline_math_len(rest) {
                Some(len) => {
                    out.verbatim(src, i + 1..i + len - 1, base);
                    i += len;
                }
                None => {
                    out.push('$', base + i);
                    i += 1;
                }
            },
            '*' | '_' | '~' => {
                if out.closers.last().is_some_and(|c| c.start == i) {
                    if let Some(close) = out.closers.pop() {
                        i = close.end;
                        continue;
                    }
                }
                let mut bound = out.closers.last().map_or(limit, |c| c.start.min(limit));
                if strip_pipes {
                    bound = src[i..bound].find('|').map_or(bound, |pipe| i + pipe);
                }
                match emphasis_span(&src[i..bound], src[..i].chars().next_back()) {
                    Some((width, close)) => {
                        out.closers.push(i + close..i + close + width);
                        i += width;
                    }
                    None => {
                        out.push(ch, base + i);
                        i += 1;
                    }
                }
            }
            '<' => match parse_anchor_marker(rest) {
                Some((len, _, _)) => i += len,
                None => {
                    out.push('<', base + i);
                    i += 1;
                }
            },
            '|' if strip_pipes => i += 1,
            '!' if rest.starts_with("![[") => match wikilink_close(rest) {
                Some(close) => i += close + 2,
                None => {
                    out.push('!', base + i);
                    i += 1;
                }
            },
            '!' if rest.starts_with("![") => match link_len(&rest[1..]) {
                Some((_, total)) => i += 1 + total,
                None => {
                    out.push('!', base + i);
                    i += 1;
                }
            },
            '[' if rest.starts_with("[[") => match wikilink_close(rest) {
                Some(close) => {
                    let shown = wikilink_display(&rest[2..close]);
                    out.verbatim(src, i + 2 + shown.start..i + 2 + shown.end, base);
                    i += close + 2;
                }
                None => {
                    out.push('[', base + i);
                    i += 1;
                }
            },
            '[' => match link_len(rest) {
                Some((label_end, total)) => {
                    let label = i + 1..i + label_end;
                    inline(out, src, label.clone(), label.end, base, skip, strip_pipes);
                    i += total;
                }
                None => {
                    out.push('[', base + i);
                    i += 1;
                }
            },
            _ => {
                out.push(ch, base + i);
                i += ch.len_utf8();
            }
        }
    }
}

fn closing_ticks(body: &str, ticks: usize) -> Option<usize> {
    let mut search = 0;
    while let Some(found) = body[search..].find('`') {
        let at = search + found;
        let run = body[at..].bytes().take_while(|b| *b == b'`').count();
        if run == ticks {
            return Some(at);
        }
        search = at + run;
    }
    None
}

fn wikilink_close(src: &str) -> Option<usize> {
    let open = if src.starts_with('!') { 3 } else { 2 };
    let close = open + src[open..].find("]]")?;
    let inner = &src[open..close];
    if inner.trim().is_empty() || inner.contains(['\n', '[']) {
        return None;
    }
    Some(close)
}

fn link_len(src: &str) -> Option<(usize, usize)> {
    let close = closing_bracket(src)?;
    let (consumed, _, _) = link_destination(&src[close + 1..])?;
    Some((close, close + 1 + consumed))
}
