use regex::{Regex, RegexBuilder};
use ropey::Rope;
use serde::Serialize;
use std::borrow::Cow;
use std::ops::Range;

use crate::sourcemap::{MappedBlock, SourceMap};
use crate::text::{
    byte_to_char, char_len_at, char_to_byte, collapse_whitespace, floor_char_boundary,
    is_formatting_punct, is_word_char, truncate_chars,
};

pub const APPROXIMATE_WINDOW: usize = 80;
pub const VISIBLE_TEXT_LIMIT: usize = 512;
pub const SHORT_BLOCK_LIMIT: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SourceRange {
    pub start: usize,
    pub end: usize,
}

impl SourceRange {
    pub fn new(start: usize, end: usize) -> Self {
        Self {
            start,
            end: end.max(start),
        }
    }

    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn slice<'a>(&self, text: &'a str) -> &'a str {
        let end = floor_char_boundary(text, self.end);
        let start = floor_char_boundary(text, self.start.min(end));
        &text[start..end]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Matcher {
    Literal,
    CaseInsensitive,
    WhitespaceCollapsedRegex,
    WordJoinRegex,
}

impl Matcher {
    pub const ALL: [Matcher; 4] = [
        Matcher::Literal,
        Matcher::CaseInsensitive,
        Matcher::WhitespaceCollapsedRegex,
        Matcher::WordJoinRegex,
    ];

    pub fn find(self, haystack: &str, needle: &str) -> Option<Range<usize>> {
        let needle = needle.trim();
        if needle.is_empty() {
            return None;
        }
        if self == Matcher::Literal {
            return haystack.find(needle).map(|i| i..i + needle.len());
        }
        let re = self.pattern(needle)?;
        re.find(haystack).map(|m| m.range()).filter(|r| !r.is_empty())
    }

    fn pattern(self, needle: &str) -> Option<Regex> {
        let source = match self {
            Matcher::Literal | Matcher::CaseInsensitive => regex::escape(needle),
            Matcher::WhitespaceCollapsedRegex => needle
                .split_whitespace()
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(r"\s+"),
            Matcher::WordJoinRegex => {
                let words: Vec<String> = needle
                    .split(|c: char| !is_word_char(c))
                    .filter(|w| !w.is_empty())
                    .map(regex::escape)
                    .collect();
                if words.is_empty() {
                    return None;
                }
                words.join(r"[^\p{L}\p{N}_]*")
            }
        };
        match RegexBuilder::new(&source).case_insensitive(true).build() {
            Ok(re) => Some(re),
            Err(err) => {
                tracing::debug!(matcher = ?self, "unusable search pattern: {err}");
                None
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharClass {
    Word,
    Space,
    Other,
}

fn class_of(ch: char) -> CharClass {
    if is_word_char(ch) {
        CharClass::Word
    } else if ch.is_whitespace() {
        CharClass::Space
    } else {
        CharClass::Other
    }
}

/// Source range of the word under `plain_offset` in `block`.
///
/// The range reaches back over formatting punctuation that opens the word and
/// forward to the next retained character, so `*world*` is covered whole.
pub fn compute_range_for_block(block: &MappedBlock, plain_offset: usize) -> Option<SourceRange> {
    if !block.has_mapping() {
        return None;
    }
    let chars: Vec<char> = block.plain_text.chars().collect();
    let last = chars.len() - 1;
    let mut idx = plain_offset.min(last);
    if chars[idx].is_whitespace() {
        if let Some(next) = (idx..=last).find(|i| !chars[*i].is_whitespace()) {
            idx = next;
        } else if let Some(prev) = (0..idx).rev().find(|i| !chars[*i].is_whitespace()) {
            idx = prev;
        }
    }

    let class = class_of(chars[idx]);
    let (mut first, mut end) = (idx, idx);
    if class != CharClass::Other {
        while first > 0 && class_of(chars[first - 1]) == class {
            first -= 1;
        }
        while end < last && class_of(chars[end + 1]) == class {
            end += 1;
        }
    }

    let source = block.source.as_str();
    let floor = match first.checked_sub(1) {
        Some(prev) => {
            let rel = block.mapping[prev] - block.start;
            rel + char_len_at(source, rel)
        }
        None => 0,
    };
    let mut start = block.mapping[first] - block.start;
    while class == CharClass::Word && start > floor {
        match source[..start].chars().next_back() {
            Some(ch) if is_formatting_punct(ch) => start -= ch.len_utf8(),
            _ => break,
        }
    }
    let stop = match block.mapping.get(end + 1) {
        Some(next) => *next,
        None => block.content_end(),
    };
    Some(SourceRange::new(block.start + start, stop))
}

pub fn plain_offset_for_source(block: &MappedBlock, offset: usize) -> usize {
    block.mapping.partition_point(|m| *m < offset)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RenderedPosition {
    pub block_id: String,
    pub kind: &'static str,
    pub plain_offset: usize,
}

pub fn locate_source_offset(map: &SourceMap, offset: usize) -> Option<RenderedPosition> {
    let block = map.block_at(offset)?;
    Some(RenderedPosition {
        block_id: block.id.clone(),
        kind: block.kind,
        plain_offset: plain_offset_for_source(block, offset),
    })
}

/// Fuzzy search for rendered text inside `block`.
///
/// Candidates are tried in order: the selection, the selection with
/// whitespace collapsed, then a `window`-char slice of the plain text around
/// `plain_offset`. Each goes through a case-insensitive search and then a
/// whitespace-tolerant one.
pub fn find_approximate_range(
    block: &MappedBlock,
    selection: Option<&str>,
    plain_offset: usize,
    window: usize,
) -> Option<SourceRange> {
    let rebuilt;
    let block = if !block.has_mapping() && !block.source.is_empty() {
        let mut fresh = block.clone();
        fresh.rebuild_plain_text();
        rebuilt = fresh;
        &rebuilt
    } else {
        block
    };

    let mut candidates: Vec<String> = Vec::new();
    if let Some(selection) = selection.map(str::trim).filter(|s| !s.is_empty()) {
        candidates.push(selection.to_string());
        let collapsed = collapse_whitespace(selection);
        if collapsed != selection {
            candidates.push(collapsed);
        }
    }
    let windowed = plain_window(&block.plain_text, plain_offset, window);
    if !windowed.trim().is_empty() {
        candidates.push(windowed.to_string());
    }

    for candidate in &candidates {
        for matcher in [Matcher::CaseInsensitive, Matcher::WhitespaceCollapsedRegex] {
            let Some(found) = matcher.find(&block.plain_text, candidate) else {
                continue;
            };
            let first = byte_to_char(&block.plain_text, found.start);
            let stop = byte_to_char(&block.plain_text, found.end);
            tracing::trace!(block = %block.id, ?matcher, first, stop, "approximate hit");
            return Some(map_plain_range(block, first, stop));
        }
    }
    None
}

fn plain_window(plain: &str, center: usize, window: usize) -> &str {
    let total = plain.chars().count();
    let first = center.min(total).saturating_sub(window / 2);
    let stop = (first + window).min(total);
    let start = char_to_byte(plain, first);
    let end = char_to_byte(plain, stop);
    &plain[start..end]
}

fn map_plain_range(block: &MappedBlock, first: usize, stop: usize) -> SourceRange {
    if block.has_mapping() {
        let start = block.mapping[first.min(block.mapping.len() - 1)];
        let last = block.mapping[stop.saturating_sub(1).clamp(first, block.mapping.len() - 1)];
        let rel = last - block.start;
        return SourceRange::new(start, last + char_len_at(&block.source, rel));
    }
    let total = block.plain_text.chars().count().max(1);
    let span = block.end - block.start;
    SourceRange::new(
        block.start + first * span / total,
        block.start + stop * span / total,
    )
}

#[derive(Debug, Clone, Default)]
pub struct RenderedNode {
    pub note_id: Option<String>,
    pub block_id: Option<String>,
    pub text: String,
    pub math_source: Option<String>,
    pub selection: Option<TextSelection>,
}

#[derive(Debug, Clone, Default)]
pub struct TextSelection {
    pub text: String,
    pub plain_offset: Option<usize>,
}

#[derive(Debug, Clone, Copy)]
pub struct FocusOptions {
    pub use_selection: bool,
    pub window: usize,
    pub visible_text_limit: usize,
    pub short_block_limit: usize,
}

impl Default for FocusOptions {
    fn default() -> Self {
        Self {
            use_selection: true,
            window: APPROXIMATE_WINDOW,
            visible_text_limit: VISIBLE_TEXT_LIMIT,
            short_block_limit: SHORT_BLOCK_LIMIT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Candidate {
    Selection,
    MathSource,
    VisibleText,
    BlockText,
    BlockSource,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case", tag = "strategy")]
pub enum FocusStrategy {
    SelectionApproximate,
    WordRange,
    OffsetApproximate,
    Search { candidate: Candidate, matcher: Matcher },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FocusOutcome {
    pub range: SourceRange,
    pub strategy: FocusStrategy,
}

pub trait EditableText {
    fn text(&self) -> Cow<'_, str>;
    fn set_selection(&mut self, range: SourceRange);
    fn scroll_to_center(&mut self, offset: usize);
}

/// Moves `editor` to the source of `node`. `None` when nothing matched; the
/// editor is left untouched then.
pub fn focus_from_rendered_node(
    node: &RenderedNode,
    map: &SourceMap,
    editor: &mut dyn EditableText,
    options: &FocusOptions,
) -> Option<FocusOutcome> {
    if node.note_id.as_deref().is_some_and(|id| id != map.note_id) {
        tracing::debug!(node = ?node.note_id, map = %map.note_id, "node belongs to another note");
        return None;
    }
    let block = node.block_id.as_deref().and_then(|id| map.block(id));
    let selection = node.selection.as_ref().filter(|_| options.use_selection);
    let selected_text = selection
        .map(|s| s.text.trim())
        .filter(|t| !t.is_empty());

    let outcome = block
        .and_then(|block| locate_in_block(block, selection, selected_text, options))
        .or_else(|| search_editor(node, block, selected_text, &*editor, options))?;

    let len = editor.text().len();
    let range = SourceRange::new(outcome.range.start.min(len), outcome.range.end.min(len));
    tracing::debug!(strategy = ?outcome.strategy, start = range.start, end = range.end, "focused source");
    editor.set_selection(range);
    editor.scroll_to_center(range.start);
    Some(FocusOutcome { range, ..outcome })
}

fn locate_in_block(
    block: &MappedBlock,
    selection: Option<&TextSelection>,
    selected_text: Option<&str>,
    options: &FocusOptions,
) -> Option<FocusOutcome> {
    let offset = selection
        .and_then(|s| s.plain_offset)
        .unwrap_or(block.plain_text.chars().count() / 2);
    let hit = |range: SourceRange, strategy| Some(FocusOutcome { range, strategy });

    if let Some(text) = selected_text {
        if let Some(range) = find_approximate_range(block, Some(text), offset, options.window) {
            return hit(range, FocusStrategy::SelectionApproximate);
        }
    }
    if let Some(range) = compute_range_for_block(block, offset) {
        return hit(range, FocusStrategy::WordRange);
    }
    find_approximate_range(block, None, offset, options.window)
        .and_then(|range| hit(range, FocusStrategy::OffsetApproximate))
}

fn search_editor(
    node: &RenderedNode,
    block: Option<&MappedBlock>,
    selected_text: Option<&str>,
    editor: &dyn EditableText,
    options: &FocusOptions,
) -> Option<FocusOutcome> {
    let visible = truncate_chars(&node.text, options.visible_text_limit);
    let block_text = block
        .map(|b| b.plain_text.as_str())
        .filter(|t| t.chars().count() <= options.short_block_limit);
    let candidates = [
        (Candidate::Selection, selected_text),
        (Candidate::MathSource, node.math_source.as_deref()),
        (Candidate::VisibleText, Some(visible)),
        (Candidate::BlockText, block_text),
        (Candidate::BlockSource, block.map(|b| b.source.as_str())),
    ];

    let haystack = editor.text();
    for (candidate, needle) in candidates {
        let Some(needle) = needle.filter(|n| !n.trim().is_empty()) else {
            continue;
        };
        for matcher in Matcher::ALL {
            if let Some(found) = matcher.find(&haystack, needle) {
                return Some(FocusOutcome {
                    range: SourceRange::new(found.start, found.end),
                    strategy: FocusStrategy::Search { candidate, matcher },
                });
            }
        }
    }
    tracing::debug!(block = ?node.block_id, "no source match for rendered node");
    None
}

#[derive(Debug, Clone)]
pub struct SourceEditor {
    rope: Rope,
    selection: Option<SourceRange>,
    scroll_top: usize,
    viewport_lines: usize,
}

impl SourceEditor {
    pub fn new(text: &str, viewport_lines: usize) -> Self {
        Self {
            rope: Rope::from_str(text),
            selection: None,
            scroll_top: 0,
            viewport_lines,
        }
    }

    pub fn selection(&self) -> Option<SourceRange> {
        self.selection
    }

    pub fn selected_text(&self) -> Option<String> {
        let range = self.selection?;
        let start = self.rope.byte_to_char(range.start);
        let end = self.rope.byte_to_char(range.end);
        Some(self.rope.slice(start..end).to_string())
    }

    pub fn scroll_top(&self) -> usize {
        self.scroll_top
    }

    pub fn line_of(&self, offset: usize) -> usize {
        self.rope.byte_to_line(offset.min(self.rope.len_bytes()))
    }

    pub fn replace_all(&mut self, text: &str) {
        self.rope = Rope::from_str(text);
        self.selection = None;
        self.scroll_top = self.scroll_top.min(self.rope.len_lines().saturating_sub(1));
    }
}

impl EditableText for SourceEditor {
    fn text(&self) -> Cow<'_, str> {
        Cow::from(&self.rope)
    }

    fn set_selection(&mut self, range: SourceRange) {
        let clamped = {
            let text = self.text();
            SourceRange::new(
                floor_char_boundary(&text, range.start),
                floor_char_boundary(&text, range.end),
            )
        };
        self.selection = Some(clamped);
    }

    fn scroll_to_center(&mut self, offset: usize) {
        self.scroll_top = self.line_of(offset).saturating_sub(self.viewport_lines / 2);
    }
}
