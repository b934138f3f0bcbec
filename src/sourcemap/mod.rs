mod plain;

pub use plain::plain_text;

use anyhow::{Result, bail};
use serde::Serialize;
use std::collections::HashMap;

use crate::anchors::{BlockAnchorReplacement, prepared_to_original};
use crate::parser::{Token, is_mappable};
use crate::text::floor_char_boundary;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MappedBlock {
    pub id: String,
    pub kind: &'static str,
    pub depth: usize,
    pub raw_start: usize,
    pub raw_end: usize,
    pub start: usize,
    pub end: usize,
    pub plain_text: String,
    /// `mapping[i]` is the original offset of the `i`-th char of `plain_text`.
    pub mapping: Vec<usize>,
    #[serde(skip)]
    pub source: String,
}

impl MappedBlock {
    pub fn has_mapping(&self) -> bool {
        !self.mapping.is_empty() && self.mapping.len() == self.plain_text.chars().count()
    }

    pub fn content_end(&self) -> usize {
        self.start + self.source.trim_end().len()
    }

    pub fn rebuild_plain_text(&mut self) {
        let (text, mapping) = plain_text(self.kind, &self.source, self.start);
        self.plain_text = text;
        self.mapping = mapping;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SourceMap {
    pub note_id: String,
    pub blocks: Vec<MappedBlock>,
    pub replacements: Vec<BlockAnchorReplacement>,
    #[serde(skip)]
    by_id: HashMap<String, usize>,
}

impl SourceMap {
    pub fn new(
        note_id: impl Into<String>,
        blocks: Vec<MappedBlock>,
        replacements: Vec<BlockAnchorReplacement>,
    ) -> Self {
        let by_id = blocks
            .iter()
            .enumerate()
            .map(|(idx, block)| (block.id.clone(), idx))
            .collect();
        Self {
            note_id: note_id.into(),
            blocks,
            replacements,
            by_id,
        }
    }

    pub fn block(&self, id: &str) -> Option<&MappedBlock> {
        self.by_id.get(id).and_then(|idx| self.blocks.get(*idx))
    }

    pub fn block_at(&self, offset: usize) -> Option<&MappedBlock> {
        self.blocks
            .iter()
            .filter(|b| b.start <= offset && offset < b.end.max(b.start + 1))
            .max_by_key(|b| (b.depth, b.start))
    }

    pub fn validate(&self, original: &str) -> Result<()> {
        for block in &self.blocks {
            if block.start > block.end || block.end > original.len() {
                bail!(
                    "block {} spans {}..{} outside a {}-byte document",
                    block.id,
                    block.start,
                    block.end,
                    original.len()
                );
            }
            if block.mapping.len() != block.plain_text.chars().count() {
                bail!("block {} has a mapping of the wrong length", block.id);
            }
            if block.mapping.windows(2).any(|w| w[0] > w[1]) {
                bail!("block {} has a decreasing mapping", block.id);
            }
            if block
                .mapping
                .iter()
                .any(|offset| *offset < block.start || *offset >= block.end)
            {
                bail!("block {} maps outside its own span", block.id);
            }
        }
        Ok(())
    }
}

struct Frame {
    depth: usize,
    end: usize,
    cursor: usize,
}

struct Pending {
    id: String,
    kind: &'static str,
    depth: usize,
    raw_start: usize,
    raw_end: usize,
    lines: Option<(String, Vec<Piece>)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Piece {
    raw: usize,
    prepared: usize,
    len: usize,
}

#[derive(Debug, PartialEq, Eq)]
struct Located {
    start: usize,
    end: usize,
    pieces: Option<Vec<Piece>>,
}

pub struct SourceMapCollector<'a> {
    original: &'a str,
    prepared: &'a str,
    replacements: Vec<BlockAnchorReplacement>,
    cursor: usize,
    frames: Vec<Frame>,
    pending: Vec<Pending>,
}

impl<'a> SourceMapCollector<'a> {
    pub fn start(
        original: &'a str,
        prepared: &'a str,
        replacements: Vec<BlockAnchorReplacement>,
    ) -> Self {
        Self {
            original,
            prepared,
            replacements,
            cursor: 0,
            frames: Vec::new(),
            pending: Vec::new(),
        }
    }

    pub fn collect(&mut self, token: &Token, depth: usize) {
        while self.frames.last().is_some_and(|f| f.depth >= depth) {
            self.frames.pop();
        }
        if !is_mappable(token) {
            return;
        }
        let Some(id) = token.block_id.clone() else {
            return;
        };
        let (from, limit) = match self.frames.last() {
            Some(frame) => (frame.cursor, frame.end),
            None => (self.cursor, self.prepared.len()),
        };
        let Some(located) = find_raw(self.prepared, from, limit, &token.raw) else {
            tracing::trace!(block = %id, kind = token.kind_name(), "raw text not found");
            return;
        };
        let (raw_start, raw_end) = (located.start, located.end);
        match self.frames.last_mut() {
            Some(frame) => frame.cursor = raw_end,
            None => self.cursor = raw_end,
        }
        self.frames.push(Frame {
            depth,
            end: raw_end,
            cursor: raw_start,
        });
        self.pending.push(Pending {
            id,
            kind: token.kind_name(),
            depth,
            raw_start,
            raw_end,
            lines: located.pieces.map(|pieces| (token.raw.clone(), pieces)),
        });
    }

    pub fn finish(self, note_id: &str) -> Option<SourceMap> {
        if self.pending.is_empty() {
            return None;
        }
        let original = self.original;
        let prepared = self.prepared;
        let replacements = self.replacements;
        let blocks = self
            .pending
            .into_iter()
            .map(|p| {
                let start =
                    floor_char_boundary(original, prepared_to_original(&replacements, p.raw_start));
                let end = floor_char_boundary(original, prepared_to_original(&replacements, p.raw_end))
                    .max(start);
                let source = original[start..end].to_string();
                let (plain_text, mapping) = match &p.lines {
                    None => plain_text(p.kind, &source, start),
                    Some((raw, pieces)) => {
                        let (text, offsets) = plain_text(p.kind, raw, 0);
                        let mapping = offsets
                            .into_iter()
                            .map(|offset| {
                                let at = piece_offset(prepared, pieces, offset);
                                floor_char_boundary(original, prepared_to_original(&replacements, at))
                            })
                            .collect();
                        (text, mapping)
                    }
                };
                MappedBlock {
                    id: p.id,
                    kind: p.kind,
                    depth: p.depth,
                    raw_start: p.raw_start,
                    raw_end: p.raw_end,
                    start,
                    end,
                    plain_text,
                    mapping,
                    source,
                }
            })
            .collect();
        Some(SourceMap::new(note_id, blocks, replacements))
    }
}

/// Exact search for `raw` in `prepared[from..limit]`, then for its trimmed
/// form, then line by line.
fn find_raw(prepared: &str, from: usize, limit: usize, raw: &str) -> Option<Located> {
    let limit = floor_char_boundary(prepared, limit);
    let from = floor_char_boundary(prepared, from.min(limit));
    let window = &prepared[from..limit];
    let contiguous = |idx: usize, len: usize| Located {
        start: from + idx,
        end: from + idx + len,
        pieces: None,
    };
    if !raw.is_empty() {
        if let Some(idx) = window.find(raw) {
            return Some(contiguous(idx, raw.len()));
        }
    }
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Some(idx) = window.find(trimmed) {
        return Some(contiguous(idx, trimmed.len()));
    }
    find_lines(window, from, raw)
}

fn is_container_prefix(ch: char) -> bool {
    ch == '>' || ch.is_whitespace()
}

/// Children of blockquotes and list items are lexed from text with the
/// `>` markers and indentation removed. Finds each non-blank line of `raw`
/// in order, with only container prefixes and a line break between them.
fn find_lines(window: &str, base: usize, raw: &str) -> Option<Located> {
    let mut lines = Vec::new();
    let mut offset = 0;
    for line in raw.split('\n') {
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            let lead = line.len() - line.trim_start().len();
            lines.push((offset + lead, trimmed));
        }
        offset += line.len() + 1;
    }
    let (&(first_raw, first_line), rest_lines) = lines.split_first()?;
    if rest_lines.is_empty() {
        return None;
    }

    let mut search = 0;
    'candidates: while let Some(found) = window[search..].find(first_line) {
        let first = search + found;
        search = first + first_line.chars().next().map_or(1, char::len_utf8);
        let mut pieces = vec![Piece {
            raw: first_raw,
            prepared: base + first,
            len: first_line.len(),
        }];
        let mut at = first + first_line.len();
        for &(raw_offset, line) in rest_lines {
            let tail = &window[at..];
            let run = tail.len() - tail.trim_start_matches(is_container_prefix).len();
            let Some(gap) = (0..=run).filter(|k| tail.is_char_boundary(*k)).find(|&k| {
                tail[..k].contains('\n') && tail[k..].starts_with(line)
            }) else {
                continue 'candidates;
            };
            pieces.push(Piece {
                raw: raw_offset,
                prepared: base + at + gap,
                len: line.len(),
            });
            at += gap + line.len();
        }
        return Some(Located {
            start: base + first,
            end: base + at,
            pieces: Some(pieces),
        });
    }
    None
}

fn piece_offset(prepared: &str, pieces: &[Piece], raw_offset: usize) -> usize {
    let mut fallback = pieces.first().map_or(0, |p| p.prepared);
    for piece in pieces {
        if raw_offset < piece.raw {
            break;
        }
        if raw_offset < piece.raw + piece.len {
            return piece.prepared + raw_offset - piece.raw;
        }
        let end = piece.prepared + piece.len;
        fallback = prepared[end..].find('\n').map_or(end, |nl| end + nl);
    }
    fallback
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::anchors::inject_block_anchors;
    use crate::extensions::dialect_parser;

    fn collect(source: &str) -> SourceMap {
        let mut replacements = Vec::new();
        let prepared = inject_block_anchors(source, Some(&mut replacements));
        let mut collector = SourceMapCollector::start(source, &prepared, replacements);
        let mut hook = |token: &Token, depth: usize| collector.collect(token, depth);
        dialect_parser().parse(&prepared, Some(&mut hook));
        collector.finish("note.md").expect("blocks collected")
    }

    #[test]
    fn paragraph_after_heading_maps_to_original() {
        let source = "# Title\n\nHello *world*.";
        let map = collect(source);
        let kinds: Vec<&str> = map.blocks.iter().map(|b| b.kind).collect();
        assert_eq!(kinds, vec!["heading", "paragraph"]);
        let para = map.block("blk-1").expect("paragraph");
        assert_eq!(para.plain_text, "Hello world.");
        assert_eq!((para.start, para.end), (9, source.len()));
        assert_eq!(para.mapping[6], 16);
        map.validate(source).expect("valid map");
    }

    #[test]
    fn anchors_do_not_shift_later_blocks() {
        let source = "First ^one\n\nSecond ^two(\"T\")\n\nThird *x*";
        let map = collect(source);
        assert_eq!(map.replacements.len(), 2);
        let texts: Vec<&str> = map.blocks.iter().map(|b| b.plain_text.as_str()).collect();
        assert_eq!(texts, vec!["First ", "Second ", "Third x"]);
        let third = &map.blocks[2];
        assert_eq!(&source[third.start..third.end], "Third *x*");
        assert!(third.raw_start > third.start);
        map.validate(source).expect("valid map");
    }

    #[test]
    fn repeated_text_maps_to_successive_occurrences() {
        let source = "same\n\nsame\n\n- same\n- same";
        let map = collect(source);
        let starts: Vec<usize> = map
            .blocks
            .iter()
            .filter(|b| b.kind != "paragraph" || b.depth == 0)
            .map(|b| b.start)
            .collect();
        assert_eq!(starts[0], 0);
        assert_eq!(starts[1], 6);
        let items: Vec<&MappedBlock> = map
            .blocks
            .iter()
            .filter(|b| b.kind == "list_item")
            .collect();
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].start, 12);
        assert_eq!(items[1].start, 19);
        map.validate(source).expect("valid map");
    }

    #[test]
    fn nested_blocks_stay_inside_their_parent() {
        let source = "| A | B |\n|---|---|\n| B | A |\n\n> quote *q*\n";
        let map = collect(source);
        let cells: Vec<&MappedBlock> = map
            .blocks
            .iter()
            .filter(|b| b.kind == "table_cell")
            .collect();
        assert_eq!(cells.len(), 4);
        assert!(cells.windows(2).all(|w| w[0].start < w[1].start));
        assert_eq!(&source[cells[2].start..cells[2].end], "B");
        assert_eq!(cells[2].start, 22);

        let quote_para = map
            .blocks
            .iter()
            .find(|b| b.kind == "paragraph" && b.depth == 1)
            .expect("paragraph inside quote");
        assert_eq!(quote_para.plain_text, "quote q");
        assert_eq!(
            map.block_at(quote_para.start + 1).map(|b| b.id.as_str()),
            Some(quote_para.id.as_str())
        );
        map.validate(source).expect("valid map");
    }

    #[test]
    fn multi_line_children_of_containers_are_mapped() {
        let source = "> first line *x*\n> second line\n\n- item one\n  continued here\n";
        let map = collect(source);
        let quote_para = map
            .blocks
            .iter()
            .find(|b| b.kind == "paragraph" && b.plain_text.starts_with("first"))
            .expect("paragraph inside quote");
        assert_eq!(quote_para.plain_text, "first line x\nsecond line");
        assert_eq!(&source[quote_para.start..quote_para.end], "first line *x*\n> second line");
        assert_eq!(quote_para.mapping[12], 16);
        assert_eq!(quote_para.mapping[13], 19);

        let item_para = map
            .blocks
            .iter()
            .find(|b| b.kind == "paragraph" && b.plain_text.starts_with("item"))
            .expect("paragraph inside list item");
        assert_eq!(item_para.plain_text, "item one\ncontinued here");
        for (ch, offset) in item_para.plain_text.chars().zip(&item_para.mapping) {
            assert!(source[*offset..].starts_with(ch));
        }
        map.validate(source).expect("valid map");
    }

    #[test]
    fn line_search_requires_prefixes_between_lines() {
        let window = "> a\n> > b\nc b";
        let found = find_lines(window, 10, "a\n> b\n").expect("found");
        assert_eq!((found.start, found.end), (12, 19));
        assert!(find_lines("a c\nb", 0, "a\nb").is_none());
        assert!(find_lines("a\n\n> b", 0, "a\nb").is_some());
    }

    #[test]
    fn math_blocks_are_mapped() {
        let source = "Intro\n\n$$\nx^2\n$$\n";
        let map = collect(source);
        let math = map.blocks.iter().find(|b| b.kind == "math_block").expect("math");
        assert_eq!(math.plain_text, "x^2");
        assert_eq!(math.mapping[0], 10);
    }
}
