use std::collections::{BTreeSet, HashMap};

use serde::Serialize;

use crate::anchors::{normalize_label, scan_block_anchors};
use crate::store::Note;
use crate::text::{collapse_whitespace, truncate_chars};

const SNIPPET_CHARS: usize = 60;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockEntry {
    pub note_id: String,
    pub label: String,
    pub raw_label: String,
    pub title: String,
}

pub fn block_key(note_id: &str, label: &str) -> String {
    format!("{note_id}::{}", normalize_label(label))
}

/// Anchors of one markdown note. Later duplicates of a label are ignored.
pub fn extract_entries(note: &Note) -> Vec<BlockEntry> {
    let Some(content) = note.markdown() else {
        return Vec::new();
    };
    let mut seen = BTreeSet::new();
    scan_block_anchors(content)
        .into_iter()
        .filter(|anchor| seen.insert(anchor.label.clone()))
        .map(|anchor| {
            let title = match anchor.title.filter(|t| !t.trim().is_empty()) {
                Some(title) => title,
                None => line_snippet(content, anchor.start),
            };
            BlockEntry {
                note_id: note.id.clone(),
                label: anchor.label,
                raw_label: anchor.raw_label,
                title,
            }
        })
        .collect()
}

fn line_snippet(content: &str, anchor_start: usize) -> String {
    let line_start = content[..anchor_start].rfind('\n').map_or(0, |i| i + 1);
    let line = content[line_start..anchor_start]
        .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, '#' | '>' | '-' | '*' | '+'));
    let collapsed = collapse_whitespace(line);
    truncate_chars(&collapsed, SNIPPET_CHARS).to_string()
}

/// Markdown of the block carrying `^label`, without the anchor itself.
///
/// A list item or table row anchor yields just that line; anything else
/// yields the surrounding run of non-blank lines.
pub fn extract_block_markdown(content: &str, label: &str) -> Option<String> {
    let wanted = normalize_label(label);
    let anchor = scan_block_anchors(content)
        .into_iter()
        .find(|a| a.label == wanted)?;

    let line_start = content[..anchor.start].rfind('\n').map_or(0, |i| i + 1);
    let line_end = content[anchor.end..]
        .find('\n')
        .map_or(content.len(), |i| anchor.end + i);
    let line = &content[line_start..line_end];
    let trimmed = line.trim_start();
    let single_line = trimmed.starts_with("- ")
        || trimmed.starts_with("* ")
        || trimmed.starts_with("+ ")
        || trimmed.starts_with('|')
        || trimmed.split_once(". ").is_some_and(|(n, _)| {
            !n.is_empty() && n.chars().all(|c| c.is_ascii_digit())
        });

    let (start, end) = if single_line {
        (line_start, line_end)
    } else {
        let start = content[..line_start]
            .rfind("\n\n")
            .map_or(0, |i| i + 2);
        let end = content[line_end..]
            .find("\n\n")
            .map_or(content.len(), |i| line_end + i);
        (start, end)
    };

    let mut block = String::with_capacity(end - start);
    block.push_str(&content[start..anchor.start]);
    block.push_str(&content[anchor.end..end]);
    let block = block.trim_end().to_string();
    if single_line {
        // Bullet marker off, so it is not a one-item list.
        let body = block.trim_start();
        let body = ["- ", "* ", "+ "]
            .iter()
            .find_map(|m| body.strip_prefix(m))
            .unwrap_or(body);
        return Some(body.to_string());
    }
    Some(block)
}

#[derive(Debug, Clone, Default)]
pub struct BlockIndex {
    entries: HashMap<String, BlockEntry>,
    labels_by_note: HashMap<String, BTreeSet<String>>,
}

impl BlockIndex {
    pub fn rebuild<'a>(notes: impl IntoIterator<Item = &'a Note>) -> Self {
        notes.into_iter().fold(Self::default(), |index, note| {
            index.patch(&note.id, extract_entries(note))
        })
    }

    pub fn patch(mut self, note_id: &str, fresh: Vec<BlockEntry>) -> Self {
        let previous = self.labels_by_note.remove(note_id).unwrap_or_default();
        let current: BTreeSet<String> = fresh.iter().map(|e| e.label.clone()).collect();

        for stale in previous.difference(&current) {
            self.entries.remove(&block_key(note_id, stale));
        }
        for entry in fresh {
            self.entries.insert(block_key(note_id, &entry.label), entry);
        }
        if !current.is_empty() {
            self.labels_by_note.insert(note_id.to_string(), current);
        }
        self
    }

    pub fn remove_note(self, note_id: &str) -> Self {
        self.patch(note_id, Vec::new())
    }

    pub fn get(&self, note_id: &str, label: &str) -> Option<&BlockEntry> {
        self.entries.get(&block_key(note_id, label))
    }

    pub fn entries_for<'a>(
        &'a self,
        note_id: &str,
    ) -> impl Iterator<Item = &'a BlockEntry> + use<'a> {
        let labels = self.labels_by_note.get(note_id);
        let note_id = note_id.to_string();
        labels
            .into_iter()
            .flatten()
            .filter_map(move |label| self.entries.get(&block_key(&note_id, label)))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Note, NoteType};

    fn note(id: &str, content: &str) -> Note {
        Note::new(id, NoteType::Markdown, Some(content.to_string()))
    }

    #[test]
    fn entries_use_title_or_line_snippet() {
        let n = note("a.md", "# Intro ^top\n\nSome   key idea ^Key(\"The key\")\n");
        let entries = extract_entries(&n);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].label, "top");
        assert_eq!(entries[0].title, "Intro");
        assert_eq!(entries[1].label, "key");
        assert_eq!(entries[1].raw_label, "Key");
        assert_eq!(entries[1].title, "The key");
    }

    #[test]
    fn keys_are_case_insensitive() {
        let index = BlockIndex::rebuild(&[note("a.md", "text ^MyBlock")]);
        assert!(index.get("a.md", "myblock").is_some());
        assert!(index.get("a.md", "^MYBLOCK").is_some());
        assert!(index.get("b.md", "myblock").is_none());
    }

    #[test]
    fn patch_drops_vanished_labels_and_keeps_others() {
        let before = note("a.md", "one ^x\n\ntwo ^y\n");
        let index = BlockIndex::rebuild([&before, &note("b.md", "other ^x")]);
        assert_eq!(index.len(), 3);

        let after = note("a.md", "two ^y\n\nthree ^z\n");
        let index = index.patch("a.md", extract_entries(&after));
        assert!(index.get("a.md", "x").is_none());
        assert!(index.get("a.md", "y").is_some());
        assert!(index.get("a.md", "z").is_some());
        assert!(index.get("b.md", "x").is_some());

        let labels: Vec<&str> = index.entries_for("a.md").map(|e| e.label.as_str()).collect();
        assert_eq!(labels, vec!["y", "z"]);

        let index = index.remove_note("a.md");
        assert_eq!(index.len(), 1);
        assert_eq!(index.entries_for("a.md").count(), 0);
    }

    #[test]
    fn block_markdown_for_paragraph_and_list_item() {
        let content = "Intro line\nstill intro ^p1\n\n- first\n- second ^li\n\nOutro";
        assert_eq!(
            extract_block_markdown(content, "p1").as_deref(),
            Some("Intro line\nstill intro")
        );
        assert_eq!(extract_block_markdown(content, "LI").as_deref(), Some("second"));
        assert_eq!(extract_block_markdown(content, "nope"), None);
    }
}
