use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::store::Note;
use crate::text::{collapse_whitespace, truncate_chars};

const SNIPPET_CHARS: usize = 80;

fn hashtag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?:^|[^\p{L}\p{N}_&#/\\])#([\p{L}\p{N}_][\p{L}\p{N}_/-]*)")
            .expect("valid hashtag pattern")
    })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagOccurrence {
    pub index: usize,
    pub length: usize,
    pub snippet: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NoteTagEntry {
    pub occurrences: Vec<TagOccurrence>,
    pub forms: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TagAggregate {
    pub tag: String,
    pub note_ids: BTreeSet<String>,
    pub forms: BTreeMap<String, usize>,
    pub occurrences: usize,
}

pub fn normalize_tag(tag: &str) -> String {
    tag.trim().trim_start_matches('#').to_lowercase()
}

pub fn extract_hashtags(content: &str) -> BTreeMap<String, NoteTagEntry> {
    let masked = mask_code(content);
    let mut found: BTreeMap<String, NoteTagEntry> = BTreeMap::new();
    for caps in hashtag_regex().captures_iter(&masked) {
        let Some(body) = caps.get(1) else { continue };
        let form = body.as_str().trim_end_matches(['/', '-']);
        if form.is_empty() || form.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let index = body.start() - 1;
        let length = form.len() + 1;
        let entry = found.entry(normalize_tag(form)).or_default();
        entry.occurrences.push(TagOccurrence {
            index,
            length,
            snippet: snippet_around(content, index),
        });
        *entry.forms.entry(form.to_string()).or_default() += 1;
    }
    found
}

fn snippet_around(content: &str, index: usize) -> String {
    let start = content[..index].rfind('\n').map_or(0, |i| i + 1);
    let end = content[index..]
        .find('\n')
        .map_or(content.len(), |i| index + i);
    let line = collapse_whitespace(&content[start..end]);
    truncate_chars(&line, SNIPPET_CHARS).to_string()
}

/// Blanks fenced code and inline code spans with spaces, keeping every
/// byte offset intact.
fn mask_code(content: &str) -> String {
    let mut bytes = content.as_bytes().to_vec();
    let mut offset = 0;
    let mut fence: Option<(u8, usize)> = None;
    for line in content.split_inclusive('\n') {
        let line_start = offset;
        offset += line.len();
        let trimmed = line.trim_start_matches(' ');
        let indent = line.len() - trimmed.len();
        let run_char = trimmed.bytes().next().filter(|b| matches!(b, b'`' | b'~'));
        let run = run_char.map_or(0, |c| trimmed.bytes().take_while(|b| *b == c).count());

        if let Some((ch, len)) = fence {
            bytes[line_start..offset].fill(b' ');
            if indent < 4 && run_char == Some(ch) && run >= len && trimmed[run..].trim().is_empty() {
                fence = None;
            }
            continue;
        }
        if indent < 4 && run >= 3 {
            if let Some(ch) = run_char {
                fence = Some((ch, run));
                bytes[line_start..offset].fill(b' ');
                continue;
            }
        }
        mask_code_spans(line, &mut bytes[line_start..offset]);
    }
    String::from_utf8(bytes).unwrap_or_else(|_| content.to_string())
}

fn mask_code_spans(line: &str, bytes: &mut [u8]) {
    let mut idx = 0;
    while let Some(found) = line[idx..].find('`') {
        let open = idx + found;
        let ticks = line[open..].bytes().take_while(|b| *b == b'`').count();
        let body_start = open + ticks;
        let mut search = body_start;
        let mut close = None;
        while let Some(next) = line[search..].find('`') {
            let at = search + next;
            let run = line[at..].bytes().take_while(|b| *b == b'`').count();
            if run == ticks {
                close = Some(at + run);
                break;
            }
            search = at + run;
        }
        match close {
            Some(end) => {
                bytes[open..end].fill(b' ');
                idx = end;
            }
            None => idx = body_start,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct HashtagIndex {
    tags: BTreeMap<String, TagAggregate>,
    per_note: HashMap<String, BTreeMap<String, NoteTagEntry>>,
}

impl HashtagIndex {
    pub fn rebuild<'a>(notes: impl IntoIterator<Item = &'a Note>) -> Self {
        notes
            .into_iter()
            .fold(Self::default(), |index, note| index.update_note(note))
    }

    pub fn update_note(self, note: &Note) -> Self {
        let mut index = self.remove_note(&note.id);
        let Some(content) = note.markdown() else {
            return index;
        };
        let fresh = extract_hashtags(content);
        if fresh.is_empty() {
            return index;
        }
        for (tag, entry) in &fresh {
            let aggregate = index
                .tags
                .entry(tag.clone())
                .or_insert_with(|| TagAggregate {
                    tag: tag.clone(),
                    note_ids: BTreeSet::new(),
                    forms: BTreeMap::new(),
                    occurrences: 0,
                });
            aggregate.note_ids.insert(note.id.clone());
            aggregate.occurrences += entry.occurrences.len();
            for (form, count) in &entry.forms {
                *aggregate.forms.entry(form.clone()).or_default() += count;
            }
        }
        index.per_note.insert(note.id.clone(), fresh);
        index
    }

    pub fn remove_note(mut self, note_id: &str) -> Self {
        let Some(previous) = self.per_note.remove(note_id) else {
            return self;
        };
        for (tag, entry) in previous {
            let Some(aggregate) = self.tags.get_mut(&tag) else {
                continue;
            };
            aggregate.occurrences = aggregate
                .occurrences
                .saturating_sub(entry.occurrences.len());
            aggregate.note_ids.remove(note_id);
            for (form, count) in entry.forms {
                if let Some(total) = aggregate.forms.get_mut(&form) {
                    *total = total.saturating_sub(count);
                    if *total == 0 {
                        aggregate.forms.remove(&form);
                    }
                }
            }
            if aggregate.occurrences == 0 || aggregate.note_ids.is_empty() {
                self.tags.remove(&tag);
            }
        }
        self
    }

    pub fn tag(&self, tag: &str) -> Option<&TagAggregate> {
        self.tags.get(&normalize_tag(tag))
    }

    pub fn tags(&self) -> impl Iterator<Item = &TagAggregate> {
        self.tags.values()
    }

    pub fn note_tags(&self, note_id: &str) -> Option<&BTreeMap<String, NoteTagEntry>> {
        self.per_note.get(note_id)
    }

    /// Aggregate counts agree with the per-note maps and no empty
    /// aggregate is kept.
    pub fn is_consistent(&self) -> bool {
        let mut expected: BTreeMap<&str, (usize, BTreeSet<&str>)> = BTreeMap::new();
        for (note_id, tags) in &self.per_note {
            for (tag, entry) in tags {
                let slot = expected.entry(tag.as_str()).or_default();
                slot.0 += entry.occurrences.len();
                slot.1.insert(note_id.as_str());
            }
        }
        if expected.len() != self.tags.len() {
            return false;
        }
        self.tags.iter().all(|(tag, aggregate)| {
            aggregate.occurrences > 0
                && expected.get(tag.as_str()).is_some_and(|(count, notes)| {
                    *count == aggregate.occurrences
                        && notes.iter().copied().eq(aggregate.note_ids.iter().map(String::as_str))
                })
        })
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
    fn extraction_skips_code_headings_and_numbers() {
        let content = "# Heading\n\nWork on #Rust and #rust/async, see #42.\n\n```\n#notatag\n```\n\nInline `#nope` but #yes-\nmail a#b";
        let tags = extract_hashtags(content);
        let names: Vec<&str> = tags.keys().map(String::as_str).collect();
        assert_eq!(names, vec!["rust", "rust/async", "yes"]);

        let rust = &tags["rust"];
        assert_eq!(rust.occurrences.len(), 1);
        assert_eq!(rust.forms.get("Rust"), Some(&1));
        let occ = &rust.occurrences[0];
        assert_eq!(&content[occ.index..occ.index + occ.length], "#Rust");
        assert_eq!(occ.snippet, "Work on #Rust and #rust/async, see #42.");
        assert_eq!(tags["yes"].occurrences[0].length, 4);
    }

    #[test]
    fn forms_are_counted_per_spelling() {
        let tags = extract_hashtags("#Todo then #todo and #TODO and #todo");
        let todo = &tags["todo"];
        assert_eq!(todo.occurrences.len(), 4);
        assert_eq!(todo.forms.get("todo"), Some(&2));
        assert_eq!(todo.forms.get("Todo"), Some(&1));
    }

    #[test]
    fn edits_and_removals_keep_aggregates_consistent() {
        let a = note("a.md", "#alpha #shared");
        let b = note("b.md", "#shared #shared #beta");
        let index = HashtagIndex::rebuild([&a, &b]);
        assert!(index.is_consistent());
        assert_eq!(index.tag("#Shared").map(|t| t.occurrences), Some(3));

        let index = index.update_note(&note("a.md", "#gamma"));
        assert!(index.is_consistent());
        assert!(index.tag("alpha").is_none());
        let shared = index.tag("shared").expect("shared survives in b");
        assert_eq!(shared.occurrences, 2);
        assert_eq!(shared.note_ids.len(), 1);

        let index = index.remove_note("b.md");
        assert!(index.is_consistent());
        assert!(index.tag("shared").is_none());
        assert!(index.tag("beta").is_none());
        let names: Vec<&str> = index.tags().map(|t| t.tag.as_str()).collect();
        assert_eq!(names, vec!["gamma"]);
    }

    #[test]
    fn note_without_tags_leaves_no_per_note_map() {
        let index = HashtagIndex::rebuild([&note("a.md", "no tags here")]);
        assert!(index.note_tags("a.md").is_none());
        assert!(index.is_consistent());
    }
}
