use serde::Serialize;
use std::ops::Range;

use crate::anchors::normalize_label;
use crate::index::BlockEntry;
use crate::index::blocks::extract_entries;
use crate::store::Workspace;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WikiTarget<'a> {
    pub note: &'a str,
    pub block: Option<&'a str>,
    pub alias: Option<&'a str>,
}

pub fn parse_target(inner: &str) -> WikiTarget<'_> {
    let (target, alias) = match inner.split_once('|') {
        Some((target, alias)) => (target, Some(alias.trim()).filter(|a| !a.is_empty())),
        None => (inner, None),
    };
    let (note, fragment) = match target.split_once('#') {
        Some((note, fragment)) => (note, Some(fragment)),
        None => (target, None),
    };
    let block = fragment
        .and_then(|f| f.trim().strip_prefix('^'))
        .map(str::trim)
        .filter(|label| !label.is_empty());
    WikiTarget {
        note: note.trim(),
        block,
        alias,
    }
}

/// Byte range of `inner` that a wikilink displays: the alias if present,
/// else the note part, else everything.
pub fn wikilink_display(inner: &str) -> Range<usize> {
    if let Some(bar) = inner.find('|') {
        let alias = &inner[bar + 1..];
        let lead = alias.len() - alias.trim_start().len();
        let trimmed = alias.trim();
        if !trimmed.is_empty() {
            let start = bar + 1 + lead;
            return start..start + trimmed.len();
        }
    }
    let target = inner.split('|').next().unwrap_or(inner);
    let note = target.split('#').next().unwrap_or(target);
    let lead = note.len() - note.trim_start().len();
    let trimmed = note.trim();
    if trimmed.is_empty() {
        return 0..target.len();
    }
    lead..lead + trimmed.len()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WikiTargetInfo {
    pub target: String,
    pub note_id: Option<String>,
    pub block_id: Option<String>,
    pub has_block: bool,
    pub block_entry: Option<BlockEntry>,
}

impl WikiTargetInfo {
    pub fn is_resolved(&self) -> bool {
        self.note_id.is_some()
    }

    pub fn is_missing_block(&self) -> bool {
        self.has_block && self.block_entry.is_none()
    }

    pub fn status_message(&self) -> String {
        match (&self.note_id, &self.block_id) {
            (None, _) => format!("No file found for \"{}\"", self.target),
            (Some(note), Some(block)) if self.block_entry.is_none() => {
                format!("No block ^{block} in {note}")
            }
            (Some(note), Some(block)) => format!("{note} ^{block}"),
            (Some(note), None) => note.clone(),
        }
    }
}

/// Resolves `inner` (the text between `[[` and `]]`) as seen from
/// `from_note`. An empty note part refers to `from_note` itself.
pub fn resolve_target(inner: &str, workspace: &Workspace, from_note: &str) -> WikiTargetInfo {
    let parsed = parse_target(inner);
    let note_id = if parsed.note.is_empty() {
        workspace.note(from_note).map(|n| n.id.clone())
    } else {
        workspace.find(parsed.note).map(|n| n.id.clone())
    };
    let block_id = parsed.block.map(normalize_label);
    let block_entry = match (&note_id, &block_id) {
        (Some(note_id), Some(label)) => lookup_block(workspace, note_id, label),
        _ => None,
    };
    WikiTargetInfo {
        target: inner.split('|').next().unwrap_or(inner).trim().to_string(),
        has_block: block_id.is_some(),
        note_id,
        block_id,
        block_entry,
    }
}

/// Index lookup, retried once against a fresh scan of the note in case the
/// index lags behind an edit.
fn lookup_block(workspace: &Workspace, note_id: &str, label: &str) -> Option<BlockEntry> {
    if let Some(entry) = workspace.indices().blocks.get(note_id, label) {
        return Some(entry.clone());
    }
    let note = workspace.note(note_id)?;
    let found = extract_entries(note)
        .into_iter()
        .find(|entry| entry.label == label);
    if found.is_some() {
        tracing::debug!(note = note_id, label, "block found after rescan");
    }
    found
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Note, NoteType, Workspace};

    fn workspace() -> Workspace {
        Workspace::from_notes([
            Note::new("Alpha.md", NoteType::Markdown, Some("Alpha body ^Intro".into())),
            Note::new("docs/Beta Notes.md", NoteType::Markdown, Some("beta".into())),
        ])
    }

    #[test]
    fn parse_target_splits_block_and_alias() {
        let t = parse_target("Alpha#^Intro|the intro");
        assert_eq!(t.note, "Alpha");
        assert_eq!(t.block, Some("Intro"));
        assert_eq!(t.alias, Some("the intro"));

        let t = parse_target("#^local");
        assert_eq!(t.note, "");
        assert_eq!(t.block, Some("local"));

        let t = parse_target("Alpha#Heading");
        assert_eq!(t.block, None);
    }

    #[test]
    fn display_prefers_alias_then_note() {
        let inner = "Alpha#^x| Shown ";
        assert_eq!(&inner[wikilink_display(inner)], "Shown");
        let inner = "Alpha#^x";
        assert_eq!(&inner[wikilink_display(inner)], "Alpha");
        let inner = "#^x";
        assert_eq!(&inner[wikilink_display(inner)], "#^x");
    }

    #[test]
    fn resolves_notes_and_blocks() {
        let ws = workspace();
        let info = resolve_target("beta notes", &ws, "Alpha.md");
        assert_eq!(info.note_id.as_deref(), Some("docs/Beta Notes.md"));
        assert!(!info.has_block);

        let info = resolve_target("Alpha#^INTRO", &ws, "docs/Beta Notes.md");
        assert_eq!(info.block_id.as_deref(), Some("intro"));
        assert_eq!(
            info.block_entry.as_ref().map(|e| e.raw_label.as_str()),
            Some("Intro")
        );

        let info = resolve_target("#^intro", &ws, "Alpha.md");
        assert_eq!(info.note_id.as_deref(), Some("Alpha.md"));
        assert!(info.block_entry.is_some());
    }

    #[test]
    fn missing_targets_report_without_failing() {
        let ws = workspace();
        let info = resolve_target("Missing Note", &ws, "Alpha.md");
        assert!(!info.is_resolved());
        assert_eq!(info.status_message(), "No file found for \"Missing Note\"");

        let info = resolve_target("Alpha#^gone", &ws, "Alpha.md");
        assert!(info.is_missing_block());
        assert_eq!(info.status_message(), "No block ^gone in Alpha.md");
    }
}
