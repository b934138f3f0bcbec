use anyhow::{Context, Result, bail};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use walkdir::WalkDir;

use crate::index::Indices;
use crate::text::{file_extension, file_stem, normalize_line_endings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NoteType {
    Markdown,
    Code,
    Html,
    Image,
    Video,
    Pdf,
    Notebook,
}

impl NoteType {
    pub fn from_extension(ext: &str) -> Option<Self> {
        let kind = match ext {
            "md" | "markdown" | "mdown" | "mkd" => Self::Markdown,
            "html" | "htm" | "xhtml" => Self::Html,
            "png" | "jpg" | "jpeg" | "gif" | "svg" | "webp" | "bmp" => Self::Image,
            "mp4" | "webm" | "mov" | "m4v" | "ogv" => Self::Video,
            "pdf" => Self::Pdf,
            "ipynb" => Self::Notebook,
            "rs" | "py" | "js" | "ts" | "tsx" | "jsx" | "c" | "h" | "cpp" | "hpp" | "cc" | "go"
            | "java" | "kt" | "rb" | "php" | "cs" | "swift" | "sh" | "bash" | "zsh" | "toml"
            | "yaml" | "yml" | "json" | "xml" | "css" | "scss" | "sql" | "lua" | "hs" | "ml"
            | "tex" | "txt" | "ini" | "cfg" => Self::Code,
            _ => return None,
        };
        Some(kind)
    }

    pub fn for_path(path: &str) -> Option<Self> {
        file_extension(path).and_then(|ext| Self::from_extension(&ext))
    }

    pub fn is_text(self) -> bool {
        matches!(self, Self::Markdown | Self::Code | Self::Html)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Markdown => "markdown",
            Self::Code => "code",
            Self::Html => "html",
            Self::Image => "image",
            Self::Video => "video",
            Self::Pdf => "pdf",
            Self::Notebook => "notebook",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub kind: NoteType,
    pub content: Option<String>,
    pub path: Option<PathBuf>,
    pub dirty: bool,
}

impl Note {
    pub fn new(id: impl Into<String>, kind: NoteType, content: Option<String>) -> Self {
        let id = id.into();
        Self {
            title: file_stem(&id).to_string(),
            id,
            kind,
            content,
            path: None,
            dirty: false,
        }
    }

    pub fn markdown(&self) -> Option<&str> {
        match self.kind {
            NoteType::Markdown => self.content.as_deref(),
            _ => None,
        }
    }
}

pub const DEFAULT_SAVE_DEBOUNCE_MS: u64 = 400;

#[derive(Debug, Clone)]
pub struct SaveDebouncer {
    pending: bool,
    deadline: Option<Instant>,
    delay: Duration,
}

impl SaveDebouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            pending: false,
            deadline: None,
            delay,
        }
    }

    pub fn schedule(&mut self, now: Instant) {
        self.pending = true;
        self.deadline = Some(now + self.delay);
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.pending && self.deadline.is_none_or(|deadline| now >= deadline)
    }

    pub fn is_pending(&self) -> bool {
        self.pending
    }

    fn clear(&mut self) {
        self.pending = false;
        self.deadline = None;
    }
}

impl Default for SaveDebouncer {
    fn default() -> Self {
        Self::new(Duration::from_millis(DEFAULT_SAVE_DEBOUNCE_MS))
    }
}

pub struct Workspace {
    root: Option<PathBuf>,
    notes: BTreeMap<String, Note>,
    indices: Indices,
    saver: SaveDebouncer,
    suppress_reload_until: Option<Instant>,
}

impl Workspace {
    pub fn from_notes(notes: impl IntoIterator<Item = Note>) -> Self {
        let notes: BTreeMap<String, Note> =
            notes.into_iter().map(|n| (n.id.clone(), n)).collect();
        let indices = Indices::rebuild(notes.values());
        Self {
            root: None,
            notes,
            indices,
            saver: SaveDebouncer::default(),
            suppress_reload_until: None,
        }
    }

    pub fn load_dir(root: &Path, save_delay: Duration) -> Result<Self> {
        let root = root
            .canonicalize()
            .with_context(|| format!("Failed to open workspace {}", root.display()))?;
        let mut notes = Vec::new();
        let walker = WalkDir::new(&root)
            .follow_links(true)
            .into_iter()
            .filter_entry(|entry| {
                entry.depth() == 0 || !entry.file_name().to_string_lossy().starts_with('.')
            });
        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::warn!(%err, "skipping unreadable workspace entry");
                    continue;
                }
            };
            if !entry.file_type().is_file() {
                continue;
            }
            let Some(id) = note_id_for(&root, entry.path()) else {
                continue;
            };
            let Some(kind) = NoteType::for_path(&id) else {
                continue;
            };
            match read_note(entry.path(), &id, kind) {
                Ok(note) => notes.push(note),
                Err(err) => tracing::warn!(note = %id, "{err:#}"),
            }
        }
        tracing::info!(root = %root.display(), notes = notes.len(), "loaded workspace");
        let mut workspace = Self::from_notes(notes);
        workspace.root = Some(root);
        workspace.saver = SaveDebouncer::new(save_delay);
        Ok(workspace)
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }

    pub fn note(&self, id: &str) -> Option<&Note> {
        self.notes.get(id)
    }

    pub fn notes(&self) -> impl Iterator<Item = &Note> {
        self.notes.values()
    }

    pub fn indices(&self) -> &Indices {
        &self.indices
    }

    pub fn find(&self, name: &str) -> Option<&Note> {
        let id = name.replace('\\', "/");
        self.notes
            .get(&id)
            .or_else(|| self.indices.wiki.lookup(name).and_then(|id| self.notes.get(id)))
    }

    pub fn note_id_for_path(&self, path: &Path) -> Option<String> {
        let root = self.root.as_deref()?;
        let path = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
        note_id_for(root, &path)
    }

    pub fn edit(&mut self, id: &str, content: &str, now: Instant) -> Result<()> {
        let note = self
            .notes
            .get_mut(id)
            .with_context(|| format!("No note named {id}"))?;
        if !note.kind.is_text() {
            bail!("{id} is a {} note and cannot be edited", note.kind.as_str());
        }
        let content = normalize_line_endings(content).into_owned();
        if note.content.as_deref() == Some(content.as_str()) {
            return Ok(());
        }
        note.content = Some(content);
        note.dirty = true;
        let indices = std::mem::take(&mut self.indices);
        self.indices = indices.note_edited(note);
        self.saver.schedule(now);
        Ok(())
    }

    pub fn create(&mut self, note: Note) -> Result<()> {
        if self.notes.contains_key(&note.id) {
            bail!("A note named {} already exists", note.id);
        }
        let id = note.id.clone();
        self.notes.insert(id.clone(), note);
        self.after_set_change(None, &id);
        Ok(())
    }

    pub fn delete(&mut self, id: &str) -> Result<Note> {
        let note = self
            .notes
            .remove(id)
            .with_context(|| format!("No note named {id}"))?;
        let indices = std::mem::take(&mut self.indices);
        self.indices = indices.notes_changed(Some(id), self.notes.values());
        Ok(note)
    }

    pub fn rename(&mut self, id: &str, new_id: &str) -> Result<()> {
        if self.notes.contains_key(new_id) {
            bail!("A note named {new_id} already exists");
        }
        let mut note = self
            .notes
            .remove(id)
            .with_context(|| format!("No note named {id}"))?;
        if let (Some(root), Some(old_path)) = (self.root.as_deref(), note.path.as_deref()) {
            let new_path = root.join(new_id);
            if let Some(parent) = new_path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            fs::rename(old_path, &new_path)
                .with_context(|| format!("Failed to rename {id} to {new_id}"))?;
            note.path = Some(new_path);
        }
        note.title = file_stem(new_id).to_string();
        note.id = new_id.to_string();
        self.notes.insert(new_id.to_string(), note);
        self.after_set_change(Some(id), new_id);
        Ok(())
    }

    fn after_set_change(&mut self, removed: Option<&str>, added: &str) {
        let indices = std::mem::take(&mut self.indices);
        let mut indices = indices.notes_changed(removed, self.notes.values());
        if let Some(note) = self.notes.get(added) {
            indices = indices.note_edited(note);
        }
        self.indices = indices;
    }

    pub fn reload_path(&mut self, path: &Path, now: Instant) -> Result<Option<String>> {
        if self.suppress_reload_until.is_some_and(|until| now < until) {
            return Ok(None);
        }
        self.suppress_reload_until = None;
        let Some(id) = self.note_id_for_path(path) else {
            return Ok(None);
        };
        let Some(kind) = NoteType::for_path(&id) else {
            return Ok(None);
        };
        if !path.exists() {
            if self.notes.contains_key(&id) {
                self.delete(&id)?;
                return Ok(Some(id));
            }
            return Ok(None);
        }
        let fresh = read_note(path, &id, kind)?;
        match self.notes.get_mut(&id) {
            Some(existing) if existing.dirty => {
                tracing::info!(note = %id, "external change ignored, note has unsaved edits");
                Ok(None)
            }
            Some(existing) if existing.content == fresh.content => Ok(None),
            Some(existing) => {
                existing.content = fresh.content;
                let indices = std::mem::take(&mut self.indices);
                self.indices = indices.note_edited(existing);
                Ok(Some(id))
            }
            None => {
                self.create(fresh)?;
                Ok(Some(id))
            }
        }
    }

    /// Writes dirty notes once the save deadline has passed. A failed write
    /// keeps the save pending and retries after another delay.
    pub fn flush_due(&mut self, now: Instant) -> Result<Vec<String>> {
        if !self.saver.is_due(now) {
            return Ok(Vec::new());
        }
        match self.flush(now) {
            Ok(saved) => {
                self.saver.clear();
                Ok(saved)
            }
            Err(err) => {
                self.saver.schedule(now);
                Err(err)
            }
        }
    }

    pub fn flush(&mut self, now: Instant) -> Result<Vec<String>> {
        let mut saved = Vec::new();
        for note in self.notes.values_mut().filter(|n| n.dirty) {
            let (Some(path), Some(content)) = (note.path.as_deref(), note.content.as_deref())
            else {
                note.dirty = false;
                continue;
            };
            fs::write(path, content)
                .with_context(|| format!("Failed to save {}", path.display()))?;
            note.dirty = false;
            saved.push(note.id.clone());
        }
        if !saved.is_empty() {
            tracing::debug!(count = saved.len(), "saved notes");
            self.suppress_reload_until = Some(now + Duration::from_millis(300));
        }
        Ok(saved)
    }

    pub fn has_pending_save(&self) -> bool {
        self.saver.is_pending()
    }
}

fn note_id_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn read_note(path: &Path, id: &str, kind: NoteType) -> Result<Note> {
    let content = if kind.is_text() {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Some(normalize_line_endings(&text).into_owned())
    } else {
        None
    };
    let mut note = Note::new(id, kind, content);
    note.path = Some(path.to_path_buf());
    Ok(note)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("notemark-{name}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir).expect("create scratch dir");
        dir
    }

    #[test]
    fn note_types_follow_extensions() {
        assert_eq!(NoteType::for_path("a/b.MD"), Some(NoteType::Markdown));
        assert_eq!(NoteType::for_path("clip.webm"), Some(NoteType::Video));
        assert_eq!(NoteType::for_path("main.rs"), Some(NoteType::Code));
        assert_eq!(NoteType::for_path("archive.zip"), None);
        assert!(!NoteType::Pdf.is_text());
    }

    #[test]
    fn debouncer_waits_for_quiet_period() {
        let start = Instant::now();
        let mut saver = SaveDebouncer::new(Duration::from_millis(400));
        assert!(!saver.is_due(start));
        saver.schedule(start);
        assert!(!saver.is_due(start + Duration::from_millis(200)));
        saver.schedule(start + Duration::from_millis(200));
        assert!(!saver.is_due(start + Duration::from_millis(500)));
        assert!(saver.is_due(start + Duration::from_millis(600)));
    }

    #[test]
    fn edits_patch_indices_without_touching_other_notes() {
        let mut ws = Workspace::from_notes([
            Note::new("a.md", NoteType::Markdown, Some("#one text ^blk".into())),
            Note::new("b.md", NoteType::Markdown, Some("#one".into())),
        ]);
        assert_eq!(ws.indices().tags.tag("one").map(|t| t.occurrences), Some(2));

        ws.edit("a.md", "#two", Instant::now()).expect("edit");
        assert!(ws.indices().blocks.get("a.md", "blk").is_none());
        assert_eq!(ws.indices().tags.tag("one").map(|t| t.occurrences), Some(1));
        assert!(ws.note("a.md").is_some_and(|n| n.dirty));
        assert!(ws.has_pending_save());
    }

    #[test]
    fn rename_and_delete_keep_lookups_in_sync() {
        let mut ws = Workspace::from_notes([
            Note::new("Old Name.md", NoteType::Markdown, Some("body ^k #tag".into())),
        ]);
        ws.rename("Old Name.md", "New Name.md").expect("rename");
        assert!(ws.find("old name").is_none());
        assert_eq!(ws.find("new name").map(|n| n.id.as_str()), Some("New Name.md"));
        assert!(ws.indices().blocks.get("New Name.md", "k").is_some());
        assert!(ws.indices().blocks.get("Old Name.md", "k").is_none());
        assert!(ws.indices().tags.is_consistent());

        ws.delete("New Name.md").expect("delete");
        assert!(ws.find("new name").is_none());
        assert!(ws.indices().tags.tag("tag").is_none());
    }

    #[test]
    fn load_dir_reads_text_and_skips_hidden() {
        let dir = scratch_dir("load");
        fs::create_dir_all(dir.join("sub")).expect("subdir");
        fs::create_dir_all(dir.join(".hidden")).expect("hidden");
        fs::write(dir.join("Index.md"), "Hello\r\n").expect("write md");
        fs::write(dir.join("sub/pic.png"), [0u8, 1, 2]).expect("write png");
        fs::write(dir.join(".hidden/secret.md"), "x").expect("write hidden");
        fs::write(dir.join("notes.zip"), "x").expect("write zip");

        let ws = Workspace::load_dir(&dir, Duration::from_millis(10)).expect("load");
        let ids: Vec<&str> = ws.notes().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["Index.md", "sub/pic.png"]);
        assert_eq!(ws.note("Index.md").and_then(|n| n.content.as_deref()), Some("Hello\n"));
        assert!(ws.note("sub/pic.png").is_some_and(|n| n.content.is_none()));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn flush_writes_dirty_notes_after_deadline() {
        let dir = scratch_dir("flush");
        fs::write(dir.join("a.md"), "old").expect("write");
        let mut ws = Workspace::load_dir(&dir, Duration::from_millis(50)).expect("load");
        let start = Instant::now();
        ws.edit("a.md", "new", start).expect("edit");
        assert!(ws.flush_due(start).expect("early flush").is_empty());
        let saved = ws
            .flush_due(start + Duration::from_millis(60))
            .expect("flush");
        assert_eq!(saved, vec!["a.md".to_string()]);
        assert_eq!(fs::read_to_string(dir.join("a.md")).expect("read"), "new");
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn failed_save_is_retried() {
        let dir = scratch_dir("retry");
        fs::write(dir.join("a.md"), "old").expect("write");
        let mut ws = Workspace::load_dir(&dir, Duration::from_millis(50)).expect("load");
        let start = Instant::now();
        ws.edit("a.md", "new", start).expect("edit");
        fs::remove_dir_all(&dir).expect("remove dir");

        let failed_at = start + Duration::from_millis(60);
        assert!(ws.flush_due(failed_at).is_err());
        assert!(ws.has_pending_save());
        assert!(ws.note("a.md").is_some_and(|n| n.dirty));

        fs::create_dir_all(&dir).expect("recreate dir");
        assert!(ws.flush_due(failed_at + Duration::from_millis(10)).expect("not due").is_empty());
        let saved = ws
            .flush_due(failed_at + Duration::from_millis(60))
            .expect("retry");
        assert_eq!(saved, vec!["a.md".to_string()]);
        assert!(!ws.has_pending_save());
        assert_eq!(fs::read_to_string(dir.join("a.md")).expect("read"), "new");
        let _ = fs::remove_dir_all(&dir);
    }
}
