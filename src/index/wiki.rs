use std::collections::HashMap;

use crate::store::Note;
use crate::text::{file_stem, strip_extension};

/// Lossy key used to match wikilink text against note names: lowercase,
/// no extension, alphanumerics only. Distinct names can collide ("A-B" and
/// "AB"); the first note in id order keeps the slug.
pub fn slugify(text: &str) -> String {
    let lowered = text.trim().to_lowercase();
    strip_extension(&lowered)
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

#[derive(Debug, Clone, Default)]
pub struct WikiIndex {
    slugs: HashMap<String, String>,
}

impl WikiIndex {
    /// Notes are expected in id order so collisions resolve deterministically.
    pub fn rebuild<'a>(notes: impl IntoIterator<Item = &'a Note>) -> Self {
        let mut slugs: HashMap<String, String> = HashMap::new();
        for note in notes {
            let file_name = note.id.rsplit('/').next().unwrap_or(&note.id);
            let candidates = [
                note.title.as_str(),
                file_name,
                file_stem(&note.id),
                note.id.as_str(),
            ];
            for candidate in candidates {
                let slug = slugify(candidate);
                if slug.is_empty() {
                    continue;
                }
                match slugs.get(&slug) {
                    None => {
                        slugs.insert(slug, note.id.clone());
                    }
                    Some(owner) if *owner != note.id => {
                        tracing::debug!(%slug, kept = %owner, dropped = %note.id, "slug collision");
                    }
                    Some(_) => {}
                }
            }
        }
        tracing::debug!(entries = slugs.len(), "rebuilt wiki index");
        Self { slugs }
    }

    pub fn lookup(&self, target: &str) -> Option<&str> {
        self.slugs.get(&slugify(target)).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.slugs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slugs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Note, NoteType};

    fn note(id: &str) -> Note {
        Note::new(id, NoteType::Markdown, Some(String::new()))
    }

    #[test]
    fn slugify_drops_punctuation_and_extension() {
        assert_eq!(slugify("Daily Log.md"), "dailylog");
        assert_eq!(slugify("daily-log"), "dailylog");
        assert_eq!(slugify("  A-B "), slugify("AB"));
    }

    #[test]
    fn lookup_matches_title_filename_and_path() {
        let notes = vec![note("projects/Road Map.md"), note("paper.pdf")];
        let index = WikiIndex::rebuild(&notes);
        assert_eq!(index.lookup("road map"), Some("projects/Road Map.md"));
        assert_eq!(index.lookup("Road-Map.md"), Some("projects/Road Map.md"));
        assert_eq!(index.lookup("projects/road map"), Some("projects/Road Map.md"));
        assert_eq!(index.lookup("paper.pdf"), Some("paper.pdf"));
        assert_eq!(index.lookup("nothing"), None);
    }

    #[test]
    fn colliding_slugs_keep_first_note() {
        let notes = vec![note("A-B.md"), note("AB.md")];
        let index = WikiIndex::rebuild(&notes);
        assert_eq!(index.lookup("AB"), Some("A-B.md"));
    }
}
