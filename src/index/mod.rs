pub mod blocks;
pub mod hashtags;
pub mod wiki;

pub use blocks::{BlockEntry, BlockIndex};
pub use hashtags::{HashtagIndex, TagAggregate};
pub use wiki::{WikiIndex, slugify};

use crate::store::Note;

#[derive(Debug, Clone, Default)]
pub struct Indices {
    pub wiki: WikiIndex,
    pub blocks: BlockIndex,
    pub tags: HashtagIndex,
}

impl Indices {
    pub fn rebuild<'a>(notes: impl IntoIterator<Item = &'a Note> + Clone) -> Self {
        let indices = Self {
            wiki: WikiIndex::rebuild(notes.clone()),
            blocks: BlockIndex::rebuild(notes.clone()),
            tags: HashtagIndex::rebuild(notes),
        };
        tracing::debug!(
            wiki = indices.wiki.len(),
            blocks = indices.blocks.len(),
            "rebuilt indices"
        );
        indices
    }

    /// Content of one note changed; the note set did not.
    pub fn note_edited(self, note: &Note) -> Self {
        Self {
            wiki: self.wiki,
            blocks: self.blocks.patch(&note.id, blocks::extract_entries(note)),
            tags: self.tags.update_note(note),
        }
    }

    /// The note set changed: titles are re-derived from `notes`, the per-note
    /// tables only lose `removed`.
    pub fn notes_changed<'a>(
        self,
        removed: Option<&str>,
        notes: impl IntoIterator<Item = &'a Note>,
    ) -> Self {
        let (blocks, tags) = match removed {
            Some(id) => (self.blocks.remove_note(id), self.tags.remove_note(id)),
            None => (self.blocks, self.tags),
        };
        Self {
            wiki: WikiIndex::rebuild(notes),
            blocks,
            tags,
        }
    }
}
