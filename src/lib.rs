//! Source-synchronized markdown rendering for a workspace of linked notes.

pub mod anchors;
pub mod app;
pub mod config;
pub mod embed;
pub mod extensions;
pub mod highlight;
pub mod index;
pub mod locate;
pub mod math;
pub mod parser;
pub mod render;
pub mod resolve;
pub mod session;
pub mod sourcemap;
pub mod store;
pub mod text;

pub use render::{Engine, EngineOptions, RenderContext, RenderMode, Rendered};
pub use sourcemap::{MappedBlock, SourceMap};
pub use store::{Note, NoteType, Workspace};
