use anyhow::Result;
use serde::Serialize;

use crate::index::blocks::extract_block_markdown;
use crate::render::RenderContext;
use crate::resolve::WikiTargetInfo;
use crate::store::{Note, NoteType};
use crate::text::{escape_html, file_extension};

const CODE_PREVIEW_LINES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbedVariant {
    MissingTarget,
    NoteNotLoaded,
    UnsupportedType,
    SelfBlockReference,
    MissingBlock,
    CircularReference,
    /// Whole-note embed of a non-markdown note.
    Preview,
    Success,
}

impl EmbedVariant {
    pub fn class(self) -> &'static str {
        match self {
            Self::MissingTarget => "missing-target",
            Self::NoteNotLoaded => "note-not-loaded",
            Self::UnsupportedType => "unsupported-type",
            Self::SelfBlockReference => "self-block-reference",
            Self::MissingBlock => "missing-block",
            Self::CircularReference => "circular-reference",
            Self::Preview => "preview",
            Self::Success => "success",
        }
    }

    pub fn is_error(self) -> bool {
        !matches!(self, Self::Preview | Self::Success)
    }
}

pub fn classify_embed(info: &WikiTargetInfo, ctx: &RenderContext<'_>) -> EmbedVariant {
    let Some(note_id) = info.note_id.as_deref() else {
        return EmbedVariant::MissingTarget;
    };
    let Some(note) = ctx.workspace.note(note_id) else {
        return EmbedVariant::NoteNotLoaded;
    };
    let markdown = note.kind == NoteType::Markdown;
    if markdown && note.content.is_none() {
        return EmbedVariant::NoteNotLoaded;
    }
    if info.has_block && !markdown {
        return EmbedVariant::UnsupportedType;
    }
    if info.has_block && note_id == ctx.note_id {
        return EmbedVariant::SelfBlockReference;
    }
    if info.is_missing_block() {
        return EmbedVariant::MissingBlock;
    }
    if ctx.would_cycle(note_id) {
        return EmbedVariant::CircularReference;
    }
    if !markdown {
        return EmbedVariant::Preview;
    }
    EmbedVariant::Success
}

pub fn render_embed(info: &WikiTargetInfo, ctx: &RenderContext<'_>) -> Result<String> {
    let variant = classify_embed(info, ctx);
    tracing::debug!(target = %info.target, variant = variant.class(), depth = ctx.depth, "embed");
    let note = info.note_id.as_deref().and_then(|id| ctx.workspace.note(id));
    match (variant, note) {
        (EmbedVariant::Success, Some(note)) => render_note_embed(info, note, ctx),
        (EmbedVariant::Preview, Some(note)) => Ok(render_preview(note, ctx)),
        _ => Ok(error_embed(variant, info, ctx)),
    }
}

fn render_note_embed<'a>(
    info: &WikiTargetInfo,
    note: &'a Note,
    ctx: &RenderContext<'a>,
) -> Result<String> {
    let content = note.markdown().unwrap_or_default();
    let body = match &info.block_entry {
        Some(entry) => match extract_block_markdown(content, &entry.raw_label) {
            Some(block) => block,
            None => return Ok(error_embed(EmbedVariant::MissingBlock, info, ctx)),
        },
        None => content.to_string(),
    };
    let child = ctx.descend(&note.id);
    let inner = ctx.engine.render_markdown(&body, &child)?;
    let mut attrs = format!(" data-note-id=\"{}\"", escape_html(&note.id));
    if let Some(block) = &info.block_id {
        attrs.push_str(&format!(" data-block-id=\"{}\"", escape_html(block)));
    }
    Ok(format!(
        "<div class=\"embed embed-note\"{attrs} data-embed-depth=\"{}\">\
<div class=\"embed-header\"><a class=\"wikilink\" href=\"#\" data-note-id=\"{}\">{}</a></div>\
<div class=\"embed-body\">{inner}</div></div>",
        child.depth,
        escape_html(&note.id),
        escape_html(&note.title)
    ))
}

fn render_preview(note: &Note, ctx: &RenderContext<'_>) -> String {
    let id = escape_html(&note.id);
    let title = escape_html(&note.title);
    let depth = ctx.depth + 1;
    let open = format!(
        "<div class=\"embed embed-{}\" data-note-id=\"{id}\" data-embed-depth=\"{depth}\">",
        note.kind.as_str()
    );
    let body = match note.kind {
        NoteType::Code => {
            let code = note.content.as_deref().unwrap_or_default();
            let preview: String = code
                .split_inclusive('\n')
                .take(CODE_PREVIEW_LINES)
                .collect();
            let lang = file_extension(&note.id);
            match ctx.engine.highlighter().highlight(&preview, lang.as_deref()) {
                Ok(html) => html,
                Err(err) => {
                    tracing::debug!(note = %note.id, "{err:#}");
                    format!("<pre><code>{}</code></pre>", escape_html(&preview))
                }
            }
        }
        NoteType::Html => format!(
            "<iframe class=\"html-fence\" sandbox=\"allow-scripts\" srcdoc=\"{}\"></iframe>",
            escape_html(note.content.as_deref().unwrap_or_default())
        ),
        NoteType::Image => {
            let ticket = ctx.resources.request(note).to_attr();
            format!("<img alt=\"{title}\" data-resource-ticket=\"{ticket}\">")
        }
        NoteType::Video => {
            let ticket = ctx.resources.request(note).to_attr();
            format!("<video controls data-resource-ticket=\"{ticket}\"></video>")
        }
        NoteType::Pdf | NoteType::Notebook => {
            let ticket = ctx.resources.request(note).to_attr();
            format!(
                "<div class=\"embed-placeholder\" data-resource-ticket=\"{ticket}\">{title}</div>"
            )
        }
        NoteType::Markdown => String::new(),
    };
    format!("{open}{body}</div>")
}

fn error_message(variant: EmbedVariant, info: &WikiTargetInfo, ctx: &RenderContext<'_>) -> String {
    let note = info.note_id.as_deref().unwrap_or(info.target.as_str());
    let block = info.block_id.as_deref().unwrap_or_default();
    match variant {
        EmbedVariant::NoteNotLoaded => format!("{note} is not loaded yet"),
        EmbedVariant::UnsupportedType => {
            format!("Block embeds need a markdown note, {note} is not one")
        }
        EmbedVariant::SelfBlockReference => {
            format!("A note cannot embed its own block ^{block}")
        }
        EmbedVariant::CircularReference if ctx.visited.contains(note) => {
            format!("Circular reference to {note}")
        }
        EmbedVariant::CircularReference => format!(
            "Embeds nest deeper than {} levels",
            ctx.engine.max_embed_depth()
        ),
        _ => info.status_message(),
    }
}

fn error_embed(variant: EmbedVariant, info: &WikiTargetInfo, ctx: &RenderContext<'_>) -> String {
    let mut attrs = format!(" data-wiki-target=\"{}\"", escape_html(&info.target));
    if let Some(note) = &info.note_id {
        attrs.push_str(&format!(" data-note-id=\"{}\"", escape_html(note)));
    }
    if let Some(block) = &info.block_id {
        attrs.push_str(&format!(" data-block-id=\"{}\"", escape_html(block)));
    }
    if info.is_missing_block() {
        attrs.push_str(" data-missing-block=\"true\"");
    }
    format!(
        "<div class=\"embed embed-error embed-{}\"{attrs} data-embed-depth=\"{}\">\
<span class=\"embed-error-message\">{}</span></div>",
        variant.class(),
        ctx.depth + 1,
        escape_html(&error_message(variant, info, ctx))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::{Engine, RenderContext};
    use crate::resolve::resolve_target;
    use crate::session::ResourceSink;
    use crate::store::{Note, NoteType, Workspace};

    fn md(id: &str, body: &str) -> Note {
        Note::new(id, NoteType::Markdown, Some(body.to_string()))
    }

    fn classify(ws: &Workspace, from: &str, target: &str) -> EmbedVariant {
        let engine = Engine::default();
        let sink = ResourceSink::new(1);
        let ctx = RenderContext::root(&engine, ws, from, &sink);
        classify_embed(&resolve_target(target, ws, from), &ctx)
    }

    #[test]
    fn variants_follow_check_order() {
        let ws = Workspace::from_notes([
            md("A.md", "A body ^a1"),
            md("B.md", "B body ^b1"),
            Note::new("pic.png", NoteType::Image, None),
            Note::new("Draft.md", NoteType::Markdown, None),
        ]);
        assert_eq!(classify(&ws, "A.md", "Nope"), EmbedVariant::MissingTarget);
        assert_eq!(classify(&ws, "A.md", "Draft"), EmbedVariant::NoteNotLoaded);
        assert_eq!(classify(&ws, "A.md", "pic.png#^x"), EmbedVariant::UnsupportedType);
        assert_eq!(classify(&ws, "A.md", "A#^a1"), EmbedVariant::SelfBlockReference);
        assert_eq!(classify(&ws, "A.md", "#^a1"), EmbedVariant::SelfBlockReference);
        assert_eq!(classify(&ws, "A.md", "B#^zz"), EmbedVariant::MissingBlock);
        assert_eq!(classify(&ws, "A.md", "A"), EmbedVariant::CircularReference);
        assert_eq!(classify(&ws, "A.md", "pic.png"), EmbedVariant::Preview);
        assert_eq!(classify(&ws, "A.md", "B#^b1"), EmbedVariant::Success);
        assert_eq!(classify(&ws, "A.md", "B"), EmbedVariant::Success);
    }

    #[test]
    fn block_embed_renders_only_that_block() {
        let ws = Workspace::from_notes([
            md("A.md", "![[B#^keep]]"),
            md("B.md", "Skip this.\n\nKeep *this* ^keep\n\nAnd not this."),
        ]);
        let engine = Engine::default();
        let sink = ResourceSink::new(1);
        let ctx = RenderContext::root(&engine, &ws, "A.md", &sink);
        let info = resolve_target("B#^keep", &ws, "A.md");
        let html = render_embed(&info, &ctx).expect("embed");
        assert!(html.contains("embed-note"));
        assert!(html.contains("<em>this</em>"));
        assert!(!html.contains("Skip this"));
        assert!(!html.contains("data-source-block-id"));
    }

    #[test]
    fn image_preview_requests_a_resource() {
        let ws = Workspace::from_notes([
            md("A.md", "![[pic.png]]"),
            Note::new("pic.png", NoteType::Image, None),
        ]);
        let engine = Engine::default();
        let sink = ResourceSink::new(4);
        let ctx = RenderContext::root(&engine, &ws, "A.md", &sink);
        let info = resolve_target("pic.png", &ws, "A.md");
        let html = render_embed(&info, &ctx).expect("embed");
        assert!(html.contains("data-resource-ticket=\"4:res-0\""));
        drop(ctx);
        let requests = sink.into_requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].note_id, "pic.png");
    }
}
