mod html;

pub use html::{render_inline, render_tokens};

use anyhow::{Context, Result};
use pulldown_cmark::{Event, Options, Parser as CmarkParser};
use serde::Serialize;
use std::collections::BTreeSet;

use crate::anchors::inject_block_anchors;
use crate::extensions::dialect_parser;
use crate::highlight::{DEFAULT_CODE_THEME, Highlighter};
use crate::parser::{Parser, Token};
use crate::session::{RenderSession, ResourceRequest, ResourceSink};
use crate::sourcemap::{SourceMap, SourceMapCollector};
use crate::store::Workspace;
use crate::text::escape_html;

pub const MAX_EMBED_DEPTH: usize = 3;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    pub max_embed_depth: usize,
    pub code_theme: String,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_embed_depth: MAX_EMBED_DEPTH,
            code_theme: DEFAULT_CODE_THEME.to_string(),
        }
    }
}

pub struct Engine {
    parser: Parser,
    highlighter: Highlighter,
    max_embed_depth: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RenderMode {
    Full,
    NoSourceMap,
    Plain,
}

#[derive(Debug, Clone, Serialize)]
pub struct Rendered {
    pub note_id: String,
    pub generation: u64,
    pub mode: RenderMode,
    pub html: String,
    pub source_map: Option<SourceMap>,
    pub resources: Vec<ResourceRequest>,
}

impl Default for Engine {
    fn default() -> Self {
        Self::new(&EngineOptions::default())
    }
}

impl Engine {
    pub fn new(options: &EngineOptions) -> Self {
        Self {
            parser: dialect_parser(),
            highlighter: Highlighter::new(&options.code_theme),
            max_embed_depth: options.max_embed_depth,
        }
    }

    pub fn with_parser(mut self, parser: Parser) -> Self {
        self.parser = parser;
        self
    }

    pub fn parser(&self) -> &Parser {
        &self.parser
    }

    pub fn highlighter(&self) -> &Highlighter {
        &self.highlighter
    }

    pub fn max_embed_depth(&self) -> usize {
        self.max_embed_depth
    }

    /// Renders a markdown note of `workspace`, stepping down to a render
    /// without a source map and then to stock CommonMark when a pass fails.
    /// An error means nothing could be rendered and the previous output
    /// should stay on screen.
    pub fn render_note(
        &self,
        workspace: &Workspace,
        note_id: &str,
        session: &mut RenderSession,
    ) -> Result<Rendered> {
        let note = workspace
            .note(note_id)
            .with_context(|| format!("No note {note_id} in the workspace"))?;
        let source = note
            .markdown()
            .with_context(|| format!("{note_id} is not a loaded markdown note"))?;
        let generation = session.begin();
        let _span = tracing::info_span!("render", note = note_id, generation).entered();

        let sink = ResourceSink::new(generation);
        let ctx = RenderContext::root(self, workspace, &note.id, &sink);
        let (mode, html, source_map) = match self.render_mapped(source, &ctx) {
            Ok((html, map)) => (RenderMode::Full, html, map),
            Err(err) => {
                tracing::warn!("mapped render failed, retrying without a source map: {err:#}");
                sink.discard();
                match self.render_markdown(source, &ctx) {
                    Ok(html) => (RenderMode::NoSourceMap, html, None),
                    Err(err) => {
                        tracing::warn!("dialect render failed, using plain markdown: {err:#}");
                        sink.discard();
                        (RenderMode::Plain, render_plain(source), None)
                    }
                }
            }
        };
        drop(ctx);

        let resources = sink.into_requests();
        tracing::debug!(
            mode = ?mode,
            blocks = source_map.as_ref().map_or(0, |m| m.blocks.len()),
            resources = resources.len(),
            "rendered"
        );
        Ok(Rendered {
            note_id: note.id.clone(),
            generation,
            mode,
            html,
            source_map,
            resources,
        })
    }

    fn render_mapped(
        &self,
        source: &str,
        ctx: &RenderContext<'_>,
    ) -> Result<(String, Option<SourceMap>)> {
        let mut replacements = Vec::new();
        let prepared = inject_block_anchors(source, Some(&mut replacements));
        if !replacements.is_empty() {
            tracing::debug!(anchors = replacements.len(), "injected block anchors");
        }
        let mut collector = SourceMapCollector::start(source, &prepared, replacements);
        let tokens = {
            let mut hook = |token: &Token, depth: usize| collector.collect(token, depth);
            self.parser.parse(&prepared, Some(&mut hook))
        };
        let map = collector.finish(ctx.note_id);
        if let Some(map) = &map {
            map.validate(source)
                .with_context(|| format!("Invalid source map for {}", ctx.note_id))?;
        }
        let html = match &map {
            Some(map) => render_tokens(&tokens, &ctx.mapped(map))?,
            None => render_tokens(&tokens, ctx)?,
        };
        Ok((html, map))
    }

    pub fn render_markdown(&self, source: &str, ctx: &RenderContext<'_>) -> Result<String> {
        let prepared = inject_block_anchors(source, None);
        let tokens = self.parser.parse(&prepared, None);
        render_tokens(&tokens, ctx)
    }
}

pub fn render_plain(source: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    options.insert(Options::ENABLE_TASKLISTS);
    let events = CmarkParser::new_ext(source, options).map(|event| match event {
        Event::Html(html) | Event::InlineHtml(html) => Event::Text(html),
        other => other,
    });
    let mut out = String::new();
    pulldown_cmark::html::push_html(&mut out, events);
    out
}

#[derive(Clone)]
pub struct RenderContext<'a> {
    pub engine: &'a Engine,
    pub workspace: &'a Workspace,
    pub note_id: &'a str,
    pub depth: usize,
    pub visited: BTreeSet<&'a str>,
    pub resources: &'a ResourceSink,
    source_map: Option<&'a SourceMap>,
}

impl<'a> RenderContext<'a> {
    pub fn root(
        engine: &'a Engine,
        workspace: &'a Workspace,
        note_id: &'a str,
        resources: &'a ResourceSink,
    ) -> Self {
        Self {
            engine,
            workspace,
            note_id,
            depth: 0,
            visited: BTreeSet::from([note_id]),
            resources,
            source_map: None,
        }
    }

    pub fn descend(&self, note_id: &'a str) -> Self {
        let mut visited = self.visited.clone();
        visited.insert(note_id);
        Self {
            note_id,
            depth: self.depth + 1,
            visited,
            source_map: None,
            ..self.clone()
        }
    }

    pub fn would_cycle(&self, note_id: &str) -> bool {
        self.visited.contains(note_id) || self.depth + 1 > self.engine.max_embed_depth
    }

    fn mapped<'m>(&self, map: &'m SourceMap) -> RenderContext<'m>
    where
        'a: 'm,
    {
        RenderContext {
            engine: self.engine,
            workspace: self.workspace,
            note_id: self.note_id,
            depth: self.depth,
            visited: self.visited.clone(),
            resources: self.resources,
            source_map: Some(map),
        }
    }
}

/// `data-source-*` attributes of a block the source map recorded.
pub fn block_attrs(token: &Token, ctx: &RenderContext<'_>) -> String {
    let recorded = |id: &str| ctx.source_map.is_some_and(|map| map.block(id).is_some());
    match &token.block_id {
        Some(id) if ctx.depth == 0 && recorded(id) => format!(
            " data-source-block-id=\"{}\" data-source-note-id=\"{}\"",
            escape_html(id),
            escape_html(ctx.note_id)
        ),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::{Extension, Level, TokenKind};
    use crate::store::{Note, NoteType};

    struct Flaky {
        fail_mapped: bool,
        fail_unmapped: bool,
    }

    impl Extension for Flaky {
        fn name(&self) -> &'static str {
            "flaky"
        }

        fn level(&self) -> Level {
            Level::Inline
        }

        fn start(&self, src: &str) -> Option<usize> {
            src.find("%%")
        }

        fn tokenize(&self, src: &str) -> Option<Token> {
            src.starts_with("%%")
                .then(|| Token::new(TokenKind::Extension("flaky"), "%%", ""))
        }

        fn render(&self, _token: &Token, ctx: &RenderContext<'_>) -> Result<String> {
            if let Some(pic) = ctx.workspace.note("pic.png") {
                ctx.resources.request(pic);
            }
            let failing = match ctx.source_map {
                Some(_) => self.fail_mapped,
                None => self.fail_unmapped,
            };
            if failing {
                anyhow::bail!("flaky extension failed");
            }
            Ok("<span class=\"flaky\"></span>".to_string())
        }
    }

    fn render_flaky(fail_mapped: bool, fail_unmapped: bool) -> Rendered {
        let ws = Workspace::from_notes([
            md("A.md", "Before %% after"),
            Note::new("pic.png", NoteType::Image, None),
        ]);
        let parser = dialect_parser().with_extension(Box::new(Flaky {
            fail_mapped,
            fail_unmapped,
        }));
        let engine = Engine::default().with_parser(parser);
        engine
            .render_note(&ws, "A.md", &mut RenderSession::new())
            .expect("some rung renders")
    }

    fn md(id: &str, body: &str) -> Note {
        Note::new(id, NoteType::Markdown, Some(body.to_string()))
    }

    fn render(ws: &Workspace, id: &str) -> Rendered {
        let engine = Engine::default();
        let mut session = RenderSession::new();
        engine.render_note(ws, id, &mut session).expect("render")
    }

    #[test]
    fn mapped_blocks_carry_source_attributes() {
        let ws = Workspace::from_notes([md("A.md", "# Title\n\nHello *world*.")]);
        let out = render(&ws, "A.md");
        assert_eq!(out.mode, RenderMode::Full);
        assert!(out.html.contains(
            "<p data-source-block-id=\"blk-1\" data-source-note-id=\"A.md\">Hello <em>world</em>.</p>"
        ));
        let map = out.source_map.expect("source map");
        assert_eq!(map.block("blk-1").map(|b| b.plain_text.as_str()), Some("Hello world."));
    }

    #[test]
    fn missing_wikilink_renders_missing_target() {
        let ws = Workspace::from_notes([md("A.md", "See [[Missing Note]].")]);
        let out = render(&ws, "A.md");
        assert!(out.html.contains("wikilink missing-target"));
        assert!(out.html.contains("No file found for &quot;Missing Note&quot;"));
    }

    #[test]
    fn self_embed_is_a_circular_reference_at_depth_one() {
        let ws = Workspace::from_notes([md("A.md", "Top\n\n![[A]]")]);
        let out = render(&ws, "A.md");
        assert_eq!(out.mode, RenderMode::Full);
        assert!(out.html.contains("embed-circular-reference"));
        assert!(out.html.contains("data-embed-depth=\"1\""));
        assert!(out.html.contains("Circular reference to A.md"));
    }

    #[test]
    fn embed_cycles_terminate_within_the_depth_limit() {
        let notes: Vec<Note> = (0..10)
            .map(|i| md(&format!("N{i}.md"), &format!("Note {i}\n\n![[N{}]]", (i + 1) % 10)))
            .collect();
        let ws = Workspace::from_notes(notes);
        let out = render(&ws, "N0.md");
        assert_eq!(out.html.matches("embed embed-note").count(), MAX_EMBED_DEPTH);
        assert_eq!(out.html.matches("embed-circular-reference").count(), 1);
        assert!(out.html.contains("Embeds nest deeper than 3 levels"));

        let ws = Workspace::from_notes([md("A.md", "![[B]]"), md("B.md", "![[A]]")]);
        let out = render(&ws, "A.md");
        assert_eq!(out.html.matches("embed embed-note").count(), 1);
        assert!(out.html.contains("Circular reference to A.md"));
    }

    #[test]
    fn embedded_blocks_are_not_source_mapped() {
        let ws = Workspace::from_notes([md("A.md", "Intro\n\n![[B]]"), md("B.md", "Inner")]);
        let out = render(&ws, "A.md");
        assert_eq!(out.html.matches("data-source-block-id").count(), 2);
        assert!(!out.html.contains("data-source-note-id=\"B.md\""));
        assert!(out.html.contains("<p>Inner</p>"));
    }

    #[test]
    fn generations_advance_per_render() {
        let ws = Workspace::from_notes([md("A.md", "x")]);
        let engine = Engine::default();
        let mut session = RenderSession::new();
        let first = engine.render_note(&ws, "A.md", &mut session).expect("render");
        let second = engine.render_note(&ws, "A.md", &mut session).expect("render");
        assert_eq!((first.generation, second.generation), (1, 2));
    }

    #[test]
    fn non_markdown_notes_are_not_rendered() {
        let ws = Workspace::from_notes([Note::new("pic.png", NoteType::Image, None)]);
        let engine = Engine::default();
        let mut session = RenderSession::new();
        assert!(engine.render_note(&ws, "pic.png", &mut session).is_err());
        assert!(engine.render_note(&ws, "nope.md", &mut session).is_err());
    }

    #[test]
    fn ladder_stays_on_full_when_nothing_fails() {
        let out = render_flaky(false, false);
        assert_eq!(out.mode, RenderMode::Full);
        assert!(out.source_map.is_some());
        assert!(out.html.contains("<span class=\"flaky\"></span>"));
        assert_eq!(out.resources.len(), 1);
    }

    #[test]
    fn failed_mapped_pass_falls_back_without_a_source_map() {
        let out = render_flaky(true, false);
        assert_eq!(out.mode, RenderMode::NoSourceMap);
        assert!(out.source_map.is_none());
        assert!(out.html.contains("<span class=\"flaky\"></span>"));
        assert!(!out.html.contains("data-source-block-id"));
        assert_eq!(out.resources.len(), 1, "requests of the failed pass are dropped");
        assert_eq!(out.resources[0].ticket.resource_id, "res-0");
    }

    #[test]
    fn failed_dialect_pass_falls_back_to_plain_markdown() {
        let out = render_flaky(true, true);
        assert_eq!(out.mode, RenderMode::Plain);
        assert!(out.source_map.is_none());
        assert!(out.html.contains("<p>Before %% after</p>"));
        assert!(out.resources.is_empty());
    }

    #[test]
    fn every_source_attribute_resolves_in_the_map() {
        let source = "> first line *x*\n> second line\n\n- item one\n  continued here\n\n| a | b |\n|---|---|\n| 1 | 2 |\n";
        let ws = Workspace::from_notes([md("A.md", source)]);
        let out = render(&ws, "A.md");
        let map = out.source_map.expect("source map");
        let marker = "data-source-block-id=\"";
        let ids: Vec<&str> = out
            .html
            .match_indices(marker)
            .filter_map(|(at, _)| {
                let rest = &out.html[at + marker.len()..];
                rest.find('"').map(|end| &rest[..end])
            })
            .collect();
        assert!(ids.len() >= 6, "{ids:?}");
        for id in ids {
            assert!(map.block(id).is_some(), "{id} is not in the source map");
        }
        let quoted = map
            .blocks
            .iter()
            .find(|b| b.plain_text == "first line x\nsecond line")
            .expect("quoted paragraph mapped");
        assert!(out.html.contains(&format!("<p data-source-block-id=\"{}\"", quoted.id)));
    }

    #[test]
    fn plain_fallback_escapes_raw_html() {
        let html = render_plain("Hi <script>x</script>\n\n| a |\n|---|\n| b |\n");
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("<table>"));
    }
}
