use anyhow::Result;
use regex::Regex;
use std::sync::OnceLock;

use crate::embed::render_embed;
use crate::math::typeset;
use crate::parser::{Extension, Level, Parser, Token, TokenKind};
use crate::render::{RenderContext, block_attrs};
use crate::resolve::{resolve_target, wikilink_display};
use crate::text::escape_html;

pub const MATH_BLOCK: &str = "math_block";
pub const MATH_INLINE: &str = "math_inline";
pub const WIKILINK: &str = "wikilink";
pub const COMMAND: &str = "command";
pub const HTML_FENCE: &str = "html_fence";

const MARKUP_LANGS: [&str; 4] = ["html", "htm", "xhtml", "svg"];

fn math_open_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^ {0,3}\$\$").expect("valid math pattern"))
}

fn wikilink_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(!?)\[\[([^\[\]\n]+)\]\]").expect("valid wikilink pattern"))
}

fn command_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^&([A-Za-z][\w-]*)(?:[ \t]+([^\n]*?))?[ \t]*(?:\n|$)")
            .expect("valid command pattern")
    })
}

fn fence_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^ {0,3}(`{3,}|~{3,})[ \t]*([A-Za-z]+)[^\n]*(?:\n|$)")
            .expect("valid fence pattern")
    })
}

pub fn dialect_parser() -> Parser {
    Parser::new()
        .with_extension(Box::new(HtmlFence))
        .with_extension(Box::new(MathBlock))
        .with_extension(Box::new(Command))
        .with_extension(Box::new(WikiLink))
        .with_extension(Box::new(MathInline))
}

fn line_end(src: &str, from: usize) -> usize {
    src[from..].find('\n').map_or(src.len(), |i| from + i + 1)
}

pub struct MathBlock;

impl Extension for MathBlock {
    fn name(&self) -> &'static str {
        MATH_BLOCK
    }

    fn level(&self) -> Level {
        Level::Block
    }

    fn start(&self, src: &str) -> Option<usize> {
        src.find("$$")
    }

    fn tokenize(&self, src: &str) -> Option<Token> {
        let open = math_open_re().find(src)?.end();
        let mut search = open;
        while let Some(found) = src[search..].find("$$") {
            let close = search + found;
            let end = line_end(src, close + 2);
            if src[close + 2..end].trim().is_empty() {
                let latex = src[open..close].trim();
                if latex.is_empty() {
                    return None;
                }
                return Some(Token::new(
                    TokenKind::Extension(MATH_BLOCK),
                    &src[..end],
                    latex,
                ));
            }
            search = close + 2;
        }
        None
    }

    fn render(&self, token: &Token, ctx: &RenderContext<'_>) -> Result<String> {
        Ok(format!(
            "<div class=\"math math-display\"{} data-math-source=\"{}\">{}</div>\n",
            block_attrs(token, ctx),
            escape_html(&token.text),
            typeset(&token.text, true).into_html()
        ))
    }
}

/// Length of `$...$` at the start of `src`, if it is inline math. The
/// opening `$` must be followed by a non-space, the closing one preceded by
/// a non-space and not followed by a digit, so prices stay prose.
pub fn inline_math_len(src: &str) -> Option<usize> {
    let body = src.strip_prefix('$')?;
    let first = body.chars().next()?;
    if first == '$' || first.is_whitespace() {
        return None;
    }
    let mut escaped = false;
    let mut prev = first;
    for (idx, ch) in body.char_indices() {
        if escaped {
            escaped = false;
            prev = ch;
            continue;
        }
        match ch {
            '\\' => escaped = true,
            '\n' if body[idx + 1..].starts_with('\n') => return None,
            '$' if idx > 0 && !prev.is_whitespace() => {
                let next = body[idx + 1..].chars().next();
                if !next.is_some_and(|c| c.is_ascii_digit()) {
                    return Some(idx + 2);
                }
            }
            _ => {}
        }
        prev = ch;
    }
    None
}

pub struct MathInline;

impl Extension for MathInline {
    fn name(&self) -> &'static str {
        MATH_INLINE
    }

    fn level(&self) -> Level {
        Level::Inline
    }

    fn start(&self, src: &str) -> Option<usize> {
        src.find('$')
    }

    fn tokenize(&self, src: &str) -> Option<Token> {
        let len = inline_math_len(src)?;
        Some(Token::new(
            TokenKind::Extension(MATH_INLINE),
            &src[..len],
            &src[1..len - 1],
        ))
    }

    fn render(&self, token: &Token, _ctx: &RenderContext<'_>) -> Result<String> {
        Ok(format!(
            "<span class=\"math math-inline\" data-math-source=\"{}\">{}</span>",
            escape_html(&token.text),
            typeset(&token.text, false).into_html()
        ))
    }
}

pub struct WikiLink;

impl Extension for WikiLink {
    fn name(&self) -> &'static str {
        WIKILINK
    }

    fn level(&self) -> Level {
        Level::Inline
    }

    fn start(&self, src: &str) -> Option<usize> {
        let idx = src.find("[[")?;
        Some(if src[..idx].ends_with('!') { idx - 1 } else { idx })
    }

    fn tokenize(&self, src: &str) -> Option<Token> {
        let caps = wikilink_re().captures(src)?;
        let inner = caps.get(2)?.as_str();
        if inner.trim().is_empty() {
            return None;
        }
        let embed = !caps[1].is_empty();
        Some(
            Token::new(TokenKind::Extension(WIKILINK), caps.get(0)?.as_str(), inner)
                .with_attr("embed", if embed { "true" } else { "false" }),
        )
    }

    fn render(&self, token: &Token, ctx: &RenderContext<'_>) -> Result<String> {
        let inner = token.text.as_str();
        let info = resolve_target(inner, ctx.workspace, ctx.note_id);
        if token.attr("embed") == Some("true") {
            return render_embed(&info, ctx);
        }

        let label = escape_html(&inner[wikilink_display(inner)]);
        let target = escape_html(&info.target);
        let Some(note_id) = info.note_id.as_deref() else {
            return Ok(format!(
                "<a class=\"wikilink missing-target\" href=\"#\" data-wiki-target=\"{target}\" title=\"{}\">{label}</a>",
                escape_html(&info.status_message())
            ));
        };
        let mut attrs = format!(" data-note-id=\"{}\"", escape_html(note_id));
        if let Some(block) = &info.block_id {
            attrs.push_str(&format!(" data-block-id=\"{}\"", escape_html(block)));
        }
        if info.is_missing_block() {
            attrs.push_str(" data-missing-block=\"true\"");
        }
        Ok(format!(
            "<a class=\"wikilink\" href=\"#\" data-wiki-target=\"{target}\"{attrs}>{label}</a>"
        ))
    }
}

/// `&name argument` on a line of its own. Expanded by the editor, never
/// rendered.
pub struct Command;

impl Extension for Command {
    fn name(&self) -> &'static str {
        COMMAND
    }

    fn level(&self) -> Level {
        Level::Block
    }

    fn start(&self, src: &str) -> Option<usize> {
        if src.starts_with('&') {
            return Some(0);
        }
        src.find("\n&").map(|i| i + 1)
    }

    fn tokenize(&self, src: &str) -> Option<Token> {
        let caps = command_re().captures(src)?;
        let name = caps.get(1)?.as_str();
        let argument = caps.get(2).map_or("", |m| m.as_str());
        Some(
            Token::new(TokenKind::Extension(COMMAND), caps.get(0)?.as_str(), name)
                .with_attr("argument", argument),
        )
    }

    fn render(&self, _token: &Token, _ctx: &RenderContext<'_>) -> Result<String> {
        Ok(String::new())
    }
}

pub struct HtmlFence;

impl Extension for HtmlFence {
    fn name(&self) -> &'static str {
        HTML_FENCE
    }

    fn level(&self) -> Level {
        Level::Block
    }

    fn start(&self, src: &str) -> Option<usize> {
        ["```", "~~~"].iter().filter_map(|f| src.find(f)).min()
    }

    fn tokenize(&self, src: &str) -> Option<Token> {
        let caps = fence_re().captures(src)?;
        let lang = caps[2].to_ascii_lowercase();
        if !MARKUP_LANGS.contains(&lang.as_str()) {
            return None;
        }
        let fence = caps.get(1)?.as_str();
        let body_start = caps.get(0)?.end();
        let (body_end, end) = closing_fence(src, body_start, fence);
        Some(
            Token::new(
                TokenKind::Extension(HTML_FENCE),
                &src[..end],
                &src[body_start..body_end],
            )
            .with_attr("lang", lang),
        )
    }

    fn render(&self, token: &Token, ctx: &RenderContext<'_>) -> Result<String> {
        Ok(format!(
            "<iframe class=\"html-fence\"{} sandbox=\"allow-scripts\" srcdoc=\"{}\"></iframe>\n",
            block_attrs(token, ctx),
            escape_html(&token.text)
        ))
    }
}

/// `(end of body, end of closing line)`; an unclosed fence runs to the end.
fn closing_fence(src: &str, from: usize, fence: &str) -> (usize, usize) {
    let marker = fence.chars().next().unwrap_or('`');
    let mut pos = from;
    while pos < src.len() {
        let next = line_end(src, pos);
        let line = src[pos..next].trim();
        let run = line.chars().take_while(|c| *c == marker).count();
        if run >= fence.len() && run == line.chars().count() {
            return (pos, next);
        }
        pos = next;
    }
    (src.len(), src.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(tokens: &[Token]) -> Vec<&'static str> {
        tokens.iter().map(Token::kind_name).collect()
    }

    #[test]
    fn math_block_spans_lines_and_is_mappable() {
        let tokens = dialect_parser().parse("$$\na^2 + b^2\n$$\n\nAfter", None);
        assert_eq!(kinds(&tokens), vec!["math_block", "space", "paragraph"]);
        assert_eq!(tokens[0].text, "a^2 + b^2");
        assert_eq!(tokens[0].raw, "$$\na^2 + b^2\n$$\n");
        assert_eq!(tokens[0].block_id.as_deref(), Some("blk-0"));
    }

    #[test]
    fn inline_math_ignores_prices() {
        assert_eq!(inline_math_len("$x$ rest"), Some(3));
        assert_eq!(inline_math_len("$5 and $6"), None);
        assert_eq!(inline_math_len("$ x$"), None);
        assert_eq!(inline_math_len(r"$a\$b$"), Some(6));

        let tokens = dialect_parser().parse("area $\\pi r^2$ costs $5.", None);
        let inline = kinds(&tokens[0].children);
        assert_eq!(inline, vec!["text", "math_inline", "text"]);
        assert_eq!(tokens[0].children[1].text, "\\pi r^2");
    }

    #[test]
    fn wikilinks_and_embeds_are_tokens() {
        let tokens = dialect_parser().parse("See [[Other#^blk|that]] and ![[Pic.png]]", None);
        let inline = &tokens[0].children;
        assert_eq!(kinds(inline), vec!["text", "wikilink", "text", "wikilink"]);
        assert_eq!(inline[1].text, "Other#^blk|that");
        assert_eq!(inline[1].attr("embed"), Some("false"));
        assert_eq!(inline[3].attr("embed"), Some("true"));
    }

    #[test]
    fn command_lines_are_swallowed_and_interrupt_prose() {
        let tokens = dialect_parser().parse("Intro\n&summarize last week\nOutro", None);
        assert_eq!(kinds(&tokens), vec!["paragraph", "command", "paragraph"]);
        assert_eq!(tokens[1].text, "summarize");
        assert_eq!(tokens[1].attr("argument"), Some("last week"));
        assert_eq!(tokens[0].text, "Intro");
    }

    #[test]
    fn markup_fences_become_html_fence_tokens() {
        let src = "```html\n<b>hi</b>\n```\n\n```rust\nfn x() {}\n```\n";
        let tokens = dialect_parser().parse(src, None);
        assert_eq!(kinds(&tokens), vec!["html_fence", "space", "code"]);
        assert_eq!(tokens[0].text, "<b>hi</b>\n");
        assert_eq!(tokens[0].attr("lang"), Some("html"));
    }
}
