use anyhow::{Context, Result};

use super::{RenderContext, block_attrs};
use crate::extensions::WIKILINK;
use crate::parser::{Align, Token, TokenKind};
use crate::text::escape_html;

const UNSAFE_SCHEMES: [&str; 3] = ["javascript:", "vbscript:", "data:"];

pub fn render_tokens(tokens: &[Token], ctx: &RenderContext<'_>) -> Result<String> {
    let mut out = String::new();
    for token in tokens {
        render_block(token, ctx, &mut out)?;
    }
    Ok(out)
}

fn render_block(token: &Token, ctx: &RenderContext<'_>, out: &mut String) -> Result<()> {
    let attrs = block_attrs(token, ctx);
    match &token.kind {
        TokenKind::Space => {}
        TokenKind::Paragraph => {
            let tag = if contains_embed(&token.children) { "div" } else { "p" };
            let class = if tag == "div" { " class=\"paragraph\"" } else { "" };
            out.push_str(&format!(
                "<{tag}{class}{attrs}>{}</{tag}>\n",
                render_inline(&token.children, ctx)?
            ));
        }
        TokenKind::Heading(level) => {
            out.push_str(&format!(
                "<h{level}{attrs}>{}</h{level}>\n",
                render_inline(&token.children, ctx)?
            ));
        }
        TokenKind::Code { lang } => {
            let lang = lang.as_deref().filter(|l| !l.is_empty());
            let body = match ctx.engine.highlighter().highlight(&token.text, lang) {
                Ok(html) => html,
                Err(err) => {
                    tracing::debug!("{err:#}");
                    format!("<pre><code>{}</code></pre>", escape_html(&token.text))
                }
            };
            let lang_attr = lang
                .map(|l| format!(" data-lang=\"{}\"", escape_html(l)))
                .unwrap_or_default();
            out.push_str(&format!(
                "<div class=\"code-block\"{attrs}{lang_attr}>{body}</div>\n"
            ));
        }
        TokenKind::Blockquote => {
            out.push_str(&format!(
                "<blockquote{attrs}>\n{}</blockquote>\n",
                render_tokens(&token.children, ctx)?
            ));
        }
        TokenKind::List {
            ordered,
            start,
            loose,
        } => {
            let open = match (*ordered, *start) {
                (true, 1) => "<ol>".to_string(),
                (true, start) => format!("<ol start=\"{start}\">"),
                (false, _) => "<ul>".to_string(),
            };
            out.push_str(&open);
            out.push('\n');
            for item in &token.children {
                render_list_item(item, *loose, ctx, out)?;
            }
            out.push_str(if *ordered { "</ol>\n" } else { "</ul>\n" });
        }
        TokenKind::ListItem { .. } => render_list_item(token, true, ctx, out)?,
        TokenKind::Table => render_table(token, &attrs, ctx, out)?,
        TokenKind::Hr => out.push_str("<hr>\n"),
        TokenKind::Html => {
            out.push_str(&format!(
                "<div class=\"raw-html\"><pre>{}</pre></div>\n",
                escape_html(&token.text)
            ));
        }
        TokenKind::Extension(name) => out.push_str(&render_extension(name, token, ctx)?),
        _ => out.push_str(&render_inline(std::slice::from_ref(token), ctx)?),
    }
    Ok(())
}

fn render_list_item(
    item: &Token,
    loose: bool,
    ctx: &RenderContext<'_>,
    out: &mut String,
) -> Result<()> {
    let attrs = block_attrs(item, ctx);
    let checked = match item.kind {
        TokenKind::ListItem { checked } => checked,
        _ => None,
    };
    let class = if checked.is_some() { " class=\"task-item\"" } else { "" };
    out.push_str(&format!("<li{class}{attrs}>"));
    if let Some(checked) = checked {
        let state = if checked { " checked" } else { "" };
        out.push_str(&format!("<input type=\"checkbox\" disabled{state}> "));
    }
    for child in &item.children {
        match child.kind {
            TokenKind::Paragraph if !loose => {
                out.push_str(&render_inline(&child.children, ctx)?);
            }
            _ => render_block(child, ctx, out)?,
        }
    }
    out.push_str("</li>\n");
    Ok(())
}

fn render_table(
    table: &Token,
    attrs: &str,
    ctx: &RenderContext<'_>,
    out: &mut String,
) -> Result<()> {
    out.push_str(&format!("<table{attrs}>\n"));
    let (head, body): (Vec<&Token>, Vec<&Token>) = table
        .children
        .iter()
        .partition(|row| matches!(row.kind, TokenKind::TableRow { header: true }));
    if !head.is_empty() {
        out.push_str("<thead>\n");
        for row in head {
            render_row(row, ctx, out)?;
        }
        out.push_str("</thead>\n");
    }
    if !body.is_empty() {
        out.push_str("<tbody>\n");
        for row in body {
            render_row(row, ctx, out)?;
        }
        out.push_str("</tbody>\n");
    }
    out.push_str("</table>\n");
    Ok(())
}

fn render_row(row: &Token, ctx: &RenderContext<'_>, out: &mut String) -> Result<()> {
    out.push_str("<tr>");
    for cell in &row.children {
        let TokenKind::TableCell { header, align } = cell.kind else {
            continue;
        };
        let tag = if header { "th" } else { "td" };
        let align = match align {
            Align::None => "",
            Align::Left => " align=\"left\"",
            Align::Center => " align=\"center\"",
            Align::Right => " align=\"right\"",
        };
        out.push_str(&format!(
            "<{tag}{align}{}>{}</{tag}>",
            block_attrs(cell, ctx),
            render_inline(&cell.children, ctx)?
        ));
    }
    out.push_str("</tr>\n");
    Ok(())
}

pub fn render_inline(tokens: &[Token], ctx: &RenderContext<'_>) -> Result<String> {
    let mut out = String::new();
    for token in tokens {
        match &token.kind {
            TokenKind::Text | TokenKind::Escape => out.push_str(&escape_html(&token.text)),
            TokenKind::Strong => wrap(&mut out, "strong", &token.children, ctx)?,
            TokenKind::Em => wrap(&mut out, "em", &token.children, ctx)?,
            TokenKind::Del => wrap(&mut out, "del", &token.children, ctx)?,
            TokenKind::CodeSpan => {
                out.push_str(&format!("<code>{}</code>", escape_html(&token.text)));
            }
            TokenKind::Link { href, title } => {
                out.push_str(&format!(
                    "<a href=\"{}\"{}>{}</a>",
                    escape_html(safe_url(href)),
                    title_attr(title.as_deref()),
                    render_inline(&token.children, ctx)?
                ));
            }
            TokenKind::Image { src, title } => {
                out.push_str(&format!(
                    "<img src=\"{}\" alt=\"{}\"{}>",
                    escape_html(safe_url(src)),
                    escape_html(&token.text),
                    title_attr(title.as_deref())
                ));
            }
            TokenKind::Br => out.push_str("<br>\n"),
            // Marker attributes were escaped when the marker was injected.
            TokenKind::Anchor { id, title } => out.push_str(&format!(
                "<span class=\"block-anchor\" data-block-id=\"{id}\" data-block-title=\"{title}\"></span>"
            )),
            TokenKind::Extension(name) => out.push_str(&render_extension(name, token, ctx)?),
            _ => out.push_str(&escape_html(&token.raw)),
        }
    }
    Ok(out)
}

fn wrap(out: &mut String, tag: &str, children: &[Token], ctx: &RenderContext<'_>) -> Result<()> {
    out.push_str(&format!("<{tag}>{}</{tag}>", render_inline(children, ctx)?));
    Ok(())
}

fn render_extension(name: &str, token: &Token, ctx: &RenderContext<'_>) -> Result<String> {
    ctx.engine
        .parser()
        .extension(name)
        .with_context(|| format!("No renderer registered for {name} tokens"))?
        .render(token, ctx)
        .with_context(|| format!("Failed to render {name} token"))
}

fn contains_embed(tokens: &[Token]) -> bool {
    tokens
        .iter()
        .any(|t| t.kind == TokenKind::Extension(WIKILINK) && t.attr("embed") == Some("true"))
}

fn title_attr(title: Option<&str>) -> String {
    title
        .map(|t| format!(" title=\"{}\"", escape_html(t)))
        .unwrap_or_default()
}

fn safe_url(url: &str) -> &str {
    let lowered = url.trim().to_ascii_lowercase();
    if UNSAFE_SCHEMES.iter().any(|s| lowered.starts_with(s)) {
        "#"
    } else {
        url
    }
}
