mod block;
mod inline;

pub(crate) use inline::{closing_bracket, emphasis_span, link_destination};

use crate::render::RenderContext;
use anyhow::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Level {
    Block,
    Inline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Align {
    #[default]
    None,
    Left,
    Center,
    Right,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenKind {
    Space,
    Paragraph,
    Heading(u8),
    Code { lang: Option<String> },
    Blockquote,
    List { ordered: bool, start: u64, loose: bool },
    ListItem { checked: Option<bool> },
    Table,
    TableRow { header: bool },
    TableCell { header: bool, align: Align },
    Hr,
    Html,
    Text,
    Escape,
    Strong,
    Em,
    Del,
    CodeSpan,
    Link { href: String, title: Option<String> },
    Image { src: String, title: Option<String> },
    Br,
    Anchor { id: String, title: String },
    Extension(&'static str),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub raw: String,
    pub text: String,
    pub children: Vec<Token>,
    pub attrs: Vec<(&'static str, String)>,
    pub block_id: Option<String>,
}

impl Token {
    pub fn new(kind: TokenKind, raw: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind,
            raw: raw.into(),
            text: text.into(),
            children: Vec::new(),
            attrs: Vec::new(),
            block_id: None,
        }
    }

    pub fn with_children(mut self, children: Vec<Token>) -> Self {
        self.children = children;
        self
    }

    pub fn with_attr(mut self, key: &'static str, value: impl Into<String>) -> Self {
        self.attrs.push((key, value.into()));
        self
    }

    pub fn attr(&self, key: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            TokenKind::Space => "space",
            TokenKind::Paragraph => "paragraph",
            TokenKind::Heading(_) => "heading",
            TokenKind::Code { .. } => "code",
            TokenKind::Blockquote => "blockquote",
            TokenKind::List { .. } => "list",
            TokenKind::ListItem { .. } => "list_item",
            TokenKind::Table => "table",
            TokenKind::TableRow { .. } => "table_row",
            TokenKind::TableCell { .. } => "table_cell",
            TokenKind::Hr => "hr",
            TokenKind::Html => "html",
            TokenKind::Text => "text",
            TokenKind::Escape => "escape",
            TokenKind::Strong => "strong",
            TokenKind::Em => "em",
            TokenKind::Del => "del",
            TokenKind::CodeSpan => "codespan",
            TokenKind::Link { .. } => "link",
            TokenKind::Image { .. } => "image",
            TokenKind::Br => "br",
            TokenKind::Anchor { .. } => "anchor",
            TokenKind::Extension(name) => name,
        }
    }
}

pub const MAPPABLE_KINDS: [&str; 8] = [
    "paragraph",
    "heading",
    "list_item",
    "blockquote",
    "code",
    "table",
    "table_cell",
    "math_block",
];

pub fn is_mappable(token: &Token) -> bool {
    MAPPABLE_KINDS.contains(&token.kind_name())
}

/// A pluggable grammar rule.
///
/// `start` reports where in `src` this rule could next match so the text
/// rule knows where to stop; `tokenize` tries to match at the very start of
/// `src` and must return a token whose `raw` is a prefix of `src`.
pub trait Extension {
    fn name(&self) -> &'static str;
    fn level(&self) -> Level;
    fn start(&self, src: &str) -> Option<usize>;
    fn tokenize(&self, src: &str) -> Option<Token>;
    fn render(&self, token: &Token, ctx: &RenderContext<'_>) -> Result<String>;
}

#[derive(Default)]
pub struct Parser {
    extensions: Vec<Box<dyn Extension>>,
}

impl Parser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, extension: Box<dyn Extension>) {
        self.extensions.push(extension);
    }

    pub fn with_extension(mut self, extension: Box<dyn Extension>) -> Self {
        self.register(extension);
        self
    }

    pub fn extensions(&self, level: Level) -> impl Iterator<Item = &dyn Extension> {
        self.extensions
            .iter()
            .filter(move |ext| ext.level() == level)
            .map(|ext| ext.as_ref())
    }

    pub fn extension(&self, name: &str) -> Option<&dyn Extension> {
        self.extensions
            .iter()
            .find(|ext| ext.name() == name)
            .map(|ext| ext.as_ref())
    }

    pub fn parse(&self, src: &str, hook: Option<&mut dyn FnMut(&Token, usize)>) -> Vec<Token> {
        let mut tokens = self.lex(src);
        let mut next_id = 0usize;
        assign_block_ids(&mut tokens, &mut next_id);
        if let Some(hook) = hook {
            walk_tokens(&tokens, 0, hook);
        }
        tokens
    }

    pub fn lex(&self, src: &str) -> Vec<Token> {
        block::lex_blocks(self, src)
    }

    pub fn lex_inline(&self, src: &str) -> Vec<Token> {
        inline::lex_inline(self, src)
    }
}

fn assign_block_ids(tokens: &mut [Token], next_id: &mut usize) {
    for token in tokens {
        if is_mappable(token) {
            token.block_id = Some(format!("blk-{next_id}"));
            *next_id += 1;
        }
        assign_block_ids(&mut token.children, next_id);
    }
}

pub fn walk_tokens(tokens: &[Token], depth: usize, hook: &mut dyn FnMut(&Token, usize)) {
    for token in tokens {
        hook(token, depth);
        walk_tokens(&token.children, depth + 1, hook);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Shout;

    impl Extension for Shout {
        fn name(&self) -> &'static str {
            "shout"
        }

        fn level(&self) -> Level {
            Level::Inline
        }

        fn start(&self, src: &str) -> Option<usize> {
            src.find("!!")
        }

        fn tokenize(&self, src: &str) -> Option<Token> {
            let rest = src.strip_prefix("!!")?;
            let end = rest.find("!!")?;
            let raw = &src[..end + 4];
            Some(Token::new(TokenKind::Extension("shout"), raw, &rest[..end]))
        }

        fn render(&self, token: &Token, _ctx: &RenderContext<'_>) -> Result<String> {
            Ok(token.text.to_uppercase())
        }
    }

    fn kinds(tokens: &[Token]) -> Vec<&'static str> {
        tokens.iter().map(Token::kind_name).collect()
    }

    #[test]
    fn registered_inline_extension_is_tried_before_text() {
        let parser = Parser::new().with_extension(Box::new(Shout));
        let tokens = parser.parse("say !!hi!! now", None);
        assert_eq!(kinds(&tokens), vec!["paragraph"]);
        let inline = &tokens[0].children;
        assert_eq!(kinds(inline), vec!["text", "shout", "text"]);
        assert_eq!(inline[1].raw, "!!hi!!");
        assert_eq!(inline[1].text, "hi");
    }

    #[test]
    fn walk_hook_sees_every_token_with_depth() {
        let parser = Parser::new();
        let mut seen = Vec::new();
        let mut hook = |token: &Token, depth: usize| seen.push((token.kind_name(), depth));
        parser.parse("> quoted *text*\n\n- item", Some(&mut hook));
        assert!(seen.contains(&("blockquote", 0)));
        assert!(seen.contains(&("paragraph", 1)));
        assert!(seen.contains(&("em", 2)));
        assert!(seen.contains(&("list", 0)));
        assert!(seen.contains(&("list_item", 1)));
    }

    #[test]
    fn mappable_blocks_get_sequential_ids() {
        let parser = Parser::new();
        let tokens = parser.parse("# Head\n\nBody\n\n---\n", None);
        let ids: Vec<Option<&str>> = tokens.iter().map(|t| t.block_id.as_deref()).collect();
        assert_eq!(ids, vec![Some("blk-0"), None, Some("blk-1"), None, None]);
    }
}
