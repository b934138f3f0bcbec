use anyhow::{Context, Result};
use syntect::highlighting::{Theme, ThemeSet};
use syntect::html::highlighted_html_for_string;
use syntect::parsing::{SyntaxReference, SyntaxSet};

pub const DEFAULT_CODE_THEME: &str = "base16-ocean.dark";

pub struct Highlighter {
    syntax_set: SyntaxSet,
    theme: Theme,
    theme_name: String,
}

impl Highlighter {
    pub fn new(theme_name: &str) -> Self {
        let mut themes = ThemeSet::load_defaults().themes;
        let (theme_name, theme) = match themes.remove(theme_name) {
            Some(theme) => (theme_name.to_string(), theme),
            None => {
                tracing::warn!(theme = theme_name, "unknown code theme, using default");
                let theme = themes.remove(DEFAULT_CODE_THEME).unwrap_or_default();
                (DEFAULT_CODE_THEME.to_string(), theme)
            }
        };
        Self {
            syntax_set: SyntaxSet::load_defaults_newlines(),
            theme,
            theme_name,
        }
    }

    pub fn theme_name(&self) -> &str {
        &self.theme_name
    }

    pub fn highlight(&self, code: &str, lang: Option<&str>) -> Result<String> {
        let syntax = resolve_code_syntax(&self.syntax_set, lang);
        highlighted_html_for_string(code, &self.syntax_set, syntax, &self.theme)
            .with_context(|| format!("Failed to highlight {} code", syntax.name))
    }

    pub fn theme_names() -> Vec<String> {
        let mut names: Vec<String> = ThemeSet::load_defaults().themes.into_keys().collect();
        names.sort();
        names
    }
}

impl Default for Highlighter {
    fn default() -> Self {
        Self::new(DEFAULT_CODE_THEME)
    }
}

fn resolve_code_syntax<'a>(syntax_set: &'a SyntaxSet, lang: Option<&str>) -> &'a SyntaxReference {
    let Some(lang) = lang.map(|l| l.trim()).filter(|l| !l.is_empty()) else {
        return syntax_set.find_syntax_plain_text();
    };
    let token = lang.strip_prefix("language-").unwrap_or(lang);
    for cand in language_candidates(token) {
        if let Some(syntax) = syntax_set.find_syntax_by_token(&cand) {
            return syntax;
        }
        if let Some(syntax) = syntax_set.find_syntax_by_extension(&cand) {
            return syntax;
        }
    }
    syntax_set.find_syntax_plain_text()
}

fn language_candidates(lang: &str) -> Vec<String> {
    let mut out = Vec::new();
    let lower = lang.to_ascii_lowercase();
    match lower.as_str() {
        "shell" | "console" | "zsh" => out.push("bash".to_string()),
        "ts" | "typescript" | "tsx" => out.push("js".to_string()),
        "yml" => out.push("yaml".to_string()),
        "tex" | "latex" => out.push("LaTeX".to_string()),
        _ => {}
    }
    out.push(lang.to_string());
    if lower != lang {
        out.push(lower);
    }
    out
}
