use pulldown_latex::config::{DisplayMode, RenderConfig};
use pulldown_latex::mathml::push_mathml;
use pulldown_latex::{Parser, Storage};

use crate::text::escape_html;

pub enum MathOutput {
    MathMl(String),
    /// Fallback markup showing the source, plus the parser's complaint.
    Failed { html: String, message: String },
}

impl MathOutput {
    pub fn into_html(self) -> String {
        match self {
            Self::MathMl(html) => html,
            Self::Failed { html, message } => {
                tracing::debug!(%message, "latex rejected");
                html
            }
        }
    }
}

/// `latex` is the formula without its `$` delimiters.
pub fn typeset(latex: &str, display: bool) -> MathOutput {
    let storage = Storage::new();
    let parser = Parser::new(latex, &storage);
    let config = RenderConfig {
        display_mode: if display {
            DisplayMode::Block
        } else {
            DisplayMode::Inline
        },
        ..Default::default()
    };

    let events: Vec<_> = parser.collect();
    let errors: Vec<String> = events
        .iter()
        .filter_map(|event| event.as_ref().err().map(|err| err.to_string()))
        .collect();
    if !errors.is_empty() {
        let message = errors.join("; ");
        return MathOutput::Failed {
            html: error_html(latex, &message, display),
            message,
        };
    }

    let mut mathml = String::new();
    match push_mathml(&mut mathml, events.into_iter(), config) {
        Ok(()) => MathOutput::MathMl(mathml),
        Err(err) => {
            let message = err.to_string();
            MathOutput::Failed {
                html: error_html(latex, &message, display),
                message,
            }
        }
    }
}

fn error_html(latex: &str, error: &str, display: bool) -> String {
    let mode = if display { "math-display" } else { "math-inline" };
    format!(
        r#"<span class="math math-error {mode}" title="{}"><code>{}</code></span>"#,
        escape_html(error),
        escape_html(latex)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_and_display_produce_mathml() {
        let MathOutput::MathMl(inline) = typeset("x^2", false) else {
            panic!("inline math failed");
        };
        assert!(inline.contains("<math"));

        let MathOutput::MathMl(display) = typeset(r"\frac{a}{b}", true) else {
            panic!("display math failed");
        };
        assert!(display.contains("<mfrac"));
    }

    #[test]
    fn broken_latex_falls_back_to_source() {
        let MathOutput::Failed { html, message } = typeset(r"\frac{a", false) else {
            panic!("expected failure");
        };
        assert!(html.contains("math-error"));
        assert!(html.contains(r"<code>\frac{a</code>"));
        assert!(!message.is_empty());
    }
}
