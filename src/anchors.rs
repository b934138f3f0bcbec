use regex::Regex;
use serde::Serialize;
use std::sync::OnceLock;

use crate::text::escape_html;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockAnchorReplacement {
    pub original_start: usize,
    pub original_end: usize,
    pub prepared_start: usize,
    pub prepared_end: usize,
    /// `(prepared_end - prepared_start) - (original_end - original_start)`
    pub shift: isize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnchorMatch {
    pub start: usize,
    pub end: usize,
    pub raw_label: String,
    pub label: String,
    pub title: Option<String>,
}

fn anchor_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(?m)(?:^|[ \t])(\^([A-Za-z0-9][A-Za-z0-9_-]*)(?:\("([^"\n]*)"\))?)[ \t]*$"#)
            .expect("valid anchor pattern")
    })
}

fn marker_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r#"^<span class="block-anchor" data-block-id="([^"]*)" data-block-title="([^"]*)"></span>"#,
        )
        .expect("valid marker pattern")
    })
}

pub fn normalize_label(raw: &str) -> String {
    raw.trim().trim_start_matches('^').to_lowercase()
}

pub fn scan_block_anchors(source: &str) -> Vec<AnchorMatch> {
    anchor_regex()
        .captures_iter(source)
        .filter_map(|caps| {
            let whole = caps.get(1)?;
            let raw_label = caps.get(2)?.as_str().to_string();
            Some(AnchorMatch {
                start: whole.start(),
                end: whole.end(),
                label: normalize_label(&raw_label),
                raw_label,
                title: caps.get(3).map(|m| m.as_str().to_string()),
            })
        })
        .collect()
}

pub fn anchor_marker(raw_label: &str, title: Option<&str>) -> String {
    format!(
        r#"<span class="block-anchor" data-block-id="{}" data-block-title="{}"></span>"#,
        escape_html(raw_label),
        escape_html(title.unwrap_or_default())
    )
}

pub fn parse_anchor_marker(src: &str) -> Option<(usize, String, String)> {
    let caps = marker_regex().captures(src)?;
    let len = caps.get(0)?.end();
    Some((len, caps[1].to_string(), caps[2].to_string()))
}

pub fn inject_block_anchors(
    source: &str,
    mut log: Option<&mut Vec<BlockAnchorReplacement>>,
) -> String {
    let anchors = scan_block_anchors(source);
    if anchors.is_empty() {
        return source.to_string();
    }

    let mut out = String::with_capacity(source.len() + anchors.len() * 80);
    let mut cursor = 0usize;
    let mut cumulative_shift: isize = 0;
    for anchor in &anchors {
        out.push_str(&source[cursor..anchor.start]);
        let marker = anchor_marker(&anchor.raw_label, anchor.title.as_deref());
        let original_len = anchor.end - anchor.start;
        let shift = marker.len() as isize - original_len as isize;
        let prepared_start = (anchor.start as isize + cumulative_shift) as usize;
        if let Some(log) = log.as_deref_mut() {
            log.push(BlockAnchorReplacement {
                original_start: anchor.start,
                original_end: anchor.end,
                prepared_start,
                prepared_end: prepared_start + marker.len(),
                shift,
            });
        }
        out.push_str(&marker);
        cumulative_shift += shift;
        cursor = anchor.end;
    }
    out.push_str(&source[cursor..]);
    out
}

/// Translates an offset in the prepared text back into the original text.
/// Offsets strictly inside a marker map to the end of the anchor it replaced.
pub fn prepared_to_original(replacements: &[BlockAnchorReplacement], offset: usize) -> usize {
    let mut shift: isize = 0;
    for rep in replacements {
        if offset <= rep.prepared_start {
            break;
        }
        if offset < rep.prepared_end {
            return rep.original_end;
        }
        shift += rep.shift;
    }
    (offset as isize - shift).max(0) as usize
}

pub fn original_to_prepared(replacements: &[BlockAnchorReplacement], offset: usize) -> usize {
    let mut shift: isize = 0;
    for rep in replacements {
        if offset <= rep.original_start {
            break;
        }
        if offset < rep.original_end {
            return rep.prepared_end;
        }
        shift += rep.shift;
    }
    (offset as isize + shift).max(0) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scan_finds_line_end_anchors_only() {
        let src = "First para ^intro\nmid ^not here\nTitled ^Key(\"Key idea\")  \n^solo";
        let found = scan_block_anchors(src);
        let labels: Vec<&str> = found.iter().map(|a| a.raw_label.as_str()).collect();
        assert_eq!(labels, vec!["intro", "Key", "solo"]);
        assert_eq!(found[1].label, "key");
        assert_eq!(found[1].title.as_deref(), Some("Key idea"));
        assert_eq!(&src[found[0].start..found[0].end], "^intro");
    }

    #[test]
    fn caret_inside_a_word_is_not_an_anchor() {
        assert!(scan_block_anchors("x^2 is a power").is_empty());
        assert!(scan_block_anchors("2^10").is_empty());
    }

    #[test]
    fn injection_logs_consistent_shifts() {
        let src = "One ^a\n\nTwo ^b(\"B\")\n";
        let mut log = Vec::new();
        let prepared = inject_block_anchors(src, Some(&mut log));
        assert_eq!(log.len(), 2);
        for rep in &log {
            assert_eq!(
                rep.shift,
                (rep.prepared_end - rep.prepared_start) as isize
                    - (rep.original_end - rep.original_start) as isize
            );
            assert!(prepared[rep.prepared_start..].starts_with("<span class=\"block-anchor\""));
        }
        assert!(log[0].prepared_end <= log[1].prepared_start);
        assert!(prepared.contains(r#"data-block-id="b" data-block-title="B""#));
        assert!(!prepared.contains("^a"));
    }

    #[test]
    fn translation_is_exact_at_replacement_edges() {
        let src = "Alpha ^one\nBeta ^two\nGamma";
        let mut log = Vec::new();
        let prepared = inject_block_anchors(src, Some(&mut log));
        for rep in &log {
            assert_eq!(prepared_to_original(&log, rep.prepared_start), rep.original_start);
            assert_eq!(prepared_to_original(&log, rep.prepared_end), rep.original_end);
            assert_eq!(original_to_prepared(&log, rep.original_start), rep.prepared_start);
            assert_eq!(original_to_prepared(&log, rep.original_end), rep.prepared_end);
        }
        let gamma_prepared = prepared.find("Gamma").expect("gamma");
        let gamma_original = src.find("Gamma").expect("gamma");
        assert_eq!(prepared_to_original(&log, gamma_prepared), gamma_original);
        assert_eq!(original_to_prepared(&log, gamma_original), gamma_prepared);
    }

    #[test]
    fn offsets_inside_a_marker_snap_to_anchor_end() {
        let src = "Alpha ^one";
        let mut log = Vec::new();
        inject_block_anchors(src, Some(&mut log));
        let rep = log[0];
        assert_eq!(prepared_to_original(&log, rep.prepared_start + 3), rep.original_end);
    }

    #[test]
    fn marker_round_trips_through_parser() {
        let marker = anchor_marker("Key", Some("A \"quoted\" title"));
        let (len, id, title) = parse_anchor_marker(&marker).expect("marker");
        assert_eq!(len, marker.len());
        assert_eq!(id, "Key");
        assert_eq!(title, "A &quot;quoted&quot; title");
    }

    #[test]
    fn no_anchors_means_no_log_entries() {
        let mut log = Vec::new();
        let prepared = inject_block_anchors("plain text", Some(&mut log));
        assert_eq!(prepared, "plain text");
        assert!(log.is_empty());
    }
}
