//! Heading-boundary splitting for Markdown and HTML documents.
//!
//! Both splitters cut the document at heading boundaries and attach the nearest ancestor
//! heading to every chunk produced from its section. Boundary-preserving by design:
//! no overlap is stitched across sections. Sections that exceed the token budget are
//! re-split through the hard backstop while keeping their heading.

use super::tokens::{TokenCounter, budget_split};
use regex::Regex;
use std::sync::OnceLock;

fn markdown_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").expect("valid markdown heading regex"))
}

fn html_heading() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<h([1-6])[^>]*>(.*?)</h[1-6]\s*>").expect("valid html heading regex")
    })
}

fn html_tag() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<[^>]+>").expect("valid html tag regex"))
}

/// Split Markdown at heading boundaries.
pub(crate) fn split_markdown(
    text: &str,
    chunk_size: usize,
    counter: &TokenCounter,
) -> Vec<(String, Option<String>)> {
    let mut sections = Vec::new();
    let mut heading: Option<String> = None;
    let mut cursor = 0;

    for found in markdown_heading().captures_iter(text) {
        let whole = found.get(0).expect("capture 0 always present");
        push_section(&mut sections, &text[cursor..whole.start()], heading.clone());
        heading = Some(found[2].trim().to_string());
        cursor = whole.end();
    }
    push_section(&mut sections, &text[cursor..], heading);

    explode_oversized(sections, chunk_size, counter)
}

/// Split HTML at `<h1>`–`<h6>` boundaries, stripping tags from section bodies.
pub(crate) fn split_html(
    text: &str,
    chunk_size: usize,
    counter: &TokenCounter,
) -> Vec<(String, Option<String>)> {
    let mut sections = Vec::new();
    let mut heading: Option<String> = None;
    let mut cursor = 0;

    for found in html_heading().captures_iter(text) {
        let whole = found.get(0).expect("capture 0 always present");
        push_section(
            &mut sections,
            &strip_tags(&text[cursor..whole.start()]),
            heading.clone(),
        );
        heading = Some(strip_tags(&found[2]).trim().to_string());
        cursor = whole.end();
    }
    push_section(&mut sections, &strip_tags(&text[cursor..]), heading);

    explode_oversized(sections, chunk_size, counter)
}

fn strip_tags(fragment: &str) -> String {
    html_tag().replace_all(fragment, " ").to_string()
}

fn push_section(
    sections: &mut Vec<(String, Option<String>)>,
    body: &str,
    heading: Option<String>,
) {
    let body = body.trim();
    if body.is_empty() {
        return;
    }
    sections.push((body.to_string(), heading));
}

fn explode_oversized(
    sections: Vec<(String, Option<String>)>,
    chunk_size: usize,
    counter: &TokenCounter,
) -> Vec<(String, Option<String>)> {
    let mut out = Vec::with_capacity(sections.len());
    for (body, heading) in sections {
        if counter.count(&body) <= chunk_size {
            out.push((body, heading));
            continue;
        }
        for piece in budget_split(&body, chunk_size, counter) {
            out.push((piece, heading.clone()));
        }
    }
    out
}
