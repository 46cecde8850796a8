use once_cell::sync::Lazy;
use pulldown_cmark::{html, Event, Options, Parser};
use regex::Regex;
use serde::{Deserialize, Serialize};

static FRONT_MATTER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?s)\A---\s*\n(.+?)\n---\s*\n").expect("static regex"));
static DATE_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}-").expect("static regex"));
static NON_SLUG: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex"));

/// YAML header of a post file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FrontMatter {
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub slug: Option<String>,
}

/// Split a file into its front matter and body.
///
/// `None` when the file has no header. A header that is not valid YAML
/// yields an empty [`FrontMatter`].
pub fn split_front_matter(text: &str) -> Option<(FrontMatter, &str)> {
    let caps = FRONT_MATTER.captures(text)?;
    let whole = caps.get(0)?;
    let fm = serde_yaml::from_str(&caps[1]).unwrap_or_default();
    Some((fm, &text[whole.end()..]))
}

pub fn render_file(fm: &FrontMatter, body: &str) -> Result<String, serde_yaml::Error> {
    let header = serde_yaml::to_string(fm)?;
    Ok(format!("---\n{header}---\n{body}\n"))
}

/// Markdown to HTML with every line break kept.
pub fn markdown_to_html(md: &str) -> String {
    let events = Parser::new_ext(md, Options::empty()).map(|ev| match ev {
        Event::SoftBreak => Event::HardBreak,
        other => other,
    });
    let mut out = String::new();
    html::push_html(&mut out, events);
    out
}

/// URL-safe slug: lowercase, runs of other characters become one dash.
pub fn parameterize(s: &str) -> String {
    NON_SLUG
        .replace_all(&s.to_lowercase(), "-")
        .trim_matches('-')
        .to_string()
}

/// File stem with the date prefix removed.
pub fn stem_slug(file_name: &str) -> &str {
    let stem = file_name.strip_suffix(".md").unwrap_or(file_name);
    match DATE_PREFIX.find(stem) {
        Some(m) => &stem[m.end()..],
        None => stem,
    }
}

/// "rust-ownership-rules" -> "Rust Ownership Rules"
pub fn title_from_file_name(file_name: &str) -> String {
    stem_slug(file_name)
        .split('-')
        .filter(|w| !w.is_empty())
        .map(|w| {
            let mut chars = w.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<String>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parameterize_collapses_punctuation() {
        assert_eq!(parameterize("Rust: Ownership & Borrowing!"), "rust-ownership-borrowing");
        assert_eq!(parameterize("  --Tokio 1.40--  "), "tokio-1-40");
        assert_eq!(parameterize("???"), "");
    }

    #[test]
    fn front_matter_round_trips_awkward_titles() {
        let fm = FrontMatter {
            title: Some("Async: what #really happens".into()),
            date: Some("2026-10-16".into()),
            tags: vec![],
            slug: Some("async-what-really-happens".into()),
        };
        let file = render_file(&fm, "Body text.").unwrap();
        let (back, body) = split_front_matter(&file).unwrap();
        assert_eq!(back, fm);
        assert_eq!(body.trim(), "Body text.");
    }

    #[test]
    fn missing_or_broken_headers() {
        assert!(split_front_matter("just a paragraph\n").is_none());
        let (fm, body) = split_front_matter("---\n: [\n---\nhello\n").unwrap();
        assert_eq!(fm, FrontMatter::default());
        assert_eq!(body, "hello\n");
    }

    #[test]
    fn soft_breaks_become_hard() {
        let html = markdown_to_html("one\ntwo");
        assert!(html.contains("one<br />"), "{html}");
    }

    #[test]
    fn titles_from_file_names() {
        assert_eq!(stem_slug("2026-10-16-zero-copy.md"), "zero-copy");
        assert_eq!(stem_slug("notes.md"), "notes");
        assert_eq!(title_from_file_name("2026-10-16-zero-copy-PARSING.md"), "Zero Copy Parsing");
    }
}
