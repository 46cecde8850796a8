//! Markdown micro-posts on disk, written by the chat engine.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{Local, NaiveDate};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use thiserror::Error;

use autodialer_infer::{ChatMessage, ChatRequest, LlmEngine, LlmError, ResponseFormat};

pub mod post;
pub use post::{markdown_to_html, parameterize, FrontMatter};

use post::{render_file, split_front_matter, stem_slug, title_from_file_name};

pub const MAX_TOPICS: usize = 10;

const SYSTEM_PROMPT: &str = "\
You write concise technical micro posts in Markdown.
Output strictly one micro post per topic, about 30 words (+/-5), one paragraph each.
No headings, no numbering, no preface or trailing notes; only the paragraphs.
";

static LINE_BREAKS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n+").expect("static regex"));
static BLANK_LINES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n{2,}").expect("static regex"));
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").expect("static regex"));

#[derive(Debug, Error)]
pub enum BlogError {
    #[error("Please provide up to 10 topics (one per line).")]
    NoTopics,
    #[error("blog I/O error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Llm(#[from] LlmError),
}

/// Listing entry: front matter only.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PostSummary {
    pub slug: String,
    pub title: String,
    pub date: Option<String>,
    pub tags: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Post {
    #[serde(flatten)]
    pub summary: PostSummary,
    pub html: String,
}

pub struct BlogStore {
    dir: PathBuf,
    llm: Arc<dyn LlmEngine>,
    model: Option<String>,
}

impl BlogStore {
    pub fn new(dir: impl Into<PathBuf>, llm: Arc<dyn LlmEngine>, model: Option<String>) -> Self {
        Self {
            dir: dir.into(),
            llm,
            model,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `.md` file names, newest (by name) first.
    async fn post_files(&self) -> Result<Vec<String>, BlogError> {
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut names = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if let Some(name) = entry.file_name().to_str() {
                if name.ends_with(".md") {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        names.reverse();
        Ok(names)
    }

    async fn find(&self, slug: &str) -> Result<Option<String>, BlogError> {
        let suffix = format!("-{slug}.md");
        let mut names = self.post_files().await?;
        names.sort();
        Ok(names.into_iter().find(|n| n.ends_with(&suffix)))
    }

    pub async fn list(&self) -> Result<Vec<PostSummary>, BlogError> {
        let mut posts = Vec::new();
        for name in self.post_files().await? {
            let text = match tokio::fs::read_to_string(self.dir.join(&name)).await {
                Ok(text) => text,
                Err(e) => {
                    tracing::warn!(file = %name, error = %e, "skipping unreadable post");
                    continue;
                }
            };
            if let Some((fm, _)) = split_front_matter(&text) {
                posts.push(summarize(&name, fm, stem_slug(&name)));
            }
        }
        Ok(posts)
    }

    pub async fn read(&self, slug: &str) -> Result<Option<Post>, BlogError> {
        let Some(name) = self.find(slug).await? else {
            return Ok(None);
        };
        let text = tokio::fs::read_to_string(self.dir.join(&name)).await?;
        Ok(split_front_matter(&text).map(|(fm, body)| Post {
            summary: summarize(&name, fm, slug),
            html: markdown_to_html(body),
        }))
    }

    /// Returns whether a post was removed.
    pub async fn delete(&self, slug: &str) -> Result<bool, BlogError> {
        match self.find(slug).await? {
            Some(name) => {
                tokio::fs::remove_file(self.dir.join(name)).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// One post per topic line, via the chat engine. Returns how many were written.
    pub async fn generate(&self, titles: &str) -> Result<usize, BlogError> {
        let topics: Vec<&str> = titles
            .lines()
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .take(MAX_TOPICS)
            .collect();
        if topics.is_empty() {
            return Err(BlogError::NoTopics);
        }

        let numbered: Vec<String> = topics
            .iter()
            .enumerate()
            .map(|(i, t)| format!("{}. {t}", i + 1))
            .collect();
        let user = format!(
            "Topics:\n{}\n\nReturn exactly {} paragraphs, one per topic, in the same order, about 30 words each.\n",
            numbered.join("\n"),
            topics.len()
        );
        let content = self
            .llm
            .complete(ChatRequest {
                messages: vec![ChatMessage::system(SYSTEM_PROMPT), ChatMessage::user(user)],
                temperature: 0.3,
                max_tokens: Some(1200),
                response_format: ResponseFormat::Text,
                model: self.model.clone(),
            })
            .await?;

        self.write_micro_posts(&topics, &content, Local::now().date_naive())
            .await
    }

    /// Pair topics with paragraphs of `raw` and write the non-empty ones.
    pub async fn write_micro_posts(
        &self,
        topics: &[&str],
        raw: &str,
        date: NaiveDate,
    ) -> Result<usize, BlogError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let paragraphs = split_paragraphs(raw, topics.len());
        let date = date.format("%Y-%m-%d").to_string();

        let mut created = 0;
        for (topic, body) in topics.iter().zip(paragraphs) {
            if body.is_empty() {
                continue;
            }
            let slug = parameterize(topic);
            if slug.is_empty() {
                tracing::warn!(topic = %topic, "topic has no usable slug");
                continue;
            }
            let fm = FrontMatter {
                title: Some(topic.to_string()),
                date: Some(date.clone()),
                tags: Vec::new(),
                slug: Some(slug.clone()),
            };
            let file = match render_file(&fm, &body) {
                Ok(file) => file,
                Err(e) => {
                    tracing::warn!(topic = %topic, error = %e, "blog write error");
                    continue;
                }
            };
            let path = self.dir.join(format!("{date}-{slug}.md"));
            match tokio::fs::write(&path, file).await {
                Ok(()) => created += 1,
                Err(e) => tracing::warn!(topic = %topic, error = %e, "blog write error"),
            }
        }
        Ok(created)
    }
}

fn summarize(file_name: &str, fm: FrontMatter, slug_hint: &str) -> PostSummary {
    let slug = fm
        .slug
        .as_deref()
        .filter(|s| !s.trim().is_empty())
        .unwrap_or(slug_hint);
    let title = fm
        .title
        .filter(|t| !t.trim().is_empty())
        .unwrap_or_else(|| title_from_file_name(file_name));
    PostSummary {
        slug: parameterize(slug),
        title,
        date: fm.date,
        tags: fm.tags,
    }
}

/// Exactly `count` whitespace-collapsed paragraphs; missing ones are empty.
fn split_paragraphs(raw: &str, count: usize) -> Vec<String> {
    let raw = raw.trim();
    let split = |re: &Regex| -> Vec<String> {
        re.split(raw)
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(|p| WHITESPACE.replace_all(p, " ").into_owned())
            .collect()
    };
    let mut paragraphs = split(&LINE_BREAKS);
    if paragraphs.len() < count {
        paragraphs = split(&BLANK_LINES);
    }
    paragraphs.resize(count, String::new());
    paragraphs
}
