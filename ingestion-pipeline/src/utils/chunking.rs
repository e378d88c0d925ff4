use std::collections::HashSet;

use async_trait::async_trait;
use common::{
    error::AppError,
    storage::types::{
        document::{ContentKind, Document},
        text_chunk::TextChunk,
    },
    utils::config::AppConfig,
};
use dom_smoothie::{Article, Readability, ReadabilityError, TextMode};
use text_splitter::{ChunkConfig, TextSplitter};
use tracing::debug;

/// Turns a document into ordered retrievable units.
#[async_trait]
pub trait Chunker: Send + Sync {
    async fn chunk(&self, document: &Document) -> Result<Vec<TextChunk>, AppError>;
}

/// Character-bounded chunker built on `text-splitter`.
///
/// HTML is reduced to markdown with readability first. Markdown headings are tracked so
/// every chunk carries the heading lineage it was found under.
#[derive(Debug, Clone)]
pub struct TextSplitterChunker {
    max_chars: usize,
    overlap_chars: usize,
}

impl TextSplitterChunker {
    pub fn new(max_chars: usize, overlap_chars: usize) -> Result<Self, AppError> {
        if max_chars == 0 {
            return Err(AppError::InvalidArgument(
                "chunk_max_chars must be greater than zero".into(),
            ));
        }
        if overlap_chars >= max_chars {
            return Err(AppError::InvalidArgument(format!(
                "chunk_overlap_chars ({overlap_chars}) must be smaller than chunk_max_chars ({max_chars})"
            )));
        }
        Ok(Self {
            max_chars,
            overlap_chars,
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        Self::new(config.chunk_max_chars, config.chunk_overlap_chars)
    }

    fn splitter(&self) -> Result<TextSplitter<text_splitter::Characters>, AppError> {
        let config = ChunkConfig::new(self.max_chars)
            .with_overlap(self.overlap_chars)
            .map_err(|e| AppError::Extraction(format!("invalid chunk overlap: {e}")))?;
        Ok(TextSplitter::new(config))
    }

    fn split(&self, document: &Document, sections: Vec<Section>) -> Result<Vec<TextChunk>, AppError> {
        let splitter = self.splitter()?;
        let mut chunks = Vec::new();
        for section in sections {
            for piece in splitter.chunks(&section.body) {
                let text = piece.trim();
                if text.is_empty() {
                    continue;
                }
                chunks.push(TextChunk::new(
                    document.id.clone(),
                    chunks.len(),
                    text,
                    section.titles.clone(),
                ));
            }
        }
        Ok(chunks)
    }
}

#[async_trait]
impl Chunker for TextSplitterChunker {
    async fn chunk(&self, document: &Document) -> Result<Vec<TextChunk>, AppError> {
        if document.is_blank() {
            return Ok(Vec::new());
        }

        let sections = match document.kind {
            ContentKind::PlainText => vec![Section::untitled(document.content.clone())],
            ContentKind::BinaryText => vec![Section::untitled(strip_control_chars(
                &document.content,
            ))],
            ContentKind::Markdown => markdown_sections(&document.content),
            ContentKind::Html => markdown_sections(&html_to_markdown(&document.content)?),
        };

        let chunks = self.split(document, sections)?;
        debug!(
            document_id = %document.id,
            kind = %document.kind,
            chunk_count = chunks.len(),
            "document chunked"
        );
        Ok(chunks)
    }
}

/// Checks that chunker output belongs to `document_id`, is numbered 0..n without gaps and
/// carries unique ids.
pub fn validate_chunks(document_id: &str, chunks: &[TextChunk]) -> Result<(), AppError> {
    let mut seen = HashSet::with_capacity(chunks.len());
    for (expected, chunk) in chunks.iter().enumerate() {
        if chunk.document_id != document_id {
            return Err(AppError::Extraction(format!(
                "chunk {} belongs to document '{}', expected '{document_id}'",
                chunk.id, chunk.document_id
            )));
        }
        if chunk.sequence != expected {
            return Err(AppError::Extraction(format!(
                "chunk sequence {} found where {expected} was expected",
                chunk.sequence
            )));
        }
        if !seen.insert(chunk.id.as_str()) {
            return Err(AppError::Extraction(format!(
                "duplicate chunk id {}",
                chunk.id
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq)]
struct Section {
    titles: Vec<String>,
    body: String,
}

impl Section {
    fn untitled(body: String) -> Self {
        Self {
            titles: Vec::new(),
            body,
        }
    }
}

fn html_to_markdown(html: &str) -> Result<String, AppError> {
    let config = dom_smoothie::Config {
        text_mode: TextMode::Markdown,
        ..Default::default()
    };
    let mut readability =
        Readability::new(html, None, Some(config)).map_err(readability_error)?;
    let article: Article = readability.parse().map_err(readability_error)?;

    let body: String = article.text_content.into();
    let title = article.title.trim();
    if title.is_empty() || body.contains(title) {
        Ok(body)
    } else {
        Ok(format!("# {title}\n\n{body}"))
    }
}

fn readability_error(err: ReadabilityError) -> AppError {
    AppError::Extraction(format!("readability failed: {err}"))
}

fn heading(line: &str) -> Option<(usize, &str)> {
    let trimmed = line.trim_start();
    let level = trimmed.chars().take_while(|c| *c == '#').count();
    if level == 0 || level > 6 {
        return None;
    }
    let rest = trimmed.get(level..)?;
    if !rest.starts_with(char::is_whitespace) {
        return None;
    }
    let title = rest.trim().trim_end_matches('#').trim();
    (!title.is_empty()).then_some((level, title))
}

fn markdown_sections(markdown: &str) -> Vec<Section> {
    let mut sections = Vec::new();
    let mut lineage: Vec<(usize, String)> = Vec::new();
    let mut body = String::new();
    let mut in_fence = false;

    let flush = |lineage: &[(usize, String)], body: &mut String, sections: &mut Vec<Section>| {
        if !body.trim().is_empty() {
            sections.push(Section {
                titles: lineage.iter().map(|(_, title)| title.clone()).collect(),
                body: std::mem::take(body),
            });
        } else {
            body.clear();
        }
    };

    for line in markdown.lines() {
        if line.trim_start().starts_with("```") {
            in_fence = !in_fence;
        }
        if !in_fence {
            if let Some((level, title)) = heading(line) {
                flush(&lineage, &mut body, &mut sections);
                while lineage.last().is_some_and(|(top, _)| *top >= level) {
                    lineage.pop();
                }
                lineage.push((level, title.to_string()));
                continue;
            }
        }
        body.push_str(line);
        body.push('\n');
    }
    flush(&lineage, &mut body, &mut sections);
    sections
}

fn strip_control_chars(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect()
}
