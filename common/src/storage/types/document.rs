use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Declared format of a document's content.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentKind {
    #[default]
    PlainText,
    Html,
    Markdown,
    /// Text previously extracted from a binary source such as a PDF.
    BinaryText,
}

impl ContentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::PlainText => "plain_text",
            ContentKind::Html => "html",
            ContentKind::Markdown => "markdown",
            ContentKind::BinaryText => "binary_text",
        }
    }

    /// Guesses the kind from a file extension, falling back to plain text.
    pub fn from_extension(extension: &str) -> Self {
        match extension.to_ascii_lowercase().as_str() {
            "html" | "htm" | "xhtml" => ContentKind::Html,
            "md" | "markdown" | "mdx" => ContentKind::Markdown,
            _ => ContentKind::PlainText,
        }
    }
}

impl FromStr for ContentKind {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "plain" | "plain_text" | "txt" => Ok(ContentKind::PlainText),
            "html" | "htm" => Ok(ContentKind::Html),
            "markdown" | "md" => Ok(ContentKind::Markdown),
            "binary" | "binary_text" | "pdf" => Ok(ContentKind::BinaryText),
            other => Err(AppError::InvalidArgument(format!(
                "unknown content kind '{other}'. Expected 'text', 'html', 'markdown' or 'binary_text'."
            ))),
        }
    }
}

impl std::fmt::Display for ContentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub kind: ContentKind,
    pub content: String,
    pub title: Option<String>,
    pub source: Option<String>,
}

impl Document {
    pub fn new(kind: ContentKind, content: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            content: content.into(),
            title: None,
            source: None,
        }
    }

    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    #[must_use]
    pub fn with_title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    #[must_use]
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn is_blank(&self) -> bool {
        self.content.trim().is_empty()
    }
}
