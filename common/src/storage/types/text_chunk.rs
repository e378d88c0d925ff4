use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const TITLE_SEPARATOR: &str = " > ";

/// A retrievable slice of a document.
///
/// `titles` holds the heading lineage the chunk sits under, outermost first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextChunk {
    pub id: String,
    pub document_id: String,
    pub sequence: usize,
    pub text: String,
    #[serde(default)]
    pub titles: Vec<String>,
}

impl TextChunk {
    pub fn new(
        document_id: impl Into<String>,
        sequence: usize,
        text: impl Into<String>,
        titles: Vec<String>,
    ) -> Self {
        let document_id = document_id.into();
        Self {
            id: Self::stable_id(&document_id, sequence),
            document_id,
            sequence,
            text: text.into(),
            titles,
        }
    }

    /// Deterministic id for the chunk at `sequence` within `document_id`.
    pub fn stable_id(document_id: &str, sequence: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(document_id.as_bytes());
        hasher.update(b":");
        hasher.update(sequence.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    /// Re-keys the chunk to one ingestion run, so runs over the same document never share ids.
    #[must_use]
    pub fn scoped_to(mut self, ingestion_id: &str) -> Self {
        self.id = Self::scoped_id(&self.document_id, ingestion_id, self.sequence);
        self
    }

    pub fn scoped_id(document_id: &str, ingestion_id: &str, sequence: usize) -> String {
        let mut hasher = Sha256::new();
        hasher.update(document_id.as_bytes());
        hasher.update(b":");
        hasher.update(ingestion_id.as_bytes());
        hasher.update(b":");
        hasher.update(sequence.to_le_bytes());
        format!("{:x}", hasher.finalize())
    }

    pub fn title_path(&self) -> Option<String> {
        if self.titles.is_empty() {
            None
        } else {
            Some(self.titles.join(TITLE_SEPARATOR))
        }
    }

    /// Text handed to embedders and the keyword index, with the heading lineage prepended.
    pub fn indexable_text(&self) -> String {
        match self.title_path() {
            Some(path) => format!("{path}\n\n{}", self.text),
            None => self.text.clone(),
        }
    }
}
