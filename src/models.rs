//! Core data models used throughout the portal.
//!
//! These types represent the uploads, extracted documents, chunks, and
//! scored results that flow through the ingestion and retrieval pipeline.

use serde::Serialize;

/// A file handed to the pipeline by the request layer.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub name: String,
    pub content: Vec<u8>,
}

impl UploadedFile {
    pub fn new(name: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            content: content.into(),
        }
    }

    /// Lower-cased extension without the dot, if the name has one.
    pub fn extension(&self) -> Option<String> {
        std::path::Path::new(&self.name)
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
    }
}

/// One ordered piece of extracted text (a page, paragraph, or block).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub source: String,
    pub position: u32,
    pub text: String,
}

/// Plain-text rendition of one uploaded file.
#[derive(Debug, Clone)]
pub struct ExtractedDocument {
    pub source: String,
    pub segments: Vec<Segment>,
}

impl ExtractedDocument {
    pub fn is_blank(&self) -> bool {
        self.segments.iter().all(|s| s.text.trim().is_empty())
    }
}

/// A bounded span of a document's text, ready for embedding.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    /// Position of this chunk within the whole index.
    pub ordinal: i64,
    pub source: String,
    /// Position of the segment the chunk starts in.
    pub position: u32,
    /// Index of this chunk within its source document.
    pub chunk_index: i64,
    /// Character range within the document's concatenated text.
    pub char_start: i64,
    pub char_end: i64,
    /// Number of leading characters shared with the previous chunk.
    pub overlap: i64,
    pub text: String,
    pub hash: String,
}

/// A chunk returned from a similarity query.
#[derive(Debug, Clone, Serialize)]
pub struct ScoredChunk {
    pub score: f32,
    pub chunk: Chunk,
}

/// An upload excluded from the batch, with the reason it was dropped.
#[derive(Debug)]
pub struct SkippedFile {
    pub name: String,
    pub error: crate::error::Error,
}
