//! Sliding-window text chunker.
//!
//! Splits each document's text into [`Chunk`]s of at most `max_chars`
//! characters, where every chunk after the first starts `overlap_chars`
//! characters before the end of the previous one. Lengths are counted in
//! Unicode scalar values (`char`s), never bytes, so multi-byte text is never
//! split inside a code point.
//!
//! # Algorithm
//!
//! 1. Sort documents by source name (stable, so equal names keep upload order).
//! 2. Join each document's non-blank segments with a blank line.
//! 3. Emit windows `[start, start + max_chars)`; the next window starts at
//!    `end - overlap_chars`. Stop once a window reaches the end of the text.
//! 4. Each chunk records the segment it starts in, its character range, and
//!    a SHA-256 of its text.
//!
//! # Example
//!
//! ```rust
//! use document_portal::chunk::{split, ChunkConfig};
//! use document_portal::models::{ExtractedDocument, Segment};
//!
//! let doc = ExtractedDocument {
//!     source: "fox.txt".to_string(),
//!     segments: vec![Segment {
//!         source: "fox.txt".to_string(),
//!         position: 0,
//!         text: "The quick brown fox".to_string(),
//!     }],
//! };
//! let chunks = split(&[doc], &ChunkConfig::new(10, 3).unwrap());
//! let texts: Vec<&str> = chunks.iter().map(|c| c.text.as_str()).collect();
//! assert_eq!(texts, ["The quick ", "ck brown f", "n fox"]);
//! ```

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::models::{Chunk, ExtractedDocument};

/// Separator placed between segments of the same document.
const SEGMENT_SEPARATOR: &str = "\n\n";

/// Validated chunk sizing, in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkConfig {
    max_chars: usize,
    overlap_chars: usize,
}

impl ChunkConfig {
    /// Fails with [`Error::InvalidChunkConfig`] unless `0 <= overlap < max`.
    pub fn new(max_chars: usize, overlap_chars: usize) -> Result<Self> {
        if max_chars == 0 {
            return Err(Error::InvalidChunkConfig(
                "max_chars must be > 0".to_string(),
            ));
        }
        if overlap_chars >= max_chars {
            return Err(Error::InvalidChunkConfig(format!(
                "overlap_chars ({}) must be smaller than max_chars ({})",
                overlap_chars, max_chars
            )));
        }
        Ok(Self {
            max_chars,
            overlap_chars,
        })
    }

    pub fn max_chars(&self) -> usize {
        self.max_chars
    }

    pub fn overlap_chars(&self) -> usize {
        self.overlap_chars
    }
}

/// Split documents into overlapping chunks. Ordinals are contiguous across
/// the whole batch; `chunk_index` restarts at 0 for every document.
pub fn split(documents: &[ExtractedDocument], config: &ChunkConfig) -> Vec<Chunk> {
    let mut ordered: Vec<&ExtractedDocument> = documents.iter().collect();
    ordered.sort_by(|a, b| a.source.cmp(&b.source));

    let mut chunks = Vec::new();
    for doc in ordered {
        let (text, starts) = concatenate(doc);
        for mut chunk in split_text(&doc.source, &text, config) {
            chunk.ordinal = chunks.len() as i64;
            chunk.position = position_at(&starts, chunk.char_start as usize);
            chunks.push(chunk);
        }
    }
    chunks
}

/// Joins non-blank segments in position order, returning the text and the
/// character offset at which each segment begins.
fn concatenate(doc: &ExtractedDocument) -> (String, Vec<(usize, u32)>) {
    let mut segments: Vec<_> = doc
        .segments
        .iter()
        .filter(|s| !s.text.trim().is_empty())
        .collect();
    segments.sort_by_key(|s| s.position);

    let mut text = String::new();
    let mut starts = Vec::with_capacity(segments.len());
    let mut offset = 0usize;
    for seg in segments {
        if !text.is_empty() {
            text.push_str(SEGMENT_SEPARATOR);
            offset += SEGMENT_SEPARATOR.chars().count();
        }
        starts.push((offset, seg.position));
        text.push_str(&seg.text);
        offset += seg.text.chars().count();
    }
    (text, starts)
}

fn position_at(starts: &[(usize, u32)], char_offset: usize) -> u32 {
    starts
        .iter()
        .take_while(|(start, _)| *start <= char_offset)
        .last()
        .map(|(_, pos)| *pos)
        .unwrap_or(0)
}

/// Window a single text. Returns nothing for empty input.
pub fn split_text(source: &str, text: &str, config: &ChunkConfig) -> Vec<Chunk> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut chunks = Vec::new();
    if total == 0 {
        return chunks;
    }

    let mut start = 0usize;
    let mut index = 0i64;
    loop {
        let end = (start + config.max_chars).min(total);
        let piece: String = chars[start..end].iter().collect();
        let overlap = if index == 0 {
            0
        } else {
            config.overlap_chars
        };
        chunks.push(make_chunk(source, index, start, end, overlap, piece));
        if end == total {
            break;
        }
        start = end - config.overlap_chars;
        index += 1;
    }
    chunks
}

fn make_chunk(
    source: &str,
    index: i64,
    start: usize,
    end: usize,
    overlap: usize,
    text: String,
) -> Chunk {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let hash = format!("{:x}", hasher.finalize());

    Chunk {
        ordinal: index,
        source: source.to_string(),
        position: 0,
        chunk_index: index,
        char_start: start as i64,
        char_end: end as i64,
        overlap: overlap as i64,
        text,
        hash,
    }
}
