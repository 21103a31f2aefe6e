//! Multi-format text extraction (PDF, DOCX, plain text, Markdown).
//!
//! Each format is an [`Extractor`] registered under its file extensions in an
//! [`ExtractorRegistry`]. The pipeline runs every file on the blocking pool
//! and turns a failure (or a parser panic) into a per-file warning.

use std::collections::HashMap;
use std::io::Read;
use std::sync::Arc;

use pulldown_cmark::{Event, Parser, Tag, TagEnd};

use crate::error::{Error, Result};
use crate::models::{ExtractedDocument, Segment};

/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Converts the bytes of one file into ordered text segments.
pub trait Extractor: Send + Sync {
    /// Short format name used in logs (e.g. `"pdf"`).
    fn name(&self) -> &str;

    /// Lower-case extensions (without the dot) handled by this extractor.
    fn extensions(&self) -> &[&str];

    /// Extract text. `source` is the original upload name, copied into
    /// every segment.
    fn extract(&self, source: &str, bytes: &[u8]) -> Result<ExtractedDocument>;
}

/// Extension-keyed set of extractors.
#[derive(Clone)]
pub struct ExtractorRegistry {
    by_extension: HashMap<String, Arc<dyn Extractor>>,
}

impl ExtractorRegistry {
    pub fn empty() -> Self {
        Self {
            by_extension: HashMap::new(),
        }
    }

    /// Registry with the built-in PDF, DOCX, text and Markdown extractors.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(PdfExtractor));
        registry.register(Arc::new(DocxExtractor));
        registry.register(Arc::new(PlainTextExtractor));
        registry.register(Arc::new(MarkdownExtractor));
        registry
    }

    /// Register an extractor for all of its extensions, replacing any
    /// previous owner of those extensions.
    pub fn register(&mut self, extractor: Arc<dyn Extractor>) {
        for ext in extractor.extensions() {
            self.by_extension
                .insert(ext.to_ascii_lowercase(), extractor.clone());
        }
    }

    pub fn find(&self, extension: &str) -> Option<Arc<dyn Extractor>> {
        self.by_extension
            .get(&extension.to_ascii_lowercase())
            .cloned()
    }

    pub fn supports(&self, extension: &str) -> bool {
        self.find(extension).is_some()
    }

    /// Supported extensions, sorted.
    pub fn extensions(&self) -> Vec<String> {
        let mut exts: Vec<String> = self.by_extension.keys().cloned().collect();
        exts.sort();
        exts
    }
}

impl Default for ExtractorRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn failure(source: &str, reason: impl Into<String>) -> Error {
    Error::ExtractionFailure {
        file: source.to_string(),
        reason: reason.into(),
    }
}

fn segment(source: &str, position: u32, text: String) -> Segment {
    Segment {
        source: source.to_string(),
        position,
        text,
    }
}

/// Drops blank segments and fails when nothing is left.
fn finish(source: &str, segments: Vec<Segment>) -> Result<ExtractedDocument> {
    let segments: Vec<Segment> = segments
        .into_iter()
        .filter(|s| !s.text.trim().is_empty())
        .collect();
    if segments.is_empty() {
        return Err(failure(source, "no extractable text"));
    }
    Ok(ExtractedDocument {
        source: source.to_string(),
        segments,
    })
}

// ============ PDF ============

/// Page-by-page PDF text. Positions are 1-based page numbers.
pub struct PdfExtractor;

impl Extractor for PdfExtractor {
    fn name(&self) -> &str {
        "pdf"
    }

    fn extensions(&self) -> &[&str] {
        &["pdf"]
    }

    fn extract(&self, source: &str, bytes: &[u8]) -> Result<ExtractedDocument> {
        let pages = pdf_extract::extract_text_from_mem_by_pages(bytes)
            .map_err(|e| failure(source, format!("PDF extraction failed: {}", e)))?;
        let segments = pages
            .into_iter()
            .enumerate()
            .map(|(i, text)| segment(source, i as u32 + 1, text.trim().to_string()))
            .collect();
        finish(source, segments)
    }
}

// ============ DOCX ============

/// Paragraph text from `word/document.xml`. Positions are paragraph indices.
pub struct DocxExtractor;

impl Extractor for DocxExtractor {
    fn name(&self) -> &str {
        "docx"
    }

    fn extensions(&self) -> &[&str] {
        &["docx"]
    }

    fn extract(&self, source: &str, bytes: &[u8]) -> Result<ExtractedDocument> {
        let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
            .map_err(|e| failure(source, format!("OOXML extraction failed: {}", e)))?;
        let xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)
            .map_err(|reason| failure(source, reason))?;
        let paragraphs = extract_paragraphs(&xml).map_err(|reason| failure(source, reason))?;
        let segments = paragraphs
            .into_iter()
            .enumerate()
            .map(|(i, text)| segment(source, i as u32, text))
            .collect();
        finish(source, segments)
    }
}

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> std::result::Result<Vec<u8>, String> {
    let entry = archive
        .by_name(name)
        .map_err(|e| format!("{} not found: {}", name, e))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= max_bytes {
        return Err(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        ));
    }
    Ok(out)
}

/// Collects `w:t` runs, one string per `w:p` paragraph. Tabs and breaks
/// inside a paragraph become spaces.
fn extract_paragraphs(xml: &[u8]) -> std::result::Result<Vec<String>, String> {
    use quick_xml::events::Event as XmlEvent;

    let mut paragraphs = Vec::new();
    let mut current = String::new();
    let mut in_text = false;
    let mut reader = quick_xml::Reader::from_reader(xml);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(XmlEvent::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_text = true;
                }
            }
            Ok(XmlEvent::Empty(e)) => match e.local_name().as_ref() {
                b"tab" | b"br" => current.push(' '),
                _ => {}
            },
            Ok(XmlEvent::Text(te)) if in_text => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(XmlEvent::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => paragraphs.push(std::mem::take(&mut current).trim().to_string()),
                _ => {}
            },
            Ok(XmlEvent::Eof) => break,
            Err(e) => return Err(format!("OOXML extraction failed: {}", e)),
            _ => {}
        }
        buf.clear();
    }
    if !current.trim().is_empty() {
        paragraphs.push(current.trim().to_string());
    }
    Ok(paragraphs)
}

// ============ Plain text ============

/// Strict UTF-8 text, one segment at position 0.
pub struct PlainTextExtractor;

impl Extractor for PlainTextExtractor {
    fn name(&self) -> &str {
        "text"
    }

    fn extensions(&self) -> &[&str] {
        &["txt"]
    }

    fn extract(&self, source: &str, bytes: &[u8]) -> Result<ExtractedDocument> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| failure(source, format!("invalid UTF-8: {}", e)))?;
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        finish(source, vec![segment(source, 0, text.to_string())])
    }
}

// ============ Markdown ============

/// Markdown with markup removed. Each top-level block becomes one segment.
pub struct MarkdownExtractor;

impl Extractor for MarkdownExtractor {
    fn name(&self) -> &str {
        "markdown"
    }

    fn extensions(&self) -> &[&str] {
        &["md"]
    }

    fn extract(&self, source: &str, bytes: &[u8]) -> Result<ExtractedDocument> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| failure(source, format!("invalid UTF-8: {}", e)))?;
        let segments = markdown_blocks(text)
            .into_iter()
            .enumerate()
            .map(|(i, block)| segment(source, i as u32, block))
            .collect();
        finish(source, segments)
    }
}

fn markdown_blocks(text: &str) -> Vec<String> {
    let mut blocks = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;

    for event in Parser::new(text) {
        match event {
            Event::Start(tag) => {
                if depth > 0 && matches!(tag, Tag::Item | Tag::Paragraph) && !current.is_empty() {
                    current.push(' ');
                }
                depth += 1;
            }
            Event::End(tag) => {
                depth = depth.saturating_sub(1);
                if matches!(tag, TagEnd::TableCell) {
                    current.push(' ');
                }
                if depth == 0 {
                    let block = current.trim().to_string();
                    if !block.is_empty() {
                        blocks.push(block);
                    }
                    current.clear();
                }
            }
            Event::Text(t) | Event::Code(t) => current.push_str(&t),
            Event::SoftBreak | Event::HardBreak => current.push(' '),
            _ => {}
        }
    }
    if !current.trim().is_empty() {
        blocks.push(current.trim().to_string());
    }
    blocks
}
