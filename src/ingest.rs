//! Ingestion pipeline orchestration.
//!
//! ```text
//! uploads ─▶ save to temp namespace ─▶ extract (one blocking task per file)
//!         ─▶ chunk ─▶ embed (batched) ─▶ build index ─▶ persist ─▶ Retriever
//! ```
//!
//! Unsupported or unreadable files are skipped with a warning and reported
//! in [`IngestOutcome::skipped`]; the batch only fails outright when no file
//! yields text. Failures after extraction carry the stage that broke
//! ([`Error::Stage`]). Embedding and persistence are bounded by
//! `pipeline.stage_timeout_secs`.
//!
//! Concurrent ingestions into the same session are not coordinated: the last
//! one to publish wins, and readers always see one complete index.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::task::JoinSet;
use tracing::Instrument;
use uuid::Uuid;

use crate::chunk::{self, ChunkConfig};
use crate::context::PortalContext;
use crate::embedding::embed_batched;
use crate::error::{Error, Result, Stage};
use crate::extract::Extractor;
use crate::index::VectorIndex;
use crate::models::{ExtractedDocument, SkippedFile, UploadedFile};
use crate::retriever::Retriever;
use crate::session::Session;

/// Counters describing one ingestion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub files_received: usize,
    pub files_ingested: usize,
    pub chunks: usize,
    pub dims: usize,
}

/// Result of a successful ingestion, possibly with skipped files.
#[derive(Debug)]
pub struct IngestOutcome {
    pub session_id: String,
    pub retriever: Retriever,
    /// Uploads excluded from the index, in upload order.
    pub skipped: Vec<SkippedFile>,
    pub stats: IngestStats,
}

/// Per-call overrides. Unset fields fall back to `[chunking]` and
/// `[retrieval]` in the configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOptions {
    pub chunk_size: Option<usize>,
    pub chunk_overlap: Option<usize>,
    /// Result count bound to the returned retriever.
    pub k: Option<usize>,
}

impl IngestOptions {
    /// Resolve the chunking for this call, failing with
    /// [`Error::InvalidChunkConfig`] when the combination is unusable.
    pub fn chunk_config(&self, ctx: &PortalContext) -> Result<ChunkConfig> {
        let configured = &ctx.config().chunking;
        ChunkConfig::new(
            self.chunk_size.unwrap_or(configured.max_chars),
            self.chunk_overlap.unwrap_or(configured.overlap_chars),
        )
    }
}

/// Allocate (or re-open) a session and ingest `files` into it with the
/// configured chunking.
pub async fn ingest(
    ctx: &PortalContext,
    session_id: Option<&str>,
    files: Vec<UploadedFile>,
) -> Result<IngestOutcome> {
    ingest_with(ctx, session_id, files, IngestOptions::default()).await
}

/// [`ingest`] with per-call chunking and `k`. Options are validated before
/// any session storage is touched.
pub async fn ingest_with(
    ctx: &PortalContext,
    session_id: Option<&str>,
    files: Vec<UploadedFile>,
    options: IngestOptions,
) -> Result<IngestOutcome> {
    let chunk_config = options.chunk_config(ctx)?;
    let session = ctx.sessions().allocate(session_id)?;
    let mut outcome = ingest_session(ctx, &session, files, &chunk_config).await?;
    if let Some(k) = options.k {
        outcome.retriever = outcome.retriever.with_k(k);
    }
    Ok(outcome)
}

/// Run the pipeline for an allocated session, replacing its index.
pub async fn ingest_session(
    ctx: &PortalContext,
    session: &Session,
    files: Vec<UploadedFile>,
    chunk_config: &ChunkConfig,
) -> Result<IngestOutcome> {
    let span = tracing::info_span!(parent: ctx.span(), "ingest", session_id = %session.id);
    run_pipeline(ctx, session, files, chunk_config)
        .instrument(span)
        .await
}

struct SavedUpload {
    order: usize,
    name: String,
    path: PathBuf,
    extractor: Arc<dyn Extractor>,
}

async fn run_pipeline(
    ctx: &PortalContext,
    session: &Session,
    files: Vec<UploadedFile>,
    chunk_config: &ChunkConfig,
) -> Result<IngestOutcome> {
    let received = files.len();
    tracing::info!(files = received, "ingestion started");

    let mut skipped: Vec<(usize, SkippedFile)> = Vec::new();

    // 1. Save supported uploads into the temp namespace
    let mut saved = Vec::with_capacity(files.len());
    for (order, file) in files.into_iter().enumerate() {
        let extractor = file
            .extension()
            .and_then(|ext| ctx.extractors().find(&ext).map(|x| (ext, x)));
        let Some((ext, extractor)) = extractor else {
            tracing::warn!(file = %file.name, "skipping unsupported file type");
            skipped.push((
                order,
                SkippedFile {
                    error: Error::UnsupportedFileType(file.name.clone()),
                    name: file.name,
                },
            ));
            continue;
        };

        let stored = save_upload(&session.temp_dir, &file.content, || {
            format!("{}.{}", hex::encode(&Uuid::new_v4().as_bytes()[..4]), ext)
        })
        .await?;
        tracing::debug!(file = %file.name, stored = %stored.display(), "upload saved");

        saved.push(SavedUpload {
            order,
            name: file.name,
            path: stored,
            extractor,
        });
    }

    // 2. Extract concurrently; failures stay with their file
    let mut documents: Vec<(usize, ExtractedDocument)> = Vec::new();
    for (order, name, result) in extract_all(saved).await {
        match result {
            Ok(doc) => documents.push((order, doc)),
            Err(error) => {
                tracing::warn!(file = %name, error = %error, "skipping file that failed extraction");
                skipped.push((order, SkippedFile { name, error }));
            }
        }
    }

    // 3.
    if documents.is_empty() {
        return Err(Error::NoIngestibleContent { received });
    }

    documents.sort_by_key(|(order, _)| *order);
    skipped.sort_by_key(|(order, _)| *order);
    let documents: Vec<ExtractedDocument> = documents.into_iter().map(|(_, d)| d).collect();
    let skipped: Vec<SkippedFile> = skipped.into_iter().map(|(_, s)| s).collect();

    // 4. Chunk
    let chunks = chunk::split(&documents, chunk_config);
    if chunks.is_empty() {
        return Err(Error::EmptyIndex.at_stage(Stage::Chunk));
    }
    tracing::debug!(chunks = chunks.len(), "chunked");

    // 5. Embed
    let limit = Duration::from_secs(ctx.config().pipeline.stage_timeout_secs);
    let provider = ctx.provider().clone();
    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = with_timeout(
        Stage::Embed,
        limit,
        embed_batched(
            provider.as_ref(),
            &texts,
            ctx.config().embedding.batch_size,
        ),
    )
    .await?;

    // 6. Build and persist
    let index = build_index(chunks, vectors, provider.model_name(), provider.dims())
        .map_err(|e| e.at_stage(Stage::Index))?;
    with_timeout(
        Stage::Persist,
        limit,
        ctx.store().persist(&index, &session.index_dir),
    )
    .await?;

    let stats = IngestStats {
        files_received: received,
        files_ingested: documents.len(),
        chunks: index.len(),
        dims: index.dims(),
    };
    tracing::info!(
        files_ingested = stats.files_ingested,
        files_skipped = skipped.len(),
        chunks = stats.chunks,
        dims = stats.dims,
        "ingestion complete"
    );

    // 7.
    let retriever = Retriever::new(
        session.id.clone(),
        Arc::new(index),
        provider,
        ctx.config().retrieval.top_k,
    );
    Ok(IngestOutcome {
        session_id: session.id.clone(),
        retriever,
        skipped,
        stats,
    })
}

/// Write `content` under the first name from `next_name` that does not exist
/// yet. An existing file is never overwritten.
async fn save_upload(
    dir: &Path,
    content: &[u8],
    mut next_name: impl FnMut() -> String,
) -> Result<PathBuf> {
    const MAX_ATTEMPTS: usize = 16;
    let mut last = dir.to_path_buf();
    for _ in 0..MAX_ATTEMPTS {
        let path = dir.join(next_name());
        let opened = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await;
        let mut file = match opened {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                tracing::debug!(path = %path.display(), "upload name taken, retrying");
                last = path;
                continue;
            }
            Err(source) => return Err(Error::StorageUnavailable { path, source }),
        };
        let written = async {
            file.write_all(content).await?;
            file.flush().await
        }
        .await;
        return match written {
            Ok(()) => Ok(path),
            Err(source) => Err(Error::StorageUnavailable { path, source }),
        };
    }
    Err(Error::StorageUnavailable {
        path: last,
        source: std::io::Error::new(
            std::io::ErrorKind::AlreadyExists,
            "no free upload name",
        ),
    })
}

/// Extract every saved upload on the blocking pool. Results come back in
/// completion order, tagged with the upload order.
async fn extract_all(saved: Vec<SavedUpload>) -> Vec<(usize, String, Result<ExtractedDocument>)> {
    let mut tasks = JoinSet::new();
    for upload in saved {
        tasks.spawn(async move {
            let SavedUpload {
                order,
                name,
                path,
                extractor,
            } = upload;
            let source = name.clone();
            let joined = tokio::task::spawn_blocking(move || {
                let bytes = std::fs::read(&path).map_err(|e| Error::ExtractionFailure {
                    file: source.clone(),
                    reason: format!("cannot read saved upload: {}", e),
                })?;
                let doc = extractor.extract(&source, &bytes)?;
                if doc.is_blank() {
                    return Err(Error::ExtractionFailure {
                        file: source,
                        reason: "no extractable text".to_string(),
                    });
                }
                Ok(doc)
            })
            .await;

            let result = match joined {
                Ok(result) => result,
                Err(e) => Err(Error::ExtractionFailure {
                    file: name.clone(),
                    reason: if e.is_panic() {
                        "extractor panicked".to_string()
                    } else {
                        "extraction task cancelled".to_string()
                    },
                }),
            };
            (order, name, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => tracing::error!(error = %e, "extraction task failed"),
        }
    }
    results
}

fn build_index(
    chunks: Vec<crate::models::Chunk>,
    vectors: Vec<Vec<f32>>,
    model: &str,
    provider_dims: usize,
) -> Result<VectorIndex> {
    let index = VectorIndex::build(chunks, vectors, model)?;
    if provider_dims != 0 && index.dims() != provider_dims {
        return Err(Error::DimensionMismatch {
            expected: provider_dims,
            found: index.dims(),
        });
    }
    Ok(index)
}

async fn with_timeout<T>(
    stage: Stage,
    limit: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(|e| e.at_stage(stage)),
        Err(_) => {
            tracing::error!(stage = %stage, secs = limit.as_secs(), "stage timed out");
            Err(Error::Timeout {
                stage,
                after: limit,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::HashProvider;
    use crate::extract::ExtractorRegistry;
    use crate::store::IndexStore;
    use tempfile::TempDir;

    struct PanickingExtractor;

    impl Extractor for PanickingExtractor {
        fn name(&self) -> &str {
            "boom"
        }
        fn extensions(&self) -> &[&str] {
            &["boom"]
        }
        fn extract(&self, _source: &str, _bytes: &[u8]) -> Result<ExtractedDocument> {
            panic!("parser bug")
        }
    }

    /// Store whose writes never finish within the stage limit.
    struct StalledStore;

    #[async_trait::async_trait]
    impl IndexStore for StalledStore {
        async fn persist(&self, _index: &VectorIndex, _namespace: &Path) -> Result<()> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(())
        }
        async fn load(&self, namespace: &Path) -> Result<VectorIndex> {
            Err(Error::IndexNotFound(namespace.to_path_buf()))
        }
        fn exists(&self, _namespace: &Path) -> bool {
            false
        }
    }

    fn context(tmp: &TempDir) -> PortalContext {
        PortalContext::with_provider(Config::minimal(tmp.path()), Arc::new(HashProvider::new(64)))
    }

    #[tokio::test]
    async fn test_uploads_saved_under_fresh_names() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let outcome = ingest(
            &ctx,
            Some("s1"),
            vec![
                UploadedFile::new("notes.TXT", "first file"),
                UploadedFile::new("notes.TXT", "second file"),
            ],
        )
        .await
        .unwrap();
        assert_eq!(outcome.stats.files_ingested, 2);

        let saved: Vec<String> = std::fs::read_dir(tmp.path().join("uploads").join("s1"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(saved.len(), 2);
        for name in saved {
            assert_eq!(name.len(), "0123abcd.txt".len(), "{}", name);
            assert!(name.ends_with(".txt"));
        }
    }

    #[tokio::test]
    async fn test_extractor_panic_only_skips_that_file() {
        let tmp = TempDir::new().unwrap();
        let mut registry = ExtractorRegistry::with_builtins();
        registry.register(Arc::new(PanickingExtractor));
        let ctx = context(&tmp).with_extractors(registry);

        let outcome = ingest(
            &ctx,
            None,
            vec![
                UploadedFile::new("bad.boom", "x"),
                UploadedFile::new("good.md", "# Heading\n\nUseful body text."),
            ],
        )
        .await
        .unwrap();

        assert_eq!(outcome.stats.files_received, 2);
        assert_eq!(outcome.stats.files_ingested, 1);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].name, "bad.boom");
        assert!(matches!(
            outcome.skipped[0].error,
            Error::ExtractionFailure { .. }
        ));
        assert!(ctx
            .store()
            .exists(&ctx.sessions().index_dir(&outcome.session_id).unwrap()));
    }

    #[tokio::test]
    async fn test_invalid_chunking_fails_before_allocating() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal(tmp.path());
        config.chunking.max_chars = 10;
        config.chunking.overlap_chars = 10;
        let ctx = PortalContext::with_provider(config, Arc::new(HashProvider::new(8)));
        let err = ingest(&ctx, Some("s"), vec![UploadedFile::new("a.txt", "text")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChunkConfig(_)));
        assert!(!tmp.path().join("uploads").join("s").exists());
    }

    #[test]
    fn test_provider_dimension_is_enforced() {
        let chunks = vec![crate::index::tests::chunk(0, "a")];
        let err = build_index(chunks, vec![vec![1.0, 0.0]], "m", 3).unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch {
                expected: 3,
                found: 2
            }
        ));
    }

    #[tokio::test]
    async fn test_persist_timeout_reports_persist_stage() {
        let tmp = TempDir::new().unwrap();
        let mut config = Config::minimal(tmp.path());
        config.pipeline.stage_timeout_secs = 1;
        let ctx = PortalContext::with_provider(config, Arc::new(HashProvider::new(16)))
            .with_store(Arc::new(StalledStore));

        let err = ingest(&ctx, Some("slow"), vec![UploadedFile::new("a.txt", "some text")])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Timeout {
                stage: Stage::Persist,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_options_override_chunking_and_k() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let text = "abcdefghijklmnopqrstuvwxyz".repeat(4);
        let options = IngestOptions {
            chunk_size: Some(20),
            chunk_overlap: Some(5),
            k: Some(2),
        };
        let outcome = ingest_with(&ctx, Some("opts"), vec![UploadedFile::new("abc.txt", text)], options)
            .await
            .unwrap();
        // 104 chars in windows of 20 advancing by 15
        assert_eq!(outcome.stats.chunks, 7);
        assert_eq!(outcome.retriever.k(), 2);
        assert_eq!(outcome.retriever.query("abcdef").await.unwrap().len(), 2);

        let default = ingest(&ctx, Some("plain"), vec![UploadedFile::new("a.txt", "short")])
            .await
            .unwrap();
        assert_eq!(default.retriever.k(), ctx.config().retrieval.top_k);
    }

    #[tokio::test]
    async fn test_invalid_option_chunking_fails_before_allocating() {
        let tmp = TempDir::new().unwrap();
        let ctx = context(&tmp);
        let options = IngestOptions {
            chunk_size: Some(8),
            chunk_overlap: Some(8),
            k: None,
        };
        let err = ingest_with(&ctx, Some("bad"), vec![UploadedFile::new("a.txt", "text")], options)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidChunkConfig(_)));
        assert!(!tmp.path().join("uploads").join("bad").exists());
    }

    #[tokio::test]
    async fn test_save_upload_never_overwrites() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("taken.txt"), "original").unwrap();
        let mut names = vec!["fresh.txt", "taken.txt"];
        let saved = save_upload(tmp.path(), b"new upload", || names.pop().unwrap().to_string())
            .await
            .unwrap();
        assert_eq!(saved, tmp.path().join("fresh.txt"));
        assert_eq!(std::fs::read_to_string(tmp.path().join("taken.txt")).unwrap(), "original");
        assert_eq!(std::fs::read_to_string(&saved).unwrap(), "new upload");
    }
}
