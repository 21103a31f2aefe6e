//! Query service: answer a question against a session's persisted index.

use std::sync::Arc;

use tracing::Instrument;

use crate::context::PortalContext;
use crate::error::{Error, Result};
use crate::models::ScoredChunk;
use crate::retriever::Retriever;

/// Load the persisted index for `session_id` and wrap it in a retriever
/// bound to `k` (or the configured `retrieval.top_k`).
///
/// # Errors
///
/// [`Error::InvalidSessionId`](crate::error::Error::InvalidSessionId) for a
/// malformed identifier and
/// [`Error::IndexNotFound`](crate::error::Error::IndexNotFound) when the
/// session has never been ingested.
/// [`Error::ModelMismatch`](crate::error::Error::ModelMismatch) when the
/// index was embedded by a different model than the configured provider.
pub async fn open_retriever(
    ctx: &PortalContext,
    session_id: &str,
    k: Option<usize>,
) -> Result<Retriever> {
    let namespace = ctx.sessions().index_dir(session_id)?;
    let index = ctx.store().load(&namespace).await?;
    let provider_model = ctx.provider().model_name();
    if index.model() != provider_model {
        return Err(Error::ModelMismatch {
            index: index.model().to_string(),
            provider: provider_model.to_string(),
        });
    }
    Ok(Retriever::new(
        session_id,
        Arc::new(index),
        ctx.provider().clone(),
        k.unwrap_or(ctx.config().retrieval.top_k),
    ))
}

/// Return the chunks most similar to `question`, best first.
pub async fn query(
    ctx: &PortalContext,
    session_id: &str,
    question: &str,
    k: Option<usize>,
) -> Result<Vec<ScoredChunk>> {
    let span = tracing::info_span!(parent: ctx.span(), "query", session_id = %session_id);
    async {
        let retriever = open_retriever(ctx, session_id, k).await?;
        let results = retriever.query(question).await?;
        tracing::debug!(results = results.len(), k = retriever.k(), "query answered");
        Ok::<_, Error>(results)
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::embedding::{EmbeddingProvider, HashProvider};
    use crate::ingest::ingest;
    use crate::models::UploadedFile;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_unknown_session_is_index_not_found() {
        let tmp = TempDir::new().unwrap();
        let ctx =
            PortalContext::with_provider(Config::minimal(tmp.path()), Arc::new(HashProvider::new(32)));
        let err = query(&ctx, "never-ingested", "anything", None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::IndexNotFound(_)));

        let err = query(&ctx, "../etc", "anything", None).await.unwrap_err();
        assert!(matches!(err, Error::InvalidSessionId(_)));
    }

    #[tokio::test]
    async fn test_query_after_ingest_uses_persisted_index() {
        let tmp = TempDir::new().unwrap();
        let ctx =
            PortalContext::with_provider(Config::minimal(tmp.path()), Arc::new(HashProvider::new(128)));
        let outcome = ingest(
            &ctx,
            Some("q1"),
            vec![
                UploadedFile::new("garden.txt", "tomatoes need full sun and regular watering"),
                UploadedFile::new("car.txt", "change the engine oil every ten thousand miles"),
            ],
        )
        .await
        .unwrap();

        let results = query(&ctx, &outcome.session_id, "engine oil", Some(1))
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk.source, "car.txt");

        let in_memory = outcome.retriever.query("engine oil").await.unwrap();
        assert_eq!(in_memory[0].chunk, results[0].chunk);
    }

    struct RenamedProvider(HashProvider);

    #[async_trait::async_trait]
    impl EmbeddingProvider for RenamedProvider {
        fn model_name(&self) -> &str {
            "other-model"
        }
        fn dims(&self) -> usize {
            self.0.dims()
        }
        async fn embed(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            self.0.embed(texts).await
        }
    }

    #[tokio::test]
    async fn test_index_from_another_model_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let ctx =
            PortalContext::with_provider(Config::minimal(tmp.path()), Arc::new(HashProvider::new(64)));
        ingest(&ctx, Some("m1"), vec![UploadedFile::new("a.txt", "alpha beta gamma")])
            .await
            .unwrap();

        let switched = PortalContext::with_provider(
            Config::minimal(tmp.path()),
            Arc::new(RenamedProvider(HashProvider::new(64))),
        );
        let err = query(&switched, "m1", "alpha", None).await.unwrap_err();
        match err {
            Error::ModelMismatch { index, provider } => {
                assert_eq!(index, "feature-hash");
                assert_eq!(provider, "other-model");
            }
            other => panic!("unexpected error: {}", other),
        }
    }
}
