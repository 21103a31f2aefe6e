//! Persistence for [`VectorIndex`]es.
//!
//! [`SqliteIndexStore`] writes each session's index as a single SQLite file,
//! `index.sqlite`, inside the session's index namespace:
//!
//! | Table | Contents |
//! |-------|----------|
//! | `index_meta` | format version, dims, model, created_at, chunk_count |
//! | `entries` | one row per chunk: chunk fields plus the vector as a little-endian `f32` BLOB |
//!
//! Publishing is atomic: the whole file is written under a unique temporary
//! name in the same directory and then renamed over `index.sqlite`. A reader
//! loading concurrently sees either the previous index or the new one, never
//! a partial write. Concurrent writers for the same namespace are not
//! coordinated; the last rename wins.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{ConnectOptions, Connection, Row};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::index::{blob_to_vec, vec_to_blob, IndexEntry, VectorIndex};
use crate::models::Chunk;

/// File name of the published index inside a namespace.
pub const INDEX_FILE: &str = "index.sqlite";

const FORMAT_VERSION: i64 = 1;

/// Writes and reads whole indexes under a namespace directory.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Replace the namespace's index with `index`.
    async fn persist(&self, index: &VectorIndex, namespace: &Path) -> Result<()>;

    /// Load the namespace's index, failing with [`Error::IndexNotFound`]
    /// when none has been published.
    async fn load(&self, namespace: &Path) -> Result<VectorIndex>;

    /// True when an index has been published under `namespace`.
    fn exists(&self, namespace: &Path) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SqliteIndexStore;

impl SqliteIndexStore {
    pub fn new() -> Self {
        Self
    }

    pub fn index_path(namespace: &Path) -> PathBuf {
        namespace.join(INDEX_FILE)
    }
}

fn storage_error(path: &Path, source: std::io::Error) -> Error {
    Error::StorageUnavailable {
        path: path.to_path_buf(),
        source,
    }
}

#[async_trait]
impl IndexStore for SqliteIndexStore {
    async fn persist(&self, index: &VectorIndex, namespace: &Path) -> Result<()> {
        tokio::fs::create_dir_all(namespace)
            .await
            .map_err(|e| storage_error(namespace, e))?;

        let staging = StagingFile::new(
            namespace.join(format!(".{}.{}.tmp", INDEX_FILE, Uuid::new_v4().simple())),
        );
        // Created here, with no await in between, so a connection opened after
        // cancellation finds no file instead of recreating one.
        std::fs::File::create(staging.path()).map_err(|e| storage_error(staging.path(), e))?;
        write_index(staging.path(), index).await?;

        let published = Self::index_path(namespace);
        tokio::fs::rename(staging.path(), &published)
            .await
            .map_err(|e| storage_error(&published, e))?;
        staging.published();

        tracing::debug!(
            path = %published.display(),
            chunks = index.len(),
            "index published"
        );
        Ok(())
    }

    async fn load(&self, namespace: &Path) -> Result<VectorIndex> {
        let path = Self::index_path(namespace);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Err(Error::IndexNotFound(namespace.to_path_buf()));
        }
        read_index(&path).await
    }

    fn exists(&self, namespace: &Path) -> bool {
        Self::index_path(namespace).is_file()
    }
}

/// Unpublished index file. Dropping it removes the file and its rollback
/// journal, including when the persisting future is cancelled mid-write.
struct StagingFile {
    path: PathBuf,
    armed: bool,
}

impl StagingFile {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    /// The file was renamed into place; nothing is left to clean up.
    fn published(mut self) {
        self.armed = false;
    }
}

impl Drop for StagingFile {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut journal = self.path.clone().into_os_string();
        journal.push("-journal");
        for leftover in [self.path.as_path(), Path::new(&journal)] {
            match std::fs::remove_file(leftover) {
                Ok(()) => tracing::debug!(path = %leftover.display(), "removed staging file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => tracing::warn!(
                    path = %leftover.display(),
                    error = %e,
                    "could not remove staging file"
                ),
            }
        }
    }
}

async fn write_index(path: &Path, index: &VectorIndex) -> Result<()> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .journal_mode(SqliteJournalMode::Delete)
        .synchronous(SqliteSynchronous::Full);
    let mut conn = options.connect().await?;

    sqlx::query(
        r#"
        CREATE TABLE index_meta (
            format_version INTEGER NOT NULL,
            dims INTEGER NOT NULL,
            model TEXT NOT NULL,
            created_at TEXT NOT NULL,
            chunk_count INTEGER NOT NULL
        )
        "#,
    )
    .execute(&mut conn)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE entries (
            ordinal INTEGER PRIMARY KEY,
            source TEXT NOT NULL,
            position INTEGER NOT NULL,
            chunk_index INTEGER NOT NULL,
            char_start INTEGER NOT NULL,
            char_end INTEGER NOT NULL,
            overlap INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            vector BLOB NOT NULL
        )
        "#,
    )
    .execute(&mut conn)
    .await?;

    let mut tx = conn.begin().await?;

    sqlx::query(
        "INSERT INTO index_meta (format_version, dims, model, created_at, chunk_count) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(FORMAT_VERSION)
    .bind(index.dims() as i64)
    .bind(index.model())
    .bind(index.created_at().to_rfc3339_opts(SecondsFormat::Nanos, true))
    .bind(index.len() as i64)
    .execute(&mut *tx)
    .await?;

    for (ordinal, entry) in index.entries().iter().enumerate() {
        let chunk = &entry.chunk;
        sqlx::query(
            r#"
            INSERT INTO entries (ordinal, source, position, chunk_index, char_start, char_end, overlap, text, hash, vector)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(ordinal as i64)
        .bind(&chunk.source)
        .bind(chunk.position as i64)
        .bind(chunk.chunk_index)
        .bind(chunk.char_start)
        .bind(chunk.char_end)
        .bind(chunk.overlap)
        .bind(&chunk.text)
        .bind(&chunk.hash)
        .bind(vec_to_blob(&entry.vector))
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    conn.close().await?;
    Ok(())
}

async fn read_index(path: &Path) -> Result<VectorIndex> {
    let options = SqliteConnectOptions::new().filename(path).read_only(true);
    let mut conn = options.connect().await?;

    let meta = sqlx::query(
        "SELECT format_version, dims, model, created_at, chunk_count FROM index_meta LIMIT 1",
    )
    .fetch_optional(&mut conn)
    .await?
    .ok_or_else(|| Error::Index(format!("{} has no metadata row", path.display())))?;

    let version: i64 = meta.try_get("format_version")?;
    if version != FORMAT_VERSION {
        return Err(Error::Index(format!(
            "unsupported index format version {} (expected {})",
            version, FORMAT_VERSION
        )));
    }
    let dims = meta.try_get::<i64, _>("dims")? as usize;
    let model: String = meta.try_get("model")?;
    let created_at: String = meta.try_get("created_at")?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map_err(|e| Error::Index(format!("bad created_at '{}': {}", created_at, e)))?
        .with_timezone(&Utc);
    let chunk_count: i64 = meta.try_get("chunk_count")?;

    let rows = sqlx::query(
        "SELECT ordinal, source, position, chunk_index, char_start, char_end, overlap, text, hash, vector FROM entries ORDER BY ordinal",
    )
    .fetch_all(&mut conn)
    .await?;
    conn.close().await?;

    if rows.len() as i64 != chunk_count {
        return Err(Error::Index(format!(
            "index declares {} chunks but holds {}",
            chunk_count,
            rows.len()
        )));
    }

    let mut entries = Vec::with_capacity(rows.len());
    for row in rows {
        let blob: Vec<u8> = row.try_get("vector")?;
        let vector = blob_to_vec(&blob);
        if vector.len() != dims {
            return Err(Error::DimensionMismatch {
                expected: dims,
                found: vector.len(),
            });
        }
        entries.push(IndexEntry {
            chunk: Chunk {
                ordinal: row.try_get("ordinal")?,
                source: row.try_get("source")?,
                position: row.try_get::<i64, _>("position")? as u32,
                chunk_index: row.try_get("chunk_index")?,
                char_start: row.try_get("char_start")?,
                char_end: row.try_get("char_end")?,
                overlap: row.try_get("overlap")?,
                text: row.try_get("text")?,
                hash: row.try_get("hash")?,
            },
            vector,
        });
    }

    Ok(VectorIndex::from_parts(dims, model, created_at, entries))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::tests::chunk;
    use tempfile::TempDir;

    fn sample() -> VectorIndex {
        VectorIndex::build(
            vec![chunk(0, "alpha"), chunk(1, "beta"), chunk(2, "gamma")],
            vec![vec![1.0, 0.0, 0.5], vec![0.0, 1.0, -0.25], vec![0.3, 0.3, 0.3]],
            "unit-test",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_persist_then_load_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteIndexStore::new();
        let index = sample();
        store.persist(&index, tmp.path()).await.unwrap();

        let loaded = store.load(tmp.path()).await.unwrap();
        assert_eq!(loaded, index);

        let q = [0.9, 0.1, 0.4];
        let before: Vec<(i64, f32)> = index
            .query(&q, 3)
            .unwrap()
            .into_iter()
            .map(|r| (r.chunk.ordinal, r.score))
            .collect();
        let after: Vec<(i64, f32)> = loaded
            .query(&q, 3)
            .unwrap()
            .into_iter()
            .map(|r| (r.chunk.ordinal, r.score))
            .collect();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_load_missing_index_fails() {
        let tmp = TempDir::new().unwrap();
        let err = SqliteIndexStore::new().load(tmp.path()).await.unwrap_err();
        assert!(matches!(err, Error::IndexNotFound(_)));
        assert!(!SqliteIndexStore::new().exists(tmp.path()));
    }

    #[tokio::test]
    async fn test_persist_replaces_and_leaves_no_staging_files() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteIndexStore::new();
        store.persist(&sample(), tmp.path()).await.unwrap();

        let smaller =
            VectorIndex::build(vec![chunk(0, "only")], vec![vec![1.0, 2.0]], "unit-test").unwrap();
        store.persist(&smaller, tmp.path()).await.unwrap();

        let loaded = store.load(tmp.path()).await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded.dims(), 2);

        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, [INDEX_FILE]);
    }

    #[tokio::test]
    async fn test_persist_into_unwritable_location_is_storage_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, b"file").unwrap();
        let err = SqliteIndexStore::new()
            .persist(&sample(), &blocker.join("ns"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable { .. }));
    }

    fn staging_leftovers(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .filter(|name| name.contains(".tmp"))
            .collect()
    }

    #[test]
    fn test_staging_file_removed_unless_published() {
        let tmp = TempDir::new().unwrap();
        let abandoned = tmp.path().join(".index.sqlite.a.tmp");
        std::fs::write(&abandoned, b"partial").unwrap();
        std::fs::write(tmp.path().join(".index.sqlite.a.tmp-journal"), b"j").unwrap();
        drop(StagingFile::new(abandoned.clone()));
        assert!(staging_leftovers(tmp.path()).is_empty());

        let kept = tmp.path().join("kept.sqlite");
        std::fs::write(&kept, b"done").unwrap();
        StagingFile::new(kept.clone()).published();
        assert!(kept.exists());
    }

    #[tokio::test]
    async fn test_cancelled_persist_leaves_no_staging_file() {
        let tmp = TempDir::new().unwrap();
        let store = SqliteIndexStore::new();
        let count = 3000;
        let chunks = (0..count).map(|i| chunk(i, "some chunk text")).collect();
        let vectors = (0..count).map(|i| vec![i as f32, 1.0, 0.5, -1.0]).collect();
        let index = VectorIndex::build(chunks, vectors, "unit-test").unwrap();

        let mut cancelled = 0;
        for micros in [200u64, 1_000, 3_000, 10_000, 30_000] {
            let limit = std::time::Duration::from_micros(micros);
            if tokio::time::timeout(limit, store.persist(&index, tmp.path()))
                .await
                .is_err()
            {
                cancelled += 1;
            }
        }
        // let the sqlite worker finish closing the dropped connection
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;

        assert!(cancelled > 0);
        assert!(
            staging_leftovers(tmp.path()).is_empty(),
            "{:?}",
            staging_leftovers(tmp.path())
        );
    }
}
