//! Session namespaces.
//!
//! A session owns two directories keyed by its identifier:
//!
//! ```text
//! <temp_root>/<session_id>/               uploaded file copies
//! <index_root>/<session_id>/index.sqlite  persisted vector index
//! ```
//!
//! Allocation is idempotent: allocating an existing identifier reuses its
//! directories and never removes anything. Identifiers supplied by clients
//! must be a single path component of `[A-Za-z0-9_.-]`, so one session can
//! never reach into another session's namespace or outside the base roots.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::store::INDEX_FILE;

const MAX_SESSION_ID_LEN: usize = 128;

/// A directory that [`NamespaceProvisioner::ensure`] guarantees exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathHandle {
    pub path: PathBuf,
    /// False when the directory was already present.
    pub created: bool,
}

/// Creates namespace directories on behalf of the session manager.
pub trait NamespaceProvisioner: Send + Sync {
    fn ensure(&self, path: &Path) -> Result<PathHandle>;
}

/// Provisions namespaces on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsProvisioner;

impl NamespaceProvisioner for FsProvisioner {
    fn ensure(&self, path: &Path) -> Result<PathHandle> {
        let existed = path.is_dir();
        std::fs::create_dir_all(path).map_err(|source| Error::StorageUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(PathHandle {
            path: path.to_path_buf(),
            created: !existed,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub temp_dir: PathBuf,
    pub index_dir: PathBuf,
}

/// Allocates session namespaces under the configured base roots.
#[derive(Clone)]
pub struct SessionManager {
    temp_root: PathBuf,
    index_root: PathBuf,
    provisioner: Arc<dyn NamespaceProvisioner>,
}

impl SessionManager {
    pub fn new(temp_root: impl Into<PathBuf>, index_root: impl Into<PathBuf>) -> Self {
        Self::with_provisioner(temp_root, index_root, Arc::new(FsProvisioner))
    }

    pub fn with_provisioner(
        temp_root: impl Into<PathBuf>,
        index_root: impl Into<PathBuf>,
        provisioner: Arc<dyn NamespaceProvisioner>,
    ) -> Self {
        Self {
            temp_root: temp_root.into(),
            index_root: index_root.into(),
            provisioner,
        }
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn index_root(&self) -> &Path {
        &self.index_root
    }

    /// Index namespace for `session_id`, without creating it.
    pub fn index_dir(&self, session_id: &str) -> Result<PathBuf> {
        validate_session_id(session_id)?;
        Ok(self.index_root.join(session_id))
    }

    /// Allocate (or re-open) a session, creating both namespaces.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidSessionId`] for an unusable identifier,
    /// [`Error::StorageUnavailable`] when a directory cannot be created.
    pub fn allocate(&self, session_id: Option<&str>) -> Result<Session> {
        let id = match session_id {
            Some(id) => {
                validate_session_id(id)?;
                id.to_string()
            }
            None => generate_session_id(),
        };

        let temp = self.provisioner.ensure(&self.temp_root.join(&id))?;
        let index = self.provisioner.ensure(&self.index_root.join(&id))?;
        tracing::debug!(
            session_id = %id,
            created = temp.created || index.created,
            "session allocated"
        );

        Ok(Session {
            id,
            temp_dir: temp.path,
            index_dir: index.path,
        })
    }

    /// Identifiers of sessions that have a published index, sorted.
    pub fn list(&self) -> Result<Vec<String>> {
        let entries = match std::fs::read_dir(&self.index_root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(Error::StorageUnavailable {
                    path: self.index_root.clone(),
                    source,
                })
            }
        };

        let mut ids: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().join(INDEX_FILE).is_file())
            .filter_map(|entry| entry.file_name().to_str().map(str::to_string))
            .filter(|id| validate_session_id(id).is_ok())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// `session_<UTC yyyymmdd_HHMMSS>_<8 hex chars>`.
pub fn generate_session_id() -> String {
    let suffix = Uuid::new_v4();
    format!(
        "session_{}_{}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        hex::encode(&suffix.as_bytes()[..4])
    )
}

pub fn validate_session_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= MAX_SESSION_ID_LEN
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(Error::InvalidSessionId(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> SessionManager {
        SessionManager::new(tmp.path().join("uploads"), tmp.path().join("index"))
    }

    #[test]
    fn test_generated_id_format() {
        let id = generate_session_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 4, "{}", id);
        assert_eq!(parts[0], "session");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 8);
        assert!(parts[3].chars().all(|c| c.is_ascii_hexdigit()));
        assert!(validate_session_id(&id).is_ok());
    }

    #[test]
    fn test_allocate_creates_both_namespaces() {
        let tmp = TempDir::new().unwrap();
        let session = manager(&tmp).allocate(None).unwrap();
        assert!(session.temp_dir.is_dir());
        assert!(session.index_dir.is_dir());
        assert!(session.temp_dir.ends_with(&session.id));
        assert!(session.index_dir.starts_with(tmp.path().join("index")));
    }

    #[test]
    fn test_allocate_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let sessions = manager(&tmp);
        let first = sessions.allocate(Some("demo")).unwrap();
        std::fs::write(first.temp_dir.join("keep.txt"), "data").unwrap();

        let second = sessions.allocate(Some("demo")).unwrap();
        assert_eq!(first, second);
        assert!(second.temp_dir.join("keep.txt").exists());
    }

    #[test]
    fn test_invalid_ids_rejected_before_touching_storage() {
        let tmp = TempDir::new().unwrap();
        let sessions = manager(&tmp);
        for bad in ["", "..", "../escape", "a/b", ".hidden", "white space"] {
            let err = sessions.allocate(Some(bad)).unwrap_err();
            assert!(matches!(err, Error::InvalidSessionId(_)), "{:?}", bad);
        }
        assert!(!tmp.path().join("uploads").exists());
    }

    struct FailingProvisioner;

    impl NamespaceProvisioner for FailingProvisioner {
        fn ensure(&self, path: &Path) -> Result<PathHandle> {
            Err(Error::StorageUnavailable {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            })
        }
    }

    #[test]
    fn test_provisioner_failure_is_storage_unavailable() {
        let sessions =
            SessionManager::with_provisioner("/nowhere/u", "/nowhere/i", Arc::new(FailingProvisioner));
        let err = sessions.allocate(Some("s1")).unwrap_err();
        assert!(matches!(err, Error::StorageUnavailable { .. }));
    }

    #[test]
    fn test_list_only_reports_indexed_sessions() {
        let tmp = TempDir::new().unwrap();
        let sessions = manager(&tmp);
        assert!(sessions.list().unwrap().is_empty());

        let b = sessions.allocate(Some("b-session")).unwrap();
        let a = sessions.allocate(Some("a-session")).unwrap();
        sessions.allocate(Some("empty")).unwrap();
        std::fs::write(b.index_dir.join(INDEX_FILE), b"").unwrap();
        std::fs::write(a.index_dir.join(INDEX_FILE), b"").unwrap();

        assert_eq!(sessions.list().unwrap(), ["a-session", "b-session"]);
    }
}
