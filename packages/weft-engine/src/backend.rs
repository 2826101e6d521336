//! The persistence seam and the built-in backends.
//!
//! The engine treats the backend as a key/value store for one state blob per
//! stack plus an optional advisory lock and an optional append-only audit
//! log. The optional operations default to granting/no-op implementations,
//! so an embedder only implements what its store supports.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::BackendError;
use crate::state::{now_millis, AuditEntry, DeploymentState};

/// A deployment state store. Implemented by the embedder; two reference
/// implementations ship with the engine.
#[async_trait(?Send)]
pub trait Backend {
    /// The last saved state blob for the stack, or `None`.
    async fn get_state(&self, stack: &str) -> Result<Option<DeploymentState>, BackendError>;

    /// Replace the state blob for the stack. Must be atomic against
    /// concurrent readers.
    async fn save_state(&self, stack: &str, state: &DeploymentState) -> Result<(), BackendError>;

    /// Try to take the advisory lock. A backend without locking grants
    /// every request.
    async fn acquire_lock(
        &self,
        _stack: &str,
        _holder: &str,
        _ttl: Duration,
    ) -> Result<bool, BackendError> {
        Ok(true)
    }

    /// Release the advisory lock.
    async fn release_lock(&self, _stack: &str) -> Result<(), BackendError> {
        Ok(())
    }

    /// Append one audit entry. A backend without an audit log drops it.
    async fn append_audit(&self, _stack: &str, _entry: &AuditEntry) -> Result<(), BackendError> {
        Ok(())
    }

    /// Read back the newest audit entries, oldest first.
    async fn audit_log(
        &self,
        _stack: &str,
        _limit: Option<usize>,
    ) -> Result<Vec<AuditEntry>, BackendError> {
        Ok(Vec::new())
    }
}

#[derive(Default)]
struct MemoryLock {
    holder: String,
    expires_at: i64,
}

/// In-memory backend for tests and examples. Supports locking and the audit
/// log.
#[derive(Default)]
pub struct MemoryBackend {
    states: RefCell<HashMap<String, DeploymentState>>,
    locks: RefCell<HashMap<String, MemoryLock>>,
    audit: RefCell<HashMap<String, Vec<AuditEntry>>>,
}

impl MemoryBackend {
    /// A fresh, empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a state blob, bypassing the async interface. Used by tests to
    /// simulate a store left behind by a previous process.
    pub fn seed(&self, state: DeploymentState) {
        self.states.borrow_mut().insert(state.stack_name.clone(), state);
    }

    /// Direct synchronous read, for assertions.
    pub fn peek(&self, stack: &str) -> Option<DeploymentState> {
        self.states.borrow().get(stack).cloned()
    }
}

#[async_trait(?Send)]
impl Backend for MemoryBackend {
    async fn get_state(&self, stack: &str) -> Result<Option<DeploymentState>, BackendError> {
        Ok(self.states.borrow().get(stack).cloned())
    }

    async fn save_state(&self, stack: &str, state: &DeploymentState) -> Result<(), BackendError> {
        self.states.borrow_mut().insert(stack.to_string(), state.clone());
        Ok(())
    }

    async fn acquire_lock(
        &self,
        stack: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let now = now_millis();
        let mut locks = self.locks.borrow_mut();
        match locks.get(stack) {
            Some(lock) if lock.expires_at > now && lock.holder != holder => Ok(false),
            _ => {
                locks.insert(
                    stack.to_string(),
                    MemoryLock {
                        holder: holder.to_string(),
                        expires_at: now + ttl.as_millis() as i64,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release_lock(&self, stack: &str) -> Result<(), BackendError> {
        self.locks.borrow_mut().remove(stack);
        Ok(())
    }

    async fn append_audit(&self, stack: &str, entry: &AuditEntry) -> Result<(), BackendError> {
        self.audit
            .borrow_mut()
            .entry(stack.to_string())
            .or_default()
            .push(entry.clone());
        Ok(())
    }

    async fn audit_log(
        &self,
        stack: &str,
        limit: Option<usize>,
    ) -> Result<Vec<AuditEntry>, BackendError> {
        let audit = self.audit.borrow();
        let entries = audit.get(stack).cloned().unwrap_or_default();
        Ok(match limit {
            Some(limit) if entries.len() > limit => {
                entries[entries.len() - limit..].to_vec()
            }
            _ => entries,
        })
    }
}

/// File backend: one directory per store, one JSON state file and one
/// JSON-lines audit file per stack. Saves replace the state file atomically
/// through a temp file and rename.
pub struct JsonFileBackend {
    dir: PathBuf,
}

impl JsonFileBackend {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, BackendError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn state_path(&self, stack: &str) -> PathBuf {
        self.dir.join(format!("{stack}.json"))
    }

    fn lock_path(&self, stack: &str) -> PathBuf {
        self.dir.join(format!("{stack}.lock"))
    }

    fn audit_path(&self, stack: &str) -> PathBuf {
        self.dir.join(format!("{stack}.audit.jsonl"))
    }
}

#[derive(serde::Serialize, serde::Deserialize)]
struct FileLock {
    holder: String,
    expires_at: i64,
}

#[async_trait(?Send)]
impl Backend for JsonFileBackend {
    async fn get_state(&self, stack: &str) -> Result<Option<DeploymentState>, BackendError> {
        let path = self.state_path(stack);
        if !path.exists() {
            return Ok(None);
        }
        let raw = std::fs::read_to_string(&path)?;
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| BackendError::Corrupt {
                stack: stack.to_string(),
                message: err.to_string(),
            })
    }

    async fn save_state(&self, stack: &str, state: &DeploymentState) -> Result<(), BackendError> {
        let raw = serde_json::to_vec_pretty(state)
            .map_err(|err| BackendError::Other(err.to_string()))?;
        let tmp = self.dir.join(format!(".{stack}.json.tmp"));
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&raw)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, self.state_path(stack))?;
        Ok(())
    }

    async fn acquire_lock(
        &self,
        stack: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, BackendError> {
        let path = self.lock_path(stack);
        let now = now_millis();
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Ok(lock) = serde_json::from_str::<FileLock>(&raw) {
                if lock.expires_at > now && lock.holder != holder {
                    return Ok(false);
                }
            }
        }
        let lock = FileLock {
            holder: holder.to_string(),
            expires_at: now + ttl.as_millis() as i64,
        };
        std::fs::write(
            &path,
            serde_json::to_vec(&lock).map_err(|err| BackendError::Other(err.to_string()))?,
        )?;
        Ok(true)
    }

    async fn release_lock(&self, stack: &str) -> Result<(), BackendError> {
        let path = self.lock_path(stack);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }

    async fn append_audit(&self, stack: &str, entry: &AuditEntry) -> Result<(), BackendError> {
        let mut line =
            serde_json::to_vec(entry).map_err(|err| BackendError::Other(err.to_string()))?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.audit_path(stack))?;
        file.write_all(&line)?;
        Ok(())
    }

    async fn audit_log(
        &self,
        stack: &str,
        limit: Option<usize>,
    ) -> Result<Vec<AuditEntry>, BackendError> {
        let path = self.audit_path(stack);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(path)?;
        let mut entries = Vec::new();
        for line in raw.lines().filter(|line| !line.trim().is_empty()) {
            entries.push(
                serde_json::from_str(line).map_err(|err| BackendError::Corrupt {
                    stack: stack.to_string(),
                    message: err.to_string(),
                })?,
            );
        }
        if let Some(limit) = limit {
            if entries.len() > limit {
                entries.drain(..entries.len() - limit);
            }
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{AuditAction, DeploymentStatus};

    fn sample(stack: &str) -> DeploymentState {
        DeploymentState {
            stack_name: stack.to_string(),
            nodes: Vec::new(),
            status: DeploymentStatus::Deployed,
            applying_node_ids: Vec::new(),
            last_deployed_at: 1,
            user: None,
        }
    }

    #[tokio::test]
    async fn memory_backend_round_trip() {
        let backend = MemoryBackend::new();
        assert!(backend.get_state("s").await.unwrap().is_none());
        backend.save_state("s", &sample("s")).await.unwrap();
        assert_eq!(backend.get_state("s").await.unwrap().unwrap().stack_name, "s");
    }

    #[tokio::test]
    async fn memory_lock_denies_other_holders() {
        let backend = MemoryBackend::new();
        let ttl = Duration::from_secs(60);
        assert!(backend.acquire_lock("s", "a", ttl).await.unwrap());
        assert!(!backend.acquire_lock("s", "b", ttl).await.unwrap());
        // Re-entrant for the same holder.
        assert!(backend.acquire_lock("s", "a", ttl).await.unwrap());
        backend.release_lock("s").await.unwrap();
        assert!(backend.acquire_lock("s", "b", ttl).await.unwrap());
    }

    #[tokio::test]
    async fn file_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path()).unwrap();
        assert!(backend.get_state("s").await.unwrap().is_none());
        backend.save_state("s", &sample("s")).await.unwrap();
        let loaded = backend.get_state("s").await.unwrap().unwrap();
        assert_eq!(loaded, sample("s"));
    }

    #[tokio::test]
    async fn file_backend_audit_appends() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path()).unwrap();
        for action in [AuditAction::DeployStart, AuditAction::DeployComplete] {
            backend
                .append_audit(
                    "s",
                    &AuditEntry {
                        timestamp: 1,
                        action,
                        node_id: None,
                        user: None,
                        details: None,
                    },
                )
                .await
                .unwrap();
        }
        let all = backend.audit_log("s", None).await.unwrap();
        assert_eq!(all.len(), 2);
        let last = backend.audit_log("s", Some(1)).await.unwrap();
        assert_eq!(last[0].action, AuditAction::DeployComplete);
    }

    #[tokio::test]
    async fn corrupt_state_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonFileBackend::new(dir.path()).unwrap();
        std::fs::write(dir.path().join("s.json"), b"not json").unwrap();
        let err = backend.get_state("s").await.unwrap_err();
        assert!(matches!(err, BackendError::Corrupt { .. }));
    }
}
