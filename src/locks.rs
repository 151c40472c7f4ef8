//! # Workspace lock manager
//!
//! Single-writer access to per-workspace working directories. Two reconciles
//! of the same resource can overlap (a spec edit racing the poll trigger);
//! whichever acquires the lock first runs, the other sees [`WorkspaceError::Busy`]
//! and is requeued.
//!
//! ## Stranded locks
//!
//! A terraform run that is hard-killed on timeout may leave the working
//! directory in an unknown state. The lock is deliberately NOT auto-released
//! in that case: the reconciler calls [`WorkspaceGuard::strand`] and every
//! subsequent acquire returns Busy until an operator clears the lock with
//! [`WorkspaceLockManager::clear_stranded`]. Silently recovering here would
//! mask concurrent runs against possibly-corrupt state, so we do not.

use crate::error::WorkspaceError;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use tracing::warn;

#[derive(Debug, Default)]
struct LockTable {
    held: HashSet<String>,
    stranded: HashSet<String>,
}

/// In-process lock registry keyed by workspace external name.
///
/// The orchestrating scheduler guarantees at most one active task per
/// resource identity, and distinct resources use distinct external names, so
/// single-process locking is all the coordination required.
#[derive(Debug, Default)]
pub struct WorkspaceLockManager {
    table: Mutex<LockTable>,
}

impl WorkspaceLockManager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Acquire the lock for `name`, or fail with Busy if it is held or
    /// stranded. Exactly one guard may be outstanding per name.
    pub fn acquire(self: &Arc<Self>, name: &str) -> Result<WorkspaceGuard, WorkspaceError> {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        if table.stranded.contains(name) {
            warn!(
                workspace = name,
                "lock is stranded by a killed run and must be cleared manually"
            );
            return Err(WorkspaceError::Busy(name.to_string()));
        }
        if !table.held.insert(name.to_string()) {
            return Err(WorkspaceError::Busy(name.to_string()));
        }
        Ok(WorkspaceGuard {
            manager: Arc::clone(self),
            name: name.to_string(),
            strand_on_release: false,
        })
    }

    /// Operator escape hatch for a lock stranded by a killed run. Returns
    /// whether a stranded entry was actually cleared.
    pub fn clear_stranded(&self, name: &str) -> bool {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.stranded.remove(name)
    }

    fn release(&self, name: &str, strand: bool) {
        let mut table = self.table.lock().unwrap_or_else(|e| e.into_inner());
        table.held.remove(name);
        if strand {
            table.stranded.insert(name.to_string());
        }
    }
}

/// Holds the single-writer lock for one workspace. Released automatically on
/// drop on all normal exit paths.
#[derive(Debug)]
pub struct WorkspaceGuard {
    manager: Arc<WorkspaceLockManager>,
    name: String,
    strand_on_release: bool,
}

impl WorkspaceGuard {
    /// Mark the lock stranded instead of releasing it. Called after a run
    /// was hard-killed; the directory state is unknown.
    pub fn strand(mut self) {
        self.strand_on_release = true;
    }
}

impl Drop for WorkspaceGuard {
    fn drop(&mut self) {
        self.manager.release(&self.name, self.strand_on_release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concurrent_acquires_exactly_one_succeeds() {
        let locks = WorkspaceLockManager::new();
        let guard = locks.acquire("ws-a").expect("first acquire succeeds");
        match locks.acquire("ws-a") {
            Err(WorkspaceError::Busy(name)) => assert_eq!(name, "ws-a"),
            other => panic!("expected Busy, got {other:?}"),
        }
        drop(guard);
        locks
            .acquire("ws-a")
            .expect("acquire succeeds after release");
    }

    #[test]
    fn distinct_workspaces_do_not_contend() {
        let locks = WorkspaceLockManager::new();
        let _a = locks.acquire("ws-a").expect("ws-a acquires");
        let _b = locks.acquire("ws-b").expect("ws-b acquires independently");
    }

    #[test]
    fn stranded_lock_stays_busy_until_cleared() {
        let locks = WorkspaceLockManager::new();
        let guard = locks.acquire("ws-a").expect("acquire");
        guard.strand();

        // Still busy after the guard is gone.
        assert!(matches!(
            locks.acquire("ws-a"),
            Err(WorkspaceError::Busy(_))
        ));

        assert!(locks.clear_stranded("ws-a"));
        locks.acquire("ws-a").expect("acquire after manual clear");
        assert!(!locks.clear_stranded("ws-a"));
    }

    #[test]
    fn guard_releases_on_error_paths() {
        let locks = WorkspaceLockManager::new();
        let attempt = || -> Result<(), WorkspaceError> {
            let _guard = locks.acquire("ws-a")?;
            Err(WorkspaceError::Apply {
                code: 1,
                stderr: "boom".to_string(),
            })
        };
        assert!(attempt().is_err());
        locks
            .acquire("ws-a")
            .expect("lock released when the reconcile errored");
    }
}
