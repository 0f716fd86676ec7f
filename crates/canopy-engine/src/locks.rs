//! Per-scope mutual exclusion.
//!
//! Placement decisions under one anchor, and reserve read-modify-writes for
//! one owner, are serialised through a scope lock. Callers hold at most one
//! scope at a time; cascades release a scope before taking the next.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use canopy_store::{ParticipantId, RootKey};
use canopy_structure::Program;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// What a lock protects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeKey {
    /// Everything a participant owns in one program: the subtree or matrix
    /// instance anchored on them, and their reserve accounts.
    Owner {
        program: Program,
        owner: ParticipantId,
    },
    /// A structure whose root is not yet known.
    Root(RootKey),
}

impl ScopeKey {
    pub const fn owner(program: Program, owner: ParticipantId) -> Self {
        Self::Owner { program, owner }
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Owner { program, owner } => write!(f, "{}/{}", program, owner),
            Self::Root(key) => write!(f, "{}/{}/{} root", key.program, key.tier, key.phase),
        }
    }
}

/// A held scope; released on drop.
pub struct ScopeGuard {
    key: ScopeKey,
    _guard: OwnedMutexGuard<()>,
}

impl ScopeGuard {
    pub fn key(&self) -> ScopeKey {
        self.key
    }
}

impl Drop for ScopeGuard {
    fn drop(&mut self) {
        trace!("Released scope {}", self.key);
    }
}

/// Async lock table keyed by [`ScopeKey`].
#[derive(Default)]
pub struct ScopeLocks {
    scopes: Mutex<HashMap<ScopeKey, Arc<Mutex<()>>>>,
}

impl ScopeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn acquire(&self, key: ScopeKey) -> ScopeGuard {
        let scope = {
            let mut scopes = self.scopes.lock().await;
            scopes.entry(key).or_default().clone()
        };
        let guard = scope.lock_owned().await;
        trace!("Acquired scope {}", key);
        ScopeGuard { key, _guard: guard }
    }

    /// Drop scopes nobody holds or waits on.
    pub async fn prune(&self) {
        self.scopes
            .lock()
            .await
            .retain(|_, scope| Arc::strong_count(scope) > 1);
    }

    /// Number of tracked scopes.
    pub async fn len(&self) -> usize {
        self.scopes.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_scope_is_exclusive() {
        let locks = Arc::new(ScopeLocks::new());
        let inside = Arc::new(AtomicU32::new(0));
        let key = ScopeKey::owner(Program::Binary, ParticipantId(1));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let inside = inside.clone();
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire(key).await;
                assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                inside.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
    }

    #[tokio::test]
    async fn different_scopes_do_not_block() {
        let locks = ScopeLocks::new();
        let a = locks.acquire(ScopeKey::owner(Program::Binary, ParticipantId(1))).await;
        let b = locks.acquire(ScopeKey::owner(Program::Matrix, ParticipantId(1))).await;
        assert_ne!(a.key(), b.key());
    }

    #[tokio::test]
    async fn prune_keeps_held_scopes() {
        let locks = ScopeLocks::new();
        let held = locks.acquire(ScopeKey::owner(Program::Global, ParticipantId(1))).await;
        drop(locks.acquire(ScopeKey::owner(Program::Global, ParticipantId(2))).await);
        assert_eq!(locks.len().await, 2);

        locks.prune().await;
        assert_eq!(locks.len().await, 1);
        drop(held);
        locks.prune().await;
        assert!(locks.is_empty().await);
    }
}
