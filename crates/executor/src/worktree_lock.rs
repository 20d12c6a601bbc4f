//! Per-repository reference-counted mutexes, demonstrating the
//! exclusion discipline the Executor expects when it calls into the
//! (out-of-scope, mocked) worktree manager collaborator.
//!
//! Shaped as a `Mutex<HashMap<_, Arc<Semaphore>>>` but refcounts entries
//! so the map doesn't grow unbounded as repositories come and go.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use ao_domain::model::RepositoryId;

struct Entry {
    mutex: Arc<AsyncMutex<()>>,
    refs: AtomicUsize,
}

#[derive(Default)]
pub struct WorktreeLockRegistry {
    entries: Mutex<HashMap<RepositoryId, Arc<Entry>>>,
}

impl WorktreeLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires the exclusion lock for `repo_id`, creating the entry if
    /// none exists. The returned guard removes the entry from the
    /// registry on drop iff it was the last holder.
    pub async fn acquire(self: &Arc<Self>, repo_id: RepositoryId) -> WorktreeLockGuard {
        let entry = {
            let mut entries = self.entries.lock();
            let entry = entries
                .entry(repo_id.clone())
                .or_insert_with(|| {
                    Arc::new(Entry {
                        mutex: Arc::new(AsyncMutex::new(())),
                        refs: AtomicUsize::new(0),
                    })
                })
                .clone();
            entry.refs.fetch_add(1, Ordering::SeqCst);
            entry
        };

        let permit = entry.mutex.clone().lock_owned().await;
        WorktreeLockGuard {
            repo_id,
            entry,
            registry: self.clone(),
            _permit: permit,
        }
    }

    pub fn tracked_repository_count(&self) -> usize {
        self.entries.lock().len()
    }
}

pub struct WorktreeLockGuard {
    repo_id: RepositoryId,
    entry: Arc<Entry>,
    registry: Arc<WorktreeLockRegistry>,
    _permit: OwnedMutexGuard<()>,
}

impl Drop for WorktreeLockGuard {
    fn drop(&mut self) {
        if self.entry.refs.fetch_sub(1, Ordering::SeqCst) == 1 {
            let mut entries = self.registry.entries.lock();
            if let Some(current) = entries.get(&self.repo_id) {
                if Arc::ptr_eq(current, &self.entry) {
                    entries.remove(&self.repo_id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn last_holder_removes_the_entry() {
        let registry = Arc::new(WorktreeLockRegistry::new());
        let repo = RepositoryId::from("r1");

        let guard = registry.acquire(repo.clone()).await;
        assert_eq!(registry.tracked_repository_count(), 1);
        drop(guard);
        assert_eq!(registry.tracked_repository_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_repositories_do_not_block_each_other() {
        let registry = Arc::new(WorktreeLockRegistry::new());
        let g1 = registry.acquire(RepositoryId::from("r1")).await;
        let g2 = registry.acquire(RepositoryId::from("r2")).await;
        assert_eq!(registry.tracked_repository_count(), 2);
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn second_acquire_waits_for_first_to_release() {
        let registry = Arc::new(WorktreeLockRegistry::new());
        let repo = RepositoryId::from("r1");

        let g1 = registry.acquire(repo.clone()).await;
        let registry2 = registry.clone();
        let repo2 = repo.clone();
        let handle = tokio::spawn(async move {
            let _g2 = registry2.acquire(repo2).await;
            42
        });

        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        drop(g1);
        assert_eq!(handle.await.unwrap(), 42);
        assert_eq!(registry.tracked_repository_count(), 0);
    }
}
