use super::types::TreeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// One async mutex per tree, serializing structural mutations in-process.
///
/// The database transaction stays the source of truth; this only keeps
/// concurrent callers in one process from racing for the same tree's
/// interval space. Entries nobody holds are pruned on the next acquire.
#[derive(Debug, Default)]
pub struct TreeLocks {
    inner: Mutex<HashMap<TreeId, Arc<AsyncMutex<()>>>>,
}

impl TreeLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `tree_id`'s interval numbering
    pub async fn acquire(&self, tree_id: TreeId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            map.retain(|id, lock| *id == tree_id || Arc::strong_count(lock) > 1);
            map.entry(tree_id).or_default().clone()
        };
        lock.lock_owned().await
    }

    /// Number of trees with a live lock entry
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_same_tree_is_exclusive() {
        let locks = Arc::new(TreeLocks::new());
        let tree = TreeId::new();

        let guard = locks.acquire(tree).await;
        let contender = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.acquire(tree).await;
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished());

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_different_trees_do_not_block() {
        let locks = TreeLocks::new();
        let _a = locks.acquire(TreeId::new()).await;
        let _b = tokio::time::timeout(Duration::from_secs(1), locks.acquire(TreeId::new()))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_idle_entries_are_pruned() {
        let locks = TreeLocks::new();
        for _ in 0..10 {
            let _guard = locks.acquire(TreeId::new()).await;
        }
        assert_eq!(locks.len(), 1);
    }
}
