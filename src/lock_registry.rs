// =============================================================================
// SymbolLockRegistry — per-(userId, symbol) mutual exclusion
// =============================================================================
//
// Every Executor entry point acquires the lock for its `(userId, symbol)`
// pair for the duration of the operation (§4.5). Locks are lazily created
// and never evicted — the process lifetime of a lock is bounded by
// `users × symbols`, which stays small because both are whitelisted
// upstream. There is no global executor lock: operations on different
// symbols, or the same symbol for different users, run fully in parallel.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;

#[derive(Default)]
pub struct SymbolLockRegistry {
    locks: Mutex<HashMap<(String, String), Arc<AsyncMutex<()>>>>,
}

impl SymbolLockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get-or-create the lock for `(user_id, symbol)`, atomically.
    fn get_or_create(&self, user_id: &str, symbol: &str) -> Arc<AsyncMutex<()>> {
        let key = (user_id.to_string(), symbol.to_string());
        let mut map = self.locks.lock();
        map.entry(key).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
    }

    /// Acquire the lock for `(user_id, symbol)`, holding it until the
    /// returned guard is dropped. Reentrant in the sense that a single
    /// operation acquires once and holds for its whole duration; this
    /// registry does not support nested acquisition from the same task
    /// (that would deadlock against itself, as with any non-reentrant
    /// mutex) — callers acquire exactly once per operation, per §4.5.
    pub async fn lock(&self, user_id: &str, symbol: &str) -> SymbolLockGuard {
        let lock = self.get_or_create(user_id, symbol);
        let guard = lock.lock_owned().await;
        SymbolLockGuard { _guard: guard }
    }

    pub fn len(&self) -> usize {
        self.locks.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// RAII guard releasing the symbol lock on drop.
pub struct SymbolLockGuard {
    _guard: tokio::sync::OwnedMutexGuard<()>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn same_symbol_serialises_operations() {
        let registry = Arc::new(SymbolLockRegistry::new());
        let counter = Arc::new(AtomicU32::new(0));
        let max_concurrent = Arc::new(AtomicU32::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = registry.clone();
            let counter = counter.clone();
            let max_concurrent = max_concurrent.clone();
            handles.push(tokio::spawn(async move {
                let _guard = registry.lock("user-1", "BTCUSDT").await;
                let now = counter.fetch_add(1, Ordering::SeqCst) + 1;
                max_concurrent.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                counter.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_symbols_run_concurrently() {
        let registry = Arc::new(SymbolLockRegistry::new());
        let g1 = registry.lock("user-1", "BTCUSDT").await;
        let g2_fut = registry.lock("user-1", "ETHUSDT");
        let g2 = tokio::time::timeout(Duration::from_millis(50), g2_fut).await;
        assert!(g2.is_ok());
        drop(g1);
    }

    #[tokio::test]
    async fn registry_never_evicts_created_locks() {
        let registry = SymbolLockRegistry::new();
        let _g = registry.lock("u1", "BTCUSDT").await;
        drop(_g);
        assert_eq!(registry.len(), 1);
    }
}
