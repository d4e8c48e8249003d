//! Keyed single-flight memoization.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::OnceCell;

/// A map whose missing values are produced by a provider that receives the key.
///
/// Each key owns its own [`OnceCell`]: concurrent first readers of the same key
/// wait for one provider call and share its value, while different keys fill
/// independently. A failed provider call leaves the key empty so the next
/// reader tries again.
pub struct Memo<K, V> {
    cells: DashMap<K, Arc<OnceCell<V>>>,
}

impl<K, V> Memo<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self {
            cells: DashMap::new(),
        }
    }

    pub async fn get_or_try_init<F, Fut, E>(&self, key: K, provider: F) -> Result<V, E>
    where
        F: FnOnce(K) -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        // The shard guard must not be held across the await below.
        let cell = self.cells.entry(key.clone()).or_default().value().clone();
        cell.get_or_try_init(|| provider(key)).await.cloned()
    }

    /// Value for `key` if it has already been computed.
    pub fn get(&self, key: &K) -> Option<V> {
        self.cells.get(key).and_then(|cell| cell.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.cells.iter().filter(|cell| cell.initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> Default for Memo<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn provider_receives_key() {
        let memo: Memo<String, usize> = Memo::new();
        let len = memo
            .get_or_try_init("abcd".to_string(), |k| async move { Ok::<_, ()>(k.len()) })
            .await
            .unwrap();
        assert_eq!(len, 4);
        assert_eq!(memo.get(&"abcd".to_string()), Some(4));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_readers_share_one_call() {
        let memo: Arc<Memo<&'static str, u64>> = Arc::new(Memo::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let memo = memo.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                memo.get_or_try_init("key", |_| async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok::<_, ()>(42)
                })
                .await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap(), Ok(42));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_is_not_cached() {
        let memo: Memo<u8, u8> = Memo::new();
        let first = memo.get_or_try_init(1, |_| async { Err::<u8, _>("boom") }).await;
        assert_eq!(first, Err("boom"));
        assert!(memo.is_empty());

        let second = memo.get_or_try_init(1, |_| async { Ok::<_, &str>(7) }).await;
        assert_eq!(second, Ok(7));
        assert_eq!(memo.len(), 1);
    }
}
