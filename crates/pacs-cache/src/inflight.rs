//! 进行中请求去重
//!
//! 同一键在任意时刻最多只有一个上游请求。表中只保存共享future的弱引用，
//! 请求由等待方持有：全部等待方放弃（客户端断开、批次超时）时请求随之取消，
//! 请求结束或被取消时其标记都会从表中移除。

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

type SharedWork<V> = Shared<BoxFuture<'static, V>>;
type PendingMap<K, V> = Arc<Mutex<HashMap<K, Slot<V>>>>;

struct Slot<V> {
    generation: u64,
    work: WeakShared<BoxFuture<'static, V>>,
}

/// 进行中请求表，服务启动时创建，生命周期与进程相同
pub struct InFlight<K, V> {
    pending: PendingMap<K, V>,
    next_generation: AtomicU64,
}

/// 指向共享结果的句柄
pub struct InFlightHandle<V> {
    work: SharedWork<V>,
}

impl<V: Clone> InFlightHandle<V> {
    /// 等待结果
    pub async fn wait(self) -> V {
        self.work.await
    }
}

/// 请求结束或被丢弃时移除对应标记
struct SlotGuard<K: Eq + Hash, V> {
    pending: PendingMap<K, V>,
    key: K,
    generation: u64,
}

impl<K: Eq + Hash, V> Drop for SlotGuard<K, V> {
    fn drop(&mut self) {
        let mut pending = lock(&self.pending);
        // 同一键可能已经被新一轮请求占用
        if pending
            .get(&self.key)
            .map_or(false, |slot| slot.generation == self.generation)
        {
            pending.remove(&self.key);
        }
    }
}

fn lock<K, V>(pending: &Mutex<HashMap<K, Slot<V>>>) -> MutexGuard<'_, HashMap<K, Slot<V>>> {
    pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<K, V> InFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
            next_generation: AtomicU64::new(0),
        }
    }

    /// 获取 `key` 的共享结果
    ///
    /// 已有请求在进行时返回 `(true, handle)` 且不调用 `start`；
    /// 否则调用 `start` 发起新请求并返回 `(false, handle)`。
    pub fn acquire<F, Fut>(&self, key: K, start: F) -> (bool, InFlightHandle<V>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut pending = lock(&self.pending);

        if let Some(work) = pending.get(&key).and_then(|slot| slot.work.upgrade()) {
            return (true, InFlightHandle { work });
        }

        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let guard = SlotGuard {
            pending: Arc::clone(&self.pending),
            key: key.clone(),
            generation,
        };
        let future = start();
        let work = async move {
            let _guard = guard;
            future.await
        }
        .boxed()
        .shared();

        if let Some(weak) = work.downgrade() {
            pending.insert(key, Slot { generation, work: weak });
        }

        (false, InFlightHandle { work })
    }

    /// 当前进行中的请求数
    pub fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, key: &K) -> bool {
        lock(&self.pending).contains_key(key)
    }
}

impl<K, V> Default for InFlight<K, V>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_request() {
        let inflight: InFlight<String, u32> = InFlight::new();
        let starts = Arc::new(AtomicUsize::new(0));
        let (tx, rx) = oneshot::channel::<u32>();

        let counter = starts.clone();
        let (joined, leader) = inflight.acquire("k".to_string(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async move { rx.await.unwrap_or(0) }
        });
        assert!(!joined);

        let counter = starts.clone();
        let (joined, follower) = inflight.acquire("k".to_string(), move || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { 0 }
        });
        assert!(joined);
        assert!(inflight.contains(&"k".to_string()));

        tx.send(7).unwrap();
        let (a, b) = tokio::join!(leader.wait(), follower.wait());
        assert_eq!((a, b), (7, 7));
        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn test_completed_key_starts_fresh() {
        let inflight: InFlight<&'static str, u32> = InFlight::new();

        let (_, first) = inflight.acquire("k", || async { 1 });
        assert_eq!(first.wait().await, 1);
        assert!(inflight.is_empty());

        let (joined, second) = inflight.acquire("k", || async { 2 });
        assert!(!joined);
        assert_eq!(second.wait().await, 2);
    }

    #[tokio::test]
    async fn test_failures_clear_marker() {
        let inflight: InFlight<&'static str, Result<u32, String>> = InFlight::new();

        let (_, handle) = inflight.acquire("k", || async { Err("HTTP 502".to_string()) });
        assert_eq!(handle.wait().await, Err("HTTP 502".to_string()));
        assert!(!inflight.contains(&"k"));
    }

    #[tokio::test]
    async fn test_abandoned_request_is_cancelled() {
        let inflight: Arc<InFlight<&'static str, u32>> = Arc::new(InFlight::new());
        let dropped = Arc::new(AtomicUsize::new(0));

        struct DropFlag(Arc<AtomicUsize>);
        impl Drop for DropFlag {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let flag = DropFlag(dropped.clone());
        let (_, handle) = inflight.acquire("k", move || async move {
            let _flag = flag;
            tokio::time::sleep(Duration::from_secs(3600)).await;
            1
        });

        let waiter = tokio::spawn(handle.wait());
        tokio::task::yield_now().await;
        assert_eq!(inflight.len(), 1);

        waiter.abort();
        assert!(waiter.await.unwrap_err().is_cancelled());
        assert_eq!(dropped.load(Ordering::SeqCst), 1);
        assert!(inflight.is_empty());
    }

    #[tokio::test]
    async fn test_follower_keeps_request_alive() {
        let inflight: InFlight<&'static str, u32> = InFlight::new();
        let (tx, rx) = oneshot::channel::<u32>();

        let (_, leader) = inflight.acquire("k", || async move { rx.await.unwrap_or(0) });
        let (joined, follower) = inflight.acquire("k", || async { 0 });
        assert!(joined);

        drop(leader);
        assert!(inflight.contains(&"k"));

        tx.send(3).unwrap();
        assert_eq!(follower.wait().await, 3);
        assert!(inflight.is_empty());
    }
}
