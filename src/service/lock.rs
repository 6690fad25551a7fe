use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, SeqError};
use crate::gateway::DistributedLock;

/// 已持有的锁 / A held lock; release it with `Locker::release`
#[derive(Debug)]
pub struct LockGuard {
    key: String,
    owner: String,
}

impl LockGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// 有界等待的自旋锁 / Spin lock with a bounded wait
///
/// 超时返回可重试的 `DataWriteFailed`，从不无限等待。
/// Timing out yields a retryable `DataWriteFailed`; it never waits forever.
#[derive(Clone)]
pub struct Locker {
    backend: Arc<dyn DistributedLock>,
    wait: Duration,
    retry: Duration,
}

impl Locker {
    pub fn new(backend: Arc<dyn DistributedLock>, wait: Duration, retry: Duration) -> Self {
        Self {
            backend,
            wait,
            retry: retry.max(Duration::from_millis(1)),
        }
    }

    pub async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard> {
        let owner = uuid::Uuid::new_v4().simple().to_string();
        let deadline = tokio::time::Instant::now() + self.wait;
        loop {
            match self.backend.try_lock(key, &owner, ttl).await {
                Ok(true) => {
                    debug!("🔒 lock {} acquired", key);
                    return Ok(LockGuard {
                        key: key.to_string(),
                        owner,
                    });
                }
                Ok(false) => {}
                Err(e) => warn!("加锁失败，重试 / lock backend error on {}: {}", key, e),
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(SeqError::write_failed(format!(
                    "lock {} not acquired within {}ms",
                    key,
                    self.wait.as_millis()
                )));
            }
            tokio::time::sleep(self.retry).await;
        }
    }

    /// 按 key 排序依次加锁，避免交叉等待 / Lock several keys in sorted order
    pub async fn acquire_all(&self, keys: &[String], ttl: Duration) -> Result<Vec<LockGuard>> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        sorted.dedup();
        let mut guards = Vec::with_capacity(sorted.len());
        for key in sorted {
            match self.acquire(key, ttl).await {
                Ok(guard) => guards.push(guard),
                Err(e) => {
                    self.release_all(guards).await;
                    return Err(e);
                }
            }
        }
        Ok(guards)
    }

    pub async fn release(&self, guard: LockGuard) {
        match self.backend.unlock(&guard.key, &guard.owner).await {
            Ok(true) => debug!("🔓 lock {} released", guard.key),
            // 已过期被他人接管 / expired and taken over by someone else
            Ok(false) => warn!("lock {} was no longer held at release", guard.key),
            Err(e) => warn!("释放锁失败 / unlock {} failed: {}", guard.key, e),
        }
    }

    pub async fn release_all(&self, guards: Vec<LockGuard>) {
        for guard in guards.into_iter().rev() {
            self.release(guard).await;
        }
    }

    /// 持锁执行闭包，无论成败都会释放 / Run `f` under the lock and always release it
    pub async fn with_lock<T, F, Fut>(&self, key: &str, ttl: Duration, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(key, ttl).await?;
        let res = f().await;
        self.release(guard).await;
        res
    }
}
