use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use super::PushChannel;
use crate::domain::PushPayload;

#[derive(Debug)]
struct PushJob {
    identity: String,
    payload: PushPayload,
}

#[derive(Debug, Default)]
struct PushCounters {
    accepted: AtomicU64,
    dropped: AtomicU64,
    delivered: AtomicU64,
    failed: AtomicU64,
}

/// 推送统计快照 / Snapshot of the pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PushStats {
    pub accepted: u64,
    pub dropped: u64,
    pub delivered: u64,
    pub failed: u64,
}

/// 有界推送工作池 / Bounded pool of push workers
///
/// `submit` 从不等待：队列满时丢弃并告警，推送失败只记日志。
/// `submit` never waits: a full queue drops the push with a warning; push failures are only logged.
#[derive(Clone)]
pub struct PushPool {
    sender: mpsc::Sender<PushJob>,
    counters: Arc<PushCounters>,
}

impl PushPool {
    /// 启动 `workers` 个工作任务 / Spawn `workers` worker tasks on the current runtime
    pub fn spawn(channel: Arc<dyn PushChannel>, workers: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<PushJob>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let counters = Arc::new(PushCounters::default());
        for worker in 0..workers.max(1) {
            let receiver = Arc::clone(&receiver);
            let channel = Arc::clone(&channel);
            let counters = Arc::clone(&counters);
            tokio::spawn(async move {
                loop {
                    let job = { receiver.lock().await.recv().await };
                    let Some(job) = job else { break };
                    match channel.push_to_identity(&job.identity, job.payload).await {
                        Ok(()) => {
                            counters.delivered.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(e) => {
                            counters.failed.fetch_add(1, Ordering::Relaxed);
                            warn!("📵 推送失败 / push to {} failed: {}", job.identity, e);
                        }
                    }
                }
                debug!("push worker {} stopped", worker);
            });
        }
        Self { sender, counters }
    }

    /// 非阻塞提交 / Non-blocking submit; returns whether the job was queued
    pub fn submit(&self, identity: &str, payload: PushPayload) -> bool {
        let job = PushJob {
            identity: identity.to_string(),
            payload,
        };
        match self.sender.try_send(job) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("⚠️ 推送队列已满，丢弃 / push queue full, dropping push to {}", job.identity);
                false
            }
            Err(TrySendError::Closed(job)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                warn!("push pool closed, dropping push to {}", job.identity);
                false
            }
        }
    }

    pub fn stats(&self) -> PushStats {
        PushStats {
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// 等待已接收的推送全部处理完 / Wait until every accepted push has been handled
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let s = self.stats();
            if s.delivered + s.failed >= s.accepted {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ControlContent;
    use crate::gateway::MemoryPushChannel;
    use async_trait::async_trait;

    fn typing() -> PushPayload {
        PushPayload::Intermediate {
            conversation_id: "c".into(),
            sender_id: "s".into(),
            content: ControlContent::TypingState { typing: true },
        }
    }

    #[tokio::test]
    async fn test_pool_delivers_and_counts_failures() {
        let channel = Arc::new(MemoryPushChannel::new());
        channel.fail_for("bad");
        let pool = PushPool::spawn(channel.clone(), 2, 16);
        assert!(pool.submit("a", typing()));
        assert!(pool.submit("bad", typing()));
        assert!(pool.wait_idle(Duration::from_secs(1)).await);
        let stats = pool.stats();
        assert_eq!(stats.delivered, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(channel.pushes_for("a").len(), 1);
    }

    struct Stuck;

    #[async_trait]
    impl PushChannel for Stuck {
        async fn push_to_identity(&self, _identity: &str, _payload: PushPayload) -> anyhow::Result<()> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_full_queue_drops_without_blocking() {
        let pool = PushPool::spawn(Arc::new(Stuck), 1, 1);
        let mut accepted = 0;
        for _ in 0..10 {
            if pool.submit("a", typing()) {
                accepted += 1;
            }
        }
        // 一个在途，一个排队 / one in flight plus one queued at most
        assert!(accepted <= 2);
        assert!(pool.stats().dropped >= 8);
    }
}
