use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration};
use tracing::{debug, info, warn};

use crate::domain::DispatchEnvelope;
use crate::gateway::MessageQueue;

/// 入队失败、待补投的分发事件 / Dispatch events whose publish failed, keyed by event id
///
/// 记录已落库但尚未入队的 seq_id，重投安全（消费端幂等）。
/// Holds the seq ids that are durable but never reached the queue; re-publishing is safe.
#[derive(Debug, Default)]
pub struct PendingDeliveries {
    entries: DashMap<String, DispatchEnvelope>,
}

impl PendingDeliveries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, envelope: DispatchEnvelope) {
        self.entries.insert(envelope.event_id.clone(), envelope);
    }

    pub fn remove(&self, event_id: &str) -> Option<DispatchEnvelope> {
        self.entries.remove(event_id).map(|(_, env)| env)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn snapshot(&self) -> Vec<DispatchEnvelope> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }
}

/// 补投一轮，返回成功入队的数量 / One sweep pass; returns how many were re-published
pub async fn sweep_once(pending: &PendingDeliveries, queue: &dyn MessageQueue) -> usize {
    let mut published = 0;
    for envelope in pending.snapshot() {
        match queue.publish(envelope.clone()).await {
            Ok(()) => {
                pending.remove(&envelope.event_id);
                published += 1;
            }
            Err(e) => {
                debug!("补投失败，下轮重试 / re-publish of {} failed: {}", envelope.event_id, e);
            }
        }
    }
    if published > 0 {
        info!("🧹 补投成功 {} 条 / re-published {} pending events", published, published);
    } else if !pending.is_empty() {
        warn!("⚠️ {} 条分发事件仍待补投 / events still pending", pending.len());
    }
    published
}

pub fn spawn_sweeper(
    pending: Arc<PendingDeliveries>,
    queue: Arc<dyn MessageQueue>,
    interval_ms: u64,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("⏰ Delivery sweep interval set to {}ms", interval_ms);
        let mut ticker = interval(Duration::from_millis(interval_ms.max(1)));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if !pending.is_empty() {
                        sweep_once(&pending, queue.as_ref()).await;
                    }
                }
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                }
            }
        }
        debug!("sweeper stopped");
    })
}
