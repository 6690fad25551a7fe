use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::DispatchEnvelope;
use crate::gateway::PriorityReceiver;
use crate::service::Dispatcher;

/// 启动队列消费循环 / Start the queue consumer loop
///
/// 并发由信号量限制；处理失败的事件带着递增的 attempt 重新入队，
/// 超过 `max_redelivery` 后记录为死信。
/// Concurrency is bounded by a semaphore. Failed events are re-published with a bumped
/// attempt counter and dead-lettered past `max_redelivery`.
pub fn spawn_consumer(
    dispatcher: Arc<Dispatcher>,
    mut receiver: PriorityReceiver,
    concurrency: usize,
    max_redelivery: u32,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("🚀 分发消费者启动 / dispatch consumer started (concurrency {})", concurrency);
        let permits = Arc::new(Semaphore::new(concurrency.max(1)));
        loop {
            let envelope = tokio::select! {
                env = receiver.recv() => match env {
                    Some(env) => env,
                    None => break,
                },
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() { break; }
                    continue;
                }
            };
            let permit = match permits.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            let dispatcher = Arc::clone(&dispatcher);
            tokio::spawn(async move {
                handle(&dispatcher, envelope, max_redelivery).await;
                drop(permit);
            });
        }
        info!("🛑 分发消费者停止 / dispatch consumer stopped");
    })
}

async fn handle(dispatcher: &Dispatcher, envelope: DispatchEnvelope, max_redelivery: u32) {
    let Err(e) = dispatcher.on_dispatch_event(&envelope).await else {
        debug!("event {} handled", envelope.event_id);
        return;
    };
    if envelope.attempt < max_redelivery {
        warn!(
            "分发处理失败，重新入队 / event {} failed (attempt {}): {}",
            envelope.event_id, envelope.attempt, e
        );
        // 入队失败时已登记补投 / a failed re-publish is already recorded for the sweeper
        let _ = dispatcher.context().publish_envelope(envelope.redelivery()).await;
    } else {
        error!(
            "💀 分发事件进入死信 / event {} dead-lettered after {} attempts: {} ({:?})",
            envelope.event_id,
            envelope.attempt + 1,
            e,
            envelope.event
        );
    }
}
