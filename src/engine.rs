//! 引擎装配 / Engine assembly
//!
//! 把存储、协作者实现与三个服务接在一起。默认使用 sled 与单进程内存实现，
//! 每个协作者都可以单独替换。
//! Wires the store, the collaborators and the three services together. Defaults to sled plus
//! the in-process implementations; every collaborator can be swapped individually.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::conf::SeqConfig;
use crate::domain::DispatchEnvelope;
use crate::error::Result;
use crate::gateway::{
    ConversationDirectory, DistributedLock, EphemeralCache, MemoryCache, MemoryDirectory,
    MemoryPushChannel, MemoryQueue, MessageQueue, PriorityReceiver, PushChannel, PushPool,
};
use crate::id::IdGenerator;
use crate::service::{ControlService, Dispatcher, Locker, ServiceContext, StreamAssembler};
use crate::storage::{DurableStore, SledStore};
use crate::tasks::{spawn_consumer, spawn_sweeper, PendingDeliveries};

/// 引擎构建器 / Engine builder
pub struct SeqEngineBuilder {
    config: SeqConfig,
    store: Option<Arc<dyn DurableStore>>,
    queue: Option<Arc<dyn MessageQueue>>,
    directory: Option<Arc<dyn ConversationDirectory>>,
    cache: Option<Arc<dyn EphemeralCache>>,
    lock: Option<Arc<dyn DistributedLock>>,
    push_channel: Option<Arc<dyn PushChannel>>,
}

impl SeqEngineBuilder {
    pub fn new(config: SeqConfig) -> Self {
        Self {
            config,
            store: None,
            queue: None,
            directory: None,
            cache: None,
            lock: None,
            push_channel: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn DurableStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// 外部队列：消费端由调用方自行驱动 `on_dispatch_event`
    /// External queue; the caller drives `on_dispatch_event` from its own consumer
    pub fn with_queue(mut self, queue: Arc<dyn MessageQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_directory(mut self, directory: Arc<dyn ConversationDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn EphemeralCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    pub fn with_push_channel(mut self, channel: Arc<dyn PushChannel>) -> Self {
        self.push_channel = Some(channel);
        self
    }

    /// 必须在 tokio 运行时内调用（推送工作池随之启动）
    /// Must run inside a tokio runtime; the push workers start here
    pub fn build(self) -> Result<SeqEngine> {
        let config = self.config;
        let store: Arc<dyn DurableStore> = match self.store {
            Some(store) => store,
            None => Arc::new(match &config.storage.path {
                Some(path) => SledStore::open(path)?,
                None => SledStore::open_temporary()?,
            }),
        };

        let mut receiver = None;
        let queue: Arc<dyn MessageQueue> = match self.queue {
            Some(queue) => queue,
            None => {
                let queue = MemoryQueue::new();
                receiver = queue.take_receiver();
                Arc::new(queue)
            }
        };

        let memory_cache = Arc::new(MemoryCache::new());
        let cache: Arc<dyn EphemeralCache> = match self.cache {
            Some(cache) => cache,
            None => memory_cache.clone(),
        };
        let lock: Arc<dyn DistributedLock> = match self.lock {
            Some(lock) => lock,
            None => memory_cache,
        };
        let directory: Arc<dyn ConversationDirectory> = match self.directory {
            Some(directory) => directory,
            None => Arc::new(MemoryDirectory::new()),
        };
        let push_channel: Arc<dyn PushChannel> = match self.push_channel {
            Some(channel) => channel,
            None => Arc::new(MemoryPushChannel::new()),
        };

        let locker = Locker::new(
            lock,
            config.lock_wait(),
            Duration::from_millis(config.lock.retry_ms),
        );
        let push = PushPool::spawn(push_channel, config.push.workers, config.push.capacity);
        let ctx = Arc::new(ServiceContext {
            ids: Arc::new(IdGenerator::new(config.node.worker_id)),
            config,
            store,
            queue,
            directory,
            cache,
            locker,
            push,
            pending: Arc::new(PendingDeliveries::new()),
        });
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&ctx)));
        let control = Arc::new(ControlService::new(Arc::clone(&ctx)));
        let stream = Arc::new(StreamAssembler::new(Arc::clone(&ctx), Arc::clone(&dispatcher)));
        info!("⚙️ 序列引擎已装配 / sequencing engine assembled");

        Ok(SeqEngine {
            ctx,
            dispatcher,
            control,
            stream,
            receiver: parking_lot::Mutex::new(receiver),
        })
    }
}

/// 序列引擎 / The sequencing engine
pub struct SeqEngine {
    ctx: Arc<ServiceContext>,
    dispatcher: Arc<Dispatcher>,
    control: Arc<ControlService>,
    stream: Arc<StreamAssembler>,
    receiver: parking_lot::Mutex<Option<PriorityReceiver>>,
}

impl SeqEngine {
    pub fn builder(config: SeqConfig) -> SeqEngineBuilder {
        SeqEngineBuilder::new(config)
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn control(&self) -> &Arc<ControlService> {
        &self.control
    }

    pub fn stream(&self) -> &Arc<StreamAssembler> {
        &self.stream
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// 内置内存队列的消费端（只能取一次）/ Consumer side of the built-in queue, once
    pub fn take_receiver(&self) -> Option<PriorityReceiver> {
        self.receiver.lock().take()
    }

    pub async fn on_dispatch_event(&self, envelope: &DispatchEnvelope) -> Result<()> {
        self.dispatcher.on_dispatch_event(envelope).await
    }

    /// 启动内置队列的消费者；消费端已被取走时返回 `None`
    /// Start the consumer of the built-in queue; `None` once the receiver was taken
    pub fn spawn_consumer(&self, shutdown_rx: watch::Receiver<bool>) -> Option<JoinHandle<()>> {
        let receiver = self.take_receiver()?;
        Some(spawn_consumer(
            Arc::clone(&self.dispatcher),
            receiver,
            self.ctx.config.consumer.concurrency,
            self.ctx.config.consumer.max_redelivery,
            shutdown_rx,
        ))
    }

    pub fn spawn_sweeper(&self, shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        spawn_sweeper(
            Arc::clone(&self.ctx.pending),
            Arc::clone(&self.ctx.queue),
            self.ctx.config.sweep.interval_ms,
            shutdown_rx,
        )
    }
}
