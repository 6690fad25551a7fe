//! 集成测试公共装置 / Shared fixtures for the integration tests
#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use v_im_seq::domain::{
    Conversation, ConversationType, DispatchEnvelope, Identity, PushPayload, SequenceRecord,
};
use v_im_seq::gateway::{
    ConversationDirectory, MemoryDirectory, MemoryPushChannel, MemoryQueue, PriorityReceiver,
};
use v_im_seq::storage::{DurableStore, SequenceStore};
use v_im_seq::{SeqConfig, SeqEngine, SeqEngineBuilder};

pub const ORG: &str = "org-1";

pub struct Harness {
    pub engine: SeqEngine,
    pub directory: Arc<MemoryDirectory>,
    pub push: Arc<MemoryPushChannel>,
    pub queue: Arc<MemoryQueue>,
    pub receiver: PriorityReceiver,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    /// 需在 tokio 运行时中调用 / Call from inside a tokio runtime
    pub fn with_config(config: SeqConfig) -> Self {
        Self::build(SeqEngine::builder(config))
    }

    /// 替换持久化存储（如包装一层延迟）/ Swap in a different durable store
    pub fn with_store(config: SeqConfig, store: Arc<dyn DurableStore>) -> Self {
        Self::build(SeqEngine::builder(config).with_store(store))
    }

    fn build(builder: SeqEngineBuilder) -> Self {
        let directory = Arc::new(MemoryDirectory::new());
        let push = Arc::new(MemoryPushChannel::new());
        let queue = Arc::new(MemoryQueue::new());
        let receiver = queue.take_receiver().expect("fresh queue has a receiver");
        let engine = builder
            .with_directory(directory.clone())
            .with_push_channel(push.clone())
            .with_queue(queue.clone())
            .build()
            .expect("engine builds");
        Self {
            engine,
            directory,
            push,
            queue,
            receiver,
        }
    }

    pub fn store(&self) -> &Arc<dyn DurableStore> {
        &self.engine.context().store
    }

    /// 取出队列中的全部事件并交给消费入口 / Drain the queue through the consumer entry point
    pub async fn pump(&mut self) -> Vec<DispatchEnvelope> {
        let mut handled = Vec::new();
        loop {
            let batch = self.receiver.drain();
            if batch.is_empty() {
                break;
            }
            for env in batch {
                self.engine
                    .on_dispatch_event(&env)
                    .await
                    .expect("dispatch event handled");
                handled.push(env);
            }
        }
        self.settle().await;
        handled
    }

    /// 只取事件不处理 / Take queued events without handling them
    pub fn queued(&mut self) -> Vec<DispatchEnvelope> {
        self.receiver.drain()
    }

    /// 等推送工作池处理完 / Wait for the push workers to go idle
    pub async fn settle(&self) {
        assert!(
            self.engine
                .context()
                .push
                .wait_idle(Duration::from_secs(2))
                .await,
            "push pool did not go idle"
        );
    }

    pub fn direct(&self, a: &Identity, b: &Identity) -> (Conversation, Conversation) {
        self.directory.open_direct(a, b)
    }

    /// 建群并返回每个成员的群会话窗口 / Register a group and open every member's window
    pub async fn group(&self, group_id: &str, members: &[Identity]) -> Vec<Conversation> {
        self.directory.register_group(group_id, members.to_vec());
        let mut windows = Vec::with_capacity(members.len());
        for member in members {
            windows.push(
                self.directory
                    .get_or_create_conversation(member, group_id, ConversationType::Group, ORG)
                    .await
                    .expect("group window"),
            );
        }
        windows
    }

    /// 某身份持有的该逻辑消息的首条记录 / The first record `owner` holds for a logical message
    pub async fn holder(&self, magic_message_id: &str, owner: &str) -> SequenceRecord {
        self.store()
            .get_minimum_per_recipient(magic_message_id)
            .await
            .expect("store read")
            .remove(owner)
            .expect("holder exists")
    }

    pub fn seq_pushes_for(&self, identity: &str) -> Vec<SequenceRecord> {
        self.push
            .pushes_for(identity)
            .into_iter()
            .filter_map(|p| match p {
                PushPayload::Seq { seq } => Some(seq),
                _ => None,
            })
            .collect()
    }
}

pub fn test_config() -> SeqConfig {
    let mut config = SeqConfig::default();
    config.lock.wait_ms = 2000;
    config.lock.retry_ms = 2;
    config.fanout.batch_size = 64;
    config
}

pub fn user(id: &str) -> Identity {
    Identity::user(id, ORG)
}

pub fn agent(id: &str) -> Identity {
    Identity::ai(id, ORG)
}
