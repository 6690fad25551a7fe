//! 外部协作者接口 / External collaborator interfaces
//!
//! 队列、缓存、分布式锁、实时推送与会话目录均以 trait 注入，
//! 核心只依赖接口，不内嵌任何传输细节。
//! Queue, cache, lock, push channel and conversation directory are injected as traits.

use async_trait::async_trait;
use std::time::Duration;

use crate::domain::{
    Conversation, ConversationStatus, ConversationType, DispatchEnvelope, Identity, PushPayload,
};

pub mod memory;
pub mod push_pool;

pub use memory::{MemoryCache, MemoryDirectory, MemoryPushChannel, MemoryQueue, PriorityReceiver};
pub use push_pool::PushPool;

/// 消息队列发布端 / Message queue publisher
#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// 按信封上的优先级投递 / Publish at the envelope's priority
    async fn publish(&self, envelope: DispatchEnvelope) -> anyhow::Result<()>;
}

/// 临时键值缓存，不要求持久 / Ephemeral key-value cache, never durable
#[async_trait]
pub trait EphemeralCache: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String, ttl: Duration) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// 分布式锁 / Distributed lock
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// 单次尝试加锁，不等待 / One non-blocking attempt
    async fn try_lock(&self, key: &str, owner: &str, ttl: Duration) -> anyhow::Result<bool>;
    /// 仅持有者可释放 / Only the owner may release
    async fn unlock(&self, key: &str, owner: &str) -> anyhow::Result<bool>;
}

/// 实时推送通道 / Real-time push channel
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn push_to_identity(&self, identity: &str, payload: PushPayload) -> anyhow::Result<()>;
}

/// 会话目录（会话与群成员由外部系统维护）
/// Conversation directory; conversations and group membership are owned elsewhere
#[async_trait]
pub trait ConversationDirectory: Send + Sync {
    async fn get_conversation(&self, conversation_id: &str) -> anyhow::Result<Option<Conversation>>;

    /// 获取或创建 `owner` 看向 `receive_id` 的会话窗口；已删除的窗口会被恢复
    /// Get or create `owner`'s window onto `receive_id`; deleted windows are restored
    async fn get_or_create_conversation(
        &self,
        owner: &Identity,
        receive_id: &str,
        receive_type: ConversationType,
        receive_organization_code: &str,
    ) -> anyhow::Result<Conversation>;

    /// 群成员（含发送者）/ Group members, sender included
    async fn group_members(&self, group_id: &str) -> anyhow::Result<Vec<Identity>>;

    async fn update_status(&self, conversation_id: &str, status: ConversationStatus) -> anyhow::Result<()>;
}
