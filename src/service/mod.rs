//! 业务服务层 / Service layer
//!
//! 分发器、控制消息状态机与流式组装器共享同一个 `ServiceContext`，
//! 所有依赖在构造时显式注入。
//! The dispatcher, control state machine and stream assembler share one explicitly injected context.

use std::sync::Arc;
use tracing::error;

use crate::conf::SeqConfig;
use crate::domain::{
    Conversation, DispatchEnvelope, DispatchEvent, Identity, MessageStatus, MessageType,
    PushPayload, SeqExtra, SequenceRecord,
};
use crate::error::{Result, SeqError};
use crate::gateway::{ConversationDirectory, EphemeralCache, MessageQueue, PushPool};
use crate::id::IdGenerator;
use crate::priority::Priority;
use crate::storage::DurableStore;
use crate::tasks::sweeper::PendingDeliveries;

pub mod control;
pub mod dispatcher;
pub mod lock;
pub mod refer;
pub mod stream;

pub use control::ControlService;
pub use dispatcher::{Dispatcher, SendRequest};
pub use lock::{LockGuard, Locker};
pub use refer::ReferMap;
pub use stream::{StreamAssembler, StreamStart};

/// 服务共享上下文 / Shared service context
pub struct ServiceContext {
    pub config: SeqConfig,
    pub store: Arc<dyn DurableStore>,
    pub queue: Arc<dyn MessageQueue>,
    pub directory: Arc<dyn ConversationDirectory>,
    pub cache: Arc<dyn EphemeralCache>,
    pub locker: Locker,
    pub push: PushPool,
    pub ids: Arc<IdGenerator>,
    pub pending: Arc<PendingDeliveries>,
}

impl ServiceContext {
    /// 发布分发事件；失败时登记待补投并返回 `MessageDeliveryFailed`
    /// Publish a dispatch event; failures are recorded for the sweeper and surfaced
    pub async fn publish(&self, priority: Priority, event: DispatchEvent) -> Result<DispatchEnvelope> {
        let envelope = DispatchEnvelope::new(priority, event);
        self.publish_envelope(envelope.clone()).await?;
        Ok(envelope)
    }

    pub async fn publish_envelope(&self, envelope: DispatchEnvelope) -> Result<()> {
        match self.queue.publish(envelope.clone()).await {
            Ok(()) => {
                self.pending.remove(&envelope.event_id);
                Ok(())
            }
            Err(e) => {
                error!(
                    "❌ 分发事件入队失败，等待补投 / publish of {} failed, left for sweep: {}",
                    envelope.event_id, e
                );
                self.pending.record(envelope);
                Err(SeqError::delivery_failed(e.to_string()))
            }
        }
    }

    /// 尽力推送一条序列记录 / Best-effort push of a sequence record to its owner
    pub fn push_seq(&self, seq: &SequenceRecord) {
        self.push.submit(&seq.object_id, PushPayload::seq(seq));
    }

    /// 生成一条新的序列记录草稿（seq_id 与 message_id 均新分配）
    /// Draft a fresh sequence record with newly allocated seq and message ids
    pub fn draft_seq(
        &self,
        owner: &Identity,
        conversation_id: &str,
        magic_message_id: &str,
        message_type: MessageType,
        app_message_id: &str,
        status: MessageStatus,
    ) -> SequenceRecord {
        let now = now_ms();
        SequenceRecord {
            seq_id: self.ids.next_id(),
            object_id: owner.id.clone(),
            object_type: owner.kind,
            organization_code: owner.organization_code.clone(),
            conversation_id: conversation_id.to_string(),
            message_id: self.ids.next_message_id(),
            magic_message_id: magic_message_id.to_string(),
            refer_message_id: None,
            sender_message_id: None,
            message_type,
            content: None,
            receive_list: None,
            status,
            extra: SeqExtra::default(),
            app_message_id: app_message_id.to_string(),
            created_at: now,
            updated_at: now,
        }
    }

    /// 校验会话存在且属于操作者 / The conversation must exist and belong to `owner`
    pub async fn owned_conversation(&self, owner: &Identity, conversation_id: &str) -> Result<Conversation> {
        match self.directory.get_conversation(conversation_id).await? {
            Some(conv) if conv.is_owned_by(&owner.id) => Ok(conv),
            _ => Err(SeqError::conversation_not_found(conversation_id)),
        }
    }
}

/// 单聊对端身份 / The peer of a direct conversation
pub(crate) fn peer_of(conv: &Conversation) -> Result<Identity> {
    let kind = conv
        .receive_type
        .peer_object_type()
        .ok_or_else(|| SeqError::conversation_type(conv.receive_type.as_str()))?;
    Ok(Identity {
        id: conv.receive_id.clone(),
        kind,
        organization_code: conv.receive_organization_code.clone(),
    })
}

/// 序列记录所有者的身份 / Identity of a sequence record's owner
pub(crate) fn owner_of(seq: &SequenceRecord) -> Identity {
    Identity {
        id: seq.object_id.clone(),
        kind: seq.object_type,
        organization_code: seq.organization_code.clone(),
    }
}

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// 同一逻辑消息的撤回、编辑与群扇出共用这把锁
/// Revoke, edit and group fan-out of one logical message serialize on this key
pub fn message_lock_key(magic_message_id: &str) -> String {
    format!("message:{}", magic_message_id)
}
