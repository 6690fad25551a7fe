//! 扇出分发器 / Fan-out dispatcher
//!
//! 单聊（含 AI）在同一事务内同步写入双方记录；群聊先提交发送方记录，
//! 再经队列异步、分批为每个成员生成记录。
//! Direct chats write both sides in one transaction; groups commit the sender first
//! and fan out to members asynchronously in batches.

use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{message_lock_key, now_ms, peer_of, ReferMap, ServiceContext};
use crate::domain::{
    Conversation, ConversationStatus, ConversationType, DispatchEnvelope, DispatchEvent, Identity,
    MessageContent, MessageRecord, MessageStatus, ReceiveList, SeqExtra, SequenceRecord,
};
use crate::error::{Result, SeqError};
use crate::priority::priority_for;
use crate::storage::{MessageStore, SequenceStore, WriteBatch};

/// 发送意图 / A caller's send intent
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub sender: Identity,
    pub conversation_id: String,
    /// 客户端生成的幂等令牌 / Client-generated idempotency token
    pub app_message_id: String,
    pub content: MessageContent,
    pub refer_message_id: Option<String>,
    pub topic_id: Option<String>,
    pub language: Option<String>,
    pub environment_id: Option<String>,
}

impl SendRequest {
    pub fn new(sender: Identity, conversation_id: impl Into<String>, content: MessageContent) -> Self {
        Self {
            sender,
            conversation_id: conversation_id.into(),
            app_message_id: uuid::Uuid::new_v4().simple().to_string(),
            content,
            refer_message_id: None,
            topic_id: None,
            language: None,
            environment_id: None,
        }
    }

    pub fn with_app_message_id(mut self, app_message_id: impl Into<String>) -> Self {
        self.app_message_id = app_message_id.into();
        self
    }

    pub fn with_refer(mut self, refer_message_id: impl Into<String>) -> Self {
        self.refer_message_id = Some(refer_message_id.into());
        self
    }

    pub fn with_topic(mut self, topic_id: impl Into<String>) -> Self {
        self.topic_id = Some(topic_id.into());
        self
    }

    pub fn with_language(mut self, language: impl Into<String>) -> Self {
        self.language = Some(language.into());
        self
    }
}

pub struct Dispatcher {
    ctx: Arc<ServiceContext>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<ServiceContext> {
        &self.ctx
    }

    /// 发送一条聊天消息，返回调用者自己的序列记录
    /// Send a chat message; returns the caller's own sequence record
    pub async fn dispatch_send(&self, req: SendRequest) -> Result<SequenceRecord> {
        let conv = self.ctx.owned_conversation(&req.sender, &req.conversation_id).await?;
        if !conv.receive_type.is_dispatchable() {
            return Err(SeqError::conversation_type(conv.receive_type.as_str()));
        }
        if let Some(existing) = self.already_sent(&req).await? {
            info!("♻️ 重复提交，跳过分发 / duplicate app_message_id {}, skip", req.app_message_id);
            return Ok(existing);
        }

        let message = self.new_message(&req, &conv);
        let extra = SeqExtra {
            topic_id: req.topic_id.clone().or_else(|| conv.extra.default_topic_id.clone()),
            edit_message_options: None,
            environment_id: req.environment_id.clone(),
        };
        let refer = ReferMap::build(self.ctx.store.as_ref(), req.refer_message_id.as_deref()).await?;

        if conv.receive_type.is_direct() {
            let (sender_seq, receiver_seq) = self
                .persist_direct(&req.sender, &conv, message, &refer, req.refer_message_id.as_deref(), extra)
                .await?;
            let priority = priority_for(conv.receive_type, 1, false);
            self.ctx
                .publish(
                    priority,
                    DispatchEvent::Deliver {
                        seq_ids: vec![receiver_seq.seq_id, sender_seq.seq_id],
                    },
                )
                .await?;
            return Ok(sender_seq);
        }

        // 群聊：先提交发送方记录，成员记录异步生成 / group: commit the sender, fan out later
        let members = self.ctx.directory.group_members(&conv.receive_id).await?;
        let recipients: Vec<String> = members
            .iter()
            .filter(|m| m.id != req.sender.id)
            .map(|m| m.id.clone())
            .collect();
        let mut sender_seq = self.ctx.draft_seq(
            &req.sender,
            &conv.id,
            &message.magic_message_id,
            message.message_type,
            &req.app_message_id,
            MessageStatus::Read,
        );
        sender_seq.refer_message_id = own_refer(&refer, &req.sender.id, req.refer_message_id.as_deref());
        sender_seq.receive_list = Some(ReceiveList::unread(recipients.iter().cloned()));
        sender_seq.extra = extra;

        let mut batch = WriteBatch::new();
        batch.create_message(message).create_sequence(sender_seq.clone());
        self.ctx.store.commit(batch).await?;

        let priority = priority_for(ConversationType::Group, recipients.len(), false);
        debug!(
            "group {} send by {}: {} recipients at {:?}",
            conv.receive_id,
            req.sender.id,
            recipients.len(),
            priority
        );
        self.ctx
            .publish(
                priority,
                DispatchEvent::GroupFanOut {
                    sender_seq_id: sender_seq.seq_id,
                },
            )
            .await?;
        Ok(sender_seq)
    }

    /// 队列消费入口；必须容忍重复投递 / Queue consumer entry point; tolerates re-delivery
    pub async fn on_dispatch_event(&self, envelope: &DispatchEnvelope) -> Result<()> {
        match &envelope.event {
            DispatchEvent::Deliver { seq_ids } => {
                for seq_id in seq_ids {
                    match self.ctx.store.get_by_seq_id(*seq_id).await? {
                        Some(seq) => self.ctx.push_seq(&seq),
                        None => warn!("序列记录不存在，跳过 / seq {} not found, skip", seq_id),
                    }
                }
                Ok(())
            }
            DispatchEvent::GroupFanOut { sender_seq_id } => {
                self.fan_out_group(*sender_seq_id).await.map(|_| ())
            }
        }
    }

    /// 为群成员批量生成接收方记录，可整体重试
    /// Create one receiver record per group member; safe to re-run wholesale
    pub async fn fan_out_group(&self, sender_seq_id: i64) -> Result<Vec<SequenceRecord>> {
        let sender_seq = self
            .ctx
            .store
            .get_by_seq_id(sender_seq_id)
            .await?
            .ok_or_else(|| SeqError::message_not_found(sender_seq_id.to_string()))?;
        let magic = sender_seq.magic_message_id.clone();

        // 与撤回、编辑共用一把锁，锁内重新读取发送方记录与消息体
        // shares the lock with revoke and edit; both records are re-read under it
        let ttl = std::time::Duration::from_millis(self.ctx.config.lock.ttl_ms);
        let ctx = Arc::clone(&self.ctx);
        let created = self
            .ctx
            .locker
            .with_lock(&message_lock_key(&magic), ttl, || async move {
                let sender_seq = ctx
                    .store
                    .get_by_seq_id(sender_seq_id)
                    .await?
                    .ok_or_else(|| SeqError::message_not_found(sender_seq_id.to_string()))?;
                let message = ctx
                    .store
                    .get_by_magic_message_id(&sender_seq.magic_message_id)
                    .await?
                    .ok_or_else(|| SeqError::message_not_found(sender_seq.magic_message_id.clone()))?;
                if message.receive_type != ConversationType::Group {
                    return Err(SeqError::conversation_type(message.receive_type.as_str()));
                }
                fan_out_locked(&ctx, &sender_seq, &message).await
            })
            .await?;
        info!(
            "📣 群消息扇出完成 / fan-out of {} produced {} records",
            magic,
            created.len()
        );
        Ok(created)
    }

    /// 单聊落库：消息体 + 发送方 + 接收方，同一事务（流式起始共用）
    /// Direct-chat persistence in one transaction; shared with stream start
    pub(crate) async fn persist_direct(
        &self,
        sender: &Identity,
        conv: &Conversation,
        message: MessageRecord,
        refer: &ReferMap,
        sender_refer: Option<&str>,
        extra: SeqExtra,
    ) -> Result<(SequenceRecord, SequenceRecord)> {
        let peer = peer_of(conv)?;
        let peer_conv = self
            .ctx
            .directory
            .get_or_create_conversation(
                &peer,
                &sender.id,
                ConversationType::from(sender.kind),
                &sender.organization_code,
            )
            .await?;

        let mut sender_seq = self.ctx.draft_seq(
            sender,
            &conv.id,
            &message.magic_message_id,
            message.message_type,
            &message.app_message_id,
            MessageStatus::Read,
        );
        sender_seq.refer_message_id = own_refer(refer, &sender.id, sender_refer);
        sender_seq.receive_list = Some(ReceiveList::unread([peer.id.clone()]));
        sender_seq.extra = extra.clone();

        let mut receiver_seq = self.ctx.draft_seq(
            &peer,
            &peer_conv.id,
            &message.magic_message_id,
            message.message_type,
            &message.app_message_id,
            MessageStatus::Unread,
        );
        receiver_seq.refer_message_id = refer.for_owner(&peer.id);
        receiver_seq.sender_message_id = Some(sender_seq.message_id.clone());
        receiver_seq.extra = extra;

        let mut batch = WriteBatch::new();
        batch
            .create_message(message)
            .create_sequence(sender_seq.clone())
            .create_sequence(receiver_seq.clone());
        self.ctx.store.commit(batch).await?;

        reopen_if_hidden(&self.ctx, &peer_conv).await;
        Ok((sender_seq, receiver_seq))
    }

    // 幂等检查失败时放行 / fails open when the check itself errors
    async fn already_sent(&self, req: &SendRequest) -> Result<Option<SequenceRecord>> {
        if req.app_message_id.is_empty() {
            return Ok(None);
        }
        match self.ctx.store.is_already_sent(&req.app_message_id, &[]).await {
            Ok(true) => Ok(self
                .ctx
                .store
                .get_by_app_message_id(&req.sender.id, &req.app_message_id)
                .await?),
            Ok(false) => Ok(None),
            Err(e) => {
                warn!("⚠️ 幂等检查失败，按未发送处理 / duplicate check failed, treating as new: {}", e);
                Ok(None)
            }
        }
    }

    pub(crate) fn new_message(&self, req: &SendRequest, conv: &Conversation) -> MessageRecord {
        MessageRecord {
            magic_message_id: self.ctx.ids.new_magic_id(),
            sender_id: req.sender.id.clone(),
            sender_type: req.sender.kind,
            sender_organization_code: req.sender.organization_code.clone(),
            receive_id: conv.receive_id.clone(),
            receive_type: conv.receive_type,
            receive_organization_code: conv.receive_organization_code.clone(),
            app_message_id: req.app_message_id.clone(),
            message_type: req.content.message_type(),
            content: req.content.clone(),
            send_time: now_ms(),
            language: req.language.clone(),
            current_version_id: None,
        }
    }
}

async fn fan_out_locked(
    ctx: &ServiceContext,
    sender_seq: &SequenceRecord,
    message: &MessageRecord,
) -> Result<Vec<SequenceRecord>> {
    let group_id = &message.receive_id;
    // 已有记录的成员跳过，保证重跑幂等 / members that already hold a record are skipped
    let existing: HashSet<String> = ctx
        .store
        .get_minimum_per_recipient(&sender_seq.magic_message_id)
        .await?
        .into_keys()
        .collect();
    let members: Vec<Identity> = ctx
        .directory
        .group_members(group_id)
        .await?
        .into_iter()
        .filter(|m| m.id != sender_seq.object_id && !existing.contains(&m.id))
        .collect();
    if members.is_empty() {
        return Ok(Vec::new());
    }
    let refer = ReferMap::build(ctx.store.as_ref(), sender_seq.refer_message_id.as_deref()).await?;
    // 扇出前已撤回的消息，成员拿到的记录同样是终态
    // a message revoked before fan-out reaches members already revoked
    let status = if sender_seq.status == MessageStatus::Revoked {
        MessageStatus::Revoked
    } else {
        MessageStatus::Unread
    };

    let mut created = Vec::with_capacity(members.len());
    for chunk in members.chunks(ctx.config.fanout.batch_size.max(1)) {
        let mut batch = WriteBatch::new();
        let mut chunk_seqs = Vec::with_capacity(chunk.len());
        for member in chunk {
            let conv = ctx
                .directory
                .get_or_create_conversation(
                    member,
                    group_id,
                    ConversationType::Group,
                    &message.receive_organization_code,
                )
                .await?;
            reopen_if_hidden(ctx, &conv).await;
            let mut seq = ctx.draft_seq(
                member,
                &conv.id,
                &sender_seq.magic_message_id,
                sender_seq.message_type,
                &sender_seq.app_message_id,
                status,
            );
            seq.refer_message_id = refer.for_owner(&member.id);
            seq.sender_message_id = Some(sender_seq.message_id.clone());
            // 含编辑标记 / carries the edit marker when the message was edited first
            seq.extra = sender_seq.extra.clone();
            batch.create_sequence(seq.clone());
            chunk_seqs.push(seq);
        }
        ctx.store.commit(batch).await?;
        for seq in &chunk_seqs {
            ctx.push_seq(seq);
        }
        created.extend(chunk_seqs);
    }
    // 同步发送者的其他设备 / sync the sender's other devices
    ctx.push_seq(sender_seq);
    Ok(created)
}

/// 隐藏的会话收到新消息时恢复显示 / A hidden window reappears when a message lands in it
pub(crate) async fn reopen_if_hidden(ctx: &ServiceContext, conv: &Conversation) {
    if conv.status != ConversationStatus::Hidden {
        return;
    }
    if let Err(e) = ctx
        .directory
        .update_status(&conv.id, ConversationStatus::Normal)
        .await
    {
        warn!("恢复会话显示失败 / reopening conversation {} failed: {}", conv.id, e);
    }
}

fn own_refer(refer: &ReferMap, owner: &str, fallback: Option<&str>) -> Option<String> {
    refer
        .for_owner(owner)
        .or_else(|| fallback.filter(|r| !r.is_empty()).map(str::to_string))
}
