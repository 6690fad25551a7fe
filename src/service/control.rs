//! 控制消息状态机 / Control-message state machine
//!
//! 已读回执、撤回、编辑均在分布式锁内修改已有记录，并生成新的控制记录通知
//! 对方与操作者的其他设备。每次调用只提交一个写批次、只入队一次。
//! Receipts, revokes and edits mutate existing records under a lock and emit control records
//! for the other party and the operator's other devices. One write batch and one publish per call.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::dispatcher::reopen_if_hidden;
use super::{message_lock_key, now_ms, owner_of, peer_of, ServiceContext};
use crate::domain::{
    ControlContent, ConversationType, DispatchEvent, EditMessageOptions, Identity, MessageContent,
    MessageStatus, MessageType, MessageVersion, ObjectType, PushPayload, SequencePatch,
    SequenceRecord, TopicAction,
};
use crate::error::{Result, SeqError};
use crate::priority::{priority_for, Priority};
use crate::storage::{MessageStore, SequenceStore, WriteBatch};

pub struct ControlService {
    ctx: Arc<ServiceContext>,
}

// 一次回执调用中按会话聚合的 message_id / message ids grouped per conversation
#[derive(Default)]
struct ReceiptGroup {
    owner: Option<Identity>,
    message_ids: Vec<String>,
}

impl ControlService {
    pub fn new(ctx: Arc<ServiceContext>) -> Self {
        Self { ctx }
    }

    /// 标记已查看；已非未读的消息静默跳过
    /// Mark messages seen; anything no longer unread is a silent no-op
    pub async fn seen_messages(&self, operator: &Identity, refer_message_ids: &[String]) -> Result<Vec<SequenceRecord>> {
        self.apply_receipts(operator, refer_message_ids, MessageStatus::Seen).await
    }

    /// 标记已读；仅人类发送的消息需要已读跟踪
    /// Mark messages read; only messages sent by humans track reads
    pub async fn read_messages(&self, operator: &Identity, refer_message_ids: &[String]) -> Result<Vec<SequenceRecord>> {
        self.apply_receipts(operator, refer_message_ids, MessageStatus::Read).await
    }

    async fn apply_receipts(
        &self,
        operator: &Identity,
        refer_message_ids: &[String],
        target: MessageStatus,
    ) -> Result<Vec<SequenceRecord>> {
        let mut candidates: Vec<SequenceRecord> = Vec::new();
        for id in refer_message_ids {
            if candidates.iter().any(|c| &c.message_id == id) {
                continue;
            }
            if let Some(rec) = self.ctx.store.get_by_message_id(id).await? {
                if rec.object_id == operator.id
                    && rec.is_receiver_side()
                    && !rec.message_type.is_control()
                    && rec.status.can_advance_to(target)
                {
                    candidates.push(rec);
                }
            }
        }
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        // 按发送方 message_id 加锁，防止多设备并发改写接收名单
        // lock per sender message id so concurrent devices cannot corrupt the receive list
        let keys: Vec<String> = candidates
            .iter()
            .filter_map(|c| c.sender_message_id.as_ref())
            .map(|m| format!("receipt:{}", m))
            .collect();
        let ttl = Duration::from_millis(self.ctx.config.lock.ttl_ms);
        let guards = self.ctx.locker.acquire_all(&keys, ttl).await?;
        let res = self.apply_receipts_locked(operator, candidates, target).await;
        self.ctx.locker.release_all(guards).await;

        let (created, priority) = res?;
        if created.is_empty() {
            return Ok(created);
        }
        self.ctx
            .publish(
                priority,
                DispatchEvent::Deliver {
                    seq_ids: created.iter().map(|s| s.seq_id).collect(),
                },
            )
            .await?;
        debug!(
            "receipt {:?} by {}: {} control records",
            target,
            operator.id,
            created.len()
        );
        Ok(created)
    }

    async fn apply_receipts_locked(
        &self,
        operator: &Identity,
        candidates: Vec<SequenceRecord>,
        target: MessageStatus,
    ) -> Result<(Vec<SequenceRecord>, Priority)> {
        let store = &self.ctx.store;
        let mut batch = WriteBatch::new();
        let mut priority = Priority::Low;
        let mut operator_groups: BTreeMap<String, ReceiptGroup> = BTreeMap::new();
        let mut sender_groups: BTreeMap<String, ReceiptGroup> = BTreeMap::new();

        for candidate in candidates {
            // 持锁后重读，另一台设备可能已处理 / re-read under the lock, another device may have won
            let Some(fresh) = store.get_by_seq_id(candidate.seq_id).await? else {
                continue;
            };
            if !fresh.status.can_advance_to(target) {
                continue;
            }
            let Some(sender_message_id) = fresh.sender_message_id.as_deref() else {
                continue;
            };
            let Some(sender_seq) = store.get_by_message_id(sender_message_id).await? else {
                continue;
            };
            if target == MessageStatus::Read && sender_seq.object_type != ObjectType::User {
                continue;
            }
            let kind = match store.get_by_magic_message_id(&fresh.magic_message_id).await? {
                Some(message) => message.receive_type,
                None => ConversationType::from(sender_seq.object_type),
            };

            let mut list = sender_seq.receive_list.clone().unwrap_or_default();
            list.mark(&operator.id, target);
            priority = priority.min(priority_for(kind, list.total(), true));
            batch.patch_sequence(fresh.seq_id, SequencePatch::status(target));
            batch.patch_sequence(sender_seq.seq_id, SequencePatch::receive_list(list));

            let group = operator_groups.entry(fresh.conversation_id.clone()).or_default();
            group.owner = Some(operator.clone());
            group.message_ids.push(fresh.message_id.clone());
            let group = sender_groups.entry(sender_seq.conversation_id.clone()).or_default();
            group.owner = Some(owner_of(&sender_seq));
            group.message_ids.push(sender_seq.message_id.clone());
        }
        if operator_groups.is_empty() {
            return Ok((Vec::new(), priority));
        }

        let magic = self.ctx.ids.new_magic_id();
        let message_type = match target {
            MessageStatus::Read => MessageType::ReadMessages,
            _ => MessageType::SeenMessages,
        };
        let mut created = Vec::new();
        for (groups, status) in [
            (operator_groups, MessageStatus::Read),
            (sender_groups, MessageStatus::Unread),
        ] {
            for (conversation_id, group) in groups {
                let Some(owner) = group.owner else { continue };
                let mut seq =
                    self.ctx
                        .draft_seq(&owner, &conversation_id, &magic, message_type, "", status);
                if let [single] = group.message_ids.as_slice() {
                    seq.refer_message_id = Some(single.clone());
                }
                seq.content = Some(match target {
                    MessageStatus::Read => ControlContent::ReadMessages {
                        refer_message_ids: group.message_ids,
                    },
                    _ => ControlContent::SeenMessages {
                        refer_message_ids: group.message_ids,
                    },
                });
                batch.create_sequence(seq.clone());
                created.push(seq);
            }
        }
        store.commit(batch).await?;
        Ok((created, priority))
    }

    /// 撤回消息；仅原发送者可撤回，重复撤回返回已有记录
    /// Revoke a message; only its original sender may, and repeats return the existing record
    pub async fn revoke_message(&self, operator: &Identity, message_id: &str) -> Result<SequenceRecord> {
        let original = self.own_message(operator, message_id).await?;
        let ttl = Duration::from_millis(self.ctx.config.lock.ttl_ms);
        let (own, created, priority) = self
            .ctx
            .locker
            .with_lock(&message_lock_key(&original.magic_message_id), ttl, || {
                self.revoke_locked(operator, original)
            })
            .await?;
        if let Some(priority) = priority {
            self.ctx
                .publish(
                    priority,
                    DispatchEvent::Deliver {
                        seq_ids: created.iter().map(|s| s.seq_id).collect(),
                    },
                )
                .await?;
            info!("🗑️ 消息已撤回 / {} revoked by {}", message_id, operator.id);
        }
        Ok(own)
    }

    async fn revoke_locked(
        &self,
        operator: &Identity,
        original: SequenceRecord,
    ) -> Result<(SequenceRecord, Vec<SequenceRecord>, Option<Priority>)> {
        let store = &self.ctx.store;
        let existing = store
            .get_by_refer_message_id(&operator.id, &original.message_id)
            .await?
            .into_iter()
            .find(|s| s.message_type == MessageType::RevokeMessage);
        if let Some(existing) = existing {
            return Ok((existing, Vec::new(), None));
        }
        let message = store
            .get_by_magic_message_id(&original.magic_message_id)
            .await?
            .ok_or_else(|| SeqError::message_not_found(original.message_id.clone()))?;
        let holders = self.holders_operator_first(&original).await?;

        let magic = self.ctx.ids.new_magic_id();
        let mut batch = WriteBatch::new();
        let mut created: Vec<SequenceRecord> = Vec::with_capacity(holders.len());
        for holder in &holders {
            if holder.status != MessageStatus::Revoked {
                batch.patch_sequence(holder.seq_id, SequencePatch::status(MessageStatus::Revoked));
            }
            let is_operator = holder.object_id == operator.id;
            let mut seq = self.ctx.draft_seq(
                &owner_of(holder),
                &holder.conversation_id,
                &magic,
                MessageType::RevokeMessage,
                "",
                if is_operator { MessageStatus::Read } else { MessageStatus::Unread },
            );
            seq.refer_message_id = Some(holder.message_id.clone());
            seq.content = Some(ControlContent::RevokeMessage {
                refer_message_id: holder.message_id.clone(),
            });
            if !is_operator {
                seq.sender_message_id = created.first().map(|own| own.message_id.clone());
            }
            batch.create_sequence(seq.clone());
            created.push(seq);
        }
        store.commit(batch).await?;

        let own = created
            .first()
            .cloned()
            .ok_or_else(|| SeqError::message_not_found(original.message_id.clone()))?;
        let priority = priority_for(message.receive_type, holders.len().saturating_sub(1), true);
        Ok((own, created, Some(priority)))
    }

    /// 编辑消息：首次编辑归档原始内容并为所有记录打上编辑标记
    /// Edit a message; the first edit archives the original and stamps every record
    pub async fn edit_message(
        &self,
        operator: &Identity,
        message_id: &str,
        content: MessageContent,
    ) -> Result<SequenceRecord> {
        let original = self.own_message(operator, message_id).await?;
        if original.status == MessageStatus::Revoked {
            return Err(SeqError::message_not_found(message_id));
        }
        if !content.message_type().is_editable() {
            return Err(SeqError::message_type(format!(
                "{} cannot be edited",
                content.message_type().as_str()
            )));
        }
        let ttl = Duration::from_millis(self.ctx.config.lock.edit_ttl_ms);
        let (own, created, priority) = self
            .ctx
            .locker
            .with_lock(&message_lock_key(&original.magic_message_id), ttl, || {
                self.edit_locked(operator, original, content)
            })
            .await?;
        self.ctx
            .publish(
                priority,
                DispatchEvent::Deliver {
                    seq_ids: created.iter().map(|s| s.seq_id).collect(),
                },
            )
            .await?;
        Ok(own)
    }

    async fn edit_locked(
        &self,
        operator: &Identity,
        original: SequenceRecord,
        content: MessageContent,
    ) -> Result<(SequenceRecord, Vec<SequenceRecord>, Priority)> {
        let store = &self.ctx.store;
        // 锁外的快照可能已过期：撤回可能先一步提交 / the pre-lock snapshot may predate a revoke
        let original = store
            .get_by_seq_id(original.seq_id)
            .await?
            .filter(|s| s.status != MessageStatus::Revoked)
            .ok_or_else(|| SeqError::message_not_found(original.message_id.clone()))?;
        let magic = original.magic_message_id.clone();
        let message = store
            .get_by_magic_message_id(&magic)
            .await?
            .ok_or_else(|| SeqError::message_not_found(original.message_id.clone()))?;
        if !message.message_type.is_editable() {
            return Err(SeqError::message_type(format!(
                "{} cannot be edited",
                message.message_type.as_str()
            )));
        }

        let now = now_ms();
        let mut batch = WriteBatch::new();
        let version_id;
        if message.current_version_id.is_none() {
            // 首次编辑：归档第 0 版并给所有记录打标记 / first edit: archive version 0 and stamp records
            let archived = MessageVersion::new(self.ctx.ids.next_id(), &magic, message.content.clone());
            batch.create_version(archived);
            version_id = self.ctx.ids.next_id();
            let marker = EditMessageOptions {
                message_version_id: version_id,
                edited_at: now,
            };
            for seq in store.get_both_sides_by_magic_message_id(&magic).await? {
                let mut extra = seq.extra.clone();
                extra.edit_message_options = Some(marker.clone());
                batch.patch_sequence(seq.seq_id, SequencePatch::extra(extra));
            }
        } else {
            version_id = self.ctx.ids.next_id();
        }
        let version = MessageVersion::new(version_id, &magic, content);
        let mut updated = message.clone();
        updated.message_type = version.message_type;
        updated.content = version.content.clone();
        updated.current_version_id = Some(version_id);
        batch.create_version(version).update_message(updated);

        let holders = self.holders_operator_first(&original).await?;
        let marker = EditMessageOptions {
            message_version_id: version_id,
            edited_at: now,
        };
        let mut created: Vec<SequenceRecord> = Vec::with_capacity(holders.len());
        for holder in &holders {
            // 通知记录继承持有者当前状态 / notifications inherit the holder's status
            let mut seq = self.ctx.draft_seq(
                &owner_of(holder),
                &holder.conversation_id,
                &magic,
                MessageType::EditMessage,
                "",
                holder.status,
            );
            seq.refer_message_id = Some(holder.message_id.clone());
            seq.sender_message_id = holder.sender_message_id.clone();
            seq.content = Some(ControlContent::EditMessage {
                refer_message_id: holder.message_id.clone(),
                message_version_id: version_id,
            });
            seq.extra = holder.extra.clone();
            seq.extra.edit_message_options = Some(marker.clone());
            batch.create_sequence(seq.clone());
            created.push(seq);
        }
        store.commit(batch).await?;
        info!(
            "✏️ 消息已编辑 / {} edited by {} (version {})",
            magic, operator.id, version_id
        );

        let own = created
            .first()
            .cloned()
            .ok_or_else(|| SeqError::message_not_found(original.message_id.clone()))?;
        let priority = priority_for(message.receive_type, holders.len().saturating_sub(1), true);
        Ok((own, created, priority))
    }

    /// 正在输入状态：只推送，不落库 / Typing state is pushed only, never persisted
    pub async fn send_typing_state(&self, operator: &Identity, conversation_id: &str, typing: bool) -> Result<()> {
        let conv = self.ctx.owned_conversation(operator, conversation_id).await?;
        if !conv.receive_type.is_direct() {
            return Err(SeqError::conversation_type(conv.receive_type.as_str()));
        }
        let peer = peer_of(&conv)?;
        let peer_conv = self
            .ctx
            .directory
            .get_or_create_conversation(
                &peer,
                &operator.id,
                ConversationType::from(operator.kind),
                &operator.organization_code,
            )
            .await?;
        self.ctx.push.submit(
            &peer.id,
            PushPayload::Intermediate {
                conversation_id: peer_conv.id,
                sender_id: operator.id.clone(),
                content: ControlContent::TypingState { typing },
            },
        );
        Ok(())
    }

    /// 话题变更通知双方 / Notify both sides of a direct chat about a topic change
    pub async fn notify_topic_change(
        &self,
        operator: &Identity,
        conversation_id: &str,
        action: TopicAction,
        topic_id: &str,
        name: Option<String>,
    ) -> Result<Vec<SequenceRecord>> {
        let conv = self.ctx.owned_conversation(operator, conversation_id).await?;
        if !conv.receive_type.is_direct() {
            return Err(SeqError::conversation_type(conv.receive_type.as_str()));
        }
        let peer = peer_of(&conv)?;
        let peer_conv = self
            .ctx
            .directory
            .get_or_create_conversation(
                &peer,
                &operator.id,
                ConversationType::from(operator.kind),
                &operator.organization_code,
            )
            .await?;
        let content = ControlContent::TopicChange {
            action,
            topic_id: topic_id.to_string(),
            name,
        };
        let magic = self.ctx.ids.new_magic_id();

        let mut own = self.ctx.draft_seq(
            operator,
            &conv.id,
            &magic,
            MessageType::TopicChange,
            "",
            MessageStatus::Read,
        );
        own.content = Some(content.clone());
        own.extra.topic_id = Some(topic_id.to_string());

        let mut theirs = self.ctx.draft_seq(
            &peer,
            &peer_conv.id,
            &magic,
            MessageType::TopicChange,
            "",
            MessageStatus::Unread,
        );
        theirs.content = Some(content);
        theirs.sender_message_id = Some(own.message_id.clone());
        theirs.extra.topic_id = Some(topic_id.to_string());

        let mut batch = WriteBatch::new();
        batch.create_sequence(own.clone()).create_sequence(theirs.clone());
        self.ctx.store.commit(batch).await?;
        reopen_if_hidden(&self.ctx, &peer_conv).await;

        self.ctx
            .publish(
                priority_for(conv.receive_type, 1, true),
                DispatchEvent::Deliver {
                    seq_ids: vec![theirs.seq_id, own.seq_id],
                },
            )
            .await?;
        Ok(vec![own, theirs])
    }

    // 仅原发送者自己的聊天记录可被撤回或编辑，否则一律视为不存在
    // only the original sender's own chat record qualifies; anything else reads as not found
    async fn own_message(&self, operator: &Identity, message_id: &str) -> Result<SequenceRecord> {
        match self.ctx.store.get_by_message_id(message_id).await? {
            Some(rec)
                if rec.object_id == operator.id
                    && !rec.is_receiver_side()
                    && !rec.message_type.is_control() =>
            {
                Ok(rec)
            }
            _ => Err(SeqError::message_not_found(message_id)),
        }
    }

    // 每个持有者取最早的一条，操作者排第一 / the earliest record per holder, operator first
    async fn holders_operator_first(&self, original: &SequenceRecord) -> Result<Vec<SequenceRecord>> {
        let mut holders: Vec<SequenceRecord> = self
            .ctx
            .store
            .get_minimum_per_recipient(&original.magic_message_id)
            .await?
            .into_values()
            .collect();
        holders.sort_by_key(|h| (h.object_id != original.object_id, h.seq_id));
        Ok(holders)
    }
}
