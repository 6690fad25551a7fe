//! 流式消息组装 / Streaming assembler
//!
//! `Start -> Processing (n) -> Completed`。片段在临时缓存中累积，
//! 锁内只做合并与缓存写入，推送与检查点落库都在释放锁之后。
//! Fragments accumulate in the ephemeral cache. The merge lock covers merge and cache write only;
//! pushes happen after release, and a due checkpoint re-takes the lock for its durable write.

use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{now_ms, Dispatcher, ReferMap, ServiceContext};
use super::dispatcher::SendRequest;
use crate::domain::{
    merge_fragment, Identity, MessageContent, MessageRecord, PushPayload, SeqExtra,
    SequenceRecord, StreamCache, StreamCapable, StreamStatus,
};
use crate::error::{Result, SeqError};
use crate::storage::{MessageStore, SequenceStore};

/// 流式消息起始参数 / Parameters of a stream start
#[derive(Debug, Clone)]
pub struct StreamStart {
    pub sender: Identity,
    pub conversation_id: String,
    pub app_message_id: String,
    /// 初始内容，可为空壳 / Seed content, may be an empty shell
    pub content: MessageContent,
}

impl StreamStart {
    pub fn new(
        sender: Identity,
        conversation_id: impl Into<String>,
        app_message_id: impl Into<String>,
        content: MessageContent,
    ) -> Self {
        Self {
            sender,
            conversation_id: conversation_id.into(),
            app_message_id: app_message_id.into(),
            content,
        }
    }
}

// 一次片段合并后的结果 / outcome of one merge under the lock
struct Merged {
    cache: StreamCache,
    checkpoint: bool,
}

pub struct StreamAssembler {
    ctx: Arc<ServiceContext>,
    dispatcher: Arc<Dispatcher>,
}

impl StreamAssembler {
    pub fn new(ctx: Arc<ServiceContext>, dispatcher: Arc<Dispatcher>) -> Self {
        Self { ctx, dispatcher }
    }

    /// 开始一条流式消息，返回发送方记录；接收方立即收到占位记录
    /// Start a stream and return the sender's record; the receiver gets a placeholder at once
    pub async fn start(&self, start: StreamStart) -> Result<SequenceRecord> {
        let conv = self
            .ctx
            .owned_conversation(&start.sender, &start.conversation_id)
            .await?;
        if !conv.receive_type.is_direct() {
            return Err(SeqError::conversation_type(conv.receive_type.as_str()));
        }
        let body = start.content.stream_body()?;

        if let Some(existing) = self
            .ctx
            .store
            .get_by_app_message_id(&start.sender.id, &start.app_message_id)
            .await?
        {
            info!("♻️ 流式消息已开始 / stream {} already started", start.app_message_id);
            return Ok(existing);
        }

        let req = SendRequest::new(start.sender.clone(), &conv.id, start.content.clone())
            .with_app_message_id(&start.app_message_id);
        let message = self.dispatcher.new_message(&req, &conv);
        let extra = SeqExtra {
            topic_id: conv.extra.default_topic_id.clone(),
            ..SeqExtra::default()
        };
        let (sender_seq, receiver_seq) = self
            .dispatcher
            .persist_direct(&start.sender, &conv, message, &ReferMap::empty(), None, extra)
            .await?;

        let cache = StreamCache {
            app_message_id: start.app_message_id.clone(),
            sender_message_id: sender_seq.message_id.clone(),
            receive_message_id: receiver_seq.message_id.clone(),
            receive_id: receiver_seq.object_id.clone(),
            receive_magic_id: receiver_seq.magic_message_id.clone(),
            magic_message_id: sender_seq.magic_message_id.clone(),
            message_type: start.content.message_type(),
            content: body,
            last_checkpoint_time: now_ms(),
        };
        self.save(&cache).await?;

        self.ctx.push_seq(&receiver_seq);
        self.ctx.push_seq(&sender_seq);
        info!(
            "🌊 流式消息开始 / stream {} started ({})",
            start.app_message_id, sender_seq.magic_message_id
        );
        Ok(sender_seq)
    }

    /// 追加一个片段，只推送该片段本身 / Append a fragment and push only that fragment
    pub async fn append(&self, app_message_id: &str, fragment: Map<String, Value>) -> Result<()> {
        let interval = self.ctx.config.checkpoint_interval();
        let incoming = &fragment;
        let merged = self
            .ctx
            .locker
            .with_lock(&lock_key(app_message_id), self.lock_ttl(), || async move {
                let mut cache = self.load(app_message_id).await?;
                merge_fragment(&mut cache.content, incoming);
                let now = now_ms();
                let checkpoint = now - cache.last_checkpoint_time >= interval.as_millis() as i64;
                if checkpoint {
                    cache.last_checkpoint_time = now;
                }
                self.save(&cache).await?;
                Ok(Merged { cache, checkpoint })
            })
            .await?;

        let cache = merged.cache;
        self.ctx.push.submit(
            &cache.receive_id,
            PushPayload::Stream {
                app_message_id: cache.app_message_id.clone(),
                receive_message_id: cache.receive_message_id.clone(),
                status: StreamStatus::Processing,
                content: fragment,
            },
        );

        if merged.checkpoint {
            // 检查点失败不影响流继续，完成时会整体落库 / a failed checkpoint is recovered on completion
            match self.checkpoint(app_message_id).await {
                Ok(true) => debug!("💾 stream {} checkpointed", app_message_id),
                Ok(false) => debug!("stream {} completed before its checkpoint, skipped", app_message_id),
                Err(e) => warn!("流式检查点写入失败 / checkpoint of {} failed: {}", app_message_id, e),
            }
        }
        Ok(())
    }

    /// 重新持锁写检查点：写入的是锁内最新的累积内容，缓存已删除（流已完成）则跳过
    /// Checkpoint under the lock again; writes the latest accumulated content and
    /// skips once the cache is gone, so a finished message is never overwritten
    async fn checkpoint(&self, app_message_id: &str) -> Result<bool> {
        self.ctx
            .locker
            .with_lock(&lock_key(app_message_id), self.lock_ttl(), || async move {
                match self.try_load(app_message_id).await? {
                    Some(cache) => {
                        self.persist(&cache).await?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            })
            .await
    }

    /// 完成流式消息：最终落库、删除缓存、推送完整内容
    /// Complete the stream: final write, drop the cache, push the full content once
    pub async fn complete(
        &self,
        app_message_id: &str,
        fragment: Option<Map<String, Value>>,
    ) -> Result<MessageRecord> {
        let cache = self
            .ctx
            .locker
            .with_lock(&lock_key(app_message_id), self.lock_ttl(), || async move {
                let mut cache = self.load(app_message_id).await?;
                if let Some(fragment) = &fragment {
                    merge_fragment(&mut cache.content, fragment);
                }
                self.persist(&cache).await?;
                if let Err(e) = self.ctx.cache.delete(&StreamCache::cache_key(app_message_id)).await {
                    warn!("删除流式缓存失败 / dropping stream cache {} failed: {}", app_message_id, e);
                }
                Ok(cache)
            })
            .await?;

        self.ctx.push.submit(
            &cache.receive_id,
            PushPayload::Stream {
                app_message_id: cache.app_message_id.clone(),
                receive_message_id: cache.receive_message_id.clone(),
                status: StreamStatus::Completed,
                content: cache.content.clone(),
            },
        );
        info!("✅ 流式消息完成 / stream {} completed", app_message_id);

        self.ctx
            .store
            .get_by_magic_message_id(&cache.magic_message_id)
            .await?
            .ok_or_else(|| SeqError::message_not_found(cache.magic_message_id.clone()))
    }

    async fn load(&self, app_message_id: &str) -> Result<StreamCache> {
        self.try_load(app_message_id)
            .await?
            .ok_or_else(|| SeqError::stream_not_found(app_message_id))
    }

    async fn try_load(&self, app_message_id: &str) -> Result<Option<StreamCache>> {
        match self.ctx.cache.get(&StreamCache::cache_key(app_message_id)).await? {
            Some(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| SeqError::Internal(e.into())),
            None => Ok(None),
        }
    }

    async fn save(&self, cache: &StreamCache) -> Result<()> {
        let raw = serde_json::to_string(cache).map_err(|e| SeqError::Internal(e.into()))?;
        self.ctx
            .cache
            .set(
                &StreamCache::cache_key(&cache.app_message_id),
                raw,
                self.ctx.config.stream_cache_ttl(),
            )
            .await?;
        Ok(())
    }

    async fn persist(&self, cache: &StreamCache) -> Result<()> {
        let content = MessageContent::from_stream_body(cache.message_type, cache.content.clone())?;
        self.ctx
            .store
            .update_content(&cache.magic_message_id, content)
            .await
            .map_err(|e| SeqError::write_failed(e.to_string()))
    }

    fn lock_ttl(&self) -> Duration {
        Duration::from_millis(self.ctx.config.lock.ttl_ms)
    }
}

fn lock_key(app_message_id: &str) -> String {
    format!("stream:{}", app_message_id)
}
