//! 持久化有序存储 / Durable ordered store
//!
//! 序列记录与消息体的唯一事实来源；缓存永远可以由此重建。
//! Single source of truth for sequence records and messages; caches are always rebuildable from it.

use async_trait::async_trait;
use std::collections::HashMap;

use crate::domain::{
    MessageContent, MessageRecord, MessageStatus, MessageType, MessageVersion, ReceiveList,
    SeqExtra, SequencePatch, SequenceRecord,
};

pub mod error;
pub mod sled_store;

pub use error::{describe_error, StoreError, StoreResult};
pub use sled_store::SledStore;

/// 事务内的一次写操作 / One write inside an atomic batch
#[derive(Debug, Clone)]
pub enum WriteOp {
    /// 已存在同 magic ID 的消息时保持原样 / Left untouched when the magic id already exists
    CreateMessage(MessageRecord),
    /// 只追加，seq_id 重复即冲突 / Append-only; a duplicate seq id is a conflict
    CreateSequence(SequenceRecord),
    CreateVersion(MessageVersion),
    UpdateMessage(MessageRecord),
    PatchSequence { seq_id: i64, patch: SequencePatch },
}

/// 原子写批次：要么全部生效，要么全部不生效
/// Atomic write set: all of it lands or none of it does
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<WriteOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create_message(&mut self, message: MessageRecord) -> &mut Self {
        self.ops.push(WriteOp::CreateMessage(message));
        self
    }

    pub fn create_sequence(&mut self, seq: SequenceRecord) -> &mut Self {
        self.ops.push(WriteOp::CreateSequence(seq));
        self
    }

    pub fn create_version(&mut self, version: MessageVersion) -> &mut Self {
        self.ops.push(WriteOp::CreateVersion(version));
        self
    }

    pub fn update_message(&mut self, message: MessageRecord) -> &mut Self {
        self.ops.push(WriteOp::UpdateMessage(message));
        self
    }

    pub fn patch_sequence(&mut self, seq_id: i64, patch: SequencePatch) -> &mut Self {
        self.ops.push(WriteOp::PatchSequence { seq_id, patch });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn into_ops(self) -> Vec<WriteOp> {
        self.ops
    }
}

/// 序列记录存储 / Sequence store
#[async_trait]
pub trait SequenceStore: Send + Sync {
    async fn create_sequence(&self, seq: SequenceRecord) -> StoreResult<SequenceRecord>;

    /// 单次调用全部成功或全部失败 / All-or-nothing per call
    async fn batch_create_sequences(&self, seqs: Vec<SequenceRecord>) -> StoreResult<Vec<SequenceRecord>>;

    async fn get_by_seq_id(&self, seq_id: i64) -> StoreResult<Option<SequenceRecord>>;

    /// 按序列消息 ID 查找 / Look up by the sequence's message id
    async fn get_by_message_id(&self, message_id: &str) -> StoreResult<Option<SequenceRecord>>;

    async fn get_by_app_message_id(
        &self,
        object_id: &str,
        app_message_id: &str,
    ) -> StoreResult<Option<SequenceRecord>>;

    /// 某接收者下引用给定消息的记录 / Records of one owner referring to a message id
    async fn get_by_refer_message_id(
        &self,
        object_id: &str,
        refer_message_id: &str,
    ) -> StoreResult<Vec<SequenceRecord>>;

    /// 发送方与所有接收方关于同一逻辑消息的记录（按 seq_id 升序）
    /// Sender and receiver records of one logical message, ascending by seq id
    async fn get_both_sides_by_magic_message_id(&self, magic_message_id: &str) -> StoreResult<Vec<SequenceRecord>>;

    /// 每个接收者仅返回 seq_id 最小的一条 / Only the lowest seq id per owner
    async fn get_minimum_per_recipient(
        &self,
        magic_message_id: &str,
    ) -> StoreResult<HashMap<String, SequenceRecord>>;

    async fn update_status(&self, seq_ids: &[i64], status: MessageStatus) -> StoreResult<usize>;

    async fn update_receive_list(&self, seq_id: i64, list: ReceiveList) -> StoreResult<()>;

    async fn update_extra(&self, seq_id: i64, extra: SeqExtra) -> StoreResult<()>;
}

/// 消息体存储 / Message store
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_message(&self, message: MessageRecord) -> StoreResult<MessageRecord>;

    async fn get_by_magic_message_id(&self, magic_message_id: &str) -> StoreResult<Option<MessageRecord>>;

    async fn get_message_by_app_message_id(&self, app_message_id: &str) -> StoreResult<Option<MessageRecord>>;

    /// 写入新版本并覆盖当前内容 / Insert the version and overwrite the live content
    async fn update_content_and_version(
        &self,
        message: &MessageRecord,
        version: &MessageVersion,
    ) -> StoreResult<MessageRecord>;

    /// 将当前内容归档为一个版本 / Archive the live content as a version
    async fn archive_version(&self, message: &MessageRecord, version_id: i64) -> StoreResult<MessageVersion>;

    /// 覆盖当前内容（流式检查点）/ Overwrite live content (stream checkpoints)
    async fn update_content(&self, magic_message_id: &str, content: MessageContent) -> StoreResult<()>;

    async fn list_versions(&self, magic_message_id: &str) -> StoreResult<Vec<MessageVersion>>;

    /// `filter` 为空表示不限类型 / An empty filter accepts every type
    async fn is_already_sent(&self, app_message_id: &str, filter: &[MessageType]) -> StoreResult<bool>;
}

/// 支持原子多行写入的持久化存储 / Durable store with atomic multi-row writes
#[async_trait]
pub trait DurableStore: SequenceStore + MessageStore {
    async fn commit(&self, batch: WriteBatch) -> StoreResult<()>;
}
