use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError, TransactionalTree,
};
use sled::{Db, IVec, Transactional, Tree};
use std::collections::HashMap;
use tracing::debug;

use super::error::{StoreError, StoreResult};
use super::{DurableStore, MessageStore, SequenceStore, WriteBatch, WriteOp};
use crate::domain::{
    MessageContent, MessageRecord, MessageStatus, MessageType, MessageVersion, ReceiveList,
    SeqExtra, SequencePatch, SequenceRecord,
};

// 复合键分隔符 / separator inside composite keys
const SEP: char = '\u{1f}';

/// 基于 sled 的持久化有序存储 / Durable ordered store backed by sled
#[derive(Clone, Debug)]
pub struct SledStore {
    db: Db,
    sequences: Tree,      // seq_id(BE) -> SequenceRecord
    seq_by_message: Tree, // message_id -> seq_id
    seq_by_magic: Tree,   // magic \x1f seq_id -> seq_id
    seq_by_app: Tree,     // object_id \x1f app_message_id \x1f seq_id -> seq_id
    seq_by_refer: Tree,   // object_id \x1f refer_message_id \x1f seq_id -> seq_id
    messages: Tree,       // magic -> MessageRecord
    message_by_app: Tree, // app_message_id -> magic
    versions: Tree,       // magic \x1f version_id -> MessageVersion
}

// 事务视图：与 SledStore 的树一一对应 / transactional view over every tree
struct TxTrees<'a> {
    sequences: &'a TransactionalTree,
    seq_by_message: &'a TransactionalTree,
    seq_by_magic: &'a TransactionalTree,
    seq_by_app: &'a TransactionalTree,
    seq_by_refer: &'a TransactionalTree,
    messages: &'a TransactionalTree,
    message_by_app: &'a TransactionalTree,
    versions: &'a TransactionalTree,
}

type TxResult<T> = ConflictableTransactionResult<T, StoreError>;

fn abort<T>(e: StoreError) -> TxResult<T> {
    Err(ConflictableTransactionError::Abort(e))
}

fn seq_key(seq_id: i64) -> [u8; 8] {
    seq_id.to_be_bytes()
}

fn seq_from_bytes(bytes: &[u8]) -> StoreResult<i64> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| StoreError::Tx(format!("corrupt seq index value ({} bytes)", bytes.len())))?;
    Ok(i64::from_be_bytes(raw))
}

// 零填充保证字典序等于数值序 / zero padding keeps lexical order equal to numeric order
fn magic_key(magic: &str, seq_id: i64) -> String {
    format!("{}{}{:020}", magic, SEP, seq_id)
}

fn owner_key(object_id: &str, value: &str, seq_id: i64) -> String {
    format!("{}{}{}{}{:020}", object_id, SEP, value, SEP, seq_id)
}

fn owner_prefix(object_id: &str, value: &str) -> String {
    format!("{}{}{}{}", object_id, SEP, value, SEP)
}

fn version_key(magic: &str, version_id: i64) -> String {
    format!("{}{}{:020}", magic, SEP, version_id)
}

fn encode<T: Serialize>(value: &T) -> TxResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| ConflictableTransactionError::Abort(StoreError::Serde(e)))
}

fn decode<T: DeserializeOwned>(bytes: &IVec) -> TxResult<T> {
    serde_json::from_slice(bytes).map_err(|e| ConflictableTransactionError::Abort(StoreError::Serde(e)))
}

impl SledStore {
    pub fn open(path: &str) -> StoreResult<Self> {
        let db = sled::open(path)?;
        Self::with_db(db)
    }

    /// 临时库，进程退出即删除 / Temporary database removed on drop
    pub fn open_temporary() -> StoreResult<Self> {
        let db = sled::Config::new().temporary(true).open()?;
        Self::with_db(db)
    }

    fn with_db(db: Db) -> StoreResult<Self> {
        Ok(Self {
            sequences: db.open_tree("sequences")?,
            seq_by_message: db.open_tree("seq_by_message")?,
            seq_by_magic: db.open_tree("seq_by_magic")?,
            seq_by_app: db.open_tree("seq_by_app")?,
            seq_by_refer: db.open_tree("seq_by_refer")?,
            messages: db.open_tree("messages")?,
            message_by_app: db.open_tree("message_by_app")?,
            versions: db.open_tree("versions")?,
            db,
        })
    }

    fn load_seq(&self, seq_id: i64) -> StoreResult<Option<SequenceRecord>> {
        match self.sequences.get(seq_key(seq_id))? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    // 按索引前缀依次加载序列记录（按 seq_id 升序）
    // load sequence records behind an index prefix, ascending by seq id
    fn load_by_index(&self, index: &Tree, prefix: &str) -> StoreResult<Vec<SequenceRecord>> {
        let mut res = Vec::new();
        for item in index.scan_prefix(prefix.as_bytes()) {
            let (_k, v) = item?;
            if let Some(seq) = self.load_seq(seq_from_bytes(&v)?)? {
                res.push(seq);
            }
        }
        Ok(res)
    }

    fn load_message(&self, magic_message_id: &str) -> StoreResult<Option<MessageRecord>> {
        match self.messages.get(magic_message_id.as_bytes())? {
            Some(v) => Ok(Some(serde_json::from_slice(&v)?)),
            None => Ok(None),
        }
    }

    fn apply_op(tx: &TxTrees<'_>, op: &WriteOp, now: i64) -> TxResult<()> {
        match op {
            WriteOp::CreateMessage(message) => {
                let key = message.magic_message_id.as_bytes();
                if tx.messages.get(key)?.is_some() {
                    return Ok(());
                }
                tx.messages.insert(key, encode(message)?)?;
                let app_key = message.app_message_id.as_bytes();
                if !message.app_message_id.is_empty() && tx.message_by_app.get(app_key)?.is_none() {
                    tx.message_by_app.insert(app_key, key)?;
                }
            }
            WriteOp::CreateSequence(seq) => {
                let key = seq_key(seq.seq_id);
                if tx.sequences.get(key)?.is_some() {
                    return abort(StoreError::Conflict(format!("seq_id {}", seq.seq_id)));
                }
                if tx.seq_by_message.get(seq.message_id.as_bytes())?.is_some() {
                    return abort(StoreError::Conflict(format!("message_id {}", seq.message_id)));
                }
                tx.sequences.insert(&key[..], encode(seq)?)?;
                tx.seq_by_message.insert(seq.message_id.as_bytes(), &key[..])?;
                tx.seq_by_magic
                    .insert(magic_key(&seq.magic_message_id, seq.seq_id).as_bytes(), &key[..])?;
                if !seq.app_message_id.is_empty() {
                    tx.seq_by_app.insert(
                        owner_key(&seq.object_id, &seq.app_message_id, seq.seq_id).as_bytes(),
                        &key[..],
                    )?;
                }
                if let Some(refer) = &seq.refer_message_id {
                    tx.seq_by_refer
                        .insert(owner_key(&seq.object_id, refer, seq.seq_id).as_bytes(), &key[..])?;
                }
            }
            WriteOp::CreateVersion(version) => {
                let key = version_key(&version.magic_message_id, version.version_id);
                if tx.versions.get(key.as_bytes())?.is_some() {
                    return abort(StoreError::Conflict(format!("version {}", version.version_id)));
                }
                tx.versions.insert(key.as_bytes(), encode(version)?)?;
            }
            WriteOp::UpdateMessage(message) => {
                let key = message.magic_message_id.as_bytes();
                if tx.messages.get(key)?.is_none() {
                    return abort(StoreError::NotFound(message.magic_message_id.clone()));
                }
                tx.messages.insert(key, encode(message)?)?;
            }
            WriteOp::PatchSequence { seq_id, patch } => {
                let key = seq_key(*seq_id);
                let current = match tx.sequences.get(key)? {
                    Some(v) => v,
                    None => return abort(StoreError::NotFound(format!("seq_id {}", seq_id))),
                };
                let mut seq: SequenceRecord = decode(&current)?;
                patch.apply(&mut seq, now);
                tx.sequences.insert(&key[..], encode(&seq)?)?;
            }
        }
        Ok(())
    }

    fn commit_ops(&self, ops: &[WriteOp]) -> StoreResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let now = chrono::Utc::now().timestamp_millis();
        let result = (
            &self.sequences,
            &self.seq_by_message,
            &self.seq_by_magic,
            &self.seq_by_app,
            &self.seq_by_refer,
            &self.messages,
            &self.message_by_app,
            &self.versions,
        )
            .transaction(
                |(sequences, seq_by_message, seq_by_magic, seq_by_app, seq_by_refer, messages, message_by_app, versions)|
                 -> TxResult<()> {
                    let tx = TxTrees {
                        sequences,
                        seq_by_message,
                        seq_by_magic,
                        seq_by_app,
                        seq_by_refer,
                        messages,
                        message_by_app,
                        versions,
                    };
                    for op in ops {
                        Self::apply_op(&tx, op, now)?;
                    }
                    Ok(())
                },
            );
        match result {
            Ok(()) => {
                self.db.flush()?;
                debug!("💾 提交写批次 / committed {} ops", ops.len());
                Ok(())
            }
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(StoreError::Sled(e)),
        }
    }
}

#[async_trait]
impl SequenceStore for SledStore {
    async fn create_sequence(&self, seq: SequenceRecord) -> StoreResult<SequenceRecord> {
        self.commit_ops(&[WriteOp::CreateSequence(seq.clone())])?;
        Ok(seq)
    }

    async fn batch_create_sequences(&self, seqs: Vec<SequenceRecord>) -> StoreResult<Vec<SequenceRecord>> {
        let ops: Vec<WriteOp> = seqs.iter().cloned().map(WriteOp::CreateSequence).collect();
        self.commit_ops(&ops)?;
        Ok(seqs)
    }

    async fn get_by_seq_id(&self, seq_id: i64) -> StoreResult<Option<SequenceRecord>> {
        self.load_seq(seq_id)
    }

    async fn get_by_message_id(&self, message_id: &str) -> StoreResult<Option<SequenceRecord>> {
        match self.seq_by_message.get(message_id.as_bytes())? {
            Some(v) => self.load_seq(seq_from_bytes(&v)?),
            None => Ok(None),
        }
    }

    async fn get_by_app_message_id(
        &self,
        object_id: &str,
        app_message_id: &str,
    ) -> StoreResult<Option<SequenceRecord>> {
        let prefix = owner_prefix(object_id, app_message_id);
        Ok(self.load_by_index(&self.seq_by_app, &prefix)?.into_iter().next())
    }

    async fn get_by_refer_message_id(
        &self,
        object_id: &str,
        refer_message_id: &str,
    ) -> StoreResult<Vec<SequenceRecord>> {
        self.load_by_index(&self.seq_by_refer, &owner_prefix(object_id, refer_message_id))
    }

    async fn get_both_sides_by_magic_message_id(&self, magic_message_id: &str) -> StoreResult<Vec<SequenceRecord>> {
        let prefix = format!("{}{}", magic_message_id, SEP);
        self.load_by_index(&self.seq_by_magic, &prefix)
    }

    async fn get_minimum_per_recipient(
        &self,
        magic_message_id: &str,
    ) -> StoreResult<HashMap<String, SequenceRecord>> {
        let mut res: HashMap<String, SequenceRecord> = HashMap::new();
        for seq in self.get_both_sides_by_magic_message_id(magic_message_id).await? {
            // 升序扫描，第一条即最小 / ascending scan, the first hit is the minimum
            res.entry(seq.object_id.clone()).or_insert(seq);
        }
        Ok(res)
    }

    async fn update_status(&self, seq_ids: &[i64], status: MessageStatus) -> StoreResult<usize> {
        let mut ops = Vec::with_capacity(seq_ids.len());
        for seq_id in seq_ids {
            if self.sequences.contains_key(seq_key(*seq_id))? {
                ops.push(WriteOp::PatchSequence {
                    seq_id: *seq_id,
                    patch: SequencePatch::status(status),
                });
            }
        }
        self.commit_ops(&ops)?;
        Ok(ops.len())
    }

    async fn update_receive_list(&self, seq_id: i64, list: ReceiveList) -> StoreResult<()> {
        self.commit_ops(&[WriteOp::PatchSequence {
            seq_id,
            patch: SequencePatch::receive_list(list),
        }])
    }

    async fn update_extra(&self, seq_id: i64, extra: SeqExtra) -> StoreResult<()> {
        self.commit_ops(&[WriteOp::PatchSequence {
            seq_id,
            patch: SequencePatch::extra(extra),
        }])
    }
}

#[async_trait]
impl MessageStore for SledStore {
    async fn create_message(&self, message: MessageRecord) -> StoreResult<MessageRecord> {
        self.commit_ops(&[WriteOp::CreateMessage(message.clone())])?;
        // 已存在时返回原记录 / an existing record wins
        Ok(self.load_message(&message.magic_message_id)?.unwrap_or(message))
    }

    async fn get_by_magic_message_id(&self, magic_message_id: &str) -> StoreResult<Option<MessageRecord>> {
        self.load_message(magic_message_id)
    }

    async fn get_message_by_app_message_id(&self, app_message_id: &str) -> StoreResult<Option<MessageRecord>> {
        match self.message_by_app.get(app_message_id.as_bytes())? {
            Some(magic) => self.load_message(&String::from_utf8_lossy(&magic)),
            None => Ok(None),
        }
    }

    async fn update_content_and_version(
        &self,
        message: &MessageRecord,
        version: &MessageVersion,
    ) -> StoreResult<MessageRecord> {
        let mut updated = message.clone();
        updated.content = version.content.clone();
        updated.message_type = version.message_type;
        updated.current_version_id = Some(version.version_id);
        self.commit_ops(&[
            WriteOp::CreateVersion(version.clone()),
            WriteOp::UpdateMessage(updated.clone()),
        ])?;
        Ok(updated)
    }

    async fn archive_version(&self, message: &MessageRecord, version_id: i64) -> StoreResult<MessageVersion> {
        let version = MessageVersion::new(version_id, &message.magic_message_id, message.content.clone());
        self.commit_ops(&[WriteOp::CreateVersion(version.clone())])?;
        Ok(version)
    }

    async fn update_content(&self, magic_message_id: &str, content: MessageContent) -> StoreResult<()> {
        let mut message = self
            .load_message(magic_message_id)?
            .ok_or_else(|| StoreError::NotFound(magic_message_id.to_string()))?;
        message.message_type = content.message_type();
        message.content = content;
        self.commit_ops(&[WriteOp::UpdateMessage(message)])
    }

    async fn list_versions(&self, magic_message_id: &str) -> StoreResult<Vec<MessageVersion>> {
        let prefix = format!("{}{}", magic_message_id, SEP);
        let mut res = Vec::new();
        for item in self.versions.scan_prefix(prefix.as_bytes()) {
            let (_k, v) = item?;
            res.push(serde_json::from_slice(&v)?);
        }
        Ok(res)
    }

    async fn is_already_sent(&self, app_message_id: &str, filter: &[MessageType]) -> StoreResult<bool> {
        if app_message_id.is_empty() {
            return Ok(false);
        }
        match self.get_message_by_app_message_id(app_message_id).await? {
            Some(message) => Ok(filter.is_empty() || filter.contains(&message.message_type)),
            None => Ok(false),
        }
    }
}

#[async_trait]
impl DurableStore for SledStore {
    async fn commit(&self, batch: WriteBatch) -> StoreResult<()> {
        self.commit_ops(&batch.into_ops())
    }
}

#[async_trait]
impl v::HealthCheck for SledStore {
    async fn check_health(&self) -> v::HealthStatus {
        match self.db.size_on_disk() {
            Ok(_) => v::HealthStatus::healthy("sled_store"),
            Err(e) => v::HealthStatus::unhealthy("sled_store", e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConversationType, ObjectType};
    use v::HealthCheck;

    fn seq(seq_id: i64, object_id: &str, magic: &str) -> SequenceRecord {
        SequenceRecord {
            seq_id,
            object_id: object_id.to_string(),
            object_type: ObjectType::User,
            organization_code: "org".to_string(),
            conversation_id: format!("conv-{}", object_id),
            message_id: format!("msg-{}", seq_id),
            magic_message_id: magic.to_string(),
            refer_message_id: None,
            sender_message_id: None,
            message_type: MessageType::Text,
            content: None,
            receive_list: None,
            status: MessageStatus::Unread,
            extra: SeqExtra::default(),
            app_message_id: format!("app-{}", seq_id),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn message(magic: &str, app: &str) -> MessageRecord {
        MessageRecord {
            magic_message_id: magic.to_string(),
            sender_id: "a".to_string(),
            sender_type: ObjectType::User,
            sender_organization_code: "org".to_string(),
            receive_id: "b".to_string(),
            receive_type: ConversationType::User,
            receive_organization_code: "org".to_string(),
            app_message_id: app.to_string(),
            message_type: MessageType::Text,
            content: MessageContent::text("hi"),
            send_time: 0,
            language: None,
            current_version_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_and_lookup() {
        let store = SledStore::open_temporary().unwrap();
        store.create_sequence(seq(1, "a", "m1")).await.unwrap();
        assert_eq!(store.get_by_seq_id(1).await.unwrap().unwrap().object_id, "a");
        assert_eq!(store.get_by_message_id("msg-1").await.unwrap().unwrap().seq_id, 1);
        assert_eq!(
            store.get_by_app_message_id("a", "app-1").await.unwrap().unwrap().seq_id,
            1
        );
        assert!(store.get_by_message_id("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_create_is_append_only() {
        let store = SledStore::open_temporary().unwrap();
        store.create_sequence(seq(1, "a", "m1")).await.unwrap();
        let err = store.create_sequence(seq(1, "b", "m1")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert_eq!(store.get_by_seq_id(1).await.unwrap().unwrap().object_id, "a");
    }

    #[tokio::test]
    async fn test_batch_create_is_all_or_nothing() {
        let store = SledStore::open_temporary().unwrap();
        store.create_sequence(seq(3, "c", "m1")).await.unwrap();
        let err = store
            .batch_create_sequences(vec![seq(1, "a", "m1"), seq(2, "b", "m1"), seq(3, "x", "m1")])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        assert!(store.get_by_seq_id(1).await.unwrap().is_none());
        assert!(store.get_by_seq_id(2).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_minimum_per_recipient() {
        let store = SledStore::open_temporary().unwrap();
        store
            .batch_create_sequences(vec![
                seq(10, "a", "m1"),
                seq(11, "b", "m1"),
                seq(20, "b", "m1"),
                seq(21, "a", "m1"),
                seq(30, "b", "m2"),
            ])
            .await
            .unwrap();
        let both = store.get_both_sides_by_magic_message_id("m1").await.unwrap();
        assert_eq!(both.iter().map(|s| s.seq_id).collect::<Vec<_>>(), vec![10, 11, 20, 21]);
        let min = store.get_minimum_per_recipient("m1").await.unwrap();
        assert_eq!(min.len(), 2);
        assert_eq!(min["a"].seq_id, 10);
        assert_eq!(min["b"].seq_id, 11);
    }

    #[tokio::test]
    async fn test_status_receive_list_and_extra_updates() {
        let store = SledStore::open_temporary().unwrap();
        store.create_sequence(seq(1, "a", "m1")).await.unwrap();
        assert_eq!(store.update_status(&[1, 99], MessageStatus::Seen).await.unwrap(), 1);
        store
            .update_receive_list(1, ReceiveList::unread(vec!["b".to_string()]))
            .await
            .unwrap();
        store
            .update_extra(1, SeqExtra { topic_id: Some("t".into()), ..SeqExtra::default() })
            .await
            .unwrap();
        let rec = store.get_by_seq_id(1).await.unwrap().unwrap();
        assert_eq!(rec.status, MessageStatus::Seen);
        assert_eq!(rec.receive_list.unwrap().unread_list, vec!["b"]);
        assert_eq!(rec.extra.topic_id.as_deref(), Some("t"));
        let err = store.update_extra(99, SeqExtra::default()).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_refer_index() {
        let store = SledStore::open_temporary().unwrap();
        let mut a = seq(1, "a", "m1");
        a.refer_message_id = Some("orig".into());
        let mut b = seq(2, "a", "m2");
        b.refer_message_id = Some("orig".into());
        store.batch_create_sequences(vec![a, b]).await.unwrap();
        let found = store.get_by_refer_message_id("a", "orig").await.unwrap();
        assert_eq!(found.len(), 2);
        assert!(store.get_by_refer_message_id("b", "orig").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_message_create_is_idempotent_and_versions() {
        let store = SledStore::open_temporary().unwrap();
        let first = store.create_message(message("m1", "app")).await.unwrap();
        let mut second = message("m1", "app");
        second.content = MessageContent::text("changed");
        let kept = store.create_message(second).await.unwrap();
        assert_eq!(kept, first);

        assert!(store.is_already_sent("app", &[]).await.unwrap());
        assert!(store.is_already_sent("app", &[MessageType::Text]).await.unwrap());
        assert!(!store.is_already_sent("app", &[MessageType::Markdown]).await.unwrap());
        assert!(!store.is_already_sent("other", &[]).await.unwrap());

        let v0 = store.archive_version(&first, 100).await.unwrap();
        let v1 = MessageVersion::new(101, "m1", MessageContent::text("edited"));
        let updated = store.update_content_and_version(&first, &v1).await.unwrap();
        assert_eq!(updated.current_version_id, Some(101));
        let stored = store.get_by_magic_message_id("m1").await.unwrap().unwrap();
        assert_eq!(stored.content, MessageContent::text("edited"));
        let versions = store.list_versions("m1").await.unwrap();
        assert_eq!(versions, vec![v0, v1]);
    }

    #[tokio::test]
    async fn test_commit_batch_and_health() {
        let store = SledStore::open_temporary().unwrap();
        let mut batch = WriteBatch::new();
        batch
            .create_message(message("m1", "app"))
            .create_sequence(seq(1, "a", "m1"))
            .patch_sequence(1, SequencePatch::status(MessageStatus::Read));
        store.commit(batch).await.unwrap();
        assert_eq!(store.get_by_seq_id(1).await.unwrap().unwrap().status, MessageStatus::Read);
        assert!(store.check_health().await.healthy);
    }
}
