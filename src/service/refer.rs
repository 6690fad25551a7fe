use std::collections::HashMap;
use tracing::warn;

use crate::error::Result;
use crate::storage::{DurableStore, SequenceStore};

/// 引用消息的逐接收者改写表 / Per-recipient rewrite table for a referenced message
///
/// 同一逻辑消息在每个参与者处的 `message_id` 不同，回复时需换成接收者自己的 ID。
/// Every participant holds a different `message_id` for the same logical message,
/// so a reply's reference is rewritten to the recipient's own id.
#[derive(Debug, Clone, Default)]
pub struct ReferMap {
    by_owner: HashMap<String, String>,
}

impl ReferMap {
    pub fn empty() -> Self {
        Self::default()
    }

    /// 每次分发构建一次 / Built once per dispatch
    ///
    /// `refer_message_id` 是发送者自己看到的 message_id。
    /// `refer_message_id` is the id as the sender sees it.
    pub async fn build(store: &dyn DurableStore, refer_message_id: Option<&str>) -> Result<Self> {
        let Some(refer) = refer_message_id.filter(|r| !r.is_empty()) else {
            return Ok(Self::empty());
        };
        let Some(referenced) = store.get_by_message_id(refer).await? else {
            warn!("引用的消息不存在 / referenced message {} not found", refer);
            return Ok(Self::empty());
        };
        let by_owner = store
            .get_minimum_per_recipient(&referenced.magic_message_id)
            .await?
            .into_iter()
            .map(|(owner, seq)| (owner, seq.message_id))
            .collect();
        Ok(Self { by_owner })
    }

    /// 某接收者视角下的引用 ID / The reference as seen by `owner`
    pub fn for_owner(&self, owner: &str) -> Option<String> {
        self.by_owner.get(owner).cloned()
    }

    pub fn len(&self) -> usize {
        self.by_owner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_owner.is_empty()
    }
}
