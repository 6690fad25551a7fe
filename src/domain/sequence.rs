use serde::{Deserialize, Serialize};

use super::identity::ObjectType;
use super::message::{ControlContent, MessageType};

/// 消息状态（接收方视角）/ Message status from the recipient's point of view
///
/// `Unread -> Seen -> Read`；`Revoked` 任意状态可达且为终态。
/// `Unread -> Seen -> Read`; `Revoked` is reachable from any state and terminal.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Unread,
    Seen,
    Read,
    Revoked,
}

impl MessageStatus {
    fn rank(self) -> u8 {
        match self {
            MessageStatus::Unread => 0,
            MessageStatus::Seen => 1,
            MessageStatus::Read => 2,
            MessageStatus::Revoked => 3,
        }
    }

    /// 状态只能前进，撤回后不可再变 / Status only moves forward; revoked is final
    pub fn can_advance_to(self, next: MessageStatus) -> bool {
        if self == MessageStatus::Revoked {
            return false;
        }
        next.rank() > self.rank()
    }
}

/// 发送方记录上的接收名单 / Recipient lists kept on the sender's own record
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ReceiveList {
    #[serde(default)]
    pub unread_list: Vec<String>,
    #[serde(default)]
    pub seen_list: Vec<String>,
    #[serde(default)]
    pub read_list: Vec<String>,
}

impl ReceiveList {
    pub fn unread(recipients: impl IntoIterator<Item = String>) -> Self {
        let mut unread_list: Vec<String> = Vec::new();
        for id in recipients {
            if !unread_list.contains(&id) {
                unread_list.push(id);
            }
        }
        Self {
            unread_list,
            ..Self::default()
        }
    }

    pub fn total(&self) -> usize {
        self.unread_list.len() + self.seen_list.len() + self.read_list.len()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.unread_list.iter().any(|x| x == id)
            || self.seen_list.iter().any(|x| x == id)
            || self.read_list.iter().any(|x| x == id)
    }

    /// 将接收者移动到目标名单，返回是否发生变化
    /// Move a recipient into the list for `status`; returns whether anything changed
    pub fn mark(&mut self, id: &str, status: MessageStatus) -> bool {
        let target_has = match status {
            MessageStatus::Seen => self.seen_list.iter().any(|x| x == id),
            MessageStatus::Read => self.read_list.iter().any(|x| x == id),
            _ => return false,
        };
        if target_has || self.read_list.iter().any(|x| x == id) {
            return false;
        }
        self.unread_list.retain(|x| x != id);
        match status {
            MessageStatus::Seen => self.seen_list.push(id.to_string()),
            MessageStatus::Read => {
                self.seen_list.retain(|x| x != id);
                self.read_list.push(id.to_string());
            }
            _ => {}
        }
        true
    }

    /// 所有接收者 / Every recipient regardless of state
    pub fn all(&self) -> Vec<String> {
        self.unread_list
            .iter()
            .chain(self.seen_list.iter())
            .chain(self.read_list.iter())
            .cloned()
            .collect()
    }
}

/// 编辑标记 / Edit marker stamped into `extra`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct EditMessageOptions {
    pub message_version_id: i64,
    pub edited_at: i64,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct SeqExtra {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edit_message_options: Option<EditMessageOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
}

/// 序列记录：每个接收者、每个事件一条 / One per recipient per event
///
/// 写入后只允许修改 `status`、`receive_list`、`extra`。
/// Only `status`, `receive_list` and `extra` may change after the record is written.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SequenceRecord {
    pub seq_id: i64,
    pub object_id: String,
    pub object_type: ObjectType,
    pub organization_code: String,
    pub conversation_id: String,
    pub message_id: String,
    pub magic_message_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refer_message_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender_message_id: Option<String>,
    pub message_type: MessageType,
    /// 普通聊天为空（内容在 MessageRecord），控制消息携带载荷
    /// Empty for chat (content lives in MessageRecord), populated for control payloads
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<ControlContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receive_list: Option<ReceiveList>,
    pub status: MessageStatus,
    #[serde(default)]
    pub extra: SeqExtra,
    pub app_message_id: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl SequenceRecord {
    /// 接收方记录（由分发派生）/ Receiver-side record derived by fan-out
    pub fn is_receiver_side(&self) -> bool {
        self.sender_message_id.is_some()
    }
}

/// 允许的序列记录变更 / The only mutations a sequence record accepts
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct SequencePatch {
    pub status: Option<MessageStatus>,
    pub receive_list: Option<ReceiveList>,
    pub extra: Option<SeqExtra>,
}

impl SequencePatch {
    pub fn status(status: MessageStatus) -> Self {
        Self {
            status: Some(status),
            ..Self::default()
        }
    }

    pub fn receive_list(list: ReceiveList) -> Self {
        Self {
            receive_list: Some(list),
            ..Self::default()
        }
    }

    pub fn extra(extra: SeqExtra) -> Self {
        Self {
            extra: Some(extra),
            ..Self::default()
        }
    }

    pub fn apply(&self, record: &mut SequenceRecord, now: i64) {
        if let Some(status) = self.status {
            record.status = status;
        }
        if let Some(list) = &self.receive_list {
            record.receive_list = Some(list.clone());
        }
        if let Some(extra) = &self.extra {
            record.extra = extra.clone();
        }
        record.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_only_moves_forward() {
        assert!(MessageStatus::Unread.can_advance_to(MessageStatus::Seen));
        assert!(MessageStatus::Unread.can_advance_to(MessageStatus::Read));
        assert!(MessageStatus::Seen.can_advance_to(MessageStatus::Read));
        assert!(MessageStatus::Read.can_advance_to(MessageStatus::Revoked));
        assert!(!MessageStatus::Seen.can_advance_to(MessageStatus::Seen));
        assert!(!MessageStatus::Read.can_advance_to(MessageStatus::Seen));
        assert!(!MessageStatus::Revoked.can_advance_to(MessageStatus::Read));
    }

    #[test]
    fn test_receive_list_mark_has_no_duplicates() {
        let mut list = ReceiveList::unread(vec!["b".to_string(), "c".to_string(), "b".to_string()]);
        assert_eq!(list.unread_list, vec!["b", "c"]);
        assert!(list.mark("b", MessageStatus::Seen));
        assert!(!list.mark("b", MessageStatus::Seen));
        assert_eq!(list.seen_list, vec!["b"]);
        assert!(list.mark("b", MessageStatus::Read));
        assert!(!list.mark("b", MessageStatus::Seen));
        assert_eq!(list.unread_list, vec!["c"]);
        assert!(list.seen_list.is_empty());
        assert_eq!(list.read_list, vec!["b"]);
        assert_eq!(list.total(), 2);
    }
}
