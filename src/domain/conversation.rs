use serde::{Deserialize, Serialize};

use super::identity::ConversationType;

/// 会话状态 / Conversation window status
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    #[default]
    Normal,
    Hidden,
    Deleted,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationExtra {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_topic_id: Option<String>,
}

/// 会话：某个用户看向对端或群组的窗口
/// Conversation: one user's window onto a peer or a group
///
/// 同一逻辑聊天中每个参与者都有自己的一行。
/// Every participant of the same logical chat owns a separate row.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub user_organization_code: String,
    pub receive_id: String,
    pub receive_type: ConversationType,
    pub receive_organization_code: String,
    pub status: ConversationStatus,
    #[serde(default)]
    pub extra: ConversationExtra,
}

impl Conversation {
    pub fn is_owned_by(&self, user_id: &str) -> bool {
        self.user_id == user_id
    }
}
