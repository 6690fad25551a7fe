use serde::{Deserialize, Serialize};

/// 接收对象类型 / Kind of a sequence owner
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    /// 人类用户 / Human user
    User,
    /// AI 助理 / AI agent
    Ai,
}

/// 身份：用户或 AI 助理 / Identity of a user or an AI agent
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    pub id: String,
    pub kind: ObjectType,
    pub organization_code: String,
}

impl Identity {
    pub fn user(id: impl Into<String>, organization_code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ObjectType::User,
            organization_code: organization_code.into(),
        }
    }

    pub fn ai(id: impl Into<String>, organization_code: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: ObjectType::Ai,
            organization_code: organization_code.into(),
        }
    }

    pub fn is_human(&self) -> bool {
        self.kind == ObjectType::User
    }
}

/// 会话类型 / Conversation kind
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ConversationType {
    /// 人与人单聊 / Human to human
    User,
    /// 人与 AI 单聊 / Human to agent
    Ai,
    /// 群聊 / Group chat
    Group,
    /// 系统通知 / System notices
    System,
    /// 云文档 / Cloud document
    CloudDocument,
}

impl ConversationType {
    /// 单聊（含 AI）/ Direct chat, agent chats included
    pub fn is_direct(self) -> bool {
        matches!(self, ConversationType::User | ConversationType::Ai)
    }

    /// 分发器可处理的会话类型 / Kinds the dispatcher can deliver into
    pub fn is_dispatchable(self) -> bool {
        matches!(
            self,
            ConversationType::User | ConversationType::Ai | ConversationType::Group
        )
    }

    /// 单聊对端的对象类型 / Object type of the peer in a direct chat
    pub fn peer_object_type(self) -> Option<ObjectType> {
        match self {
            ConversationType::User => Some(ObjectType::User),
            ConversationType::Ai => Some(ObjectType::Ai),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConversationType::User => "user",
            ConversationType::Ai => "ai",
            ConversationType::Group => "group",
            ConversationType::System => "system",
            ConversationType::CloudDocument => "cloud_document",
        }
    }
}

impl From<ObjectType> for ConversationType {
    fn from(kind: ObjectType) -> Self {
        match kind {
            ObjectType::User => ConversationType::User,
            ObjectType::Ai => ConversationType::Ai,
        }
    }
}
