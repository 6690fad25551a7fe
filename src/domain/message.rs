use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::identity::{ConversationType, ObjectType};
use crate::error::{Result, SeqError};

/// 消息类型（聊天消息与控制消息共用一个命名空间）
/// Message type; chat and control messages share one namespace
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Markdown,
    RichText,
    Image,
    Files,
    AiCard,
    SeenMessages,
    ReadMessages,
    RevokeMessage,
    EditMessage,
    TypingState,
    TopicChange,
}

impl MessageType {
    pub fn is_control(self) -> bool {
        matches!(
            self,
            MessageType::SeenMessages
                | MessageType::ReadMessages
                | MessageType::RevokeMessage
                | MessageType::EditMessage
                | MessageType::TypingState
                | MessageType::TopicChange
        )
    }

    /// 会改变消息状态的控制消息 / Control messages that change a message's status
    pub fn is_status_change(self) -> bool {
        matches!(
            self,
            MessageType::SeenMessages
                | MessageType::ReadMessages
                | MessageType::RevokeMessage
                | MessageType::EditMessage
        )
    }

    /// 可编辑的聊天消息 / Chat types that accept edits
    pub fn is_editable(self) -> bool {
        matches!(
            self,
            MessageType::Text | MessageType::Markdown | MessageType::RichText
        )
    }

    pub fn is_stream_capable(self) -> bool {
        matches!(self, MessageType::Markdown | MessageType::AiCard)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::Text => "text",
            MessageType::Markdown => "markdown",
            MessageType::RichText => "rich_text",
            MessageType::Image => "image",
            MessageType::Files => "files",
            MessageType::AiCard => "ai_card",
            MessageType::SeenMessages => "seen_messages",
            MessageType::ReadMessages => "read_messages",
            MessageType::RevokeMessage => "revoke_message",
            MessageType::EditMessage => "edit_message",
            MessageType::TypingState => "typing_state",
            MessageType::TopicChange => "topic_change",
        }
    }
}

/// 文件引用 / File reference (signing and upload live elsewhere)
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_name: Option<String>,
}

/// 聊天消息内容，按 `type` 区分 / Chat content, tagged by `type`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum MessageContent {
    Text {
        content: String,
    },
    Markdown {
        content: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reasoning_content: Option<String>,
    },
    RichText {
        content: Value,
    },
    Image {
        file: FileRef,
    },
    Files {
        files: Vec<FileRef>,
    },
    AiCard {
        card: Map<String, Value>,
    },
}

/// 可提取纯文本 / Content with a plain-text rendition
pub trait TextExtractable {
    fn extract_text(&self) -> String;
}

/// 携带附件 / Content that references uploaded files
pub trait AttachmentBearing {
    fn file_ids(&self) -> Vec<String>;
}

/// 支持流式累积 / Content that can be assembled from stream fragments
pub trait StreamCapable: Sized {
    /// 作为累积起点的字段树 / Field tree the fragments are merged into
    fn stream_body(&self) -> Result<Map<String, Value>>;
    /// 由累积后的字段树重建内容 / Rebuild content from an accumulated field tree
    fn from_stream_body(message_type: MessageType, body: Map<String, Value>) -> Result<Self>;
}

impl MessageContent {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageContent::Text { .. } => MessageType::Text,
            MessageContent::Markdown { .. } => MessageType::Markdown,
            MessageContent::RichText { .. } => MessageType::RichText,
            MessageContent::Image { .. } => MessageType::Image,
            MessageContent::Files { .. } => MessageType::Files,
            MessageContent::AiCard { .. } => MessageType::AiCard,
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        MessageContent::Text {
            content: content.into(),
        }
    }

    pub fn markdown(content: impl Into<String>) -> Self {
        MessageContent::Markdown {
            content: content.into(),
            reasoning_content: None,
        }
    }
}

impl TextExtractable for MessageContent {
    fn extract_text(&self) -> String {
        match self {
            MessageContent::Text { content } => content.clone(),
            MessageContent::Markdown { content, .. } => content.clone(),
            MessageContent::RichText { content } => collect_text(content),
            MessageContent::Image { .. } => "[image]".to_string(),
            MessageContent::Files { files } => files
                .iter()
                .map(|f| f.file_name.clone().unwrap_or_else(|| f.file_id.clone()))
                .collect::<Vec<_>>()
                .join(", "),
            MessageContent::AiCard { card } => card
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }
    }
}

// 富文本文档中的 text 节点按顺序拼接 / concatenates every `text` leaf of a rich-text document
fn collect_text(node: &Value) -> String {
    match node {
        Value::Object(map) => {
            let own = map.get("text").and_then(Value::as_str).unwrap_or_default();
            let children = map.get("content").map(collect_text).unwrap_or_default();
            format!("{}{}", own, children)
        }
        Value::Array(items) => items.iter().map(collect_text).collect(),
        _ => String::new(),
    }
}

impl AttachmentBearing for MessageContent {
    fn file_ids(&self) -> Vec<String> {
        match self {
            MessageContent::Image { file } => vec![file.file_id.clone()],
            MessageContent::Files { files } => files.iter().map(|f| f.file_id.clone()).collect(),
            _ => Vec::new(),
        }
    }
}

impl StreamCapable for MessageContent {
    fn stream_body(&self) -> Result<Map<String, Value>> {
        if !self.message_type().is_stream_capable() {
            return Err(SeqError::message_type(format!(
                "{} cannot be streamed",
                self.message_type().as_str()
            )));
        }
        match serde_json::to_value(self).map_err(anyhow::Error::from)? {
            Value::Object(mut tagged) => match tagged.remove("body") {
                Some(Value::Object(body)) => Ok(body),
                _ => Ok(Map::new()),
            },
            _ => Ok(Map::new()),
        }
    }

    fn from_stream_body(message_type: MessageType, body: Map<String, Value>) -> Result<Self> {
        if !message_type.is_stream_capable() {
            return Err(SeqError::message_type(format!(
                "{} cannot be streamed",
                message_type.as_str()
            )));
        }
        let tagged = serde_json::json!({ "type": message_type.as_str(), "body": body });
        serde_json::from_value(tagged).map_err(|e| SeqError::message_type(e.to_string()))
    }
}

/// 话题变更动作 / Topic change action
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TopicAction {
    Create,
    Update,
    Delete,
}

/// 控制消息载荷 / Control message payloads carried by sequence records
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", content = "body", rename_all = "snake_case")]
pub enum ControlContent {
    SeenMessages {
        refer_message_ids: Vec<String>,
    },
    ReadMessages {
        refer_message_ids: Vec<String>,
    },
    RevokeMessage {
        refer_message_id: String,
    },
    EditMessage {
        refer_message_id: String,
        message_version_id: i64,
    },
    TypingState {
        typing: bool,
    },
    TopicChange {
        action: TopicAction,
        topic_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl ControlContent {
    pub fn message_type(&self) -> MessageType {
        match self {
            ControlContent::SeenMessages { .. } => MessageType::SeenMessages,
            ControlContent::ReadMessages { .. } => MessageType::ReadMessages,
            ControlContent::RevokeMessage { .. } => MessageType::RevokeMessage,
            ControlContent::EditMessage { .. } => MessageType::EditMessage,
            ControlContent::TypingState { .. } => MessageType::TypingState,
            ControlContent::TopicChange { .. } => MessageType::TopicChange,
        }
    }
}

/// 去重后的逻辑消息体 / The de-duplicated, versioned payload of a logical message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageRecord {
    pub magic_message_id: String,
    pub sender_id: String,
    pub sender_type: ObjectType,
    pub sender_organization_code: String,
    pub receive_id: String,
    pub receive_type: ConversationType,
    pub receive_organization_code: String,
    pub app_message_id: String,
    pub message_type: MessageType,
    pub content: MessageContent,
    pub send_time: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default)]
    pub current_version_id: Option<i64>,
}

/// 消息历史版本 / Archived content of a message
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageVersion {
    pub version_id: i64,
    pub magic_message_id: String,
    pub message_type: MessageType,
    pub content: MessageContent,
    pub created_at: i64,
}

impl MessageVersion {
    pub fn new(version_id: i64, magic_message_id: &str, content: MessageContent) -> Self {
        Self {
            version_id,
            magic_message_id: magic_message_id.to_string(),
            message_type: content.message_type(),
            content,
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_content_is_tagged_by_type() {
        let content = MessageContent::text("hi");
        let value = serde_json::to_value(&content).unwrap();
        assert_eq!(value, json!({"type": "text", "body": {"content": "hi"}}));
        let back: MessageContent = serde_json::from_value(value).unwrap();
        assert_eq!(back, content);
    }

    #[test]
    fn test_stream_body_only_for_streamable_types() {
        assert!(MessageContent::text("x").stream_body().is_err());
        let body = MessageContent::markdown("# ").stream_body().unwrap();
        assert_eq!(body.get("content"), Some(&json!("# ")));
    }

    #[test]
    fn test_from_stream_body_rebuilds_markdown() {
        let mut body = Map::new();
        body.insert("content".to_string(), json!("hello"));
        body.insert("reasoning_content".to_string(), json!("think"));
        let content = MessageContent::from_stream_body(MessageType::Markdown, body).unwrap();
        assert_eq!(
            content,
            MessageContent::Markdown {
                content: "hello".to_string(),
                reasoning_content: Some("think".to_string()),
            }
        );
    }

    #[test]
    fn test_rich_text_extraction_walks_document() {
        let content = MessageContent::RichText {
            content: json!({"type": "doc", "content": [
                {"type": "paragraph", "content": [{"type": "text", "text": "hello "}]},
                {"type": "paragraph", "content": [{"type": "text", "text": "world"}]}
            ]}),
        };
        assert_eq!(content.extract_text(), "hello world");
    }

    #[test]
    fn test_attachment_ids() {
        let content = MessageContent::Files {
            files: vec![
                FileRef { file_id: "f1".into(), file_name: None },
                FileRef { file_id: "f2".into(), file_name: Some("a.pdf".into()) },
            ],
        };
        assert_eq!(content.file_ids(), vec!["f1".to_string(), "f2".to_string()]);
        assert!(MessageContent::text("x").file_ids().is_empty());
    }
}
