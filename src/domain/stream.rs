use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::message::MessageType;

/// 流式消息状态 / Stream lifecycle
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StreamStatus {
    Start,
    Processing,
    Completed,
}

/// 流式累积缓存，按 app_message_id 存放 / Ephemeral stream state keyed by app message id
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StreamCache {
    pub app_message_id: String,
    pub sender_message_id: String,
    pub receive_message_id: String,
    /// 接收者身份（推送目标）/ Receiver identity used as the push target
    pub receive_id: String,
    /// 接收方记录的 magic ID / Magic id of the receiver's record
    pub receive_magic_id: String,
    pub magic_message_id: String,
    pub message_type: MessageType,
    pub content: Map<String, Value>,
    pub last_checkpoint_time: i64,
}

impl StreamCache {
    pub fn cache_key(app_message_id: &str) -> String {
        format!("seq:stream:{}", app_message_id)
    }
}

/// 合并一个片段到累积内容：字符串拼接、数组追加、对象递归、其余覆盖
/// Merge one fragment: strings concatenate, arrays append, objects recurse, everything else overwrites
pub fn merge_fragment(target: &mut Map<String, Value>, fragment: &Map<String, Value>) {
    for (key, incoming) in fragment {
        match (target.get_mut(key), incoming) {
            (Some(Value::String(existing)), Value::String(more)) => existing.push_str(more),
            (Some(Value::Array(existing)), Value::Array(more)) => existing.extend(more.iter().cloned()),
            (Some(Value::Object(existing)), Value::Object(more)) => merge_fragment(existing, more),
            _ => {
                target.insert(key.clone(), incoming.clone());
            }
        }
    }
}
