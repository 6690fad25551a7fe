use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::message::ControlContent;
use super::sequence::SequenceRecord;
use super::stream::StreamStatus;
use crate::priority::Priority;

/// 队列中的分发事件 / Dispatch event carried by the message queue
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// 推送已落库的序列记录 / Push already persisted sequence records
    Deliver { seq_ids: Vec<i64> },
    /// 群聊异步扇出 / Asynchronous group fan-out of one sender record
    GroupFanOut { sender_seq_id: i64 },
}

impl DispatchEvent {
    /// 事件涉及的序列 ID / Sequence ids referenced by the event
    pub fn seq_ids(&self) -> Vec<i64> {
        match self {
            DispatchEvent::Deliver { seq_ids } => seq_ids.clone(),
            DispatchEvent::GroupFanOut { sender_seq_id } => vec![*sender_seq_id],
        }
    }
}

/// 队列消息信封 / Queue envelope
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct DispatchEnvelope {
    pub event_id: String,
    pub priority: Priority,
    pub attempt: u32,
    pub event: DispatchEvent,
}

impl DispatchEnvelope {
    pub fn new(priority: Priority, event: DispatchEvent) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            priority,
            attempt: 0,
            event,
        }
    }

    /// 重投递副本 / Copy for re-delivery
    pub fn redelivery(&self) -> Self {
        Self {
            attempt: self.attempt + 1,
            ..self.clone()
        }
    }
}

/// 实时推送载荷 / Real-time push payload
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushPayload {
    /// 一条序列记录 / A sequence record
    Seq { seq: SequenceRecord },
    /// 流式片段或终态 / A stream fragment or the terminal content
    Stream {
        app_message_id: String,
        receive_message_id: String,
        status: StreamStatus,
        content: Map<String, Value>,
    },
    /// 不落库的中间态消息（如正在输入）/ Ephemeral control message, never persisted
    Intermediate {
        conversation_id: String,
        sender_id: String,
        content: ControlContent,
    },
}

impl PushPayload {
    pub fn seq(seq: &SequenceRecord) -> Self {
        PushPayload::Seq { seq: seq.clone() }
    }
}
