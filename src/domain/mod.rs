//! 领域模型 / Domain model
//!
//! 序列记录、消息体、会话、流式缓存与分发事件。
//! Sequence records, message payloads, conversations, stream cache and dispatch events.

pub mod conversation;
pub mod event;
pub mod identity;
pub mod message;
pub mod sequence;
pub mod stream;

pub use conversation::{Conversation, ConversationExtra, ConversationStatus};
pub use event::{DispatchEnvelope, DispatchEvent, PushPayload};
pub use identity::{ConversationType, Identity, ObjectType};
pub use message::{
    AttachmentBearing, ControlContent, FileRef, MessageContent, MessageRecord, MessageType,
    MessageVersion, StreamCapable, TextExtractable, TopicAction,
};
pub use sequence::{
    EditMessageOptions, MessageStatus, ReceiveList, SeqExtra, SequencePatch, SequenceRecord,
};
pub use stream::{merge_fragment, StreamCache, StreamStatus};
