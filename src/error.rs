use thiserror::Error;

use crate::storage::StoreError;

pub type Result<T> = std::result::Result<T, SeqError>;

/// 统一的序列核心错误类型 / Unified error type of the sequencing core
#[derive(Error, Debug)]
pub enum SeqError {
    #[error("会话不存在 / conversation not found: {conversation_id}")]
    ConversationNotFound { conversation_id: String },

    #[error("不支持的会话类型 / unsupported conversation type: {kind}")]
    ConversationTypeError { kind: String },

    #[error("消息不存在 / message not found: {message_id}")]
    MessageNotFound { message_id: String },

    #[error("消息类型错误 / message type error: {message}")]
    MessageTypeError { message: String },

    #[error("流式消息不存在或已过期 / stream message not found: {app_message_id}")]
    StreamMessageNotFound { app_message_id: String },

    #[error("消息投递失败 / message delivery failed: {reason}")]
    MessageDeliveryFailed { reason: String },

    #[error("数据写入失败 / data write failed: {reason}")]
    DataWriteFailed { reason: String },

    #[error("存储读取失败 / storage error: {0}")]
    Storage(StoreError),

    #[error("内部错误 / internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl SeqError {
    pub fn conversation_not_found<T: Into<String>>(conversation_id: T) -> Self {
        Self::ConversationNotFound {
            conversation_id: conversation_id.into(),
        }
    }

    pub fn conversation_type<T: Into<String>>(kind: T) -> Self {
        Self::ConversationTypeError { kind: kind.into() }
    }

    pub fn message_not_found<T: Into<String>>(message_id: T) -> Self {
        Self::MessageNotFound {
            message_id: message_id.into(),
        }
    }

    pub fn message_type<T: Into<String>>(message: T) -> Self {
        Self::MessageTypeError {
            message: message.into(),
        }
    }

    pub fn stream_not_found<T: Into<String>>(app_message_id: T) -> Self {
        Self::StreamMessageNotFound {
            app_message_id: app_message_id.into(),
        }
    }

    pub fn delivery_failed<T: Into<String>>(reason: T) -> Self {
        Self::MessageDeliveryFailed {
            reason: reason.into(),
        }
    }

    pub fn write_failed<T: Into<String>>(reason: T) -> Self {
        Self::DataWriteFailed {
            reason: reason.into(),
        }
    }

    /// 获取错误代码 / Stable numeric error code
    pub fn error_code(&self) -> i32 {
        match self {
            SeqError::ConversationNotFound { .. } => 3001,
            SeqError::ConversationTypeError { .. } => 3002,
            SeqError::MessageNotFound { .. } => 3101,
            SeqError::MessageTypeError { .. } => 3102,
            SeqError::StreamMessageNotFound { .. } => 3103,
            SeqError::MessageDeliveryFailed { .. } => 3201,
            SeqError::DataWriteFailed { .. } => 3301,
            SeqError::Storage(_) => 3302,
            SeqError::Internal(_) => 3000,
        }
    }

    /// 调用方是否可以退避重试 / Whether the caller may retry with backoff
    ///
    /// 锁等待超时与投递失败可重试；校验类错误不可重试。
    /// Lock timeouts and delivery failures are retryable; validation errors are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SeqError::MessageDeliveryFailed { .. }
                | SeqError::DataWriteFailed { .. }
                | SeqError::Storage(_)
        )
    }
}

impl From<StoreError> for SeqError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => SeqError::message_not_found(what),
            StoreError::Conflict(_) | StoreError::Tx(_) => SeqError::write_failed(e.to_string()),
            other => SeqError::Storage(other),
        }
    }
}
