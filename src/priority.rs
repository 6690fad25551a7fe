//! 投递优先级规则 / Delivery priority rules
//!
//! 每次入队前由分发器与控制消息状态机调用，纯函数、无副作用。
//! Consulted by the dispatcher and the control state machine before every publish; pure.

use serde::{Deserialize, Serialize};

use crate::domain::ConversationType;

/// 群聊人数不超过该值时视同单聊 / Groups up to this size deliver like direct chats
pub const SMALL_GROUP_LIMIT: usize = 100;
/// 中等群聊上限 / Upper bound of a medium group
pub const MEDIUM_GROUP_LIMIT: usize = 500;

/// 投递优先级，`Highest` 最先处理 / Delivery tier, `Highest` is consumed first
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Highest,
    High,
    Medium,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 4] = [
        Priority::Highest,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    pub fn index(self) -> usize {
        match self {
            Priority::Highest => 0,
            Priority::High => 1,
            Priority::Medium => 2,
            Priority::Low => 3,
        }
    }
}

/// 计算投递优先级 / Resolve the delivery priority
///
/// - 单聊（含 AI）：Highest
/// - 群聊：<=100 Highest，<=500 Medium，其余 Low
/// - 状态类控制消息：群聊 >100 一律 Low
/// - 其他会话类型（系统通知等）：High
pub fn priority_for(kind: ConversationType, recipient_count: usize, is_control: bool) -> Priority {
    match kind {
        ConversationType::User | ConversationType::Ai => Priority::Highest,
        ConversationType::Group => {
            if recipient_count <= SMALL_GROUP_LIMIT {
                Priority::Highest
            } else if is_control || recipient_count > MEDIUM_GROUP_LIMIT {
                Priority::Low
            } else {
                Priority::Medium
            }
        }
        ConversationType::System | ConversationType::CloudDocument => Priority::High,
    }
}
