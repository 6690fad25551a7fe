//! 雪花 ID 生成器 / Snowflake id generator
//!
//! 41 位毫秒时间戳 + 10 位工作节点 + 12 位毫秒内序号，按生成顺序单调递增。
//! 41-bit millisecond timestamp + 10-bit worker + 12-bit per-ms sequence; monotonic in generation order.

use parking_lot::Mutex;

/// 起始纪元 2023-01-01T00:00:00Z / Custom epoch
const EPOCH_MS: i64 = 1_672_531_200_000;
const WORKER_BITS: u32 = 10;
const SEQUENCE_BITS: u32 = 12;
const MAX_WORKER: u16 = (1 << WORKER_BITS) - 1;
const SEQUENCE_MASK: i64 = (1 << SEQUENCE_BITS) - 1;

#[derive(Debug)]
struct IdState {
    last_ms: i64,
    sequence: i64,
}

#[derive(Debug)]
pub struct IdGenerator {
    worker_id: i64,
    state: Mutex<IdState>,
}

impl IdGenerator {
    pub fn new(worker_id: u16) -> Self {
        Self {
            worker_id: i64::from(worker_id.min(MAX_WORKER)),
            state: Mutex::new(IdState {
                last_ms: 0,
                sequence: 0,
            }),
        }
    }

    /// 生成下一个 ID / Next id
    pub fn next_id(&self) -> i64 {
        let mut state = self.state.lock();
        // 时钟回拨时沿用上次时间戳 / reuse last timestamp when the clock goes backwards
        let now = chrono::Utc::now().timestamp_millis().max(state.last_ms);
        if now == state.last_ms {
            state.sequence = (state.sequence + 1) & SEQUENCE_MASK;
            if state.sequence == 0 {
                // 本毫秒序号耗尽，借用下一毫秒 / sequence exhausted, borrow the next millisecond
                state.last_ms += 1;
            }
        } else {
            state.sequence = 0;
            state.last_ms = now;
        }
        ((state.last_ms - EPOCH_MS) << (WORKER_BITS + SEQUENCE_BITS))
            | (self.worker_id << SEQUENCE_BITS)
            | state.sequence
    }

    /// 生成字符串形式的消息 ID / Next id rendered as a message id
    pub fn next_message_id(&self) -> String {
        self.next_id().to_string()
    }

    /// 生成逻辑消息的 magic ID / New magic message id for a logical message
    pub fn new_magic_id(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}
