//! v-im-seq：多租户聊天平台的消息序列与投递核心
//! v-im-seq: message sequencing and delivery core of a multi-tenant chat platform
//!
//! - `storage`：序列记录与消息体的持久化有序存储 / durable ordered store
//! - `service`：分发器、控制消息状态机、流式组装器 / dispatcher, control state machine, stream assembler
//! - `gateway`：外部协作者接口及内存实现 / collaborator interfaces and in-process implementations
//! - `tasks`：队列消费者与补投任务 / queue consumer and delivery sweeper

pub mod conf;
pub mod domain;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod id;
pub mod priority;
pub mod service;
pub mod storage;
pub mod tasks;

pub use conf::SeqConfig;
pub use engine::{SeqEngine, SeqEngineBuilder};
pub use error::{Result, SeqError};
pub use priority::{priority_for, Priority};
pub use service::{ControlService, Dispatcher, SendRequest, StreamAssembler, StreamStart};
