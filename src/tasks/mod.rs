//! 后台任务 / Background tasks

pub mod consumer;
pub mod sweeper;

pub use consumer::spawn_consumer;
pub use sweeper::{spawn_sweeper, sweep_once, PendingDeliveries};
