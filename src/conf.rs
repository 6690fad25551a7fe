//! 运行配置 / Runtime configuration
//!
//! 通过 `v::ConfigManager` 读取，缺省值见各字段。
//! Loaded through `v::ConfigManager`; every key has a default.

use std::time::Duration;
use v::ConfigManager;

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// 雪花 ID 工作节点 / Snowflake worker id
    pub worker_id: u16,
}

#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// sled 目录；为空时使用临时库 / sled directory; `None` opens a temporary store
    pub path: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    pub wait_ms: u64,
    pub ttl_ms: u64,
    /// 编辑涉及归档 I/O，持有更久 / edits also archive, so they hold longer
    pub edit_ttl_ms: u64,
    pub retry_ms: u64,
}

#[derive(Debug, Clone)]
pub struct StreamConfig {
    pub checkpoint_interval_ms: u64,
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct FanoutConfig {
    pub batch_size: usize,
}

#[derive(Debug, Clone)]
pub struct PushConfig {
    pub workers: usize,
    pub capacity: usize,
}

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub concurrency: usize,
    pub max_redelivery: u32,
}

#[derive(Debug, Clone)]
pub struct SweepConfig {
    pub interval_ms: u64,
}

#[derive(Debug, Clone)]
pub struct SeqConfig {
    pub node: NodeConfig,
    pub storage: StorageConfig,
    pub lock: LockConfig,
    pub stream: StreamConfig,
    pub fanout: FanoutConfig,
    pub push: PushConfig,
    pub consumer: ConsumerConfig,
    pub sweep: SweepConfig,
    pub log_level: String,
}

impl Default for SeqConfig {
    fn default() -> Self {
        Self {
            node: NodeConfig { worker_id: 1 },
            storage: StorageConfig { path: None },
            lock: LockConfig {
                wait_ms: 3000,
                ttl_ms: 5000,
                edit_ttl_ms: 10000,
                retry_ms: 10,
            },
            stream: StreamConfig {
                checkpoint_interval_ms: 3000,
                cache_ttl_secs: 3600,
            },
            fanout: FanoutConfig { batch_size: 200 },
            push: PushConfig {
                workers: 8,
                capacity: 4096,
            },
            consumer: ConsumerConfig {
                concurrency: 32,
                max_redelivery: 3,
            },
            sweep: SweepConfig { interval_ms: 5000 },
            log_level: "info".to_string(),
        }
    }
}

impl SeqConfig {
    /// 从配置管理器加载 / Load from a config manager, falling back to defaults
    pub fn load(cm: &ConfigManager) -> Self {
        let d = Self::default();
        Self {
            node: NodeConfig {
                worker_id: cm.get_or("node.worker_id", i64::from(d.node.worker_id)) as u16,
            },
            storage: StorageConfig {
                path: cm.get::<String>("storage.path").ok().filter(|p| !p.is_empty()),
            },
            lock: LockConfig {
                wait_ms: cm.get_or("lock.wait_ms", d.lock.wait_ms as i64) as u64,
                ttl_ms: cm.get_or("lock.ttl_ms", d.lock.ttl_ms as i64) as u64,
                edit_ttl_ms: cm.get_or("lock.edit_ttl_ms", d.lock.edit_ttl_ms as i64) as u64,
                retry_ms: cm.get_or("lock.retry_ms", d.lock.retry_ms as i64) as u64,
            },
            stream: StreamConfig {
                checkpoint_interval_ms: cm
                    .get_or("stream.checkpoint_interval_ms", d.stream.checkpoint_interval_ms as i64)
                    as u64,
                cache_ttl_secs: cm.get_or("stream.cache_ttl_secs", d.stream.cache_ttl_secs as i64) as u64,
            },
            fanout: FanoutConfig {
                batch_size: cm.get_or("fanout.batch_size", d.fanout.batch_size as i64).max(1) as usize,
            },
            push: PushConfig {
                workers: cm.get_or("push.workers", d.push.workers as i64).max(1) as usize,
                capacity: cm.get_or("push.capacity", d.push.capacity as i64).max(1) as usize,
            },
            consumer: ConsumerConfig {
                concurrency: cm.get_or("consumer.concurrency", d.consumer.concurrency as i64).max(1) as usize,
                max_redelivery: cm.get_or("consumer.max_redelivery", i64::from(d.consumer.max_redelivery)) as u32,
            },
            sweep: SweepConfig {
                interval_ms: cm.get_or("sweep.interval_ms", d.sweep.interval_ms as i64) as u64,
            },
            log_level: cm.get_or("logging.level", d.log_level),
        }
    }

    /// 从全局配置管理器加载 / Load from the global config manager
    pub fn from_global() -> anyhow::Result<Self> {
        let cm = v::get_global_config_manager()?;
        Ok(Self::load(&cm))
    }

    pub fn lock_wait(&self) -> Duration {
        Duration::from_millis(self.lock.wait_ms)
    }

    pub fn checkpoint_interval(&self) -> Duration {
        Duration::from_millis(self.stream.checkpoint_interval_ms)
    }

    pub fn stream_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.stream.cache_ttl_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use v::ConfigSource;

    #[test]
    fn test_defaults_without_sources() {
        let cm = ConfigManager::from_sources(vec![]).unwrap();
        let cfg = SeqConfig::load(&cm);
        assert_eq!(cfg.node.worker_id, 1);
        assert!(cfg.storage.path.is_none());
        assert_eq!(cfg.lock.wait_ms, 3000);
        assert_eq!(cfg.lock.edit_ttl_ms, 10000);
        assert_eq!(cfg.stream.checkpoint_interval_ms, 3000);
        assert_eq!(cfg.fanout.batch_size, 200);
        assert_eq!(cfg.consumer.max_redelivery, 3);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn test_memory_overrides() {
        let mut map = std::collections::HashMap::new();
        map.insert("node.worker_id".to_string(), serde_json::json!(9));
        map.insert("storage.path".to_string(), serde_json::json!("/tmp/vseq"));
        map.insert("lock.wait_ms".to_string(), serde_json::json!(50));
        map.insert("fanout.batch_size".to_string(), serde_json::json!(0));
        let cm = ConfigManager::from_sources(vec![ConfigSource::Memory(map)]).unwrap();
        let cfg = SeqConfig::load(&cm);
        assert_eq!(cfg.node.worker_id, 9);
        assert_eq!(cfg.storage.path.as_deref(), Some("/tmp/vseq"));
        assert_eq!(cfg.lock.wait_ms, 50);
        assert_eq!(cfg.lock.ttl_ms, 5000);
        assert_eq!(cfg.fanout.batch_size, 1);
    }
}
