use anyhow::{anyhow, Result};
use config::{Config, ConfigBuilder, Environment, File, FileFormat};
use lazy_static::lazy_static;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

lazy_static! {
    static ref GLOBAL_CONFIG_MANAGER: RwLock<Option<Arc<ConfigManager>>> = RwLock::new(None);
}

/// 默认环境变量前缀 / Default environment variable prefix
pub const DEFAULT_ENV_PREFIX: &str = "VSEQ";

/// 配置错误类型 / Configuration error type
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("配置项 '{key}' 不存在 / key '{key}' not found")]
    KeyNotFound { key: String },
    #[error("配置项 '{key}' 类型转换失败 / key '{key}' conversion failed: {message}")]
    TypeConversionError { key: String, message: String },
    #[error("配置初始化失败 / config init failed: {message}")]
    InitializationError { message: String },
}

/// 配置数据源信息 / Config source info
#[derive(Debug, Clone)]
pub struct ConfigSourceInfo {
    pub source_type: String,
    pub description: String,
    pub priority: u8,
    pub loaded: bool,
}

/// 配置管理器 / Config manager
pub struct ConfigManager {
    config: Config,
    sources_info: Vec<ConfigSourceInfo>,
}

impl ConfigManager {
    /// 使用默认配置源创建 / Create with the default sources
    pub fn new() -> Result<Self> {
        Self::with_sources(vec![])
    }

    /// 默认配置源 + 额外配置源（额外源优先级最高）
    /// Default sources plus extra sources (extras win)
    pub fn with_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        // 优先级从低到高，后添加者优先生效
        // Lowest priority first; later sources override earlier ones
        let defaults = vec![
            ConfigSource::File {
                path: "config/development.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
            ConfigSource::File {
                path: "config/default.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
            ConfigSource::File {
                path: "config/production.toml".to_string(),
                format: Some(FileFormat::Toml),
                required: false,
            },
            ConfigSource::Env {
                prefix: DEFAULT_ENV_PREFIX.to_string(),
                separator: "__",
            },
        ];
        Self::build(defaults.into_iter().chain(sources).collect())
    }

    /// 仅使用给定配置源（测试与嵌入场景）
    /// Only the given sources (tests and embedding)
    pub fn from_sources(sources: Vec<ConfigSource>) -> Result<Self> {
        Self::build(sources)
    }

    fn build(sources: Vec<ConfigSource>) -> Result<Self> {
        let mut builder = Config::builder();
        let mut sources_info = Vec::with_capacity(sources.len());

        for (index, source) in sources.into_iter().enumerate() {
            let info = source.get_source_info(index as u8 + 1);
            if let ConfigSource::File { path, required, .. } = &source {
                let exists = std::path::Path::new(path).exists();
                if !exists && *required {
                    return Err(anyhow!("必需的配置文件不存在 / required config file missing: {}", path));
                }
                if !exists {
                    sources_info.push(info);
                    continue;
                }
            }
            builder = source
                .add_to_builder(builder)
                .map_err(|e| anyhow!("添加配置源失败 / add source failed: {}", e))?;
            sources_info.push(ConfigSourceInfo { loaded: true, ..info });
        }

        let config = builder
            .build()
            .map_err(|e| anyhow!("构建配置失败 / build config failed: {}", e))?;
        Ok(Self {
            config,
            sources_info,
        })
    }

    /// 获取指定 key 的配置值 / Get a value by key
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Result<T> {
        self.config
            .get(key)
            .map_err(|e| anyhow!("获取配置 '{}' 失败 / get '{}' failed: {}", key, key, e))
    }

    /// 获取配置值，不存在时返回默认值 / Get a value or fall back to default
    pub fn get_or<T: DeserializeOwned>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    /// 安全获取配置值，返回详细错误 / Get with a typed error
    pub fn get_safe<T: DeserializeOwned>(&self, key: &str) -> std::result::Result<T, ConfigError> {
        self.config.get(key).map_err(|e| {
            if matches!(e, config::ConfigError::NotFound(_)) {
                ConfigError::KeyNotFound {
                    key: key.to_string(),
                }
            } else {
                ConfigError::TypeConversionError {
                    key: key.to_string(),
                    message: e.to_string(),
                }
            }
        })
    }

    /// 检查配置项是否存在 / Whether a key exists
    pub fn exists(&self, key: &str) -> bool {
        self.config.get::<serde_json::Value>(key).is_ok()
    }

    /// 已成功加载的配置源 / Sources that were loaded
    pub fn get_active_sources(&self) -> Vec<&ConfigSourceInfo> {
        self.sources_info.iter().filter(|info| info.loaded).collect()
    }

    /// 验证必需的配置项 / Validate required keys
    pub fn validate_required_keys(&self, required_keys: &[&str]) -> std::result::Result<(), ConfigError> {
        for key in required_keys {
            if !self.exists(key) {
                return Err(ConfigError::KeyNotFound {
                    key: key.to_string(),
                });
            }
        }
        Ok(())
    }
}

/// 配置源类型 / Config source kinds
pub enum ConfigSource {
    /// 文件配置源 / File source
    File {
        path: String,
        format: Option<FileFormat>,
        required: bool,
    },
    /// 环境变量配置源 / Environment source
    Env {
        prefix: String,
        separator: &'static str,
    },
    /// 内存配置源（扁平 key，如 "lock.wait_ms"）/ In-memory source with dotted keys
    Memory(HashMap<String, serde_json::Value>),
    /// 字符串配置源 / String source
    String { content: String, format: FileFormat },
}

impl ConfigSource {
    /// 获取配置源信息 / Describe the source
    pub fn get_source_info(&self, priority: u8) -> ConfigSourceInfo {
        let (source_type, description) = match self {
            ConfigSource::File { path, required, .. } => (
                "File",
                format!("文件配置源 / file source: {} (required: {})", path, required),
            ),
            ConfigSource::Env { prefix, separator } => (
                "Environment",
                format!("环境变量配置源 / env source: prefix={}, separator={}", prefix, separator),
            ),
            ConfigSource::Memory(map) => (
                "Memory",
                format!("内存配置源 / memory source: {} keys", map.len()),
            ),
            ConfigSource::String { .. } => ("String", "字符串配置源 / string source".to_string()),
        };
        ConfigSourceInfo {
            source_type: source_type.to_string(),
            description,
            priority,
            loaded: false,
        }
    }

    pub fn add_to_builder(
        self,
        builder: ConfigBuilder<config::builder::DefaultState>,
    ) -> Result<ConfigBuilder<config::builder::DefaultState>> {
        match self {
            ConfigSource::File {
                path,
                format,
                required,
            } => {
                let file_source = match format {
                    Some(format) => File::with_name(&path).format(format),
                    None => File::with_name(&path),
                };
                Ok(builder.add_source(file_source.required(required)))
            }
            ConfigSource::Env { prefix, separator } => Ok(builder.add_source(
                Environment::with_prefix(&prefix)
                    .separator(separator)
                    .prefix_separator("_")
                    .try_parsing(true)
                    .ignore_empty(true),
            )),
            ConfigSource::Memory(map) => {
                let mut builder = builder;
                for (key, value) in map {
                    builder = builder
                        .set_override(key.as_str(), json_to_config_value(value))
                        .map_err(|e| anyhow!("内存配置写入失败 / memory override failed: {}", e))?;
                }
                Ok(builder)
            }
            ConfigSource::String { content, format } => {
                Ok(builder.add_source(File::from_str(&content, format)))
            }
        }
    }
}

fn json_to_config_value(value: serde_json::Value) -> config::Value {
    match value {
        serde_json::Value::Null => config::Value::new(None, config::ValueKind::Nil),
        serde_json::Value::Bool(b) => config::Value::from(b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => config::Value::from(i),
            None => config::Value::from(n.as_f64().unwrap_or_default()),
        },
        serde_json::Value::String(s) => config::Value::from(s),
        serde_json::Value::Array(items) => config::Value::from(
            items
                .into_iter()
                .map(json_to_config_value)
                .collect::<Vec<config::Value>>(),
        ),
        serde_json::Value::Object(map) => config::Value::from(
            map.into_iter()
                .map(|(k, v)| (k, json_to_config_value(v)))
                .collect::<config::Map<String, config::Value>>(),
        ),
    }
}

/// 设置全局配置管理器（进程启动时调用一次）
/// Install the global config manager (once, at process start)
pub fn install_global_config_manager(manager: ConfigManager) -> Result<Arc<ConfigManager>> {
    let manager = Arc::new(manager);
    let mut slot = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置管理器写锁失败 / global config lock poisoned: {}", e))?;
    *slot = Some(Arc::clone(&manager));
    Ok(manager)
}

/// 获取全局配置管理器实例（未安装时按默认源懒加载）
/// Get the global config manager (lazily built from default sources)
pub fn get_global_config_manager() -> Result<Arc<ConfigManager>> {
    {
        let manager = GLOBAL_CONFIG_MANAGER
            .read()
            .map_err(|e| anyhow!("读取全局配置管理器锁失败 / global config lock poisoned: {}", e))?;
        if let Some(config_manager) = manager.as_ref() {
            return Ok(Arc::clone(config_manager));
        }
    }
    let mut manager = GLOBAL_CONFIG_MANAGER
        .write()
        .map_err(|e| anyhow!("获取全局配置管理器写锁失败 / global config lock poisoned: {}", e))?;
    match manager.as_ref() {
        Some(existing) => Ok(Arc::clone(existing)),
        None => {
            let created = Arc::new(
                ConfigManager::new()
                    .map_err(|e| anyhow!("创建配置管理器失败 / create config manager failed: {}", e))?,
            );
            *manager = Some(Arc::clone(&created));
            Ok(created)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{ConfigManager, ConfigSource};
    use config::FileFormat;
    use std::collections::HashMap;

    #[test]
    fn test_config_from_string() {
        let source = ConfigSource::String {
            content: "[lock]\nwait_ms = 1500".to_string(),
            format: FileFormat::Toml,
        };
        let manager = ConfigManager::from_sources(vec![source]).unwrap();
        assert_eq!(manager.get::<i64>("lock.wait_ms").unwrap(), 1500);
        assert_eq!(manager.get_or("lock.ttl_ms", 5000_i64), 5000);
    }

    #[test]
    fn test_config_from_memory() {
        let mut map = HashMap::new();
        map.insert("stream.checkpoint_interval_ms".to_string(), serde_json::json!(250));
        map.insert("storage.path".to_string(), serde_json::json!("/tmp/seq"));
        let manager = ConfigManager::from_sources(vec![ConfigSource::Memory(map)]).unwrap();
        assert_eq!(manager.get::<u64>("stream.checkpoint_interval_ms").unwrap(), 250);
        assert_eq!(manager.get::<String>("storage.path").unwrap(), "/tmp/seq");
    }

    #[test]
    fn test_missing_required_key() {
        let manager = ConfigManager::from_sources(vec![]).unwrap();
        assert!(manager.validate_required_keys(&["node.worker_id"]).is_err());
        assert!(manager.get_safe::<i64>("node.worker_id").is_err());
    }
}
