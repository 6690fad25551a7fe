use anyhow::Result;
use chrono::{Datelike, Timelike};
use tracing_log::LogTracer;
use tracing_subscriber::{fmt, EnvFilter};

struct LogTimer;

impl fmt::time::FormatTime for LogTimer {
    fn format_time(&self, w: &mut fmt::format::Writer<'_>) -> std::fmt::Result {
        let now = chrono::Local::now();
        let cs = now.timestamp_subsec_millis() / 10;
        let s = format!(
            "{:04}-{:02}-{:02}:{:02}:{:02}:{:02}:{:02}",
            now.year(),
            now.month(),
            now.day(),
            now.hour(),
            now.minute(),
            now.second(),
            cs
        );
        w.write_str(&s)
    }
}

/// 按全局配置 `logging.level` 初始化日志 / Init tracing from the `logging.level` config key
pub fn init_tracing() -> Result<()> {
    #[cfg(feature = "config")]
    let level: String = crate::comm::config::get_global_config_manager()
        .ok()
        .and_then(|mgr| mgr.get("logging.level").ok())
        .unwrap_or_else(|| "info".to_string());
    #[cfg(not(feature = "config"))]
    let level = "info".to_string();
    init_tracing_with_level(&level)
}

/// 以指定级别初始化日志（重复调用无副作用）
/// Init tracing with an explicit level (repeat calls are no-ops)
pub fn init_tracing_with_level(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("{},sled=warn", level))
        .unwrap_or_else(|_| EnvFilter::new("info,sled=warn"));
    LogTracer::init().ok();
    fmt::SubscriberBuilder::default()
        .with_env_filter(filter)
        .with_timer(LogTimer)
        .compact()
        .with_target(false)
        .try_init()
        .ok();
    Ok(())
}
