use anyhow::Result;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use v::{ConfigManager, ConfigSource, HealthCheck};

use v_im_seq::storage::SledStore;
use v_im_seq::{SeqConfig, SeqEngine};

/// 命令行参数 / Command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "v-im-seq dispatch consumer", long_about = None)]
pub struct Args {
    /// 指定配置文件路径（TOML/JSON/YAML自动识别）
    /// Specify config file path (auto-detect TOML/JSON/YAML)
    #[arg(short = 'c', long = "config")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let extra = match &args.config {
        Some(path) => vec![ConfigSource::File {
            path: path.clone(),
            format: None,
            required: true,
        }],
        None => Vec::new(),
    };
    let cm = v::install_global_config_manager(ConfigManager::with_sources(extra)?)?;
    let config = SeqConfig::load(&cm);
    v::init_tracing_with_level(&config.log_level)?;

    info!("🎯 Starting v-im-seq dispatch consumer...");
    for source in cm.get_active_sources() {
        info!("🔧 config source: {}", source.description);
    }

    let mut builder = SeqEngine::builder(config.clone());
    if let Some(path) = &config.storage.path {
        let store = SledStore::open(path)?;
        let health = store.check_health().await;
        if !health.healthy {
            warn!("⚠️ 存储健康检查未通过 / store unhealthy: {:?}", health.message);
        }
        info!("💾 sled store opened at {}", path);
        builder = builder.with_store(std::sync::Arc::new(store));
    } else {
        warn!("⚠️ 未配置 storage.path，使用临时库 / no storage.path, using a temporary store");
    }
    let engine = builder.build()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let consumer = engine.spawn_consumer(shutdown_rx.clone());
    let sweeper = engine.spawn_sweeper(shutdown_rx);

    tokio::signal::ctrl_c().await?;
    info!("🛑 收到退出信号 / shutdown signal received");
    shutdown_tx.send(true).ok();

    if let Some(consumer) = consumer {
        consumer.await.ok();
    }
    sweeper.await.ok();
    let stats = engine.context().push.stats();
    info!(
        "👋 已退出 / stopped (push accepted {}, delivered {}, dropped {}, failed {})",
        stats.accepted, stats.delivered, stats.dropped, stats.failed
    );
    Ok(())
}
