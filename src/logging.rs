//! 日志初始化
//!
//! `RUST_LOG` 优先，否则使用配置中的级别

use crate::config::LoggingConfig;
use tracing_subscriber::EnvFilter;

/// 依赖库的噪声日志压到 warn
const QUIET_TARGETS: &[&str] = &["hyper", "tungstenite", "tokio_tungstenite", "tower_http"];

/// 构建过滤器
pub fn build_env_filter(config: &LoggingConfig) -> anyhow::Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }

    let mut directives = vec![config.level.clone()];
    directives.extend(QUIET_TARGETS.iter().map(|target| format!("{}=warn", target)));
    let filter_str = directives.join(",");
    EnvFilter::try_new(&filter_str)
        .map_err(|e| anyhow::anyhow!("无效的日志过滤器 '{}': {}", filter_str, e))
}

/// 初始化全局日志，重复调用时忽略
pub fn init(config: &LoggingConfig) -> anyhow::Result<()> {
    let filter = build_env_filter(config)?;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
    Ok(())
}
