//! YAML 配置文件读写

use super::path_utils::{collapse_tilde, expand_tilde};
use super::types::Config;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "~/.echoguard/config.yaml";

/// 配置错误
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("读取配置文件失败: {0}")]
    ReadError(#[from] std::io::Error),
    #[error("解析配置文件失败: {0}")]
    ParseError(#[from] serde_yaml::Error),
    #[error("配置校验失败: {0}")]
    ValidationError(String),
}

/// 默认配置文件路径（已展开）
pub fn default_config_path() -> PathBuf {
    expand_tilde(DEFAULT_CONFIG_PATH)
}

/// 从 YAML 字符串解析配置
pub fn parse_config(content: &str) -> Result<Config, ConfigError> {
    if content.trim().is_empty() {
        return Ok(Config::default());
    }
    let config: Config = serde_yaml::from_str(content)?;
    Ok(config)
}

/// 加载配置文件
///
/// 文件不存在时使用默认配置；加载后应用环境变量覆盖并校验
pub fn load_config(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.map(expand_tilde).unwrap_or_else(default_config_path);

    let mut config = if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        tracing::info!("[CONFIG] 加载配置文件: {}", collapse_tilde(&path));
        parse_config(&content)?
    } else {
        tracing::info!(
            "[CONFIG] 配置文件不存在，使用默认配置: {}",
            collapse_tilde(&path)
        );
        Config::default()
    };

    config.apply_env_overrides();
    config.validate()?;
    Ok(config)
}

/// 保存配置到 YAML 文件
pub fn save_config(path: &Path, config: &Config) -> Result<(), ConfigError> {
    let path = expand_tilde(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let content = serde_yaml::to_string(config)?;
    std::fs::write(&path, content)?;
    Ok(())
}
