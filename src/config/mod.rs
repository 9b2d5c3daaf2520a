//! 配置管理模块
//!
//! 提供 YAML 配置文件加载、环境变量覆盖和启动时校验

mod path_utils;
mod types;
mod yaml;

pub use path_utils::{collapse_tilde, expand_tilde};
pub use types::{
    ClientConfig, Config, HeartbeatSettings, LoggingConfig, RateLimitSettings, ServerConfig,
};
pub use yaml::{
    default_config_path, load_config, parse_config, save_config, ConfigError, DEFAULT_CONFIG_PATH,
};

#[cfg(test)]
mod tests;
