//! 配置类型定义
//!
//! 所有参数启动时确定，运行期间不支持热更新

use super::yaml::ConfigError;
use crate::websocket::{HeartbeatConfig, LifecycleSettings, RateLimitPolicy};
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

/// 主配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// 服务器配置
    #[serde(default)]
    pub server: ServerConfig,
    /// 服务端心跳配置
    #[serde(default, deserialize_with = "deserialize_server_heartbeat")]
    pub heartbeat: HeartbeatSettings,
    /// 限速配置
    #[serde(default)]
    pub rate_limit: RateLimitSettings,
    /// 客户端模式配置
    #[serde(default)]
    pub client: ClientConfig,
    /// 日志配置
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        let heartbeat = self.heartbeat.to_config();
        heartbeat.validate()?;
        self.client.heartbeat.to_config().validate()?;

        if self.server.max_connections_per_ip == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_connections_per_ip must be at least 1".to_string(),
            ));
        }
        if self.server.max_message_size == 0 {
            return Err(ConfigError::ValidationError(
                "server.max_message_size must be greater than zero".to_string(),
            ));
        }
        if self.server.write_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "server.write_timeout_secs must be greater than zero".to_string(),
            ));
        }
        // pong 帧也算一次读取，读超时必须覆盖一个完整的心跳周期
        if Duration::from_secs(self.server.read_timeout_secs) <= heartbeat.interval + heartbeat.timeout
        {
            return Err(ConfigError::ValidationError(format!(
                "server.read_timeout_secs ({}) must exceed heartbeat interval + timeout ({}s)",
                self.server.read_timeout_secs,
                (heartbeat.interval + heartbeat.timeout).as_secs()
            )));
        }
        if self.rate_limit.min_ping_interval_secs == 0 {
            return Err(ConfigError::ValidationError(
                "rate_limit.min_ping_interval_secs must be greater than zero".to_string(),
            ));
        }
        // 服务端自己的探测也经过限速
        if self.heartbeat.interval_secs < self.rate_limit.min_ping_interval_secs {
            return Err(ConfigError::ValidationError(format!(
                "heartbeat.interval_secs ({}) must not be below rate_limit.min_ping_interval_secs ({})",
                self.heartbeat.interval_secs, self.rate_limit.min_ping_interval_secs
            )));
        }
        Ok(())
    }

    /// 生命周期参数
    pub fn lifecycle_settings(&self) -> LifecycleSettings {
        LifecycleSettings {
            heartbeat: self.heartbeat.to_config(),
            read_timeout: Duration::from_secs(self.server.read_timeout_secs),
            write_timeout: Duration::from_secs(self.server.write_timeout_secs),
            max_message_size: self.server.max_message_size,
            max_connections_per_ip: self.server.max_connections_per_ip,
            rate_limit: self.rate_limit.to_policy(),
        }
    }

    /// 应用环境变量覆盖
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// 从给定的查找函数应用覆盖
    ///
    /// - `ECHOGUARD_LISTEN` 覆盖服务器监听地址
    /// - `SERVER_URL`，其次 `WEBSOCKET_SERVER`，覆盖客户端连接地址
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(listen) = non_empty("ECHOGUARD_LISTEN") {
            self.server.listen = listen;
        }
        if let Some(url) = non_empty("SERVER_URL").or_else(|| non_empty("WEBSOCKET_SERVER")) {
            self.client.server_url = url;
        }
    }
}

/// 服务器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// 监听地址
    #[serde(default = "default_listen")]
    pub listen: String,
    /// 单 IP 最大并发连接数
    #[serde(default = "default_max_connections_per_ip")]
    pub max_connections_per_ip: usize,
    /// 单次读取超时（秒）
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
    /// 单次写入超时（秒）
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,
    /// 单条消息最大字节数
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
    /// 关闭时等待连接拆除的最长时间（秒）
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_max_connections_per_ip() -> usize {
    crate::websocket::DEFAULT_MAX_CONNECTIONS_PER_IP
}

fn default_read_timeout() -> u64 {
    60
}

fn default_write_timeout() -> u64 {
    10
}

fn default_max_message_size() -> usize {
    1024 * 1024 // 1MB
}

fn default_shutdown_timeout() -> u64 {
    10
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            max_connections_per_ip: default_max_connections_per_ip(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            max_message_size: default_max_message_size(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

/// 心跳配置（秒为单位）
///
/// 缺省字段取服务端默认值；作为 `client.heartbeat` 出现时取客户端默认值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatSettings {
    /// 探测间隔（秒）
    pub interval_secs: u64,
    /// 探测超时（秒）
    pub timeout_secs: u64,
    /// 最大连续失败次数
    pub max_missed_pings: u32,
    /// 是否收集指标
    pub enable_metrics: bool,
}

/// 只覆盖出现的字段
#[derive(Debug, Default, Deserialize)]
struct HeartbeatOverrides {
    interval_secs: Option<u64>,
    timeout_secs: Option<u64>,
    max_missed_pings: Option<u32>,
    enable_metrics: Option<bool>,
}

impl HeartbeatOverrides {
    fn apply(self, base: HeartbeatSettings) -> HeartbeatSettings {
        HeartbeatSettings {
            interval_secs: self.interval_secs.unwrap_or(base.interval_secs),
            timeout_secs: self.timeout_secs.unwrap_or(base.timeout_secs),
            max_missed_pings: self.max_missed_pings.unwrap_or(base.max_missed_pings),
            enable_metrics: self.enable_metrics.unwrap_or(base.enable_metrics),
        }
    }
}

fn deserialize_server_heartbeat<'de, D>(deserializer: D) -> Result<HeartbeatSettings, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = Option::<HeartbeatOverrides>::deserialize(deserializer)?.unwrap_or_default();
    Ok(overrides.apply(HeartbeatSettings::default()))
}

fn deserialize_client_heartbeat<'de, D>(deserializer: D) -> Result<HeartbeatSettings, D::Error>
where
    D: Deserializer<'de>,
{
    let overrides = Option::<HeartbeatOverrides>::deserialize(deserializer)?.unwrap_or_default();
    Ok(overrides.apply(default_client_heartbeat()))
}

impl HeartbeatSettings {
    pub fn to_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.interval_secs),
            timeout: Duration::from_secs(self.timeout_secs),
            max_missed_pings: self.max_missed_pings,
            enable_metrics: self.enable_metrics,
        }
    }

    fn from_config(cfg: HeartbeatConfig) -> Self {
        Self {
            interval_secs: cfg.interval.as_secs(),
            timeout_secs: cfg.timeout.as_secs(),
            max_missed_pings: cfg.max_missed_pings,
            enable_metrics: cfg.enable_metrics,
        }
    }
}

impl Default for HeartbeatSettings {
    fn default() -> Self {
        Self::from_config(HeartbeatConfig::server_default())
    }
}

/// 限速配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// 最小 ping 间隔（秒）
    #[serde(default = "default_min_ping_interval")]
    pub min_ping_interval_secs: u64,
    /// 最大违规次数
    #[serde(default = "default_max_violations")]
    pub max_violations: u32,
}

fn default_min_ping_interval() -> u64 {
    crate::websocket::DEFAULT_MIN_PING_INTERVAL.as_secs()
}

fn default_max_violations() -> u32 {
    crate::websocket::DEFAULT_MAX_VIOLATIONS
}

impl RateLimitSettings {
    pub fn to_policy(&self) -> RateLimitPolicy {
        RateLimitPolicy {
            min_interval: Duration::from_secs(self.min_ping_interval_secs),
            max_violations: self.max_violations,
        }
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            min_ping_interval_secs: default_min_ping_interval(),
            max_violations: default_max_violations(),
        }
    }
}

/// 客户端模式配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    /// 服务器地址
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// 连接超时（秒）
    #[serde(default = "default_dial_timeout")]
    pub dial_timeout_secs: u64,
    /// 单条消息读写超时（秒）
    #[serde(default = "default_message_timeout")]
    pub message_timeout_secs: u64,
    /// 发送的消息条数
    #[serde(default = "default_message_count")]
    pub message_count: u32,
    /// 消息间隔（秒），不应小于服务端的最小 ping 间隔
    #[serde(default = "default_message_interval")]
    pub message_interval_secs: u64,
    /// 客户端心跳
    #[serde(
        default = "default_client_heartbeat",
        deserialize_with = "deserialize_client_heartbeat"
    )]
    pub heartbeat: HeartbeatSettings,
}

fn default_server_url() -> String {
    "ws://localhost:8080/ws".to_string()
}

fn default_dial_timeout() -> u64 {
    30
}

fn default_message_timeout() -> u64 {
    10
}

fn default_message_count() -> u32 {
    5
}

fn default_message_interval() -> u64 {
    10
}

fn default_client_heartbeat() -> HeartbeatSettings {
    HeartbeatSettings::from_config(HeartbeatConfig::client_default())
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            dial_timeout_secs: default_dial_timeout(),
            message_timeout_secs: default_message_timeout(),
            message_count: default_message_count(),
            message_interval_secs: default_message_interval(),
            heartbeat: default_client_heartbeat(),
        }
    }
}

/// 日志配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// 日志级别（RUST_LOG 优先）
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}
