//! 连接错误类型
//!
//! 所有错误都只影响单个连接，不会波及准入表、其他连接或监听循环

use std::time::Duration;
use thiserror::Error;

/// 单次探测失败
///
/// 心跳监控对所有探测错误一视同仁
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ProbeError {
    /// 等待 pong 超时
    #[error("探测超时 ({0:?})")]
    Timeout(Duration),
    /// 发送 ping 或等待 pong 时传输层出错
    #[error("探测传输错误: {0}")]
    Transport(String),
    /// 服务端自身的探测频率超出限制
    #[error("出站探测频率超限")]
    RateLimited,
}

/// 连接级错误
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ConnectionError {
    /// 单地址连接数已达上限，调用方可稍后重试
    #[error("Too many connections from {address} (max: {max})")]
    CapacityExceeded { address: String, max: usize },
    /// 连续探测失败达到阈值
    #[error("max missed pings ({max_missed}) exceeded")]
    HeartbeatExhausted { max_missed: u32 },
    /// 客户端消息频率超限
    #[error("message rate limit exceeded for {address} (violations: {violations})")]
    RateLimitExceeded { address: String, violations: u32 },
    /// 读写 I/O 错误
    #[error("传输错误: {0}")]
    Transport(String),
    /// 读取超时
    #[error("读取超时 ({0:?})")]
    ReadTimeout(Duration),
    /// 写入超时
    #[error("写入超时 ({0:?})")]
    WriteTimeout(Duration),
    /// 入站消息过大
    #[error("Message too large: {size} bytes (max: {max} bytes)")]
    MessageTooLarge { size: usize, max: usize },
}

impl ConnectionError {
    /// 创建传输错误
    pub fn transport(msg: impl std::fmt::Display) -> Self {
        ConnectionError::Transport(msg.to_string())
    }
}
