//! WebSocket 类型定义
//!
//! 定义连接记录、消息帧、关闭原因和统计类型

use super::admission::AdmissionEntry;
use super::error::ConnectionError;
use super::heartbeat::{HeartbeatMetrics, HeartbeatMetricsSnapshot, HeartbeatReport};
use super::lifecycle::ConnectionScope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// 回显前缀
pub const ECHO_PREFIX: &str = "Server echoes: ";

/// 应用层消息帧
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Vec<u8>),
}

impl Frame {
    /// 负载字节数
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(t) => t.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 生成回显帧，保持消息类型不变
    pub fn echo(&self) -> Frame {
        match self {
            Frame::Text(t) => Frame::Text(format!("{}{}", ECHO_PREFIX, t)),
            Frame::Binary(b) => {
                let mut out = Vec::with_capacity(ECHO_PREFIX.len() + b.len());
                out.extend_from_slice(ECHO_PREFIX.as_bytes());
                out.extend_from_slice(b);
                Frame::Binary(out)
            }
        }
    }

    /// 日志用的可读形式
    pub fn preview(&self) -> String {
        match self {
            Frame::Text(t) => t.clone(),
            Frame::Binary(b) => format!("<{} bytes binary>", b.len()),
        }
    }
}

/// 一次读取的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    /// 应用数据
    Data(Frame),
    /// 对端主动发起的 ping，pong 由传输层自动回复，但仍需经过入站限速
    Ping,
    /// 其余控制帧（pong 等），已由传输层处理，不计入限速
    Control,
    /// 对端关闭
    Closed,
}

/// WebSocket 关闭状态码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseStatus {
    Normal,
    GoingAway,
    PolicyViolation,
    MessageTooBig,
    InternalError,
}

impl CloseStatus {
    /// RFC 6455 状态码
    pub fn code(self) -> u16 {
        match self {
            CloseStatus::Normal => 1000,
            CloseStatus::GoingAway => 1001,
            CloseStatus::PolicyViolation => 1008,
            CloseStatus::MessageTooBig => 1009,
            CloseStatus::InternalError => 1011,
        }
    }
}

/// 连接关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 对端正常关闭
    PeerClosed,
    /// 服务器关闭
    Shutdown,
    /// 连接因错误终止
    Failed(ConnectionError),
}

impl CloseReason {
    /// 关闭连接时使用的状态码和原因
    pub fn close_status(&self) -> (CloseStatus, &'static str) {
        match self {
            CloseReason::PeerClosed => (CloseStatus::Normal, ""),
            CloseReason::Shutdown => (CloseStatus::GoingAway, "server shutting down"),
            CloseReason::Failed(ConnectionError::RateLimitExceeded { .. }) => {
                (CloseStatus::PolicyViolation, "rate limit exceeded")
            }
            CloseReason::Failed(ConnectionError::MessageTooLarge { .. }) => {
                (CloseStatus::MessageTooBig, "message too big")
            }
            CloseReason::Failed(ConnectionError::HeartbeatExhausted { .. }) => {
                (CloseStatus::InternalError, "heartbeat failed")
            }
            CloseReason::Failed(_) => (CloseStatus::InternalError, ""),
        }
    }

    /// 是否为错误导致的关闭
    pub fn is_error(&self) -> bool {
        matches!(self, CloseReason::Failed(_))
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "peer closed"),
            CloseReason::Shutdown => write!(f, "server shutdown"),
            CloseReason::Failed(e) => write!(f, "{}", e),
        }
    }
}

/// 连接记录
///
/// 由处理该连接的生命周期管理器独占，连接关闭时销毁。
/// 持有连接的取消作用域，心跳任务与消息循环共享同一个作用域。
#[derive(Debug)]
pub struct ConnectionRecord {
    /// 连接唯一标识
    pub id: String,
    /// 远端地址
    pub remote_addr: SocketAddr,
    /// 准入键（IP）
    pub admission_key: String,
    /// 连接建立时间
    pub connected_at: DateTime<Utc>,
    created_at: Instant,
    scope: Arc<ConnectionScope>,
    messages: AtomicU64,
    metrics: Option<Arc<HeartbeatMetrics>>,
}

impl ConnectionRecord {
    /// 创建新连接记录
    pub fn new(
        id: String,
        remote_addr: SocketAddr,
        admission_key: String,
        scope: Arc<ConnectionScope>,
    ) -> Self {
        Self {
            id,
            remote_addr,
            admission_key,
            connected_at: Utc::now(),
            created_at: Instant::now(),
            scope,
            messages: AtomicU64::new(0),
            metrics: None,
        }
    }

    /// 连接的取消作用域
    pub fn scope(&self) -> &Arc<ConnectionScope> {
        &self.scope
    }

    /// 绑定心跳指标
    pub fn attach_metrics(&mut self, metrics: Arc<HeartbeatMetrics>) {
        self.metrics = Some(metrics);
    }

    /// 当前心跳指标快照
    pub fn heartbeat_snapshot(&self) -> HeartbeatMetricsSnapshot {
        self.metrics
            .as_ref()
            .map(|m| m.snapshot())
            .unwrap_or_default()
    }

    /// 增加消息计数
    pub fn increment_message_count(&self) -> u64 {
        self.messages.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn message_count(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    /// 连接时长
    pub fn uptime(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// 日志用的短 ID
    pub fn short_id(&self) -> &str {
        self.id.get(..8).unwrap_or(&self.id)
    }
}

/// 连接结束摘要
#[derive(Debug, Clone)]
pub struct ConnectionSummary {
    pub conn_id: String,
    pub remote_addr: SocketAddr,
    pub reason: CloseReason,
    /// 心跳任务的结束报告；任务异常退出时为 None
    pub heartbeat: Option<HeartbeatReport>,
    pub messages: u64,
    pub uptime: Duration,
}

/// WebSocket 服务器统计
#[derive(Debug, Default)]
pub struct WsStats {
    /// 总连接数
    pub total_connections: AtomicU64,
    /// 活跃连接数
    pub active_connections: AtomicU64,
    /// 被准入控制拒绝的连接数
    pub rejected_connections: AtomicU64,
    /// 总消息数
    pub total_messages: AtomicU64,
    /// 异常关闭的连接数
    pub total_errors: AtomicU64,
}

impl WsStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// 记录新连接
    pub fn on_connect(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_connections.fetch_add(1, Ordering::Relaxed);
    }

    /// 记录断开连接
    pub fn on_disconnect(&self) {
        self.active_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn on_reject(&self) {
        self.rejected_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_message(&self) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn on_error(&self) {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// 获取活跃连接数
    pub fn active_count(&self) -> u64 {
        self.active_connections.load(Ordering::Relaxed)
    }

    /// 获取统计快照
    pub fn snapshot(&self) -> WsStatsSnapshot {
        WsStatsSnapshot {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            rejected_connections: self.rejected_connections.load(Ordering::Relaxed),
            total_messages: self.total_messages.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
        }
    }
}

/// WebSocket 统计快照（可序列化）
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WsStatsSnapshot {
    pub total_connections: u64,
    pub active_connections: u64,
    pub rejected_connections: u64,
    pub total_messages: u64,
    pub total_errors: u64,
}

/// /health 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub status: String,
    pub active_connections: u64,
}

/// /status 响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub status: String,
    pub max_connections_per_ip: usize,
    pub stats: WsStatsSnapshot,
    pub addresses: Vec<AdmissionEntry>,
}
