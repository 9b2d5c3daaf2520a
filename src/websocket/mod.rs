//! WebSocket 支持模块
//!
//! 长连接回显服务的连接健康管理：
//! - 按 IP 的连接准入控制
//! - 心跳检测（超时、失败阈值、延迟指标）
//! - Ping / 入站消息频率限制
//! - 连接生命周期与资源清理

mod admission;
mod error;
mod handler;
mod heartbeat;
mod lifecycle;
mod rate_limit;
mod transport;
mod types;

pub use admission::{
    admission_key, AdmissionController, AdmissionEntry, DEFAULT_MAX_CONNECTIONS_PER_IP,
};
pub use error::{ConnectionError, ProbeError};
pub use handler::{health_handler, status_handler, ws_handler, AxumChannel, AxumProber, WsHandlerState};
pub use heartbeat::{
    HeartbeatConfig, HeartbeatExit, HeartbeatMetrics, HeartbeatMetricsSnapshot, HeartbeatMonitor,
    HeartbeatReport, HeartbeatState, Prober,
};
pub use lifecycle::{
    ConnectionGuard, ConnectionLifecycleManager, ConnectionScope, LifecycleSettings,
};
pub use rate_limit::{
    ProbeKind, RateLimitPolicy, RateLimitRegistry, RateLimitState, DEFAULT_MAX_VIOLATIONS,
    DEFAULT_MIN_PING_INTERVAL,
};
pub use transport::{MessageChannel, PongTracker, RateLimitedProber, SinkProber};
pub use types::{
    CloseReason, CloseStatus, ConnectionRecord, ConnectionSummary, Frame, HealthReport, Inbound,
    StatusReport, WsStats, WsStatsSnapshot, ECHO_PREFIX,
};
