//! WebSocket 连接生命周期管理
//!
//! 负责单个连接从准入到拆除的全过程：
//! - 准入检查，占用单 IP 名额
//! - 启动与消息循环共享作用域的心跳任务
//! - 每条入站消息先经过限速检查
//! - 任何退出路径（包括 panic）都只拆除一次

use super::admission::{admission_key, AdmissionController};
use super::error::ConnectionError;
use super::heartbeat::{HeartbeatConfig, HeartbeatExit, HeartbeatMonitor, Prober};
use super::rate_limit::{ProbeKind, RateLimitPolicy, RateLimitRegistry, RateLimitState};
use super::transport::{MessageChannel, RateLimitedProber};
use super::types::{
    CloseReason, ConnectionRecord, ConnectionSummary, Frame, Inbound, StatusReport, WsStats,
};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// 生命周期参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// 服务端心跳配置
    pub heartbeat: HeartbeatConfig,
    /// 单次读取超时
    pub read_timeout: Duration,
    /// 单次写入超时
    pub write_timeout: Duration,
    /// 单条消息最大字节数
    pub max_message_size: usize,
    /// 单 IP 最大连接数
    pub max_connections_per_ip: usize,
    /// 限速策略
    pub rate_limit: RateLimitPolicy,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            heartbeat: HeartbeatConfig::server_default(),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            max_message_size: 1024 * 1024,
            max_connections_per_ip: super::admission::DEFAULT_MAX_CONNECTIONS_PER_IP,
            rate_limit: RateLimitPolicy::default(),
        }
    }
}

/// 连接作用域
///
/// 消息循环与心跳任务共享同一个取消令牌；关闭时记录原因，先写者生效。
/// 父令牌（服务器关闭）触发的取消没有原因，视为 Shutdown。
#[derive(Debug)]
pub struct ConnectionScope {
    token: CancellationToken,
    reason: Mutex<Option<CloseReason>>,
}

impl ConnectionScope {
    /// 创建挂在父令牌下的作用域
    pub fn new(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
            reason: Mutex::new(None),
        }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// 关闭作用域，返回是否为第一个关闭者
    pub fn close(&self, reason: CloseReason) -> bool {
        let first = {
            let mut slot = self.reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
                true
            } else {
                false
            }
        };
        self.token.cancel();
        first
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 关闭原因
    pub fn reason(&self) -> Option<CloseReason> {
        if let Some(reason) = self.reason.lock().clone() {
            return Some(reason);
        }
        self.token.is_cancelled().then_some(CloseReason::Shutdown)
    }
}

/// 连接资源守卫
///
/// 持有准入名额和限速状态，`release` 或 Drop 时释放，只执行一次
#[derive(Debug)]
pub struct ConnectionGuard {
    conn_id: String,
    remote_addr: SocketAddr,
    admission_key: String,
    admission: Arc<AdmissionController>,
    rate_limits: Arc<RateLimitRegistry>,
    stats: Arc<WsStats>,
    connected: bool,
    released: bool,
}

impl ConnectionGuard {
    pub fn conn_id(&self) -> &str {
        &self.conn_id
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn admission_key(&self) -> &str {
        &self.admission_key
    }

    fn mark_connected(&mut self) {
        if !self.connected {
            self.connected = true;
            self.stats.on_connect();
        }
    }

    /// 释放所有连接级资源
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        self.admission.release(&self.admission_key);
        self.rate_limits.remove(&self.conn_id);
        if self.connected {
            self.stats.on_disconnect();
        }
    }

    pub fn is_released(&self) -> bool {
        self.released
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// 连接生命周期管理器
///
/// 所有共享状态都通过 Arc 显式传入，便于测试构造相互隔离的实例
#[derive(Debug)]
pub struct ConnectionLifecycleManager {
    settings: LifecycleSettings,
    admission: Arc<AdmissionController>,
    rate_limits: Arc<RateLimitRegistry>,
    stats: Arc<WsStats>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl ConnectionLifecycleManager {
    /// 创建新的生命周期管理器
    pub fn new(settings: LifecycleSettings, shutdown: CancellationToken) -> Self {
        Self {
            admission: Arc::new(AdmissionController::new(settings.max_connections_per_ip)),
            rate_limits: Arc::new(RateLimitRegistry::new(settings.rate_limit)),
            stats: Arc::new(WsStats::new()),
            settings,
            shutdown,
            tasks: TaskTracker::new(),
        }
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn admission(&self) -> &Arc<AdmissionController> {
        &self.admission
    }

    pub fn rate_limits(&self) -> &Arc<RateLimitRegistry> {
        &self.rate_limits
    }

    pub fn stats(&self) -> &Arc<WsStats> {
        &self.stats
    }

    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// 连接任务跟踪器，关闭时等待所有连接拆除
    pub fn tasks(&self) -> &TaskTracker {
        &self.tasks
    }

    /// 活跃连接数
    pub fn active_connections(&self) -> u64 {
        self.stats.active_count()
    }

    /// 某地址的当前连接数
    pub fn connection_count(&self, address: &str) -> usize {
        self.admission.connection_count(address)
    }

    /// 诊断报告
    pub fn status_report(&self) -> StatusReport {
        StatusReport {
            status: "healthy".to_string(),
            max_connections_per_ip: self.admission.max_per_ip(),
            stats: self.stats.snapshot(),
            addresses: self.admission.snapshot(),
        }
    }

    /// 准入检查
    ///
    /// 通过时占用一个名额并返回守卫；拒绝时不分配任何资源
    pub fn admit(&self, remote_addr: SocketAddr) -> Result<ConnectionGuard, ConnectionError> {
        let key = admission_key(&remote_addr);
        if !self.admission.check_limit(&key) {
            self.stats.on_reject();
            return Err(ConnectionError::CapacityExceeded {
                address: key,
                max: self.admission.max_per_ip(),
            });
        }

        Ok(ConnectionGuard {
            conn_id: uuid::Uuid::new_v4().to_string(),
            remote_addr,
            admission_key: key,
            admission: self.admission.clone(),
            rate_limits: self.rate_limits.clone(),
            stats: self.stats.clone(),
            connected: false,
            released: false,
        })
    }

    /// 运行一个已完成握手的连接，直到它结束
    pub async fn serve<C, P>(
        &self,
        mut guard: ConnectionGuard,
        mut channel: C,
        prober: P,
    ) -> ConnectionSummary
    where
        C: MessageChannel,
        P: Prober + 'static,
    {
        guard.mark_connected();
        let scope = Arc::new(ConnectionScope::new(&self.shutdown));
        let mut record = ConnectionRecord::new(
            guard.conn_id().to_string(),
            guard.remote_addr(),
            guard.admission_key().to_string(),
            scope.clone(),
        );
        let rate_state = self.rate_limits.get_or_create(guard.conn_id());

        tracing::info!(
            "[WS] New WebSocket connection: {} from {} (active: {}, ip_conns: {})",
            record.short_id(),
            record.remote_addr,
            self.stats.active_count(),
            self.admission.connection_count(&record.admission_key)
        );

        // 消息循环以任何方式退出（包括 panic）都会停止心跳
        let _stop_heartbeat = scope.token().clone().drop_guard();

        let monitor = HeartbeatMonitor::new(self.settings.heartbeat);
        record.attach_metrics(monitor.metrics());
        let heartbeat = {
            let scope = scope.clone();
            let prober = RateLimitedProber::new(prober, rate_state.clone());
            let remote = record.remote_addr;
            tokio::spawn(async move {
                let report = monitor.run(scope.token(), &prober).await;
                if let HeartbeatExit::Exhausted { max_missed } = report.exit {
                    tracing::error!(
                        "[HEARTBEAT] Heartbeat failed for {}: max missed pings ({}) exceeded | {}",
                        remote,
                        max_missed,
                        report.metrics
                    );
                    scope.close(CloseReason::Failed(ConnectionError::HeartbeatExhausted {
                        max_missed,
                    }));
                }
                report
            })
        };

        let loop_reason = self
            .message_loop(&mut channel, &rate_state, &record)
            .await;
        scope.close(loop_reason);
        let reason = scope.reason().unwrap_or(CloseReason::Shutdown);

        let (status, text) = reason.close_status();
        if tokio::time::timeout(self.settings.write_timeout, channel.close(status, text))
            .await
            .is_err()
        {
            tracing::debug!("[WS] 关闭帧发送超时: {}", record.short_id());
        }

        let heartbeat = match heartbeat.await {
            Ok(report) => Some(report),
            Err(e) => {
                tracing::error!("[HEARTBEAT] 心跳任务异常退出: {}", e);
                None
            }
        };

        if reason.is_error() {
            self.stats.on_error();
        }
        guard.release();

        tracing::info!(
            "[WS] Connection closed: {} from {} ({}) (active: {}, messages: {}, {})",
            record.short_id(),
            record.remote_addr,
            reason,
            self.stats.active_count(),
            record.message_count(),
            record.heartbeat_snapshot()
        );

        ConnectionSummary {
            conn_id: record.id.clone(),
            remote_addr: record.remote_addr,
            reason,
            heartbeat,
            messages: record.message_count(),
            uptime: record.uptime(),
        }
    }

    /// 入站限速：对端的 ping 和数据消息共用同一个计数
    fn gate_inbound(
        rate_state: &RateLimitState,
        record: &ConnectionRecord,
        kind: &str,
    ) -> Result<(), CloseReason> {
        if rate_state.observe(ProbeKind::InboundActivity) {
            return Ok(());
        }
        let violations = rate_state.violations(ProbeKind::InboundActivity);
        tracing::warn!(
            "[RATE_LIMIT] {} rate limit exceeded for {} (violations: {})",
            kind,
            record.remote_addr,
            violations
        );
        Err(CloseReason::Failed(ConnectionError::RateLimitExceeded {
            address: record.admission_key.clone(),
            violations,
        }))
    }

    /// 消息循环：读取、限速、回显
    async fn message_loop<C>(
        &self,
        channel: &mut C,
        rate_state: &RateLimitState,
        record: &ConnectionRecord,
    ) -> CloseReason
    where
        C: MessageChannel,
    {
        let scope = record.scope();
        let read_timeout = self.settings.read_timeout;
        let write_timeout = self.settings.write_timeout;

        loop {
            let read = tokio::select! {
                biased;
                _ = scope.token().cancelled() => {
                    return scope.reason().unwrap_or(CloseReason::Shutdown);
                }
                r = tokio::time::timeout(read_timeout, channel.read()) => r,
            };

            let frame = match read {
                Err(_) => {
                    tracing::warn!("[WS] Read timeout from {}", record.remote_addr);
                    return CloseReason::Failed(ConnectionError::ReadTimeout(read_timeout));
                }
                Ok(Err(e)) => {
                    tracing::warn!("[WS] Read error from {}: {}", record.remote_addr, e);
                    return CloseReason::Failed(e);
                }
                Ok(Ok(Inbound::Closed)) => return CloseReason::PeerClosed,
                Ok(Ok(Inbound::Control)) => continue,
                Ok(Ok(Inbound::Ping)) => {
                    if let Err(reason) = Self::gate_inbound(rate_state, record, "ping") {
                        return reason;
                    }
                    tracing::debug!("[WS] Ping from {}", record.remote_addr);
                    continue;
                }
                Ok(Ok(Inbound::Data(frame))) => frame,
            };

            if frame.len() > self.settings.max_message_size {
                return CloseReason::Failed(ConnectionError::MessageTooLarge {
                    size: frame.len(),
                    max: self.settings.max_message_size,
                });
            }

            if let Err(reason) = Self::gate_inbound(rate_state, record, "message") {
                return reason;
            }

            self.stats.on_message();
            record.increment_message_count();
            tracing::debug!(
                "[WS] Server received from {}: {}",
                record.remote_addr,
                frame.preview()
            );

            let reply: Frame = frame.echo();
            let written = tokio::select! {
                biased;
                _ = scope.token().cancelled() => {
                    return scope.reason().unwrap_or(CloseReason::Shutdown);
                }
                r = tokio::time::timeout(write_timeout, channel.write(reply)) => r,
            };

            match written {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    tracing::warn!("[WS] Write error to {}: {}", record.remote_addr, e);
                    return CloseReason::Failed(e);
                }
                Err(_) => {
                    tracing::warn!("[WS] Write timeout to {}", record.remote_addr);
                    return CloseReason::Failed(ConnectionError::WriteTimeout(write_timeout));
                }
            }
        }
    }
}
