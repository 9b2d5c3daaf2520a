//! 心跳监控
//!
//! 按固定间隔发送存活探测，每次探测受超时约束，连续失败达到阈值后判定连接死亡。
//! 被取消与对端无响应是两种不同的结果，调用方需要区分。

use super::error::ProbeError;
use crate::config::ConfigError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// 存活探测原语
///
/// 发送一次探测并等待确认；超时由监控器负责
#[async_trait]
pub trait Prober: Send + Sync {
    async fn probe(&self) -> Result<(), ProbeError>;
}

/// 心跳配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatConfig {
    /// 探测间隔
    pub interval: Duration,
    /// 单次探测等待 pong 的最长时间，必须小于间隔
    pub timeout: Duration,
    /// 允许的最大连续失败次数
    pub max_missed_pings: u32,
    /// 是否收集指标
    pub enable_metrics: bool,
}

impl HeartbeatConfig {
    /// 服务端默认配置
    pub fn server_default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            timeout: Duration::from_secs(20),
            max_missed_pings: 2,
            enable_metrics: true,
        }
    }

    /// 客户端默认配置（更短的间隔，更快发现故障）
    pub fn client_default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(3),
            max_missed_pings: 2,
            enable_metrics: true,
        }
    }

    /// 仅保活：不收集指标，失败不设上限
    pub fn keepalive_only(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            timeout,
            max_missed_pings: u32::MAX,
            enable_metrics: false,
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "heartbeat interval must be greater than zero".to_string(),
            ));
        }
        if self.timeout.is_zero() || self.timeout >= self.interval {
            return Err(ConfigError::ValidationError(format!(
                "heartbeat timeout ({:?}) must be greater than zero and less than interval ({:?})",
                self.timeout, self.interval
            )));
        }
        if self.max_missed_pings == 0 {
            return Err(ConfigError::ValidationError(
                "max_missed_pings must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self::server_default()
    }
}

/// 心跳指标
///
/// 只通过原子操作修改，日志和健康检查可以不加锁并发读取
#[derive(Debug)]
pub struct HeartbeatMetrics {
    enabled: bool,
    pings_sent: AtomicU64,
    pongs_received: AtomicU64,
    failed_pings: AtomicU64,
    last_latency_ms: AtomicU64,
}

impl HeartbeatMetrics {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            pings_sent: AtomicU64::new(0),
            pongs_received: AtomicU64::new(0),
            failed_pings: AtomicU64::new(0),
            last_latency_ms: AtomicU64::new(0),
        }
    }

    fn record_sent(&self) {
        if self.enabled {
            self.pings_sent.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_success(&self, latency: Duration) {
        if self.enabled {
            self.last_latency_ms
                .store(latency.as_millis() as u64, Ordering::Relaxed);
            self.pongs_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn record_failure(&self) {
        if self.enabled {
            self.failed_pings.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn pings_sent(&self) -> u64 {
        self.pings_sent.load(Ordering::Relaxed)
    }

    pub fn pongs_received(&self) -> u64 {
        self.pongs_received.load(Ordering::Relaxed)
    }

    pub fn failed_pings(&self) -> u64 {
        self.failed_pings.load(Ordering::Relaxed)
    }

    pub fn last_latency_ms(&self) -> u64 {
        self.last_latency_ms.load(Ordering::Relaxed)
    }

    /// 获取指标快照
    pub fn snapshot(&self) -> HeartbeatMetricsSnapshot {
        HeartbeatMetricsSnapshot {
            pings_sent: self.pings_sent(),
            pongs_received: self.pongs_received(),
            failed_pings: self.failed_pings(),
            last_latency_ms: self.last_latency_ms(),
        }
    }
}

/// 心跳指标快照（可序列化）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMetricsSnapshot {
    pub pings_sent: u64,
    pub pongs_received: u64,
    pub failed_pings: u64,
    pub last_latency_ms: u64,
}

impl std::fmt::Display for HeartbeatMetricsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Pings={} Pongs={} Failed={} Latency={}ms",
            self.pings_sent, self.pongs_received, self.failed_pings, self.last_latency_ms
        )
    }
}

/// 心跳状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    /// 尚未启动
    Idle,
    /// 计时器已启动，等待下一次探测
    Waiting,
    /// 探测进行中
    Probing,
    /// 连续失败达到阈值
    Failed,
    /// 被取消
    Stopped,
}

impl HeartbeatState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => HeartbeatState::Idle,
            1 => HeartbeatState::Waiting,
            2 => HeartbeatState::Probing,
            3 => HeartbeatState::Failed,
            _ => HeartbeatState::Stopped,
        }
    }
}

/// 心跳结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatExit {
    /// 所属作用域被取消
    Cancelled,
    /// 连续失败达到阈值
    Exhausted { max_missed: u32 },
}

/// 心跳结束报告
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub exit: HeartbeatExit,
    pub metrics: HeartbeatMetricsSnapshot,
}

impl HeartbeatReport {
    /// 是否为对端无响应导致的失败
    pub fn is_failure(&self) -> bool {
        matches!(self.exit, HeartbeatExit::Exhausted { .. })
    }
}

/// 心跳监控器
#[derive(Debug)]
pub struct HeartbeatMonitor {
    config: HeartbeatConfig,
    metrics: Arc<HeartbeatMetrics>,
    state: AtomicU8,
    missed: AtomicU32,
}

impl HeartbeatMonitor {
    /// 创建新的心跳监控器
    pub fn new(config: HeartbeatConfig) -> Self {
        Self {
            metrics: Arc::new(HeartbeatMetrics::new(config.enable_metrics)),
            config,
            state: AtomicU8::new(HeartbeatState::Idle as u8),
            missed: AtomicU32::new(0),
        }
    }

    pub fn config(&self) -> &HeartbeatConfig {
        &self.config
    }

    /// 共享的指标句柄
    pub fn metrics(&self) -> Arc<HeartbeatMetrics> {
        self.metrics.clone()
    }

    pub fn state(&self) -> HeartbeatState {
        HeartbeatState::from_u8(self.state.load(Ordering::Relaxed))
    }

    /// 当前连续失败次数
    pub fn missed_pings(&self) -> u32 {
        self.missed.load(Ordering::Relaxed)
    }

    fn set_state(&self, state: HeartbeatState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    fn finish(&self, exit: HeartbeatExit) -> HeartbeatReport {
        self.set_state(match exit {
            HeartbeatExit::Cancelled => HeartbeatState::Stopped,
            HeartbeatExit::Exhausted { .. } => HeartbeatState::Failed,
        });
        HeartbeatReport {
            exit,
            metrics: self.metrics.snapshot(),
        }
    }

    /// 运行心跳循环，直到被取消或连续失败达到阈值
    pub async fn run<P>(&self, token: &CancellationToken, prober: &P) -> HeartbeatReport
    where
        P: Prober + ?Sized,
    {
        self.set_state(HeartbeatState::Waiting);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => return self.finish(HeartbeatExit::Cancelled),
                _ = tokio::time::sleep(self.config.interval) => {}
            }

            self.set_state(HeartbeatState::Probing);
            let start = Instant::now();
            let result = tokio::select! {
                biased;
                _ = token.cancelled() => return self.finish(HeartbeatExit::Cancelled),
                r = tokio::time::timeout(self.config.timeout, prober.probe()) => r,
            };
            self.metrics.record_sent();

            match result.unwrap_or(Err(ProbeError::Timeout(self.config.timeout))) {
                Ok(()) => {
                    let latency = start.elapsed();
                    self.metrics.record_success(latency);
                    self.missed.store(0, Ordering::Relaxed);
                    tracing::debug!(
                        "[HEARTBEAT] 探测成功 (latency: {}ms)",
                        latency.as_millis()
                    );
                }
                Err(e) => {
                    self.metrics.record_failure();
                    let missed = self.missed.fetch_add(1, Ordering::Relaxed) + 1;
                    tracing::warn!(
                        "[HEARTBEAT] 探测失败: {} (missed: {}/{})",
                        e,
                        missed,
                        self.config.max_missed_pings
                    );
                    if missed >= self.config.max_missed_pings {
                        return self.finish(HeartbeatExit::Exhausted {
                            max_missed: self.config.max_missed_pings,
                        });
                    }
                }
            }

            self.set_state(HeartbeatState::Waiting);
        }
    }
}
