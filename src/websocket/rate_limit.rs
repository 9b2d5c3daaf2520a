//! Ping 频率限制
//!
//! 每个连接维护两个方向的违规计数：
//! - 服务端自身发出的探测（OutboundProbe）
//! - 客户端的入站活动（InboundActivity）
//!
//! 传输层不暴露客户端的协议级 ping 帧，因此入站方向对所有应用消息统一限速，
//! 客户端 ping 限速与入站消息限速是同一个机制。

use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// 默认最小 ping 间隔
pub const DEFAULT_MIN_PING_INTERVAL: Duration = Duration::from_secs(10);

/// 默认最大违规次数
pub const DEFAULT_MAX_VIOLATIONS: u32 = 3;

/// 观测方向
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeKind {
    /// 服务端发出的探测
    OutboundProbe,
    /// 客户端入站活动（消息 / ping）
    InboundActivity,
}

/// 限速策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitPolicy {
    /// 两次观测之间的最小间隔
    pub min_interval: Duration,
    /// 允许的最大连续违规次数，超过后断开
    pub max_violations: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            min_interval: DEFAULT_MIN_PING_INTERVAL,
            max_violations: DEFAULT_MAX_VIOLATIONS,
        }
    }
}

/// 单个方向的计数状态
#[derive(Debug, Default, Clone, Copy)]
struct DirectionState {
    last_seen: Option<Instant>,
    violations: u32,
    rejected: bool,
}

impl DirectionState {
    fn observe(&mut self, now: Instant, policy: &RateLimitPolicy) -> bool {
        if self.rejected {
            return false;
        }

        let Some(last) = self.last_seen else {
            self.last_seen = Some(now);
            return true;
        };
        self.last_seen = Some(now);

        if now.saturating_duration_since(last) < policy.min_interval {
            self.violations += 1;
            if self.violations > policy.max_violations {
                self.rejected = true;
                return false;
            }
        } else {
            self.violations = 0;
        }
        true
    }
}

#[derive(Debug, Default)]
struct Directions {
    outbound: DirectionState,
    inbound: DirectionState,
}

impl Directions {
    fn get_mut(&mut self, kind: ProbeKind) -> &mut DirectionState {
        match kind {
            ProbeKind::OutboundProbe => &mut self.outbound,
            ProbeKind::InboundActivity => &mut self.inbound,
        }
    }

    fn get(&self, kind: ProbeKind) -> &DirectionState {
        match kind {
            ProbeKind::OutboundProbe => &self.outbound,
            ProbeKind::InboundActivity => &self.inbound,
        }
    }
}

/// 单个连接的限速状态
#[derive(Debug)]
pub struct RateLimitState {
    policy: RateLimitPolicy,
    inner: Mutex<Directions>,
}

impl RateLimitState {
    /// 创建新的限速状态
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            inner: Mutex::new(Directions::default()),
        }
    }

    /// 记录一次观测
    ///
    /// 返回 false 表示违规次数已超过上限，调用方必须断开连接。
    /// 一旦拒绝，该方向会持续拒绝直到状态随连接一起丢弃。
    pub fn observe(&self, kind: ProbeKind) -> bool {
        self.observe_at(kind, Instant::now())
    }

    /// 以指定时间点记录一次观测
    pub fn observe_at(&self, kind: ProbeKind, now: Instant) -> bool {
        self.inner.lock().get_mut(kind).observe(now, &self.policy)
    }

    /// 当前连续违规次数
    pub fn violations(&self, kind: ProbeKind) -> u32 {
        self.inner.lock().get(kind).violations
    }

    /// 该方向是否已被拒绝
    pub fn is_rejected(&self, kind: ProbeKind) -> bool {
        self.inner.lock().get(kind).rejected
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}

/// 限速状态注册表
///
/// 连接 ID -> 限速状态，连接关闭时移除
#[derive(Debug)]
pub struct RateLimitRegistry {
    policy: RateLimitPolicy,
    states: DashMap<String, Arc<RateLimitState>>,
}

impl RateLimitRegistry {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            states: DashMap::new(),
        }
    }

    /// 获取或创建连接的限速状态
    pub fn get_or_create(&self, conn_id: &str) -> Arc<RateLimitState> {
        self.states
            .entry(conn_id.to_string())
            .or_insert_with(|| Arc::new(RateLimitState::new(self.policy)))
            .clone()
    }

    /// 获取连接的限速状态
    pub fn get(&self, conn_id: &str) -> Option<Arc<RateLimitState>> {
        self.states.get(conn_id).map(|r| r.clone())
    }

    /// 移除连接的限速状态
    pub fn remove(&self, conn_id: &str) -> Option<Arc<RateLimitState>> {
        self.states.remove(conn_id).map(|(_, state)| state)
    }

    /// 当前跟踪的连接数
    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn policy(&self) -> &RateLimitPolicy {
        &self.policy
    }
}

impl Default for RateLimitRegistry {
    fn default() -> Self {
        Self::new(RateLimitPolicy::default())
    }
}
