//! 传输层抽象
//!
//! 生命周期管理器只依赖这里的两个原语：
//! - `MessageChannel`：读写一个应用消息单元
//! - `Prober`：发送一次 ping 并等待对应的 pong

use super::error::{ConnectionError, ProbeError};
use super::heartbeat::Prober;
use super::rate_limit::{ProbeKind, RateLimitState};
use super::types::{CloseStatus, Frame, Inbound};
use async_trait::async_trait;
use futures::{Sink, SinkExt};
use std::fmt::Display;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};

/// 消息通道
///
/// 超时由调用方控制，实现只需在对端关闭或出错时返回
#[async_trait]
pub trait MessageChannel: Send {
    /// 读取一个入站单元
    async fn read(&mut self) -> Result<Inbound, ConnectionError>;

    /// 写出一个消息
    async fn write(&mut self, frame: Frame) -> Result<(), ConnectionError>;

    /// 以指定状态关闭连接，错误被忽略
    async fn close(&mut self, status: CloseStatus, reason: &str);
}

/// Pong 确认跟踪
///
/// ping 负载携带递增序号，读循环收到 pong 后记录已确认的最大序号
#[derive(Debug, Clone)]
pub struct PongTracker {
    acked: Arc<watch::Sender<u64>>,
}

impl PongTracker {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { acked: Arc::new(tx) }
    }

    /// 编码 ping 负载
    pub fn encode(seq: u64) -> Vec<u8> {
        seq.to_be_bytes().to_vec()
    }

    /// 记录收到的 pong，负载无法识别时忽略
    pub fn ack(&self, payload: &[u8]) {
        let Ok(bytes) = <[u8; 8]>::try_from(payload) else {
            tracing::debug!("[WS] 忽略无法识别的 pong 负载 ({} bytes)", payload.len());
            return;
        };
        let seq = u64::from_be_bytes(bytes);
        self.acked.send_if_modified(|current| {
            if seq > *current {
                *current = seq;
                true
            } else {
                false
            }
        });
    }

    /// 已确认的最大序号
    pub fn acked(&self) -> u64 {
        *self.acked.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.acked.subscribe()
    }
}

impl Default for PongTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// 基于 Sink 的探测器
///
/// 与消息写入共享同一个 Sink；pong 由读循环通过 `PongTracker` 回报
pub struct SinkProber<S, M> {
    sink: Arc<Mutex<S>>,
    pongs: PongTracker,
    next_seq: AtomicU64,
    make_ping: fn(Vec<u8>) -> M,
}

impl<S, M> SinkProber<S, M> {
    pub fn new(sink: Arc<Mutex<S>>, pongs: PongTracker, make_ping: fn(Vec<u8>) -> M) -> Self {
        Self {
            sink,
            pongs,
            next_seq: AtomicU64::new(0),
            make_ping,
        }
    }
}

#[async_trait]
impl<S, M> Prober for SinkProber<S, M>
where
    S: Sink<M> + Unpin + Send + 'static,
    S::Error: Display,
    M: Send + 'static,
{
    async fn probe(&self) -> Result<(), ProbeError> {
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let mut acked = self.pongs.subscribe();

        {
            let ping = (self.make_ping)(PongTracker::encode(seq));
            let mut sink = self.sink.lock().await;
            sink.send(ping)
                .await
                .map_err(|e| ProbeError::Transport(e.to_string()))?;
        }

        acked
            .wait_for(|acked| *acked >= seq)
            .await
            .map(|_| ())
            .map_err(|_| ProbeError::Transport("连接已关闭".to_string()))
    }
}

/// 出站探测限速包装
///
/// 每次探测前记录一次出站观测，被拒绝的探测计为失败
pub struct RateLimitedProber<P> {
    inner: P,
    state: Arc<RateLimitState>,
}

impl<P> RateLimitedProber<P> {
    pub fn new(inner: P, state: Arc<RateLimitState>) -> Self {
        Self { inner, state }
    }
}

#[async_trait]
impl<P: Prober> Prober for RateLimitedProber<P> {
    async fn probe(&self) -> Result<(), ProbeError> {
        if !self.state.observe(ProbeKind::OutboundProbe) {
            return Err(ProbeError::RateLimited);
        }
        self.inner.probe().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::rate_limit::RateLimitPolicy;
    use futures::channel::mpsc;
    use futures::StreamExt;
    use std::time::Duration;

    #[test]
    fn test_pong_tracker_keeps_max_seq() {
        let tracker = PongTracker::new();
        tracker.ack(&PongTracker::encode(3));
        tracker.ack(&PongTracker::encode(1));
        assert_eq!(tracker.acked(), 3);
        tracker.ack(b"garbage");
        assert_eq!(tracker.acked(), 3);
    }

    #[tokio::test]
    async fn test_sink_prober_waits_for_matching_pong() {
        let (tx, mut rx) = mpsc::unbounded::<Vec<u8>>();
        let tracker = PongTracker::new();
        let prober = Arc::new(SinkProber::new(
            Arc::new(Mutex::new(tx)),
            tracker.clone(),
            |payload| payload,
        ));

        let probe = {
            let prober = prober.clone();
            tokio::spawn(async move { prober.probe().await })
        };

        // 模拟对端回 pong
        let ping = rx.next().await.unwrap();
        assert_eq!(ping, PongTracker::encode(1));
        tracker.ack(&ping);

        let result = tokio::time::timeout(Duration::from_secs(1), probe)
            .await
            .unwrap()
            .unwrap();
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_sink_prober_errors_when_sink_closed() {
        let (tx, rx) = mpsc::unbounded::<Vec<u8>>();
        drop(rx);
        let prober = SinkProber::new(Arc::new(Mutex::new(tx)), PongTracker::new(), |p| p);
        assert!(matches!(prober.probe().await, Err(ProbeError::Transport(_))));
    }

    struct AlwaysOk;

    #[async_trait]
    impl Prober for AlwaysOk {
        async fn probe(&self) -> Result<(), ProbeError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rate_limited_prober_rejects_flood() {
        let state = Arc::new(RateLimitState::new(RateLimitPolicy {
            min_interval: Duration::from_secs(10),
            max_violations: 1,
        }));
        let prober = RateLimitedProber::new(AlwaysOk, state.clone());
        assert!(prober.probe().await.is_ok());
        assert!(prober.probe().await.is_ok());
        assert_eq!(prober.probe().await, Err(ProbeError::RateLimited));
        assert!(state.is_rejected(ProbeKind::OutboundProbe));
        assert!(!state.is_rejected(ProbeKind::InboundActivity));
    }
}
