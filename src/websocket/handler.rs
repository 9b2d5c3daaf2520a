//! WebSocket 请求处理器
//!
//! 处理连接升级、健康检查和状态查询

use super::lifecycle::ConnectionLifecycleManager;
use super::transport::{MessageChannel, PongTracker, SinkProber};
use super::types::{CloseStatus, Frame, HealthReport, Inbound, StatusReport};
use super::ConnectionError;
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::Mutex;

/// WebSocket 处理器状态
#[derive(Clone)]
pub struct WsHandlerState {
    /// 连接生命周期管理器
    pub lifecycle: Arc<ConnectionLifecycleManager>,
}

impl WsHandlerState {
    pub fn new(lifecycle: Arc<ConnectionLifecycleManager>) -> Self {
        Self { lifecycle }
    }
}

/// axum WebSocket 上的探测器
pub type AxumProber = SinkProber<SplitSink<WebSocket, Message>, Message>;

/// axum WebSocket 消息通道
pub struct AxumChannel {
    stream: SplitStream<WebSocket>,
    sink: Arc<Mutex<SplitSink<WebSocket, Message>>>,
    pongs: PongTracker,
}

impl AxumChannel {
    /// 拆分 socket，返回消息通道和共享同一写端的探测器
    pub fn split(socket: WebSocket) -> (Self, AxumProber) {
        let (sink, stream) = socket.split();
        let sink = Arc::new(Mutex::new(sink));
        let pongs = PongTracker::new();
        let prober = SinkProber::new(sink.clone(), pongs.clone(), Message::Ping);
        (
            Self {
                stream,
                sink,
                pongs,
            },
            prober,
        )
    }
}

#[async_trait]
impl MessageChannel for AxumChannel {
    async fn read(&mut self) -> Result<Inbound, ConnectionError> {
        match self.stream.next().await {
            None => Ok(Inbound::Closed),
            Some(Err(e)) => Err(ConnectionError::transport(e)),
            Some(Ok(Message::Text(text))) => Ok(Inbound::Data(Frame::Text(text))),
            Some(Ok(Message::Binary(data))) => Ok(Inbound::Data(Frame::Binary(data))),
            // tungstenite 自动回复 pong，这里只上报给限速
            Some(Ok(Message::Ping(_))) => Ok(Inbound::Ping),
            Some(Ok(Message::Pong(data))) => {
                // 收到 pong，确认对应的探测
                self.pongs.ack(&data);
                Ok(Inbound::Control)
            }
            Some(Ok(Message::Close(_))) => Ok(Inbound::Closed),
        }
    }

    async fn write(&mut self, frame: Frame) -> Result<(), ConnectionError> {
        let msg = match frame {
            Frame::Text(text) => Message::Text(text),
            Frame::Binary(data) => Message::Binary(data),
        };
        self.sink
            .lock()
            .await
            .send(msg)
            .await
            .map_err(ConnectionError::transport)
    }

    async fn close(&mut self, status: CloseStatus, reason: &str) {
        let mut sink = self.sink.lock().await;
        let frame = CloseFrame {
            code: status.code(),
            reason: Cow::Owned(reason.to_string()),
        };
        // 对端可能已经关闭，忽略错误
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    }
}

/// WebSocket 升级处理器
///
/// 先做准入检查，超限时直接返回 429，不进行握手
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<WsHandlerState>,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
) -> Response {
    let guard = match state.lifecycle.admit(remote_addr) {
        Ok(guard) => guard,
        Err(e) => {
            tracing::warn!("[WS] Connection limit exceeded for {}: {}", remote_addr, e);
            return (StatusCode::TOO_MANY_REQUESTS, "Too many connections from your IP")
                .into_response();
        }
    };

    let max_message_size = state.lifecycle.settings().max_message_size;
    ws.max_message_size(max_message_size)
        .on_failed_upgrade(move |e| {
            tracing::warn!(
                "[WS] Failed to accept WebSocket connection from {}: {}",
                remote_addr,
                e
            );
        })
        .on_upgrade(move |socket| async move {
            let (channel, prober) = AxumChannel::split(socket);
            let lifecycle = state.lifecycle.clone();
            lifecycle
                .tasks()
                .track_future(lifecycle.serve(guard, channel, prober))
                .await;
        })
}

/// 健康检查
pub async fn health_handler(State(state): State<WsHandlerState>) -> Json<HealthReport> {
    Json(HealthReport {
        status: "healthy".to_string(),
        active_connections: state.lifecycle.active_connections(),
    })
}

/// 连接状态（按地址的连接数）
pub async fn status_handler(State(state): State<WsHandlerState>) -> Json<StatusReport> {
    Json(state.lifecycle.status_report())
}
