//! 客户端模式
//!
//! 连接回显服务器，按固定间隔发送测试消息并等待回显，
//! 同时运行客户端心跳。消息间隔期间持续读取，保证 pong 能被及时确认。

use crate::config::ClientConfig;
use crate::websocket::{
    CloseReason, CloseStatus, ConnectionError, ConnectionScope, Frame, HeartbeatExit,
    HeartbeatMetricsSnapshot, HeartbeatMonitor, Inbound, MessageChannel, PongTracker, SinkProber,
};
use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use url::Url;

type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// tungstenite 连接上的探测器
pub type TungsteniteProber = SinkProber<SplitSink<ClientStream, Message>, Message>;

/// tungstenite 消息通道
pub struct TungsteniteChannel {
    stream: SplitStream<ClientStream>,
    sink: Arc<Mutex<SplitSink<ClientStream, Message>>>,
    pongs: PongTracker,
}

impl TungsteniteChannel {
    /// 拆分连接，返回消息通道和共享同一写端的探测器
    pub fn split(socket: ClientStream) -> (Self, TungsteniteProber) {
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
impl MessageChannel for TungsteniteChannel {
    async fn read(&mut self) -> Result<Inbound, ConnectionError> {
        match self.stream.next().await {
            None => Ok(Inbound::Closed),
            Some(Err(e)) => Err(ConnectionError::transport(e)),
            Some(Ok(Message::Text(text))) => Ok(Inbound::Data(Frame::Text(text))),
            Some(Ok(Message::Binary(data))) => Ok(Inbound::Data(Frame::Binary(data))),
            // tungstenite 会自动回复 ping
            Some(Ok(Message::Ping(_))) => Ok(Inbound::Ping),
            Some(Ok(Message::Frame(_))) => Ok(Inbound::Control),
            Some(Ok(Message::Pong(data))) => {
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
            code: CloseCode::from(status.code()),
            reason: Cow::Owned(reason.to_string()),
        };
        let _ = sink.send(Message::Close(Some(frame))).await;
        let _ = sink.close().await;
    }
}

/// 客户端运行结果
#[derive(Debug, Clone)]
pub struct ClientReport {
    /// 按顺序收到的回显
    pub responses: Vec<String>,
    /// 客户端心跳指标
    pub heartbeat: HeartbeatMetricsSnapshot,
    /// 是否因关闭信号提前结束
    pub interrupted: bool,
}

/// 校验服务器地址
pub fn parse_server_url(raw: &str) -> anyhow::Result<Url> {
    let url = Url::parse(raw).with_context(|| format!("无效的服务器地址: {}", raw))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => bail!("不支持的协议 {}，服务器地址必须是 ws:// 或 wss://", other),
    }
}

/// 连接服务器并发送测试消息
pub async fn run(config: &ClientConfig, shutdown: CancellationToken) -> anyhow::Result<ClientReport> {
    let url = parse_server_url(&config.server_url)?;
    let dial_timeout = Duration::from_secs(config.dial_timeout_secs);

    tracing::info!("[CLIENT] Connecting to server: {}", url);
    let (socket, response) =
        tokio::time::timeout(dial_timeout, tokio_tungstenite::connect_async(url.as_str()))
            .await
            .map_err(|_| anyhow!("连接服务器超时 ({:?})", dial_timeout))?
            .context("连接服务器失败")?;
    tracing::info!(
        "[CLIENT] Connection established. Server response status: {}",
        response.status()
    );

    let (channel, prober) = TungsteniteChannel::split(socket);
    exchange(config, channel, prober, &shutdown).await
}

/// 在已建立的连接上收发消息
async fn exchange(
    config: &ClientConfig,
    mut channel: TungsteniteChannel,
    prober: TungsteniteProber,
    shutdown: &CancellationToken,
) -> anyhow::Result<ClientReport> {
    let scope = Arc::new(ConnectionScope::new(shutdown));
    let _stop_heartbeat = scope.token().clone().drop_guard();

    let monitor = HeartbeatMonitor::new(config.heartbeat.to_config());
    let metrics = monitor.metrics();
    let heartbeat = {
        let scope = scope.clone();
        tokio::spawn(async move {
            let report = monitor.run(scope.token(), &prober).await;
            if let HeartbeatExit::Exhausted { max_missed } = report.exit {
                tracing::error!(
                    "[CLIENT] Client heartbeat failed: max missed pings ({}) exceeded | {}",
                    max_missed,
                    report.metrics
                );
                scope.close(CloseReason::Failed(ConnectionError::HeartbeatExhausted {
                    max_missed,
                }));
            }
        })
    };

    let result = send_messages(config, &mut channel, &scope).await;

    let reason = scope.reason();
    let (status, text) = match (&result, &reason) {
        (Ok(_), None) => (CloseStatus::Normal, "Client finished"),
        (_, Some(CloseReason::Shutdown)) => (CloseStatus::GoingAway, "Client shutting down"),
        (_, Some(reason)) => reason.close_status(),
        (Err(_), None) => (CloseStatus::InternalError, "Client error"),
    };
    scope.close(CloseReason::PeerClosed);
    let message_timeout = Duration::from_secs(config.message_timeout_secs);
    let _ = tokio::time::timeout(message_timeout, channel.close(status, text)).await;
    let _ = heartbeat.await;
    tracing::info!("[CLIENT] WebSocket connection closed | {}", metrics.snapshot());

    let (responses, interrupted) = result?;
    if let Some(CloseReason::Failed(e)) = reason {
        return Err(e.into());
    }

    Ok(ClientReport {
        responses,
        heartbeat: metrics.snapshot(),
        interrupted,
    })
}

/// 发送循环：每条消息等到回显后再按间隔发送下一条
///
/// 返回收到的回显，以及是否被关闭信号中断
async fn send_messages(
    config: &ClientConfig,
    channel: &mut TungsteniteChannel,
    scope: &ConnectionScope,
) -> anyhow::Result<(Vec<String>, bool)> {
    let message_timeout = Duration::from_secs(config.message_timeout_secs);
    let interval = Duration::from_secs(config.message_interval_secs);
    let mut responses = Vec::with_capacity(config.message_count as usize);
    let mut sent = 0u32;
    let mut next_send = Instant::now();
    let mut awaiting: Option<Instant> = None;

    while (responses.len() as u32) < config.message_count {
        let deadline = awaiting;
        tokio::select! {
            biased;

            _ = scope.token().cancelled() => {
                if matches!(scope.reason(), Some(CloseReason::Shutdown) | None) {
                    tracing::info!("[CLIENT] Client shutting down...");
                    return Ok((responses, true));
                }
                bail!("连接已中断: {}", scope.reason().map(|r| r.to_string()).unwrap_or_default());
            }

            _ = tokio::time::sleep_until(next_send), if deadline.is_none() && sent < config.message_count => {
                sent += 1;
                let message = format!("Client Ping #{}", sent);
                tracing::info!("[CLIENT] Sending message: {}", message);
                tokio::time::timeout(message_timeout, channel.write(Frame::Text(message)))
                    .await
                    .map_err(|_| ConnectionError::WriteTimeout(message_timeout))?
                    .context("发送消息失败")?;
                awaiting = Some(Instant::now() + message_timeout);
            }

            _ = sleep_until_deadline(deadline) => {
                return Err(ConnectionError::ReadTimeout(message_timeout)).context("等待回显失败");
            }

            inbound = channel.read() => match inbound.context("读取回显失败")? {
                Inbound::Data(frame) => {
                    let text = match frame {
                        Frame::Text(text) => text,
                        Frame::Binary(data) => String::from_utf8_lossy(&data).into_owned(),
                    };
                    tracing::info!("[CLIENT] Received response: {}", text);
                    responses.push(text);
                    awaiting = None;
                    next_send = Instant::now() + interval;
                }
                // 服务端心跳探测，不需要客户端限速
                Inbound::Ping | Inbound::Control => {}
                Inbound::Closed => bail!("服务器关闭了连接"),
            },
        }
    }

    Ok((responses, false))
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
