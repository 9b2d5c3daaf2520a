//! WebSocket 回显服务端到端测试
//!
//! 在回环地址上启动真实服务器，验证：
//! - 回显与健康检查
//! - 单 IP 连接上限
//! - 入站消息限速
//! - 心跳超时拆除
//! - 优雅关闭
//! - 客户端模式

use echoguard_lib::client;
use echoguard_lib::config::Config;
use echoguard_lib::server::EchoServer;
use echoguard_lib::websocket::{ConnectionLifecycleManager, HealthReport, StatusReport};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const LOCAL_IP: &str = "127.0.0.1";

/// 端到端测试上下文
struct TestServer {
    addr: SocketAddr,
    lifecycle: Arc<ConnectionLifecycleManager>,
    shutdown: CancellationToken,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(config: Config) -> Self {
        let shutdown = CancellationToken::new();
        let server = EchoServer::bind(&config, shutdown.clone())
            .await
            .expect("绑定测试端口失败");
        let addr = server.local_addr().unwrap();
        let lifecycle = server.lifecycle().clone();
        let handle = tokio::spawn(server.run());

        Self {
            addr,
            lifecycle,
            shutdown,
            handle,
        }
    }

    fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    async fn connect(&self) -> Result<WsStream, tungstenite::Error> {
        tokio_tungstenite::connect_async(self.ws_url())
            .await
            .map(|(ws, _)| ws)
    }

    /// 发送一个 HTTP GET 请求并返回响应体
    async fn http_get(&self, path: &str) -> String {
        let mut stream = TcpStream::connect(self.addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
            path, self.addr
        );
        stream.write_all(request.as_bytes()).await.unwrap();

        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "unexpected response: {}", response);
        response
            .split_once("\r\n\r\n")
            .map(|(_, body)| body.to_string())
            .unwrap_or_default()
    }

    async fn stop(self) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(10), self.handle)
            .await
            .expect("服务器未能在时限内关闭")
            .expect("服务器任务异常退出");
        assert!(result.is_ok(), "服务器返回错误: {:?}", result);
    }
}

fn test_config() -> Config {
    let mut config = Config::default();
    config.server.listen = format!("{}:0", LOCAL_IP);
    config.server.shutdown_timeout_secs = 5;
    config
}

/// 轮询直到条件成立
async fn wait_until<F: Fn() -> bool>(condition: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

/// 读取下一条非控制帧消息
async fn next_message(ws: &mut WsStream) -> Message {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("读取超时")
            .expect("连接意外结束")
            .expect("读取失败");
        match msg {
            Message::Ping(_) | Message::Pong(_) => continue,
            other => return other,
        }
    }
}

fn close_code(msg: &Message) -> Option<u16> {
    match msg {
        Message::Close(Some(frame)) => Some(u16::from(frame.code)),
        _ => None,
    }
}

#[tokio::test]
async fn test_e2e_echo_round_trip() {
    let server = TestServer::start(test_config()).await;
    let mut ws = server.connect().await.unwrap();

    ws.send(Message::Text("hello".to_string())).await.unwrap();
    assert_eq!(
        next_message(&mut ws).await,
        Message::Text("Server echoes: hello".to_string())
    );

    ws.send(Message::Binary(vec![1, 2, 3])).await.unwrap();
    let mut expected = b"Server echoes: ".to_vec();
    expected.extend_from_slice(&[1, 2, 3]);
    assert_eq!(next_message(&mut ws).await, Message::Binary(expected));

    ws.close(None).await.unwrap();
    let lifecycle = server.lifecycle.clone();
    assert!(wait_until(|| lifecycle.connection_count(LOCAL_IP) == 0, Duration::from_secs(5)).await);

    let stats = server.lifecycle.stats().snapshot();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.total_messages, 2);
    assert_eq!(stats.total_errors, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_health_and_status() {
    let server = TestServer::start(test_config()).await;

    let health: HealthReport = serde_json::from_str(&server.http_get("/health").await).unwrap();
    assert_eq!(health.status, "healthy");
    assert_eq!(health.active_connections, 0);

    let mut ws = server.connect().await.unwrap();
    ws.send(Message::Text("ping".to_string())).await.unwrap();
    next_message(&mut ws).await;

    let health: HealthReport = serde_json::from_str(&server.http_get("/health").await).unwrap();
    assert_eq!(health.active_connections, 1);

    let status: StatusReport = serde_json::from_str(&server.http_get("/status").await).unwrap();
    assert_eq!(status.max_connections_per_ip, 50);
    assert_eq!(status.addresses.len(), 1);
    assert_eq!(status.addresses[0].address, LOCAL_IP);
    assert_eq!(status.addresses[0].connections, 1);

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_connection_limit_per_ip() {
    let server = TestServer::start(test_config()).await;

    let mut connections = Vec::new();
    for _ in 0..50 {
        connections.push(server.connect().await.expect("上限内的连接应被接受"));
    }
    assert_eq!(server.lifecycle.connection_count(LOCAL_IP), 50);

    // 第 51 个连接在握手阶段被拒绝
    match server.connect().await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status().as_u16(), 429),
        other => panic!("expected 429 rejection, got {:?}", other.map(|_| ())),
    }
    assert_eq!(server.lifecycle.connection_count(LOCAL_IP), 50);
    assert_eq!(server.lifecycle.stats().snapshot().rejected_connections, 1);

    // 关闭一个连接后恰好可以再接受一个
    let mut closed = connections.pop().unwrap();
    closed.close(None).await.unwrap();
    let lifecycle = server.lifecycle.clone();
    assert!(wait_until(|| lifecycle.connection_count(LOCAL_IP) == 49, Duration::from_secs(5)).await);

    connections.push(server.connect().await.expect("释放名额后应能连接"));
    assert!(matches!(
        server.connect().await,
        Err(tungstenite::Error::Http(_))
    ));

    drop(connections);
    server.stop().await;
}

#[tokio::test]
async fn test_e2e_message_flood_closes_with_policy_violation() {
    let server = TestServer::start(test_config()).await;
    let mut ws = server.connect().await.unwrap();

    for i in 1..=5 {
        ws.send(Message::Text(format!("burst {}", i))).await.unwrap();
    }

    for i in 1..=4 {
        assert_eq!(
            next_message(&mut ws).await,
            Message::Text(format!("Server echoes: burst {}", i))
        );
    }
    assert_eq!(close_code(&next_message(&mut ws).await), Some(1008));

    let lifecycle = server.lifecycle.clone();
    assert!(wait_until(|| lifecycle.connection_count(LOCAL_IP) == 0, Duration::from_secs(5)).await);
    assert_eq!(server.lifecycle.stats().snapshot().total_errors, 1);
    assert!(server.lifecycle.rate_limits().is_empty());

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_client_ping_flood_closes_with_policy_violation() {
    let server = TestServer::start(test_config()).await;
    let mut ws = server.connect().await.unwrap();

    // 第 1 个 ping 播种，第 2-4 个违规，第 5 个超过上限
    for i in 0..5u8 {
        ws.send(Message::Ping(vec![i])).await.unwrap();
    }

    assert_eq!(close_code(&next_message(&mut ws).await), Some(1008));

    let lifecycle = server.lifecycle.clone();
    assert!(wait_until(|| lifecycle.connection_count(LOCAL_IP) == 0, Duration::from_secs(5)).await);
    let stats = server.lifecycle.stats().snapshot();
    assert_eq!(stats.total_errors, 1);
    assert_eq!(stats.total_messages, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_unresponsive_peer_is_torn_down() {
    let mut config = test_config();
    config.heartbeat.interval_secs = 2;
    config.heartbeat.timeout_secs = 1;
    config.heartbeat.max_missed_pings = 2;
    config.rate_limit.min_ping_interval_secs = 1;
    let server = TestServer::start(config).await;

    // 一个持续读取的客户端（自动回复 pong），一个从不读取的客户端
    let mut responsive = server.connect().await.unwrap();
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = responsive.next().await {
            if matches!(msg, Message::Close(_)) {
                break;
            }
        }
    });
    let _silent = server.connect().await.unwrap();
    assert_eq!(server.lifecycle.connection_count(LOCAL_IP), 2);

    // 两轮探测失败后（约 6 秒）静默连接被拆除
    let lifecycle = server.lifecycle.clone();
    assert!(wait_until(|| lifecycle.connection_count(LOCAL_IP) == 1, Duration::from_secs(15)).await);
    assert_eq!(server.lifecycle.stats().snapshot().total_errors, 1);

    server.stop().await;
    reader.await.unwrap();
}

#[tokio::test]
async fn test_e2e_graceful_shutdown_sends_going_away() {
    let server = TestServer::start(test_config()).await;
    let mut ws = server.connect().await.unwrap();
    ws.send(Message::Text("before shutdown".to_string())).await.unwrap();
    next_message(&mut ws).await;

    server.shutdown.cancel();
    assert_eq!(close_code(&next_message(&mut ws).await), Some(1001));

    let lifecycle = server.lifecycle.clone();
    server.stop().await;
    assert_eq!(lifecycle.connection_count(LOCAL_IP), 0);
    assert_eq!(lifecycle.active_connections(), 0);
}

#[tokio::test]
async fn test_e2e_client_mode_exchange() {
    let server = TestServer::start(test_config()).await;

    let mut config = test_config();
    config.client.server_url = server.ws_url();
    config.client.message_count = 3;
    config.client.message_interval_secs = 0;

    let report = client::run(&config.client, CancellationToken::new())
        .await
        .expect("客户端运行失败");
    assert!(!report.interrupted);
    assert_eq!(
        report.responses,
        vec![
            "Server echoes: Client Ping #1".to_string(),
            "Server echoes: Client Ping #2".to_string(),
            "Server echoes: Client Ping #3".to_string(),
        ]
    );

    let lifecycle = server.lifecycle.clone();
    assert!(wait_until(|| lifecycle.connection_count(LOCAL_IP) == 0, Duration::from_secs(5)).await);
    assert_eq!(server.lifecycle.stats().snapshot().total_errors, 0);

    server.stop().await;
}

#[tokio::test]
async fn test_e2e_client_mode_rejected_over_limit() {
    let mut config = test_config();
    config.server.max_connections_per_ip = 1;
    let server = TestServer::start(config).await;
    let _held = server.connect().await.unwrap();

    let mut config = test_config();
    config.client.server_url = server.ws_url();
    let err = client::run(&config.client, CancellationToken::new())
        .await
        .unwrap_err();
    assert!(format!("{:#}", err).contains("429"));

    server.stop().await;
}
