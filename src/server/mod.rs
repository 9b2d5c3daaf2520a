//! HTTP 服务器模块
//!
//! 监听 TCP 端口，提供 `/ws` 回显、`/health` 和 `/status`

use crate::config::Config;
use crate::websocket::{
    health_handler, status_handler, ws_handler, ConnectionLifecycleManager, WsHandlerState,
};
use anyhow::Context;
use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::limit::RequestBodyLimitLayer;

/// 普通 HTTP 请求体上限，只有 GET 路由，不需要更大
const HTTP_BODY_LIMIT: usize = 16 * 1024;

/// 构建路由
pub fn build_router(state: WsHandlerState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .layer(ServiceBuilder::new().layer(RequestBodyLimitLayer::new(HTTP_BODY_LIMIT)))
        .with_state(state)
}

/// 回显服务器
pub struct EchoServer {
    listener: TcpListener,
    lifecycle: Arc<ConnectionLifecycleManager>,
    shutdown: CancellationToken,
    shutdown_grace: Duration,
}

impl EchoServer {
    /// 绑定监听地址
    pub async fn bind(config: &Config, shutdown: CancellationToken) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(&config.server.listen)
            .await
            .with_context(|| format!("无法绑定监听地址 {}", config.server.listen))?;
        let lifecycle = Arc::new(ConnectionLifecycleManager::new(
            config.lifecycle_settings(),
            shutdown.clone(),
        ));

        Ok(Self {
            listener,
            lifecycle,
            shutdown,
            shutdown_grace: Duration::from_secs(config.server.shutdown_timeout_secs),
        })
    }

    /// 实际监听地址（端口为 0 时由系统分配）
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn lifecycle(&self) -> &Arc<ConnectionLifecycleManager> {
        &self.lifecycle
    }

    /// 运行直到关闭令牌被取消，然后等待所有连接拆除
    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        let settings = *self.lifecycle.settings();
        tracing::info!("[SERVER] WebSocket server listening on ws://{}/ws", addr);
        tracing::info!(
            "[SERVER] Heartbeat: interval={:?}, timeout={:?}, max_missed={} | max_connections_per_ip={}",
            settings.heartbeat.interval,
            settings.heartbeat.timeout,
            settings.heartbeat.max_missed_pings,
            settings.max_connections_per_ip
        );

        let router = build_router(WsHandlerState::new(self.lifecycle.clone()));
        let shutdown = self.shutdown.clone();
        axum::serve(
            self.listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("服务器运行失败")?;

        tracing::info!(
            "[SERVER] Shutting down, waiting for {} connection(s)",
            self.lifecycle.active_connections()
        );

        // 升级后的连接不受 axum 优雅关闭管理，由 TaskTracker 等待
        let tasks = self.lifecycle.tasks();
        tasks.close();
        if tokio::time::timeout(self.shutdown_grace, tasks.wait())
            .await
            .is_err()
        {
            tracing::warn!(
                "[SERVER] Shutdown grace period ({:?}) elapsed with {} connection(s) still open",
                self.shutdown_grace,
                self.lifecycle.active_connections()
            );
        }

        tracing::info!("[SERVER] Server stopped");
        Ok(())
    }
}

/// 启动服务器，直到 `shutdown` 被取消
pub async fn start(config: &Config, shutdown: CancellationToken) -> anyhow::Result<()> {
    EchoServer::bind(config, shutdown).await?.run().await
}
