//! EchoGuard - 带心跳检测、连接准入和限速的 WebSocket 回显服务
//!
//! - `websocket`：连接生命周期、心跳、准入控制和限速
//! - `server`：axum HTTP 服务器
//! - `client`：测试客户端
//! - `config`：YAML 配置与环境变量覆盖

pub mod client;
pub mod config;
pub mod logging;
pub mod server;
pub mod websocket;
