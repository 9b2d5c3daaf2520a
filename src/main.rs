use clap::{Parser, ValueEnum};
use echoguard_lib::{client, config, logging, server};
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// 运行模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Server,
    Client,
}

/// EchoGuard - WebSocket 回显服务
#[derive(Parser, Debug)]
#[command(name = "echoguard")]
#[command(version)]
#[command(about = "WebSocket echo service with heartbeat and connection limits", long_about = None)]
struct Cli {
    /// 运行模式
    #[arg(short = 'm', long = "mode", value_enum, default_value = "server")]
    mode: Mode,

    /// 配置文件路径（默认 ~/.echoguard/config.yaml）
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = config::load_config(cli.config.as_deref())?;
    logging::init(&config.logging)?;

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    match cli.mode {
        Mode::Server => {
            tracing::info!("[SERVER] Starting in server mode...");
            server::start(&config, shutdown).await?;
        }
        Mode::Client => {
            tracing::info!("[CLIENT] Starting in client mode...");
            let report = client::run(&config.client, shutdown).await?;
            tracing::info!(
                "[CLIENT] Received {} response(s){}",
                report.responses.len(),
                if report.interrupted { " (interrupted)" } else { "" }
            );
        }
    }

    tracing::info!("Application shutdown complete");
    Ok(())
}

/// 等待 Ctrl+C 或 SIGTERM，然后取消关闭令牌
async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("无法监听 Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("无法监听 SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("收到关闭信号，开始优雅关闭");
    shutdown.cancel();
}
