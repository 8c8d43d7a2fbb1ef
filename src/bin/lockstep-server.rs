/// 锁步服务器
///
/// 按固定帧率运行，每帧从所有连接各收集一个请求，再各回一个时间。

use std::time::Duration;
use anyhow::{Context, Result};
use clap::Parser;
use lockstep::{LockstepServer, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lockstep-server")]
#[command(about = "Fixed-tick lockstep server")]
struct Cli {
    /// Listen address (host:port)
    #[arg(long, default_value = "0.0.0.0:6666")]
    listen: String,
    /// Maximum number of simultaneous connections
    #[arg(long, default_value_t = 1000)]
    count: usize,
    /// Maximum number of connections being set up at once
    #[arg(long, default_value_t = 10)]
    throttle: usize,
    /// Run duration in seconds (0 runs until Ctrl-C)
    #[arg(long, default_value_t = 3600)]
    rundur: u64,
    /// Frames per second
    #[arg(long, default_value_t = 30)]
    fps: u32,
    /// Per-frame deadline for collecting requests, in milliseconds
    #[arg(long = "frame-timeout-ms", default_value_t = 1000)]
    frame_timeout_ms: u64,
}

impl Cli {
    fn into_config(self) -> ServerConfig {
        let run_duration = (self.rundur > 0).then(|| Duration::from_secs(self.rundur));
        ServerConfig::new()
            .with_bind_address(self.listen)
            .with_max_connections(self.count)
            .with_accept_throttle(self.throttle)
            .with_fps(self.fps)
            .with_frame_timeout(Duration::from_millis(self.frame_timeout_ms))
            .with_run_duration(run_duration)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Cli::parse().into_config();
    config.validate().context("invalid server configuration")?;

    let server = LockstepServer::bind(config.clone())
        .await
        .with_context(|| format!("failed to listen on {}", config.bind_address))?;
    tracing::info!(
        "🚀 锁步服务器启动: {} (上限: {}, 限流: {}, 帧率: {})",
        server.local_addr()?,
        config.max_connections,
        config.accept_throttle,
        config.fps
    );

    let shutdown = server.shutdown_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("🛑 收到 Ctrl-C，开始关闭");
            shutdown.cancel();
        }
    });

    server.run().await?;
    Ok(())
}
