/// 锁步客户端
///
/// 持续向服务器请求时间并显示在终端上。输入 `q` 回车或按 Ctrl-C 退出。
/// 只有连接失败时以非零状态退出。

use std::io::Write;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::Parser;
use lockstep::{ClientConfig, ClockFace, DriverExit, InputEvent, RoundTripDriver, ServerLink};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "lockstep-client")]
#[command(about = "Lockstep clock client")]
struct Cli {
    /// Server address (host:port)
    #[arg(long = "connect-to", default_value = "localhost:6666")]
    connect_to: String,
}

/// 终端时钟：只在时间变化后重绘
#[derive(Default)]
struct ConsoleClock {
    current: Option<DateTime<Utc>>,
    dirty: bool,
}

impl ClockFace for ConsoleClock {
    fn set_time(&mut self, at: DateTime<Utc>) {
        self.current = Some(at);
        self.dirty = true;
    }

    fn draw(&mut self) {
        let Some(at) = self.current.filter(|_| self.dirty) else {
            return;
        };
        self.dirty = false;

        let mut stdout = std::io::stdout().lock();
        // 终端写失败不影响同步
        let _ = write!(stdout, "\r🕒 {}", at.format("%H:%M:%S%.3f"));
        let _ = stdout.flush();
    }
}

/// 把标准输入和 Ctrl-C 转成输入事件
fn spawn_input(events: mpsc::Sender<InputEvent>) {
    let keys = events.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            let event = match line.trim().chars().next() {
                Some(key) => InputEvent::Key(key),
                None => continue,
            };
            if keys.send(event).await.is_err() {
                break;
            }
        }
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = events.send(InputEvent::Quit).await;
        }
    });
}

#[tokio::main]
async fn main() -> Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = ClientConfig::new().with_server_address(cli.connect_to);
    config.validate().context("invalid client configuration")?;

    let link = ServerLink::connect(&config)
        .await
        .with_context(|| format!("failed to connect to {}", config.server_address))?;

    let (input_tx, input_rx) = mpsc::channel(16);
    spawn_input(input_tx);

    let driver = RoundTripDriver::new(link, ConsoleClock::default(), input_rx, &config);
    let exit = driver.run().await;
    println!();

    if exit == DriverExit::Disconnected {
        tracing::warn!("🔌 与服务器 {} 的连接已断开", config.server_address);
    }
    Ok(())
}
