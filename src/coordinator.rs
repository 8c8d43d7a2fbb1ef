/// 帧协调器 (服务端主循环)
///
/// 每一帧：先从注册表快照中的每个连接各收集一个请求，再向每个交付了请求的连接各下发一个命令。
/// 收集阶段共用一个帧截止时间，错过截止时间的连接被驱逐，而不是拖住整帧。

use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use crate::{
    ConnectionId,
    config::ServerConfig,
    packet::{Reply, Request},
    registry::{ConnectionRegistry, Registrant},
    server::ConnectionHandle,
    stats::ActionStats,
};

/// 根据请求计算本帧要下发的命令
pub trait FrameLogic: Send {
    fn next_command(&mut self, id: ConnectionId, request: &Request) -> Reply;
}

/// 时钟逻辑：每个命令都是当前时间
#[derive(Debug, Clone, Copy, Default)]
pub struct WallClock;

impl FrameLogic for WallClock {
    fn next_command(&mut self, _id: ConnectionId, _request: &Request) -> Reply {
        Reply::clock_now()
    }
}

/// 协调器配置
#[derive(Debug, Clone)]
pub struct CoordinatorConfig {
    pub frame_period: Duration,
    pub frame_timeout: Duration,
    pub info_interval: Duration,
    pub run_duration: Option<Duration>,
}

impl From<&ServerConfig> for CoordinatorConfig {
    fn from(config: &ServerConfig) -> Self {
        Self {
            frame_period: config.frame_period(),
            frame_timeout: config.frame_timeout,
            info_interval: config.info_interval,
            run_duration: config.run_duration,
        }
    }
}

/// 单帧结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FrameReport {
    /// 帧序号，从1开始
    pub frame: u64,
    /// 收集到的请求数
    pub collected: usize,
    /// 成功下发的命令数
    pub commands_sent: usize,
    /// 本帧发现已关闭的连接数
    pub closed: usize,
    /// 本帧驱逐的连接数
    pub evicted: usize,
}

/// 帧协调器
pub struct TickCoordinator<L> {
    registry: Arc<ConnectionRegistry<ConnectionHandle>>,
    logic: L,
    stats: Arc<ActionStats>,
    config: CoordinatorConfig,
    frame: u64,
}

impl<L: FrameLogic> TickCoordinator<L> {
    pub fn new(
        registry: Arc<ConnectionRegistry<ConnectionHandle>>,
        logic: L,
        stats: Arc<ActionStats>,
        config: CoordinatorConfig,
    ) -> Self {
        Self {
            registry,
            logic,
            stats,
            config,
            frame: 0,
        }
    }

    /// 已完成的帧数
    pub fn frames(&self) -> u64 {
        self.frame
    }

    /// 主循环：帧定时器、信息定时器、退出定时器
    ///
    /// 退出定时器到期时取消 `shutdown`，让接入器和所有连接一起开始关闭。
    /// 正在执行的帧总会完整结束，其命令全部下发后才返回。
    pub async fn run(&mut self, shutdown: &CancellationToken) {
        let mut frame_timer = tokio::time::interval(self.config.frame_period);
        frame_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let info_start = Instant::now() + self.config.info_interval;
        let mut info_timer = tokio::time::interval_at(info_start, self.config.info_interval);

        let run_duration = self.config.run_duration;
        let quit = async move {
            match run_duration {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::pin!(quit);

        tracing::info!(
            "🎯 帧协调器启动 (帧周期: {:?}, 帧截止: {:?})",
            self.config.frame_period,
            self.config.frame_timeout
        );

        loop {
            // 关闭优先：帧结束后不再开始新的帧
            tokio::select! {
                biased;

                _ = shutdown.cancelled() => {
                    tracing::info!("🛑 收到关闭信号，帧协调器退出");
                    break;
                }
                _ = &mut quit => {
                    tracing::info!("⏰ 运行时间到，开始关闭");
                    shutdown.cancel();
                    break;
                }
                _ = frame_timer.tick() => {
                    let report = self.run_frame().await;
                    tracing::debug!("🎞️ 帧完成: {:?}", report);
                }
                _ = info_timer.tick() => {
                    let snapshot = self.stats.update_lap();
                    tracing::info!("📊 连接数: {}, 帧: {}, 请求: {}", self.registry.len(), self.frame, snapshot);
                }
            }
        }
    }

    /// 执行一帧：先收集，后下发
    pub async fn run_frame(&mut self) -> FrameReport {
        self.frame += 1;
        let mut report = FrameReport {
            frame: self.frame,
            ..Default::default()
        };

        let deadline = Instant::now() + self.config.frame_timeout;
        let mut ready = Vec::new();

        for handle in self.registry.snapshot() {
            if handle.is_closing() {
                continue;
            }

            match tokio::time::timeout_at(deadline, handle.await_request()).await {
                Ok(Some(request)) => {
                    self.stats.inc();
                    report.collected += 1;
                    ready.push((handle, request));
                }
                Ok(None) => {
                    tracing::debug!("🔌 连接在帧内关闭 ({})", handle.id());
                    report.closed += 1;
                }
                Err(_) => {
                    tracing::warn!(
                        "⏱️ 连接错过帧截止时间，驱逐 ({}, 帧: {})",
                        handle.id(),
                        self.frame
                    );
                    handle.evict();
                    report.evicted += 1;
                }
            }
        }

        for (handle, request) in ready {
            let command = self.logic.next_command(handle.id(), &request);
            match handle.push_command(command).await {
                Ok(()) => report.commands_sent += 1,
                Err(e) => tracing::debug!("🔌 下发命令失败 ({}): {}", handle.id(), e),
            }
        }

        report
    }
}
