/// 客户端：服务器链路 + 往返驱动循环
///
/// 驱动循环合并四个事件源（输入事件、网络回复、重绘定时器、信息定时器），
/// 每收到一个回复立即发出下一个请求，始终保持恰好一个在途请求。

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use crate::{
    ConnectionId, next_connection_id,
    config::ClientConfig,
    connection::{Connection, FramedConnection},
    error::TransportError,
    packet::{MessageIdManager, Packet, Reply, Request},
    stats::ActionStats,
    step::{Step, StepRunner},
};

/// 表现层接口：只消费时间值
pub trait ClockFace: Send {
    /// 更新当前显示的时间
    fn set_time(&mut self, at: DateTime<Utc>);

    /// 重绘
    fn draw(&mut self);
}

/// 表现层产生的输入事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputEvent {
    /// 明确的退出请求（窗口关闭、Ctrl-C）
    Quit,
    /// 按键
    Key(char),
}

impl InputEvent {
    pub fn is_quit(&self) -> bool {
        matches!(self, InputEvent::Quit | InputEvent::Key('q' | 'Q' | '\u{1b}'))
    }
}

/// 驱动循环的退出原因
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverExit {
    /// 用户退出
    Quit,
    /// 与服务器的连接断开
    Disconnected,
}

/// 服务器链路：一次请求发出，一次回复收回
pub struct ServerLink<C> {
    id: ConnectionId,
    connection: C,
    message_ids: MessageIdManager,
}

impl ServerLink<FramedConnection<TcpStream>> {
    /// 拨号连接服务器
    pub async fn connect(config: &ClientConfig) -> Result<Self, TransportError> {
        config.validate()?;
        let connection = FramedConnection::connect(&config.server_address, config.connect_timeout).await?;
        let link = Self::new(connection);
        tracing::info!("✅ 已连接服务器 {} ({})", config.server_address, link.id);
        Ok(link)
    }
}

impl<C: Connection> ServerLink<C> {
    pub fn new(connection: C) -> Self {
        Self {
            id: next_connection_id(),
            connection,
            message_ids: MessageIdManager::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// 发送一个请求并等待对应的回复
    pub async fn exchange(&mut self, request: &Request) -> Result<Reply, TransportError> {
        let message_id = self.message_ids.next_id();
        self.connection.send(Packet::request(message_id, request)?).await?;

        let packet = self.connection.recv().await?;
        if packet.message_id() != message_id {
            return Err(TransportError::protocol_error(
                "lockstep",
                format!("reply id {} does not match request id {}", packet.message_id(), message_id),
            ));
        }
        Ok(packet.to_reply()?)
    }
}

#[async_trait]
impl<C: Connection + 'static> Step<Request, Reply> for ServerLink<C> {
    async fn step(&mut self, request: Request) -> Option<Reply> {
        match self.exchange(&request).await {
            Ok(reply) => Some(reply),
            Err(TransportError::Closed) => {
                tracing::info!("👋 服务器关闭了连接 ({})", self.id);
                None
            }
            Err(e) => {
                e.log(&format!("❌ {:?} 往返失败", request), self.id);
                None
            }
        }
    }
}

/// 往返驱动循环
pub struct RoundTripDriver<F> {
    id: ConnectionId,
    runner: StepRunner<Request, Reply>,
    worker: JoinHandle<()>,
    face: F,
    input: mpsc::Receiver<InputEvent>,
    input_stats: Arc<ActionStats>,
    round_trips: Arc<ActionStats>,
    draw_interval: Duration,
    info_interval: Duration,
}

impl<F: ClockFace> RoundTripDriver<F> {
    /// 在独立任务上启动链路工作者
    pub fn new<C: Connection + 'static>(
        link: ServerLink<C>,
        face: F,
        input: mpsc::Receiver<InputEvent>,
        config: &ClientConfig,
    ) -> Self {
        let id = link.id();
        let (runner, worker) = StepRunner::spawn(1, link);

        Self {
            id,
            runner,
            worker,
            face,
            input,
            input_stats: Arc::new(ActionStats::new()),
            round_trips: Arc::new(ActionStats::new()),
            draw_interval: config.draw_interval,
            info_interval: config.info_interval,
        }
    }

    /// 已完成的往返统计
    pub fn round_trips(&self) -> Arc<ActionStats> {
        self.round_trips.clone()
    }

    /// 输入事件统计
    pub fn input_stats(&self) -> Arc<ActionStats> {
        self.input_stats.clone()
    }

    fn next_request() -> Request {
        Request::Tick { cmd: 0 }
    }

    /// 运行直到用户退出或连接断开
    pub async fn run(mut self) -> DriverExit {
        // 先发出第一个请求，填满管线
        let exit = if self.runner.submit(Self::next_request()).await.is_err() {
            DriverExit::Disconnected
        } else {
            self.event_loop().await
        };

        self.runner.stop();
        // 在途的一步可能要等到下一帧才返回，不必等它
        if tokio::time::timeout(Duration::from_millis(100), &mut self.worker).await.is_err() {
            self.worker.abort();
        }

        tracing::info!("🏁 客户端退出 ({}): {:?}, 往返: {}", self.id, exit, self.round_trips.snapshot().total);
        exit
    }

    async fn event_loop(&mut self) -> DriverExit {
        let mut draw_timer = tokio::time::interval(self.draw_interval);
        let mut info_timer = tokio::time::interval_at(Instant::now() + self.info_interval, self.info_interval);
        let mut input_open = true;

        loop {
            tokio::select! {
                event = self.input.recv(), if input_open => match event {
                    Some(event) => {
                        self.input_stats.inc();
                        if event.is_quit() {
                            return DriverExit::Quit;
                        }
                    }
                    None => input_open = false,
                },
                reply = self.runner.await_result() => match reply {
                    Some(Reply::Clock { at }) => {
                        self.face.set_time(at);
                        self.round_trips.inc();
                        if self.runner.submit(Self::next_request()).await.is_err() {
                            return DriverExit::Disconnected;
                        }
                    }
                    None => return DriverExit::Disconnected,
                },
                _ = draw_timer.tick() => self.face.draw(),
                _ = info_timer.tick() => {
                    tracing::info!(
                        "📊 往返: {}, 输入: {}",
                        self.round_trips.update_lap(),
                        self.input_stats.update_lap()
                    );
                }
            }
        }
    }
}
