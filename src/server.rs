/// 服务端：连接句柄、单连接会话状态机、服务器装配与有序关闭

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use crate::{
    ConnectionId,
    acceptor::{AdmissionGauge, ConnectionHandler, ConnectionPermit, ThrottledAcceptor},
    config::ServerConfig,
    connection::{Connection, FramedConnection},
    coordinator::{CoordinatorConfig, FrameLogic, TickCoordinator, WallClock},
    error::{CloseReason, TransportError},
    packet::{Packet, Reply, Request},
    registry::{ConnectionRegistry, Registrant, Registration},
    stats::ActionStats,
    step::{StepRunner, StepWorker},
};

/// 连接句柄 - 注册表中保存的协调器一侧视图
///
/// 协调器通过它收取该连接的请求、下发命令；连接本身由会话任务独占。
pub struct ConnectionHandle {
    id: ConnectionId,
    peer: Option<SocketAddr>,
    runner: StepRunner<Reply, Request>,
    cancel: CancellationToken,
    evicted: AtomicBool,
}

impl ConnectionHandle {
    pub fn new(
        id: ConnectionId,
        peer: Option<SocketAddr>,
        runner: StepRunner<Reply, Request>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            peer,
            runner,
            cancel,
            evicted: AtomicBool::new(false),
        }
    }

    /// 等待该连接交付下一个请求；`None` 表示会话已结束
    pub async fn await_request(&self) -> Option<Request> {
        self.runner.await_result().await
    }

    /// 下发一个命令
    pub async fn push_command(&self, command: Reply) -> Result<(), TransportError> {
        self.runner.submit(command).await
    }

    /// 驱逐：通知会话关闭连接
    pub fn evict(&self) {
        self.evicted.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn was_evicted(&self) -> bool {
        self.evicted.load(Ordering::SeqCst)
    }

    /// 已被驱逐或服务器正在关闭
    pub fn is_closing(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn cancel_reason(&self) -> CloseReason {
        if self.was_evicted() {
            CloseReason::Timeout
        } else {
            CloseReason::Forced
        }
    }
}

impl Registrant for ConnectionHandle {
    fn id(&self) -> ConnectionId {
        self.id
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closing", &self.is_closing())
            .finish()
    }
}

/// 单连接会话
///
/// 两个状态交替：等待请求 -> (交给协调器) -> 等待命令 -> (发回客户端) -> 等待请求 ...
/// 任一状态出错或被取消都会结束会话并关闭连接。
pub struct ClientSession<C> {
    handle: Arc<ConnectionHandle>,
    connection: C,
    worker: StepWorker<Reply, Request>,
}

impl<C: Connection> ClientSession<C> {
    pub fn new(handle: Arc<ConnectionHandle>, connection: C, worker: StepWorker<Reply, Request>) -> Self {
        Self {
            handle,
            connection,
            worker,
        }
    }

    /// 运行会话直到连接结束，返回关闭原因
    pub async fn run(mut self) -> CloseReason {
        let id = self.handle.id();
        let cancel = self.handle.cancel.clone();

        let reason = loop {
            // 等待请求
            let received = tokio::select! {
                _ = cancel.cancelled() => break self.handle.cancel_reason(),
                received = self.connection.recv() => received,
            };
            let packet = match received {
                Ok(packet) => packet,
                Err(TransportError::Closed) => {
                    tracing::debug!("📥 对端主动关闭TCP连接 ({})", id);
                    break CloseReason::Normal;
                }
                Err(e) => {
                    e.log("📥 接收请求失败", id);
                    break e.close_reason();
                }
            };
            let request = match packet.to_request() {
                Ok(request) => request,
                Err(e) => {
                    let error = TransportError::from(e);
                    error.log("❌ 无法识别的请求", id);
                    break error.close_reason();
                }
            };
            let message_id = packet.message_id();

            // 交给协调器，并等待本连接的下一个命令
            let delivered = tokio::select! {
                _ = cancel.cancelled() => break self.handle.cancel_reason(),
                delivered = self.worker.send_result(Some(request)) => delivered,
            };
            if delivered.is_err() {
                break CloseReason::Forced;
            }
            let command = tokio::select! {
                _ = cancel.cancelled() => break self.handle.cancel_reason(),
                command = self.worker.recv_arg() => command,
            };
            let Some(command) = command else {
                break CloseReason::Forced;
            };

            // 发回客户端
            let packet = match Packet::reply(message_id, &command) {
                Ok(packet) => packet,
                Err(e) => {
                    tracing::error!("❌ 编码回复失败 ({}): {}", id, e);
                    break CloseReason::Error(e.to_string());
                }
            };
            let sent = tokio::select! {
                _ = cancel.cancelled() => break self.handle.cancel_reason(),
                sent = self.connection.send(packet) => sent,
            };
            if let Err(e) = sent {
                e.log("📤 发送回复失败", id);
                break e.close_reason();
            }
        };

        if let Err(e) = self.connection.close().await {
            tracing::debug!("🔗 关闭连接时出错 ({}): {}", id, e);
        }
        reason
    }
}

/// 为每个接入连接建立会话
struct SessionSpawner {
    registry: Arc<ConnectionRegistry<ConnectionHandle>>,
    /// 会话令牌，协调器退出后才取消
    sessions: CancellationToken,
}

#[async_trait]
impl ConnectionHandler for SessionSpawner {
    async fn handle(&self, id: ConnectionId, peer: SocketAddr, stream: TcpStream, mut permit: ConnectionPermit) {
        let connection = match FramedConnection::from_tcp(stream) {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!("❌ 连接建立失败 ({}, {}): {}", id, peer, e);
                return;
            }
        };

        let (runner, worker) = StepRunner::new(1);
        let handle = Arc::new(ConnectionHandle::new(id, Some(peer), runner, self.sessions.child_token()));
        let registration = match Registration::new(self.registry.clone(), handle.clone()) {
            Ok(registration) => registration,
            Err(_) => return,
        };
        permit.setup_complete();
        tracing::info!("✅ 连接已注册 ({}, {})", id, peer);

        let reason = ClientSession::new(handle, connection, worker).run().await;

        // 先注销，许可随后随 permit 一起释放
        drop(registration);
        match reason {
            CloseReason::Normal => tracing::info!("👋 连接关闭 ({})", id),
            CloseReason::Error(_) => tracing::warn!("🔌 连接异常关闭 ({}): {}", id, reason),
            _ => tracing::info!("🔌 连接已断开 ({}): {}", id, reason),
        }
    }
}

/// 锁步服务器
pub struct LockstepServer<L = WallClock> {
    config: ServerConfig,
    acceptor: ThrottledAcceptor,
    registry: Arc<ConnectionRegistry<ConnectionHandle>>,
    stats: Arc<ActionStats>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    logic: L,
}

impl LockstepServer<WallClock> {
    /// 校验配置并绑定监听地址
    pub async fn bind(config: ServerConfig) -> Result<Self, TransportError> {
        config.validate()?;

        let acceptor = ThrottledAcceptor::bind(
            &config.bind_address,
            config.max_connections,
            config.accept_throttle,
        )
        .await?;

        Ok(Self {
            config,
            acceptor,
            registry: Arc::new(ConnectionRegistry::new()),
            stats: Arc::new(ActionStats::new()),
            shutdown: CancellationToken::new(),
            tracker: TaskTracker::new(),
            logic: WallClock,
        })
    }
}

impl<L: FrameLogic + 'static> LockstepServer<L> {
    /// 替换帧逻辑
    pub fn with_logic<N: FrameLogic + 'static>(self, logic: N) -> LockstepServer<N> {
        LockstepServer {
            config: self.config,
            acceptor: self.acceptor,
            registry: self.registry,
            stats: self.stats,
            shutdown: self.shutdown,
            tracker: self.tracker,
            logic,
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        self.acceptor.local_addr()
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry<ConnectionHandle>> {
        self.registry.clone()
    }

    pub fn stats(&self) -> Arc<ActionStats> {
        self.stats.clone()
    }

    pub fn gauge(&self) -> AdmissionGauge {
        self.acceptor.gauge()
    }

    /// 取消该令牌即开始有序关闭
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// 运行服务器直到运行时间到期或关闭令牌被取消
    ///
    /// 关闭顺序：当前帧完成 -> 停止接入 -> 所有会话关闭连接并注销 -> 等待会话任务退出。
    pub async fn run(self) -> Result<(), TransportError> {
        let Self {
            config,
            acceptor,
            registry,
            stats,
            shutdown,
            tracker,
            logic,
        } = self;

        // 会话不直接监听关闭令牌，正在执行的帧才能把命令全部送达
        let sessions = CancellationToken::new();
        let spawner = Arc::new(SessionSpawner {
            registry: registry.clone(),
            sessions: sessions.clone(),
        });
        let accept_task = tokio::spawn(acceptor.run(spawner, shutdown.clone(), tracker.clone()));

        let mut coordinator = TickCoordinator::new(
            registry.clone(),
            logic,
            stats.clone(),
            CoordinatorConfig::from(&config),
        );
        coordinator.run(&shutdown).await;

        shutdown.cancel();
        if let Err(e) = accept_task.await {
            tracing::error!("❌ 接入任务异常退出: {:?}", e);
        }
        sessions.cancel();

        tracker.close();
        match tokio::time::timeout(config.graceful_timeout, tracker.wait()).await {
            Ok(()) => tracing::info!("✅ 所有连接已关闭"),
            Err(_) => tracing::warn!(
                "⚠️ 优雅关闭超时 ({:?})，仍有 {} 个连接未退出",
                config.graceful_timeout,
                registry.len()
            ),
        }

        tracing::info!("🏁 服务器停止 (帧: {}, 请求: {})", coordinator.frames(), stats.snapshot());
        Ok(())
    }
}
