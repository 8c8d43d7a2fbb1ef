/// 限流接入器
///
/// 两个相互独立的许可：
/// - `slots`：同时在线连接总数上限，处理任务返回时释放
/// - `throttle`：同时进行中的接入/建立数上限，建立完成（或处理任务返回）时释放
///
/// 许可是 RAII 的，处理任务无论正常返回、出错还是 panic 都会归还。

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use crate::{ConnectionId, error::TransportError, next_connection_id};

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// 连接处理回调，每个接入的连接在独立任务上调用一次
#[async_trait]
pub trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, id: ConnectionId, peer: SocketAddr, stream: TcpStream, permit: ConnectionPermit);
}

/// 单个连接持有的许可
pub struct ConnectionPermit {
    _slot: OwnedSemaphorePermit,
    setup: Option<OwnedSemaphorePermit>,
}

impl ConnectionPermit {
    /// 建立阶段结束，提前归还限流许可
    pub fn setup_complete(&mut self) {
        self.setup.take();
    }
}

/// 许可使用情况
#[derive(Debug, Clone)]
pub struct AdmissionGauge {
    slots: Arc<Semaphore>,
    throttle: Arc<Semaphore>,
    max_connections: usize,
    accept_throttle: usize,
}

impl AdmissionGauge {
    /// 当前在线连接数
    pub fn live(&self) -> usize {
        self.max_connections - self.slots.available_permits()
    }

    /// 当前处于建立阶段的连接数
    pub fn in_setup(&self) -> usize {
        self.accept_throttle - self.throttle.available_permits()
    }
}

/// 限流接入器
pub struct ThrottledAcceptor {
    listener: TcpListener,
    gauge: AdmissionGauge,
}

impl ThrottledAcceptor {
    /// 绑定监听地址
    pub async fn bind(
        addr: &str,
        max_connections: usize,
        accept_throttle: usize,
    ) -> Result<Self, TransportError> {
        if max_connections == 0 || accept_throttle == 0 {
            return Err(TransportError::config_error("acceptor", "limits must be positive"));
        }

        let listener = TcpListener::bind(addr).await?;
        tracing::info!("✅ TCP服务器成功启动在: {}", listener.local_addr()?);

        Ok(Self {
            listener,
            gauge: AdmissionGauge {
                slots: Arc::new(Semaphore::new(max_connections)),
                throttle: Arc::new(Semaphore::new(accept_throttle)),
                max_connections,
                accept_throttle,
            },
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn gauge(&self) -> AdmissionGauge {
        self.gauge.clone()
    }

    /// 接入循环，直到 `shutdown` 被取消
    ///
    /// 每个连接的处理任务都登记在 `tracker` 上，便于关闭时等待排空。
    pub async fn run<H: ConnectionHandler>(self, handler: Arc<H>, shutdown: CancellationToken, tracker: TaskTracker) {
        tracing::info!(
            "🌐 接入器启动 (上限: {}, 限流: {})",
            self.gauge.max_connections,
            self.gauge.accept_throttle
        );

        loop {
            // 先占总数名额，再占建立名额，最后才 accept
            let slot = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.gauge.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let setup = tokio::select! {
                _ = shutdown.cancelled() => break,
                permit = self.gauge.throttle.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        let error = TransportError::setup_error(e.to_string());
                        tracing::error!("❌ TCP 接受连接失败: {}", error);
                        // 许可随 slot/setup 一起归还
                        if accept_backoff(&shutdown).await {
                            continue;
                        }
                        break;
                    }
                },
            };

            let id = next_connection_id();
            tracing::debug!(
                "🔗 TCP新连接来自: {} ({}, 在线: {}, 建立中: {})",
                peer,
                id,
                self.gauge.live(),
                self.gauge.in_setup()
            );

            let handler = handler.clone();
            let permit = ConnectionPermit { _slot: slot, setup: Some(setup) };
            tracker.spawn(async move {
                handler.handle(id, peer, stream, permit).await;
            });
        }

        tracing::info!("🛑 接入器停止接受新连接");
    }
}

/// 接受失败后的退避，期间仍响应关闭；返回 `false` 表示已关闭
async fn accept_backoff(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 建立阶段永不结束的处理者
    struct StuckInSetup {
        entered: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionHandler for StuckInSetup {
        async fn handle(&self, _id: ConnectionId, _peer: SocketAddr, _stream: TcpStream, _permit: ConnectionPermit) {
            self.entered.fetch_add(1, Ordering::SeqCst);
            std::future::pending::<()>().await;
        }
    }

    #[tokio::test]
    async fn test_throttle_bounds_concurrent_setup() {
        let acceptor = ThrottledAcceptor::bind("127.0.0.1:0", 10, 2)
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let gauge = acceptor.gauge();
        let handler = Arc::new(StuckInSetup { entered: AtomicUsize::new(0) });
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        tokio::spawn(acceptor.run(handler.clone(), shutdown.clone(), tracker.clone()));

        let mut clients = Vec::new();
        for _ in 0..5 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handler.entered.load(Ordering::SeqCst), 2);
        assert_eq!(gauge.in_setup(), 2);
        assert!(gauge.live() <= 3);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_permits_released_when_handler_returns() {
        struct Quick;

        #[async_trait]
        impl ConnectionHandler for Quick {
            async fn handle(&self, _id: ConnectionId, _peer: SocketAddr, _stream: TcpStream, mut permit: ConnectionPermit) {
                permit.setup_complete();
                assert!(permit.setup.is_none());
            }
        }

        let acceptor = ThrottledAcceptor::bind("127.0.0.1:0", 2, 1)
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let gauge = acceptor.gauge();
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();
        let accept_loop = tokio::spawn(acceptor.run(Arc::new(Quick), shutdown.clone(), tracker.clone()));

        // 超过上限的连接数也能陆续被处理，因为许可会归还
        for _ in 0..6 {
            let _client = TcpStream::connect(addr).await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        shutdown.cancel();
        accept_loop.await.unwrap();
        tracker.close();
        tracker.wait().await;
        assert_eq!(gauge.in_setup(), 0);
        assert_eq!(gauge.live(), 0);
    }

    #[tokio::test]
    async fn test_live_connections_capped_at_max() {
        /// 建立完成后一直占着连接名额
        struct HoldsSlot {
            entered: AtomicUsize,
        }

        #[async_trait]
        impl ConnectionHandler for HoldsSlot {
            async fn handle(&self, _id: ConnectionId, _peer: SocketAddr, _stream: TcpStream, mut permit: ConnectionPermit) {
                permit.setup_complete();
                self.entered.fetch_add(1, Ordering::SeqCst);
                std::future::pending::<()>().await;
            }
        }

        let acceptor = ThrottledAcceptor::bind("127.0.0.1:0", 2, 1)
            .await
            .unwrap();
        let addr = acceptor.local_addr().unwrap();
        let gauge = acceptor.gauge();
        let handler = Arc::new(HoldsSlot { entered: AtomicUsize::new(0) });
        let shutdown = CancellationToken::new();

        tokio::spawn(acceptor.run(handler.clone(), shutdown.clone(), TaskTracker::new()));

        let mut clients = Vec::new();
        for _ in 0..4 {
            clients.push(TcpStream::connect(addr).await.unwrap());
        }
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert_eq!(handler.entered.load(Ordering::SeqCst), 2);
        assert_eq!(gauge.live(), 2);
        assert_eq!(gauge.in_setup(), 0);

        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_accept_backoff_yields_to_shutdown() {
        let shutdown = CancellationToken::new();
        let started = std::time::Instant::now();
        assert!(accept_backoff(&shutdown).await);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);

        let waiting = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { accept_backoff(&shutdown).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        let started = std::time::Instant::now();
        shutdown.cancel();
        let resumed = tokio::time::timeout(Duration::from_millis(50), waiting).await.unwrap().unwrap();
        assert!(!resumed);
        assert!(started.elapsed() < ACCEPT_BACKOFF);
    }
}
