/// 端到端测试 - 真实TCP回环上的锁步服务器与客户端
///
/// 测试目标：
/// 1. 单客户端往返：时间单调、延迟有界
/// 2. 多客户端并发接入，限流下全部注册并持续同步
/// 3. 单个客户端断开不影响其他客户端
/// 4. 沉默客户端被驱逐，活跃客户端继续
/// 5. 运行时间到期后有序关闭
/// 6. 客户端驱动循环的退出路径

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use lockstep::{
    ClientConfig, ClockFace, Connection, ConnectionHandle, ConnectionId, ConnectionRegistry, DriverExit, FrameLogic,
    FramedConnection, InputEvent, LockstepServer, Packet, Reply, Request, RoundTripDriver, ServerConfig, ServerLink,
    TransportError,
};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new("lockstep=debug"))
        .with_test_writer()
        .try_init();
}

/// 30fps 下的一个帧周期
const FRAME: Duration = Duration::from_nanos(33_333_333);

fn test_config() -> ServerConfig {
    ServerConfig::new()
        .with_bind_address("127.0.0.1:0")
        .with_max_connections(100)
        .with_accept_throttle(10)
        .with_fps(30)
        .with_frame_timeout(Duration::from_secs(2))
        .with_run_duration(None)
        .with_graceful_timeout(Duration::from_secs(2))
        .with_info_interval(Duration::from_millis(250))
}

struct RunningServer {
    addr: SocketAddr,
    registry: Arc<ConnectionRegistry<ConnectionHandle>>,
    shutdown: CancellationToken,
    task: JoinHandle<Result<(), TransportError>>,
}

async fn start_server(config: ServerConfig) -> Result<RunningServer, TransportError> {
    let server = LockstepServer::bind(config).await?;
    Ok(RunningServer {
        addr: server.local_addr()?,
        registry: server.registry(),
        shutdown: server.shutdown_token(),
        task: tokio::spawn(server.run()),
    })
}

async fn connect(addr: SocketAddr) -> Result<FramedConnection<TcpStream>, TransportError> {
    FramedConnection::connect(&addr.to_string(), Duration::from_secs(2)).await
}

async fn round_trip(connection: &mut FramedConnection<TcpStream>, message_id: u32) -> Result<DateTime<Utc>, TransportError> {
    connection.send(Packet::request(message_id, &Request::Tick { cmd: 0 })?).await?;
    let reply = connection.recv().await?;
    assert_eq!(reply.message_id(), message_id);
    let Reply::Clock { at } = reply.to_reply()?;
    Ok(at)
}

async fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

/// 持续往返直到 `stop` 被取消的客户端，返回回复之间的最大间隔
struct LoopingClient {
    replies: Arc<AtomicU64>,
    stop: CancellationToken,
    task: JoinHandle<Result<Duration, TransportError>>,
}

fn spawn_looping_client(addr: SocketAddr) -> LoopingClient {
    let replies = Arc::new(AtomicU64::new(0));
    let stop = CancellationToken::new();

    let task = {
        let replies = replies.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut connection = connect(addr).await?;
            let mut message_id = 0;
            let mut last_reply: Option<Instant> = None;
            let mut max_gap = Duration::ZERO;

            while !stop.is_cancelled() {
                message_id += 1;
                round_trip(&mut connection, message_id).await?;
                replies.fetch_add(1, Ordering::SeqCst);

                let now = Instant::now();
                if let Some(last) = last_reply {
                    max_gap = max_gap.max(now - last);
                }
                last_reply = Some(now);
            }
            Ok(max_gap)
        })
    };

    LoopingClient { replies, stop, task }
}

#[tokio::test]
async fn test_single_client_round_trips() -> Result<(), TransportError> {
    init_tracing();
    let server = start_server(test_config()).await?;
    let mut connection = connect(server.addr).await?;

    let mut previous: Option<DateTime<Utc>> = None;
    for message_id in 1..=100 {
        let sent_at = Utc::now();
        let started = Instant::now();
        let at = round_trip(&mut connection, message_id).await?;

        // 请求最多等到下一帧，再加一帧的调度余量
        let latency = started.elapsed();
        assert!(latency < 2 * FRAME, "round trip {} took {:?}", message_id, latency);
        assert!(at > sent_at, "reply time must be after the request was sent");
        if let Some(previous) = previous {
            assert!(at >= previous, "reply times must be monotonic");
        }
        previous = Some(at);
    }

    drop(connection);
    server.shutdown.cancel();
    server.task.await.unwrap()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_fifty_clients_all_synchronized() -> Result<(), TransportError> {
    init_tracing();
    let server = start_server(test_config()).await?;

    let clients: Vec<_> = (0..50).map(|_| spawn_looping_client(server.addr)).collect();

    let registry = server.registry.clone();
    assert!(wait_until(Duration::from_secs(5), || registry.len() == 50).await);

    let before: Vec<u64> = clients.iter().map(|c| c.replies.load(Ordering::SeqCst)).collect();
    tokio::time::sleep(Duration::from_secs(1)).await;
    for (client, before) in clients.iter().zip(before) {
        let gained = client.replies.load(Ordering::SeqCst) - before;
        assert!(gained >= 10, "client only got {} replies in one second", gained);
    }

    for client in &clients {
        client.stop.cancel();
    }
    for outcome in join_all(clients.into_iter().map(|c| c.task)).await {
        outcome.unwrap()?;
    }

    assert!(wait_until(Duration::from_secs(2), || registry.is_empty()).await);
    server.shutdown.cancel();
    server.task.await.unwrap()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_closing_one_client_does_not_disturb_others() -> Result<(), TransportError> {
    init_tracing();
    let server = start_server(test_config()).await?;

    let mut clients: Vec<_> = (0..5).map(|_| spawn_looping_client(server.addr)).collect();
    let registry = server.registry.clone();
    assert!(wait_until(Duration::from_secs(3), || registry.len() == 5).await);

    let leaving = clients.remove(0);
    leaving.stop.cancel();
    leaving.task.await.unwrap()?;
    assert!(wait_until(Duration::from_secs(1), || registry.len() == 4).await);

    let before: Vec<u64> = clients.iter().map(|c| c.replies.load(Ordering::SeqCst)).collect();
    tokio::time::sleep(Duration::from_millis(500)).await;
    for (client, before) in clients.iter().zip(before) {
        assert!(client.replies.load(Ordering::SeqCst) - before >= 5);
    }

    for client in &clients {
        client.stop.cancel();
    }
    for client in clients {
        let max_gap = client.task.await.unwrap()?;
        assert!(max_gap < 2 * FRAME, "gap of {:?} between replies", max_gap);
    }

    server.shutdown.cancel();
    server.task.await.unwrap()?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_silent_client_is_evicted() -> Result<(), TransportError> {
    init_tracing();
    let server = start_server(test_config().with_frame_timeout(Duration::from_millis(100))).await?;

    let active = spawn_looping_client(server.addr);
    let mut silent = connect(server.addr).await?;

    let closed = tokio::time::timeout(Duration::from_secs(3), silent.recv())
        .await
        .expect("silent client should be disconnected");
    assert_eq!(closed, Err(TransportError::Closed));

    let registry = server.registry.clone();
    assert!(wait_until(Duration::from_secs(1), || registry.len() == 1).await);

    let before = active.replies.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(active.replies.load(Ordering::SeqCst) > before);

    active.stop.cancel();
    active.task.await.unwrap()?;
    server.shutdown.cancel();
    server.task.await.unwrap()?;
    Ok(())
}

#[tokio::test]
async fn test_run_duration_shuts_down_in_order() -> Result<(), TransportError> {
    init_tracing();
    let server = start_server(test_config().with_run_duration(Some(Duration::from_millis(500)))).await?;
    let client = spawn_looping_client(server.addr);

    let result = tokio::time::timeout(Duration::from_secs(5), server.task)
        .await
        .expect("server should stop after its run duration");
    assert!(result.unwrap().is_ok());
    assert!(server.shutdown.is_cancelled());
    assert!(server.registry.is_empty());

    // 客户端在下一次往返时发现连接已关闭
    let outcome = tokio::time::timeout(Duration::from_secs(2), client.task).await.unwrap().unwrap();
    assert!(outcome.is_err());
    assert!(client.replies.load(Ordering::SeqCst) > 0);

    // 停止接入
    assert!(TcpStream::connect(server.addr).await.is_err());
    Ok(())
}

#[derive(Clone, Default)]
struct RecordingFace {
    times: Arc<Mutex<Vec<DateTime<Utc>>>>,
}

impl ClockFace for RecordingFace {
    fn set_time(&mut self, at: DateTime<Utc>) {
        self.times.lock().push(at);
    }

    fn draw(&mut self) {}
}

#[tokio::test]
async fn test_driver_quit_and_disconnect() -> Result<(), TransportError> {
    init_tracing();
    let server = start_server(test_config().with_fps(60)).await?;
    let client_config = ClientConfig::new()
        .with_server_address(server.addr.to_string())
        .with_connect_timeout(Duration::from_secs(1))
        .with_info_interval(Duration::from_millis(100));

    // 用户退出
    let face = RecordingFace::default();
    let (input_tx, input_rx) = mpsc::channel(4);
    let driver = RoundTripDriver::new(ServerLink::connect(&client_config).await?, face.clone(), input_rx, &client_config);
    let running = tokio::spawn(driver.run());

    let times = face.times.clone();
    assert!(wait_until(Duration::from_secs(3), || times.lock().len() >= 5).await);
    input_tx.send(InputEvent::Quit).await.unwrap();
    assert_eq!(running.await.unwrap(), DriverExit::Quit);

    let recorded = face.times.lock().clone();
    assert!(recorded.windows(2).all(|w| w[0] <= w[1]));

    // 服务器关闭
    let face = RecordingFace::default();
    let (_input_tx, input_rx) = mpsc::channel(4);
    let driver = RoundTripDriver::new(ServerLink::connect(&client_config).await?, face.clone(), input_rx, &client_config);
    let running = tokio::spawn(driver.run());

    let times = face.times.clone();
    assert!(wait_until(Duration::from_secs(3), || !times.lock().is_empty()).await);
    server.shutdown.cancel();

    let exit = tokio::time::timeout(Duration::from_secs(3), running).await.unwrap().unwrap();
    assert_eq!(exit, DriverExit::Disconnected);
    server.task.await.unwrap()?;
    Ok(())
}

#[tokio::test]
async fn test_shutdown_lets_in_flight_frame_finish() -> Result<(), TransportError> {
    init_tracing();
    let server = start_server(test_config()).await?;
    let mut connection = connect(server.addr).await?;

    let registry = server.registry.clone();
    assert!(wait_until(Duration::from_secs(2), || registry.len() == 1).await);
    // 过几个帧周期，当前帧已经在等待这个连接的请求
    tokio::time::sleep(3 * FRAME).await;

    server.shutdown.cancel();
    tokio::time::sleep(Duration::from_millis(100)).await;

    // 关闭之后才到达的请求仍属于进行中的帧，必须收到回复
    let sent_at = Utc::now();
    let at = round_trip(&mut connection, 1).await?;
    assert!(at > sent_at);

    // 帧结束后连接被关闭，不会再开始新的帧
    let closed = tokio::time::timeout(Duration::from_secs(1), connection.recv())
        .await
        .expect("connection should close right after the frame");
    assert_eq!(closed, Err(TransportError::Closed));

    tokio::time::timeout(Duration::from_secs(1), server.task).await.unwrap().unwrap()?;
    assert!(server.registry.is_empty());
    Ok(())
}

/// 记录每个连接收到的请求数的帧逻辑
#[derive(Clone, Default)]
struct CountingClock {
    seen: Arc<Mutex<Vec<ConnectionId>>>,
}

impl FrameLogic for CountingClock {
    fn next_command(&mut self, id: ConnectionId, _request: &Request) -> Reply {
        self.seen.lock().push(id);
        Reply::clock_now()
    }
}

#[tokio::test]
async fn test_custom_frame_logic_serves_every_request() -> Result<(), TransportError> {
    init_tracing();
    let logic = CountingClock::default();
    let server = LockstepServer::bind(test_config()).await?.with_logic(logic.clone());
    let addr = server.local_addr()?;
    let shutdown = server.shutdown_token();
    let task = tokio::spawn(server.run());

    let mut connection = connect(addr).await?;
    for message_id in 1..=5 {
        round_trip(&mut connection, message_id).await?;
    }

    let seen = logic.seen.lock().clone();
    assert_eq!(seen.len(), 5);
    assert!(seen.windows(2).all(|w| w[0] == w[1]));

    drop(connection);
    shutdown.cancel();
    task.await.unwrap()?;
    Ok(())
}
