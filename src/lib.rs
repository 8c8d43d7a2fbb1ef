/// lockstep - 固定帧率的连接同步引擎
///
/// 服务端每一帧从所有已注册连接各收集一个请求，然后向每个连接各下发一个命令；
/// 客户端始终保持恰好一个在途请求。所有跨任务通信都通过容量为1的通道完成。

// 错误与协议
pub mod error;
pub mod packet;
pub mod connection;

// 同步原语
pub mod step;
pub mod registry;
pub mod stats;

// 服务端
pub mod acceptor;
pub mod coordinator;
pub mod server;

// 客户端
pub mod client;

pub mod config;

use std::sync::atomic::{AtomicU64, Ordering};

/// 连接ID的类型安全包装器
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// 创建新的连接ID
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// 获取原始ID值
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

impl From<u64> for ConnectionId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// 进程级单调ID生成器
///
/// 从1开始递增，进程存活期间不会复用
#[derive(Debug)]
pub struct IdGenerator {
    next: AtomicU64,
}

impl IdGenerator {
    pub const fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    /// 分配下一个连接ID
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for IdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

static GLOBAL_IDS: IdGenerator = IdGenerator::new();

/// 从进程全局生成器分配连接ID（服务端与客户端共用）
pub fn next_connection_id() -> ConnectionId {
    GLOBAL_IDS.next_id()
}

// 重新导出核心类型
pub use error::{TransportError, CloseReason};
pub use packet::{Packet, PacketType, Request, Reply};
pub use connection::{Connection, FramedConnection};
pub use step::{Step, StepRunner, StepWorker};
pub use registry::{ConnectionRegistry, Registrant, Registration};
pub use stats::{ActionStats, StatsSnapshot};
pub use acceptor::{ThrottledAcceptor, ConnectionHandler, ConnectionPermit, AdmissionGauge};
pub use coordinator::{TickCoordinator, FrameLogic, FrameReport, WallClock};
pub use server::{ConnectionHandle, ClientSession, LockstepServer};
pub use client::{ServerLink, RoundTripDriver, ClockFace, InputEvent, DriverExit};
pub use config::{ServerConfig, ClientConfig, ConfigError};

// 便捷的类型别名
pub type Result<T> = std::result::Result<T, TransportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_generator_is_monotonic() {
        let ids = IdGenerator::new();
        let a = ids.next_id();
        let b = ids.next_id();
        let c = ids.next_id();

        assert_eq!(a.as_u64(), 1);
        assert!(a < b && b < c);
    }

    #[test]
    fn test_global_ids_are_unique() {
        let first = next_connection_id();
        let second = next_connection_id();
        assert_ne!(first, second);
        assert_eq!(format!("{}", ConnectionId::new(7)), "conn-7");
    }
}
