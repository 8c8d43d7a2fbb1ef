/// 连接注册表
///
/// 以 `ConnectionId` 为键保存活跃连接句柄。所有变更由同一把锁串行化，
/// 锁只在映射操作期间持有，从不跨越网络等待或通道等待。

use std::collections::BTreeMap;
use std::sync::Arc;
use parking_lot::Mutex;
use crate::{ConnectionId, error::TransportError};

/// 可注册的连接句柄
pub trait Registrant: Send + Sync {
    fn id(&self) -> ConnectionId;
}

/// 线程安全的连接注册表
///
/// 使用有序映射，保证同一次运行中的遍历顺序确定（按ID升序）。
pub struct ConnectionRegistry<H> {
    handles: Mutex<BTreeMap<ConnectionId, Arc<H>>>,
}

impl<H: Registrant> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self {
            handles: Mutex::new(BTreeMap::new()),
        }
    }

    /// 添加连接；ID已存在时记录异常并保持原状
    pub fn add(&self, handle: Arc<H>) -> Result<(), TransportError> {
        let id = handle.id();
        let mut handles = self.handles.lock();
        if handles.contains_key(&id) {
            drop(handles);
            tracing::warn!("⚠️ 注册表异常: 连接已存在 ({})", id);
            return Err(TransportError::registry_anomaly(id, "duplicate add"));
        }
        handles.insert(id, handle);
        Ok(())
    }

    /// 移除连接；ID不存在时记录异常
    pub fn remove(&self, id: ConnectionId) -> Result<Arc<H>, TransportError> {
        let removed = self.handles.lock().remove(&id);
        removed.ok_or_else(|| {
            tracing::warn!("⚠️ 注册表异常: 连接不存在 ({})", id);
            TransportError::registry_anomaly(id, "missing remove")
        })
    }

    /// 对每个活跃句柄执行访问者
    ///
    /// 遍历期间持有锁，因此 `remove` 返回之后的句柄不会再被访问；
    /// 访问者不能阻塞。需要跨越等待的遍历请使用 `snapshot`。
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&Arc<H>),
    {
        let handles = self.handles.lock();
        for handle in handles.values() {
            visitor(handle);
        }
    }

    /// 当前成员的快照（按ID升序）
    pub fn snapshot(&self) -> Vec<Arc<H>> {
        self.handles.lock().values().cloned().collect()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.handles.lock().contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.lock().is_empty()
    }
}

impl<H: Registrant> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

impl<H> std::fmt::Debug for ConnectionRegistry<H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("len", &self.handles.lock().len())
            .finish()
    }
}

/// 注册守卫：创建时加入注册表，丢弃时移除
///
/// 无论连接循环如何退出（正常、IO错误、panic），注销都会发生。
pub struct Registration<H: Registrant> {
    registry: Arc<ConnectionRegistry<H>>,
    handle: Arc<H>,
}

impl<H: Registrant> Registration<H> {
    pub fn new(registry: Arc<ConnectionRegistry<H>>, handle: Arc<H>) -> Result<Self, TransportError> {
        registry.add(handle.clone())?;
        Ok(Self { registry, handle })
    }

    pub fn handle(&self) -> &Arc<H> {
        &self.handle
    }
}

impl<H: Registrant> Drop for Registration<H> {
    fn drop(&mut self) {
        // 缺失时 remove 自己会记录异常
        let _ = self.registry.remove(self.handle.id());
    }
}
