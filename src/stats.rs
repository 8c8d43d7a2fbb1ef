use std::time::{Duration, Instant};
use parking_lot::Mutex;

/// 动作统计：累计计数 + 滚动速率窗口
///
/// `inc` 在事件发生时调用；信息定时器周期性调用 `update_lap` 取快照并重置窗口。
#[derive(Debug)]
pub struct ActionStats {
    inner: Mutex<StatsInner>,
}

#[derive(Debug)]
struct StatsInner {
    total: u64,
    lap_count: u64,
    started_at: Instant,
    lap_started_at: Instant,
}

/// 统计快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatsSnapshot {
    /// 累计次数
    pub total: u64,
    /// 当前窗口内的次数
    pub lap_count: u64,
    /// 当前窗口时长
    pub lap_elapsed: Duration,
    /// 自创建以来的时长
    pub uptime: Duration,
}

impl StatsSnapshot {
    /// 当前窗口的每秒速率
    pub fn lap_rate(&self) -> f64 {
        let secs = self.lap_elapsed.as_secs_f64();
        if secs > 0.0 {
            self.lap_count as f64 / secs
        } else {
            0.0
        }
    }

    /// 全程平均每秒速率
    pub fn average_rate(&self) -> f64 {
        let secs = self.uptime.as_secs_f64();
        if secs > 0.0 {
            self.total as f64 / secs
        } else {
            0.0
        }
    }
}

impl std::fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "total {} ({:.1}/s), lap {} in {:.2}s ({:.1}/s)",
            self.total,
            self.average_rate(),
            self.lap_count,
            self.lap_elapsed.as_secs_f64(),
            self.lap_rate()
        )
    }
}

impl ActionStats {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            inner: Mutex::new(StatsInner {
                total: 0,
                lap_count: 0,
                started_at: now,
                lap_started_at: now,
            }),
        }
    }

    /// 记录一次事件
    pub fn inc(&self) {
        let mut inner = self.inner.lock();
        inner.total += 1;
        inner.lap_count += 1;
    }

    /// 读取快照（不重置窗口）
    pub fn snapshot(&self) -> StatsSnapshot {
        let inner = self.inner.lock();
        Self::snapshot_of(&inner, Instant::now())
    }

    /// 读取快照并开始新窗口
    pub fn update_lap(&self) -> StatsSnapshot {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let snapshot = Self::snapshot_of(&inner, now);
        inner.lap_count = 0;
        inner.lap_started_at = now;
        snapshot
    }

    fn snapshot_of(inner: &StatsInner, now: Instant) -> StatsSnapshot {
        StatsSnapshot {
            total: inner.total,
            lap_count: inner.lap_count,
            lap_elapsed: now.duration_since(inner.lap_started_at),
            uptime: now.duration_since(inner.started_at),
        }
    }
}

impl Default for ActionStats {
    fn default() -> Self {
        Self::new()
    }
}
