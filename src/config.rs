/// 服务端与客户端配置
///
/// 所有配置都提供 `with_*` 构建方法和 `validate()`。

use std::time::Duration;
use crate::error::TransportError;

/// 配置错误
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid value for field '{field}': {value} - {reason}. Suggestion: {suggestion}")]
    InvalidValue {
        field: String,
        value: String,
        reason: String,
        suggestion: String,
    },

    #[error("Configuration conflict: {message}")]
    Conflict { message: String },
}

impl ConfigError {
    fn invalid(field: &str, value: impl ToString, reason: &str, suggestion: &str) -> Self {
        ConfigError::InvalidValue {
            field: field.to_string(),
            value: value.to_string(),
            reason: reason.to_string(),
            suggestion: suggestion.to_string(),
        }
    }
}

impl From<ConfigError> for TransportError {
    fn from(error: ConfigError) -> Self {
        match &error {
            ConfigError::InvalidValue { field, .. } => TransportError::config_error(field.clone(), error.to_string()),
            ConfigError::Conflict { .. } => TransportError::config_error("config", error.to_string()),
        }
    }
}

/// 服务端配置
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// 监听地址 (host:port)
    pub bind_address: String,
    /// 同时在线连接上限
    pub max_connections: usize,
    /// 同时进行中的接入/建立数上限
    pub accept_throttle: usize,
    /// 帧率
    pub fps: u32,
    /// 每帧收集请求的截止时间；错过的连接被驱逐
    pub frame_timeout: Duration,
    /// 统计输出间隔
    pub info_interval: Duration,
    /// 运行时长，到期后优雅关闭；None 表示一直运行直到取消
    pub run_duration: Option<Duration>,
    /// 关闭时等待连接处理任务退出的时间
    pub graceful_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:6666".to_string(),
            max_connections: 1000,
            accept_throttle: 10,
            fps: 30,
            frame_timeout: Duration::from_secs(1),
            info_interval: Duration::from_secs(1),
            run_duration: Some(Duration::from_secs(3600)),
            graceful_timeout: Duration::from_secs(5),
        }
    }
}

impl ServerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bind_address(mut self, addr: impl Into<String>) -> Self {
        self.bind_address = addr.into();
        self
    }

    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_accept_throttle(mut self, throttle: usize) -> Self {
        self.accept_throttle = throttle;
        self
    }

    pub fn with_fps(mut self, fps: u32) -> Self {
        self.fps = fps;
        self
    }

    pub fn with_frame_timeout(mut self, timeout: Duration) -> Self {
        self.frame_timeout = timeout;
        self
    }

    pub fn with_info_interval(mut self, interval: Duration) -> Self {
        self.info_interval = interval;
        self
    }

    pub fn with_run_duration(mut self, duration: Option<Duration>) -> Self {
        self.run_duration = duration;
        self
    }

    pub fn with_graceful_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_timeout = timeout;
        self
    }

    /// 帧周期 (1/fps)
    pub fn frame_period(&self) -> Duration {
        Duration::from_nanos(1_000_000_000 / u64::from(self.fps.max(1)))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bind_address.is_empty() {
            return Err(ConfigError::invalid("bind_address", "", "address is empty", "use host:port, e.g. 0.0.0.0:6666"));
        }
        if self.max_connections == 0 {
            return Err(ConfigError::invalid("max_connections", 0, "must be positive", "try 1000"));
        }
        if self.accept_throttle == 0 {
            return Err(ConfigError::invalid("accept_throttle", 0, "must be positive", "try 10"));
        }
        if self.fps == 0 || self.fps > 1000 {
            return Err(ConfigError::invalid("fps", self.fps, "must be within 1..=1000", "try 30"));
        }
        if self.frame_timeout.is_zero() {
            return Err(ConfigError::invalid("frame_timeout", "0s", "must be positive", "use at least one frame period"));
        }
        if self.info_interval.is_zero() {
            return Err(ConfigError::invalid("info_interval", "0s", "must be positive", "try 1s"));
        }
        if self.accept_throttle > self.max_connections {
            return Err(ConfigError::Conflict {
                message: format!(
                    "accept_throttle ({}) exceeds max_connections ({})",
                    self.accept_throttle, self.max_connections
                ),
            });
        }
        Ok(())
    }
}

/// 客户端配置
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// 服务器地址 (host:port)
    pub server_address: String,
    /// 连接超时时间
    pub connect_timeout: Duration,
    /// 重绘间隔
    pub draw_interval: Duration,
    /// 统计输出间隔
    pub info_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost:6666".to_string(),
            connect_timeout: Duration::from_secs(5),
            draw_interval: Duration::from_millis(1000 / 30),
            info_interval: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_server_address(mut self, addr: impl Into<String>) -> Self {
        self.server_address = addr.into();
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_draw_interval(mut self, interval: Duration) -> Self {
        self.draw_interval = interval;
        self
    }

    pub fn with_info_interval(mut self, interval: Duration) -> Self {
        self.info_interval = interval;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_address.is_empty() {
            return Err(ConfigError::invalid("server_address", "", "address is empty", "use host:port, e.g. localhost:6666"));
        }
        if self.connect_timeout.is_zero() {
            return Err(ConfigError::invalid("connect_timeout", "0s", "must be positive", "try 5s"));
        }
        if self.draw_interval.is_zero() || self.info_interval.is_zero() {
            return Err(ConfigError::invalid("draw_interval/info_interval", "0s", "timers must be positive", "try 33ms / 1s"));
        }
        Ok(())
    }
}
