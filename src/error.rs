use std::time::Duration;
use crate::ConnectionId;

/// 连接关闭原因
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// 对端正常关闭 (EOF)
    Normal,
    /// 错过帧截止时间，被协调器驱逐
    Timeout,
    /// 错误
    Error(String),
    /// 服务端关闭，强制断开
    Forced,
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CloseReason::Normal => write!(f, "normal"),
            CloseReason::Timeout => write!(f, "timeout"),
            CloseReason::Error(reason) => write!(f, "error: {}", reason),
            CloseReason::Forced => write!(f, "forced"),
        }
    }
}

/// 统一传输错误类型
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// 连接相关错误 (IO失败或对端异常断开)
    #[error("Connection error: {reason} (retryable: {retryable})")]
    Connection {
        reason: String,
        retryable: bool,
    },

    /// 对端正常关闭
    #[error("Connection closed by peer")]
    Closed,

    /// 协议相关错误
    #[error("Protocol error ({protocol}): {reason}")]
    Protocol {
        protocol: String,
        reason: String,
    },

    /// 配置相关错误
    #[error("Configuration error in field '{field}': {reason}")]
    Configuration {
        field: String,
        reason: String,
    },

    /// 接受连接失败
    #[error("Setup error: {reason}")]
    Setup {
        reason: String,
    },

    /// 注册表异常 (重复添加或删除不存在的连接)
    #[error("Registry anomaly for {id}: {reason}")]
    Registry {
        id: ConnectionId,
        reason: String,
    },

    /// 超时错误
    #[error("Operation '{operation}' timeout after {duration:?}")]
    Timeout {
        operation: String,
        duration: Duration,
    },

    /// 步进器已停止
    #[error("Step runner stopped")]
    Stopped,
}

impl TransportError {
    /// 获取错误代码
    pub fn error_code(&self) -> &'static str {
        match self {
            TransportError::Connection { .. } => "CONNECTION_ERROR",
            TransportError::Closed => "CONNECTION_CLOSED",
            TransportError::Protocol { .. } => "PROTOCOL_ERROR",
            TransportError::Configuration { .. } => "CONFIG_ERROR",
            TransportError::Setup { .. } => "SETUP_ERROR",
            TransportError::Registry { .. } => "REGISTRY_ANOMALY",
            TransportError::Timeout { .. } => "TIMEOUT_ERROR",
            TransportError::Stopped => "STEP_STOPPED",
        }
    }

    /// 转换为连接关闭原因
    pub fn close_reason(&self) -> CloseReason {
        match self {
            TransportError::Closed => CloseReason::Normal,
            TransportError::Timeout { .. } => CloseReason::Timeout,
            other => CloseReason::Error(other.to_string()),
        }
    }
}

/// 便利构造函数
impl TransportError {
    /// 创建连接错误
    pub fn connection_error(reason: impl Into<String>, retryable: bool) -> Self {
        Self::Connection {
            reason: reason.into(),
            retryable,
        }
    }

    /// 创建协议错误
    pub fn protocol_error(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Protocol {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }

    /// 创建配置错误
    pub fn config_error(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Configuration {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// 创建接受连接错误
    pub fn setup_error(reason: impl Into<String>) -> Self {
        Self::Setup {
            reason: reason.into(),
        }
    }

    /// 创建注册表异常
    pub fn registry_anomaly(id: ConnectionId, reason: impl Into<String>) -> Self {
        Self::Registry {
            id,
            reason: reason.into(),
        }
    }

    /// 创建超时错误
    pub fn timeout_error(operation: impl Into<String>, duration: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            duration,
        }
    }
}

/// 从标准IO错误转换
impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        if error.kind() == std::io::ErrorKind::UnexpectedEof {
            return TransportError::Closed;
        }

        let retryable = matches!(
            error.kind(),
            std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
        );

        TransportError::Connection {
            reason: format!("IO error: {}", error),
            retryable,
        }
    }
}

impl From<serde_json::Error> for TransportError {
    fn from(error: serde_json::Error) -> Self {
        TransportError::protocol_error("json", error.to_string())
    }
}

/// 错误分级
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorSeverity {
    Low,      // 可忽略的错误
    Medium,   // 需要关注的错误
    High,     // 需要处理的错误
    Critical, // 严重错误
}

impl TransportError {
    /// 获取错误严重性
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            TransportError::Configuration { .. } => ErrorSeverity::Critical,
            TransportError::Connection { retryable, .. } => {
                if *retryable {
                    ErrorSeverity::Medium
                } else {
                    ErrorSeverity::High
                }
            }
            TransportError::Closed | TransportError::Stopped => ErrorSeverity::Low,
            TransportError::Protocol { .. } => ErrorSeverity::High,
            TransportError::Setup { .. } => ErrorSeverity::Medium,
            TransportError::Registry { .. } => ErrorSeverity::High,
            TransportError::Timeout { .. } => ErrorSeverity::Medium,
        }
    }

    /// 按严重性选择日志级别记录错误
    pub fn log(&self, context: &str, id: ConnectionId) {
        match self.severity() {
            ErrorSeverity::Low => tracing::debug!("{} ({}): {}", context, id, self),
            ErrorSeverity::Medium => tracing::warn!("{} ({}): {}", context, id, self),
            ErrorSeverity::High | ErrorSeverity::Critical => tracing::error!("{} ({}): {}", context, id, self),
        }
    }
}
