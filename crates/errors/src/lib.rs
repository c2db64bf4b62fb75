//! courier-errors - 统一错误处理
//!
//! 只有 `start` 会把错误返回给调用方，其余操作的错误仅用于日志和错误回调

use thiserror::Error;

/// 消息代理错误类型
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum BrokerError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Producer error: {0}")]
    Producer(String),

    #[error("Consumer error: {0}")]
    Consumer(String),

    #[error("Subscription error on {topic}: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("Invalid channel name: {0}")]
    InvalidChannel(String),
}

impl BrokerError {
    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn producer(msg: impl Into<String>) -> Self {
        Self::Producer(msg.into())
    }

    pub fn consumer(msg: impl Into<String>) -> Self {
        Self::Consumer(msg.into())
    }

    pub fn subscription(topic: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Subscription {
            topic: topic.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_channel(msg: impl Into<String>) -> Self {
        Self::InvalidChannel(msg.into())
    }

    /// 调用方重试 `start` 是否可能成功
    ///
    /// - `Connection`: broker 暂时不可达
    ///
    /// 其余错误来自配置或客户端构造，重试不会改变结果
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection(_))
    }

    /// 错误类别名称（用于日志字段）
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::Connection(_) => "connection",
            Self::Producer(_) => "producer",
            Self::Consumer(_) => "consumer",
            Self::Subscription { .. } => "subscription",
            Self::InvalidChannel(_) => "invalid_channel",
        }
    }
}

/// Result 类型别名
pub type BrokerResult<T> = Result<T, BrokerError>;
