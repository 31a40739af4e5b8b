//! 流子系统统一错误定义
//!
//! 按来源划分为：调用方误用、后端瞬时故障、消息处理失败与强制丢弃，
//! 异步产生的错误只经由诊断通道上报。
//!
use std::fmt;
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum StreamError {
    // --- 误用 ---
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("invalid option: {reason}")]
    InvalidOption { reason: String },
    #[error("consumer already started")]
    AlreadyStarted,
    #[error("no streams registered")]
    NoStreams,
    #[error("consumer is already registered for '{stream_id}' (stream key '{key}')")]
    AlreadyRegistered { stream_id: String, key: String },

    // --- 后端 ---
    #[error("consumer group missing: {reason}")]
    NoGroup { reason: String },
    #[error("backend timeout: {reason}")]
    Timeout { reason: String },
    #[error("backend error: {reason}")]
    Backend { reason: String },
    #[error("queue for stream '{stream_id}' is full")]
    QueueFull { stream_id: String },

    // --- 处理 ---
    #[error("failed to process message '{message_id}' in stream '{stream_id}': {reason}")]
    Handler {
        stream_id: String,
        message_id: String,
        reason: String,
    },
    #[error("panic when processing message '{message_id}' in stream '{stream_id}': {reason}")]
    Panic {
        stream_id: String,
        message_id: String,
        reason: String,
    },
    #[error("received message '{message_id}' in stream '{stream_id}' that doesn't belong to us")]
    Unrouted {
        stream_id: String,
        message_id: String,
    },
    #[error("failed to acknowledge message '{message_id}' in stream '{stream_id}': {reason}")]
    Ack {
        stream_id: String,
        message_id: String,
        reason: String,
    },
    #[error("force acknowledged (discarded) message '{message_id}' (retries: {retries}) in stream '{stream_id}'")]
    Discarded {
        stream_id: String,
        message_id: String,
        retries: u64,
    },
}

impl StreamError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn invalid_option(reason: impl Into<String>) -> Self {
        Self::InvalidOption {
            reason: reason.into(),
        }
    }

    pub fn backend(reason: impl Into<String>) -> Self {
        Self::Backend {
            reason: reason.into(),
        }
    }

    /// 为带原因的错误补充上下文，变体保持不变
    pub(crate) fn context(self, context: impl fmt::Display) -> Self {
        let wrap = |reason: String| format!("{context}: {reason}");
        match self {
            Self::InvalidArgument { reason } => Self::InvalidArgument {
                reason: wrap(reason),
            },
            Self::InvalidOption { reason } => Self::InvalidOption {
                reason: wrap(reason),
            },
            Self::NoGroup { reason } => Self::NoGroup {
                reason: wrap(reason),
            },
            Self::Timeout { reason } => Self::Timeout {
                reason: wrap(reason),
            },
            Self::Backend { reason } => Self::Backend {
                reason: wrap(reason),
            },
            other => other,
        }
    }

    /// 是否为后端瞬时故障（内部会退避重试或自愈）
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::NoGroup { .. } | Self::Timeout { .. } | Self::Backend { .. }
        )
    }
}

pub type StreamResult<T> = Result<T, StreamError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_keeps_the_variant() {
        let err = StreamError::Timeout {
            reason: "timed out".into(),
        }
        .context("failed to write to stream 'orders'");
        assert!(matches!(&err, StreamError::Timeout { reason } if reason == "failed to write to stream 'orders': timed out"));
        assert!(err.is_transient());

        let err = StreamError::NoGroup {
            reason: "NOGROUP".into(),
        }
        .context("read");
        assert!(matches!(err, StreamError::NoGroup { .. }));

        let err = StreamError::NoStreams.context("ignored");
        assert_eq!(err.to_string(), "no streams registered");
    }
}
