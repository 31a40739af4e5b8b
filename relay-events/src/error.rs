//! 事件层错误定义
//!
//! `EventsError` 覆盖配置、误用、编解码与后端连接；
//! `HandlerError` 是事件处理函数的结构化结果，用于区分“重试”与“丢弃”。
//!
use relay_stream::StreamError;
use std::fmt;
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventsError {
    #[error("invalid config: {reason}")]
    InvalidConfig { reason: String },
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },
    #[error("failed to encode event: {reason}")]
    Encode { reason: String },
    #[error("failed to decode event: {reason}")]
    Decode { reason: String },
    #[cfg(feature = "redis")]
    #[error("redis error: {source}")]
    Redis {
        #[from]
        source: redis::RedisError,
    },
    #[error(transparent)]
    Stream(#[from] StreamError),
}

impl EventsError {
    pub(crate) fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }
}

pub type EventsResult<T> = Result<T, EventsError>;

/// 事件处理函数的失败结果
///
/// - `Retry`：保持未确认，等待回收后重新投递；
/// - `Discard`：记录告警后直接确认，不再重试。
///
/// 任意 `Into<anyhow::Error>` 的错误都可以通过 `?` 转为 `Retry`。
pub enum HandlerError {
    Retry(anyhow::Error),
    Discard(anyhow::Error),
}

impl HandlerError {
    /// 请求丢弃当前事件（确认且不重试），保留原始错误用于日志
    pub fn discard(err: impl Into<anyhow::Error>) -> Self {
        Self::Discard(err.into())
    }

    pub fn is_discard(&self) -> bool {
        matches!(self, Self::Discard(_))
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            Self::Retry(err) | Self::Discard(err) => err,
        }
    }
}

impl<E> From<E> for HandlerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self::Retry(err.into())
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry(err) => write!(f, "{err:#}"),
            Self::Discard(err) => write!(f, "discard event: {err:#}"),
        }
    }
}

impl fmt::Debug for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Retry(err) => f.debug_tuple("Retry").field(err).finish(),
            Self::Discard(err) => f.debug_tuple("Discard").field(err).finish(),
        }
    }
}

pub type HandlerResult = Result<(), HandlerError>;

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> HandlerResult {
        raw.parse::<u32>()?;
        Ok(())
    }

    #[test]
    fn question_mark_converts_to_retry() {
        let err = parse("nope").unwrap_err();
        assert!(!err.is_discard());
        assert!(err.to_string().contains("invalid digit"));
    }

    #[test]
    fn discard_keeps_inner_error() {
        let err = HandlerError::discard(anyhow::anyhow!("poison payload"));
        assert!(err.is_discard());
        assert_eq!(err.to_string(), "discard event: poison payload");
        assert_eq!(err.into_inner().to_string(), "poison payload");
    }

    #[test]
    fn stream_errors_pass_through() {
        let err: EventsError = StreamError::NoStreams.into();
        assert_eq!(err.to_string(), StreamError::NoStreams.to_string());
    }
}
