//! 消费者与处理器配置
//!
//! 以函数式选项的形式调整 `ConsumerConfig` / `HandlerConfig`：
//! 选项在构造时即完成校验，越界输入直接返回错误而不是被静默截断。
//!
use crate::error::{StreamError, StreamResult};
use std::time::Duration;

pub const MIN_CONCURRENCY: usize = 1;
pub const MAX_CONCURRENCY: usize = 64;
pub const MIN_IDLE_TIMEOUT: Duration = Duration::from_secs(5);
pub const MAX_MAX_RETRIES: usize = 64;

/// 单个流处理器的配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HandlerConfig {
    /// 投递在被回收前至少需要保持未确认的时长
    pub idle_timeout: Duration,
    /// 超过该次数后消息会被强制确认（丢弃）
    pub max_retries: usize,
}

impl Default for HandlerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(60),
            max_retries: 2,
        }
    }
}

/// 消费者配置
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ConsumerConfig {
    /// 工作协程数量
    pub concurrency: usize,
    /// 注册处理器时使用的默认配置
    pub default_handler_config: HandlerConfig,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            default_handler_config: HandlerConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
enum HandlerOptionKind {
    IdleTimeout(Duration),
    MaxRetries(usize),
}

/// 处理器选项（仅能通过校验构造函数创建）
#[derive(Clone, Debug)]
pub struct HandlerOption(HandlerOptionKind);

impl HandlerOption {
    pub fn idle_timeout(timeout: Duration) -> StreamResult<Self> {
        if timeout < MIN_IDLE_TIMEOUT {
            return Err(StreamError::invalid_option(format!(
                "idle timeout {timeout:?} is below the minimum of {MIN_IDLE_TIMEOUT:?}"
            )));
        }

        Ok(Self(HandlerOptionKind::IdleTimeout(timeout)))
    }

    pub fn max_retries(retries: usize) -> StreamResult<Self> {
        if retries > MAX_MAX_RETRIES {
            return Err(StreamError::invalid_option(format!(
                "max retries {retries} is out of range [0, {MAX_MAX_RETRIES}]"
            )));
        }

        Ok(Self(HandlerOptionKind::MaxRetries(retries)))
    }

    pub(crate) fn apply(&self, config: &mut HandlerConfig) {
        match self.0 {
            HandlerOptionKind::IdleTimeout(timeout) => config.idle_timeout = timeout,
            HandlerOptionKind::MaxRetries(retries) => config.max_retries = retries,
        }
    }
}

#[derive(Clone, Debug)]
enum ConsumerOptionKind {
    Concurrency(usize),
    HandlerOptions(Vec<HandlerOption>),
}

/// 消费者选项（仅能通过校验构造函数创建）
#[derive(Clone, Debug)]
pub struct ConsumerOption(ConsumerOptionKind);

impl ConsumerOption {
    pub fn concurrency(concurrency: usize) -> StreamResult<Self> {
        if !(MIN_CONCURRENCY..=MAX_CONCURRENCY).contains(&concurrency) {
            return Err(StreamError::invalid_option(format!(
                "concurrency {concurrency} is out of range [{MIN_CONCURRENCY}, {MAX_CONCURRENCY}]"
            )));
        }

        Ok(Self(ConsumerOptionKind::Concurrency(concurrency)))
    }

    /// 调整所有后续注册处理器的默认配置
    pub fn handler_options(opts: impl IntoIterator<Item = HandlerOption>) -> Self {
        Self(ConsumerOptionKind::HandlerOptions(opts.into_iter().collect()))
    }

    pub(crate) fn apply(&self, config: &mut ConsumerConfig) {
        match &self.0 {
            ConsumerOptionKind::Concurrency(n) => config.concurrency = *n,
            ConsumerOptionKind::HandlerOptions(opts) => {
                for opt in opts {
                    opt.apply(&mut config.default_handler_config);
                }
            }
        }
    }
}

impl ConsumerConfig {
    pub fn apply(&mut self, opts: &[ConsumerOption]) {
        for opt in opts {
            opt.apply(self);
        }
    }

    /// 以默认处理器配置为基础，叠加注册时传入的选项
    pub fn handler_config(&self, opts: &[HandlerOption]) -> HandlerConfig {
        let mut config = self.default_handler_config;
        for opt in opts {
            opt.apply(&mut config);
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = ConsumerConfig::default();
        assert_eq!(config.concurrency, 2);
        assert_eq!(config.default_handler_config.idle_timeout, Duration::from_secs(60));
        assert_eq!(config.default_handler_config.max_retries, 2);
    }

    #[test]
    fn out_of_range_options_are_rejected() {
        assert!(ConsumerOption::concurrency(0).is_err());
        assert!(ConsumerOption::concurrency(65).is_err());
        assert!(HandlerOption::idle_timeout(Duration::from_secs(4)).is_err());
        assert!(HandlerOption::max_retries(65).is_err());

        assert!(ConsumerOption::concurrency(1).is_ok());
        assert!(ConsumerOption::concurrency(64).is_ok());
        assert!(HandlerOption::idle_timeout(Duration::from_secs(5)).is_ok());
        assert!(HandlerOption::max_retries(0).is_ok());
    }

    #[test]
    fn handler_options_layer_over_defaults() -> StreamResult<()> {
        let mut config = ConsumerConfig::default();
        config.apply(&[
            ConsumerOption::concurrency(1)?,
            ConsumerOption::handler_options([HandlerOption::idle_timeout(Duration::from_secs(10))?]),
        ]);
        assert_eq!(config.concurrency, 1);

        let handler = config.handler_config(&[HandlerOption::max_retries(0)?]);
        assert_eq!(handler.idle_timeout, Duration::from_secs(10));
        assert_eq!(handler.max_retries, 0);
        Ok(())
    }
}
