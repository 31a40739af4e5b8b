//! 事件系统配置
//!
use crate::error::{EventsError, EventsResult};
use bon::Builder;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_NAMESPACE: &str = "events";
pub const DEFAULT_MAX_STREAM_LENGTH: usize = 10_000;
pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// 后端模式
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// 持久化后端（Redis Streams）
    Redis,
    /// 进程内后端，仅用于测试与本地开发
    #[default]
    #[serde(alias = "in_memory")]
    InMemory,
}

impl FromStr for Mode {
    type Err = EventsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "redis" => Ok(Self::Redis),
            "inmemory" | "in_memory" => Ok(Self::InMemory),
            other => Err(EventsError::invalid_config(format!(
                "unknown mode '{other}', expected 'redis' or 'inmemory'"
            ))),
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Redis => f.write_str("redis"),
            Self::InMemory => f.write_str("inmemory"),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize, Builder)]
#[serde(default)]
pub struct Config {
    /// 后端模式
    #[builder(default)]
    pub mode: Mode,
    /// 所有流键的前缀，不同部署之间互不干扰
    #[builder(into, default = DEFAULT_NAMESPACE.to_string())]
    pub namespace: String,
    /// 单个流保留的最大消息数
    #[builder(default = DEFAULT_MAX_STREAM_LENGTH)]
    pub max_stream_length: usize,
    /// 是否使用近似裁剪（性能更好，长度可能略超上限）
    #[builder(default = true)]
    pub approx_max_stream_length: bool,
    /// 持久化模式下的连接地址
    #[builder(into, default = DEFAULT_REDIS_URL.to_string())]
    pub redis_url: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            max_stream_length: DEFAULT_MAX_STREAM_LENGTH,
            approx_max_stream_length: true,
            redis_url: DEFAULT_REDIS_URL.to_string(),
        }
    }
}

impl Config {
    pub fn validate(&self) -> EventsResult<()> {
        // 流键总是以 "<namespace>:" 开头
        if self.namespace.trim().is_empty() {
            return Err(EventsError::invalid_config("namespace must not be empty"));
        }

        if self.max_stream_length < 1 {
            return Err(EventsError::invalid_config(format!(
                "max stream length must be at least 1, got {}",
                self.max_stream_length
            )));
        }

        if self.mode == Mode::Redis && self.redis_url.trim().is_empty() {
            return Err(EventsError::invalid_config(
                "redis url is required in redis mode",
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.mode, Mode::InMemory);
        assert_eq!(config.namespace, "events");
        assert_eq!(config.max_stream_length, 10_000);
        assert!(config.approx_max_stream_length);
        assert!(config.validate().is_ok());
        assert_eq!(Config::builder().build(), config);
    }

    #[test]
    fn deserialize_fills_missing_fields() {
        let config: Config =
            serde_json::from_str(r#"{"mode":"redis","namespace":"billing"}"#).unwrap();
        assert_eq!(config.mode, Mode::Redis);
        assert_eq!(config.namespace, "billing");
        assert_eq!(config.max_stream_length, DEFAULT_MAX_STREAM_LENGTH);
        assert_eq!(config.redis_url, DEFAULT_REDIS_URL);
    }

    #[test]
    fn unknown_mode_is_rejected() {
        assert!(serde_json::from_str::<Config>(r#"{"mode":"kafka"}"#).is_err());
        assert!("kafka".parse::<Mode>().is_err());
        assert_eq!("Redis".parse::<Mode>().unwrap(), Mode::Redis);
        assert_eq!("inmemory".parse::<Mode>().unwrap(), Mode::InMemory);
        assert_eq!(Mode::InMemory.to_string(), "inmemory");
    }

    #[test]
    fn zero_length_fails_validation() {
        let config = Config::builder().max_stream_length(0).build();
        assert!(matches!(
            config.validate(),
            Err(EventsError::InvalidConfig { .. })
        ));

        let config = Config::builder().mode(Mode::Redis).redis_url(" ").build();
        assert!(config.validate().is_err());
    }

    #[test]
    fn empty_namespace_fails_validation() {
        for namespace in ["", "  "] {
            let config = Config::builder().namespace(namespace).build();
            assert!(matches!(
                config.validate(),
                Err(EventsError::InvalidConfig { reason }) if reason.contains("namespace")
            ));
        }

        let config: Config = serde_json::from_str(r#"{"namespace":""}"#).unwrap();
        assert!(config.validate().is_err());
    }
}
