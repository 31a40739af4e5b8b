//! 事件信封（Event）与编解码
//!
//! 负载以 `bitcode` 二进制编码后放入消息的单一字段 `event`。
//! 后端可能以文本或原始字节返回该字段，解码时两者都接受。
//!
use crate::error::{EventsError, EventsResult};
use chrono::{DateTime, Utc};
use relay_stream::{FieldValue, Values};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// 承载事件的消息字段名
pub const EVENT_FIELD: &str = "event";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    /// 发送时为空，接收时由消息 ID 填充
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub payload: T,
}

impl<T> Event<T> {
    pub fn new(payload: T) -> Self {
        Self {
            id: String::new(),
            timestamp: Utc::now(),
            payload,
        }
    }
}

impl<T: Serialize> Event<T> {
    pub fn encode(&self) -> EventsResult<Vec<u8>> {
        bitcode::serialize(self).map_err(|err| EventsError::Encode {
            reason: err.to_string(),
        })
    }

    /// 编码为可直接发送的消息字段
    pub(crate) fn into_values(self) -> EventsResult<Values> {
        let bytes = self.encode()?;
        Ok(Values::from([(
            EVENT_FIELD.to_string(),
            FieldValue::Bytes(bytes),
        )]))
    }
}

impl<T: DeserializeOwned> Event<T> {
    pub fn decode(bytes: &[u8]) -> EventsResult<Self> {
        bitcode::deserialize(bytes).map_err(|err| EventsError::Decode {
            reason: err.to_string(),
        })
    }

    /// 从消息字段中取出并解码事件
    pub(crate) fn from_values(values: &Values) -> EventsResult<Self> {
        let field = values.get(EVENT_FIELD).ok_or_else(|| EventsError::Decode {
            reason: format!("message is missing the '{EVENT_FIELD}' field"),
        })?;

        Self::decode(field.as_bytes())
    }
}
