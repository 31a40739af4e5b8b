//! 流消息模型
//!
//! 后端可能以文本或原始字节两种形式返回字段值，`FieldValue` 同时覆盖两者。
//!
use std::collections::HashMap;

/// 单个字段的值
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldValue {
    Text(String),
    Bytes(Vec<u8>),
}

impl FieldValue {
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            FieldValue::Text(s) => s.as_bytes(),
            FieldValue::Bytes(b) => b,
        }
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        FieldValue::Text(value)
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        FieldValue::Text(value.to_string())
    }
}

impl From<Vec<u8>> for FieldValue {
    fn from(value: Vec<u8>) -> Self {
        FieldValue::Bytes(value)
    }
}

/// 字段名 -> 字段值
pub type Values = HashMap<String, FieldValue>;

/// 从流中读取到的一条消息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamMessage {
    /// 后端中的流键（已带命名空间前缀）
    pub stream_id: String,
    /// 后端分配的消息 ID，流内单调递增、不复用
    pub id: String,
    pub values: Values,
}

/// 将逻辑流 ID 转换为带命名空间的后端键
pub fn transpose_stream_id(namespace: &str, stream_id: &str) -> String {
    if namespace.is_empty() {
        return stream_id.to_string();
    }

    format!("{namespace}:{stream_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transpose_prefixes_namespace() {
        assert_eq!(
            transpose_stream_id("gitness", "pullreq:created"),
            "gitness:pullreq:created"
        );
        assert_eq!(transpose_stream_id("", "orders"), "orders");
    }

    #[test]
    fn text_and_bytes_expose_same_bytes() {
        let text = FieldValue::from("abc");
        let bytes = FieldValue::from(b"abc".to_vec());
        assert_eq!(text.as_bytes(), bytes.as_bytes());
    }
}
