//! 流存储后端协议
//!
//! 以消费组语义描述持久化流的最小命令集：追加、组读取、待确认查询、
//! 所有权转移、确认与组成员维护。
//!
use crate::error::StreamResult;
use crate::message::{StreamMessage, Values};
use async_trait::async_trait;
use std::time::Duration;

/// 组读取游标：回放本消费者历史时从该 ID 之后开始
pub const CURSOR_HISTORY_START: &str = "0";
/// 组读取游标：只读取从未投递过的新消息
pub const CURSOR_NEW: &str = ">";
/// 待确认范围查询的下界
pub const RANGE_MIN: &str = "-";
/// 待确认范围查询的上界
pub const RANGE_MAX: &str = "+";

/// 追加时的长度上限
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MaxLen {
    pub len: usize,
    /// 允许近似裁剪以提升写入吞吐
    pub approximate: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StreamCursor {
    pub key: String,
    pub cursor: String,
}

impl StreamCursor {
    pub fn new(key: impl Into<String>, cursor: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            cursor: cursor.into(),
        }
    }
}

/// 一次组读取中单个流返回的消息
#[derive(Clone, Debug, Default)]
pub struct StreamBatch {
    pub key: String,
    pub messages: Vec<StreamMessage>,
}

/// 已投递未确认的条目
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PendingEntry {
    pub id: String,
    pub consumer: String,
    pub idle: Duration,
    /// 投递次数，每次认领后加一
    pub delivery_count: u64,
}

/// 认领结果
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    Claimed(StreamMessage),
    /// 消息已被长度上限裁剪出流，无法再处理
    Evicted,
    /// 未满足最小空闲时间或已被他人认领
    Skipped,
}

/// 消费组成员信息
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConsumerInfo {
    pub name: String,
    pub pending: u64,
    pub idle: Duration,
}

#[async_trait]
pub trait StreamBackend: Send + Sync {
    async fn ping(&self) -> StreamResult<()>;

    /// 追加消息，返回后端分配的消息 ID
    async fn append(&self, key: &str, values: &Values, max_len: Option<MaxLen>)
    -> StreamResult<String>;

    /// 创建消费组（流不存在时一并创建），组已存在视为成功；新组只接收此后追加的消息
    async fn create_group(&self, key: &str, group: &str) -> StreamResult<()>;

    /// 组读取：历史游标返回所有被查询流（可能为空），`>` 游标仅返回有新消息的流
    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursors: &[StreamCursor],
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamBatch>>;

    /// 查询空闲时间不少于 `min_idle` 的待确认条目
    async fn pending(
        &self,
        key: &str,
        group: &str,
        min_idle: Duration,
        start: &str,
        end: &str,
        count: usize,
    ) -> StreamResult<Vec<PendingEntry>>;

    /// 将待确认条目转移给 `consumer`
    async fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: &str,
    ) -> StreamResult<ClaimOutcome>;

    async fn ack(&self, key: &str, group: &str, id: &str) -> StreamResult<()>;

    async fn consumers(&self, key: &str, group: &str) -> StreamResult<Vec<ConsumerInfo>>;

    async fn delete_consumer(&self, key: &str, group: &str, consumer: &str) -> StreamResult<()>;

    /// 流中当前保留的消息数
    async fn len(&self, key: &str) -> StreamResult<usize>;
}
