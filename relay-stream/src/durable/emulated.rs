//! 进程内的消费组语义仿真
//!
//! 复现持久化后端的关键行为：待确认列表（PEL）、投递计数、空闲时钟、
//! 历史回放与新消息读取、追加唤醒阻塞读取、长度裁剪以及缺失消费组时的 `NOGROUP`。
//! 时间基于 `tokio::time`，因此可以在暂停时钟的测试中快进。
//!
use super::backend::{
    CURSOR_NEW, ClaimOutcome, ConsumerInfo, MaxLen, PendingEntry, RANGE_MAX, RANGE_MIN,
    StreamBackend, StreamBatch, StreamCursor,
};
use crate::error::{StreamError, StreamResult};
use crate::message::{StreamMessage, Values};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct EntryId(u64, u64);

impl EntryId {
    const MIN: EntryId = EntryId(0, 0);
    const MAX: EntryId = EntryId(u64::MAX, u64::MAX);

    fn parse(raw: &str) -> StreamResult<Self> {
        match raw {
            RANGE_MIN => return Ok(Self::MIN),
            RANGE_MAX => return Ok(Self::MAX),
            _ => {}
        }

        let (ms, seq) = raw.split_once('-').unwrap_or((raw, "0"));
        let parse = |s: &str| {
            s.parse::<u64>()
                .map_err(|_| StreamError::backend(format!("invalid stream ID specified: '{raw}'")))
        };
        Ok(Self(parse(ms)?, parse(seq)?))
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.0, self.1)
    }
}

struct PendingState {
    consumer: String,
    delivered_at: Instant,
    delivery_count: u64,
}

struct Group {
    last_delivered: EntryId,
    pel: BTreeMap<EntryId, PendingState>,
    /// 消费者名 -> 最近一次交互时间
    consumers: HashMap<String, Instant>,
}

impl Group {
    fn touch(&mut self, consumer: &str, now: Instant) {
        self.consumers.insert(consumer.to_string(), now);
    }
}

#[derive(Default)]
struct Stream {
    last_id: u64,
    entries: BTreeMap<EntryId, Values>,
    groups: HashMap<String, Group>,
}

impl Stream {
    fn message(&self, key: &str, id: EntryId) -> StreamMessage {
        StreamMessage {
            stream_id: key.to_string(),
            id: id.to_string(),
            // 已被裁剪的条目只剩 ID，字段为空
            values: self.entries.get(&id).cloned().unwrap_or_default(),
        }
    }
}

/// 进程内仿真后端
#[derive(Default)]
pub struct EmulatedBackend {
    streams: Mutex<HashMap<String, Stream>>,
    appended: Notify,
    unavailable: AtomicBool,
}

fn no_group(key: &str, group: &str) -> StreamError {
    StreamError::NoGroup {
        reason: format!("NOGROUP No such key '{key}' or consumer group '{group}'"),
    }
}

impl EmulatedBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// 模拟后端不可用：之后的所有命令都返回后端错误
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    /// 删除消费组（用于验证读取任务的自愈）
    pub fn destroy_group(&self, key: &str, group: &str) -> bool {
        self.lock()
            .get_mut(key)
            .map(|s| s.groups.remove(group).is_some())
            .unwrap_or(false)
    }

    /// 消费组中待确认条目的数量
    pub fn pending_count(&self, key: &str, group: &str) -> usize {
        self.lock()
            .get(key)
            .and_then(|s| s.groups.get(group))
            .map(|g| g.pel.len())
            .unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Stream>> {
        // 锁内没有可能 panic 的用户代码，中毒时直接沿用内部数据
        self.streams.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> StreamResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StreamError::backend("connection refused"));
        }
        Ok(())
    }

    /// 单次非阻塞组读取；返回 `None` 表示没有任何新消息可读
    fn try_read(
        streams: &mut HashMap<String, Stream>,
        group: &str,
        consumer: &str,
        cursors: &[StreamCursor],
        count: usize,
    ) -> StreamResult<Option<Vec<StreamBatch>>> {
        let now = Instant::now();
        let mut batches = Vec::new();
        let mut history = false;

        for cursor in cursors {
            let stream = streams
                .get_mut(&cursor.key)
                .ok_or_else(|| no_group(&cursor.key, group))?;
            let Stream {
                entries, groups, ..
            } = &mut *stream;
            let g = groups
                .get_mut(group)
                .ok_or_else(|| no_group(&cursor.key, group))?;
            g.touch(consumer, now);

            let mut ids = Vec::new();
            let is_history = cursor.cursor != CURSOR_NEW;
            if !is_history {
                let fresh: Vec<EntryId> = entries
                    .range((
                        std::ops::Bound::Excluded(g.last_delivered),
                        std::ops::Bound::Unbounded,
                    ))
                    .take(count)
                    .map(|(id, _)| *id)
                    .collect();
                for id in fresh {
                    g.last_delivered = id;
                    g.pel.insert(
                        id,
                        PendingState {
                            consumer: consumer.to_string(),
                            delivered_at: now,
                            delivery_count: 1,
                        },
                    );
                    ids.push(id);
                }
            } else {
                history = true;
                let start = EntryId::parse(&cursor.cursor)?;
                for (id, state) in g
                    .pel
                    .range_mut((std::ops::Bound::Excluded(start), std::ops::Bound::Unbounded))
                    .filter(|(_, s)| s.consumer == consumer)
                    .take(count)
                {
                    state.delivered_at = now;
                    state.delivery_count += 1;
                    ids.push(*id);
                }
            }

            if ids.is_empty() && !is_history {
                continue;
            }

            let messages = ids.into_iter().map(|id| stream.message(&cursor.key, id)).collect();
            batches.push(StreamBatch {
                key: cursor.key.clone(),
                messages,
            });
        }

        let has_messages = batches.iter().any(|b| !b.messages.is_empty());
        if has_messages || history {
            Ok(Some(batches))
        } else {
            Ok(None)
        }
    }
}

#[async_trait]
impl StreamBackend for EmulatedBackend {
    async fn ping(&self) -> StreamResult<()> {
        self.check_available()
    }

    async fn append(
        &self,
        key: &str,
        values: &Values,
        max_len: Option<MaxLen>,
    ) -> StreamResult<String> {
        self.check_available()?;

        let id = {
            let mut streams = self.lock();
            let stream = streams.entry(key.to_string()).or_default();
            stream.last_id += 1;
            let id = EntryId(stream.last_id, 0);
            stream.entries.insert(id, values.clone());

            if let Some(max_len) = max_len {
                while stream.entries.len() > max_len.len {
                    stream.entries.pop_first();
                }
            }
            id
        };

        self.appended.notify_waiters();
        Ok(id.to_string())
    }

    async fn create_group(&self, key: &str, group: &str) -> StreamResult<()> {
        self.check_available()?;

        let mut streams = self.lock();
        let stream = streams.entry(key.to_string()).or_default();
        let last = EntryId(stream.last_id, 0);
        stream.groups.entry(group.to_string()).or_insert_with(|| Group {
            last_delivered: last,
            pel: BTreeMap::new(),
            consumers: HashMap::new(),
        });
        Ok(())
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursors: &[StreamCursor],
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamBatch>> {
        let deadline = Instant::now() + block;

        loop {
            self.check_available()?;

            let notified = self.appended.notified();
            tokio::pin!(notified);
            // 先登记等待再检查数据，避免错过读取与等待之间的追加
            notified.as_mut().enable();

            let read = Self::try_read(&mut self.lock(), group, consumer, cursors, count)?;
            if let Some(batches) = read {
                return Ok(batches);
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(Vec::new());
            }
        }
    }

    async fn pending(
        &self,
        key: &str,
        group: &str,
        min_idle: Duration,
        start: &str,
        end: &str,
        count: usize,
    ) -> StreamResult<Vec<PendingEntry>> {
        self.check_available()?;

        let (start, end) = (EntryId::parse(start)?, EntryId::parse(end)?);
        if start > end {
            return Ok(Vec::new());
        }
        let now = Instant::now();
        let streams = self.lock();
        let g = streams
            .get(key)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(key, group))?;

        Ok(g.pel
            .range(start..=end)
            .map(|(id, s)| PendingEntry {
                id: id.to_string(),
                consumer: s.consumer.clone(),
                idle: now.saturating_duration_since(s.delivered_at),
                delivery_count: s.delivery_count,
            })
            .filter(|p| p.idle >= min_idle)
            .take(count)
            .collect())
    }

    async fn claim(
        &self,
        key: &str,
        group: &str,
        consumer: &str,
        min_idle: Duration,
        id: &str,
    ) -> StreamResult<ClaimOutcome> {
        self.check_available()?;

        let id = EntryId::parse(id)?;
        let now = Instant::now();
        let mut streams = self.lock();
        let stream = streams.get_mut(key).ok_or_else(|| no_group(key, group))?;
        let exists = stream.entries.contains_key(&id);
        let g = stream
            .groups
            .get_mut(group)
            .ok_or_else(|| no_group(key, group))?;
        g.touch(consumer, now);

        let Some(state) = g.pel.get_mut(&id) else {
            return Ok(ClaimOutcome::Skipped);
        };
        if now.saturating_duration_since(state.delivered_at) < min_idle {
            return Ok(ClaimOutcome::Skipped);
        }
        if !exists {
            // 条目已不在流中：从待确认列表移除，与服务端行为一致
            g.pel.remove(&id);
            return Ok(ClaimOutcome::Evicted);
        }

        state.consumer = consumer.to_string();
        state.delivered_at = now;
        state.delivery_count += 1;

        Ok(ClaimOutcome::Claimed(stream.message(key, id)))
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> StreamResult<()> {
        self.check_available()?;

        let id = EntryId::parse(id)?;
        if let Some(g) = self
            .lock()
            .get_mut(key)
            .and_then(|s| s.groups.get_mut(group))
        {
            g.pel.remove(&id);
        }
        Ok(())
    }

    async fn consumers(&self, key: &str, group: &str) -> StreamResult<Vec<ConsumerInfo>> {
        self.check_available()?;

        let now = Instant::now();
        let streams = self.lock();
        let g = streams
            .get(key)
            .and_then(|s| s.groups.get(group))
            .ok_or_else(|| no_group(key, group))?;

        Ok(g.consumers
            .iter()
            .map(|(name, seen)| ConsumerInfo {
                name: name.clone(),
                pending: g.pel.values().filter(|s| &s.consumer == name).count() as u64,
                idle: now.saturating_duration_since(*seen),
            })
            .collect())
    }

    async fn delete_consumer(&self, key: &str, group: &str, consumer: &str) -> StreamResult<()> {
        self.check_available()?;

        let mut streams = self.lock();
        let g = streams
            .get_mut(key)
            .and_then(|s| s.groups.get_mut(group))
            .ok_or_else(|| no_group(key, group))?;
        g.consumers.remove(consumer);
        g.pel.retain(|_, s| s.consumer != consumer);
        Ok(())
    }

    async fn len(&self, key: &str) -> StreamResult<usize> {
        self.check_available()?;
        Ok(self.lock().get(key).map(|s| s.entries.len()).unwrap_or_default())
    }
}
