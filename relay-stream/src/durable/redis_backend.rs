//! Redis Streams 后端
//!
//! 组读取使用独立连接：阻塞中的 `XREADGROUP` 不会拖住共享多路复用连接上的确认命令。
//! 每个 (group, consumer) 各有一条读取连接，同一进程内的多个消费者可以同时阻塞等待。
//!
use super::backend::{
    ClaimOutcome, ConsumerInfo, MaxLen, PendingEntry, StreamBackend, StreamBatch, StreamCursor,
};
use crate::error::{StreamError, StreamResult};
use crate::message::{FieldValue, StreamMessage, Values};
use async_trait::async_trait;
use dashmap::DashMap;
use redis::aio::{ConnectionManager, MultiplexedConnection};
use redis::streams::StreamInfoConsumersReply;
use redis::{Client, RedisError, Value, cmd, from_redis_value};
use std::future::Future;
use std::time::Duration;

impl From<RedisError> for StreamError {
    fn from(err: RedisError) -> Self {
        match err.code() {
            Some("NOGROUP") => StreamError::NoGroup {
                reason: err.to_string(),
            },
            _ if err.is_timeout() => StreamError::Timeout {
                reason: err.to_string(),
            },
            _ => StreamError::Backend {
                reason: err.to_string(),
            },
        }
    }
}

/// 按 (group, consumer) 分配的读取连接
///
/// 建立连接与读取期间都不持有锁。
struct ReadConnections<C> {
    slots: DashMap<(String, String), C>,
}

impl<C: Clone> ReadConnections<C> {
    fn new() -> Self {
        Self {
            slots: DashMap::new(),
        }
    }

    async fn get_or_connect<F, Fut>(&self, group: &str, consumer: &str, connect: F) -> StreamResult<C>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = StreamResult<C>>,
    {
        let slot = (group.to_string(), consumer.to_string());
        if let Some(conn) = self.slots.get(&slot) {
            return Ok(conn.value().clone());
        }

        let conn = connect().await?;
        Ok(self.slots.entry(slot).or_insert(conn).value().clone())
    }

    /// 连接断开后丢弃，下次读取时重建
    fn reset(&self, group: &str, consumer: &str) {
        self.slots.remove(&(group.to_string(), consumer.to_string()));
    }
}

pub struct RedisBackend {
    client: Client,
    conn: ConnectionManager,
    readers: ReadConnections<MultiplexedConnection>,
}

impl RedisBackend {
    pub async fn connect(client: Client) -> StreamResult<Self> {
        let conn = ConnectionManager::new(client.clone()).await?;

        Ok(Self {
            client,
            conn,
            readers: ReadConnections::new(),
        })
    }

    pub async fn open(url: &str) -> StreamResult<Self> {
        Self::connect(Client::open(url)?).await
    }
}

fn field_value(value: &Value) -> Option<FieldValue> {
    match value {
        Value::BulkString(bytes) => Some(FieldValue::Bytes(bytes.clone())),
        Value::SimpleString(text) => Some(FieldValue::Text(text.clone())),
        Value::Nil => None,
        other => from_redis_value::<String>(other).ok().map(FieldValue::Text),
    }
}

fn field_pairs(value: &Value) -> StreamResult<Values> {
    let mut values = Values::new();
    match value {
        // 已被裁剪的历史条目只返回 ID
        Value::Nil => {}
        Value::Array(items) => {
            for pair in items.chunks(2) {
                if let [k, v] = pair {
                    let key: String = from_redis_value(k)?;
                    if let Some(v) = field_value(v) {
                        values.insert(key, v);
                    }
                }
            }
        }
        Value::Map(pairs) => {
            for (k, v) in pairs {
                let key: String = from_redis_value(k)?;
                if let Some(v) = field_value(v) {
                    values.insert(key, v);
                }
            }
        }
        other => {
            return Err(StreamError::backend(format!(
                "unexpected stream entry fields: {other:?}"
            )));
        }
    }
    Ok(values)
}

/// 解析 `[id, [field, value, ...]]`；条目本身为空时返回 `None`
fn stream_entry(key: &str, value: &Value) -> StreamResult<Option<StreamMessage>> {
    match value {
        Value::Nil => Ok(None),
        Value::Array(parts) => match parts.as_slice() {
            [id, fields] => Ok(Some(StreamMessage {
                stream_id: key.to_string(),
                id: from_redis_value(id)?,
                values: field_pairs(fields)?,
            })),
            _ => Err(StreamError::backend(format!(
                "unexpected stream entry: {value:?}"
            ))),
        },
        other => Err(StreamError::backend(format!(
            "unexpected stream entry: {other:?}"
        ))),
    }
}

fn stream_entries(key: &str, value: &Value) -> StreamResult<Vec<StreamMessage>> {
    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Array(items) => Ok(items
            .iter()
            .map(|item| stream_entry(key, item))
            .collect::<StreamResult<Vec<_>>>()?
            .into_iter()
            .flatten()
            .collect()),
        other => Err(StreamError::backend(format!(
            "unexpected stream entries: {other:?}"
        ))),
    }
}

fn read_reply(value: &Value) -> StreamResult<Vec<StreamBatch>> {
    let batch = |key: &Value, entries: &Value| -> StreamResult<StreamBatch> {
        let key: String = from_redis_value(key)?;
        let messages = stream_entries(&key, entries)?;
        Ok(StreamBatch { key, messages })
    };

    match value {
        Value::Nil => Ok(Vec::new()),
        Value::Array(streams) => streams
            .iter()
            .map(|s| match s {
                Value::Array(parts) if parts.len() == 2 => batch(&parts[0], &parts[1]),
                other => Err(StreamError::backend(format!(
                    "unexpected read reply: {other:?}"
                ))),
            })
            .collect(),
        Value::Map(pairs) => pairs.iter().map(|(k, v)| batch(k, v)).collect(),
        other => Err(StreamError::backend(format!(
            "unexpected read reply: {other:?}"
        ))),
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[async_trait]
impl StreamBackend for RedisBackend {
    async fn ping(&self) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        let _: String = cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }

    async fn append(
        &self,
        key: &str,
        values: &Values,
        max_len: Option<MaxLen>,
    ) -> StreamResult<String> {
        let mut xadd = cmd("XADD");
        xadd.arg(key);
        if let Some(max_len) = max_len {
            let op = if max_len.approximate { "~" } else { "=" };
            xadd.arg("MAXLEN").arg(op).arg(max_len.len);
        }
        xadd.arg("*");
        for (field, value) in values {
            xadd.arg(field).arg(value.as_bytes());
        }

        let mut conn = self.conn.clone();
        let id: String = xadd.query_async(&mut conn).await?;
        Ok(id)
    }

    async fn create_group(&self, key: &str, group: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        let created: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(key)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match created {
            Ok(()) => Ok(()),
            Err(err) if err.code() == Some("BUSYGROUP") => Ok(()),
            Err(err) => Err(StreamError::backend(format!(
                "failed to create consumer group '{group}' for stream '{key}': {err}"
            ))),
        }
    }

    async fn read_group(
        &self,
        group: &str,
        consumer: &str,
        cursors: &[StreamCursor],
        count: usize,
        block: Duration,
    ) -> StreamResult<Vec<StreamBatch>> {
        let mut xread = cmd("XREADGROUP");
        xread
            .arg("GROUP")
            .arg(group)
            .arg(consumer)
            .arg("COUNT")
            .arg(count)
            .arg("BLOCK")
            .arg(millis(block))
            .arg("STREAMS");
        for c in cursors {
            xread.arg(&c.key);
        }
        for c in cursors {
            xread.arg(&c.cursor);
        }

        let mut conn = self
            .readers
            .get_or_connect(group, consumer, || async {
                Ok::<_, StreamError>(self.client.get_multiplexed_async_connection().await?)
            })
            .await?;

        let reply: Result<Value, RedisError> = xread.query_async(&mut conn).await;
        match reply {
            Ok(value) => read_reply(&value),
            Err(err) => {
                if err.is_io_error() || err.is_connection_dropped() {
                    self.readers.reset(group, consumer);
                }
                Err(err.into())
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
        let mut conn = self.conn.clone();
        let rows: Vec<(String, String, u64, u64)> = cmd("XPENDING")
            .arg(key)
            .arg(group)
            .arg("IDLE")
            .arg(millis(min_idle))
            .arg(start)
            .arg(end)
            .arg(count)
            .query_async(&mut conn)
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, consumer, idle, delivery_count)| PendingEntry {
                id,
                consumer,
                idle: Duration::from_millis(idle),
                delivery_count,
            })
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
        let mut conn = self.conn.clone();
        let reply: Value = cmd("XCLAIM")
            .arg(key)
            .arg(group)
            .arg(consumer)
            .arg(millis(min_idle))
            .arg(id)
            .query_async(&mut conn)
            .await?;

        if let Value::Array(items) = &reply {
            match items.first() {
                Some(Value::Nil) => return Ok(ClaimOutcome::Evicted),
                Some(item) => {
                    return Ok(match stream_entry(key, item)? {
                        Some(message) => ClaimOutcome::Claimed(message),
                        None => ClaimOutcome::Evicted,
                    });
                }
                None => {}
            }
        }

        // 空回复既可能是条目已被裁剪（服务端会顺带清理待确认列表），也可能是未满足空闲时间
        let range: Value = cmd("XRANGE")
            .arg(key)
            .arg(id)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        if stream_entries(key, &range)?.is_empty() {
            Ok(ClaimOutcome::Evicted)
        } else {
            Ok(ClaimOutcome::Skipped)
        }
    }

    async fn ack(&self, key: &str, group: &str, id: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = cmd("XACK")
            .arg(key)
            .arg(group)
            .arg(id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn consumers(&self, key: &str, group: &str) -> StreamResult<Vec<ConsumerInfo>> {
        let mut conn = self.conn.clone();
        let reply: StreamInfoConsumersReply = cmd("XINFO")
            .arg("CONSUMERS")
            .arg(key)
            .arg(group)
            .query_async(&mut conn)
            .await?;

        Ok(reply
            .consumers
            .into_iter()
            .map(|c| ConsumerInfo {
                name: c.name,
                pending: c.pending as u64,
                idle: Duration::from_millis(c.idle as u64),
            })
            .collect())
    }

    async fn delete_consumer(&self, key: &str, group: &str, consumer: &str) -> StreamResult<()> {
        let mut conn = self.conn.clone();
        let _: i64 = cmd("XGROUP")
            .arg("DELCONSUMER")
            .arg(key)
            .arg(group)
            .arg(consumer)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn len(&self, key: &str) -> StreamResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = cmd("XLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::oneshot;

    fn bulk(s: &str) -> Value {
        Value::BulkString(s.as_bytes().to_vec())
    }

    #[test]
    fn parses_read_reply_with_trimmed_history_entry() -> StreamResult<()> {
        let reply = Value::Array(vec![Value::Array(vec![
            bulk("ns:orders"),
            Value::Array(vec![
                Value::Array(vec![
                    bulk("1-0"),
                    Value::Array(vec![bulk("event"), bulk("payload")]),
                ]),
                Value::Array(vec![bulk("2-0"), Value::Nil]),
            ]),
        ])]);

        let batches = read_reply(&reply)?;
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].key, "ns:orders");
        assert_eq!(batches[0].messages.len(), 2);
        assert_eq!(
            batches[0].messages[0].values.get("event"),
            Some(&FieldValue::Bytes(b"payload".to_vec()))
        );
        assert!(batches[0].messages[1].values.is_empty());
        Ok(())
    }

    #[test]
    fn nil_read_reply_is_empty() -> StreamResult<()> {
        assert!(read_reply(&Value::Nil)?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn each_consumer_gets_its_own_read_connection() -> StreamResult<()> {
        let readers = ReadConnections::<usize>::new();
        let counter = AtomicUsize::new(0);
        let opened = &counter;
        let open = move || async move {
            Ok::<_, StreamError>(opened.fetch_add(1, Ordering::SeqCst))
        };

        let a = readers.get_or_connect("g", "a", open).await?;
        let b = readers.get_or_connect("g", "b", open).await?;
        let other_group = readers.get_or_connect("h", "a", open).await?;
        assert_ne!(a, b);
        assert_ne!(a, other_group);
        assert_eq!(readers.get_or_connect("g", "a", open).await?, a);
        assert_eq!(counter.load(Ordering::SeqCst), 3);

        readers.reset("g", "a");
        assert_ne!(readers.get_or_connect("g", "a", open).await?, a);
        Ok(())
    }

    #[tokio::test]
    async fn slow_connect_does_not_block_other_consumers() -> StreamResult<()> {
        let readers = Arc::new(ReadConnections::<usize>::new());
        let (release, released) = oneshot::channel::<()>();

        let slow = {
            let readers = readers.clone();
            tokio::spawn(async move {
                readers
                    .get_or_connect("g", "a", || async move {
                        let _ = released.await;
                        Ok::<_, StreamError>(1)
                    })
                    .await
            })
        };
        tokio::task::yield_now().await;

        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            readers.get_or_connect("g", "b", || async { Ok::<_, StreamError>(2) }),
        )
        .await;
        assert!(matches!(fast, Ok(Ok(2))));
        assert!(!slow.is_finished());

        let _ = release.send(());
        assert!(matches!(slow.await, Ok(Ok(1))));
        Ok(())
    }

    #[test]
    fn simple_string_fields_are_text() {
        assert_eq!(
            field_value(&Value::SimpleString("x".into())),
            Some(FieldValue::Text("x".into()))
        );
    }
}
