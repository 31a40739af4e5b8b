use crate::error::{StreamError, StreamResult};
use crate::message::{StreamMessage, Values};
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

pub const DEFAULT_QUEUE_SIZE: usize = 500;

/// 同一消费组内的所有消费者共享一条投递队列
pub(crate) type SharedReceiver = Arc<Mutex<mpsc::Receiver<StreamMessage>>>;

struct GroupQueue {
    tx: mpsc::Sender<StreamMessage>,
    rx: SharedReceiver,
    /// 仍在运行的订阅者数量，归零时移除队列
    subscribers: usize,
}

#[derive(Default)]
struct MemoryStream {
    seq: u64,
    log: VecDeque<StreamMessage>,
    groups: HashMap<String, GroupQueue>,
}

struct BrokerInner {
    streams: DashMap<String, MemoryStream>,
    queue_size: usize,
    max_stream_length: usize,
}

/// 进程内代理，克隆后共享同一份数据
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    /// `queue_size` 为每个消费组的投递队列容量，`max_stream_length` 为每个流保留的消息数
    pub fn new(queue_size: usize, max_stream_length: usize) -> StreamResult<Self> {
        if queue_size == 0 {
            return Err(StreamError::invalid_argument("queue size must be positive"));
        }
        if max_stream_length == 0 {
            return Err(StreamError::invalid_argument(
                "max stream length must be positive",
            ));
        }

        Ok(Self {
            inner: Arc::new(BrokerInner {
                streams: DashMap::new(),
                queue_size,
                max_stream_length,
            }),
        })
    }

    /// 追加消息并投递给已订阅的消费组
    ///
    /// 任一消费组队列已满时整体失败，不追加、不阻塞。
    pub(crate) fn enqueue(&self, key: &str, values: Values) -> StreamResult<String> {
        let mut stream = self.inner.streams.entry(key.to_string()).or_default();

        // 持有该流的写锁期间只有接收方能释放容量，先检查后发送是安全的
        if stream.groups.values().any(|g| g.tx.capacity() == 0) {
            return Err(StreamError::QueueFull {
                stream_id: key.to_string(),
            });
        }

        stream.seq += 1;
        let message = StreamMessage {
            stream_id: key.to_string(),
            id: stream.seq.to_string(),
            values,
        };

        stream.log.push_back(message.clone());
        while stream.log.len() > self.inner.max_stream_length {
            stream.log.pop_front();
        }

        for group in stream.groups.values() {
            let _ = group.tx.try_send(message.clone());
        }

        Ok(message.id)
    }

    /// 订阅某个流的消费组队列，仅接收订阅之后追加的消息
    ///
    /// 每次订阅都要对应一次 `unsubscribe`。
    pub(crate) fn subscribe(&self, key: &str, group: &str) -> SharedReceiver {
        let mut stream = self.inner.streams.entry(key.to_string()).or_default();
        let queue_size = self.inner.queue_size;

        let queue = stream.groups.entry(group.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::channel(queue_size);
            GroupQueue {
                tx,
                rx: Arc::new(Mutex::new(rx)),
                subscribers: 0,
            }
        });
        queue.subscribers += 1;
        queue.rx.clone()
    }

    /// 退订；最后一个订阅者离开后移除该组队列，未消费的消息随之丢弃
    pub(crate) fn unsubscribe(&self, key: &str, group: &str) {
        let Some(mut stream) = self.inner.streams.get_mut(key) else {
            return;
        };

        let remove = match stream.groups.get_mut(group) {
            Some(queue) => {
                queue.subscribers = queue.subscribers.saturating_sub(1);
                queue.subscribers == 0
            }
            None => false,
        };

        if remove {
            stream.groups.remove(group);
            tracing::debug!(key, group, "memory group queue removed");
        }
    }

    /// 当前保留在流中的消息数
    pub fn stream_len(&self, key: &str) -> usize {
        self.inner
            .streams
            .get(key)
            .map(|s| s.log.len())
            .unwrap_or_default()
    }

    /// 流中保留的消息 ID（从旧到新）
    pub fn message_ids(&self, key: &str) -> Vec<String> {
        self.inner
            .streams
            .get(key)
            .map(|s| s.log.iter().map(|m| m.id.clone()).collect())
            .unwrap_or_default()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self {
            inner: Arc::new(BrokerInner {
                streams: DashMap::new(),
                queue_size: DEFAULT_QUEUE_SIZE,
                max_stream_length: 10_000,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_is_trimmed_to_capacity() -> StreamResult<()> {
        let broker = MemoryBroker::new(8, 10)?;
        for _ in 0..15 {
            broker.enqueue("orders", Values::new())?;
        }

        assert_eq!(broker.stream_len("orders"), 10);
        assert_eq!(broker.message_ids("orders").first().map(String::as_str), Some("6"));
        Ok(())
    }

    #[test]
    fn full_group_queue_rejects_without_appending() -> StreamResult<()> {
        let broker = MemoryBroker::new(2, 100)?;
        let _rx = broker.subscribe("orders", "g");

        broker.enqueue("orders", Values::new())?;
        broker.enqueue("orders", Values::new())?;
        let err = broker.enqueue("orders", Values::new()).unwrap_err();

        assert!(matches!(err, StreamError::QueueFull { .. }));
        assert_eq!(broker.stream_len("orders"), 2);
        Ok(())
    }

    #[test]
    fn last_unsubscribe_releases_group_queue() -> StreamResult<()> {
        let broker = MemoryBroker::new(2, 100)?;
        let _first = broker.subscribe("orders", "g");
        let _second = broker.subscribe("orders", "g");

        broker.enqueue("orders", Values::new())?;
        broker.enqueue("orders", Values::new())?;

        // 还有一个订阅者，队列保留
        broker.unsubscribe("orders", "g");
        assert!(broker.enqueue("orders", Values::new()).is_err());

        broker.unsubscribe("orders", "g");
        for _ in 0..5 {
            broker.enqueue("orders", Values::new())?;
        }

        // 多余的退订不会影响新订阅
        broker.unsubscribe("orders", "g");
        let _again = broker.subscribe("orders", "g");
        broker.enqueue("orders", Values::new())?;
        Ok(())
    }

    #[tokio::test]
    async fn groups_only_see_messages_after_subscribing() -> StreamResult<()> {
        let broker = MemoryBroker::new(8, 100)?;
        broker.enqueue("orders", Values::new())?;

        let rx = broker.subscribe("orders", "g");
        let id = broker.enqueue("orders", Values::new())?;

        let mut rx = rx.lock().await;
        assert_eq!(rx.recv().await.map(|m| m.id), Some(id));
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn rejects_zero_sizes() {
        assert!(MemoryBroker::new(0, 1).is_err());
        assert!(MemoryBroker::new(1, 0).is_err());
    }
}
