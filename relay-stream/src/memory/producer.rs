use super::MemoryBroker;
use crate::broker::Producer;
use crate::error::StreamResult;
use crate::message::{Values, transpose_stream_id};
use async_trait::async_trait;

/// 进程内生产者
#[derive(Clone)]
pub struct MemoryProducer {
    broker: MemoryBroker,
    namespace: String,
}

impl MemoryProducer {
    pub fn new(broker: MemoryBroker, namespace: impl Into<String>) -> Self {
        Self {
            broker,
            namespace: namespace.into(),
        }
    }
}

#[async_trait]
impl Producer for MemoryProducer {
    async fn send(&self, stream_id: &str, values: Values) -> StreamResult<String> {
        let key = transpose_stream_id(&self.namespace, stream_id);
        self.broker.enqueue(&key, values)
    }
}
