use super::backend::{MaxLen, StreamBackend};
use crate::broker::Producer;
use crate::error::StreamResult;
use crate::message::{Values, transpose_stream_id};
use async_trait::async_trait;
use bon::Builder;
use std::sync::Arc;

/// 持久化生产者：按长度上限追加到带命名空间的流
#[derive(Builder)]
pub struct DurableProducer {
    backend: Arc<dyn StreamBackend>,
    #[builder(into, default)]
    namespace: String,
    max_stream_length: usize,
    /// 近似裁剪，写入吞吐更高
    #[builder(default)]
    approximate: bool,
}

#[async_trait]
impl Producer for DurableProducer {
    async fn send(&self, stream_id: &str, values: Values) -> StreamResult<String> {
        let key = transpose_stream_id(&self.namespace, stream_id);
        let max_len = MaxLen {
            len: self.max_stream_length,
            approximate: self.approximate,
        };

        self.backend
            .append(&key, &values, Some(max_len))
            .await
            .map_err(|err| {
                err.context(format_args!(
                    "failed to write to stream '{stream_id}' (key '{key}')"
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::durable::EmulatedBackend;
    use crate::error::StreamError;

    #[tokio::test]
    async fn append_failure_names_the_stream() {
        let backend = Arc::new(EmulatedBackend::new());
        backend.set_available(false);
        let producer = DurableProducer::builder()
            .backend(backend as Arc<dyn StreamBackend>)
            .namespace("ns")
            .max_stream_length(10)
            .build();

        let err = producer.send("orders", Values::new()).await.unwrap_err();
        assert!(matches!(&err, StreamError::Backend { reason } if reason.contains("'orders' (key 'ns:orders')")));
    }
}
