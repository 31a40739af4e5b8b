//! 事件读取端（Reader）
//!
//! 处理函数收到的是已解码的 `Event<T>`；返回 `HandlerError::Discard` 时
//! 事件被确认且不再重试，其余错误保持未确认等待回收。
//!
use crate::error::{EventsError, EventsResult, HandlerError, HandlerResult};
use crate::event::Event;
use crate::reporter::stream_id;
use relay_stream::{Consumer, ConsumerOption, HandlerOption, StreamMessage, handler};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tracing::Instrument;

/// 可以由 `ReaderFactory` 启动的读取端
///
/// 自定义读取端包装 `GenericReader`，在 `setup` 中注册自己的事件处理函数。
pub trait Reader: Send + Sized + 'static {
    fn from_generic(reader: GenericReader) -> Self;
    fn into_generic(self) -> GenericReader;
}

pub struct GenericReader {
    consumer: Box<dyn Consumer>,
    category: String,
}

impl Reader for GenericReader {
    fn from_generic(reader: GenericReader) -> Self {
        reader
    }

    fn into_generic(self) -> GenericReader {
        self
    }
}

impl GenericReader {
    pub(crate) fn new(consumer: Box<dyn Consumer>, category: impl Into<String>) -> Self {
        Self {
            consumer,
            category: category.into(),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// 配置底层消费者；启动后调用无效
    pub fn configure(&mut self, opts: &[ConsumerOption]) {
        self.consumer.configure(opts);
    }

    /// 注册某一事件类型的处理函数
    pub fn register_event<T, F, Fut>(
        &mut self,
        event_type: &str,
        handler_fn: F,
        opts: &[HandlerOption],
    ) -> EventsResult<()>
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        if event_type.is_empty() {
            return Err(EventsError::invalid_argument("event type can't be empty"));
        }

        let handler_fn = Arc::new(handler_fn);
        let raw = handler(move |message: StreamMessage| {
            let handler_fn = handler_fn.clone();
            async move { handle_message(handler_fn.as_ref(), message).await }
        });

        self.consumer
            .register(&stream_id(&self.category, event_type), raw, opts)?;
        Ok(())
    }

    pub(crate) fn into_consumer(self) -> Box<dyn Consumer> {
        self.consumer
    }
}

async fn handle_message<T, F, Fut>(handler_fn: &F, message: StreamMessage) -> anyhow::Result<()>
where
    T: DeserializeOwned,
    F: Fn(Event<T>) -> Fut,
    Fut: Future<Output = HandlerResult>,
{
    let mut event = Event::<T>::from_values(&message.values)?;
    event.id = message.id;

    let span = tracing::info_span!(
        "event",
        event_id = %event.id,
        stream_id = %message.stream_id,
        event_timestamp = %event.timestamp,
    );

    match handler_fn(event).instrument(span.clone()).await {
        Ok(()) => Ok(()),
        Err(HandlerError::Discard(err)) => {
            span.in_scope(|| {
                tracing::warn!(error = %format!("{err:#}"), "discarding event");
            });
            Ok(())
        }
        Err(HandlerError::Retry(err)) => Err(err),
    }
}
