//! 事件发送端（Reporter）
//!
use crate::error::{EventsError, EventsResult};
use crate::event::Event;
use relay_stream::Producer;
use serde::Serialize;
use std::sync::Arc;

/// 某一类别下的事件发送端，可发送任意负载类型
#[derive(Clone)]
pub struct GenericReporter {
    producer: Arc<dyn Producer>,
    category: String,
}

impl GenericReporter {
    pub(crate) fn new(producer: Arc<dyn Producer>, category: impl Into<String>) -> Self {
        Self {
            producer,
            category: category.into(),
        }
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    /// 发送一条事件，返回后端分配的消息 ID
    pub async fn send_event<T>(&self, event_type: &str, payload: &T) -> EventsResult<String>
    where
        T: Serialize + Sync,
    {
        if event_type.is_empty() {
            return Err(EventsError::invalid_argument("event type can't be empty"));
        }

        let values = Event::new(payload).into_values()?;
        let stream_id = stream_id(&self.category, event_type);
        let id = self.producer.send(&stream_id, values).await?;

        tracing::debug!(stream_id = %stream_id, message_id = %id, "event sent");
        Ok(id)
    }
}

/// 逻辑流 ID：`<category>:<event_type>`
pub(crate) fn stream_id(category: &str, event_type: &str) -> String {
    format!("{category}:{event_type}")
}
