use super::MemoryBroker;
use crate::broker::{
    Consumer, HandlerFn, StreamHandler, check_names, check_registration, invoke_handler,
};
use crate::diagnostics::Diagnostics;
use crate::error::{StreamError, StreamResult};
use crate::message::transpose_stream_id;
use crate::options::{ConsumerConfig, ConsumerOption, HandlerOption};
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 进程内消费者
///
/// 每个已注册的流启动 `concurrency` 个分发任务，同组消费者共享队列。
/// 处理失败仅上报诊断，不会重投。
pub struct MemoryConsumer {
    broker: MemoryBroker,
    namespace: String,
    group: String,
    consumer_name: String,
    config: ConsumerConfig,
    streams: HashMap<String, StreamHandler>,
    started: bool,
    diagnostics: Option<Diagnostics>,
    errors: Option<mpsc::Receiver<StreamError>>,
    infos: Option<mpsc::Receiver<String>>,
}

impl MemoryConsumer {
    pub fn new(
        broker: MemoryBroker,
        namespace: impl Into<String>,
        group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> StreamResult<Self> {
        let group = group.into();
        let consumer_name = consumer_name.into();
        check_names(&group, &consumer_name)?;

        let (diagnostics, receivers) = Diagnostics::new();

        Ok(Self {
            broker,
            namespace: namespace.into(),
            group,
            consumer_name,
            config: ConsumerConfig::default(),
            streams: HashMap::new(),
            started: false,
            diagnostics: Some(diagnostics),
            errors: Some(receivers.errors),
            infos: Some(receivers.infos),
        })
    }

    async fn dispatch(
        token: CancellationToken,
        queue: super::broker::SharedReceiver,
        handler: StreamHandler,
        diagnostics: Diagnostics,
    ) {
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => return,
                m = async { queue.lock().await.recv().await } => m,
            };

            let Some(message) = message else {
                return;
            };

            if let Err(err) = invoke_handler(&handler.handler, message).await {
                diagnostics.push_error(err);
            }
        }
    }
}

#[async_trait]
impl Consumer for MemoryConsumer {
    fn register(
        &mut self,
        stream_id: &str,
        handler: HandlerFn,
        opts: &[HandlerOption],
    ) -> StreamResult<()> {
        check_registration(self.started, stream_id)?;

        let key = transpose_stream_id(&self.namespace, stream_id);
        if self.streams.contains_key(&key) {
            return Err(StreamError::AlreadyRegistered {
                stream_id: stream_id.to_string(),
                key,
            });
        }

        let config = self.config.handler_config(opts);
        self.streams.insert(key, StreamHandler { handler, config });
        Ok(())
    }

    fn configure(&mut self, opts: &[ConsumerOption]) {
        if self.started {
            return;
        }
        self.config.apply(opts);
    }

    async fn start(&mut self, token: CancellationToken) -> StreamResult<JoinHandle<()>> {
        if self.started {
            return Err(StreamError::AlreadyStarted);
        }
        if self.streams.is_empty() {
            return Err(StreamError::NoStreams);
        }
        let Some(diagnostics) = self.diagnostics.take() else {
            return Err(StreamError::AlreadyStarted);
        };

        self.started = true;

        let mut tasks = Vec::with_capacity(self.streams.len() * self.config.concurrency);
        let mut keys = Vec::with_capacity(self.streams.len());
        for (key, handler) in &self.streams {
            let queue = self.broker.subscribe(key, &self.group);
            keys.push(key.clone());
            for _ in 0..self.config.concurrency {
                tasks.push(tokio::spawn(Self::dispatch(
                    token.clone(),
                    queue.clone(),
                    handler.clone(),
                    diagnostics.clone(),
                )));
            }
        }

        let broker = self.broker.clone();
        let group = self.group.clone();
        let consumer_name = self.consumer_name.clone();
        Ok(tokio::spawn(async move {
            for task in tasks {
                let _ = task.await;
            }
            for key in &keys {
                broker.unsubscribe(key, &group);
            }
            tracing::debug!(%group, consumer = %consumer_name, "memory consumer stopped");
            drop(diagnostics);
        }))
    }

    fn take_errors(&mut self) -> Option<mpsc::Receiver<StreamError>> {
        self.errors.take()
    }

    fn take_infos(&mut self) -> Option<mpsc::Receiver<String>> {
        self.infos.take()
    }
}
