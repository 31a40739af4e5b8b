//! 持久化消费者（DurableConsumer）
//!
//! `start` 之后注册表冻结，读取/回收/工作任务共享同一个有界工作队列与同一个取消令牌。
//! 多个流汇入同一队列且由多个工作任务并发消费，因此完成顺序不做保证。
//!
use super::backend::{
    CURSOR_HISTORY_START, CURSOR_NEW, ClaimOutcome, PendingEntry, RANGE_MAX, RANGE_MIN,
    StreamBackend, StreamCursor,
};
use crate::broker::{
    Consumer, HandlerFn, StreamHandler, check_names, check_registration, invoke_handler,
};
use crate::diagnostics::Diagnostics;
use crate::error::{StreamError, StreamResult};
use crate::message::{StreamMessage, transpose_stream_id};
use crate::options::{ConsumerConfig, ConsumerOption, HandlerOption};
use async_trait::async_trait;
use bon::bon;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 工作队列容量
pub const QUEUE_CAPACITY: usize = 500;
/// 回收任务的检查间隔
pub const RECLAIM_INTERVAL: Duration = Duration::from_secs(10);

const READ_COUNT: usize = 100;
const READ_BLOCK: Duration = Duration::from_secs(5 * 60);
const READ_DELAYS: [Duration; 5] = [
    Duration::from_millis(1),
    Duration::from_secs(5),
    Duration::from_secs(15),
    Duration::from_secs(30),
    Duration::from_secs(60),
];
const PENDING_BASE_COUNT: usize = 16;
const PENDING_MAX_COUNT: usize = 1024;
const STALE_CONSUMER_AGE: Duration = Duration::from_secs(60 * 60);

type SharedQueue = Arc<Mutex<mpsc::Receiver<StreamMessage>>>;

pub struct DurableConsumer {
    backend: Arc<dyn StreamBackend>,
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

#[bon]
impl DurableConsumer {
    #[builder]
    pub fn new(
        backend: Arc<dyn StreamBackend>,
        #[builder(into, default)] namespace: String,
        #[builder(into)] group: String,
        #[builder(into)] consumer_name: String,
    ) -> StreamResult<Self> {
        check_names(&group, &consumer_name)?;

        let (diagnostics, receivers) = Diagnostics::new();

        Ok(Self {
            backend,
            namespace,
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
}

async fn create_groups<'a>(
    backend: &dyn StreamBackend,
    group: &str,
    keys: impl Iterator<Item = &'a String>,
) -> StreamResult<()> {
    for key in keys {
        backend.create_group(key, group).await?;
    }
    Ok(())
}

#[async_trait]
impl Consumer for DurableConsumer {
    fn register(
        &mut self,
        stream_id: &str,
        handler: HandlerFn,
        opts: &[HandlerOption],
    ) -> StreamResult<()> {
        check_registration(self.started, stream_id)?;

        // 只保留转换后的键，内部不再需要逻辑流 ID
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

        self.backend
            .ping()
            .await
            .map_err(|err| err.context("failed to ping stream backend"))?;

        create_groups(self.backend.as_ref(), &self.group, self.streams.keys()).await?;

        let Some(diagnostics) = self.diagnostics.take() else {
            return Err(StreamError::AlreadyStarted);
        };

        // 从这里开始不会再失败
        self.started = true;

        let runtime = Arc::new(Runtime {
            backend: self.backend.clone(),
            group: self.group.clone(),
            consumer_name: self.consumer_name.clone(),
            streams: self.streams.clone(),
            diagnostics,
        });

        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        let queue_rx: SharedQueue = Arc::new(Mutex::new(queue_rx));
        let mut tasks: Vec<JoinHandle<()>> = Vec::with_capacity(2 + self.config.concurrency);

        {
            let runtime = runtime.clone();
            let token = token.clone();
            let queue = queue_tx.clone();
            tasks.push(tokio::spawn(async move {
                runtime.remove_stale_consumers(STALE_CONSUMER_AGE).await;
                runtime.reader(token, queue).await;
            }));
        }

        tasks.push(tokio::spawn(runtime.clone().reclaimer(
            token.clone(),
            queue_tx,
            RECLAIM_INTERVAL,
        )));

        for _ in 0..self.config.concurrency {
            tasks.push(tokio::spawn(
                runtime.clone().worker(token.clone(), queue_rx.clone()),
            ));
        }

        tracing::info!(
            group = %self.group,
            consumer = %self.consumer_name,
            streams = self.streams.len(),
            concurrency = self.config.concurrency,
            "durable consumer started"
        );

        Ok(tokio::spawn(async move {
            for task in tasks {
                let _ = task.await;
            }
            tracing::info!(
                group = %runtime.group,
                consumer = %runtime.consumer_name,
                "durable consumer stopped"
            );
            // 最后一份 Runtime 在此释放，诊断通道随之关闭
            drop(runtime);
        }))
    }

    fn take_errors(&mut self) -> Option<mpsc::Receiver<StreamError>> {
        self.errors.take()
    }

    fn take_infos(&mut self) -> Option<mpsc::Receiver<String>> {
        self.infos.take()
    }
}

/// 启动后各任务共享的只读状态
struct Runtime {
    backend: Arc<dyn StreamBackend>,
    group: String,
    consumer_name: String,
    streams: HashMap<String, StreamHandler>,
    diagnostics: Diagnostics,
}

impl Runtime {
    /// 读取任务：先回放历史，再阻塞读取新消息，并推入工作队列
    ///
    /// 假设同一 (group, consumer) 同时只有一个进程在运行。
    async fn reader(self: Arc<Self>, token: CancellationToken, queue: mpsc::Sender<StreamMessage>) {
        let mut cursors: Vec<StreamCursor> = self
            .streams
            .keys()
            .map(|key| StreamCursor::new(key.clone(), CURSOR_HISTORY_START))
            .collect();
        let mut scan_history = true;
        let mut consecutive_failures = 0usize;

        loop {
            let delay = READ_DELAYS[consecutive_failures.min(READ_DELAYS.len() - 1)];
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            let read = tokio::select! {
                _ = token.cancelled() => return,
                r = self.backend.read_group(&self.group, &self.consumer_name, &cursors, READ_COUNT, READ_BLOCK) => r,
            };

            let batches = match read {
                Ok(batches) => batches,
                Err(StreamError::NoGroup { reason }) => {
                    match create_groups(self.backend.as_ref(), &self.group, self.streams.keys()).await {
                        Ok(()) => {
                            consecutive_failures = 0;
                            self.diagnostics.push_info(format!(
                                "re-created group for all streams where it got removed, original error: {reason}"
                            ));
                        }
                        Err(err) => {
                            consecutive_failures += 1;
                            self.diagnostics.push_error(
                                err.context("failed to re-create group for at least one stream"),
                            );
                        }
                    }
                    continue;
                }
                Err(err @ StreamError::Timeout { .. }) => {
                    consecutive_failures += 1;
                    self.diagnostics.push_error(err);
                    continue;
                }
                Err(err) => {
                    consecutive_failures += 1;
                    self.diagnostics.push_error(err.context(format_args!(
                        "failed to read streams (consecutive fails: {consecutive_failures})"
                    )));
                    continue;
                }
            };

            consecutive_failures = 0;

            if scan_history {
                scan_history = false;

                for batch in &batches {
                    let Some(last) = batch.messages.last() else {
                        continue;
                    };
                    if let Some(cursor) = cursors.iter_mut().find(|c| c.key == batch.key) {
                        scan_history = true;
                        cursor.cursor = last.id.clone();
                        self.diagnostics.push_info(format!(
                            "stream '{}' had {} more messages in the history (delivered but not yet acked), continuing scanning after '{}'",
                            batch.key,
                            batch.messages.len(),
                            cursor.cursor,
                        ));
                    }
                }

                if !scan_history {
                    self.diagnostics.push_info("completed scan of history");
                    for cursor in &mut cursors {
                        cursor.cursor = CURSOR_NEW.to_string();
                    }
                    continue;
                }
            }

            for batch in batches {
                for message in batch.messages {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        sent = queue.send(message) => {
                            if sent.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    /// 回收任务：周期检查空闲超时的投递，认领后重新入队或强制确认
    async fn reclaimer(
        self: Arc<Self>,
        token: CancellationToken,
        queue: mpsc::Sender<StreamMessage>,
        interval: Duration,
    ) {
        // 每个流的批次大小；空闲过滤发生在服务端，ID 较小的条目可能晚于较大的条目超时，
        // 因此每一轮都从最小 ID 开始扫描
        let mut batch_sizes: HashMap<String, usize> = HashMap::new();

        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(interval) => {}
            }

            for (key, handler) in &self.streams {
                let count = batch_sizes.entry(key.clone()).or_insert(PENDING_BASE_COUNT);

                let pending = match self
                    .backend
                    .pending(
                        key,
                        &self.group,
                        handler.config.idle_timeout,
                        RANGE_MIN,
                        RANGE_MAX,
                        *count,
                    )
                    .await
                {
                    Ok(pending) => pending,
                    Err(err) => {
                        self.diagnostics.push_error(err.context(format_args!(
                            "failed to fetch pending messages for stream '{key}'"
                        )));
                        continue;
                    }
                };

                // 批次被填满说明积压较多，下一轮拉取更多
                *count = if !pending.is_empty() && pending.len() == *count {
                    (*count * 2).min(PENDING_MAX_COUNT)
                } else {
                    PENDING_BASE_COUNT
                };

                for entry in pending {
                    if !self.reclaim(key, handler, entry, &token, &queue).await {
                        return;
                    }
                }
            }
        }
    }

    /// 处理单个空闲条目；返回 `false` 表示任务应当退出
    async fn reclaim(
        &self,
        key: &str,
        handler: &StreamHandler,
        entry: PendingEntry,
        token: &CancellationToken,
        queue: &mpsc::Sender<StreamMessage>,
    ) -> bool {
        // 投递计数在每次认领后增加，超过上限说明消息本身可能有问题
        if entry.delivery_count > handler.config.max_retries as u64 {
            match self.backend.ack(key, &self.group, &entry.id).await {
                Ok(()) => {
                    // 本次执行也被计为一次重试
                    let retries = entry.delivery_count.saturating_sub(1);
                    tracing::warn!(
                        stream = %key,
                        message_id = %entry.id,
                        retries,
                        "retries exhausted, message force acknowledged (discarded)"
                    );
                    self.diagnostics.push_error(StreamError::Discarded {
                        stream_id: key.to_string(),
                        message_id: entry.id,
                        retries,
                    });
                }
                Err(err) => self.diagnostics.push_error(StreamError::Ack {
                    stream_id: key.to_string(),
                    message_id: entry.id,
                    reason: format!(
                        "failed to force acknowledge (discard) after {} deliveries: {err}",
                        entry.delivery_count
                    ),
                }),
            }
            return true;
        }

        let claimed = self
            .backend
            .claim(
                key,
                &self.group,
                &self.consumer_name,
                handler.config.idle_timeout,
                &entry.id,
            )
            .await;

        match claimed {
            Ok(ClaimOutcome::Claimed(message)) => {
                tokio::select! {
                    _ = token.cancelled() => return false,
                    sent = queue.send(message) => return sent.is_ok(),
                }
            }
            Ok(ClaimOutcome::Evicted) => {
                // 消息已被长度上限裁剪，只能确认
                match self.backend.ack(key, &self.group, &entry.id).await {
                    Ok(()) => {
                        tracing::warn!(
                            stream = %key,
                            message_id = %entry.id,
                            "message evicted before redelivery, force acknowledged"
                        );
                        self.diagnostics.push_info(format!(
                            "acknowledged evicted message '{}' in stream '{key}'",
                            entry.id
                        ));
                    }
                    Err(err) => self.diagnostics.push_error(StreamError::Ack {
                        stream_id: key.to_string(),
                        message_id: entry.id,
                        reason: format!("failed to acknowledge evicted message: {err}"),
                    }),
                }
            }
            Ok(ClaimOutcome::Skipped) => {
                self.diagnostics.push_error(StreamError::backend(format!(
                    "no error when claiming message '{}' in stream '{key}', but no message was returned",
                    entry.id
                )));
            }
            Err(err) => {
                // 多个消费者同时认领同一条消息时，只有一个能成功
                self.diagnostics.push_error(err.context(format_args!(
                    "failed to claim message '{}' in stream '{key}'",
                    entry.id
                )));
            }
        }
        true
    }

    /// 工作任务：处理成功后确认，失败则保持未确认交给回收任务
    async fn worker(self: Arc<Self>, token: CancellationToken, queue: SharedQueue) {
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => return,
                m = async { queue.lock().await.recv().await } => m,
            };

            let Some(message) = message else {
                return;
            };

            let Some(handler) = self.streams.get(&message.stream_id) else {
                // 不确认：其他消费者也许能认领并处理
                self.diagnostics.push_error(StreamError::Unrouted {
                    stream_id: message.stream_id,
                    message_id: message.id,
                });
                continue;
            };

            let key = message.stream_id.clone();
            let id = message.id.clone();

            if let Err(err) = invoke_handler(&handler.handler, message).await {
                self.diagnostics.push_error(err);
                continue;
            }

            if let Err(err) = self.backend.ack(&key, &self.group, &id).await {
                self.diagnostics.push_error(StreamError::Ack {
                    stream_id: key,
                    message_id: id,
                    reason: err.to_string(),
                });
            }
        }
    }

    /// 移除空闲超过 `max_age` 且没有待确认消息的组成员
    async fn remove_stale_consumers(&self, max_age: Duration) {
        for key in self.streams.keys() {
            let consumers = match self.backend.consumers(key, &self.group).await {
                Ok(consumers) => consumers,
                Err(err) => {
                    self.diagnostics.push_error(
                        err.context(format_args!("failed to read consumers for stream '{key}'")),
                    );
                    continue;
                }
            };

            for consumer in consumers {
                if consumer.pending > 0 || consumer.idle < max_age {
                    continue;
                }

                match self
                    .backend
                    .delete_consumer(key, &self.group, &consumer.name)
                    .await
                {
                    Ok(()) => self.diagnostics.push_info(format!(
                        "removed stale consumer '{}' from group '{}' (idle {:?}) for stream '{key}'",
                        consumer.name, self.group, consumer.idle
                    )),
                    Err(err) => self.diagnostics.push_error(err.context(format_args!(
                        "failed to remove stale consumer '{}' from group '{}' (idle {:?}) for stream '{key}'",
                        consumer.name, self.group, consumer.idle
                    ))),
                }
            }
        }
    }
}
