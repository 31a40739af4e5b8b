//! 读取端工厂（ReaderFactory）
//!
//! `launch` 完成“构建消费者 → 调用方注册处理函数 → 启动 → 转发诊断日志”，
//! 返回可用于取消与等待的 `ReaderCanceler`。
//!
use crate::error::{EventsError, EventsResult};
use crate::reader::{GenericReader, Reader};
use relay_stream::{ConsumerFactory, StreamError};
use std::marker::PhantomData;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub struct ReaderFactory<R> {
    category: String,
    consumer_factory: ConsumerFactory,
    _reader: PhantomData<fn() -> R>,
}

impl<R> Clone for ReaderFactory<R> {
    fn clone(&self) -> Self {
        Self {
            category: self.category.clone(),
            consumer_factory: self.consumer_factory.clone(),
            _reader: PhantomData,
        }
    }
}

impl<R: Reader> ReaderFactory<R> {
    pub(crate) fn new(category: impl Into<String>, consumer_factory: ConsumerFactory) -> Self {
        Self {
            category: category.into(),
            consumer_factory,
            _reader: PhantomData,
        }
    }

    /// 启动一个读取端
    ///
    /// - `group`：消费组，同组的多个实例分摊同一批事件；
    /// - `reader_name`：组内实例名，重启时沿用同名可以回放未确认的历史；
    /// - `setup`：在启动前注册事件处理函数与配置。
    ///
    /// 取消 `parent` 或调用 `ReaderCanceler::cancel` 都会停止读取端。
    pub async fn launch<F>(
        &self,
        parent: &CancellationToken,
        group: &str,
        reader_name: &str,
        setup: F,
    ) -> EventsResult<ReaderCanceler>
    where
        F: FnOnce(&mut R) -> EventsResult<()>,
    {
        if group.is_empty() {
            return Err(EventsError::invalid_argument("group name can't be empty"));
        }
        if reader_name.is_empty() {
            return Err(EventsError::invalid_argument("reader name can't be empty"));
        }

        let mut consumer = (self.consumer_factory)(group, reader_name)?;
        let errors = consumer.take_errors();
        let infos = consumer.take_infos();

        let mut reader = R::from_generic(GenericReader::new(consumer, self.category.clone()));
        setup(&mut reader)?;
        let mut consumer = reader.into_generic().into_consumer();

        let token = parent.child_token();
        let consumer_task = consumer.start(token.clone()).await?;

        let mut tasks = vec![consumer_task];
        if let Some(errors) = errors {
            tasks.push(tokio::spawn(forward_errors(
                errors,
                group.to_string(),
                reader_name.to_string(),
            )));
        }
        if let Some(infos) = infos {
            tasks.push(tokio::spawn(forward_infos(
                infos,
                group.to_string(),
                reader_name.to_string(),
            )));
        }

        tracing::info!(category = %self.category, %group, reader = %reader_name, "reader launched");

        Ok(ReaderCanceler { token, tasks })
    }
}

async fn forward_errors(mut errors: mpsc::Receiver<StreamError>, group: String, reader: String) {
    while let Some(err) = errors.recv().await {
        if err.is_transient() {
            tracing::warn!(%group, %reader, error = %err, "reader backend error");
        } else {
            tracing::error!(%group, %reader, error = %err, "reader error");
        }
    }
}

async fn forward_infos(mut infos: mpsc::Receiver<String>, group: String, reader: String) {
    while let Some(info) = infos.recv().await {
        tracing::info!(%group, %reader, "{info}");
    }
}

/// 读取端运行句柄
///
/// 丢弃句柄不会停止读取端，需显式调用 `cancel` 或取消父令牌。
pub struct ReaderCanceler {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ReaderCanceler {
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 等待消费者任务与日志转发全部结束
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
    }
}
