//! 消息代理协议
//!
//! 定义生产者/消费者的统一抽象，进程内与持久化两种后端均实现该协议。
//!
use crate::error::{StreamError, StreamResult};
use crate::message::{StreamMessage, Values};
use crate::options::{ConsumerOption, HandlerConfig, HandlerOption};
use async_trait::async_trait;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 原始消息处理器：返回错误时消息保持未确认
pub type HandlerFn =
    Arc<dyn Fn(StreamMessage) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// 将异步闭包包装为 `HandlerFn`
pub fn handler<F, Fut>(f: F) -> HandlerFn
where
    F: Fn(StreamMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(move |message| Box::pin(f(message)))
}

/// 生产者：向流追加消息
#[async_trait]
pub trait Producer: Send + Sync {
    /// 追加一条消息并返回后端分配的消息 ID
    async fn send(&self, stream_id: &str, values: Values) -> StreamResult<String>;
}

/// 消费者：注册处理器并在启动后持续消费
#[async_trait]
pub trait Consumer: Send {
    /// 注册流处理器，仅允许在启动前调用
    fn register(
        &mut self,
        stream_id: &str,
        handler: HandlerFn,
        opts: &[HandlerOption],
    ) -> StreamResult<()>;

    /// 调整消费者配置，启动后调用无效
    fn configure(&mut self, opts: &[ConsumerOption]);

    /// 启动消费；返回的句柄在所有内部任务结束、诊断通道关闭后完成
    async fn start(&mut self, token: CancellationToken) -> StreamResult<JoinHandle<()>>;

    /// 取出错误诊断通道（仅能取出一次）
    fn take_errors(&mut self) -> Option<mpsc::Receiver<StreamError>>;

    /// 取出信息诊断通道（仅能取出一次）
    fn take_infos(&mut self) -> Option<mpsc::Receiver<String>>;
}

/// 按 (消费组, 消费者名) 构造消费者
pub type ConsumerFactory =
    Arc<dyn Fn(&str, &str) -> StreamResult<Box<dyn Consumer>> + Send + Sync>;

/// 已注册的流处理器及其最终配置
#[derive(Clone)]
pub(crate) struct StreamHandler {
    pub handler: HandlerFn,
    pub config: HandlerConfig,
}

/// 注册阶段的公共校验
pub(crate) fn check_registration(started: bool, stream_id: &str) -> StreamResult<()> {
    if started {
        return Err(StreamError::AlreadyStarted);
    }
    if stream_id.is_empty() {
        return Err(StreamError::invalid_argument("stream id can't be empty"));
    }
    Ok(())
}

pub(crate) fn check_names(group: &str, consumer_name: &str) -> StreamResult<()> {
    if group.is_empty() {
        return Err(StreamError::invalid_argument("group name can't be empty"));
    }
    if consumer_name.is_empty() {
        return Err(StreamError::invalid_argument("consumer name can't be empty"));
    }
    Ok(())
}

/// 在 panic 边界内调用处理器：panic 被转换为 `StreamError::Panic`，不会终止工作协程
pub(crate) async fn invoke_handler(handler: &HandlerFn, message: StreamMessage) -> StreamResult<()> {
    use futures_util::FutureExt;
    use std::panic::AssertUnwindSafe;

    let stream_id = message.stream_id.clone();
    let message_id = message.id.clone();

    // 处理器在构造 future 时同样可能 panic
    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(message))) {
        Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
        Err(panic) => Err(panic),
    };

    match outcome {
        Ok(Ok(())) => Ok(()),
        Ok(Err(err)) => Err(StreamError::Handler {
            stream_id,
            message_id,
            reason: format!("{err:#}"),
        }),
        Err(panic) => Err(StreamError::Panic {
            stream_id,
            message_id,
            reason: panic_message(panic.as_ref()),
        }),
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
