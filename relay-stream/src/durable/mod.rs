//! 持久化消息代理
//!
//! 基于消费组的可靠消费，`DurableConsumer` 在启动后运行三类任务：
//! - 读取任务（1 个）：先回放本消费者已投递未确认的历史，再阻塞等待新消息；
//! - 回收任务（1 个）：周期检查空闲超时的投递，认领重试或强制确认；
//! - 工作任务（N 个）：从共享队列取消息，调用处理器并在成功后确认。
//!
//! 消息生命周期：
//! `Produced → Delivered → {Acked | IdleExpired → Reclaimed → Delivered | RetriesExhausted → ForceAcked | Evicted → ForceAcked}`
//!
//! 存储侧通过 `StreamBackend` 抽象，提供 Redis Streams 实现与进程内仿真实现。
//!
pub mod backend;
mod consumer;
pub mod emulated;
mod producer;
#[cfg(feature = "redis")]
pub mod redis_backend;

pub use backend::{
    ClaimOutcome, ConsumerInfo, MaxLen, PendingEntry, StreamBackend, StreamBatch, StreamCursor,
};
pub use consumer::{DurableConsumer, QUEUE_CAPACITY, RECLAIM_INTERVAL};
pub use emulated::EmulatedBackend;
pub use producer::DurableProducer;
#[cfg(feature = "redis")]
pub use redis_backend::RedisBackend;
