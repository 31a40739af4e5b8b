//! 进程内消息代理
//!
//! 每个流是容量受限的追加序列，投递即时且只有一次：没有重投、没有回收。
//! 仅作为测试与本地开发的简化替身，可靠性保证弱于持久化后端。
//!
mod broker;
mod consumer;
mod producer;

pub use broker::{DEFAULT_QUEUE_SIZE, MemoryBroker};
pub use consumer::MemoryConsumer;
pub use producer::MemoryProducer;
