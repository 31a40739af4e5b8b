//! 可靠事件流基础库（relay-stream）
//!
//! 提供持久、有序、多消费者的消息流抽象与两种后端实现：
//! - `broker`：生产者/消费者协议，处理器签名与消费者工厂；
//! - `options`：消费者与处理器的函数式配置（并发、空闲超时、最大重试）；
//! - `diagnostics`：有界、非阻塞的错误/信息诊断通道；
//! - `memory`：纯进程内的环形缓冲流，面向测试与本地开发；
//! - `durable`：基于消费组的持久流（读取、回收、工作池与生产者），
//!   通过 `StreamBackend` 对接 Redis Streams 或进程内仿真。
//!
//! 投递语义为“至少一次”：处理失败的消息保持未确认，由回收器在空闲超时后
//! 重新认领；超过最大重试次数或已被裁剪出流的消息会被强制确认并告警。
//!
pub mod broker;
pub mod diagnostics;
pub mod durable;
pub mod error;
pub mod memory;
pub mod message;
pub mod options;

pub use broker::{Consumer, ConsumerFactory, HandlerFn, Producer, handler};
pub use error::{StreamError, StreamResult};
pub use message::{FieldValue, StreamMessage, Values, transpose_stream_id};
pub use options::{ConsumerConfig, ConsumerOption, HandlerConfig, HandlerOption};
