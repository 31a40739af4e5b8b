//! 类型化事件层
//!
//! 在 `relay-stream` 之上提供：
//! - `Event<T>` 信封与二进制编解码；
//! - 按类别划分的 `GenericReporter`（发送）与 `ReaderFactory`（启动读取端）；
//! - `HandlerError::Discard`：确认并放弃当前事件，不再重试；
//! - `System`：按配置选择进程内或持久化后端。
//!
pub mod config;
pub mod error;
pub mod event;
pub mod reader;
pub mod reader_factory;
pub mod reporter;
pub mod system;

pub use config::{Config, Mode};
pub use error::{EventsError, EventsResult, HandlerError, HandlerResult};
pub use event::Event;
pub use reader::{GenericReader, Reader};
pub use reader_factory::{ReaderCanceler, ReaderFactory};
pub use reporter::GenericReporter;
pub use system::System;

pub use relay_stream::{ConsumerOption, HandlerOption};
