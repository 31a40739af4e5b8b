//! 事件系统（System）
//!
//! 根据配置选择后端，对外只暴露 `reporter` 与 `reader_factory` 两个入口，
//! 调用方不会接触到任何后端类型。
//!
use crate::config::{Config, Mode};
use crate::error::{EventsError, EventsResult};
use crate::reader::Reader;
use crate::reader_factory::ReaderFactory;
use crate::reporter::GenericReporter;
#[cfg(feature = "redis")]
use relay_stream::durable::RedisBackend;
use relay_stream::durable::{DurableConsumer, DurableProducer, StreamBackend};
use relay_stream::memory::{DEFAULT_QUEUE_SIZE, MemoryBroker, MemoryConsumer, MemoryProducer};
use relay_stream::{Consumer, ConsumerFactory, Producer};
use std::sync::Arc;

#[derive(Clone)]
pub struct System {
    config: Config,
    producer: Arc<dyn Producer>,
    consumer_factory: ConsumerFactory,
}

impl System {
    /// 按 `config.mode` 构建
    pub async fn new(config: Config) -> EventsResult<Self> {
        config.validate()?;

        match config.mode {
            Mode::InMemory => Self::in_memory(config),
            #[cfg(feature = "redis")]
            Mode::Redis => {
                let client = redis::Client::open(config.redis_url.as_str())?;
                Self::redis(config, client).await
            }
            #[cfg(not(feature = "redis"))]
            Mode::Redis => Err(EventsError::invalid_config(
                "redis mode requires the `redis` feature",
            )),
        }
    }

    /// 进程内后端：不跨进程，失败的事件不会重投
    pub fn in_memory(config: Config) -> EventsResult<Self> {
        config.validate()?;

        let broker = MemoryBroker::new(DEFAULT_QUEUE_SIZE, config.max_stream_length)?;
        let producer = Arc::new(MemoryProducer::new(broker.clone(), config.namespace.clone()));

        let namespace = config.namespace.clone();
        let consumer_factory: ConsumerFactory = Arc::new(move |group: &str, name: &str| {
            let consumer = MemoryConsumer::new(broker.clone(), namespace.clone(), group, name)?;
            Ok(Box::new(consumer) as Box<dyn Consumer>)
        });

        tracing::info!(mode = %Mode::InMemory, namespace = %config.namespace, "event system ready");
        Ok(Self {
            config,
            producer,
            consumer_factory,
        })
    }

    /// 持久化后端：连接失败时立即返回错误
    #[cfg(feature = "redis")]
    pub async fn redis(config: Config, client: redis::Client) -> EventsResult<Self> {
        config.validate()?;

        let backend = RedisBackend::connect(client).await?;
        backend.ping().await?;
        Self::with_backend(config, Arc::new(backend))
    }

    /// 以任意持久化后端构建
    pub fn with_backend(config: Config, backend: Arc<dyn StreamBackend>) -> EventsResult<Self> {
        config.validate()?;

        let producer = Arc::new(
            DurableProducer::builder()
                .backend(backend.clone())
                .namespace(config.namespace.clone())
                .max_stream_length(config.max_stream_length)
                .approximate(config.approx_max_stream_length)
                .build(),
        );

        let namespace = config.namespace.clone();
        let consumer_factory: ConsumerFactory = Arc::new(move |group: &str, name: &str| {
            let consumer = DurableConsumer::builder()
                .backend(backend.clone())
                .namespace(namespace.clone())
                .group(group)
                .consumer_name(name)
                .build()?;
            Ok(Box::new(consumer) as Box<dyn Consumer>)
        });

        tracing::info!(
            mode = %Mode::Redis,
            namespace = %config.namespace,
            max_stream_length = config.max_stream_length,
            "event system ready"
        );
        Ok(Self {
            config,
            producer,
            consumer_factory,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// 某一类别的事件发送端
    pub fn reporter(&self, category: &str) -> EventsResult<GenericReporter> {
        check_category(category)?;
        Ok(GenericReporter::new(self.producer.clone(), category))
    }

    /// 某一类别的读取端工厂
    pub fn reader_factory<R: Reader>(&self, category: &str) -> EventsResult<ReaderFactory<R>> {
        check_category(category)?;
        Ok(ReaderFactory::new(category, self.consumer_factory.clone()))
    }
}

fn check_category(category: &str) -> EventsResult<()> {
    if category.is_empty() {
        return Err(EventsError::invalid_argument("category can't be empty"));
    }
    Ok(())
}
