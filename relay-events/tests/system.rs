use anyhow::Result as AnyResult;
use relay_events::{
    Config, ConsumerOption, Event, EventsError, GenericReader, HandlerError, HandlerOption,
    Mode, Reader, System,
};
use relay_stream::durable::{EmulatedBackend, StreamBackend};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
struct OrderChanged {
    kind: String,
    id: u64,
}

fn created(id: u64) -> OrderChanged {
    OrderChanged {
        kind: "created".into(),
        id,
    }
}

fn durable(namespace: &str, backend: &Arc<EmulatedBackend>) -> AnyResult<System> {
    let config = Config::builder()
        .mode(Mode::Redis)
        .namespace(namespace)
        .max_stream_length(100)
        .build();
    Ok(System::with_backend(config, backend.clone() as Arc<dyn StreamBackend>)?)
}

fn retry_options(max_retries: usize) -> AnyResult<Vec<HandlerOption>> {
    Ok(vec![
        HandlerOption::idle_timeout(Duration::from_secs(5))?,
        HandlerOption::max_retries(max_retries)?,
    ])
}

async fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    tokio::time::timeout(Duration::from_secs(600), async {
        while !cond() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .is_ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn in_memory_events_reach_the_reader() -> AnyResult<()> {
    let system = System::new(Config::default()).await?;
    let received: Arc<Mutex<Vec<Event<OrderChanged>>>> = Arc::default();

    let token = CancellationToken::new();
    let canceler = {
        let received = received.clone();
        system
            .reader_factory::<GenericReader>("orders")?
            .launch(&token, "projections", "p1", move |r| {
                r.register_event("changed", move |event: Event<OrderChanged>| {
                    let received = received.clone();
                    async move {
                        received.lock().unwrap().push(event);
                        Ok(())
                    }
                }, &[])
            })
            .await?
    };

    let id = system.reporter("orders")?.send_event("changed", &created(42)).await?;

    assert!(wait_until(|| !received.lock().unwrap().is_empty()).await);
    let event = received.lock().unwrap()[0].clone();
    assert_eq!(event.payload, created(42));
    assert_eq!(event.id, id);

    canceler.cancel();
    canceler.join().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn handler_succeeds_after_two_failures() -> AnyResult<()> {
    let backend = Arc::new(EmulatedBackend::new());
    let system = durable("shop", &backend)?;
    let calls = Arc::new(AtomicUsize::new(0));

    let options = retry_options(2)?;
    let token = CancellationToken::new();
    let canceler = {
        let calls = calls.clone();
        system
            .reader_factory::<GenericReader>("orders")?
            .launch(&token, "billing", "b1", move |r| {
                r.configure(&[ConsumerOption::concurrency(1)?]);
                r.register_event("changed", move |event: Event<OrderChanged>| {
                    let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                    async move {
                        assert_eq!(event.payload, created(42));
                        if n < 3 {
                            return Err(anyhow::anyhow!("attempt {n} failed").into());
                        }
                        Ok(())
                    }
                }, &options)
            })
            .await?
    };

    system.reporter("orders")?.send_event("changed", &created(42)).await?;

    assert!(wait_until(|| {
        calls.load(Ordering::SeqCst) == 3 && backend.pending_count("shop:orders:changed", "billing") == 0
    })
    .await);
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    canceler.cancel();
    canceler.join().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn discarded_event_is_acknowledged_once() -> AnyResult<()> {
    let backend = Arc::new(EmulatedBackend::new());
    let system = durable("shop", &backend)?;
    let calls = Arc::new(AtomicUsize::new(0));

    let options = retry_options(5)?;
    let token = CancellationToken::new();
    let canceler = {
        let calls = calls.clone();
        system
            .reader_factory::<GenericReader>("orders")?
            .launch(&token, "billing", "b1", move |r| {
                r.register_event("changed", move |_event: Event<OrderChanged>| {
                    calls.fetch_add(1, Ordering::SeqCst);
                    async move { Err(HandlerError::discard(anyhow::anyhow!("unknown order kind"))) }
                }, &options)
            })
            .await?
    };

    system.reporter("orders")?.send_event("changed", &created(7)).await?;

    assert!(wait_until(|| calls.load(Ordering::SeqCst) == 1).await);
    assert!(wait_until(|| backend.pending_count("shop:orders:changed", "billing") == 0).await);
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    canceler.cancel();
    canceler.join().await;
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn namespaces_do_not_share_streams() -> AnyResult<()> {
    let backend = Arc::new(EmulatedBackend::new());
    let tenant_a = durable("a", &backend)?;
    let tenant_b = durable("b", &backend)?;
    let seen_a = Arc::new(AtomicUsize::new(0));
    let seen_b = Arc::new(AtomicUsize::new(0));

    let token = CancellationToken::new();
    for (system, seen) in [(&tenant_a, &seen_a), (&tenant_b, &seen_b)] {
        let seen = seen.clone();
        system
            .reader_factory::<GenericReader>("orders")?
            .launch(&token, "g", "c", move |r| {
                r.register_event("changed", move |_event: Event<OrderChanged>| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    async move { Ok(()) }
                }, &[])
            })
            .await?;
    }

    tenant_a.reporter("orders")?.send_event("changed", &created(1)).await?;
    tenant_a.reporter("orders")?.send_event("changed", &created(2)).await?;

    assert!(wait_until(|| seen_a.load(Ordering::SeqCst) == 2).await);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(seen_b.load(Ordering::SeqCst), 0);
    assert_eq!(backend.len("a:orders:changed").await?, 2);
    assert_eq!(backend.len("b:orders:changed").await?, 0);

    token.cancel();
    Ok(())
}

/// 自定义读取端：只关心订单创建事件
struct OrderReader {
    inner: GenericReader,
    created: Arc<AtomicUsize>,
}

impl Reader for OrderReader {
    fn from_generic(reader: GenericReader) -> Self {
        Self {
            inner: reader,
            created: Arc::default(),
        }
    }

    fn into_generic(self) -> GenericReader {
        self.inner
    }
}

impl OrderReader {
    fn on_created(&mut self) -> relay_events::EventsResult<Arc<AtomicUsize>> {
        let created = self.created.clone();
        self.inner.register_event("changed", move |event: Event<OrderChanged>| {
            let created = created.clone();
            async move {
                if event.payload.kind == "created" {
                    created.fetch_add(1, Ordering::SeqCst);
                }
                Ok(())
            }
        }, &[])?;
        Ok(self.created.clone())
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn custom_reader_wraps_generic_reader() -> AnyResult<()> {
    let system = System::in_memory(Config::builder().namespace("custom").build())?;
    let token = CancellationToken::new();

    let mut counter = None;
    let canceler = system
        .reader_factory::<OrderReader>("orders")?
        .launch(&token, "g", "c", |r| {
            assert_eq!(r.inner.category(), "orders");
            counter = Some(r.on_created()?);
            Ok(())
        })
        .await?;
    let counter = counter.expect("setup ran");

    let reporter = system.reporter("orders")?;
    reporter.send_event("changed", &created(1)).await?;
    reporter
        .send_event("changed", &OrderChanged { kind: "cancelled".into(), id: 1 })
        .await?;

    assert!(wait_until(|| counter.load(Ordering::SeqCst) == 1).await);

    // 父令牌取消同样会停止读取端
    token.cancel();
    canceler.join().await;
    Ok(())
}

#[tokio::test]
async fn launch_rejects_misuse() -> AnyResult<()> {
    let system = System::in_memory(Config::default())?;
    let factory = system.reader_factory::<GenericReader>("orders")?;
    let token = CancellationToken::new();

    let err = factory.launch(&token, "", "c", |_| Ok(())).await.err();
    assert!(matches!(err, Some(EventsError::InvalidArgument { .. })));

    let err = factory.launch(&token, "g", "", |_| Ok(())).await.err();
    assert!(matches!(err, Some(EventsError::InvalidArgument { .. })));

    // 没有注册任何事件时无法启动
    assert!(factory.launch(&token, "g", "c", |_| Ok(())).await.is_err());

    let err = factory
        .launch(&token, "g", "c", |r| {
            r.register_event("changed", |_e: Event<OrderChanged>| async move { Ok(()) }, &[])?;
            r.register_event("changed", |_e: Event<OrderChanged>| async move { Ok(()) }, &[])
        })
        .await
        .err();
    assert!(matches!(err, Some(EventsError::Stream(_))));

    assert!(system.reporter("").is_err());
    assert!(system.reporter("orders")?.send_event("", &created(1)).await.is_err());
    Ok(())
}

#[tokio::test]
async fn invalid_config_fails_fast() {
    let config = Config::builder().max_stream_length(0).build();
    assert!(matches!(
        System::new(config.clone()).await.err(),
        Some(EventsError::InvalidConfig { .. })
    ));
    assert!(System::in_memory(config.clone()).is_err());
    assert!(
        System::with_backend(config, Arc::new(EmulatedBackend::new()) as Arc<dyn StreamBackend>)
            .is_err()
    );
}
